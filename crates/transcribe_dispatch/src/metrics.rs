use prometheus::{CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::error::Result;
use crate::worker::WorkerClass;

/// Reasons a request went back to the queue, as metric labels.
pub const REQUEUE_BACKPRESSURE: &str = "backpressure";
pub const REQUEUE_RETRY: &str = "retry";
pub const REQUEUE_PREEMPTION: &str = "preemption";
pub const REQUEUE_WORKER_LOST: &str = "worker_lost";

/// Every counter, gauge and histogram the dispatcher exposes, registered
/// on one registry so the gateway can export them in a single scrape.
pub struct DispatchMetrics {
	registry: Registry,

	queue_depth: IntGauge,
	backlog_seconds: Gauge,

	admitted: IntCounter,
	rejected: IntCounterVec,
	completed: IntCounter,
	failed: IntCounter,
	expired: IntCounter,
	requeued: IntCounterVec,
	batches_formed: IntCounter,

	workers_ready: IntGaugeVec,
	workers_desired: IntGaugeVec,
	class_utilization: GaugeVec,

	request_latency: HistogramVec,
	lease_cost: CounterVec,
}

impl DispatchMetrics {
	pub fn new() -> Result<Self> {
		let registry = Registry::new();

		let queue_depth = IntGauge::new("dispatch_queue_depth", "Requests currently queued")?;
		let backlog_seconds = Gauge::new("dispatch_backlog_audio_seconds", "Total audio seconds currently queued")?;
		let admitted = IntCounter::new("dispatch_requests_admitted_total", "Requests accepted into the queue")?;
		let rejected = IntCounterVec::new(Opts::new("dispatch_requests_rejected_total", "Requests refused at admission"), &["reason"])?;
		let completed = IntCounter::new("dispatch_requests_completed_total", "Requests that produced a transcript")?;
		let failed = IntCounter::new("dispatch_requests_failed_total", "Requests that terminated as failed")?;
		let expired = IntCounter::new("dispatch_requests_expired_total", "Requests that missed their deadline")?;
		let requeued = IntCounterVec::new(Opts::new("dispatch_requests_requeued_total", "Requests returned to the queue"), &["reason"])?;
		let batches_formed = IntCounter::new("dispatch_batches_formed_total", "Batches handed to the dispatcher")?;
		let workers_ready = IntGaugeVec::new(Opts::new("dispatch_workers_ready", "Ready workers per class"), &["class"])?;
		let workers_desired = IntGaugeVec::new(Opts::new("dispatch_workers_desired", "Planned workers per class"), &["class"])?;
		let class_utilization = GaugeVec::new(Opts::new("dispatch_class_utilization", "Mean slot utilization per class"), &["class"])?;
		let request_latency = HistogramVec::new(
			HistogramOpts::new("dispatch_request_latency_seconds", "Admission-to-transcript latency").buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
			&["class"],
		)?;
		let lease_cost = CounterVec::new(Opts::new("dispatch_lease_cost_dollars_total", "Accrued worker lease cost"), &["class"])?;

		registry.register(Box::new(queue_depth.clone()))?;
		registry.register(Box::new(backlog_seconds.clone()))?;
		registry.register(Box::new(admitted.clone()))?;
		registry.register(Box::new(rejected.clone()))?;
		registry.register(Box::new(completed.clone()))?;
		registry.register(Box::new(failed.clone()))?;
		registry.register(Box::new(expired.clone()))?;
		registry.register(Box::new(requeued.clone()))?;
		registry.register(Box::new(batches_formed.clone()))?;
		registry.register(Box::new(workers_ready.clone()))?;
		registry.register(Box::new(workers_desired.clone()))?;
		registry.register(Box::new(class_utilization.clone()))?;
		registry.register(Box::new(request_latency.clone()))?;
		registry.register(Box::new(lease_cost.clone()))?;

		Ok(Self {
			registry,
			queue_depth,
			backlog_seconds,
			admitted,
			rejected,
			completed,
			failed,
			expired,
			requeued,
			batches_formed,
			workers_ready,
			workers_desired,
			class_utilization,
			request_latency,
			lease_cost,
		})
	}

	pub fn on_admitted(&self, depth: usize) {
		self.admitted.inc();
		self.set_queue_depth(depth);
	}

	pub fn on_rejected(&self, reason: &str) {
		self.rejected.with_label_values(&[reason]).inc();
	}

	pub fn on_completed(&self, class: WorkerClass, latency_secs: f64) {
		self.completed.inc();
		self.request_latency.with_label_values(&[class.as_str()]).observe(latency_secs);
	}

	pub fn on_failed(&self) {
		self.failed.inc();
	}

	pub fn on_expired(&self, count: usize) {
		self.expired.inc_by(count as u64);
	}

	pub fn on_requeued(&self, reason: &str, count: usize) {
		self.requeued.with_label_values(&[reason]).inc_by(count as u64);
	}

	pub fn on_batch_formed(&self) {
		self.batches_formed.inc();
	}

	pub fn set_queue_depth(&self, depth: usize) {
		// queue capacity is far below i64::MAX
		#[allow(clippy::cast_possible_wrap)]
		self.queue_depth.set(depth as i64);
	}

	pub fn set_backlog_seconds(&self, audio_secs: f64) {
		self.backlog_seconds.set(audio_secs);
	}

	pub fn set_class_gauges(&self, class: WorkerClass, ready: u32, desired: u32, utilization: f64) {
		self.workers_ready.with_label_values(&[class.as_str()]).set(i64::from(ready));
		self.workers_desired.with_label_values(&[class.as_str()]).set(i64::from(desired));
		self.class_utilization.with_label_values(&[class.as_str()]).set(utilization);
	}

	pub fn add_lease_cost(&self, class: WorkerClass, dollars: f64) {
		self.lease_cost.with_label_values(&[class.as_str()]).inc_by(dollars);
	}

	/// Text exposition of every registered metric.
	pub fn export(&self) -> Result<String> {
		let mut buffer = Vec::new();
		TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
		Ok(String::from_utf8_lossy(&buffer).into_owned())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn metrics_register_and_export() {
		let metrics = DispatchMetrics::new().unwrap();
		metrics.on_admitted(3);
		metrics.on_rejected("queue_full");
		metrics.on_completed(WorkerClass::GpuSpot, 1.2);
		metrics.on_requeued(REQUEUE_PREEMPTION, 4);
		metrics.set_class_gauges(WorkerClass::GpuSpot, 2, 5, 0.4);
		metrics.add_lease_cost(WorkerClass::GpuSpot, 0.02);

		let text = metrics.export().unwrap();
		assert!(text.contains("dispatch_queue_depth 3"));
		assert!(text.contains("dispatch_requests_admitted_total 1"));
		assert!(text.contains("dispatch_requests_requeued_total{reason=\"preemption\"} 4"));
		assert!(text.contains("dispatch_workers_desired{class=\"gpu_spot\"} 5"));
	}

	#[test]
	fn duplicate_registration_is_an_error() {
		let metrics = DispatchMetrics::new().unwrap();
		let dup = IntGauge::new("dispatch_queue_depth", "Requests currently queued").unwrap();
		assert!(metrics.registry.register(Box::new(dup)).is_err());
	}
}
