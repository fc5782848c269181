use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::queue::AdmissionQueue;
use crate::request::{QueuedRequest, RequestId};
use crate::worker::{FleetProfile, FleetRegistry, WorkerClass};

pub type BatchId = Uuid;

/// A group of requests bound for one worker class. Lives from formation
/// until every member reaches a terminal status, then is dropped.
#[derive(Debug)]
pub struct Batch {
	pub id: BatchId,
	pub target_class: WorkerClass,
	pub requests: Vec<QueuedRequest>,
	pub created_at: Instant,
}

impl Batch {
	pub fn new(target_class: WorkerClass, requests: Vec<QueuedRequest>) -> Self {
		Self {
			id: Uuid::new_v4(),
			target_class,
			requests,
			created_at: Instant::now(),
		}
	}

	pub fn audio_secs(&self) -> f64 {
		self.requests.iter().map(|entry| entry.request.audio_secs).sum()
	}

	pub fn len(&self) -> usize {
		self.requests.len()
	}

	pub fn is_empty(&self) -> bool {
		self.requests.is_empty()
	}
}

/// Forms batches from the queue against currently spare capacity.
///
/// Classes are visited cheapest first; each free execution slot takes at
/// most one batch per pass. Requests too long for every class ride alone
/// on the largest-capacity class rather than being dropped.
pub struct Batcher {
	fleet: FleetProfile,
	max_items: usize,
}

impl Batcher {
	pub fn new(fleet: FleetProfile, max_items: usize) -> Self {
		Self { fleet, max_items }
	}

	pub async fn form(&self, queue: &AdmissionQueue, registry: &FleetRegistry, now: Instant) -> Vec<Batch> {
		let largest = self.fleet.largest_capacity().class();
		let mut out = Vec::new();

		for profile in self.fleet.by_cost() {
			let mut slots = registry.free_slots(profile).await;
			while slots > 0 {
				let allow_oversize = profile.class() == largest;
				let picked = queue.peek_batchable(profile, self.max_items, allow_oversize, now).await;
				if picked.is_empty() {
					break;
				}
				let ids: Vec<RequestId> = picked.iter().map(|p| p.id).collect();
				let removed = queue.remove(&ids).await;
				if removed.is_empty() {
					break;
				}

				let batch = Batch::new(profile.class(), removed);
				debug!(
					batch = %batch.id,
					class = %batch.target_class,
					requests = batch.len(),
					audio_secs = batch.audio_secs(),
					"formed batch"
				);
				out.push(batch);
				slots -= 1;
			}
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::request::{Priority, Request};
	use crate::worker::{WorkerClass, WorkerId};
	use std::time::Duration;

	fn entry(audio_secs: f64) -> QueuedRequest {
		let request = Request::new("s3://audio/clip.wav", audio_secs, Priority::Normal, Duration::from_secs(60));
		QueuedRequest::new(request).0
	}

	async fn ready_worker(registry: &FleetRegistry, class: WorkerClass) -> WorkerId {
		let id = WorkerId::new_v4();
		registry.upsert_provisioning(id, class).await;
		registry.mark_ready(id).await;
		id
	}

	async fn fill(queue: &AdmissionQueue, entries: Vec<QueuedRequest>) {
		let now = Instant::now();
		for e in entries {
			queue.enqueue(e, now).await.unwrap();
		}
	}

	#[tokio::test]
	async fn batches_respect_class_capacity() {
		let fleet = FleetProfile::default();
		let batcher = Batcher::new(fleet, 16);
		let queue = AdmissionQueue::new(100, 1000);
		let registry = FleetRegistry::new();
		ready_worker(&registry, WorkerClass::GpuSpot).await;

		// Six 100s clips against a 300s batch budget: two batches of three.
		fill(&queue, (0..6).map(|_| entry(100.0)).collect()).await;
		let batches = batcher.form(&queue, &registry, Instant::now()).await;

		assert_eq!(batches.len(), 2);
		for batch in &batches {
			assert!(batch.audio_secs() <= 300.0 + 1e-9);
			assert_eq!(batch.target_class, WorkerClass::GpuSpot);
		}
		assert_eq!(queue.depth().await.total, 0);
	}

	#[tokio::test]
	async fn cheapest_class_with_capacity_wins() {
		let fleet = FleetProfile::default();
		let batcher = Batcher::new(fleet, 16);
		let queue = AdmissionQueue::new(100, 1000);
		let registry = FleetRegistry::new();
		ready_worker(&registry, WorkerClass::Cpu).await;
		ready_worker(&registry, WorkerClass::GpuOnDemand).await;

		fill(&queue, vec![entry(60.0), entry(60.0)]).await;
		let batches = batcher.form(&queue, &registry, Instant::now()).await;

		assert_eq!(batches.len(), 1);
		assert_eq!(batches[0].target_class, WorkerClass::Cpu);
		assert_eq!(batches[0].len(), 2);
	}

	#[tokio::test]
	async fn oversized_request_rides_alone_on_largest_class() {
		let fleet = FleetProfile::default();
		let batcher = Batcher::new(fleet, 16);
		let queue = AdmissionQueue::new(100, 1000);
		let registry = FleetRegistry::new();
		ready_worker(&registry, WorkerClass::Managed).await;

		// 700s exceeds even the managed 600s budget; it must still ship.
		fill(&queue, vec![entry(700.0)]).await;
		let batches = batcher.form(&queue, &registry, Instant::now()).await;

		assert_eq!(batches.len(), 1);
		assert_eq!(batches[0].target_class, WorkerClass::Managed);
		assert_eq!(batches[0].len(), 1);
		assert!(batches[0].audio_secs() > 600.0);
	}

	#[tokio::test]
	async fn no_ready_workers_leaves_queue_untouched() {
		let fleet = FleetProfile::default();
		let batcher = Batcher::new(fleet, 16);
		let queue = AdmissionQueue::new(100, 1000);
		let registry = FleetRegistry::new();

		fill(&queue, vec![entry(60.0), entry(60.0)]).await;
		let batches = batcher.form(&queue, &registry, Instant::now()).await;

		assert!(batches.is_empty());
		assert_eq!(queue.depth().await.total, 2);
	}

	#[tokio::test]
	async fn one_batch_per_free_slot_per_pass() {
		let fleet = FleetProfile::default();
		let batcher = Batcher::new(fleet, 1);
		let queue = AdmissionQueue::new(100, 1000);
		let registry = FleetRegistry::new();
		// One gpu_spot worker exposes five slots.
		ready_worker(&registry, WorkerClass::GpuSpot).await;

		fill(&queue, (0..8).map(|_| entry(10.0)).collect()).await;
		let batches = batcher.form(&queue, &registry, Instant::now()).await;

		assert_eq!(batches.len(), 5);
		assert!(batches.iter().all(|b| b.len() == 1));
		assert_eq!(queue.depth().await.total, 3);
	}

	#[tokio::test]
	async fn mixed_deadline_tolerances_split_into_separate_batches() {
		let fleet = FleetProfile::default();
		let batcher = Batcher::new(fleet, 4);
		let queue = AdmissionQueue::new(100, 1000);
		let registry = FleetRegistry::new();
		ready_worker(&registry, WorkerClass::GpuSpot).await;

		// Two urgent clips and two relaxed ones: the tolerance band keeps
		// them out of each other's batches.
		let tight = |audio| {
			let request = Request::new("s3://audio/clip.wav", audio, Priority::Normal, Duration::from_secs(6));
			QueuedRequest::new(request).0
		};
		fill(&queue, vec![tight(10.0), tight(20.0), entry(30.0), entry(40.0)]).await;

		let batches = batcher.form(&queue, &registry, Instant::now()).await;
		assert_eq!(batches.len(), 2);
		assert_eq!(batches[0].audio_secs(), 30.0);
		assert_eq!(batches[1].audio_secs(), 70.0);
		assert_eq!(queue.depth().await.total, 0);
	}

	#[tokio::test]
	async fn burst_of_a_thousand_leaves_the_overflow_queued() {
		let fleet = FleetProfile::default();
		let batcher = Batcher::new(fleet, 1);
		let queue = AdmissionQueue::new(1000, 2000);
		let registry = FleetRegistry::new();
		// A single five-slot worker against a thousand simultaneous arrivals.
		ready_worker(&registry, WorkerClass::GpuSpot).await;

		fill(&queue, (0..1000).map(|_| entry(10.0)).collect()).await;
		let batches = batcher.form(&queue, &registry, Instant::now()).await;

		assert_eq!(batches.len(), 5);
		assert_eq!(queue.depth().await.total, 995);
	}
}
