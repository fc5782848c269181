use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{Batch, BatchId};
use crate::cost;
use crate::inference::InferenceBackend;
use crate::metrics::{DispatchMetrics, REQUEUE_BACKPRESSURE, REQUEUE_PREEMPTION, REQUEUE_RETRY, REQUEUE_WORKER_LOST};
use crate::provision::WorkerEvent;
use crate::queue::AdmissionQueue;
use crate::request::{QueuedRequest, RequestLedger, RequestOutcome, RequestStatus};
use crate::worker::{FleetProfile, FleetRegistry, WorkerClass, WorkerDescriptor, WorkerId};

/// Bookkeeping for one batch handed to a worker. The progress counter and
/// the lost flag are shared with the running task so drain decisions and
/// requeue labels stay accurate without locking the task itself.
struct InflightBatch {
	worker: WorkerId,
	class: WorkerClass,
	jobs: usize,
	completed: Arc<AtomicUsize>,
	lost: Arc<AtomicBool>,
	cancel: CancellationToken,
}

/// Hands formed batches to workers and owns every in-flight inference
/// task. Requests leave here only through the ledger (terminal) or back
/// through the queue (requeue); nothing is dropped on the floor.
pub struct Dispatcher {
	queue: Arc<AdmissionQueue>,
	ledger: Arc<RequestLedger>,
	registry: Arc<FleetRegistry>,
	backend: Arc<dyn InferenceBackend>,
	metrics: Arc<DispatchMetrics>,
	fleet: Arc<FleetProfile>,
	max_retries: u32,
	inflight: Mutex<HashMap<BatchId, InflightBatch>>,
}

impl Dispatcher {
	pub fn new(
		queue: Arc<AdmissionQueue>,
		ledger: Arc<RequestLedger>,
		registry: Arc<FleetRegistry>,
		backend: Arc<dyn InferenceBackend>,
		metrics: Arc<DispatchMetrics>,
		fleet: Arc<FleetProfile>,
		max_retries: u32,
	) -> Arc<Self> {
		Arc::new(Self {
			queue,
			ledger,
			registry,
			backend,
			metrics,
			fleet,
			max_retries,
			inflight: Mutex::new(HashMap::new()),
		})
	}

	/// Assign each batch to a worker of its target class. A batch that
	/// finds no slot goes back to the queue as pure back-pressure, with
	/// no retry count charged.
	pub async fn dispatch(self: &Arc<Self>, batches: Vec<Batch>) {
		for batch in batches {
			for entry in &batch.requests {
				self.ledger.mark(entry.request.id, RequestStatus::Batched).await;
			}
			let Some(profile) = self.fleet.get(batch.target_class) else {
				warn!(class = %batch.target_class, "batch for class missing from the fleet profile");
				self.requeue(batch.requests, REQUEUE_BACKPRESSURE).await;
				continue;
			};
			let descriptor = profile.descriptor.clone();
			match self.registry.reserve_slot(profile).await {
				Some((worker_id, worker_token)) => {
					self.metrics.on_batch_formed();
					self.launch(batch, descriptor, worker_id, worker_token).await;
				}
				None => {
					debug!(class = %batch.target_class, jobs = batch.len(), "no assignable worker; batch returns to queue");
					self.requeue(batch.requests, REQUEUE_BACKPRESSURE).await;
				}
			}
		}
	}

	async fn launch(self: &Arc<Self>, batch: Batch, descriptor: WorkerDescriptor, worker_id: WorkerId, worker_token: CancellationToken) {
		let cancel = worker_token.child_token();
		let completed = Arc::new(AtomicUsize::new(0));
		let lost = Arc::new(AtomicBool::new(false));

		for entry in &batch.requests {
			self.ledger.mark(entry.request.id, RequestStatus::Dispatched).await;
		}
		debug!(
			batch = %batch.id,
			worker = %worker_id,
			class = %batch.target_class,
			jobs = batch.len(),
			audio_secs = batch.audio_secs(),
			"dispatching batch"
		);

		self.inflight.lock().await.insert(
			batch.id,
			InflightBatch {
				worker: worker_id,
				class: batch.target_class,
				jobs: batch.len(),
				completed: Arc::clone(&completed),
				lost: Arc::clone(&lost),
				cancel: cancel.clone(),
			},
		);

		let this = Arc::clone(self);
		tokio::spawn(async move {
			this.run_batch(batch, descriptor, worker_id, cancel, completed, lost).await;
		});
	}

	/// Sequentially run a batch on its worker slot. Each request gets a
	/// deadline re-check before inference starts; cancellation hands every
	/// unfinished request back to the queue.
	async fn run_batch(
		self: Arc<Self>,
		batch: Batch,
		descriptor: WorkerDescriptor,
		worker_id: WorkerId,
		cancel: CancellationToken,
		completed: Arc<AtomicUsize>,
		lost: Arc<AtomicBool>,
	) {
		let batch_id = batch.id;
		let class = batch.target_class;

		let mut retry = Vec::new();
		let mut orphans = Vec::new();

		for mut entry in batch.requests {
			if cancel.is_cancelled() {
				orphans.push(entry);
				continue;
			}
			if entry.request.is_expired(Instant::now()) {
				self.metrics.on_expired(1);
				self.ledger.resolve(entry, RequestOutcome::Expired).await;
				continue;
			}

			tokio::select! {
				() = cancel.cancelled() => {
					orphans.push(entry);
				}
				result = self.backend.infer(&entry.request, &descriptor) => match result {
					Ok(transcript) => {
						completed.fetch_add(1, Ordering::Relaxed);
						self.metrics.on_completed(class, entry.request.queue_latency().as_secs_f64());
						self
							.ledger
							.resolve(
								entry,
								RequestOutcome::Completed {
									text: transcript.text,
									elapsed: transcript.elapsed,
								},
							)
							.await;
					}
					Err(err) => {
						entry.request.attempts += 1;
						if entry.request.attempts > self.max_retries {
							warn!(request = %entry.request.id, attempts = entry.request.attempts, error = %err, "retries exhausted");
							self.metrics.on_failed();
							self.ledger.resolve(entry, RequestOutcome::Failed { error: err.to_string() }).await;
						} else {
							debug!(request = %entry.request.id, attempts = entry.request.attempts, error = %err, "inference failed; requeueing");
							retry.push(entry);
						}
					}
				}
			}
		}

		// Unfinished work charges one attempt but never fails terminally
		// here; losing a worker is not the request's fault.
		if !orphans.is_empty() {
			let reason = if lost.load(Ordering::Relaxed) { REQUEUE_WORKER_LOST } else { REQUEUE_PREEMPTION };
			for entry in &mut orphans {
				entry.request.attempts += 1;
			}
			info!(batch = %batch_id, count = orphans.len(), reason, "returning unfinished requests to the queue");
			self.requeue(orphans, reason).await;
		}
		if !retry.is_empty() {
			self.requeue(retry, REQUEUE_RETRY).await;
		}

		self.registry.release_slot(worker_id).await;
		self.inflight.lock().await.remove(&batch_id);
	}

	/// Put entries back on the queue, updating the ledger as they go.
	/// Entries past deadline by now resolve `Expired` instead.
	async fn requeue(&self, entries: Vec<QueuedRequest>, reason: &'static str) {
		if entries.is_empty() {
			return;
		}
		let count = entries.len();
		for entry in &entries {
			self.ledger.mark_attempts(entry.request.id, entry.request.attempts).await;
			self.ledger.mark(entry.request.id, RequestStatus::Queued).await;
		}
		let expired = self.queue.reinsert(entries, Instant::now()).await;
		let requeued = count - expired.len();
		if requeued > 0 {
			self.metrics.on_requeued(reason, requeued);
		}
		if !expired.is_empty() {
			self.metrics.on_expired(expired.len());
			for entry in expired {
				self.ledger.resolve(entry, RequestOutcome::Expired).await;
			}
		}
	}

	/// Interruption notice. Batches whose estimated remaining service time
	/// fits inside the grace window run to completion; the rest are
	/// cancelled now so their requests can land somewhere else in time.
	pub async fn drain_worker(&self, id: WorkerId, deadline: Instant) {
		let inflight = self.inflight.lock().await;
		let now = Instant::now();
		for (batch_id, info) in inflight.iter().filter(|(_, i)| i.worker == id) {
			let Some(profile) = self.fleet.get(info.class) else { continue };
			let remaining = info.jobs.saturating_sub(info.completed.load(Ordering::Relaxed));
			let estimate = cost::service_secs(&profile.descriptor, remaining);
			if now + Duration::from_secs_f64(estimate) <= deadline {
				debug!(batch = %batch_id, remaining, estimate_secs = estimate, "batch fits inside the interruption grace; letting it finish");
			} else {
				info!(batch = %batch_id, remaining, estimate_secs = estimate, "cancelling batch ahead of interruption");
				info.cancel.cancel();
			}
		}
	}

	/// The worker is gone. Cancel everything it was running; the batch
	/// tasks requeue their unfinished requests under the worker-lost label.
	pub async fn lose_worker(&self, id: WorkerId, reason: &str) {
		{
			let inflight = self.inflight.lock().await;
			for info in inflight.values().filter(|i| i.worker == id) {
				info.lost.store(true, Ordering::Relaxed);
			}
		}
		if let Some(worker) = self.registry.remove(id).await {
			warn!(worker = %id, class = %worker.class, reason, age_secs = worker.age(Instant::now()).as_secs(), "worker lost");
			worker.cancel.cancel();
		}
	}

	/// Apply one worker lifecycle report.
	pub async fn handle_event(self: &Arc<Self>, event: WorkerEvent) {
		match event {
			WorkerEvent::Provisioning { id, class } => {
				debug!(worker = %id, %class, "worker provisioning");
				self.registry.upsert_provisioning(id, class).await;
			}
			WorkerEvent::Ready { id } => {
				if self.registry.mark_ready(id).await {
					info!(worker = %id, "worker ready");
				}
			}
			WorkerEvent::Heartbeat { id } => {
				self.registry.heartbeat(id, Instant::now()).await;
			}
			WorkerEvent::Interrupted { id, deadline } => {
				info!(worker = %id, "interruption notice; draining");
				self.registry.begin_drain(id, Some(deadline)).await;
				self.drain_worker(id, deadline).await;
			}
			WorkerEvent::Terminated { id } => {
				self.lose_worker(id, "terminated by provider").await;
			}
			// capacity shortfalls concern the autoscaler, not assignment
			WorkerEvent::CapacityDegraded { .. } => {}
		}
	}

	pub async fn inflight_batches(&self) -> usize {
		self.inflight.lock().await.len()
	}
}
