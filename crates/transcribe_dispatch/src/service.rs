use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autoscaler::{Autoscaler, CapacityPlan, FleetObservation};
use crate::batch::Batcher;
use crate::config::DispatchConfig;
use crate::cost;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::inference::InferenceBackend;
use crate::metrics::DispatchMetrics;
use crate::provision::WorkerEvent;
use crate::queue::AdmissionQueue;
use crate::request::{Priority, QueuedRequest, Request, RequestId, RequestLedger, RequestOutcome, RequestRecord};
use crate::worker::{FleetProfile, FleetRegistry, WorkerState};

/// One admission call from the gateway.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
	pub audio_uri: String,
	pub audio_secs: f64,
	pub priority: Priority,
	pub deadline_in: std::time::Duration,
}

/// Successful admission: the id for polling plus the future that resolves
/// at terminal status.
#[derive(Debug)]
pub struct SubmitReceipt {
	pub id: RequestId,
	pub outcome: oneshot::Receiver<RequestOutcome>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServiceHealth {
	pub queue_depth: usize,
	pub inflight_batches: usize,
	pub ready_workers: usize,
}

/// Owns every dispatch component and runs the control loop that ties them
/// together. Collaborators stay outside: the provisioner watches
/// `capacity_plan()` and reports through `worker_events()`; the inference
/// backend is injected at construction.
pub struct DispatchService {
	config: DispatchConfig,
	fleet: Arc<FleetProfile>,
	queue: Arc<AdmissionQueue>,
	ledger: Arc<RequestLedger>,
	registry: Arc<FleetRegistry>,
	metrics: Arc<DispatchMetrics>,
	dispatcher: Arc<Dispatcher>,
	batcher: Batcher,
	autoscaler: Mutex<Autoscaler>,
	plan_rx: watch::Receiver<CapacityPlan>,
	events_tx: mpsc::UnboundedSender<WorkerEvent>,
	events_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
}

impl DispatchService {
	pub fn new(config: DispatchConfig, backend: Arc<dyn InferenceBackend>) -> Result<Arc<Self>> {
		let fleet = config.load_fleet()?;
		Self::with_fleet(config, fleet, backend)
	}

	pub fn with_fleet(config: DispatchConfig, fleet: FleetProfile, backend: Arc<dyn InferenceBackend>) -> Result<Arc<Self>> {
		config.validate()?;
		fleet.validate()?;

		let fleet = Arc::new(fleet);
		let metrics = Arc::new(DispatchMetrics::new()?);
		let queue = Arc::new(AdmissionQueue::new(config.queue_capacity, config.batch_trigger_depth));
		let ledger = Arc::new(RequestLedger::new());
		let registry = Arc::new(FleetRegistry::new());
		let dispatcher = Dispatcher::new(
			Arc::clone(&queue),
			Arc::clone(&ledger),
			Arc::clone(&registry),
			backend,
			Arc::clone(&metrics),
			Arc::clone(&fleet),
			config.max_retries,
		);
		let batcher = Batcher::new((*fleet).clone(), config.max_batch_items);
		let autoscaler = Autoscaler::new((*fleet).clone(), &config);
		let plan_rx = autoscaler.subscribe();
		let (events_tx, events_rx) = mpsc::unbounded_channel();

		Ok(Arc::new(Self {
			config,
			fleet,
			queue,
			ledger,
			registry,
			metrics,
			dispatcher,
			batcher,
			autoscaler: Mutex::new(autoscaler),
			plan_rx,
			events_tx,
			events_rx: Mutex::new(Some(events_rx)),
		}))
	}

	/// Synchronous accept/reject. Accepted requests get a receipt whose
	/// `outcome` future resolves at terminal status.
	pub async fn submit(&self, submission: SubmitRequest) -> Result<SubmitReceipt> {
		if submission.audio_uri.is_empty() {
			return Err(DispatchError::InvalidRequest("audio_uri must not be empty".into()));
		}
		if !(submission.audio_secs > 0.0) || !submission.audio_secs.is_finite() {
			return Err(DispatchError::InvalidRequest("audio_secs must be positive".into()));
		}

		let request = Request::new(submission.audio_uri, submission.audio_secs, submission.priority, submission.deadline_in);
		let id = request.id;
		// Record first so a status poll can never miss an admitted request.
		self.ledger.admit(&request).await;
		let (entry, outcome) = QueuedRequest::new(request);

		match self.queue.enqueue(entry, Instant::now()).await {
			Ok(depth) => {
				self.metrics.on_admitted(depth);
				debug!(request = %id, depth, "request admitted");
				Ok(SubmitReceipt { id, outcome })
			}
			Err((_entry, reason)) => {
				self.ledger.forget(id).await;
				self.metrics.on_rejected(reason.as_label());
				debug!(request = %id, reason = reason.as_label(), "request rejected");
				Err(DispatchError::AdmissionRejected(reason))
			}
		}
	}

	pub async fn status(&self, id: RequestId) -> Option<RequestRecord> {
		self.ledger.get(id).await
	}

	pub async fn health(&self) -> ServiceHealth {
		let mut ready_workers = 0;
		for profile in &self.fleet.classes {
			ready_workers += self.registry.count(profile.class(), WorkerState::Ready).await;
		}
		ServiceHealth {
			queue_depth: self.queue.depth().await.total,
			inflight_batches: self.dispatcher.inflight_batches().await,
			ready_workers,
		}
	}

	/// The declarative fleet target, for the provisioning collaborator.
	pub fn capacity_plan(&self) -> watch::Receiver<CapacityPlan> {
		self.plan_rx.clone()
	}

	/// Lifecycle report channel handed to the provisioning collaborator.
	pub fn worker_events(&self) -> mpsc::UnboundedSender<WorkerEvent> {
		self.events_tx.clone()
	}

	pub fn export_metrics(&self) -> Result<String> {
		self.metrics.export()
	}

	/// The control loop: batch formation on the window tick or the eager
	/// depth signal, sweeps and scaling on the control tick, worker
	/// lifecycle events as they arrive. Runs until cancelled.
	pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
		let Some(mut events) = self.events_rx.lock().await.take() else {
			return Err(DispatchError::ChannelClosed("worker event receiver already claimed"));
		};

		let mut batch_tick = interval(self.config.batch_window);
		batch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut control_tick = interval(self.config.control_tick);
		control_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

		info!(
			queue_capacity = self.config.queue_capacity,
			classes = self.fleet.classes.len(),
			batch_window = ?self.config.batch_window,
			control_tick = ?self.config.control_tick,
			"dispatch service running"
		);

		loop {
			tokio::select! {
				_ = batch_tick.tick() => self.batch_pass().await,
				() = self.queue.batch_signal().notified() => self.batch_pass().await,
				_ = control_tick.tick() => self.control_pass().await,
				Some(event) = events.recv() => self.apply_event(event).await,
				() = cancel.cancelled() => break,
			}
		}

		info!("dispatch service stopped");
		Ok(())
	}

	async fn batch_pass(self: &Arc<Self>) {
		let batches = self.batcher.form(&self.queue, &self.registry, Instant::now()).await;
		if !batches.is_empty() {
			self.dispatcher.dispatch(batches).await;
		}
	}

	async fn control_pass(self: &Arc<Self>) {
		let now = Instant::now();

		let expired = self.queue.sweep_expired(now).await;
		if !expired.is_empty() {
			self.metrics.on_expired(expired.len());
			for entry in expired {
				self.ledger.resolve(entry, RequestOutcome::Expired).await;
			}
		}

		for id in self.registry.stale(self.config.heartbeat_timeout, now).await {
			self.dispatcher.lose_worker(id, "heartbeat timeout").await;
		}

		let swept = self.ledger.sweep_terminal(self.config.result_ttl).await;
		if swept > 0 {
			debug!(swept, "dropped stale terminal results");
		}

		let observation = FleetObservation {
			backlog: self.queue.backlog(&self.fleet).await,
			classes: self.registry.observe(&self.fleet).await,
			min_headroom: self.queue.min_headroom(now).await,
		};
		let plan = self.autoscaler.lock().await.evaluate(&observation, now);

		self.metrics.set_queue_depth(self.queue.depth().await.total);
		self.metrics.set_backlog_seconds(observation.backlog.values().map(|s| s.audio_secs).sum());
		let tick_secs = self.config.control_tick.as_secs_f64();
		for profile in &self.fleet.classes {
			let class = profile.class();
			let obs = observation.classes.get(&class).copied().unwrap_or_default();
			self.metrics.set_class_gauges(class, obs.ready, plan.desired_for(class), obs.utilization);
			let billable = obs.ready + obs.draining;
			if billable > 0 {
				self.metrics.add_lease_cost(class, cost::lease_cost(&profile.descriptor, tick_secs * f64::from(billable)));
			}
		}
	}

	async fn apply_event(self: &Arc<Self>, event: WorkerEvent) {
		match event {
			WorkerEvent::CapacityDegraded { class, available } => {
				warn!(%class, available, "provider reported degraded capacity");
				self.autoscaler.lock().await.set_degraded(class, true);
			}
			WorkerEvent::Ready { id } => {
				self.dispatcher.handle_event(WorkerEvent::Ready { id }).await;
				if let Some(worker) = self.registry.get(id).await {
					self.autoscaler.lock().await.set_degraded(worker.class, false);
				}
				// fresh capacity; place queued work without waiting a tick
				self.batch_pass().await;
			}
			other => self.dispatcher.handle_event(other).await,
		}
	}
}
