use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::autoscaler::CapacityPlan;
use crate::worker::{WorkerClass, WorkerId};

/// Worker lifecycle reports flowing from the provisioning collaborator
/// into the dispatch loop. The dispatcher never calls the provider; it
/// only reacts to these.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
	Provisioning { id: WorkerId, class: WorkerClass },
	Ready { id: WorkerId },
	Heartbeat { id: WorkerId },
	Interrupted { id: WorkerId, deadline: Instant },
	Terminated { id: WorkerId },
	CapacityDegraded { class: WorkerClass, available: u32 },
}

/// The provisioning collaborator: watches the capacity plan and reports
/// lifecycle transitions back. Implementations reconcile asynchronously;
/// the dispatch loop never waits on them.
#[async_trait]
pub trait Provisioner: Send + Sync {
	async fn run(&self, plan_rx: watch::Receiver<CapacityPlan>, events: mpsc::UnboundedSender<WorkerEvent>, cancel: CancellationToken);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimState {
	Starting,
	Up,
	Draining,
}

#[derive(Debug, Clone, Copy)]
struct SimWorker {
	class: WorkerClass,
	state: SimState,
	started: Instant,
}

/// In-process provisioner: brings workers up after a configurable delay,
/// drains before terminating on scale-down, and supports injected spot
/// interruptions and per-class capacity ceilings for degraded-provider
/// behavior. Lets the whole service run with no cloud account.
pub struct SimProvisioner {
	provision_delay: Duration,
	heartbeat_every: Duration,
	drain_grace: Duration,
	ceilings: HashMap<WorkerClass, u32>,
	world: Arc<Mutex<HashMap<WorkerId, SimWorker>>>,
	interrupt_tx: mpsc::UnboundedSender<WorkerId>,
	interrupt_rx: Mutex<Option<mpsc::UnboundedReceiver<WorkerId>>>,
}

impl SimProvisioner {
	pub fn new(provision_delay: Duration, heartbeat_every: Duration, drain_grace: Duration) -> Self {
		let (interrupt_tx, interrupt_rx) = mpsc::unbounded_channel();
		Self {
			provision_delay,
			heartbeat_every,
			drain_grace,
			ceilings: HashMap::new(),
			world: Arc::new(Mutex::new(HashMap::new())),
			interrupt_tx,
			interrupt_rx: Mutex::new(Some(interrupt_rx)),
		}
	}

	/// Cap how many instances of a class this provider can actually
	/// deliver, regardless of what the plan asks for.
	#[must_use]
	pub fn with_ceiling(mut self, class: WorkerClass, limit: u32) -> Self {
		self.ceilings.insert(class, limit);
		self
	}

	/// Handle for injecting a spot reclaim against a running worker.
	pub fn interruptions(&self) -> mpsc::UnboundedSender<WorkerId> {
		self.interrupt_tx.clone()
	}

	/// Ids of workers currently up for a class.
	pub async fn running(&self, class: WorkerClass) -> Vec<WorkerId> {
		self
			.world
			.lock()
			.await
			.iter()
			.filter(|(_, w)| w.class == class && w.state == SimState::Up)
			.map(|(id, _)| *id)
			.collect()
	}

	async fn reconcile(&self, plan: &CapacityPlan, events: &mpsc::UnboundedSender<WorkerEvent>, cancel: &CancellationToken) {
		debug!(revision = plan.revision, "reconciling capacity plan");
		for (&class, &desired) in &plan.desired {
			let capped = self.ceilings.get(&class).map_or(desired, |&limit| desired.min(limit));
			if capped < desired {
				warn!(%class, desired, available = capped, "provider cannot satisfy plan");
				let _ = events.send(WorkerEvent::CapacityDegraded { class, available: capped });
			}

			let mut world = self.world.lock().await;
			let live: Vec<WorkerId> = world
				.iter()
				.filter(|(_, w)| w.class == class && w.state != SimState::Draining)
				.map(|(id, _)| *id)
				.collect();

			if (live.len() as u32) < capped {
				let missing = capped - live.len() as u32;
				for _ in 0..missing {
					let id = Uuid::new_v4();
					world.insert(
						id,
						SimWorker {
							class,
							state: SimState::Starting,
							started: Instant::now(),
						},
					);
					let _ = events.send(WorkerEvent::Provisioning { id, class });
					self.spawn_boot(id, events.clone(), cancel.clone());
				}
			} else if (live.len() as u32) > capped {
				// newest first, so long-lived instances survive
				let excess = live.len() - capped as usize;
				let mut victims = live;
				victims.sort_by_key(|id| world.get(id).map(|w| w.started));
				victims.reverse();
				victims.truncate(excess);
				for id in victims {
					self.begin_drain(&mut world, id, events);
				}
			}
		}
	}

	fn spawn_boot(&self, id: WorkerId, events: mpsc::UnboundedSender<WorkerEvent>, cancel: CancellationToken) {
		let world = Arc::clone(&self.world);
		let delay = self.provision_delay;
		tokio::spawn(async move {
			tokio::select! {
				() = tokio::time::sleep(delay) => {}
				() = cancel.cancelled() => return,
			}
			let mut world = world.lock().await;
			if let Some(w) = world.get_mut(&id) {
				if w.state == SimState::Starting {
					w.state = SimState::Up;
					let _ = events.send(WorkerEvent::Ready { id });
				}
			}
		});
	}

	fn begin_drain(&self, world: &mut HashMap<WorkerId, SimWorker>, id: WorkerId, events: &mpsc::UnboundedSender<WorkerEvent>) {
		let Some(w) = world.get_mut(&id) else { return };
		if w.state == SimState::Draining {
			return;
		}
		let deadline = Instant::now() + self.drain_grace;
		w.state = SimState::Draining;
		info!(worker = %id, class = %w.class, "draining worker");
		let _ = events.send(WorkerEvent::Interrupted { id, deadline });

		let world = Arc::clone(&self.world);
		let grace = self.drain_grace;
		let events = events.clone();
		tokio::spawn(async move {
			tokio::time::sleep(grace).await;
			world.lock().await.remove(&id);
			let _ = events.send(WorkerEvent::Terminated { id });
		});
	}
}

#[async_trait]
impl Provisioner for SimProvisioner {
	async fn run(&self, mut plan_rx: watch::Receiver<CapacityPlan>, events: mpsc::UnboundedSender<WorkerEvent>, cancel: CancellationToken) {
		let Some(mut interrupt_rx) = self.interrupt_rx.lock().await.take() else {
			warn!("provisioner started twice; ignoring second run");
			return;
		};
		let mut heartbeat = interval(self.heartbeat_every);

		// bring the fleet to the initial plan before waiting for changes
		let initial = plan_rx.borrow_and_update().clone();
		self.reconcile(&initial, &events, &cancel).await;

		loop {
			tokio::select! {
				changed = plan_rx.changed() => {
					if changed.is_err() {
						break;
					}
					let plan = plan_rx.borrow_and_update().clone();
					self.reconcile(&plan, &events, &cancel).await;
				}
				_ = heartbeat.tick() => {
					{
						let world = self.world.lock().await;
						for (&id, w) in world.iter() {
							if matches!(w.state, SimState::Up | SimState::Draining) {
								let _ = events.send(WorkerEvent::Heartbeat { id });
							}
						}
					}
					// periodic reconcile so lost workers get replaced even
					// when the plan itself has not moved
					let plan = plan_rx.borrow().clone();
					self.reconcile(&plan, &events, &cancel).await;
				}
				Some(id) = interrupt_rx.recv() => {
					let mut world = self.world.lock().await;
					self.begin_drain(&mut world, id, &events);
				}
				() = cancel.cancelled() => break,
			}
		}
		info!("provisioner stopped");
	}
}
