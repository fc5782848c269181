use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::cost;
use crate::queue::BacklogStat;
use crate::worker::{ClassObservation, FleetProfile, WorkerClass};

/// Declarative fleet target. Single writer (the autoscaler), single
/// reader (the provisioner), published over a watch channel so the
/// reader always reconciles against the latest revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityPlan {
	pub revision: u64,
	pub desired: HashMap<WorkerClass, u32>,
}

impl CapacityPlan {
	pub fn initial(fleet: &FleetProfile) -> Self {
		Self {
			revision: 0,
			desired: fleet.classes.iter().map(|p| (p.class(), p.min_instances)).collect(),
		}
	}

	pub fn desired_for(&self, class: WorkerClass) -> u32 {
		self.desired.get(&class).copied().unwrap_or(0)
	}
}

/// Everything the autoscaler looks at in one tick: queued demand per
/// class, fleet state per class, and the tightest deadline in the queue.
#[derive(Debug, Clone, Default)]
pub struct FleetObservation {
	pub backlog: HashMap<WorkerClass, BacklogStat>,
	pub classes: HashMap<WorkerClass, ClassObservation>,
	pub min_headroom: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default)]
struct ClassScaleState {
	last_scale: Option<Instant>,
	low_ticks: u32,
}

/// Observe-and-decide scaling loop body. Never blocks on provisioning:
/// it only publishes the plan and relies on lifecycle events to learn
/// what actually materialized.
pub struct Autoscaler {
	fleet: FleetProfile,
	scale_up_threshold: f64,
	scale_down_threshold: f64,
	scale_down_ticks: u32,
	scale_step: u32,
	cooldown: Duration,
	control_tick: Duration,

	desired: HashMap<WorkerClass, u32>,
	states: HashMap<WorkerClass, ClassScaleState>,
	degraded: HashSet<WorkerClass>,
	revision: u64,
	plan_tx: watch::Sender<CapacityPlan>,
}

impl Autoscaler {
	pub fn new(fleet: FleetProfile, config: &DispatchConfig) -> Self {
		let initial = CapacityPlan::initial(&fleet);
		let (plan_tx, _) = watch::channel(initial.clone());
		Self {
			scale_up_threshold: config.scale_up_threshold,
			scale_down_threshold: config.scale_down_threshold,
			scale_down_ticks: config.scale_down_ticks,
			scale_step: config.scale_step,
			cooldown: config.cooldown,
			control_tick: config.control_tick,
			desired: initial.desired,
			states: fleet.classes.iter().map(|p| (p.class(), ClassScaleState::default())).collect(),
			degraded: HashSet::new(),
			revision: 0,
			plan_tx,
			fleet,
		}
	}

	pub fn subscribe(&self) -> watch::Receiver<CapacityPlan> {
		self.plan_tx.subscribe()
	}

	pub fn desired_for(&self, class: WorkerClass) -> u32 {
		self.desired.get(&class).copied().unwrap_or(0)
	}

	/// Record a provisioning shortfall (or recovery) for a class. A
	/// degraded class keeps its current target and its queued demand is
	/// offered to the next class up the cost order instead.
	pub fn set_degraded(&mut self, class: WorkerClass, degraded: bool) {
		if degraded {
			if self.degraded.insert(class) {
				warn!(%class, "class capacity degraded; substituting up the cost order");
			}
		} else if self.degraded.remove(&class) {
			info!(%class, "class capacity recovered");
		}
	}

	pub fn is_degraded(&self, class: WorkerClass) -> bool {
		self.degraded.contains(&class)
	}

	/// One control tick: walk classes cheapest first, let each absorb the
	/// demand it can clear inside the deadline budget, escalate the rest,
	/// then apply thresholds, cooldown and instance bounds per class.
	pub fn evaluate(&mut self, obs: &FleetObservation, now: Instant) -> CapacityPlan {
		let ordered: Vec<_> = self.fleet.by_cost().into_iter().cloned().collect();
		let mut carry_jobs = 0usize;
		let mut changed = false;

		for profile in &ordered {
			let class = profile.class();
			let own = obs.backlog.get(&class).copied().unwrap_or_default();
			let mut demand = own.jobs + carry_jobs;
			carry_jobs = 0;

			if self.degraded.contains(&class) {
				carry_jobs = demand;
				continue;
			}

			// Cap what this class keeps by what it could clear before the
			// tightest queued deadline, at full permitted growth.
			if let (Some(headroom), true) = (obs.min_headroom, demand > 0) {
				let slots = f64::from(profile.max_instances) * f64::from(profile.descriptor.max_concurrency);
				let clear_secs = cost::service_secs(&profile.descriptor, demand) / slots.max(1.0);
				if clear_secs > headroom.as_secs_f64() {
					let fits = (headroom.as_secs_f64() * slots / cost::seconds_per_job(&profile.descriptor)).floor() as usize;
					let keep = fits.min(demand);
					carry_jobs = demand - keep;
					demand = keep;
					debug!(%class, keep, escalated = carry_jobs, "deadline budget splits demand across classes");
				}
			}

			let class_obs = obs.classes.get(&class).copied().unwrap_or_default();
			let current = self.desired_for(class);
			let per_tick = cost::jobs_per_interval(&profile.descriptor, self.control_tick).max(f64::EPSILON);
			let needed = (demand as f64 / per_tick).ceil() as u32;
			let utilization = class_obs.utilization;

			let state = self.states.entry(class).or_default();
			let cooldown_over = state.last_scale.map_or(true, |t| now.duration_since(t) >= self.cooldown);

			let wants_up = needed > current || (utilization > self.scale_up_threshold && current < profile.max_instances);
			let wants_down = !wants_up && needed < current && utilization < self.scale_down_threshold;

			if wants_up {
				// Growth is never held back by the cooldown; the cooldown
				// only stops a shrink from chasing a recent grow.
				state.low_ticks = 0;
				let target = needed
					.max(current.saturating_add(1))
					.min(current.saturating_add(self.scale_step))
					.clamp(profile.min_instances, profile.max_instances);
				if target > current {
					info!(%class, from = current, to = target, backlog_jobs = demand, utilization, "scaling up");
					self.desired.insert(class, target);
					state.last_scale = Some(now);
					changed = true;
				}
			} else if wants_down {
				state.low_ticks += 1;
				if state.low_ticks >= self.scale_down_ticks && cooldown_over {
					// one instance per decision, never below what running
					// jobs occupy
					let busy_floor = class_obs.active_jobs.div_ceil(profile.descriptor.max_concurrency);
					let target = current.saturating_sub(1).max(busy_floor).clamp(profile.min_instances, profile.max_instances);
					if target < current {
						info!(%class, from = current, to = target, utilization, "scaling down");
						self.desired.insert(class, target);
						state.last_scale = Some(now);
						state.low_ticks = 0;
						changed = true;
					}
				}
			} else {
				state.low_ticks = 0;
			}
		}

		if carry_jobs > 0 {
			warn!(unabsorbed_jobs = carry_jobs, "backlog exceeds deadline-feasible capacity across all classes");
		}

		if changed {
			self.revision += 1;
		}
		let plan = CapacityPlan {
			revision: self.revision,
			desired: self.desired.clone(),
		};
		if changed {
			self.plan_tx.send_replace(plan.clone());
		}
		plan
	}
}
