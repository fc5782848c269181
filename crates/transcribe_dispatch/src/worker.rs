use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{DispatchError, Result};

pub type WorkerId = Uuid;

/// The worker substrate a request can land on. Tagged variants over one
/// descriptor shape; adding a class is a new variant plus profile entry,
/// not a new type hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerClass {
	Cpu,
	GpuOnDemand,
	GpuSpot,
	Managed,
}

impl WorkerClass {
	pub const ALL: [Self; 4] = [Self::Cpu, Self::GpuOnDemand, Self::GpuSpot, Self::Managed];

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Cpu => "cpu",
			Self::GpuOnDemand => "gpu_on_demand",
			Self::GpuSpot => "gpu_spot",
			Self::Managed => "managed",
		}
	}
}

impl fmt::Display for WorkerClass {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Static capability sheet for one worker class, loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDescriptor {
	pub class: WorkerClass,
	pub v_cpu: u32,
	pub memory_gb: u32,
	pub gpu_count: u32,

	/// Sustained jobs per hour for one execution slot.
	pub throughput_per_hour: f64,

	pub cost_per_hour: f64,

	/// Whether the provider may reclaim this worker with short notice.
	pub preemptible: bool,

	/// Concurrent batches one worker of this class can run.
	pub max_concurrency: u32,
}

impl WorkerDescriptor {
	pub fn validate(&self) -> Result<()> {
		if !(self.throughput_per_hour > 0.0) || !self.throughput_per_hour.is_finite() {
			return Err(DispatchError::InvalidProfile(format!("{}: throughput_per_hour must be positive", self.class)));
		}
		if !(self.cost_per_hour >= 0.0) || !self.cost_per_hour.is_finite() {
			return Err(DispatchError::InvalidProfile(format!("{}: cost_per_hour must be non-negative", self.class)));
		}
		if self.max_concurrency == 0 {
			return Err(DispatchError::InvalidProfile(format!("{}: max_concurrency must be at least 1", self.class)));
		}
		Ok(())
	}
}

/// Per-class configuration: the descriptor plus the knobs the autoscaler
/// and batcher need for that class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassProfile {
	pub descriptor: WorkerDescriptor,
	pub min_instances: u32,
	pub max_instances: u32,

	/// Cumulative audio seconds one batch for this class may carry.
	pub max_batch_secs: f64,
}

impl ClassProfile {
	pub fn class(&self) -> WorkerClass {
		self.descriptor.class
	}

	pub fn validate(&self) -> Result<()> {
		self.descriptor.validate()?;
		if self.min_instances > self.max_instances {
			return Err(DispatchError::InvalidProfile(format!(
				"{}: min_instances {} exceeds max_instances {}",
				self.class(),
				self.min_instances,
				self.max_instances
			)));
		}
		if !(self.max_batch_secs > 0.0) || !self.max_batch_secs.is_finite() {
			return Err(DispatchError::InvalidProfile(format!("{}: max_batch_secs must be positive", self.class())));
		}
		Ok(())
	}
}

/// The full fleet configuration: one profile per worker class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetProfile {
	pub classes: Vec<ClassProfile>,
}

impl FleetProfile {
	pub fn load(path: &Path) -> Result<Self> {
		let raw = std::fs::read_to_string(path)?;
		let profile: Self = serde_json::from_str(&raw)?;
		profile.validate()?;
		Ok(profile)
	}

	pub fn validate(&self) -> Result<()> {
		if self.classes.is_empty() {
			return Err(DispatchError::InvalidProfile("fleet profile has no classes".into()));
		}
		let mut seen = Vec::with_capacity(self.classes.len());
		for profile in &self.classes {
			profile.validate()?;
			if seen.contains(&profile.class()) {
				return Err(DispatchError::InvalidProfile(format!("duplicate class {}", profile.class())));
			}
			seen.push(profile.class());
		}
		Ok(())
	}

	pub fn get(&self, class: WorkerClass) -> Option<&ClassProfile> {
		self.classes.iter().find(|p| p.class() == class)
	}

	/// Profiles ordered cheapest hourly rate first. Drives both batch
	/// routing and the autoscaler's substitution cascade.
	pub fn by_cost(&self) -> Vec<&ClassProfile> {
		let mut ordered: Vec<&ClassProfile> = self.classes.iter().collect();
		ordered.sort_by(|a, b| {
			a.descriptor
				.cost_per_hour
				.partial_cmp(&b.descriptor.cost_per_hour)
				.unwrap_or(std::cmp::Ordering::Equal)
		});
		ordered
	}

	/// The class that accepts the longest single batch. Oversized requests
	/// fall through to it.
	pub fn largest_capacity(&self) -> &ClassProfile {
		// validate() guarantees at least one class
		self
			.classes
			.iter()
			.max_by(|a, b| a.max_batch_secs.partial_cmp(&b.max_batch_secs).unwrap_or(std::cmp::Ordering::Equal))
			.unwrap_or(&self.classes[0])
	}
}

impl Default for FleetProfile {
	fn default() -> Self {
		Self {
			classes: vec![
				ClassProfile {
					descriptor: WorkerDescriptor {
						class: WorkerClass::Cpu,
						v_cpu: 8,
						memory_gb: 16,
						gpu_count: 0,
						throughput_per_hour: 90.0,
						cost_per_hour: 0.34,
						preemptible: false,
						max_concurrency: 2,
					},
					min_instances: 1,
					max_instances: 40,
					max_batch_secs: 120.0,
				},
				ClassProfile {
					descriptor: WorkerDescriptor {
						class: WorkerClass::GpuOnDemand,
						v_cpu: 8,
						memory_gb: 32,
						gpu_count: 1,
						throughput_per_hour: 900.0,
						cost_per_hour: 1.21,
						preemptible: false,
						max_concurrency: 5,
					},
					min_instances: 0,
					max_instances: 16,
					max_batch_secs: 300.0,
				},
				ClassProfile {
					descriptor: WorkerDescriptor {
						class: WorkerClass::GpuSpot,
						v_cpu: 8,
						memory_gb: 32,
						gpu_count: 1,
						throughput_per_hour: 900.0,
						cost_per_hour: 0.36,
						preemptible: true,
						max_concurrency: 5,
					},
					min_instances: 0,
					max_instances: 24,
					max_batch_secs: 300.0,
				},
				ClassProfile {
					descriptor: WorkerDescriptor {
						class: WorkerClass::Managed,
						v_cpu: 0,
						memory_gb: 0,
						gpu_count: 0,
						throughput_per_hour: 1800.0,
						cost_per_hour: 2.80,
						preemptible: false,
						max_concurrency: 8,
					},
					min_instances: 0,
					max_instances: 8,
					max_batch_secs: 600.0,
				},
			],
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
	Provisioning,
	Ready,
	Draining,
	Terminated,
}

/// One live worker instance. Records live in the registry arena and are
/// mutated only through registry methods.
#[derive(Debug, Clone)]
pub struct Worker {
	pub id: WorkerId,
	pub class: WorkerClass,
	pub state: WorkerState,
	pub active_jobs: u32,
	pub started_at: Instant,
	pub last_heartbeat: Instant,

	/// Set on an interruption notice. A worker with this set accepts no
	/// new batches regardless of state.
	pub interruption_deadline: Option<Instant>,

	/// Root token for this worker's in-flight batches; cancelled when
	/// the worker is lost so every batch unwinds.
	pub cancel: CancellationToken,
}

impl Worker {
	pub fn new(id: WorkerId, class: WorkerClass) -> Self {
		let now = Instant::now();
		Self {
			id,
			class,
			state: WorkerState::Provisioning,
			active_jobs: 0,
			started_at: now,
			last_heartbeat: now,
			interruption_deadline: None,
			cancel: CancellationToken::new(),
		}
	}

	pub fn is_assignable(&self, max_concurrency: u32) -> bool {
		self.state == WorkerState::Ready && self.interruption_deadline.is_none() && self.active_jobs < max_concurrency
	}

	/// Time since the record was created, for loss reporting.
	pub fn age(&self, now: Instant) -> std::time::Duration {
		now.duration_since(self.started_at)
	}
}

/// Per-class summary handed to the autoscaler each tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassObservation {
	pub ready: u32,
	pub provisioning: u32,
	pub draining: u32,
	pub active_jobs: u32,

	/// Mean `active_jobs / max_concurrency` over ready workers; zero when
	/// none are ready.
	pub utilization: f64,
}

/// Arena registry of live workers, keyed by id.
pub struct FleetRegistry {
	workers: RwLock<HashMap<WorkerId, Worker>>,
}

impl FleetRegistry {
	pub fn new() -> Self {
		Self {
			workers: RwLock::new(HashMap::new()),
		}
	}

	/// Record a worker the provisioner has started. Idempotent.
	pub async fn upsert_provisioning(&self, id: WorkerId, class: WorkerClass) {
		self.workers.write().await.entry(id).or_insert_with(|| Worker::new(id, class));
	}

	/// Provisioning complete; the worker can take batches. Returns false
	/// for unknown ids and for workers already draining or gone.
	pub async fn mark_ready(&self, id: WorkerId) -> bool {
		let mut workers = self.workers.write().await;
		match workers.get_mut(&id) {
			Some(w) if matches!(w.state, WorkerState::Provisioning | WorkerState::Ready) => {
				w.state = WorkerState::Ready;
				w.last_heartbeat = Instant::now();
				true
			}
			_ => false,
		}
	}

	pub async fn heartbeat(&self, id: WorkerId, now: Instant) {
		if let Some(w) = self.workers.write().await.get_mut(&id) {
			w.last_heartbeat = now;
		}
	}

	/// Interruption notice: stop assignment, remember the grace deadline.
	pub async fn begin_drain(&self, id: WorkerId, deadline: Option<Instant>) -> bool {
		let mut workers = self.workers.write().await;
		match workers.get_mut(&id) {
			Some(w) if w.state != WorkerState::Terminated => {
				w.state = WorkerState::Draining;
				w.interruption_deadline = deadline;
				true
			}
			_ => false,
		}
	}

	/// Drop the record, returning it so the caller can cancel its batches.
	pub async fn remove(&self, id: WorkerId) -> Option<Worker> {
		self.workers.write().await.remove(&id)
	}

	/// Pick the least-loaded assignable worker of the class and claim one
	/// slot on it, atomically. Hourly cost is uniform within a class, so
	/// the cost tie-break reduces to the id tie-break here.
	pub async fn reserve_slot(&self, profile: &ClassProfile) -> Option<(WorkerId, CancellationToken)> {
		let class = profile.class();
		let max_concurrency = profile.descriptor.max_concurrency;

		let mut workers = self.workers.write().await;
		let chosen = workers
			.values_mut()
			.filter(|w| w.class == class && w.is_assignable(max_concurrency))
			.min_by(|a, b| a.active_jobs.cmp(&b.active_jobs).then_with(|| a.id.cmp(&b.id)))?;
		chosen.active_jobs += 1;
		Some((chosen.id, chosen.cancel.clone()))
	}

	pub async fn release_slot(&self, id: WorkerId) {
		if let Some(w) = self.workers.write().await.get_mut(&id) {
			w.active_jobs = w.active_jobs.saturating_sub(1);
		}
	}

	/// Free execution slots across ready workers of the class.
	pub async fn free_slots(&self, profile: &ClassProfile) -> u32 {
		let max_concurrency = profile.descriptor.max_concurrency;
		self
			.workers
			.read()
			.await
			.values()
			.filter(|w| w.class == profile.class() && w.is_assignable(max_concurrency))
			.map(|w| max_concurrency - w.active_jobs)
			.sum()
	}

	/// Ready or draining workers whose heartbeat is older than `timeout`.
	pub async fn stale(&self, timeout: std::time::Duration, now: Instant) -> Vec<WorkerId> {
		self
			.workers
			.read()
			.await
			.values()
			.filter(|w| matches!(w.state, WorkerState::Ready | WorkerState::Draining))
			.filter(|w| now.duration_since(w.last_heartbeat) > timeout)
			.map(|w| w.id)
			.collect()
	}

	pub async fn get(&self, id: WorkerId) -> Option<Worker> {
		self.workers.read().await.get(&id).cloned()
	}

	pub async fn count(&self, class: WorkerClass, state: WorkerState) -> usize {
		self.workers.read().await.values().filter(|w| w.class == class && w.state == state).count()
	}

	/// Build the per-class observation for every class in the fleet, with
	/// explicit zero entries for classes with no workers.
	pub async fn observe(&self, fleet: &FleetProfile) -> HashMap<WorkerClass, ClassObservation> {
		let workers = self.workers.read().await;
		let mut out: HashMap<WorkerClass, ClassObservation> = fleet.classes.iter().map(|p| (p.class(), ClassObservation::default())).collect();

		for w in workers.values() {
			let Some(obs) = out.get_mut(&w.class) else { continue };
			match w.state {
				WorkerState::Ready => {
					obs.ready += 1;
					obs.active_jobs += w.active_jobs;
				}
				WorkerState::Provisioning => obs.provisioning += 1,
				WorkerState::Draining => {
					obs.draining += 1;
					obs.active_jobs += w.active_jobs;
				}
				WorkerState::Terminated => {}
			}
		}

		for profile in &fleet.classes {
			let Some(obs) = out.get_mut(&profile.class()) else { continue };
			if obs.ready > 0 {
				let capacity = f64::from(obs.ready) * f64::from(profile.descriptor.max_concurrency);
				let busy: u32 = workers
					.values()
					.filter(|w| w.class == profile.class() && w.state == WorkerState::Ready)
					.map(|w| w.active_jobs)
					.sum();
				obs.utilization = f64::from(busy) / capacity;
			}
		}

		out
	}
}

impl Default for FleetRegistry {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	fn gpu_profile() -> ClassProfile {
		FleetProfile::default().get(WorkerClass::GpuOnDemand).cloned().unwrap()
	}

	#[test]
	fn default_profile_is_valid() {
		let fleet = FleetProfile::default();
		fleet.validate().unwrap();
		assert_eq!(fleet.by_cost()[0].class(), WorkerClass::Cpu);
		assert_eq!(fleet.largest_capacity().class(), WorkerClass::Managed);
	}

	#[test]
	fn profile_rejects_inverted_instance_bounds() {
		let mut profile = gpu_profile();
		profile.min_instances = 10;
		profile.max_instances = 2;
		assert!(profile.validate().is_err());
	}

	#[test]
	fn profile_rejects_zero_throughput() {
		let mut profile = gpu_profile();
		profile.descriptor.throughput_per_hour = 0.0;
		assert!(profile.validate().is_err());
	}

	#[test]
	fn fleet_rejects_duplicate_classes() {
		let mut fleet = FleetProfile::default();
		let dup = fleet.classes[0].clone();
		fleet.classes.push(dup);
		assert!(fleet.validate().is_err());
	}

	#[tokio::test]
	async fn reserve_picks_least_loaded_and_claims_slot() {
		let registry = FleetRegistry::new();
		let profile = gpu_profile();
		let a = Uuid::new_v4();
		let b = Uuid::new_v4();
		registry.upsert_provisioning(a, WorkerClass::GpuOnDemand).await;
		registry.upsert_provisioning(b, WorkerClass::GpuOnDemand).await;
		registry.mark_ready(a).await;
		registry.mark_ready(b).await;

		// Load worker a so b becomes the least-loaded pick.
		let (first, _) = registry.reserve_slot(&profile).await.unwrap();
		registry.heartbeat(first, Instant::now()).await;
		let loaded = registry.get(first).await.unwrap();
		assert_eq!(loaded.active_jobs, 1);

		let (second, _) = registry.reserve_slot(&profile).await.unwrap();
		assert_ne!(first, second);
	}

	#[tokio::test]
	async fn draining_workers_take_no_assignments() {
		let registry = FleetRegistry::new();
		let profile = gpu_profile();
		let id = Uuid::new_v4();
		registry.upsert_provisioning(id, WorkerClass::GpuOnDemand).await;
		registry.mark_ready(id).await;
		assert!(registry.reserve_slot(&profile).await.is_some());

		registry.begin_drain(id, Some(Instant::now() + Duration::from_secs(120))).await;
		assert!(registry.reserve_slot(&profile).await.is_none());
		assert_eq!(registry.free_slots(&profile).await, 0);
	}

	#[tokio::test]
	async fn reserve_respects_concurrency_bound() {
		let registry = FleetRegistry::new();
		let profile = gpu_profile();
		let id = Uuid::new_v4();
		registry.upsert_provisioning(id, WorkerClass::GpuOnDemand).await;
		registry.mark_ready(id).await;

		for _ in 0..profile.descriptor.max_concurrency {
			assert!(registry.reserve_slot(&profile).await.is_some());
		}
		assert!(registry.reserve_slot(&profile).await.is_none());

		registry.release_slot(id).await;
		assert!(registry.reserve_slot(&profile).await.is_some());
	}

	#[tokio::test]
	async fn stale_ignores_provisioning_workers() {
		let registry = FleetRegistry::new();
		let fresh = Uuid::new_v4();
		let silent = Uuid::new_v4();
		let booting = Uuid::new_v4();
		registry.upsert_provisioning(fresh, WorkerClass::Cpu).await;
		registry.upsert_provisioning(silent, WorkerClass::Cpu).await;
		registry.upsert_provisioning(booting, WorkerClass::Cpu).await;
		registry.mark_ready(fresh).await;
		registry.mark_ready(silent).await;

		let later = Instant::now() + Duration::from_secs(30);
		registry.heartbeat(fresh, later).await;

		let stale = registry.stale(Duration::from_secs(15), later).await;
		assert_eq!(stale, vec![silent]);
	}

	#[tokio::test]
	async fn removed_worker_reports_its_age() {
		let registry = FleetRegistry::new();
		let id = Uuid::new_v4();
		registry.upsert_provisioning(id, WorkerClass::Cpu).await;
		registry.mark_ready(id).await;

		let later = Instant::now() + Duration::from_secs(45);
		let worker = registry.remove(id).await.unwrap();
		assert!(worker.age(later) >= Duration::from_secs(45));
		assert_eq!(worker.age(worker.started_at), Duration::ZERO);
	}

	#[tokio::test]
	async fn observe_reports_utilization_over_ready_workers() {
		let registry = FleetRegistry::new();
		let fleet = FleetProfile::default();
		let profile = gpu_profile();
		let id = Uuid::new_v4();
		registry.upsert_provisioning(id, WorkerClass::GpuOnDemand).await;
		registry.mark_ready(id).await;
		registry.reserve_slot(&profile).await.unwrap();
		registry.reserve_slot(&profile).await.unwrap();

		let obs = registry.observe(&fleet).await;
		let gpu = obs[&WorkerClass::GpuOnDemand];
		assert_eq!(gpu.ready, 1);
		assert_eq!(gpu.active_jobs, 2);
		assert!((gpu.utilization - 0.4).abs() < 1e-9);

		// Classes with no workers still report, at zero.
		assert_eq!(obs[&WorkerClass::Managed].ready, 0);
	}
}
