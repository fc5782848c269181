use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{DispatchError, Result};
use crate::request::Request;
use crate::worker::WorkerDescriptor;

/// Result of one inference call.
#[derive(Debug, Clone)]
pub struct Transcript {
	pub text: String,
	pub elapsed: Duration,
}

/// The opaque inference collaborator. The dispatcher only ever sees this
/// seam; model loading, device placement and decoding live behind it.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
	async fn infer(&self, request: &Request, descriptor: &WorkerDescriptor) -> Result<Transcript>;
}

/// Backend that models service time from the descriptor's throughput
/// instead of running a model. `time_scale` compresses the simulation
/// (0.001 turns a 13s job into 13ms); `fail_every` fails every n-th call
/// deterministically so retry paths can be exercised.
pub struct SimulatedBackend {
	time_scale: f64,
	fail_every: u64,
	calls: AtomicU64,
}

impl SimulatedBackend {
	pub fn new(time_scale: f64) -> Self {
		Self {
			time_scale,
			fail_every: 0,
			calls: AtomicU64::new(0),
		}
	}

	pub fn with_failures(time_scale: f64, fail_every: u64) -> Self {
		Self {
			time_scale,
			fail_every,
			calls: AtomicU64::new(0),
		}
	}

	pub fn calls(&self) -> u64 {
		self.calls.load(Ordering::Relaxed)
	}
}

#[async_trait]
impl InferenceBackend for SimulatedBackend {
	async fn infer(&self, request: &Request, descriptor: &WorkerDescriptor) -> Result<Transcript> {
		let started = Instant::now();
		let service = crate::cost::seconds_per_job(descriptor) * self.time_scale;
		tokio::time::sleep(Duration::from_secs_f64(service.max(0.0))).await;

		let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
		if self.fail_every > 0 && call % self.fail_every == 0 {
			return Err(DispatchError::Inference(format!("simulated failure on call {call}")));
		}

		Ok(Transcript {
			text: format!("[transcript of {} ({:.1}s)]", request.audio_uri, request.audio_secs),
			elapsed: started.elapsed(),
		})
	}
}
