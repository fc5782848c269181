//! Pure cost and service-time arithmetic over worker descriptors.
//! No clocks, no side effects; every scaling and routing decision that
//! involves money goes through here.

use std::time::Duration;

use crate::worker::WorkerDescriptor;

/// Dollars to lease one worker of this class for `seconds`.
pub fn lease_cost(descriptor: &WorkerDescriptor, seconds: f64) -> f64 {
	descriptor.cost_per_hour * seconds / 3600.0
}

/// Mean wall seconds one execution slot spends on a single job.
pub fn seconds_per_job(descriptor: &WorkerDescriptor) -> f64 {
	3600.0 / descriptor.throughput_per_hour
}

/// Dollars one job costs on this class at sustained throughput.
pub fn cost_per_job(descriptor: &WorkerDescriptor) -> f64 {
	lease_cost(descriptor, seconds_per_job(descriptor))
}

/// Estimated wall seconds for `jobs` jobs run back to back on one slot.
pub fn service_secs(descriptor: &WorkerDescriptor, jobs: usize) -> f64 {
	// usize -> f64 is lossless for any realistic batch size
	#[allow(clippy::cast_precision_loss)]
	{
		seconds_per_job(descriptor) * jobs as f64
	}
}

/// Jobs one worker clears in `interval`, all slots combined.
pub fn jobs_per_interval(descriptor: &WorkerDescriptor, interval: Duration) -> f64 {
	descriptor.throughput_per_hour * f64::from(descriptor.max_concurrency) * interval.as_secs_f64() / 3600.0
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::worker::WorkerClass;
	use approx::assert_relative_eq;

	fn descriptor(throughput_per_hour: f64, cost_per_hour: f64, max_concurrency: u32) -> WorkerDescriptor {
		WorkerDescriptor {
			class: WorkerClass::GpuOnDemand,
			v_cpu: 8,
			memory_gb: 32,
			gpu_count: 1,
			throughput_per_hour,
			cost_per_hour,
			preemptible: false,
			max_concurrency,
		}
	}

	#[test]
	fn lease_cost_is_linear_in_time() {
		let d = descriptor(900.0, 1.20, 5);
		assert_relative_eq!(lease_cost(&d, 3600.0), 1.20);
		assert_relative_eq!(lease_cost(&d, 900.0), 0.30);
		assert_relative_eq!(lease_cost(&d, 0.0), 0.0);
	}

	#[test]
	fn service_time_follows_throughput() {
		// 276 jobs/hour is roughly one job every 13 seconds.
		let d = descriptor(276.0, 1.20, 5);
		assert_relative_eq!(seconds_per_job(&d), 13.043478, epsilon = 1e-5);
		assert_relative_eq!(service_secs(&d, 3), 39.130434, epsilon = 1e-4);
	}

	#[test]
	fn per_job_cost_scales_with_rate() {
		// Pricier per hour can still be cheaper per job when throughput
		// grows faster than the rate.
		let slow = descriptor(90.0, 0.34, 2);
		let fast = descriptor(900.0, 1.20, 5);
		assert_relative_eq!(cost_per_job(&slow), 0.34 / 90.0);
		assert_relative_eq!(cost_per_job(&fast), 1.20 / 900.0);
		assert!(cost_per_job(&fast) < cost_per_job(&slow));
	}

	#[test]
	fn interval_capacity_counts_all_slots() {
		let d = descriptor(900.0, 1.20, 5);
		// 900/hour/slot, 5 slots, over one minute: 75 jobs.
		assert_relative_eq!(jobs_per_interval(&d, Duration::from_secs(60)), 75.0);
	}
}
