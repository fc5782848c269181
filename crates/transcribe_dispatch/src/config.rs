use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DispatchError, Result};
use crate::worker::FleetProfile;

#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(author, version, about, long_about = None)]
pub struct DispatchConfig {
	#[arg(long, env = "QUEUE_CAPACITY", default_value = "2000", help = "Maximum queued requests before admission rejects")]
	pub queue_capacity: usize,

	#[arg(
        long,
        env = "BATCH_WINDOW_MS",
        default_value = "200",
        value_parser = parse_millis,
        help = "Batch formation window in milliseconds"
    )]
	pub batch_window: Duration,

	#[arg(long, env = "BATCH_TRIGGER_DEPTH", default_value = "32", help = "Queue depth that triggers batching before the window elapses")]
	pub batch_trigger_depth: usize,

	#[arg(long, env = "MAX_BATCH_ITEMS", default_value = "16", help = "Maximum requests per batch")]
	pub max_batch_items: usize,

	#[arg(long, env = "MAX_RETRIES", default_value = "2", help = "Failure-driven requeues before a request fails terminally")]
	pub max_retries: u32,

	#[arg(long, env = "SCALE_UP_THRESHOLD", default_value = "0.7", help = "Mean class utilization above which the class grows")]
	pub scale_up_threshold: f64,

	#[arg(long, env = "SCALE_DOWN_THRESHOLD", default_value = "0.3", help = "Mean class utilization below which the class may shrink")]
	pub scale_down_threshold: f64,

	#[arg(long, env = "SCALE_DOWN_TICKS", default_value = "3", help = "Consecutive low-utilization ticks required before shrinking")]
	pub scale_down_ticks: u32,

	#[arg(long, env = "SCALE_STEP", default_value = "4", help = "Most workers one class may add in a single control tick")]
	pub scale_step: u32,

	#[arg(
        long,
        env = "COOLDOWN_SECS",
        default_value = "60",
        value_parser = parse_secs,
        help = "Seconds after any scale event during which a class will not scale down"
    )]
	pub cooldown: Duration,

	#[arg(
        long,
        env = "CONTROL_TICK_MS",
        default_value = "500",
        value_parser = parse_millis,
        help = "Autoscaler and sweep cadence in milliseconds"
    )]
	pub control_tick: Duration,

	#[arg(
        long,
        env = "HEARTBEAT_TIMEOUT_SECS",
        default_value = "15",
        value_parser = parse_secs,
        help = "Silence after which a worker is treated as lost"
    )]
	pub heartbeat_timeout: Duration,

	#[arg(
        long,
        env = "RESULT_TTL_SECS",
        default_value = "3600",
        value_parser = parse_secs,
        help = "How long terminal results stay queryable"
    )]
	pub result_ttl: Duration,

	#[arg(long, env = "FLEET_PROFILE", help = "Path to a JSON fleet profile; omit for the built-in profile")]
	pub fleet_profile: Option<PathBuf>,
}

impl DispatchConfig {
	pub fn new() -> Self {
		Self::parse()
	}

	pub fn validate(&self) -> Result<()> {
		if self.queue_capacity == 0 {
			return Err(DispatchError::InvalidConfig("queue_capacity must be at least 1".into()));
		}
		if self.max_batch_items == 0 {
			return Err(DispatchError::InvalidConfig("max_batch_items must be at least 1".into()));
		}
		if self.batch_window.is_zero() || self.control_tick.is_zero() {
			return Err(DispatchError::InvalidConfig("batch_window and control_tick must be non-zero".into()));
		}
		for (name, value) in [("scale_up_threshold", self.scale_up_threshold), ("scale_down_threshold", self.scale_down_threshold)] {
			if !(value > 0.0 && value < 1.0) {
				return Err(DispatchError::InvalidConfig(format!("{name} must be inside (0, 1)")));
			}
		}
		if self.scale_down_threshold >= self.scale_up_threshold {
			return Err(DispatchError::InvalidConfig("scale_down_threshold must be below scale_up_threshold".into()));
		}
		if self.scale_down_ticks == 0 {
			return Err(DispatchError::InvalidConfig("scale_down_ticks must be at least 1".into()));
		}
		if self.scale_step == 0 {
			return Err(DispatchError::InvalidConfig("scale_step must be at least 1".into()));
		}
		Ok(())
	}

	/// Load the fleet profile this config points at, or the built-in one.
	pub fn load_fleet(&self) -> Result<FleetProfile> {
		match &self.fleet_profile {
			Some(path) => FleetProfile::load(path),
			None => Ok(FleetProfile::default()),
		}
	}

	#[cfg(test)]
	pub fn test() -> Self {
		Self {
			queue_capacity: 64,
			batch_window: Duration::from_millis(20),
			batch_trigger_depth: 8,
			max_batch_items: 4,
			max_retries: 2,
			scale_up_threshold: 0.7,
			scale_down_threshold: 0.3,
			scale_down_ticks: 2,
			scale_step: 32,
			cooldown: Duration::from_millis(200),
			control_tick: Duration::from_millis(25),
			heartbeat_timeout: Duration::from_secs(5),
			result_ttl: Duration::from_secs(60),
			fleet_profile: None,
		}
	}
}

impl Default for DispatchConfig {
	fn default() -> Self {
		Self {
			queue_capacity: 2000,
			batch_window: Duration::from_millis(200),
			batch_trigger_depth: 32,
			max_batch_items: 16,
			max_retries: 2,
			scale_up_threshold: 0.7,
			scale_down_threshold: 0.3,
			scale_down_ticks: 3,
			scale_step: 4,
			cooldown: Duration::from_secs(60),
			control_tick: Duration::from_millis(500),
			heartbeat_timeout: Duration::from_secs(15),
			result_ttl: Duration::from_secs(3600),
			fleet_profile: None,
		}
	}
}

fn parse_millis(s: &str) -> std::result::Result<Duration, std::num::ParseIntError> {
	s.parse::<u64>().map(Duration::from_millis)
}

fn parse_secs(s: &str) -> std::result::Result<Duration, std::num::ParseIntError> {
	s.parse::<u64>().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_config() {
		let config = DispatchConfig::default();
		assert_eq!(config.queue_capacity, 2000);
		assert_eq!(config.batch_window, Duration::from_millis(200));
		assert_eq!(config.max_retries, 2);
		assert_eq!(config.cooldown, Duration::from_secs(60));
		config.validate().unwrap();
	}

	#[test]
	fn test_parse_duration_helpers() {
		assert_eq!(parse_millis("200").unwrap(), Duration::from_millis(200));
		assert_eq!(parse_secs("60").unwrap(), Duration::from_secs(60));
		assert!(parse_millis("invalid").is_err());
	}

	#[test]
	fn test_config_parser() {
		let args = vec![
			"program",
			"--queue-capacity",
			"500",
			"--batch-window",
			"50",
			"--max-retries",
			"4",
			"--cooldown",
			"120",
			"--scale-up-threshold",
			"0.8",
		];

		let config = DispatchConfig::try_parse_from(args).unwrap();
		assert_eq!(config.queue_capacity, 500);
		assert_eq!(config.batch_window, Duration::from_millis(50));
		assert_eq!(config.max_retries, 4);
		assert_eq!(config.cooldown, Duration::from_secs(120));
		assert!((config.scale_up_threshold - 0.8).abs() < f64::EPSILON);
	}

	#[test]
	fn test_validate_rejects_inverted_thresholds() {
		let config = DispatchConfig {
			scale_up_threshold: 0.3,
			scale_down_threshold: 0.7,
			..DispatchConfig::default()
		};
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_validate_rejects_zero_capacity() {
		let config = DispatchConfig {
			queue_capacity: 0,
			..DispatchConfig::default()
		};
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_validate_rejects_zero_scale_step() {
		let config = DispatchConfig {
			scale_step: 0,
			..DispatchConfig::default()
		};
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_load_fleet_falls_back_to_builtin() {
		let config = DispatchConfig::default();
		let fleet = config.load_fleet().unwrap();
		assert!(!fleet.classes.is_empty());
	}
}
