use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Why an admission attempt was refused synchronously.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionReason {
	#[error("queue is full ({depth}/{capacity})")]
	QueueFull { depth: usize, capacity: usize },

	#[error("deadline already elapsed at admission")]
	DeadlineElapsed,
}

impl AdmissionReason {
	pub const fn as_label(self) -> &'static str {
		match self {
			Self::QueueFull { .. } => "queue_full",
			Self::DeadlineElapsed => "deadline_elapsed",
		}
	}
}

#[derive(Error, Debug)]
pub enum DispatchError {
	#[error("admission rejected: {0}")]
	AdmissionRejected(AdmissionReason),

	#[error("invalid request: {0}")]
	InvalidRequest(String),

	#[error("inference failed: {0}")]
	Inference(String),

	#[error("request expired before completion")]
	Expired,

	#[error("worker lost: {0}")]
	WorkerLost(String),

	#[error("invalid fleet profile: {0}")]
	InvalidProfile(String),

	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	#[error("metrics error: {0}")]
	Metrics(#[from] prometheus::Error),

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("channel closed: {0}")]
	ChannelClosed(&'static str),
}
