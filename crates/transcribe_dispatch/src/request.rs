use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

pub type RequestId = Uuid;

/// Scheduling priority band. Higher bands drain first; FIFO within a band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
	High,
	#[default]
	Normal,
	Low,
}

impl Priority {
	pub const ALL: [Self; 3] = [Self::High, Self::Normal, Self::Low];
}

/// Lifecycle of an admitted request.
///
/// `queued -> batched -> dispatched` can loop back to `queued` on requeue;
/// `completed`, `failed` and `expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
	Queued,
	Batched,
	Dispatched,
	Completed,
	Failed,
	Expired,
}

impl RequestStatus {
	pub const fn is_terminal(self) -> bool {
		matches!(self, Self::Completed | Self::Failed | Self::Expired)
	}
}

/// A single admitted transcription request.
///
/// Immutable after creation except for `attempts`, which counts
/// failure-driven requeues (inference errors, preemption, worker loss).
/// Back-pressure requeues do not touch it.
#[derive(Debug, Clone)]
pub struct Request {
	pub id: RequestId,

	/// Opaque reference to the audio payload; the dispatcher never reads it.
	pub audio_uri: String,

	/// Audio duration in seconds, known at admission.
	pub audio_secs: f64,

	pub priority: Priority,

	/// When this request was admitted. Preserved across requeues so the
	/// request keeps its place in the FIFO order of its priority band.
	pub enqueued_at: Instant,

	/// Hard latency bound. Checked cooperatively at every hand-off point;
	/// work already running when the deadline passes is allowed to finish.
	pub deadline: Instant,

	pub attempts: u32,
}

impl Request {
	pub fn new(audio_uri: impl Into<String>, audio_secs: f64, priority: Priority, deadline_in: Duration) -> Self {
		let now = Instant::now();
		Self {
			id: Uuid::new_v4(),
			audio_uri: audio_uri.into(),
			audio_secs,
			priority,
			enqueued_at: now,
			deadline: now + deadline_in,
			attempts: 0,
		}
	}

	/// How long this request has been waiting since admission.
	pub fn queue_latency(&self) -> Duration {
		self.enqueued_at.elapsed()
	}

	pub fn is_expired(&self, now: Instant) -> bool {
		now >= self.deadline
	}

	/// Time left until the deadline, zero once it has passed.
	pub fn headroom(&self, now: Instant) -> Duration {
		self.deadline.saturating_duration_since(now)
	}
}

/// Terminal outcome delivered to the submitter.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
	Completed { text: String, elapsed: Duration },
	Failed { error: String },
	Expired,
}

impl RequestOutcome {
	pub const fn status(&self) -> RequestStatus {
		match self {
			Self::Completed { .. } => RequestStatus::Completed,
			Self::Failed { .. } => RequestStatus::Failed,
			Self::Expired => RequestStatus::Expired,
		}
	}
}

/// Queue-owned unit: the request plus the channel that resolves it.
///
/// Exactly one owner at a time - queue, then batch, then inference task.
/// Dropping it without resolving closes the submitter's receiver.
#[derive(Debug)]
pub struct QueuedRequest {
	pub request: Request,
	responder: Option<oneshot::Sender<RequestOutcome>>,
}

impl QueuedRequest {
	pub fn new(request: Request) -> (Self, oneshot::Receiver<RequestOutcome>) {
		let (tx, rx) = oneshot::channel();
		(
			Self {
				request,
				responder: Some(tx),
			},
			rx,
		)
	}

	/// Send the terminal outcome. A dropped receiver is not an error; the
	/// submitter may have stopped waiting.
	pub fn resolve(mut self, outcome: RequestOutcome) {
		if let Some(tx) = self.responder.take() {
			let _ = tx.send(outcome);
		}
	}
}

/// Point-in-time view of a request, served to status polls.
#[derive(Debug, Clone)]
pub struct RequestRecord {
	pub id: RequestId,
	pub priority: Priority,
	pub audio_secs: f64,
	pub status: RequestStatus,
	pub attempts: u32,
	pub outcome: Option<RequestOutcome>,
	pub updated_at: Instant,
}

/// Status index for every request the service has seen.
///
/// Terminal entries are retained for a TTL so late status polls still find
/// their result, then swept.
pub struct RequestLedger {
	entries: RwLock<HashMap<RequestId, RequestRecord>>,
}

impl RequestLedger {
	pub fn new() -> Self {
		Self {
			entries: RwLock::new(HashMap::new()),
		}
	}

	pub async fn admit(&self, request: &Request) {
		let record = RequestRecord {
			id: request.id,
			priority: request.priority,
			audio_secs: request.audio_secs,
			status: RequestStatus::Queued,
			attempts: request.attempts,
			outcome: None,
			updated_at: Instant::now(),
		};
		self.entries.write().await.insert(request.id, record);
	}

	/// Record a non-terminal transition. Unknown ids are ignored; the entry
	/// may already have been swept.
	pub async fn mark(&self, id: RequestId, status: RequestStatus) {
		if let Some(record) = self.entries.write().await.get_mut(&id) {
			record.status = status;
			record.updated_at = Instant::now();
		}
	}

	pub async fn mark_attempts(&self, id: RequestId, attempts: u32) {
		if let Some(record) = self.entries.write().await.get_mut(&id) {
			record.attempts = attempts;
			record.updated_at = Instant::now();
		}
	}

	/// Record the terminal outcome and resolve the submitter's future.
	pub async fn resolve(&self, entry: QueuedRequest, outcome: RequestOutcome) {
		{
			let mut entries = self.entries.write().await;
			if let Some(record) = entries.get_mut(&entry.request.id) {
				record.status = outcome.status();
				record.attempts = entry.request.attempts;
				record.outcome = Some(outcome.clone());
				record.updated_at = Instant::now();
			}
		}
		entry.resolve(outcome);
	}

	pub async fn get(&self, id: RequestId) -> Option<RequestRecord> {
		self.entries.read().await.get(&id).cloned()
	}

	/// Drop a record outright. Admission creates the record before the
	/// queue accepts the entry, so a rejection has to take it back.
	pub async fn forget(&self, id: RequestId) {
		self.entries.write().await.remove(&id);
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	/// Drop terminal entries older than `ttl`. Returns how many were swept.
	pub async fn sweep_terminal(&self, ttl: Duration) -> usize {
		let now = Instant::now();
		let mut entries = self.entries.write().await;
		let before = entries.len();
		entries.retain(|_, record| !record.status.is_terminal() || now.duration_since(record.updated_at) < ttl);
		before - entries.len()
	}
}

impl Default for RequestLedger {
	fn default() -> Self {
		Self::new()
	}
}
