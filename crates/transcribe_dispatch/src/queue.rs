use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use crate::error::AdmissionReason;
use crate::request::{Priority, QueuedRequest, RequestId};
use crate::worker::{ClassProfile, FleetProfile, WorkerClass};

/// Queue depth per priority band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
	pub high: usize,
	pub normal: usize,
	pub low: usize,
	pub total: usize,
}

/// Non-destructive view of one batchable entry.
#[derive(Debug, Clone, Copy)]
pub struct PeekItem {
	pub id: RequestId,
	pub audio_secs: f64,
}

/// Queued demand attributed to one worker class.
#[derive(Debug, Clone, Copy, Default)]
pub struct BacklogStat {
	pub jobs: usize,
	pub audio_secs: f64,
}

#[derive(Default)]
struct Bands {
	high: VecDeque<QueuedRequest>,
	normal: VecDeque<QueuedRequest>,
	low: VecDeque<QueuedRequest>,
}

impl Bands {
	fn band_mut(&mut self, priority: Priority) -> &mut VecDeque<QueuedRequest> {
		match priority {
			Priority::High => &mut self.high,
			Priority::Normal => &mut self.normal,
			Priority::Low => &mut self.low,
		}
	}

	/// Entries in service order: priority band, FIFO within the band.
	fn iter(&self) -> impl Iterator<Item = &QueuedRequest> {
		self.high.iter().chain(self.normal.iter()).chain(self.low.iter())
	}

	fn total(&self) -> usize {
		self.high.len() + self.normal.len() + self.low.len()
	}
}

/// Bounded, priority-ordered admission buffer.
///
/// The capacity bound applies to `enqueue` only; `reinsert` puts already
/// admitted work back and must never drop it. All mutation happens under
/// one lock, so remove can race the expiry sweep safely.
pub struct AdmissionQueue {
	bands: Mutex<Bands>,
	capacity: usize,
	trigger_depth: usize,
	kick: Notify,
}

impl AdmissionQueue {
	pub fn new(capacity: usize, trigger_depth: usize) -> Self {
		Self {
			bands: Mutex::new(Bands::default()),
			capacity,
			trigger_depth,
			kick: Notify::new(),
		}
	}

	/// Signal fired when the queue crosses the eager-batching depth.
	pub fn batch_signal(&self) -> &Notify {
		&self.kick
	}

	/// Admit a request. On rejection the entry is handed back so the
	/// caller still owns its responder.
	pub async fn enqueue(&self, entry: QueuedRequest, now: Instant) -> std::result::Result<usize, (QueuedRequest, AdmissionReason)> {
		if entry.request.is_expired(now) {
			return Err((entry, AdmissionReason::DeadlineElapsed));
		}

		let mut bands = self.bands.lock().await;
		let depth = bands.total();
		if depth >= self.capacity {
			return Err((
				entry,
				AdmissionReason::QueueFull {
					depth,
					capacity: self.capacity,
				},
			));
		}

		bands.band_mut(entry.request.priority).push_back(entry);
		let depth = bands.total();
		drop(bands);

		if depth >= self.trigger_depth {
			self.kick.notify_one();
		}
		Ok(depth)
	}

	pub async fn depth(&self) -> QueueDepth {
		let bands = self.bands.lock().await;
		QueueDepth {
			high: bands.high.len(),
			normal: bands.normal.len(),
			low: bands.low.len(),
			total: bands.total(),
		}
	}

	/// Scan in service order for a batch bound for `profile`'s class.
	///
	/// Entries whose audio exceeds the class batch capacity are skipped,
	/// not blocked on, as are entries whose deadline headroom is not
	/// tolerance-compatible with the first pick; the scan stops at the
	/// first compatible entry that no longer fits the remaining budget.
	/// With `allow_oversize` (largest class only) a single over-capacity
	/// entry is offered alone instead.
	pub async fn peek_batchable(&self, profile: &ClassProfile, max_items: usize, allow_oversize: bool, now: Instant) -> Vec<PeekItem> {
		let cap = profile.max_batch_secs;
		let bands = self.bands.lock().await;

		let mut picked = Vec::new();
		let mut total = 0.0_f64;
		let mut anchor: Option<Duration> = None;
		for entry in bands.iter() {
			if entry.request.is_expired(now) {
				// left for the expiry sweep
				continue;
			}
			let audio = entry.request.audio_secs;
			if audio > cap {
				if allow_oversize && picked.is_empty() {
					return vec![PeekItem {
						id: entry.request.id,
						audio_secs: audio,
					}];
				}
				continue;
			}
			let headroom = entry.request.headroom(now);
			if let Some(first) = anchor {
				if !tolerance_compatible(first, headroom) {
					// anchors its own batch on a later pass
					continue;
				}
			}
			if picked.len() >= max_items {
				break;
			}
			if total + audio > cap {
				break;
			}
			total += audio;
			anchor.get_or_insert(headroom);
			picked.push(PeekItem {
				id: entry.request.id,
				audio_secs: audio,
			});
		}
		picked
	}

	/// Extract the entries with the given ids, preserving queue order.
	/// Ids no longer present are skipped; removing twice is harmless.
	pub async fn remove(&self, ids: &[RequestId]) -> Vec<QueuedRequest> {
		let wanted: HashSet<RequestId> = ids.iter().copied().collect();
		let mut out = Vec::with_capacity(wanted.len());

		let mut bands = self.bands.lock().await;
		for priority in Priority::ALL {
			extract(bands.band_mut(priority), &mut out, |entry| wanted.contains(&entry.request.id));
		}
		out
	}

	/// Drain every entry whose deadline has passed.
	pub async fn sweep_expired(&self, now: Instant) -> Vec<QueuedRequest> {
		let mut out = Vec::new();
		let mut bands = self.bands.lock().await;
		for priority in Priority::ALL {
			extract(bands.band_mut(priority), &mut out, |entry| entry.request.is_expired(now));
		}
		if !out.is_empty() {
			debug!(count = out.len(), "swept expired requests");
		}
		out
	}

	/// Put previously admitted entries back, each at its original FIFO
	/// position within its priority band. Entries already past deadline
	/// are returned instead of queued.
	pub async fn reinsert(&self, entries: Vec<QueuedRequest>, now: Instant) -> Vec<QueuedRequest> {
		let mut expired = Vec::new();
		let mut bands = self.bands.lock().await;
		for entry in entries {
			if entry.request.is_expired(now) {
				expired.push(entry);
				continue;
			}
			let band = bands.band_mut(entry.request.priority);
			match band.iter().position(|q| q.request.enqueued_at > entry.request.enqueued_at) {
				Some(i) => band.insert(i, entry),
				None => band.push_back(entry),
			}
		}
		drop(bands);
		expired
	}

	/// Attribute every queued entry to the cheapest class whose batch
	/// capacity fits it; entries too long for every class count against
	/// the largest-capacity class.
	pub async fn backlog(&self, fleet: &FleetProfile) -> HashMap<WorkerClass, BacklogStat> {
		let ordered = fleet.by_cost();
		let largest = fleet.largest_capacity().class();
		let mut out: HashMap<WorkerClass, BacklogStat> = fleet.classes.iter().map(|p| (p.class(), BacklogStat::default())).collect();

		let bands = self.bands.lock().await;
		for entry in bands.iter() {
			let audio = entry.request.audio_secs;
			let class = ordered.iter().find(|p| audio <= p.max_batch_secs).map_or(largest, |p| p.class());
			if let Some(stat) = out.get_mut(&class) {
				stat.jobs += 1;
				stat.audio_secs += audio;
			}
		}
		out
	}

	/// Smallest deadline headroom across queued entries, if any.
	pub async fn min_headroom(&self, now: Instant) -> Option<Duration> {
		let bands = self.bands.lock().await;
		bands.iter().map(|entry| entry.request.headroom(now)).min()
	}
}

// Two deadline headrooms are batch-compatible when they sit within a
// factor of two of each other.
fn tolerance_compatible(anchor: Duration, candidate: Duration) -> bool {
	anchor.max(candidate) <= anchor.min(candidate) * 2
}

fn extract(band: &mut VecDeque<QueuedRequest>, out: &mut Vec<QueuedRequest>, mut take: impl FnMut(&QueuedRequest) -> bool) {
	let mut kept = VecDeque::with_capacity(band.len());
	while let Some(entry) = band.pop_front() {
		if take(&entry) {
			out.push(entry);
		} else {
			kept.push_back(entry);
		}
	}
	*band = kept;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::request::Request;
	use crate::worker::FleetProfile;
	use std::time::Duration;

	fn entry(audio_secs: f64, priority: Priority) -> QueuedRequest {
		let request = Request::new("s3://audio/clip.wav", audio_secs, priority, Duration::from_secs(30));
		QueuedRequest::new(request).0
	}

	fn gpu_profile() -> ClassProfile {
		FleetProfile::default().get(WorkerClass::GpuOnDemand).cloned().unwrap()
	}

	async fn fill(queue: &AdmissionQueue, entries: Vec<QueuedRequest>) -> Vec<RequestId> {
		let now = Instant::now();
		let mut ids = Vec::new();
		for e in entries {
			ids.push(e.request.id);
			queue.enqueue(e, now).await.unwrap();
		}
		ids
	}

	#[tokio::test]
	async fn enqueue_rejects_when_full() {
		let queue = AdmissionQueue::new(2, 100);
		fill(&queue, vec![entry(10.0, Priority::Normal), entry(10.0, Priority::Normal)]).await;

		let err = queue.enqueue(entry(10.0, Priority::Normal), Instant::now()).await.unwrap_err();
		assert!(matches!(err.1, AdmissionReason::QueueFull { depth: 2, capacity: 2 }));
		assert_eq!(queue.depth().await.total, 2);
	}

	#[tokio::test]
	async fn enqueue_rejects_elapsed_deadline_without_touching_queue() {
		let queue = AdmissionQueue::new(10, 100);
		let request = Request::new("s3://audio/clip.wav", 10.0, Priority::Normal, Duration::ZERO);
		let (stale, _rx) = QueuedRequest::new(request);

		let err = queue.enqueue(stale, Instant::now() + Duration::from_millis(1)).await.unwrap_err();
		assert!(matches!(err.1, AdmissionReason::DeadlineElapsed));
		assert_eq!(queue.depth().await.total, 0);
	}

	#[tokio::test]
	async fn peek_serves_priority_bands_first() {
		let queue = AdmissionQueue::new(10, 100);
		let ids = fill(
			&queue,
			vec![entry(10.0, Priority::Low), entry(10.0, Priority::Normal), entry(10.0, Priority::High)],
		)
		.await;

		let picked = queue.peek_batchable(&gpu_profile(), 16, false, Instant::now()).await;
		assert_eq!(picked.len(), 3);
		assert_eq!(picked[0].id, ids[2]);
		assert_eq!(picked[1].id, ids[1]);
		assert_eq!(picked[2].id, ids[0]);
	}

	#[tokio::test]
	async fn peek_stops_at_first_eligible_that_no_longer_fits() {
		let queue = AdmissionQueue::new(10, 100);
		// GPU batch capacity is 300s: 100 + 150 fit, 80 would overflow.
		let ids = fill(&queue, vec![entry(100.0, Priority::Normal), entry(150.0, Priority::Normal), entry(80.0, Priority::Normal)]).await;

		let picked = queue.peek_batchable(&gpu_profile(), 16, false, Instant::now()).await;
		let picked_ids: Vec<_> = picked.iter().map(|p| p.id).collect();
		assert_eq!(picked_ids, vec![ids[0], ids[1]]);
	}

	#[tokio::test]
	async fn peek_respects_item_cap() {
		let queue = AdmissionQueue::new(10, 100);
		fill(&queue, vec![entry(1.0, Priority::Normal), entry(1.0, Priority::Normal), entry(1.0, Priority::Normal)]).await;

		let picked = queue.peek_batchable(&gpu_profile(), 2, false, Instant::now()).await;
		assert_eq!(picked.len(), 2);
	}

	#[tokio::test]
	async fn peek_skips_oversized_entries_unless_allowed_alone() {
		let queue = AdmissionQueue::new(10, 100);
		let ids = fill(&queue, vec![entry(400.0, Priority::Normal), entry(50.0, Priority::Normal)]).await;

		// Ordinary pass: the 400s entry cannot ride in a 300s batch.
		let picked = queue.peek_batchable(&gpu_profile(), 16, false, Instant::now()).await;
		let picked_ids: Vec<_> = picked.iter().map(|p| p.id).collect();
		assert_eq!(picked_ids, vec![ids[1]]);

		// Largest-class pass: the oversized entry goes out alone.
		let picked = queue.peek_batchable(&gpu_profile(), 16, true, Instant::now()).await;
		let picked_ids: Vec<_> = picked.iter().map(|p| p.id).collect();
		assert_eq!(picked_ids, vec![ids[0]]);
	}

	#[tokio::test]
	async fn peek_groups_compatible_deadline_tolerance() {
		let queue = AdmissionQueue::new(10, 100);
		let now = Instant::now();

		// 60s of headroom anchors the pick; 5s is far tighter, 90s sits
		// inside the factor-two band.
		let mut ids = Vec::new();
		for deadline in [60, 5, 90] {
			let request = Request::new("s3://audio/clip.wav", 10.0, Priority::Normal, Duration::from_secs(deadline));
			ids.push(request.id);
			queue.enqueue(QueuedRequest::new(request).0, now).await.unwrap();
		}

		let picked = queue.peek_batchable(&gpu_profile(), 16, false, now).await;
		let picked_ids: Vec<_> = picked.iter().map(|p| p.id).collect();
		assert_eq!(picked_ids, vec![ids[0], ids[2]]);

		// Once that batch is gone the tight request anchors its own.
		queue.remove(&picked_ids).await;
		let next = queue.peek_batchable(&gpu_profile(), 16, false, now).await;
		let next_ids: Vec<_> = next.iter().map(|p| p.id).collect();
		assert_eq!(next_ids, vec![ids[1]]);
	}

	#[tokio::test]
	async fn remove_is_idempotent() {
		let queue = AdmissionQueue::new(10, 100);
		let ids = fill(&queue, vec![entry(10.0, Priority::Normal), entry(10.0, Priority::Normal)]).await;

		let first = queue.remove(&[ids[0]]).await;
		assert_eq!(first.len(), 1);
		assert_eq!(first[0].request.id, ids[0]);

		// Same ids again, plus one that never existed.
		let second = queue.remove(&[ids[0], RequestId::new_v4()]).await;
		assert!(second.is_empty());
		assert_eq!(queue.depth().await.total, 1);
	}

	#[tokio::test]
	async fn sweep_drains_only_expired_entries() {
		let queue = AdmissionQueue::new(10, 100);
		let now = Instant::now();
		let mut stale = entry(10.0, Priority::Normal);
		stale.request.deadline = now;
		let stale_id = stale.request.id;
		queue.enqueue(stale, now - Duration::from_millis(1)).await.unwrap();
		fill(&queue, vec![entry(10.0, Priority::Normal)]).await;

		let swept = queue.sweep_expired(now + Duration::from_millis(1)).await;
		assert_eq!(swept.len(), 1);
		assert_eq!(swept[0].request.id, stale_id);
		assert_eq!(queue.depth().await.total, 1);
	}

	#[tokio::test]
	async fn reinsert_restores_fifo_position() {
		let queue = AdmissionQueue::new(10, 100);
		let base = Instant::now();
		let mut entries = Vec::new();
		for i in 0..3 {
			let mut e = entry(10.0, Priority::Normal);
			e.request.enqueued_at = base + Duration::from_millis(i);
			entries.push(e);
		}
		let ids = fill(&queue, entries).await;

		let removed = queue.remove(&[ids[1]]).await;
		queue.reinsert(removed, Instant::now()).await;

		let picked = queue.peek_batchable(&gpu_profile(), 16, false, Instant::now()).await;
		let picked_ids: Vec<_> = picked.iter().map(|p| p.id).collect();
		assert_eq!(picked_ids, ids);
	}

	#[tokio::test]
	async fn reinsert_hands_back_expired_entries() {
		let queue = AdmissionQueue::new(10, 100);
		let mut stale = entry(10.0, Priority::Normal);
		stale.request.deadline = Instant::now();

		let expired = queue.reinsert(vec![stale], Instant::now() + Duration::from_millis(1)).await;
		assert_eq!(expired.len(), 1);
		assert_eq!(queue.depth().await.total, 0);
	}

	#[tokio::test]
	async fn reinsert_ignores_admission_capacity() {
		let queue = AdmissionQueue::new(1, 100);
		fill(&queue, vec![entry(10.0, Priority::Normal)]).await;

		let expired = queue.reinsert(vec![entry(10.0, Priority::Normal)], Instant::now()).await;
		assert!(expired.is_empty());
		assert_eq!(queue.depth().await.total, 2);
	}

	#[tokio::test]
	async fn backlog_attributes_cheapest_eligible_class() {
		let queue = AdmissionQueue::new(10, 100);
		let fleet = FleetProfile::default();
		// 60s fits the cpu class (cheapest), 200s only the gpu tiers
		// (spot is the cheaper of those), 700s exceeds every class.
		fill(&queue, vec![entry(60.0, Priority::Normal), entry(200.0, Priority::Normal), entry(700.0, Priority::Normal)]).await;

		let backlog = queue.backlog(&fleet).await;
		assert_eq!(backlog[&WorkerClass::Cpu].jobs, 1);
		assert_eq!(backlog[&WorkerClass::GpuSpot].jobs, 1);
		assert_eq!(backlog[&WorkerClass::Managed].jobs, 1);
		assert_eq!(backlog[&WorkerClass::GpuOnDemand].jobs, 0);
		assert!((backlog[&WorkerClass::Managed].audio_secs - 700.0).abs() < 1e-9);
	}

	#[tokio::test]
	async fn min_headroom_tracks_tightest_deadline() {
		let queue = AdmissionQueue::new(10, 100);
		assert!(queue.min_headroom(Instant::now()).await.is_none());

		let now = Instant::now();
		let mut tight = entry(10.0, Priority::Normal);
		tight.request.deadline = now + Duration::from_secs(2);
		let mut loose = entry(10.0, Priority::Normal);
		loose.request.deadline = now + Duration::from_secs(20);
		queue.enqueue(loose, now).await.unwrap();
		queue.enqueue(tight, now).await.unwrap();

		let headroom = queue.min_headroom(now).await.unwrap();
		assert!(headroom <= Duration::from_secs(2));
		assert!(headroom > Duration::from_secs(1));
	}

	#[tokio::test]
	async fn crossing_trigger_depth_fires_batch_signal() {
		let queue = AdmissionQueue::new(10, 2);
		fill(&queue, vec![entry(10.0, Priority::Normal), entry(10.0, Priority::Normal)]).await;

		// The permit is stored, so a waiter registered afterwards returns.
		tokio::time::timeout(Duration::from_millis(50), queue.batch_signal().notified())
			.await
			.expect("batch signal should have fired");
	}
}
