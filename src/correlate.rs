//! Correlation of replies and background jobs to their originating commands
//!
//! Two structures exist per connection:
//!
//! - [`PendingReplies`]: a FIFO of one-shot reply slots. ESL sends replies in
//!   the order the commands were written on one socket, so the oldest
//!   un-replied slot always matches the incoming frame. Slots are enqueued
//!   inside the same critical section that writes the command, which is what
//!   makes the FIFO match wire order.
//! - [`JobRegistry`]: `Job-UUID → one-shot event slot` for `bgapi` jobs.
//!   Insertion happens only after the synchronous reply yields the UUID.
//!
//! Completion is at-most-once by construction (oneshot channels). A caller
//! that times out simply drops its receiver; the slot stays queued so the
//! late reply pops *it* and not a younger command's slot (no FIFO skew).

use crate::{
    error::{EslError, EslResult},
    event::EslEvent,
    message::EslMessage,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Outcome of matching an inbound reply frame against the FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyOutcome {
    /// Head slot was live and received the frame.
    Delivered,
    /// Head slot's caller had given up (timeout or cancel); frame dropped.
    LateDropped,
    /// Nothing was pending; frame dropped.
    NonePending,
}

/// FIFO of pending synchronous-reply slots.
pub(crate) struct PendingReplies {
    queue: Mutex<VecDeque<oneshot::Sender<EslMessage>>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Reserve the next reply slot. Must be called inside the writer critical
    /// section, before the command bytes hit the socket.
    pub fn enqueue(&self) -> oneshot::Receiver<EslMessage> {
        let (tx, rx) = oneshot::channel();
        self.queue.lock().expect("reply queue poisoned").push_back(tx);
        rx
    }

    /// Roll back the most recent [`enqueue`](Self::enqueue) after a failed
    /// write, so the slot never waits for a reply that was never requested.
    pub fn abandon_newest(&self) {
        self.queue.lock().expect("reply queue poisoned").pop_back();
    }

    /// Complete the oldest pending slot with the inbound frame.
    pub fn complete_next(&self, message: EslMessage) -> ReplyOutcome {
        let slot = self.queue.lock().expect("reply queue poisoned").pop_front();
        match slot {
            Some(tx) => match tx.send(message) {
                Ok(()) => ReplyOutcome::Delivered,
                Err(_) => ReplyOutcome::LateDropped,
            },
            None => ReplyOutcome::NonePending,
        }
    }

    /// Drop every pending slot; waiting callers observe `ConnectionClosed`.
    pub fn fail_all(&self) {
        self.queue.lock().expect("reply queue poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().expect("reply queue poisoned").len()
    }
}

struct PendingJob {
    tx: oneshot::Sender<EslEvent>,
    deadline: Instant,
}

impl PendingJob {
    fn is_dead(&self, now: Instant) -> bool {
        self.tx.is_closed() || self.deadline <= now
    }
}

/// Keyed registry of pending `bgapi` jobs.
///
/// Every entry carries a deadline so an abandoned job cannot leak; dead
/// entries are swept on each insertion and completion.
pub(crate) struct JobRegistry {
    jobs: Mutex<HashMap<String, PendingJob>>,
    entry_ttl: Duration,
}

impl JobRegistry {
    pub fn new(entry_ttl: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            entry_ttl,
        }
    }

    /// Register a job after its `bgapi` reply yielded a `Job-UUID`.
    ///
    /// FreeSWITCH guarantees UUID uniqueness across live jobs; a duplicate
    /// still in flight fails the *new* registration.
    pub fn register(&self, job_uuid: &str) -> EslResult<oneshot::Receiver<EslEvent>> {
        let now = Instant::now();
        let mut jobs = self.jobs.lock().expect("job registry poisoned");
        jobs.retain(|_, job| !job.is_dead(now));

        if jobs.contains_key(job_uuid) {
            return Err(EslError::DuplicateJobId {
                job_uuid: job_uuid.to_string(),
            });
        }

        let (tx, rx) = oneshot::channel();
        jobs.insert(
            job_uuid.to_string(),
            PendingJob {
                tx,
                deadline: now + self.entry_ttl,
            },
        );
        Ok(rx)
    }

    /// Complete the job matching a `BACKGROUND_JOB` event.
    ///
    /// Returns `None` when the event was consumed: a live waiter received it,
    /// or the waiter had been cancelled (the event is then dropped silently).
    /// Returns the event back when no such job is registered — e.g. the idle
    /// probe's phantom job — so the caller can forward it to the listener.
    pub fn complete(&self, job_uuid: &str, event: EslEvent) -> Option<EslEvent> {
        let job = {
            let mut jobs = self.jobs.lock().expect("job registry poisoned");
            jobs.remove(job_uuid)
        };
        match job {
            Some(job) => {
                // send() hands the event back if the waiter is gone; a
                // cancelled call's late completion is dropped, not forwarded.
                let _ = job.tx.send(event);
                None
            }
            None => Some(event),
        }
    }

    /// Drop every pending job; waiting callers observe `ConnectionClosed`.
    pub fn fail_all(&self) {
        self.jobs.lock().expect("job registry poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("job registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentType, HeaderMap};

    fn reply(body: &str) -> EslMessage {
        EslMessage::new(
            ContentType::ApiResponse,
            HeaderMap::new(),
            Some(body.to_string()),
        )
    }

    fn job_event(uuid: &str) -> EslEvent {
        let mut event = EslEvent::with_type(crate::event::EslEventType::BackgroundJob);
        event.set_header("Job-UUID", uuid);
        event
    }

    #[tokio::test]
    async fn replies_resolve_in_submission_order() {
        let replies = PendingReplies::new();
        let rx_a = replies.enqueue();
        let rx_b = replies.enqueue();

        assert_eq!(replies.complete_next(reply("a")), ReplyOutcome::Delivered);
        assert_eq!(replies.complete_next(reply("b")), ReplyOutcome::Delivered);

        assert_eq!(rx_a.await.unwrap().body(), Some("a"));
        assert_eq!(rx_b.await.unwrap().body(), Some("b"));
    }

    #[tokio::test]
    async fn abandoned_slot_swallows_late_reply_without_skew() {
        let replies = PendingReplies::new();
        let rx_timed_out = replies.enqueue();
        drop(rx_timed_out); // caller timed out
        let rx_next = replies.enqueue();

        // Late reply for the abandoned call pops the tombstone…
        assert_eq!(replies.complete_next(reply("late")), ReplyOutcome::LateDropped);
        // …so the next reply still reaches the right caller.
        assert_eq!(replies.complete_next(reply("fresh")), ReplyOutcome::Delivered);
        assert_eq!(rx_next.await.unwrap().body(), Some("fresh"));
    }

    #[tokio::test]
    async fn reply_with_nothing_pending_is_reported() {
        let replies = PendingReplies::new();
        assert_eq!(replies.complete_next(reply("x")), ReplyOutcome::NonePending);
    }

    #[tokio::test]
    async fn abandon_newest_rolls_back_failed_write() {
        let replies = PendingReplies::new();
        let rx_live = replies.enqueue();
        let _rx_failed = replies.enqueue();
        replies.abandon_newest();
        assert_eq!(replies.len(), 1);

        assert_eq!(replies.complete_next(reply("only")), ReplyOutcome::Delivered);
        assert_eq!(rx_live.await.unwrap().body(), Some("only"));
    }

    #[tokio::test]
    async fn fail_all_completes_every_waiter_exactly_once() {
        let replies = PendingReplies::new();
        let rx_a = replies.enqueue();
        let rx_b = replies.enqueue();
        replies.fail_all();
        assert_eq!(replies.len(), 0);

        assert!(rx_a.await.is_err());
        assert!(rx_b.await.is_err());
    }

    #[tokio::test]
    async fn job_completes_by_uuid() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let rx = registry.register("job-1").unwrap();

        assert!(registry.complete("job-1", job_event("job-1")).is_none());
        let event = rx.await.unwrap();
        assert_eq!(event.job_uuid().as_deref(), Some("job-1"));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn unknown_job_is_handed_back() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let returned = registry.complete("phantom", job_event("phantom"));
        assert_eq!(
            returned.unwrap().job_uuid().as_deref(),
            Some("phantom")
        );
    }

    #[tokio::test]
    async fn cancelled_job_completion_dropped_silently() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let rx = registry.register("job-1").unwrap();
        drop(rx);

        // Waiter gone: the event is consumed, not forwarded
        assert!(registry.complete("job-1", job_event("job-1")).is_none());
    }

    #[tokio::test]
    async fn duplicate_live_job_rejected() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let _rx = registry.register("job-1").unwrap();

        let err = registry.register("job-1").unwrap_err();
        assert!(matches!(err, EslError::DuplicateJobId { ref job_uuid } if job_uuid == "job-1"));
    }

    #[tokio::test]
    async fn abandoned_job_slot_is_swept_on_reinsert() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let rx = registry.register("job-1").unwrap();
        drop(rx);

        // Dead entry must not block re-registration
        let _rx2 = registry.register("job-1").unwrap();
    }

    #[tokio::test]
    async fn expired_job_slot_is_swept() {
        tokio::time::pause();
        let registry = JobRegistry::new(Duration::from_millis(10));
        let _rx = registry.register("job-1").unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;
        // Expired entry is swept by the next registration
        let _rx2 = registry.register("job-2").unwrap();
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn job_fail_all_completes_waiters() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let rx = registry.register("job-1").unwrap();
        registry.fail_all();
        assert!(rx.await.is_err());
    }
}
