//! Bounded, coalescing progress queue between the orchestrator and the
//! streaming response.
//!
//! The writer never blocks: when the queue is at capacity, intermediate
//! `progress` frames are coalesced (the newest frame per stage/company
//! survives) while `skipped`, `reused`, `linked`, `company_complete`,
//! `complete`, and `error` are always enqueued.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use prospecting_common::ProgressEvent;

pub const DEFAULT_CAPACITY: usize = 256;

struct Shared {
    queue: Mutex<VecDeque<ProgressEvent>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

/// Create a progress channel. Single writer, single logical reader.
pub fn channel(capacity: usize) -> (ProgressSender, ProgressReceiver) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(VecDeque::new()),
        notify: Notify::new(),
        closed: AtomicBool::new(false),
        capacity: capacity.max(1),
    });
    (
        ProgressSender {
            shared: shared.clone(),
        },
        ProgressReceiver { shared },
    )
}

#[derive(Clone)]
pub struct ProgressSender {
    shared: Arc<Shared>,
}

impl ProgressSender {
    /// Enqueue an event without ever blocking the pipeline.
    pub fn emit(&self, event: ProgressEvent) {
        {
            let mut queue = self.shared.queue.lock().expect("progress queue lock");

            if event.is_coalescable() {
                // Replace an already-queued progress frame for the same
                // stage/company so the newest one survives.
                let key = event.coalesce_key().map(|(s, c)| (s, c.map(String::from)));
                if let Some(pos) = queue.iter().position(|e| {
                    e.is_coalescable()
                        && e.coalesce_key().map(|(s, c)| (s, c.map(String::from))) == key
                }) {
                    queue.remove(pos);
                } else if queue.len() >= self.shared.capacity {
                    // Full with nothing queued for this key: evict the
                    // oldest coalescable frame. With none evictable the
                    // new frame still goes in, so the last progress frame
                    // per stage always survives.
                    if let Some(pos) = queue.iter().position(|e| e.is_coalescable()) {
                        queue.remove(pos);
                    }
                }
            }

            queue.push_back(event);
        }
        self.shared.notify.notify_one();
    }

    /// Signal end-of-stream. Queued events remain readable.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

pub struct ProgressReceiver {
    shared: Arc<Shared>,
}

impl ProgressReceiver {
    fn try_pop(&self) -> Option<ProgressEvent> {
        self.shared
            .queue
            .lock()
            .expect("progress queue lock")
            .pop_front()
    }

    /// Next event in causal order, or `None` once the channel is closed
    /// and drained.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return self.try_pop();
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prospecting_common::RunSummary;
    use uuid::Uuid;

    #[tokio::test]
    async fn events_arrive_in_order() {
        let run = Uuid::new_v4();
        let (tx, mut rx) = channel(16);
        tx.emit(ProgressEvent::progress(run, 1, None, "one"));
        tx.emit(ProgressEvent::skipped(run, "Acme", "dup"));
        tx.emit(ProgressEvent::complete(run, RunSummary::default()));
        tx.close();

        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::Progress { .. })
        ));
        assert!(matches!(rx.recv().await, Some(ProgressEvent::Skipped { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(ProgressEvent::Complete { .. })
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn newer_progress_replaces_queued_frame_for_same_stage() {
        let run = Uuid::new_v4();
        let (tx, mut rx) = channel(16);
        tx.emit(ProgressEvent::progress(run, 3, Some("Acme"), "entering"));
        tx.emit(ProgressEvent::progress(run, 3, Some("Acme"), "leaving"));
        tx.close();

        match rx.recv().await {
            Some(ProgressEvent::Progress { message, .. }) => assert_eq!(message, "leaving"),
            other => panic!("expected Progress, got {other:?}"),
        }
        assert!(rx.recv().await.is_none(), "older frame was coalesced away");
    }

    #[tokio::test]
    async fn critical_events_survive_overflow() {
        let run = Uuid::new_v4();
        let (tx, mut rx) = channel(2);
        // Fill past capacity with critical events, then pile on progress.
        for i in 0..5 {
            tx.emit(ProgressEvent::skipped(run, &format!("c{i}"), "dup"));
        }
        for i in 0..10 {
            tx.emit(ProgressEvent::progress(run, 4, Some("Acme"), &format!("m{i}")));
        }
        tx.close();

        let mut skipped = 0;
        let mut progress_messages = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ProgressEvent::Skipped { .. } => skipped += 1,
                ProgressEvent::Progress { message, .. } => progress_messages.push(message),
                _ => {}
            }
        }
        assert_eq!(skipped, 5, "critical events are never dropped");
        assert_eq!(
            progress_messages,
            vec!["m9".to_string()],
            "only the last progress frame per stage survives overflow"
        );
    }

    #[tokio::test]
    async fn reader_wakes_on_late_emit() {
        let run = Uuid::new_v4();
        let (tx, mut rx) = channel(4);

        let reader = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.emit(ProgressEvent::skipped(run, "Acme", "dup"));

        let got = reader.await.unwrap();
        assert!(matches!(got, Some(ProgressEvent::Skipped { .. })));
    }
}
