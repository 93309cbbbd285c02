//! Event loop host: the single cooperative scheduler of a session.
//!
//! All RTSP response completions, frame notifications, and timers are
//! funnelled through one [`Scheduler`] and dispatched by [`EventLoop::run`]
//! on a single thread, one event at a time. Within that thread nothing
//! ever runs concurrently, so the state machine needs no locking between
//! its steps; the stop flag is checked between dispatches and teardown
//! always runs on the loop thread, no matter which thread requested it.
//!
//! Timers are kept next to the event queue and fire on the same thread,
//! so a timer callback can never race a negotiation callback. Queued
//! events are dispatched before due timers — a completion already in
//! flight wins over a timer due at the same instant.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::relay::Frame;
use crate::session::StreamSession;
use crate::transport::SubsessionId;

/// Token identifying a scheduled delayed task, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(u64);

/// Events dispatched on the event-loop thread.
///
/// Transports post command completions and stream notifications; the
/// scheduler itself posts [`TimerExpired`](Self::TimerExpired) for
/// delayed tasks; [`Stop`](Self::Stop) requests an orderly shutdown.
#[derive(Debug)]
pub enum SessionEvent {
    /// DESCRIBE completed, carrying the raw session description text.
    DescribeComplete(Result<String>),
    /// SETUP completed for one subsession.
    SetupComplete(SubsessionId, Result<()>),
    /// PLAY completed.
    PlayComplete(Result<()>),
    /// A requested access unit arrived.
    FrameReady(SubsessionId, Frame),
    /// The transport reached end of stream for a subsession.
    SourceClosed(SubsessionId),
    /// An explicit RTCP BYE arrived for a subsession.
    ByeReceived(SubsessionId),
    /// A delayed task scheduled via [`Scheduler::schedule`] fired.
    TimerExpired(TimerToken),
    /// External stop request; teardown runs on the loop thread.
    Stop,
}

struct TimerEntry {
    token: TimerToken,
    deadline: Instant,
}

#[derive(Default)]
struct Queue {
    events: VecDeque<SessionEvent>,
    timers: Vec<TimerEntry>,
    next_token: u64,
}

struct Shared {
    queue: Mutex<Queue>,
    ready: Condvar,
    stop: AtomicBool,
}

/// Cloneable handle for posting events and scheduling delayed tasks.
///
/// Safe to use from any thread. Events are dispatched in FIFO order on
/// the event-loop thread.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::default()),
                ready: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue an event for dispatch.
    pub fn post(&self, event: SessionEvent) {
        self.shared.queue.lock().events.push_back(event);
        self.shared.ready.notify_one();
    }

    /// Schedule a [`SessionEvent::TimerExpired`] to fire after `delay`.
    pub fn schedule(&self, delay: Duration) -> TimerToken {
        let mut queue = self.shared.queue.lock();
        queue.next_token += 1;
        let token = TimerToken(queue.next_token);
        queue.timers.push(TimerEntry {
            token,
            deadline: Instant::now() + delay,
        });
        drop(queue);
        self.shared.ready.notify_one();
        token
    }

    /// Cancel a scheduled task. Returns `false` when it already fired or
    /// was cancelled before.
    pub fn cancel(&self, token: TimerToken) -> bool {
        let mut queue = self.shared.queue.lock();
        let before = queue.timers.len();
        queue.timers.retain(|entry| entry.token != token);
        queue.timers.len() != before
    }

    /// Request the event loop to stop. Idempotent; safe from any thread.
    ///
    /// The loop observes the flag between dispatches and runs teardown on
    /// its own thread.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        // Taking the lock orders the store against a waiter that checked
        // the flag and is about to park.
        let _queue = self.shared.queue.lock();
        self.shared.ready.notify_one();
    }

    /// Whether a stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    /// Block until the next event is ready, or return `None` once a stop
    /// has been requested.
    fn wait_next(&self) -> Option<SessionEvent> {
        let mut queue = self.shared.queue.lock();
        loop {
            if self.stop_requested() {
                return None;
            }
            if let Some(event) = queue.events.pop_front() {
                return Some(event);
            }

            let now = Instant::now();
            let due = queue
                .timers
                .iter()
                .enumerate()
                .filter(|(_, entry)| entry.deadline <= now)
                .min_by_key(|(_, entry)| entry.deadline)
                .map(|(index, _)| index);
            if let Some(index) = due {
                let entry = queue.timers.remove(index);
                return Some(SessionEvent::TimerExpired(entry.token));
            }

            match queue.timers.iter().map(|entry| entry.deadline).min() {
                Some(deadline) => {
                    let _ = self.shared.ready.wait_until(&mut queue, deadline);
                }
                None => self.shared.ready.wait(&mut queue),
            }
        }
    }
}

/// Runs one session's event loop on the current thread.
pub struct EventLoop {
    scheduler: Scheduler,
}

impl EventLoop {
    pub fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
        }
    }

    /// Handle used by the transport and by other threads to reach this
    /// loop.
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Drive `session` until it reaches
    /// [`StreamState::Closed`](crate::session::StreamState::Closed).
    ///
    /// Dispatches one event at a time; the stop flag is honoured between
    /// dispatches and teardown always runs here, on the calling thread.
    pub fn run(&self, session: &mut StreamSession) {
        loop {
            if session.is_closed() {
                break;
            }
            if self.scheduler.stop_requested() {
                session.shutdown("stop requested");
                break;
            }
            if let Some(event) = self.scheduler.wait_next() {
                session.handle_event(event);
            }
        }
        tracing::debug!("event loop exited");
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
