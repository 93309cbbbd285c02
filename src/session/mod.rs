//! RTSP client session state machine.
//!
//! A session negotiates one RTSP URL through the standard command
//! sequence and then relays incoming access units until the stream ends:
//!
//! ```text
//! open               -> Describing
//! DESCRIBE ok        -> NegotiatingSubsessions  (per-subsession SETUP loop)
//! PLAY ok            -> Playing
//! all subsessions closed / duration guard / stop -> ShuttingDown
//! TEARDOWN sent      -> Closed                   (terminal)
//! ```
//!
//! Failure routing: DESCRIBE or PLAY failing is fatal and shuts the
//! session down; a single subsession failing to initiate or SETUP is
//! skipped and the rest of the stream still plays. A subsession ending
//! early (transport EOF or RTCP BYE) only ends the session once *all*
//! subsessions have ended.
//!
//! Every handler runs on the event-loop thread, strictly sequentially, so
//! the machine needs no internal locking; the only cross-thread pieces
//! are the state mirror and the relay directory, both behind
//! `parking_lot` locks.

pub mod subsession;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{Result, StreamError};
use crate::relay::{Frame, FrameRelay, RelayDirectory, SubsessionInfo};
use crate::runtime::{Scheduler, SessionEvent, TimerToken};
use crate::sink::SubsessionSink;
use crate::transport::{AbsoluteRange, MediaTransport, SubsessionDescriptor, SubsessionId};
pub use subsession::SubsessionHandle;

/// Extra delay added to the expected stream duration before the shutdown
/// guard fires, covering servers that deliver slightly long or signal
/// their end late.
pub const DURATION_SLOP: Duration = Duration::from_secs(2);

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created, DESCRIBE not yet sent.
    Init,
    /// DESCRIBE sent, waiting for the session description.
    Describing,
    /// Iterating subsessions: initiate + SETUP, one at a time, in
    /// description order.
    NegotiatingSubsessions,
    /// PLAY succeeded; media is flowing.
    Playing,
    /// Teardown in progress.
    ShuttingDown,
    /// Fully torn down. Terminal.
    Closed,
}

struct PendingSetup {
    id: SubsessionId,
    descriptor: SubsessionDescriptor,
    binding: crate::transport::TransportBinding,
}

/// State machine for one RTSP URL.
///
/// Owned and driven exclusively by the event-loop thread; observers on
/// other threads see progress through the shared state mirror and the
/// relay directory.
pub struct StreamSession {
    url: String,
    tag: String,
    stream_over_tcp: bool,
    transport: Box<dyn MediaTransport>,
    scheduler: Scheduler,
    state: Arc<RwLock<StreamState>>,
    directory: RelayDirectory,
    subsessions: Vec<SubsessionHandle>,
    /// Descriptors not yet negotiated, front = next.
    remaining: VecDeque<(SubsessionId, SubsessionDescriptor)>,
    /// The single SETUP currently awaiting completion.
    pending_setup: Option<PendingSetup>,
    absolute_range: Option<AbsoluteRange>,
    expected_duration: Option<Duration>,
    timer: Option<TimerToken>,
}

impl StreamSession {
    pub fn new(
        url: &str,
        tag: String,
        stream_over_tcp: bool,
        transport: Box<dyn MediaTransport>,
        scheduler: Scheduler,
        state: Arc<RwLock<StreamState>>,
        directory: RelayDirectory,
    ) -> Self {
        Self {
            url: url.to_string(),
            tag,
            stream_over_tcp,
            transport,
            scheduler,
            state,
            directory,
            subsessions: Vec::new(),
            remaining: VecDeque::new(),
            pending_setup: None,
            absolute_range: None,
            expected_duration: None,
            timer: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        *self.state.read()
    }

    /// Whether the session has fully torn down.
    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// Transition to a new lifecycle state.
    fn set_state(&self, next: StreamState) {
        let mut state = self.state.write();
        tracing::debug!(
            stream = %self.tag,
            old_state = ?*state,
            new_state = ?next,
            "state transition"
        );
        *state = next;
    }

    /// Send the initial DESCRIBE. Called once, on the event-loop thread,
    /// before the loop starts dispatching.
    pub fn start(&mut self) {
        self.transport.attach(self.scheduler.clone());
        tracing::info!(stream = %self.tag, url = %self.url, "opening stream");
        self.transport.send_describe(&self.url);
        self.set_state(StreamState::Describing);
    }

    /// Dispatch one event. Events arrive strictly sequentially.
    pub fn handle_event(&mut self, event: SessionEvent) {
        if self.is_closed() {
            tracing::debug!(stream = %self.tag, event = ?event, "event after close ignored");
            return;
        }
        match event {
            SessionEvent::DescribeComplete(result) => self.on_describe_complete(result),
            SessionEvent::SetupComplete(id, result) => self.on_setup_complete(id, result),
            SessionEvent::PlayComplete(result) => self.on_play_complete(result),
            SessionEvent::FrameReady(id, frame) => self.on_frame_ready(id, frame),
            SessionEvent::SourceClosed(id) => self.on_subsession_ended(id),
            SessionEvent::ByeReceived(id) => {
                if let Some(sub) = self.subsessions.iter().find(|s| s.id == id) {
                    tracing::info!(
                        stream = %self.tag,
                        subsession = %sub.descriptor.label(),
                        "received RTCP BYE"
                    );
                }
                self.on_subsession_ended(id);
            }
            SessionEvent::TimerExpired(token) => self.on_timer_expired(token),
            SessionEvent::Stop => self.shutdown("stop requested"),
        }
    }

    fn on_describe_complete(&mut self, result: Result<String>) {
        if self.state() != StreamState::Describing {
            tracing::warn!(stream = %self.tag, state = ?self.state(), "unexpected DESCRIBE completion");
            return;
        }
        let sdp = match result {
            Ok(sdp) => sdp,
            Err(e) => {
                tracing::warn!(stream = %self.tag, error = %e, "failed to get a session description");
                self.shutdown("DESCRIBE failed");
                return;
            }
        };
        tracing::debug!(stream = %self.tag, bytes = sdp.len(), "got session description");

        let description = match self.transport.parse_description(&sdp) {
            Ok(description) => description,
            Err(e) => {
                tracing::warn!(stream = %self.tag, error = %e, "failed to parse the session description");
                self.shutdown("unparseable description");
                return;
            }
        };
        if description.subsessions.is_empty() {
            tracing::warn!(stream = %self.tag, error = %StreamError::NoSubsessions, "rejecting description");
            self.shutdown("no subsessions");
            return;
        }

        self.expected_duration = description.expected_duration();
        self.absolute_range = description.absolute_range;
        self.remaining = description
            .subsessions
            .into_iter()
            .enumerate()
            .map(|(index, descriptor)| (SubsessionId(index), descriptor))
            .collect();
        tracing::info!(
            stream = %self.tag,
            subsessions = self.remaining.len(),
            "description parsed, negotiating subsessions"
        );
        self.set_state(StreamState::NegotiatingSubsessions);
        self.setup_next_subsession();
    }

    /// Advance the SETUP iteration: initiate descriptors in order until
    /// one succeeds and its SETUP is in flight, skipping failures. Once
    /// every descriptor has been processed, issue PLAY.
    fn setup_next_subsession(&mut self) {
        while let Some((id, descriptor)) = self.remaining.pop_front() {
            match self
                .transport
                .initiate_subsession(id, &descriptor, self.stream_over_tcp)
            {
                Err(e) => {
                    tracing::warn!(
                        stream = %self.tag,
                        subsession = %descriptor.label(),
                        error = %e,
                        "failed to initiate subsession, skipping"
                    );
                }
                Ok(binding) => {
                    if binding.rtcp_muxed {
                        tracing::debug!(
                            stream = %self.tag,
                            subsession = %descriptor.label(),
                            client_port = binding.client_rtp_port,
                            "initiated subsession"
                        );
                    } else {
                        tracing::debug!(
                            stream = %self.tag,
                            subsession = %descriptor.label(),
                            client_ports = %format_args!(
                                "{}-{}",
                                binding.client_rtp_port, binding.client_rtcp_port
                            ),
                            "initiated subsession"
                        );
                    }
                    self.transport.send_setup(id, &binding);
                    self.pending_setup = Some(PendingSetup {
                        id,
                        descriptor,
                        binding,
                    });
                    return;
                }
            }
        }

        // Every subsession has been processed; start the stream.
        if let Some(range) = &self.absolute_range {
            tracing::info!(
                stream = %self.tag,
                start = %range.start,
                "sending PLAY with absolute bounds"
            );
        } else if let Some(duration) = self.expected_duration {
            tracing::info!(
                stream = %self.tag,
                duration_secs = duration.as_secs_f64(),
                "sending PLAY"
            );
        } else {
            tracing::info!(stream = %self.tag, "sending PLAY (unbounded)");
        }
        let range = self.absolute_range.clone();
        self.transport.send_play(range.as_ref());
    }

    fn on_setup_complete(&mut self, id: SubsessionId, result: Result<()>) {
        if self.state() != StreamState::NegotiatingSubsessions {
            tracing::warn!(
                stream = %self.tag,
                subsession = %id,
                state = ?self.state(),
                "unexpected SETUP completion"
            );
            return;
        }
        let Some(pending) = self.pending_setup.take() else {
            tracing::warn!(stream = %self.tag, subsession = %id, "SETUP completion with none in flight");
            return;
        };
        if pending.id != id {
            tracing::warn!(
                stream = %self.tag,
                expected = %pending.id,
                got = %id,
                "SETUP completion for the wrong subsession, skipping it"
            );
            self.setup_next_subsession();
            return;
        }

        match result {
            Err(e) => {
                tracing::warn!(
                    stream = %self.tag,
                    subsession = %pending.descriptor.label(),
                    error = %e,
                    "failed to set up subsession, skipping"
                );
            }
            Ok(()) => {
                let label = pending.descriptor.label();
                let relay = Arc::new(FrameRelay::new());
                self.directory.register(
                    SubsessionInfo {
                        id,
                        medium: pending.descriptor.medium.clone(),
                        codec: pending.descriptor.codec.clone(),
                    },
                    relay.clone(),
                );
                let sink = SubsessionSink::new(id, self.tag.clone(), label.clone(), relay.clone());
                self.subsessions.push(SubsessionHandle::new(
                    id,
                    pending.descriptor,
                    pending.binding,
                    relay,
                    sink,
                ));
                tracing::info!(stream = %self.tag, subsession = %label, "subsession set up, reading frames");
                self.transport.request_frame(id);
            }
        }
        self.setup_next_subsession();
    }

    fn on_play_complete(&mut self, result: Result<()>) {
        if self.state() != StreamState::NegotiatingSubsessions {
            tracing::warn!(stream = %self.tag, state = ?self.state(), "unexpected PLAY completion");
            return;
        }
        if let Err(e) = result {
            tracing::warn!(stream = %self.tag, error = %e, "failed to start playing");
            self.shutdown("PLAY failed");
            return;
        }

        self.set_state(StreamState::Playing);
        match self.expected_duration {
            Some(duration) => {
                // Guard against servers that never send a BYE: force a
                // shutdown shortly after the stream should have ended.
                let guard = duration + DURATION_SLOP;
                self.timer = Some(self.scheduler.schedule(guard));
                tracing::info!(
                    stream = %self.tag,
                    up_to_secs = guard.as_secs_f64(),
                    "started playing"
                );
            }
            None => tracing::info!(stream = %self.tag, "started playing"),
        }
    }

    fn on_frame_ready(&mut self, id: SubsessionId, frame: Frame) {
        if matches!(
            self.state(),
            StreamState::ShuttingDown | StreamState::Closed
        ) {
            return;
        }
        let advertised = self.transport.parameter_set(id);
        let Some(sub) = self.subsessions.iter_mut().find(|s| s.id == id) else {
            tracing::debug!(stream = %self.tag, subsession = %id, "frame for unknown subsession dropped");
            return;
        };
        let Some(sink) = sub.sink_mut() else {
            tracing::debug!(stream = %self.tag, subsession = %id, "frame after close dropped");
            return;
        };
        sink.on_frame_ready(frame, advertised);
        // Continuous pull: go straight back for the next access unit.
        self.transport.request_frame(id);
    }

    /// A subsession's stream ended (transport EOF or BYE). Ends the whole
    /// session only once every subsession has ended.
    fn on_subsession_ended(&mut self, id: SubsessionId) {
        let Some(sub) = self.subsessions.iter_mut().find(|s| s.id == id) else {
            tracing::debug!(stream = %self.tag, subsession = %id, "end of stream for unknown subsession");
            return;
        };
        let label = sub.descriptor.label();
        let Some(sink) = sub.close() else {
            return;
        };
        tracing::info!(
            stream = %self.tag,
            subsession = %label,
            frames = sink.frames_received(),
            "subsession stream ended"
        );

        if self.subsessions.iter().all(|s| !s.is_open()) {
            tracing::info!(stream = %self.tag, "all subsessions ended");
            self.shutdown("all subsessions closed");
        }
    }

    fn on_timer_expired(&mut self, token: TimerToken) {
        if self.timer != Some(token) {
            tracing::debug!(stream = %self.tag, "stale timer ignored");
            return;
        }
        self.timer = None;
        tracing::info!(stream = %self.tag, "expected duration elapsed without end-of-stream");
        self.shutdown("duration guard fired");
    }

    /// Tear the session down. Idempotent: the second and later calls are
    /// no-ops.
    ///
    /// Cancels the duration guard, stops every still-open sink and
    /// detaches its end-of-stream delivery (so a BYE arriving during
    /// teardown is not handled twice), and issues a single TEARDOWN —
    /// without waiting for its response — if at least one subsession was
    /// active.
    pub fn shutdown(&mut self, reason: &str) {
        if self.is_closed() {
            return;
        }
        self.set_state(StreamState::ShuttingDown);
        tracing::info!(stream = %self.tag, reason, "shutting down stream");

        if let Some(token) = self.timer.take() {
            self.scheduler.cancel(token);
            tracing::debug!(stream = %self.tag, "duration guard cancelled");
        }

        let mut active: Vec<SubsessionId> = Vec::new();
        for sub in &mut self.subsessions {
            if let Some(sink) = sub.close() {
                tracing::debug!(
                    stream = %self.tag,
                    subsession = %sub.descriptor.label(),
                    frames = sink.frames_received(),
                    "sink stopped"
                );
                active.push(sub.id);
            }
        }
        for id in &active {
            self.transport.detach(*id);
        }
        if !active.is_empty() {
            tracing::debug!(stream = %self.tag, "sending TEARDOWN");
            self.transport.send_teardown();
        }

        tracing::info!(stream = %self.tag, "stream closed");
        self.set_state(StreamState::Closed);
    }
}
