//! The media-transport seam.
//!
//! Everything protocol-mechanical — SDP parsing, RTP/RTCP depacketization,
//! port allocation, socket I/O — lives behind the [`MediaTransport`]
//! trait. The state machine in [`crate::session`] only sequences commands
//! and reacts to their completions; a trait implementation does the wire
//! work and reports back by posting
//! [`SessionEvent`](crate::runtime::SessionEvent)s to the
//! [`Scheduler`](crate::runtime::Scheduler) it was attached to.
//!
//! Command methods (`send_*`) are non-blocking: they return immediately
//! and the outcome arrives later on the event-loop thread. The remaining
//! methods are synchronous and are only ever called from that same
//! thread, so implementations need no internal locking for them.

use std::time::Duration;

use bytes::Bytes;

use crate::error::Result;
use crate::runtime::Scheduler;

/// Index of a subsession within its session, in description order.
///
/// Assigned when the session description is parsed, fixed for the life of
/// the session, and carried through every event and trait call so that
/// callbacks never need a back-pointer to the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubsessionId(pub usize);

impl std::fmt::Display for SubsessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One media substream advertised by the session description.
#[derive(Debug, Clone)]
pub struct SubsessionDescriptor {
    /// Medium name from the `m=` line (e.g. `"video"`, `"audio"`).
    pub medium: String,
    /// Codec name (e.g. `"H264"`).
    pub codec: String,
    /// Track control URL used by SETUP, when the description carries one.
    pub control: Option<String>,
}

impl SubsessionDescriptor {
    /// `medium/codec` label used in diagnostics (e.g. `"video/H264"`).
    pub fn label(&self) -> String {
        format!("{}/{}", self.medium, self.codec)
    }
}

/// Receive-transport parameters negotiated when a subsession is initiated.
#[derive(Debug, Clone)]
pub struct TransportBinding {
    /// Client-side RTP receive port.
    pub client_rtp_port: u16,
    /// Client-side RTCP port (`client_rtp_port + 1` unless muxed).
    pub client_rtcp_port: u16,
    /// Whether RTCP is multiplexed onto the RTP port.
    pub rtcp_muxed: bool,
}

/// Absolute clock bounds for streams indexed by wall-clock time.
///
/// When a description carries these, PLAY is issued with them instead of
/// a normal-play-time range.
#[derive(Debug, Clone)]
pub struct AbsoluteRange {
    pub start: String,
    pub end: Option<String>,
}

/// A parsed session description.
#[derive(Debug, Clone)]
pub struct SessionDescription {
    /// Subsessions in description order. The order becomes the
    /// [`SubsessionId`] numbering and never changes afterwards.
    pub subsessions: Vec<SubsessionDescriptor>,
    /// Present when the stream is indexed by absolute time.
    pub absolute_range: Option<AbsoluteRange>,
    /// Play-time start bound in seconds (0.0 when unbounded).
    pub play_start_secs: f64,
    /// Play-time end bound in seconds (0.0 when unbounded/live).
    pub play_end_secs: f64,
}

impl SessionDescription {
    /// Expected playback duration, when the description bounds it.
    ///
    /// `None` for live/unbounded streams and for absolute-time streams
    /// (those are played with explicit bounds instead of a duration).
    pub fn expected_duration(&self) -> Option<Duration> {
        if self.absolute_range.is_some() {
            return None;
        }
        let secs = self.play_end_secs - self.play_start_secs;
        (secs > 0.0).then(|| Duration::from_secs_f64(secs))
    }
}

/// External media-transport collaborator.
///
/// Implementations own the RTSP connection and the per-subsession RTP
/// receive path. Asynchronous completions and stream notifications are
/// delivered by posting events to the attached scheduler; they are then
/// dispatched strictly sequentially on the event-loop thread.
pub trait MediaTransport: Send {
    /// Bind the delivery channel. Called once, on the event-loop thread,
    /// before any other method.
    fn attach(&mut self, events: Scheduler);

    /// Issue DESCRIBE for `url`. Completion:
    /// [`SessionEvent::DescribeComplete`](crate::runtime::SessionEvent::DescribeComplete)
    /// carrying the raw description text or the failure.
    fn send_describe(&mut self, url: &str);

    /// Parse a session description previously returned by DESCRIBE.
    fn parse_description(&mut self, sdp: &str) -> Result<SessionDescription>;

    /// Create the receive transport for one subsession (sockets, ports).
    ///
    /// Failures here are per-subsession: the caller skips the subsession
    /// and moves on to the next one.
    fn initiate_subsession(
        &mut self,
        id: SubsessionId,
        descriptor: &SubsessionDescriptor,
        over_tcp: bool,
    ) -> Result<TransportBinding>;

    /// Issue SETUP for an initiated subsession. Completion:
    /// [`SessionEvent::SetupComplete`](crate::runtime::SessionEvent::SetupComplete)
    /// for the same id.
    fn send_setup(&mut self, id: SubsessionId, binding: &TransportBinding);

    /// Issue PLAY, with absolute bounds when `range` is given. Completion:
    /// [`SessionEvent::PlayComplete`](crate::runtime::SessionEvent::PlayComplete).
    fn send_play(&mut self, range: Option<&AbsoluteRange>);

    /// Issue TEARDOWN. Fire-and-forget: no completion is delivered and
    /// none is awaited.
    fn send_teardown(&mut self);

    /// Request the next access unit for a subsession. At most one
    /// [`SessionEvent::FrameReady`](crate::runtime::SessionEvent::FrameReady)
    /// is delivered per request; end of stream is signalled instead with
    /// [`SessionEvent::SourceClosed`](crate::runtime::SessionEvent::SourceClosed)
    /// (or [`SessionEvent::ByeReceived`](crate::runtime::SessionEvent::ByeReceived)
    /// for an explicit RTCP BYE), after which further requests deliver
    /// nothing.
    fn request_frame(&mut self, id: SubsessionId);

    /// The currently advertised out-of-band parameter set for a
    /// subsession, as opaque bytes.
    ///
    /// `None` when the subsession has no complete advertisement; the
    /// caller then keeps whatever it cached last.
    fn parameter_set(&self, id: SubsessionId) -> Option<Bytes>;

    /// Stop frame delivery and end-of-stream notifications for a
    /// subsession. Called during teardown so that a BYE racing the
    /// shutdown is not delivered into a half-destroyed session.
    fn detach(&mut self, id: SubsessionId);
}
