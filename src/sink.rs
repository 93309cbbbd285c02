//! Per-subsession data sink.
//!
//! A sink owns the publish step of the receive path: copy the access unit
//! into the subsession's [`FrameRelay`], refresh the parameter-set cache
//! when the advertisement changed, and keep per-stream counters for
//! diagnostics. The continuous pull (re-requesting the next frame after
//! each publish) is driven by the session state machine, which owns the
//! transport.

use std::sync::Arc;

use bytes::Bytes;

use crate::relay::{Frame, FrameRelay};
use crate::transport::SubsessionId;

/// Publishes one subsession's frames into its [`FrameRelay`].
///
/// Data content never fails a sink: zero-length payloads and truncated
/// frames are published as-is, with the truncated byte count travelling
/// inside the frame. Only source closure ends a sink, and that is the
/// session's decision (it drops the sink, which is the liveness flag).
pub struct SubsessionSink {
    id: SubsessionId,
    stream: String,
    label: String,
    relay: Arc<FrameRelay>,
    frames: u64,
}

impl SubsessionSink {
    pub fn new(id: SubsessionId, stream: String, label: String, relay: Arc<FrameRelay>) -> Self {
        tracing::debug!(stream = %stream, subsession = %id, codec = %label, "sink created");
        Self {
            id,
            stream,
            label,
            relay,
            frames: 0,
        }
    }

    /// Publish a received access unit (latest-frame-wins), refreshing the
    /// parameter-set cache first when a differing advertisement is
    /// present.
    pub fn on_frame_ready(&mut self, frame: Frame, advertised: Option<Bytes>) {
        self.frames += 1;
        tracing::trace!(
            stream = %self.stream,
            subsession = %self.id,
            codec = %self.label,
            bytes = frame.payload.len(),
            truncated = frame.truncated_bytes,
            pts_us = frame.presentation_time_us,
            "frame received"
        );

        if let Some(advertised) = advertised
            && self.relay.offer_parameter_set(&advertised)
        {
            tracing::debug!(
                stream = %self.stream,
                subsession = %self.id,
                bytes = advertised.len(),
                "parameter set updated"
            );
        }

        self.relay.publish(frame);
    }

    /// Frames published so far.
    pub fn frames_received(&self) -> u64 {
        self.frames
    }
}
