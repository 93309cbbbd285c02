//! Single-slot frame relay between the receiving thread and a consumer.
//!
//! Each negotiated subsession gets one [`FrameRelay`]: a mutex-protected
//! slot holding the most recent access unit and the most recent
//! out-of-band parameter set. The event-loop thread writes (latest frame
//! wins, unread frames are silently replaced); consumers on any thread
//! read copies out. Both sides only ever copy inside the critical
//! section — no I/O, no blocking calls — so contention stays negligible
//! and neither side can stall the other.
//!
//! Payloads are [`Bytes`], so a "copy" out of the slot is a cheap
//! reference-count bump and a reader's in-flight copy stays valid while
//! the writer replaces the slot behind it.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use crate::transport::SubsessionId;

/// One received access unit with its timing metadata.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Opaque access-unit payload. May be empty.
    pub payload: Bytes,
    /// Bytes the transport had to drop because its receive buffer was too
    /// small. Truncation is reported as data, not as an error.
    pub truncated_bytes: u32,
    /// Presentation time in microseconds.
    pub presentation_time_us: i64,
    /// Expected duration of this access unit in microseconds.
    pub duration_us: u32,
}

#[derive(Default)]
struct RelaySlot {
    frame: Option<Frame>,
    parameter_set: Option<Bytes>,
}

/// Single-slot buffer shared between one writer and any number of readers.
///
/// Readers observe either the fully-formed previous frame or the
/// fully-formed new one, never a partial write: the slot is only ever
/// replaced wholesale under the lock.
#[derive(Default)]
pub struct FrameRelay {
    slot: Mutex<RelaySlot>,
}

impl FrameRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a frame, replacing any unread previous frame.
    pub fn publish(&self, frame: Frame) {
        self.slot.lock().frame = Some(frame);
    }

    /// Replace the cached parameter set when the advertised one differs.
    ///
    /// Returns `true` when the cache changed. The cache persists until
    /// replaced — a frame that carries no new advertisement leaves the
    /// previous set valid.
    pub fn offer_parameter_set(&self, advertised: &Bytes) -> bool {
        let mut slot = self.slot.lock();
        match &slot.parameter_set {
            Some(current) if current == advertised => false,
            _ => {
                slot.parameter_set = Some(advertised.clone());
                true
            }
        }
    }

    /// Copy of the current frame, or `None` before the first publish.
    ///
    /// Non-destructive: repeated reads before the next publish return the
    /// same frame, so a slow consumer never misses the latest one.
    pub fn latest_frame(&self) -> Option<Frame> {
        self.slot.lock().frame.clone()
    }

    /// Copy of the cached parameter set, or `None` if none has ever been
    /// negotiated. Never mutates the cache.
    pub fn parameter_set(&self) -> Option<Bytes> {
        self.slot.lock().parameter_set.clone()
    }
}

/// Identity of a negotiated subsession, as exposed to consumers.
#[derive(Debug, Clone)]
pub struct SubsessionInfo {
    pub id: SubsessionId,
    pub medium: String,
    pub codec: String,
}

/// Thread-safe registry of one session's relays.
///
/// Populated by the state machine as SETUPs succeed and read by the
/// client handle from any thread. Lookups sit on the consumer's per-frame
/// poll path, so read performance matters.
#[derive(Clone, Default)]
pub struct RelayDirectory {
    entries: Arc<RwLock<HashMap<SubsessionId, (SubsessionInfo, Arc<FrameRelay>)>>>,
}

impl RelayDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly negotiated subsession's relay.
    pub fn register(&self, info: SubsessionInfo, relay: Arc<FrameRelay>) {
        tracing::debug!(
            subsession = %info.id,
            medium = %info.medium,
            codec = %info.codec,
            "relay registered"
        );
        self.entries.write().insert(info.id, (info, relay));
    }

    /// Look up a subsession's relay.
    pub fn relay(&self, id: SubsessionId) -> Option<Arc<FrameRelay>> {
        self.entries.read().get(&id).map(|(_, relay)| relay.clone())
    }

    /// Negotiated subsessions in description order.
    pub fn subsessions(&self) -> Vec<SubsessionInfo> {
        let mut infos: Vec<SubsessionInfo> = self
            .entries
            .read()
            .values()
            .map(|(info, _)| info.clone())
            .collect();
        infos.sort_by_key(|info| info.id.0);
        infos
    }
}
