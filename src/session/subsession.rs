use std::sync::Arc;

use crate::relay::FrameRelay;
use crate::sink::SubsessionSink;
use crate::transport::{SubsessionDescriptor, SubsessionId, TransportBinding};

/// One negotiated media substream and its liveness.
///
/// Created when SETUP succeeds. The sink doubles as the liveness flag:
/// open means the sink exists and frames still flow, closed means the
/// transport reported end of stream or the session tore the subsession
/// down.
pub struct SubsessionHandle {
    pub id: SubsessionId,
    pub descriptor: SubsessionDescriptor,
    pub binding: TransportBinding,
    pub relay: Arc<FrameRelay>,
    sink: Option<SubsessionSink>,
}

impl SubsessionHandle {
    pub fn new(
        id: SubsessionId,
        descriptor: SubsessionDescriptor,
        binding: TransportBinding,
        relay: Arc<FrameRelay>,
        sink: SubsessionSink,
    ) -> Self {
        Self {
            id,
            descriptor,
            binding,
            relay,
            sink: Some(sink),
        }
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    pub fn sink_mut(&mut self) -> Option<&mut SubsessionSink> {
        self.sink.as_mut()
    }

    /// Close the subsession, returning its sink if it was still open so
    /// the caller can distinguish first closure from a duplicate
    /// notification (and log the final frame count).
    pub fn close(&mut self) -> Option<SubsessionSink> {
        self.sink.take()
    }
}
