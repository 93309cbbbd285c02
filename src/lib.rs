pub mod client;
pub mod error;
pub mod relay;
pub mod runtime;
pub mod session;
pub mod sink;
pub mod transport;

pub use client::{ClientConfig, RtspClient};
pub use error::{Result, StreamError};
pub use relay::{Frame, FrameRelay, RelayDirectory, SubsessionInfo};
pub use runtime::{EventLoop, Scheduler, SessionEvent, TimerToken};
pub use session::{StreamSession, StreamState, SubsessionHandle};
pub use transport::{
    AbsoluteRange, MediaTransport, SessionDescription, SubsessionDescriptor, SubsessionId,
    TransportBinding,
};
