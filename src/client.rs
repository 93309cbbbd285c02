use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::RwLock;
use rand::RngExt;

use crate::relay::{Frame, RelayDirectory, SubsessionInfo};
use crate::runtime::{EventLoop, Scheduler};
use crate::session::{StreamSession, StreamState};
use crate::transport::{MediaTransport, SubsessionId};

/// Client-level configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Identity tag used in diagnostics. Auto-generated when `None`.
    pub tag: Option<String>,
    /// Ask the transport to stream RTP over the RTSP TCP connection
    /// instead of UDP.
    pub stream_over_tcp: bool,
}

/// Handle to one streaming session.
///
/// [`open`](Self::open) spawns the event-loop thread that owns the
/// session state machine; the handle itself only touches the shared relay
/// directory and the state mirror, so every method is safe to call from
/// any thread and never blocks on network I/O — including the per-frame
/// poll path ([`retrieve_frame`](Self::retrieve_frame)).
///
/// Dropping the handle requests a stop but does not wait for teardown;
/// use [`join`](Self::join) to block until the session is fully closed.
pub struct RtspClient {
    tag: String,
    scheduler: Scheduler,
    state: Arc<RwLock<StreamState>>,
    directory: RelayDirectory,
    looper: Option<JoinHandle<()>>,
}

impl RtspClient {
    /// Open `url` through the given transport and start negotiating.
    ///
    /// Returns immediately. Negotiation continues on the spawned
    /// event-loop thread; progress is observable via
    /// [`state`](Self::state) and [`subsessions`](Self::subsessions).
    pub fn open(url: &str, transport: Box<dyn MediaTransport>, config: ClientConfig) -> Self {
        let tag = config
            .tag
            .unwrap_or_else(|| format!("{:08x}", rand::rng().random::<u32>()));
        let state = Arc::new(RwLock::new(StreamState::Init));
        let directory = RelayDirectory::new();
        let event_loop = EventLoop::new();
        let scheduler = event_loop.scheduler();

        let mut session = StreamSession::new(
            url,
            tag.clone(),
            config.stream_over_tcp,
            transport,
            scheduler.clone(),
            state.clone(),
            directory.clone(),
        );

        let looper = thread::spawn(move || {
            session.start();
            event_loop.run(&mut session);
        });

        Self {
            tag,
            scheduler,
            state,
            directory,
            looper: Some(looper),
        }
    }

    /// Request shutdown. Idempotent; this call only posts the stop and
    /// returns — teardown runs on the event-loop thread.
    pub fn stop(&self) {
        tracing::info!(stream = %self.tag, "stop requested");
        self.scheduler.request_stop();
    }

    /// Stop the session and block until the event loop has exited.
    pub fn join(mut self) {
        self.stop();
        if let Some(looper) = self.looper.take() {
            let _ = looper.join();
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

    /// Copy of the most recent access unit for a subsession.
    ///
    /// `None` until the subsession is negotiated and its first frame
    /// arrives — never an error. Repeated calls before the next frame
    /// return the same copy.
    pub fn retrieve_frame(&self, subsession: SubsessionId) -> Option<Frame> {
        self.directory.relay(subsession)?.latest_frame()
    }

    /// Copy of the last negotiated out-of-band parameter set for a
    /// subsession, or `None` if none was ever advertised.
    pub fn retrieve_parameter_set(&self, subsession: SubsessionId) -> Option<Bytes> {
        self.directory.relay(subsession)?.parameter_set()
    }

    /// Subsessions negotiated so far, in description order.
    pub fn subsessions(&self) -> Vec<SubsessionInfo> {
        self.directory.subsessions()
    }
}

impl Drop for RtspClient {
    fn drop(&mut self) {
        self.scheduler.request_stop();
    }
}
