//! Error types for the RTSP client library.

/// Errors that can occur while negotiating a stream.
///
/// Variants map to the failure modes of the negotiation sequence:
///
/// - **Fatal**: [`Negotiation`](Self::Negotiation),
///   [`NoSubsessions`](Self::NoSubsessions) — the whole session shuts down.
/// - **Recoverable**: [`SubsessionInit`](Self::SubsessionInit) — the
///   affected subsession is skipped and negotiation continues with the
///   remaining ones.
///
/// Stream end (transport closure, RTCP BYE) and duration-guard expiry are
/// expected terminal events, not errors; they are delivered as
/// [`SessionEvent`](crate::runtime::SessionEvent)s instead.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// DESCRIBE or PLAY failed. Fatal for the whole session.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Transport initiation or SETUP failed for a single subsession.
    /// That subsession is skipped; the session continues without it.
    #[error("subsession init failed: {0}")]
    SubsessionInit(String),

    /// The session description contained no media subsessions (no `m=` lines).
    #[error("session description has no media subsessions")]
    NoSubsessions,
}

/// Convenience alias for `Result<T, StreamError>`.
pub type Result<T> = std::result::Result<T, StreamError>;
