use thiserror::Error;

/// Errors surfaced by [`crate::duplex::SafeDuplexChannel`] and the HTTP-boundary
/// adapters that feed it frames.
#[derive(Debug, Error)]
pub enum DuplexError {
    #[error("duplex transport closed")]
    Closed,
    #[error("duplex transport read failed: {0}")]
    Read(String),
    #[error("duplex transport write failed: {0}")]
    Write(String),
    #[error(transparent)]
    Codec(#[from] relay_protocol::CodecError),
}

/// Errors from the WebRTC facade: engine construction and peer-connection
/// lifecycle.
#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("failed to configure media engine: {0}")]
    MediaEngine(String),
    #[error("failed to configure interceptor registry: {0}")]
    Interceptors(String),
    #[error("failed to configure ephemeral UDP range: {0}")]
    UdpRange(String),
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

/// Errors from room/registry bookkeeping. These are all "soft" in the sense
/// that §7 calls them transient or session-scoped — nothing here is fatal.
#[derive(Debug, Error)]
pub enum RoomError {
    #[error("room '{0}' already has a bound ingest")]
    IngestAlreadyBound(String),
    #[error("room has no bound ingest")]
    NoIngest,
    #[error("peer connection produced no local description after negotiation")]
    NoLocalDescription,
    #[error("participant '{0}' not found")]
    ParticipantNotFound(uuid::Uuid),
}

/// Umbrella error for the ingest/participant handlers and the room/participant
/// state machines, which each touch the facade, a duplex channel, and room
/// bookkeeping in the course of a single signalling step.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Facade(#[from] FacadeError),
    #[error(transparent)]
    Duplex(#[from] DuplexError),
    #[error(transparent)]
    Room(#[from] RoomError),
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
    #[error(transparent)]
    Codec(#[from] relay_protocol::CodecError),
}
