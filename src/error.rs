use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for `neuronbroker`.
///
/// Each layer defines its own error variant. Library callers can match on
/// these to decide recovery strategy; the composition root and CLI continue
/// to use `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum BrokerError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Connection ───────────────────────────────────────────────────────
    #[error("connect: {0}")]
    Connect(#[from] ConnectError),

    // ── Transport (publish / get / consume) ──────────────────────────────
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    // ── REST gateway ─────────────────────────────────────────────────────
    #[error("gateway: {0}")]
    Gateway(#[from] GatewayError),

    // ── Message decoding ─────────────────────────────────────────────────
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Connect errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConnectError {
    /// A single open attempt failed (unreachable host, bad credentials).
    #[error("broker {host} unreachable: {message}")]
    Failed { host: String, message: String },

    /// Every counted attempt failed; the broker process cannot continue.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// The retry pause was interrupted by a shutdown request.
    #[error("connect interrupted by shutdown")]
    Interrupted,
}

// ─── Transport errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is not open")]
    NotConnected,

    #[error("publish to {exchange} failed: {message}")]
    Publish { exchange: String, message: String },

    #[error("queue {queue} unavailable: {message}")]
    Queue { queue: String, message: String },

    #[error("ack of delivery {tag} failed: {message}")]
    Ack { tag: u64, message: String },

    #[error("close failed: {0}")]
    Close(String),
}

// ─── Gateway errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    #[error("{url} returned status {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {url}: {message}")]
    Response { url: String, message: String },

    #[error("invalid endpoint {0}")]
    Endpoint(String),
}

// ─── Decode errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("header {name} has invalid value {value:?}")]
    InvalidHeader { name: &'static str, value: String },

    #[error("unknown message type {0:?}")]
    UnknownType(String),

    #[error("malformed body: {0}")]
    Body(String),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, BrokerError>;
