use thiserror::Error;

/// Top-level error type for the `halox-api` crate.
///
/// Grouped by failure domain. Transport variants demote the connection to
/// "dead" and end in a reconnect; HTTP, protocol, crypto, and auth variants
/// fail the current operation or handshake and leave the transport alone.
#[derive(Debug, Error)]
pub enum ApiError {
    // ── Transport ───────────────────────────────────────────────────
    /// WebSocket connection could not be established.
    #[error("WebSocket connection failed: {0}")]
    Connect(String),

    /// A send on the WebSocket failed.
    #[error("WebSocket send failed: {0}")]
    Send(String),

    /// A read from the WebSocket failed.
    #[error("WebSocket receive failed: {0}")]
    Receive(String),

    /// Header frame shorter than the 8-byte wire header.
    #[error("header frame too short: {len} bytes")]
    ShortHeader { len: usize },

    /// Header frame did not start with the fixed 0x03 marker.
    #[error("invalid header received, {first:#04x} vs 0x03 expected")]
    BadHeader { first: u8 },

    /// A payload frame started with 0x03 where data was expected.
    #[error("header received when payload was expected -- stream desynchronised")]
    Desynchronised,

    /// Zero-length payload frame.
    #[error("zero byte payload received")]
    EmptyPayload,

    /// The controller announced it is going out of service.
    #[error("controller signalled out-of-service")]
    OutOfService,

    /// The transport (or a channel behind it) is gone.
    #[error("transport closed")]
    TransportClosed,

    /// No reply arrived on the control or binary channel in time.
    /// Fails the request without killing the transport.
    #[error("no reply within {timeout_secs} seconds")]
    RequestTimeout { timeout_secs: u64 },

    /// The session has no open transport.
    #[error("session is not connected")]
    NotConnected,

    // ── HTTP bootstrap ──────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP request returned a non-200 status.
    #[error("HTTP request returned status {status}, expected 200")]
    HttpStatus { status: u16 },

    // ── Protocol ────────────────────────────────────────────────────
    /// The controller replied with a non-200 code to a request.
    #[error("controller replied {code} to '{control}'")]
    ControlStatus { code: String, control: String },

    /// A JSON surface could not be parsed.
    #[error("malformed controller JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A reply parsed but did not have the expected shape.
    #[error("unexpected reply shape: {context}")]
    ReplyShape { context: &'static str },

    /// `getkey2` named a hash algorithm this client does not speak.
    #[error("unknown hash algorithm '{0}'")]
    UnknownHashAlg(String),

    // ── Crypto ──────────────────────────────────────────────────────
    /// The controller's public key PEM could not be decoded.
    #[error("public key PEM rejected: {0}")]
    PublicKeyPem(String),

    /// RSA sealing of the session key failed.
    #[error("RSA encryption failed: {0}")]
    RsaEncrypt(String),

    /// Key or IV material of the wrong size.
    #[error("bad key material: {0}")]
    KeyMaterial(&'static str),

    /// A base64 field from the controller did not decode.
    #[error("base64 payload rejected: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A hex field from the controller did not decode.
    #[error("hex field rejected: {0}")]
    Hex(#[from] hex::FromHexError),

    // ── Auth ────────────────────────────────────────────────────────
    /// The controller refused to issue or refresh a token.
    #[error("token request refused: code {code}, {detail}")]
    TokenRefused { code: String, detail: String },
}

impl ApiError {
    /// `true` for errors that mean the transport is dead and the session
    /// must reconnect before anything else can happen.
    pub fn is_transport_dead(&self) -> bool {
        matches!(
            self,
            Self::Connect(_)
                | Self::Send(_)
                | Self::Receive(_)
                | Self::ShortHeader { .. }
                | Self::BadHeader { .. }
                | Self::Desynchronised
                | Self::EmptyPayload
                | Self::OutOfService
                | Self::TransportClosed
        )
    }

    /// `true` when re-running the handshake may resolve the failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::TokenRefused { .. })
    }
}
