// halox-api: wire-level controller client -- frame transport, crypto
// primitives, and the authenticated session.

pub mod crypto;
pub mod error;
pub mod frame;
pub mod session;
pub mod transport;

// ── Primary re-exports ──────────────────────────────────────────────
pub use crypto::HashAlg;
pub use error::ApiError;
pub use frame::{FrameHeader, FrameKind};
pub use session::{ControllerSession, SessionConfig};
pub use transport::{ControlResponse, FrameTransport, StateFrame};
