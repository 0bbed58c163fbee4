// halox-core: domain layer between the wire client and the bus adapter.

pub mod config;
pub mod error;
pub mod model;
pub mod registry;
pub mod session;
pub mod states;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::ControllerConfig;
pub use error::CoreError;
pub use model::{Device, Identifier, IdentifierError, PAYLOAD_OFF, PAYLOAD_ON};
pub use registry::EntityRegistry;
pub use session::{BridgePorts, SessionSupervisor, COMMAND_IN_CAPACITY, STATE_OUT_CAPACITY};
pub use states::StateUpdate;
