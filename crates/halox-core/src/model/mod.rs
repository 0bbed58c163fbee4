pub mod device;
pub mod identifier;

pub use device::{Device, PAYLOAD_OFF, PAYLOAD_ON};
pub use identifier::{Identifier, IdentifierError, PACKED_LEN};
