use crate::constants::MAX_IFSD;

pub mod message;

pub use message::{CommandKind, Message};

/// APDU scratch buffer, sized to the maximum information field.
pub type ApduData = heapless::Vec<u8, MAX_IFSD>;
