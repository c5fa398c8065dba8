#![no_std]

//! USB CCID to secure-element bridge.
//!
//! This crate implements the two protocol engines of a CCID smart-card
//! reader whose "card" is a secure element on an I2C bus: the CCID message
//! pipe toward the USB host, and the GlobalPlatform "T=1'" block transport
//! toward the secure element (GPC_SPE_172, APDU transport over SPI/I2C).
//! APDUs carried between the two are opaque to the bridge; processing is
//! injected through [`ApduProcessor`](processor::ApduProcessor)
//! implementations, of which [`SecureElement`](transport::SecureElement) is
//! the relaying one.
//!
//! [CCID Specification for Integrated Circuit(s) Cards Interface Devices](https://www.usb.org/sites/default/files/DWG_Smart-Card_CCID_Rev110.pdf)

#[macro_use]
extern crate delog;
generate_macros!();

pub mod class;
pub mod constants;
pub mod crc;
pub mod pipe;
pub mod processor;
pub mod registry;
pub mod transport;
pub mod types;

pub use class::Ccid;
pub use crc::crc16;
pub use pipe::Pipe;
pub use processor::ApduProcessor;
pub use transport::SeLink;
