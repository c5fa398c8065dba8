//! Injected APDU processing.
//!
//! The dispatcher does not interpret APDUs; it hands each XfrBlock payload to
//! an ordered chain of processors. A processor either takes the APDU and
//! produces the reply, rejects it with an error code, or passes. Processing
//! stages (applet detection, channel management, the secure-element relay)
//! compose by ordering.

use crate::types::ApduData;

/// Error code carried back to the host in the CCID `error` byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Failure(pub u8);

/// Raised when every processor in the chain passed on the APDU.
pub const NOT_HANDLED: Failure = Failure(1);

pub type ProcessorResult = Result<(), Failure>;

/// A stage in the APDU processing chain.
pub trait ApduProcessor {
    /// Handle `command`, writing the response APDU into `reply`.
    ///
    /// Return `None` to pass the command to the next processor in the chain;
    /// `reply` must be left empty in that case.
    fn process(&mut self, command: &[u8], reply: &mut ApduData) -> Option<ProcessorResult>;
}

/// Runs `command` through the chain; the first processor that does not pass
/// decides the outcome.
pub fn process_chain(
    processors: &mut [&mut dyn ApduProcessor],
    command: &[u8],
    reply: &mut ApduData,
) -> ProcessorResult {
    for processor in processors.iter_mut() {
        if let Some(result) = processor.process(command, reply) {
            return result;
        }
    }
    info!("no processor accepted the APDU");
    Err(NOT_HANDLED)
}
