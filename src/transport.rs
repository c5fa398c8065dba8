//! GlobalPlatform APDU transport over I2C ("T=1'", GPC_SPE_172).
//!
//! Frames an APDU as `NAD PCB LEN_hi LEN_lo DATA.. CRC_hi CRC_lo`, protects
//! it with the complemented CRC16 of everything before the checksum, writes
//! it through a retrying I2C primitive and decodes the reply prologue to
//! learn how much payload to read back. The LEN field is always the
//! big-endian length of DATA; control parameters (such as an IFS value)
//! travel as a one-byte payload.
//!
//! One link carries at most one transaction at a time; callers serialize.

use embedded_hal::blocking::{delay::DelayMs, i2c};

use crate::{
    crc::crc16,
    processor::{ApduProcessor, Failure, ProcessorResult},
    types::ApduData,
};

/// Node address byte: secure element as destination, controller as source.
pub const NAD: u8 = 0x21;
pub const DEFAULT_ADDRESS: u8 = 0x48;

/// S-block requesting the CIP/ATR; resets the link sequence.
pub const PCB_RESET: u8 = 0xCF;
/// S-block adjusting the information field size.
pub const PCB_SET_IFS: u8 = 0xC1;

/// Information field size negotiated at bring-up (128 bytes).
pub const IFS: u8 = 0x80;

/// I-block sequence bit, toggled per transaction.
const PCB_SEQUENCE: u8 = 1 << 6;

const PROLOGUE_LEN: usize = 4;
const CRC_LEN: usize = 2;

/// Frame payloads must stay below this.
pub const FRAME_PAYLOAD_LIMIT: usize = 4089;

/// Status word synthesized when the link stays mute through the retry budget.
const SW_UNSPECIFIED: [u8; 2] = [0x6F, 0xFF];

/// Reported by the relay when the transport gives up on a transaction.
pub const RELAY_FAILURE: Failure = Failure(2);

type FrameBuffer = heapless::Vec<u8, { PROLOGUE_LEN + FRAME_PAYLOAD_LIMIT - 1 + CRC_LEN }>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Payload too large to frame; nothing was written to the bus.
    RequestTooLong,
    /// I2C write failed through the whole retry budget.
    Write,
    /// I2C read failed through the whole retry budget.
    Read,
    /// Responder declared more payload than the caller can accept.
    BadHeader,
    /// Inbound checksum still wrong after the retransmission budget.
    Checksum,
}

#[derive(Copy, Clone, Debug)]
pub struct Config {
    pub address: u8,
    pub nad: u8,
    /// I2C attempts per write or read.
    pub attempts: u8,
    /// Pause between attempts, milliseconds.
    pub retry_delay_ms: u8,
    /// Retransmission requests after an inbound checksum mismatch.
    pub retransmits: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            nad: NAD,
            attempts: 255,
            retry_delay_ms: 5,
            retransmits: 3,
        }
    }
}

/// Builds a transport frame around `payload`.
fn frame(nad: u8, pcb: u8, payload: &[u8]) -> Result<FrameBuffer, Error> {
    if payload.len() >= FRAME_PAYLOAD_LIMIT {
        return Err(Error::RequestTooLong);
    }
    let mut frame = FrameBuffer::new();
    frame
        .extend_from_slice(&[nad, pcb, (payload.len() >> 8) as u8, payload.len() as u8])
        .ok();
    frame.extend_from_slice(payload).ok();
    let crc = !crc16(&frame, !0);
    frame.extend_from_slice(&crc.to_be_bytes()).ok();
    Ok(frame)
}

#[cfg(test)]
fn frame_payload(frame: &[u8]) -> &[u8] {
    let len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    &frame[PROLOGUE_LEN..][..len]
}

/// One T=1' link to a secure element.
pub struct SeLink<I2C, D>
where
    I2C: i2c::Write + i2c::Read,
    D: DelayMs<u8>,
{
    bus: I2C,
    delay: D,
    config: Config,
    sequence: u8,
    frame: FrameBuffer,
}

impl<I2C, D> SeLink<I2C, D>
where
    I2C: i2c::Write + i2c::Read,
    D: DelayMs<u8>,
{
    pub fn new(bus: I2C, delay: D) -> Self {
        Self::with_config(bus, delay, Config::default())
    }

    pub fn with_config(bus: I2C, delay: D, config: Config) -> Self {
        Self {
            bus,
            delay,
            config,
            sequence: 0,
            frame: FrameBuffer::new(),
        }
    }

    pub fn release(self) -> (I2C, D) {
        (self.bus, self.delay)
    }

    /// Soft-resets the link and negotiates the information field size.
    pub fn begin(&mut self) -> Result<(), Error> {
        let mut cip = ApduData::new();
        let n = self.transact(PCB_RESET, &[], &mut cip)?;
        info!("CIP: {} bytes", n);
        self.transact(PCB_SET_IFS, &[IFS], &mut cip)?;
        Ok(())
    }

    /// Runs one framed transaction: write `request` under `pcb`, read the
    /// reply payload into `reply`, returning its length (checksum excluded).
    ///
    /// A write that survives no attempt does not reach the read phase: the
    /// generic error status word is synthesized into `reply` instead, so the
    /// CCID path never sees the transport unwind.
    pub fn transact(
        &mut self,
        pcb: u8,
        request: &[u8],
        reply: &mut ApduData,
    ) -> Result<usize, Error> {
        if pcb == PCB_RESET {
            self.sequence = 0;
        }
        reply.clear();

        self.frame = frame(self.config.nad, pcb, request)?;
        if self.write_frame().is_err() {
            info!("write retries exhausted, reporting error status word");
            reply.extend_from_slice(&SW_UNSPECIFIED).ok();
            return Ok(SW_UNSPECIFIED.len());
        }

        let mut retransmits = self.config.retransmits;
        loop {
            match self.read_reply(reply) {
                Err(Error::Checksum) if retransmits > 0 => {
                    retransmits -= 1;
                    info!("reply checksum mismatch, requesting retransmission");
                    self.request_retransmission()?;
                }
                outcome => return outcome,
            }
        }
    }

    /// I-block transaction: the sequence bit toggles on every call, the
    /// chaining bit stays clear (block chaining is not implemented).
    pub fn transact_apdu(&mut self, request: &[u8], reply: &mut ApduData) -> Result<usize, Error> {
        let pcb = (self.sequence & 1) << 6;
        debug_assert!(pcb & !PCB_SEQUENCE == 0);
        self.sequence = self.sequence.wrapping_add(1);
        self.transact(pcb, request, reply)
    }

    fn write_frame(&mut self) -> Result<(), Error> {
        for attempt in 0..self.config.attempts {
            if attempt > 0 {
                self.delay.delay_ms(self.config.retry_delay_ms);
            }
            if self.bus.write(self.config.address, &self.frame).is_ok() {
                return Ok(());
            }
        }
        Err(Error::Write)
    }

    fn read_exact(&mut self, len: usize) -> Result<(), Error> {
        self.frame.clear();
        self.frame.resize_default(len).ok();
        for attempt in 0..self.config.attempts {
            if attempt > 0 {
                self.delay.delay_ms(self.config.retry_delay_ms);
            }
            if self.bus.read(self.config.address, &mut self.frame).is_ok() {
                return Ok(());
            }
        }
        Err(Error::Read)
    }

    /// Reads prologue, payload and checksum of one reply frame.
    fn read_reply(&mut self, reply: &mut ApduData) -> Result<usize, Error> {
        let mut prologue = [0u8; PROLOGUE_LEN];
        self.read_exact(PROLOGUE_LEN)?;
        prologue.copy_from_slice(&self.frame);

        let declared = u16::from_be_bytes([prologue[2], prologue[3]]) as usize;
        if declared > reply.capacity() {
            error!(
                "responder declares {} payload bytes, capacity is {}",
                declared,
                reply.capacity()
            );
            return Err(Error::BadHeader);
        }

        self.read_exact(declared + CRC_LEN)?;
        let (payload, checksum) = self.frame.split_at(declared);

        let crc = !crc16(payload, crc16(&prologue, !0));
        if crc.to_be_bytes() != checksum {
            return Err(Error::Checksum);
        }

        reply.clear();
        reply.extend_from_slice(payload).ok();
        Ok(declared)
    }

    /// R(EDC error) block asking the responder to resend its last frame.
    fn request_retransmission(&mut self) -> Result<(), Error> {
        let pcb = 0x80 | ((self.sequence & 1) << 4) | 0x01;
        self.frame = frame(self.config.nad, pcb, &[])?;
        self.write_frame()
    }
}

/// Relays opaque APDUs to the secure element over the link.
///
/// Terminal stage of a processor chain: it takes every APDU offered.
pub struct SecureElement<I2C, D>
where
    I2C: i2c::Write + i2c::Read,
    D: DelayMs<u8>,
{
    link: SeLink<I2C, D>,
}

impl<I2C, D> SecureElement<I2C, D>
where
    I2C: i2c::Write + i2c::Read,
    D: DelayMs<u8>,
{
    pub fn new(link: SeLink<I2C, D>) -> Self {
        Self { link }
    }

    pub fn link(&mut self) -> &mut SeLink<I2C, D> {
        &mut self.link
    }

    pub fn release(self) -> SeLink<I2C, D> {
        self.link
    }
}

impl<I2C, D> ApduProcessor for SecureElement<I2C, D>
where
    I2C: i2c::Write + i2c::Read,
    D: DelayMs<u8>,
{
    fn process(&mut self, command: &[u8], reply: &mut ApduData) -> Option<ProcessorResult> {
        match self.link.transact_apdu(command, reply) {
            Ok(_len) => Some(Ok(())),
            Err(_error) => {
                error!("relay failed: {:?}", _error);
                reply.clear();
                Some(Err(RELAY_FAILURE))
            }
        }
    }
}
