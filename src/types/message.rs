use core::{
    convert::{TryFrom, TryInto},
    ops::{Deref, DerefMut},
};

use crate::constants::*;

// command messages (PC to reader)
pub const ICC_POWER_ON: u8 = 0x62;
pub const ICC_POWER_OFF: u8 = 0x63;
pub const GET_SLOT_STATUS: u8 = 0x65;
pub const XFR_BLOCK: u8 = 0x6F;
pub const GET_PARAMETERS: u8 = 0x6C;
pub const RESET_PARAMETERS: u8 = 0x6D;
pub const SET_PARAMETERS: u8 = 0x61;

// response messages (reader to PC)
pub const DATA_BLOCK: u8 = 0x80;
pub const SLOT_STATUS: u8 = 0x81;
pub const PARAMETERS: u8 = 0x82;

pub const SLOT_STATUS_OK: u8 = 0;
pub const SLOT_STATUS_FAILED: u8 = 1 << 6;

/// bProtocolNum reported by the parameter commands.
pub const PROTOCOL_T1: u8 = 0x01;

pub type MessageBuffer = heapless::Vec<u8, MAX_MSG_LENGTH>;

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    ShortMessage,
    Oversized,
    UnknownCommand(u8),
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommandKind {
    PowerOn = ICC_POWER_ON,
    PowerOff = ICC_POWER_OFF,
    GetSlotStatus = GET_SLOT_STATUS,
    XfrBlock = XFR_BLOCK,
    GetParameters = GET_PARAMETERS,
    ResetParameters = RESET_PARAMETERS,
    SetParameters = SET_PARAMETERS,
}

/// One complete CCID message: the 10-byte header plus its declared payload.
///
/// Commands are only ever constructed by the reassembler, responses only by
/// the builders below; requests and responses never share a buffer.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Message(MessageBuffer);

impl Deref for Message {
    type Target = MessageBuffer;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Message {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl TryFrom<&[u8]> for Message {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < CCID_HEADER_LEN {
            return Err(Error::ShortMessage);
        }
        let mut buffer = MessageBuffer::new();
        buffer
            .extend_from_slice(bytes)
            .map_err(|_| Error::Oversized)?;
        Ok(Self(buffer))
    }
}

impl Message {
    pub fn message_type(&self) -> u8 {
        self[0]
    }

    /// Payload length as declared by the header (little-endian).
    pub fn declared_len(&self) -> usize {
        u32::from_le_bytes(self[1..5].try_into().unwrap()) as usize
    }

    pub fn slot(&self) -> u8 {
        self[5]
    }

    pub fn seq(&self) -> u8 {
        self[6]
    }

    pub fn status(&self) -> u8 {
        self[7]
    }

    pub fn error(&self) -> u8 {
        self[8]
    }

    pub fn param(&self) -> u8 {
        self[9]
    }

    pub fn data(&self) -> &[u8] {
        let len = core::cmp::min(self.len() - CCID_HEADER_LEN, self.declared_len());
        &self[CCID_HEADER_LEN..][..len]
    }

    pub fn command_kind(&self) -> Result<CommandKind, Error> {
        match self[0] {
            ICC_POWER_ON => Ok(CommandKind::PowerOn),
            ICC_POWER_OFF => Ok(CommandKind::PowerOff),
            GET_SLOT_STATUS => Ok(CommandKind::GetSlotStatus),
            XFR_BLOCK => Ok(CommandKind::XfrBlock),
            GET_PARAMETERS => Ok(CommandKind::GetParameters),
            RESET_PARAMETERS => Ok(CommandKind::ResetParameters),
            SET_PARAMETERS => Ok(CommandKind::SetParameters),
            command => Err(Error::UnknownCommand(command)),
        }
    }

    fn build(message_type: u8, slot: u8, seq: u8, b7: u8, b8: u8, b9: u8, data: &[u8]) -> Self {
        debug_assert!(data.len() <= MAX_IFSD);
        let mut buffer = MessageBuffer::new();
        buffer.resize_default(CCID_HEADER_LEN).ok();
        buffer[0] = message_type;
        buffer[1..5].copy_from_slice(&(data.len() as u32).to_le_bytes());
        buffer[5] = slot;
        buffer[6] = seq;
        buffer[7] = b7;
        buffer[8] = b8;
        buffer[9] = b9;
        buffer.extend_from_slice(data).ok();
        Self(buffer)
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("type", &format_args!("{:#04x}", self.message_type()))
            .field("slot", &self.slot())
            .field("seq", &self.seq())
            .field("len", &self.declared_len())
            .finish()
    }
}

/// RDR_to_PC_DataBlock response.
pub struct DataBlock<'a> {
    slot: u8,
    seq: u8,
    status: u8,
    error: u8,
    data: &'a [u8],
}

impl<'a> DataBlock<'a> {
    pub fn new(slot: u8, seq: u8, data: &'a [u8]) -> Self {
        Self {
            slot,
            seq,
            status: SLOT_STATUS_OK,
            error: 0,
            data,
        }
    }

    /// Failure report for a transfer whose processing was rejected.
    pub fn failed(slot: u8, seq: u8, error: u8) -> Self {
        Self {
            slot,
            seq,
            status: SLOT_STATUS_FAILED,
            error,
            data: &[],
        }
    }
}

impl From<DataBlock<'_>> for Message {
    fn from(block: DataBlock<'_>) -> Message {
        Message::build(
            DATA_BLOCK,
            block.slot,
            block.seq,
            block.status,
            block.error,
            0,
            block.data,
        )
    }
}

/// RDR_to_PC_SlotStatus response.
pub struct SlotStatus {
    slot: u8,
    seq: u8,
    status: u8,
}

impl SlotStatus {
    pub fn ok(slot: u8, seq: u8) -> Self {
        Self {
            slot,
            seq,
            status: SLOT_STATUS_OK,
        }
    }

    pub fn failed(slot: u8, seq: u8) -> Self {
        Self {
            slot,
            seq,
            status: SLOT_STATUS_FAILED,
        }
    }
}

impl From<SlotStatus> for Message {
    fn from(response: SlotStatus) -> Message {
        Message::build(
            SLOT_STATUS,
            response.slot,
            response.seq,
            response.status,
            0,
            0,
            &[],
        )
    }
}

/// RDR_to_PC_Parameters response; only the protocol number is reported.
pub struct Parameters {
    slot: u8,
    seq: u8,
}

impl Parameters {
    pub fn new(slot: u8, seq: u8) -> Self {
        Self { slot, seq }
    }
}

impl From<Parameters> for Message {
    fn from(response: Parameters) -> Message {
        Message::build(
            PARAMETERS,
            response.slot,
            response.seq,
            SLOT_STATUS_OK,
            0,
            PROTOCOL_T1,
            &[],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(message_type: u8, slot: u8, seq: u8, data: &[u8]) -> Message {
        let mut bytes = heapless::Vec::<u8, MAX_MSG_LENGTH>::new();
        bytes
            .extend_from_slice(&[
                message_type,
                data.len() as u8,
                0,
                0,
                0,
                slot,
                seq,
                0,
                0,
                0,
            ])
            .unwrap();
        bytes.extend_from_slice(data).unwrap();
        Message::try_from(bytes.as_slice()).unwrap()
    }

    #[test]
    fn parses_header_fields() {
        let message = command(XFR_BLOCK, 0, 0x2a, &[0x00, 0xa4, 0x04, 0x00]);
        assert_eq!(message.command_kind().unwrap(), CommandKind::XfrBlock);
        assert_eq!(message.slot(), 0);
        assert_eq!(message.seq(), 0x2a);
        assert_eq!(message.declared_len(), 4);
        assert_eq!(message.data(), &[0x00, 0xa4, 0x04, 0x00]);
    }

    #[test]
    fn rejects_short_input() {
        assert_eq!(
            Message::try_from(&[ICC_POWER_ON, 0, 0][..]),
            Err(Error::ShortMessage)
        );
    }

    #[test]
    fn unknown_command_is_reported_with_its_code() {
        let message = command(0x00, 0, 1, &[]);
        assert_eq!(message.command_kind(), Err(Error::UnknownCommand(0x00)));
    }

    #[test]
    fn data_block_serializes_header_and_payload() {
        let message: Message = DataBlock::new(0, 7, &ATR).into();
        assert_eq!(message.message_type(), DATA_BLOCK);
        assert_eq!(message.declared_len(), 4);
        assert_eq!(message.seq(), 7);
        assert_eq!(message.status(), SLOT_STATUS_OK);
        assert_eq!(message.data(), &ATR);
        assert_eq!(message.len(), CCID_HEADER_LEN + 4);
    }
}
