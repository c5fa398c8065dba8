use core::convert::{TryFrom, TryInto};

use crate::{
    constants::*,
    processor::{self, ApduProcessor},
    types::{
        message::{self, CommandKind, DataBlock, Message, Parameters, SlotStatus},
        ApduData,
    },
};

/// Scratch bound for reassembly: one maximal message plus whatever the
/// transport delivered beyond its boundary.
const SCRATCH_SIZE: usize = 2 * MAX_MSG_LENGTH;

/// Turns a byte stream into complete CCID messages.
///
/// The stream has no framing of its own: a single delivery may contain a
/// partial message or several messages back to back. Bytes past a message
/// boundary are retained as the start of the next assembly cycle.
pub struct Reassembler {
    buffer: heapless::Vec<u8, SCRATCH_SIZE>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            buffer: heapless::Vec::new(),
        }
    }

    /// Buffered bytes not yet yielded as part of a message.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Feeds one delivery from the byte stream.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.buffer.extend_from_slice(chunk).is_err() {
            // a stream this far ahead of the consumer is not speaking CCID
            error!(
                "reassembly overflow at {} buffered bytes, discarding",
                self.buffer.len()
            );
            self.buffer.clear();
        }
    }

    /// Takes the next complete message off the stream, if one is buffered.
    pub fn next_message(&mut self) -> Option<Message> {
        if self.buffer.len() < CCID_HEADER_LEN {
            return None;
        }
        let declared = u32::from_le_bytes(self.buffer[1..5].try_into().unwrap()) as usize;
        if declared > MAX_IFSD {
            // framing error: the length field cannot be trusted, nor can any
            // byte buffered behind it
            error!("declared length {} exceeds IFSD, discarding", declared);
            self.buffer.clear();
            return None;
        }

        let boundary = CCID_HEADER_LEN + declared;
        if self.buffer.len() < boundary {
            return None;
        }

        let message = Message::try_from(&self.buffer[..boundary]).ok();
        let remaining = self.buffer.len() - boundary;
        self.buffer.copy_within(boundary.., 0);
        self.buffer.truncate(remaining);
        message
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// CCID command/response engine for one interface.
///
/// Owns no transport: the USB class feeds received bytes in via
/// [`handle_bytes`](Self::handle_bytes) and drains the response out in
/// packet-sized chunks via [`next_chunk`](Self::next_chunk) /
/// [`did_send`](Self::did_send), one chunk per write-ready event. A new
/// command is dispatched only once the previous response has fully drained,
/// so response bytes are never interleaved.
pub struct Pipe {
    assembler: Reassembler,
    outbox: Option<Message>,
    sent: usize,
    zlp_pending: bool,
}

impl Pipe {
    pub fn new() -> Self {
        Self {
            assembler: Reassembler::new(),
            outbox: None,
            sent: 0,
            zlp_pending: false,
        }
    }

    /// Drops any half-assembled command and any half-flushed response.
    pub fn reset_state(&mut self) {
        self.assembler.reset();
        self.outbox = None;
        self.sent = 0;
        self.zlp_pending = false;
    }

    pub fn handle_bytes(&mut self, chunk: &[u8]) {
        self.assembler.feed(chunk);
    }

    /// True if a response is waiting to be flushed.
    pub fn flushing(&self) -> bool {
        self.outbox.is_some() || self.zlp_pending
    }

    /// Dispatch pass: answers at most one buffered command.
    pub fn pump(&mut self, processors: &mut [&mut dyn ApduProcessor]) {
        if self.flushing() {
            return;
        }
        if let Some(command) = self.assembler.next_message() {
            self.outbox = Some(dispatch(&command, processors));
            self.sent = 0;
        }
    }

    /// Next chunk of the current response, at most `max` bytes. An empty
    /// chunk is a deliberate zero-length packet closing a full-packet tail.
    pub fn next_chunk(&self, max: usize) -> Option<&[u8]> {
        if self.zlp_pending {
            return Some(&[]);
        }
        let outbox = self.outbox.as_ref()?;
        let end = core::cmp::min(outbox.len(), self.sent + max);
        Some(&outbox[self.sent..end])
    }

    /// Acknowledges `n` bytes accepted by the transport; `max` is the
    /// transport's packet size, which decides whether a zero-length packet
    /// must follow the final chunk.
    pub fn did_send(&mut self, n: usize, max: usize) {
        if self.zlp_pending {
            self.zlp_pending = false;
            return;
        }
        self.sent += n;
        if let Some(outbox) = self.outbox.as_ref() {
            if self.sent >= outbox.len() {
                self.zlp_pending = outbox.len() % max == 0;
                self.outbox = None;
                self.sent = 0;
            }
        }
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}

fn dispatch(command: &Message, processors: &mut [&mut dyn ApduProcessor]) -> Message {
    let (slot, seq) = (command.slot(), command.seq());

    match command.command_kind() {
        Ok(CommandKind::PowerOn) => DataBlock::new(slot, seq, &ATR).into(),

        Ok(CommandKind::PowerOff) | Ok(CommandKind::GetSlotStatus) => {
            SlotStatus::ok(slot, seq).into()
        }

        Ok(CommandKind::XfrBlock) => {
            let mut reply = ApduData::new();
            match processor::process_chain(processors, command.data(), &mut reply) {
                Ok(()) => DataBlock::new(slot, seq, &reply).into(),
                Err(failure) => DataBlock::failed(slot, seq, failure.0).into(),
            }
        }

        Ok(CommandKind::GetParameters)
        | Ok(CommandKind::ResetParameters)
        | Ok(CommandKind::SetParameters) => Parameters::new(slot, seq).into(),

        Err(message::Error::UnknownCommand(_command)) => {
            info!("unsupported command {:#04x}", _command);
            SlotStatus::failed(slot, seq).into()
        }

        // the reassembler never yields headerless messages
        Err(_) => SlotStatus::failed(slot, seq).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{Failure, ProcessorResult};

    fn command_bytes(message_type: u8, slot: u8, seq: u8, data: &[u8]) -> heapless::Vec<u8, 2048> {
        let mut bytes = heapless::Vec::new();
        bytes.push(message_type).unwrap();
        bytes
            .extend_from_slice(&(data.len() as u32).to_le_bytes())
            .unwrap();
        bytes.extend_from_slice(&[slot, seq, 0, 0, 0]).unwrap();
        bytes.extend_from_slice(data).unwrap();
        bytes
    }

    struct Echo;

    impl ApduProcessor for Echo {
        fn process(&mut self, command: &[u8], reply: &mut ApduData) -> Option<ProcessorResult> {
            reply.extend_from_slice(command).ok();
            Some(Ok(()))
        }
    }

    struct Reject(u8);

    impl ApduProcessor for Reject {
        fn process(&mut self, _command: &[u8], _reply: &mut ApduData) -> Option<ProcessorResult> {
            Some(Err(Failure(self.0)))
        }
    }

    fn respond(bytes: &[u8], processors: &mut [&mut dyn ApduProcessor]) -> Message {
        let mut pipe = Pipe::new();
        pipe.handle_bytes(bytes);
        pipe.pump(processors);
        pipe.outbox.take().expect("no response")
    }

    #[test]
    fn chunk_size_independence() {
        let bytes = command_bytes(message::XFR_BLOCK, 0, 3, &[0xa5; 100]);

        for chunk_size in 1..=bytes.len() {
            let mut assembler = Reassembler::new();
            let mut yielded = 0;
            for chunk in bytes.chunks(chunk_size) {
                assembler.feed(chunk);
                while let Some(message) = assembler.next_message() {
                    assert_eq!(message.data(), &[0xa5; 100]);
                    yielded += 1;
                }
            }
            assert_eq!(yielded, 1, "chunk size {}", chunk_size);
            assert_eq!(assembler.pending(), 0);
        }
    }

    #[test]
    fn back_to_back_messages_in_one_delivery() {
        let mut bytes = command_bytes(message::ICC_POWER_ON, 0, 1, &[]);
        bytes
            .extend_from_slice(&command_bytes(message::GET_SLOT_STATUS, 0, 2, &[]))
            .unwrap();
        // plus the start of a third message
        bytes.extend_from_slice(&[message::XFR_BLOCK, 4, 0]).unwrap();

        let mut assembler = Reassembler::new();
        assembler.feed(&bytes);

        assert_eq!(assembler.next_message().unwrap().seq(), 1);
        assert_eq!(assembler.next_message().unwrap().seq(), 2);
        assert!(assembler.next_message().is_none());
        assert_eq!(assembler.pending(), 3);
    }

    #[test]
    fn zero_length_message_needs_exactly_the_header() {
        let bytes = command_bytes(message::GET_SLOT_STATUS, 0, 9, &[]);
        let mut assembler = Reassembler::new();
        assembler.feed(&bytes[..CCID_HEADER_LEN - 1]);
        assert!(assembler.next_message().is_none());
        assembler.feed(&bytes[CCID_HEADER_LEN - 1..]);
        assert!(assembler.next_message().is_some());
    }

    #[test]
    fn overlong_declared_length_discards_the_stream() {
        let mut assembler = Reassembler::new();
        assembler.feed(&command_bytes(message::XFR_BLOCK, 0, 1, &[0u8; 1025]));
        assert!(assembler.next_message().is_none());
        assert_eq!(assembler.pending(), 0);

        // recovers on the next well-formed command
        assembler.feed(&command_bytes(message::ICC_POWER_ON, 0, 2, &[]));
        assert_eq!(assembler.next_message().unwrap().seq(), 2);
    }

    #[test]
    fn power_on_reports_atr() {
        let response = respond(&command_bytes(message::ICC_POWER_ON, 0, 7, &[]), &mut []);
        assert_eq!(response.message_type(), message::DATA_BLOCK);
        assert_eq!(response.slot(), 0);
        assert_eq!(response.seq(), 7);
        assert_eq!(response.status(), 0);
        assert_eq!(response.error(), 0);
        assert_eq!(response.declared_len(), 4);
        assert_eq!(response.data(), &[0x3b, 0x80, 0x01, 0x81]);
    }

    #[test]
    fn power_off_and_slot_status_report_ok() {
        for command in [message::ICC_POWER_OFF, message::GET_SLOT_STATUS] {
            let response = respond(&command_bytes(command, 0, 4, &[]), &mut []);
            assert_eq!(response.message_type(), message::SLOT_STATUS);
            assert_eq!(response.status(), 0);
            assert_eq!(response.declared_len(), 0);
        }
    }

    #[test]
    fn transfer_failure_maps_to_status_and_error() {
        let response = respond(
            &command_bytes(message::XFR_BLOCK, 0, 5, &[0x00, 0xa4]),
            &mut [&mut Reject(5)],
        );
        assert_eq!(response.message_type(), message::DATA_BLOCK);
        assert_eq!(response.status(), message::SLOT_STATUS_FAILED);
        assert_eq!(response.error(), 5);
        assert_eq!(response.declared_len(), 0);
    }

    #[test]
    fn transfer_success_carries_the_reply() {
        let response = respond(
            &command_bytes(message::XFR_BLOCK, 0, 6, &[0x90, 0x00]),
            &mut [&mut Echo],
        );
        assert_eq!(response.message_type(), message::DATA_BLOCK);
        assert_eq!(response.status(), 0);
        assert_eq!(response.data(), &[0x90, 0x00]);
    }

    #[test]
    fn parameter_commands_report_t1() {
        for command in [
            message::GET_PARAMETERS,
            message::RESET_PARAMETERS,
            message::SET_PARAMETERS,
        ] {
            let response = respond(&command_bytes(command, 0, 8, &[]), &mut []);
            assert_eq!(response.message_type(), message::PARAMETERS);
            assert_eq!(response.status(), 0);
            assert_eq!(response.error(), 0);
            assert_eq!(response.param(), message::PROTOCOL_T1);
            assert_eq!(response.declared_len(), 0);
        }
    }

    #[test]
    fn unknown_command_fails_slot_status() {
        let response = respond(&command_bytes(0x00, 0, 2, &[]), &mut []);
        assert_eq!(response.message_type(), message::SLOT_STATUS);
        assert_eq!(response.status(), message::SLOT_STATUS_FAILED);
        assert_eq!(response.error(), 0);
        assert_eq!(response.param(), 0);
        assert_eq!(response.declared_len(), 0);
    }

    #[test]
    fn response_flushes_in_order_in_bounded_chunks() {
        let mut pipe = Pipe::new();
        pipe.handle_bytes(&command_bytes(message::XFR_BLOCK, 0, 1, &[0x5a; 100]));
        pipe.pump(&mut [&mut Echo]);

        let mut flushed = heapless::Vec::<u8, 256>::new();
        while pipe.flushing() {
            let chunk_len = {
                let chunk = pipe.next_chunk(64).unwrap();
                assert!(chunk.len() <= 64);
                flushed.extend_from_slice(chunk).unwrap();
                chunk.len()
            };
            pipe.did_send(chunk_len, 64);
        }

        assert_eq!(flushed.len(), CCID_HEADER_LEN + 100);
        assert_eq!(flushed[0], message::DATA_BLOCK);
        assert_eq!(&flushed[CCID_HEADER_LEN..], &[0x5a; 100]);
    }

    #[test]
    fn full_packet_tail_is_closed_by_a_zero_length_packet() {
        // 54 data bytes make the response exactly one 64-byte packet
        let mut pipe = Pipe::new();
        pipe.handle_bytes(&command_bytes(message::XFR_BLOCK, 0, 1, &[1u8; 54]));
        pipe.pump(&mut [&mut Echo]);

        assert_eq!(pipe.next_chunk(64).unwrap().len(), 64);
        pipe.did_send(64, 64);
        assert_eq!(pipe.next_chunk(64).unwrap().len(), 0);
        pipe.did_send(0, 64);
        assert!(!pipe.flushing());
    }

    #[test]
    fn commands_are_not_dispatched_while_a_response_is_in_flight() {
        let mut pipe = Pipe::new();
        pipe.handle_bytes(&command_bytes(message::ICC_POWER_ON, 0, 1, &[]));
        pipe.handle_bytes(&command_bytes(message::ICC_POWER_ON, 0, 2, &[]));

        pipe.pump(&mut []);
        pipe.pump(&mut []);
        assert_eq!(pipe.outbox.as_ref().unwrap().seq(), 1);

        let n = pipe.next_chunk(64).unwrap().len();
        pipe.did_send(n, 64);
        assert!(!pipe.flushing());

        pipe.pump(&mut []);
        assert_eq!(pipe.outbox.as_ref().unwrap().seq(), 2);
    }
}
