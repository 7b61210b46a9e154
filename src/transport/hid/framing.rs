use std::io::Cursor as IOCursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, error};

use crate::transport::error::{Error, TransportError};

pub const BROADCAST_CID: u32 = 0xFFFFFFFF;

/// Largest payload a CTAPHID message can carry: one initiation packet plus
/// up to 128 continuation packets, at the fixed 64-byte report size.
/// 57 + 128 * 59 = 7609.
pub const MAX_MESSAGE_SIZE: usize = 7609;

const PACKET_INITIAL_HEADER_SIZE: usize = 7;
const PACKET_INITIAL_CMD_MASK: u8 = 0x80;
const PACKET_CONT_HEADER_SIZE: usize = 5;
const PACKET_CONT_SEQ_MAX: u8 = 0x7F;

#[derive(Debug, IntoPrimitive, TryFromPrimitive, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum HidCommand {
    Ping = 0x01,
    Msg = 0x03,
    Lock = 0x04,
    Init = 0x06,
    Wink = 0x08,
    Cbor = 0x10,
    Cancel = 0x11,
    KeepAlive = 0x3B,
    Error = 0x3F,
}

#[derive(Debug, Clone)]
pub struct HidMessage {
    pub cid: u32,
    pub cmd: HidCommand,
    pub payload: Vec<u8>,
}

impl HidMessage {
    pub fn new(cid: u32, cmd: HidCommand, payload: &[u8]) -> Self {
        Self {
            cid,
            cmd,
            payload: Vec::from(payload),
        }
    }

    pub fn broadcast(cmd: HidCommand, payload: &[u8]) -> Self {
        Self::new(BROADCAST_CID, cmd, payload)
    }

    /// Segments this message into an initiation packet followed by as many
    /// continuation packets as needed. Packets are not padded here; the
    /// channel pads each one to the fixed report size before writing.
    pub fn packets(&self, packet_size: usize) -> Result<Vec<Vec<u8>>, Error> {
        if packet_size < PACKET_INITIAL_HEADER_SIZE + 1 {
            error!({ packet_size }, "Unsupported packet size");
            return Err(Error::Transport(TransportError::InvalidFraming));
        }
        if self.payload.len() > MAX_MESSAGE_SIZE {
            error!(
                { payload_len = self.payload.len() },
                "Payload exceeds maximum CTAPHID message size"
            );
            return Err(Error::Transport(TransportError::MessageTooLarge));
        }

        let mut payload = self.payload.iter().cloned().peekable();
        let mut packets = vec![];

        // Initiation packet
        let mut packet = Vec::with_capacity(packet_size);
        packet
            .write_u32::<BigEndian>(self.cid)
            .or(Err(TransportError::InvalidFraming))?;
        packet
            .write_u8(u8::from(self.cmd) | PACKET_INITIAL_CMD_MASK)
            .or(Err(TransportError::InvalidFraming))?;
        packet
            .write_u16::<BigEndian>(self.payload.len() as u16)
            .or(Err(TransportError::InvalidFraming))?;
        packet.extend(
            payload
                .by_ref()
                .take(packet_size - PACKET_INITIAL_HEADER_SIZE),
        );
        packets.push(packet);

        // Continuation packets
        let mut seq: u8 = 0;
        while payload.peek().is_some() {
            let mut packet = Vec::with_capacity(packet_size);
            packet
                .write_u32::<BigEndian>(self.cid)
                .or(Err(TransportError::InvalidFraming))?;
            packet.write_u8(seq).or(Err(TransportError::InvalidFraming))?;
            packet.extend(payload.by_ref().take(packet_size - PACKET_CONT_HEADER_SIZE));
            packets.push(packet);

            if seq == PACKET_CONT_SEQ_MAX && payload.peek().is_some() {
                error!(
                    { packet_size },
                    "Payload would exceed the maximum number of continuation packets"
                );
                return Err(Error::Transport(TransportError::MessageTooLarge));
            }
            seq = seq.wrapping_add(1);
        }

        Ok(packets)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum HidMessageParserState {
    MorePacketsExpected,
    Done,
}

#[derive(Debug)]
struct PartialMessage {
    cid: u32,
    cmd: HidCommand,
    total_len: usize,
    payload: Vec<u8>,
    next_seq: u8,
}

/// Reassembles one CTAPHID message from a sequence of reports. Enforces the
/// framing invariants: every continuation packet must carry the initiation
/// packet's channel id and the next sequence number, starting at zero.
#[derive(Debug)]
pub struct HidMessageParser {
    expected_cid: Option<u32>,
    message: Option<PartialMessage>,
}

impl HidMessageParser {
    pub fn new() -> Self {
        Self {
            expected_cid: None,
            message: None,
        }
    }

    /// A parser which additionally rejects initiation packets addressed to
    /// any channel other than `cid`.
    pub fn for_channel(cid: u32) -> Self {
        Self {
            expected_cid: Some(cid),
            message: None,
        }
    }

    pub fn update(&mut self, packet: &[u8]) -> Result<HidMessageParserState, Error> {
        if packet.iter().all(|&b| b == 0) {
            debug!("Received unexpected packet of all zeroes, ignoring");
            return Ok(self.state());
        }

        match &mut self.message {
            None => self.ingest_initiation(packet)?,
            Some(_) => self.ingest_continuation(packet)?,
        }
        Ok(self.state())
    }

    fn ingest_initiation(&mut self, packet: &[u8]) -> Result<(), Error> {
        if packet.len() < PACKET_INITIAL_HEADER_SIZE {
            error!({ len = packet.len() }, "Initiation packet is too short");
            return Err(Error::Transport(TransportError::InvalidFraming));
        }

        let mut cursor = IOCursor::new(packet);
        let cid = cursor
            .read_u32::<BigEndian>()
            .or(Err(TransportError::InvalidFraming))?;
        let cmd_byte = cursor.read_u8().or(Err(TransportError::InvalidFraming))?;
        if cmd_byte & PACKET_INITIAL_CMD_MASK == 0 {
            error!("Continuation packet received with no message in progress");
            return Err(Error::Transport(TransportError::InvalidSequence));
        }
        if let Some(expected) = self.expected_cid {
            if cid != expected && cid != BROADCAST_CID {
                error!({ cid, expected }, "Initiation packet for a foreign channel");
                return Err(Error::Transport(TransportError::InvalidChannel));
            }
        }
        let Ok(cmd) = HidCommand::try_from(cmd_byte ^ PACKET_INITIAL_CMD_MASK) else {
            error!(?cmd_byte, "Invalid HID message command");
            return Err(Error::Transport(TransportError::InvalidFraming));
        };
        let total_len = cursor
            .read_u16::<BigEndian>()
            .or(Err(TransportError::InvalidFraming))? as usize;

        let mut payload = Vec::with_capacity(total_len);
        payload.extend(
            packet[PACKET_INITIAL_HEADER_SIZE..]
                .iter()
                .take(total_len)
                .cloned(),
        );
        self.message = Some(PartialMessage {
            cid,
            cmd,
            total_len,
            payload,
            next_seq: 0,
        });
        Ok(())
    }

    fn ingest_continuation(&mut self, packet: &[u8]) -> Result<(), Error> {
        let message = self.message.as_mut().expect("message in progress");

        if packet.len() < PACKET_CONT_HEADER_SIZE + 1 {
            error!({ len = packet.len() }, "Continuation packet is too short");
            return Err(Error::Transport(TransportError::InvalidFraming));
        }

        let mut cursor = IOCursor::new(packet);
        let cid = cursor
            .read_u32::<BigEndian>()
            .or(Err(TransportError::InvalidFraming))?;
        if cid != message.cid {
            error!(
                { cid, expected = message.cid },
                "Continuation packet channel mismatch"
            );
            return Err(Error::Transport(TransportError::InvalidChannel));
        }
        let seq = cursor.read_u8().or(Err(TransportError::InvalidFraming))?;
        if seq & PACKET_INITIAL_CMD_MASK != 0 || seq != message.next_seq {
            error!(
                { seq, expected = message.next_seq },
                "Continuation packet sequence mismatch"
            );
            return Err(Error::Transport(TransportError::InvalidSequence));
        }
        message.next_seq = seq.wrapping_add(1);

        let needed = message.total_len - message.payload.len();
        message.payload.extend(
            packet[PACKET_CONT_HEADER_SIZE..]
                .iter()
                .take(needed)
                .cloned(),
        );
        Ok(())
    }

    fn state(&self) -> HidMessageParserState {
        if self.more_packets_needed() {
            HidMessageParserState::MorePacketsExpected
        } else {
            HidMessageParserState::Done
        }
    }

    fn more_packets_needed(&self) -> bool {
        match &self.message {
            None => true,
            Some(message) => message.payload.len() < message.total_len,
        }
    }

    pub fn message(&self) -> Result<HidMessage, Error> {
        let Some(message) = &self.message else {
            return Err(Error::Transport(TransportError::InvalidFraming));
        };
        if self.more_packets_needed() {
            error!("Message is not yet complete, more packets need to be ingested");
            return Err(Error::Transport(TransportError::InvalidFraming));
        }
        Ok(HidMessage::new(message.cid, message.cmd, &message.payload))
    }
}
