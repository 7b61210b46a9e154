use std::fmt::{Display, Formatter};
use std::io::{Cursor as IOCursor, Seek, SeekFrom};
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ReadBytesExt};
use rand::{thread_rng, Rng};
use tracing::{debug, instrument, trace, warn, Level};

use crate::proto::ctap2::cbor::{CborRequest, CborResponse};
use crate::proto::error::CtapError;
use crate::transport::channel::Channel;
use crate::transport::device::HidDeviceIo;
use crate::transport::error::{Error, TransportError};
use crate::transport::hid::framing::{
    HidCommand, HidMessage, HidMessageParser, HidMessageParserState, BROADCAST_CID,
};

const INIT_NONCE_LEN: usize = 8;
const INIT_PAYLOAD_LEN: usize = 17;
const INIT_TIMEOUT: Duration = Duration::from_millis(200);

/// One logical CTAPHID session over an open HID handle. Creation performs
/// the broadcast channel-initialization handshake; the allocated channel id
/// is used for every subsequent message.
pub struct HidChannel {
    handle: Box<dyn HidDeviceIo>,
    init: InitResponse,
    closed: bool,
}

impl HidChannel {
    pub fn new(handle: Box<dyn HidDeviceIo>) -> Result<Self, Error> {
        let mut channel = Self {
            handle,
            init: InitResponse::default(),
            closed: false,
        };
        channel.init = channel.init(INIT_TIMEOUT)?;
        Ok(channel)
    }

    pub fn cid(&self) -> u32 {
        self.init.cid
    }

    pub fn capabilities(&self) -> Caps {
        self.init.caps
    }

    #[instrument(level = Level::DEBUG, skip_all)]
    fn init(&mut self, timeout: Duration) -> Result<InitResponse, Error> {
        let nonce: [u8; INIT_NONCE_LEN] = thread_rng().gen();
        let request = HidMessage::broadcast(HidCommand::Init, &nonce);

        self.hid_send(&request)?;
        let response = self.hid_recv(BROADCAST_CID, timeout)?;

        if response.cmd != HidCommand::Init {
            warn!(?response.cmd, "Invalid response to INIT request");
            return Err(Error::Transport(TransportError::InvalidEndpoint));
        }

        if response.payload.len() < INIT_PAYLOAD_LEN {
            warn!(
                { len = response.payload.len() },
                "INIT payload is too small"
            );
            return Err(Error::Transport(TransportError::InvalidEndpoint));
        }

        // A stale or foreign reply must not capture this channel.
        if response.payload[0..INIT_NONCE_LEN] != nonce[0..INIT_NONCE_LEN] {
            warn!("INIT nonce mismatch. Terminating.");
            return Err(Error::Transport(TransportError::InvalidEndpoint));
        }

        let mut cursor = IOCursor::new(response.payload);
        cursor
            .seek(SeekFrom::Start(INIT_NONCE_LEN as u64))
            .or(Err(TransportError::InvalidFraming))?;

        let init = InitResponse {
            cid: cursor
                .read_u32::<BigEndian>()
                .or(Err(TransportError::InvalidFraming))?,
            protocol_version: cursor.read_u8().or(Err(TransportError::InvalidFraming))?,
            version_major: cursor.read_u8().or(Err(TransportError::InvalidFraming))?,
            version_minor: cursor.read_u8().or(Err(TransportError::InvalidFraming))?,
            version_build: cursor.read_u8().or(Err(TransportError::InvalidFraming))?,
            caps: Caps::from_bits_truncate(
                cursor.read_u8().or(Err(TransportError::InvalidFraming))?,
            ),
        };

        debug!(?init, "Channel init complete");
        Ok(init)
    }

    #[instrument(skip_all, fields(cmd = ?msg.cmd, payload_len = msg.payload.len()))]
    fn hid_send(&mut self, msg: &HidMessage) -> Result<(), Error> {
        let packet_size = self.handle.layout().output_report_len;
        let packets = msg.packets(packet_size)?;
        for (i, packet) in packets.iter().enumerate() {
            let mut report = packet.clone();
            report.resize(packet_size, 0);
            debug!({ packet = i, len = report.len() }, "Sending packet as HID report");
            trace!(?report);
            self.handle.set_output_report(0, &report)?;
        }
        Ok(())
    }

    /// Reads one complete message addressed to `cid`. Keep-alive messages
    /// are consumed transparently; a CTAPHID_ERROR message terminates the
    /// read with the device's error code. The whole wait, keep-alives
    /// included, is bounded by `timeout`: on expiry the in-flight command
    /// is cancelled and the read fails.
    #[instrument(skip_all)]
    fn hid_recv(&mut self, cid: u32, timeout: Duration) -> Result<HidMessage, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let response = self.hid_recv_message(cid, deadline)?;
            match response.cmd {
                HidCommand::KeepAlive => {
                    debug!("Ignoring HID keep-alive");
                    continue;
                }
                HidCommand::Error => {
                    let code = response
                        .payload
                        .first()
                        .and_then(|&byte| CtapError::try_from(byte).ok())
                        .unwrap_or(CtapError::Other);
                    warn!(?code, "Device signalled CTAPHID error");
                    return Err(Error::Ctap(code));
                }
                _ => return Ok(response),
            }
        }
    }

    fn hid_recv_message(&mut self, cid: u32, deadline: Instant) -> Result<HidMessage, Error> {
        let mut parser = HidMessageParser::for_channel(cid);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Timed out waiting for device response, cancelling");
                let _ = self.send_cancel();
                return Err(Error::Transport(TransportError::Timeout));
            }
            let (_report_id, report) = self.handle.get_input_report(remaining)?;
            debug!({ len = report.len() }, "Received HID report");
            trace!(?report);
            if let HidMessageParserState::Done = parser.update(&report)? {
                break;
            }
        }

        let response = parser.message()?;
        debug!({ cmd = ?response.cmd, payload_len = response.payload.len() }, "Received HID response");
        Ok(response)
    }

    fn send_cancel(&mut self) -> Result<(), Error> {
        let cid = self.init.cid;
        self.hid_send(&HidMessage::new(cid, HidCommand::Cancel, &[]))
    }

    /// Echoes `data` off the device, exercising the full framing path.
    #[instrument(skip_all, fields(len = data.len()))]
    pub fn ping(&mut self, data: &[u8], timeout: Duration) -> Result<Vec<u8>, Error> {
        let cid = self.init.cid;
        self.hid_send(&HidMessage::new(cid, HidCommand::Ping, data))?;
        let response = self.hid_recv(cid, timeout)?;
        if response.cmd != HidCommand::Ping {
            warn!(?response.cmd, "Invalid response to PING request");
            return Err(Error::Transport(TransportError::InvalidEndpoint));
        }
        Ok(response.payload)
    }

    /// Performs the manufacturer-defined identification action (e.g.
    /// flashing an LED). Returns false if the device lacks the capability.
    #[instrument(skip_all)]
    pub fn wink(&mut self, timeout: Duration) -> Result<bool, Error> {
        if !self.init.caps.contains(Caps::WINK) {
            warn!(?self.init.caps, "WINK capability is not supported");
            return Ok(false);
        }

        let cid = self.init.cid;
        self.hid_send(&HidMessage::new(cid, HidCommand::Wink, &[]))?;
        let response = self.hid_recv(cid, timeout)?;
        if response.cmd != HidCommand::Wink {
            warn!(?response.cmd, "Invalid response to WINK request");
            return Err(Error::Transport(TransportError::InvalidEndpoint));
        }
        Ok(true)
    }

    /// Places an exclusive lock on the channel for up to `seconds` (max 10).
    #[instrument(skip_all, fields(seconds))]
    pub fn lock(&mut self, seconds: u8, timeout: Duration) -> Result<(), Error> {
        let cid = self.init.cid;
        self.hid_send(&HidMessage::new(cid, HidCommand::Lock, &[seconds]))?;
        let response = self.hid_recv(cid, timeout)?;
        if response.cmd != HidCommand::Lock {
            warn!(?response.cmd, "Invalid response to LOCK request");
            return Err(Error::Transport(TransportError::InvalidEndpoint));
        }
        Ok(())
    }
}

impl Channel for HidChannel {
    fn cbor_send(&mut self, request: &CborRequest, _timeout: Duration) -> Result<(), Error> {
        let cid = self.init.cid;
        debug!({ cid }, "Sending CBOR request");
        trace!(?request);
        self.hid_send(&HidMessage::new(
            cid,
            HidCommand::Cbor,
            &request.ctap_hid_data(),
        ))
    }

    fn cbor_recv(&mut self, timeout: Duration) -> Result<CborResponse, Error> {
        let cid = self.init.cid;
        let hid_response = self.hid_recv(cid, timeout)?;
        if hid_response.cmd != HidCommand::Cbor {
            warn!(?hid_response.cmd, "Invalid response to CBOR request");
            return Err(Error::Transport(TransportError::InvalidEndpoint));
        }
        let cbor_response = CborResponse::try_from(&hid_response.payload)
            .or(Err(Error::Transport(TransportError::InvalidFraming)))?;
        debug!(
            { status = ?cbor_response.status_code },
            "Received CBOR response"
        );
        Ok(cbor_response)
    }

    fn cancel(&mut self) -> Result<(), Error> {
        self.send_cancel()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.send_cancel();
        if let Err(err) = self.handle.close() {
            warn!(?err, "Failed to close HID handle");
        }
    }
}

impl Drop for HidChannel {
    #[instrument(level = Level::DEBUG, skip_all)]
    fn drop(&mut self) {
        self.close();
    }
}

impl Display for HidChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "hid:{:08x}", self.init.cid)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InitResponse {
    pub cid: u32,
    pub protocol_version: u8,
    pub version_major: u8,
    pub version_minor: u8,
    pub version_build: u8,
    pub caps: Caps,
}

bitflags! {
    #[derive(Default, Copy, Clone, Debug)]
    pub struct Caps: u8 {
        const WINK = 0x01;
        const CBOR = 0x04;
        const NO_MSG = 0x08;
    }
}
