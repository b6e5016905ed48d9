//! Binary frame codec (§4.A, §6).
//!
//! A frame is the on-disk logical record written into a peer's inbox.
//! `sender`, `receiver`, and `payload` are opaque ciphertext blocks at this
//! layer — [`crate::crypto`] is what produces and consumes their plaintext.
//! All integers are big-endian; this module does not know or care about the
//! key, only about the shape of the bytes.

use crate::constants::{FRAME_VERSION, MAX_FRAME_SIZE, NONCE_SIZE};
use crate::error::SpeedError;

/// One of the seven frame types the bus exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Msg,
    ConReq,
    ConRes,
    InvokeMethod,
    ExitNotif,
    Ping,
    Pong,
}

impl MessageType {
    fn to_byte(self) -> u8 {
        match self {
            Self::Msg => 0,
            Self::ConReq => 1,
            Self::ConRes => 2,
            Self::InvokeMethod => 3,
            Self::ExitNotif => 4,
            Self::Ping => 5,
            Self::Pong => 6,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Msg),
            1 => Some(Self::ConReq),
            2 => Some(Self::ConRes),
            3 => Some(Self::InvokeMethod),
            4 => Some(Self::ExitNotif),
            5 => Some(Self::Ping),
            6 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// An encoded message frame. `sender`, `receiver`, and `payload` hold
/// ciphertext bytes; `nonce` is the per-frame base nonce the AEAD codec
/// derives per-field nonces from.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u8,
    pub msg_type: MessageType,
    pub sender_pid: u32,
    pub timestamp: u64,
    pub seq_num: u64,
    pub sender: Vec<u8>,
    pub receiver: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub payload: Vec<u8>,
}

impl Frame {
    /// Serialize the frame to its on-disk byte layout (§6).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            26 + self.sender.len() + 4 + self.receiver.len() + NONCE_SIZE + 4 + self.payload.len(),
        );
        out.push(self.version);
        out.push(self.msg_type.to_byte());
        out.extend_from_slice(&self.sender_pid.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.seq_num.to_be_bytes());
        out.extend_from_slice(&(self.sender.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.sender);
        out.extend_from_slice(&(self.receiver.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.receiver);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a frame from its on-disk byte layout.
    ///
    /// Fails with [`SpeedError::MalformedFrame`] on a short read, an
    /// oversized length prefix (> 16 MiB), or an unrecognized type byte.
    pub fn decode(bytes: &[u8]) -> Result<Self, SpeedError> {
        let mut cur = Cursor::new(bytes);

        let version = cur.take_u8()?;
        let type_byte = cur.take_u8()?;
        let msg_type = MessageType::from_byte(type_byte)
            .ok_or_else(|| SpeedError::MalformedFrame(format!("unknown type byte {type_byte}")))?;
        let sender_pid = cur.take_u32()?;
        let timestamp = cur.take_u64()?;
        let seq_num = cur.take_u64()?;

        let sender = cur.take_length_prefixed()?;
        let receiver = cur.take_length_prefixed()?;
        let nonce_bytes = cur.take_bytes(NONCE_SIZE)?;
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);
        let payload = cur.take_length_prefixed()?;

        Ok(Frame {
            version,
            msg_type,
            sender_pid,
            timestamp,
            seq_num,
            sender,
            receiver,
            nonce,
            payload,
        })
    }
}

/// Returns a frame with [`FRAME_VERSION`] and all other fields as given.
pub fn new_frame(
    msg_type: MessageType,
    sender_pid: u32,
    timestamp: u64,
    seq_num: u64,
    sender: Vec<u8>,
    receiver: Vec<u8>,
    nonce: [u8; NONCE_SIZE],
    payload: Vec<u8>,
) -> Frame {
    Frame {
        version: FRAME_VERSION,
        msg_type,
        sender_pid,
        timestamp,
        seq_num,
        sender,
        receiver,
        nonce,
        payload,
    }
}

/// Minimal byte cursor used only by [`Frame::decode`]; bounds-checks every read.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take_bytes(&mut self, n: usize) -> Result<&'a [u8], SpeedError> {
        if self.bytes.len() < self.pos + n {
            return Err(SpeedError::MalformedFrame("short read".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, SpeedError> {
        Ok(self.take_bytes(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, SpeedError> {
        let b = self.take_bytes(4)?;
        Ok(u32::from_be_bytes(b.try_into().expect("4 bytes")))
    }

    fn take_u64(&mut self) -> Result<u64, SpeedError> {
        let b = self.take_bytes(8)?;
        Ok(u64::from_be_bytes(b.try_into().expect("8 bytes")))
    }

    fn take_length_prefixed(&mut self) -> Result<Vec<u8>, SpeedError> {
        let len = self.take_u32()? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(SpeedError::MalformedFrame(format!(
                "length prefix {len} exceeds max frame size"
            )));
        }
        Ok(self.take_bytes(len)?.to_vec())
    }
}
