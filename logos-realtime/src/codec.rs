//! Binary wire codec for the realtime protocol.
//!
//! Wire format (lib0 variable-length integers):
//! ```text
//! ┌──────────────────┬──────────────────────────────┐
//! │ category         │ payload                      │
//! │ varuint          │ remainder of the frame       │
//! └──────────────────┴──────────────────────────────┘
//!
//! category:   0 = SYNC   1 = AWARENESS   100 = CONTROL
//!
//! SYNC payload      = varuint(sync_type) • varbuf(data)
//! AWARENESS payload = varbuf(awareness_update)
//! CONTROL payload   = varuint(sub_tag) • body
//! ```
//!
//! Frame decoding only looks at the leading category. SYNC and AWARENESS
//! payloads stay opaque until a handler asks for them to be parsed, so a
//! malformed payload never costs the connection.

use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{StateVector, Update};

use crate::error::CodecError;

/// Frame category tags.
pub mod category {
    /// Document synchronization (state vectors and updates)
    pub const SYNC: u32 = 0;
    /// Presence (cursor, selection, display identity)
    pub const AWARENESS: u32 = 1;
    /// Out-of-band control events
    pub const CONTROL: u32 = 100;
}

/// Sync message tags inside a SYNC payload.
pub mod sync_type {
    /// State vector summary of what the sender already has
    pub const STEP1: u32 = 0;
    /// Updates the receiver of a Step1 is missing
    pub const STEP2: u32 = 1;
    /// Incremental document update
    pub const UPDATE: u32 = 2;
}

/// Sub-tags inside a CONTROL payload.
pub mod control_type {
    pub const PERMISSIONS_CHANGED: u32 = 0;
    pub const ACCESS_REVOKED: u32 = 1;
    pub const SHUTDOWN_NOTICE: u32 = 2;
    pub const WRITE_REJECTED: u32 = 3;
    pub const PING: u32 = 4;
    pub const PONG: u32 = 5;
}

/// A decoded top-level frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Sync(Vec<u8>),
    Awareness(Vec<u8>),
    Control(Vec<u8>),
    /// Category this server does not understand. Ignored, never an error.
    Unknown { category: u32, payload: Vec<u8> },
}

impl Frame {
    /// Decode a frame. Fails only when the leading category is missing or malformed.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let (tag, payload) = split_leading_var(data)?;
        let payload = payload.to_vec();

        Ok(match tag {
            category::SYNC => Frame::Sync(payload),
            category::AWARENESS => Frame::Awareness(payload),
            category::CONTROL => Frame::Control(payload),
            other => Frame::Unknown {
                category: other,
                payload,
            },
        })
    }

    /// Encode this frame to bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Sync(payload) => encode(category::SYNC, payload),
            Frame::Awareness(payload) => encode(category::AWARENESS, payload),
            Frame::Control(payload) => encode(category::CONTROL, payload),
            Frame::Unknown { category, payload } => encode(*category, payload),
        }
    }

    /// The numeric category this frame was decoded from.
    pub fn category(&self) -> u32 {
        match self {
            Frame::Sync(_) => category::SYNC,
            Frame::Awareness(_) => category::AWARENESS,
            Frame::Control(_) => category::CONTROL,
            Frame::Unknown { category, .. } => *category,
        }
    }

    pub fn sync(msg: &SyncMessage) -> Self {
        Frame::Sync(msg.encode())
    }

    pub fn control(msg: &ControlMessage) -> Self {
        Frame::Control(msg.encode())
    }
}

/// Encode a category and a raw payload into a frame.
pub fn encode(category: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 2);
    buf.write_var(category);
    buf.extend_from_slice(payload);
    buf
}

/// Read a leading varuint and return it together with the untouched remainder.
///
/// Overlong encodings are rejected so that the remainder offset is exact.
fn split_leading_var(data: &[u8]) -> Result<(u32, &[u8]), CodecError> {
    if data.is_empty() {
        return Err(CodecError::Empty);
    }

    let mut cursor = Cursor::new(data);
    let tag = cursor
        .read_var::<u32>()
        .map_err(|e| CodecError::Malformed(format!("Failed to read leading varint: {e}")))?;

    let mut canonical = Vec::with_capacity(5);
    canonical.write_var(tag);
    if !data.starts_with(&canonical) {
        return Err(CodecError::Malformed(format!(
            "Non-canonical varint encoding for tag {tag}"
        )));
    }

    Ok((tag, &data[canonical.len()..]))
}

/// A SYNC payload: the two-step handshake plus incremental updates.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Encoded state vector of the sender.
    Step1(Vec<u8>),
    /// Encoded update answering a Step1.
    Step2(Vec<u8>),
    /// Encoded incremental update.
    Update(Vec<u8>),
}

impl SyncMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(payload);
        let tag = cursor
            .read_var::<u32>()
            .map_err(|e| CodecError::Malformed(format!("Failed to read sync message tag: {e}")))?;
        let data = cursor
            .read_buf()
            .map_err(|e| CodecError::Malformed(format!("Failed to read sync message data: {e}")))?
            .to_vec();

        match tag {
            sync_type::STEP1 => Ok(SyncMessage::Step1(data)),
            sync_type::STEP2 => Ok(SyncMessage::Step2(data)),
            sync_type::UPDATE => Ok(SyncMessage::Update(data)),
            other => Err(CodecError::UnknownSyncType(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (tag, data) = match self {
            SyncMessage::Step1(data) => (sync_type::STEP1, data),
            SyncMessage::Step2(data) => (sync_type::STEP2, data),
            SyncMessage::Update(data) => (sync_type::UPDATE, data),
        };
        let mut buf = Vec::with_capacity(data.len() + 6);
        buf.write_var(tag);
        buf.write_buf(data);
        buf
    }

    /// Step1 carrying the given state vector.
    pub fn step1(sv: &StateVector) -> Self {
        SyncMessage::Step1(sv.encode_v1())
    }
}

/// True for an update that carries neither blocks nor deletions, the
/// Step2 an up-to-date client sends. Undecodable input is not empty.
pub fn is_empty_update(update: &[u8]) -> bool {
    Update::decode_v1(update).is_ok_and(|update| update.is_empty())
}

/// A CONTROL payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Server → client: the document's permissions changed, access was re-checked.
    PermissionsChanged,
    /// Server → client: read access is gone, the connection closes next.
    AccessRevoked,
    /// Server → client: the server is going away.
    ShutdownNotice,
    /// Server → client: an update was dropped because the client may not write.
    WriteRejected,
    /// Client → server heartbeat.
    Ping,
    /// Answer to a `Ping`.
    Pong,
    /// Sub-tag this server does not understand.
    Unknown { tag: u32, body: Vec<u8> },
}

impl ControlMessage {
    /// Decode a CONTROL payload. Unknown sub-tags are not an error.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let (tag, body) = split_leading_var(payload)?;
        Ok(match tag {
            control_type::PERMISSIONS_CHANGED => ControlMessage::PermissionsChanged,
            control_type::ACCESS_REVOKED => ControlMessage::AccessRevoked,
            control_type::SHUTDOWN_NOTICE => ControlMessage::ShutdownNotice,
            control_type::WRITE_REJECTED => ControlMessage::WriteRejected,
            control_type::PING => ControlMessage::Ping,
            control_type::PONG => ControlMessage::Pong,
            other => ControlMessage::Unknown {
                tag: other,
                body: body.to_vec(),
            },
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ControlMessage::PermissionsChanged => buf.write_var(control_type::PERMISSIONS_CHANGED),
            ControlMessage::AccessRevoked => buf.write_var(control_type::ACCESS_REVOKED),
            ControlMessage::ShutdownNotice => buf.write_var(control_type::SHUTDOWN_NOTICE),
            ControlMessage::WriteRejected => buf.write_var(control_type::WRITE_REJECTED),
            ControlMessage::Ping => buf.write_var(control_type::PING),
            ControlMessage::Pong => buf.write_var(control_type::PONG),
            ControlMessage::Unknown { tag, body } => {
                buf.write_var(*tag);
                buf.extend_from_slice(body);
            }
        }
        buf
    }
}

/// One client's entry inside an awareness update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u32,
    /// JSON state; `"null"` removes the client.
    pub state: String,
}

impl AwarenessEntry {
    pub fn is_removal(&self) -> bool {
        self.state == "null"
    }
}

/// Parsed AWARENESS payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    /// Parse `varbuf(varuint count • count × (varuint id • varuint clock • varstring state))`.
    pub fn decode(payload: &[u8]) -> Result<Self, CodecError> {
        let mut outer = Cursor::new(payload);
        let inner = outer
            .read_buf()
            .map_err(|e| CodecError::Malformed(format!("Failed to read awareness update: {e}")))?;

        let mut cursor = Cursor::new(inner);
        let malformed = |e: yrs::encoding::read::Error| {
            CodecError::Malformed(format!("Failed to read awareness entry: {e}"))
        };
        let count = cursor.read_var::<u32>().map_err(malformed)?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let client_id = cursor.read_var::<u64>().map_err(malformed)?;
            let clock = cursor.read_var::<u32>().map_err(malformed)?;
            let state = cursor.read_string().map_err(malformed)?.to_string();
            entries.push(AwarenessEntry {
                client_id,
                clock,
                state,
            });
        }
        Ok(Self { entries })
    }

    /// Encode as an AWARENESS payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut inner = Vec::new();
        inner.write_var(self.entries.len() as u32);
        for entry in &self.entries {
            inner.write_var(entry.client_id);
            inner.write_var(entry.clock);
            inner.write_string(&entry.state);
        }
        let mut buf = Vec::with_capacity(inner.len() + 5);
        buf.write_buf(&inner);
        buf
    }

    /// Update removing each `(client_id, last_clock)` pair.
    pub fn removal(clients: impl IntoIterator<Item = (u64, u32)>) -> Self {
        Self {
            entries: clients
                .into_iter()
                .map(|(client_id, clock)| AwarenessEntry {
                    client_id,
                    clock: clock.wrapping_add(1),
                    state: "null".to_string(),
                })
                .collect(),
        }
    }
}
