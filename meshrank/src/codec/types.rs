//! Decoded-frame types. DESIGN NOTES §9: dynamic payload shapes are modeled
//! as a tagged union keyed by `payloadType`, each variant carrying only its
//! valid fields, rather than one struct with a field per possible payload.

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PayloadType {
    Advert,
    Ack,
    GroupText,
    GroupData,
    TextMessage,
    Other,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RouteType {
    Flood,
    Direct,
    Transport,
}

/// Role derived from the low 4 bits of an advert's app-flags byte
/// (`spec.md` §4.2, point 3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NodeRole {
    Sensor,
    Chat,
    Repeater,
    RoomServer,
    Unknown,
}

impl NodeRole {
    pub fn from_flags_low_nibble(nibble: u8) -> Self {
        match nibble & 0x0F {
            0 => NodeRole::Sensor,
            1 => NodeRole::Chat,
            2 => NodeRole::Repeater,
            3 => NodeRole::RoomServer,
            _ => NodeRole::Unknown,
        }
    }

    pub fn is_repeater(&self) -> bool {
        matches!(self, NodeRole::Repeater)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Sensor => "sensor",
            NodeRole::Chat => "chat",
            NodeRole::Repeater => "repeater",
            NodeRole::RoomServer => "room-server",
            NodeRole::Unknown => "unknown",
        }
    }
}

/// Appdata flags byte on an advert payload: bits 0-1 carry the role (see
/// `NodeRole::from_flags_low_nibble`), remaining bits gate optional fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdvertFlags {
    pub raw: u8,
    pub has_location: bool,
    pub has_name: bool,
    pub has_feature1: bool,
    pub has_feature2: bool,
}

impl AdvertFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            raw: b,
            has_location: b & 0x10 != 0,
            has_feature1: b & 0x20 != 0,
            has_feature2: b & 0x40 != 0,
            has_name: b & 0x80 != 0,
        }
    }

    pub fn role(&self) -> NodeRole {
        NodeRole::from_flags_low_nibble(self.raw)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AdvertDecoded {
    pub pub_key: String, // 64-hex, case-folded upper
    pub timestamp: u32,
    pub flags_raw: u8,
    pub role: &'static str,
    pub is_repeater: bool,
    pub name: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct GroupTextDecoded {
    pub channel_hash: String, // single hex byte
    pub decrypted: Option<DecryptedGroupText>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DecryptedGroupText {
    pub sender: String,
    pub message: String,
    pub channel_hash: String,
}

#[derive(Clone, Debug, Serialize)]
pub enum DecodedPayload {
    Advert(AdvertDecoded),
    GroupText(GroupTextDecoded),
    Other,
}

#[derive(Clone, Debug, Serialize)]
pub struct DecodedFrame {
    pub payload_type: PayloadType,
    pub route_type: RouteType,
    pub path: Vec<String>, // ordered single-byte hex tokens
    pub path_length: usize,
    pub message_hash: String, // uppercase hex, sha256 of raw frame bytes
    pub decoded: DecodedPayload,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid hex")]
    InvalidHex,
    #[error("invalid length")]
    InvalidLength,
    #[error("unknown payload type: {0}")]
    UnknownPayloadType(u8),
    #[error("decrypt failed")]
    DecryptFailed,
}
