use std::convert::TryInto;

use bincode::{DefaultOptions, Options};
use serde::Serialize;

use super::{
    APPENDQ_OPCODE, APPEND_OPCODE, MAGIC_REQUEST, MAGIC_RESPONSE, PREPENDQ_OPCODE, PREPEND_OPCODE,
    QUIET_OFFSET, QUIET_OPAQUE,
};
use super::{
    ADD_OPCODE, DECREMENT_OPCODE, DELETE_OPCODE, FLUSH_OPCODE, GET_OPCODE, INCREMENT_OPCODE,
    NOOP_OPCODE, QUIT_OPCODE, REPLACE_OPCODE, SET_OPCODE, STAT_OPCODE,
};
use crate::conn::verify_key;
use crate::error::Error;

/// Size of the fixed frame header, requests and responses alike.
pub(crate) const HEADER_LEN: usize = 24;

/// The fixed 24-byte frame header. All multi-byte fields are big-endian on
/// the wire; `status` is the vbucket field on requests and always zero.
#[derive(Debug, Default, PartialEq, Clone, Copy)]
pub(crate) struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Decode a response header from exactly [`HEADER_LEN`] buffered bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let magic = bytes[0];
        if magic != MAGIC_RESPONSE {
            return Err(Error::Parse(format!("Wrong magic byte: {:#04x}", magic)));
        }
        Ok(Header {
            magic,
            opcode: bytes[1],
            key_length: u16::from_be_bytes(bytes[2..4].try_into().unwrap()),
            extras_length: bytes[4],
            data_type: bytes[5],
            status: u16::from_be_bytes(bytes[6..8].try_into().unwrap()),
            body_len: u32::from_be_bytes(bytes[8..12].try_into().unwrap()),
            opaque: u32::from_be_bytes(bytes[12..16].try_into().unwrap()),
            cas: u64::from_be_bytes(bytes[16..24].try_into().unwrap()),
        })
    }

    /// Split a complete body into its (extras, key, value) sections.
    pub fn split_body<'a>(&self, body: &'a [u8]) -> Result<(&'a [u8], &'a [u8], &'a [u8]), Error> {
        let extras_len = self.extras_length as usize;
        let key_len = self.key_length as usize;
        if body.len() != self.body_len as usize || extras_len + key_len > body.len() {
            return Err(Error::Parse("Frame body length mismatch".into()));
        }
        let (extras, rest) = body.split_at(extras_len);
        let (key, value) = rest.split_at(key_len);
        Ok((extras, key, value))
    }
}

/// Extras for set/add/replace requests.
#[derive(
    Debug, Default, PartialEq, Clone, Copy, ::serde_derive::Serialize, ::serde_derive::Deserialize,
)]
#[repr(C)]
pub struct SetExtras {
    pub flags: u32,
    pub expire: u32,
}

impl SetExtras {
    pub fn new(flags: u32, expire: u32) -> Self {
        Self { flags, expire }
    }
}

/// Extras for increment/decrement requests. `initial` is stored when the
/// key does not exist yet.
#[derive(
    Debug, Default, PartialEq, Clone, Copy, ::serde_derive::Serialize, ::serde_derive::Deserialize,
)]
#[repr(C)]
pub struct CounterExtras {
    pub delta: u64,
    pub initial: u64,
    pub expire: u32,
}

impl CounterExtras {
    pub fn new(delta: u64, initial: u64, expire: u32) -> Self {
        Self {
            delta,
            initial,
            expire,
        }
    }
}

/// Extras for flush requests.
#[derive(
    Debug, Default, PartialEq, Clone, Copy, ::serde_derive::Serialize, ::serde_derive::Deserialize,
)]
#[repr(C)]
pub struct FlushExtras {
    pub expire: u32,
}

impl FlushExtras {
    pub fn new(expire: u32) -> Self {
        Self { expire }
    }
}

/// A complete request frame ready for encoding.
#[derive(Debug, Default, PartialEq, Clone)]
pub(crate) struct Packet {
    pub header: Header,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Packet {
    fn request<E: Serialize>(
        opcode: u8,
        key: &[u8],
        extras: &E,
        value: &[u8],
    ) -> Result<Self, Error> {
        let config = DefaultOptions::new()
            .with_big_endian()
            .with_fixint_encoding();
        let extras = config
            .serialize(extras)
            .map_err(|err| Error::InvalidArgument(err.to_string()))?;

        let mut packet = Packet::default();
        packet.header.magic = MAGIC_REQUEST;
        packet.header.opcode = opcode;
        packet.header.key_length = key.len() as u16;
        packet.header.extras_length = extras.len() as u8;
        packet.header.body_len = (extras.len() + key.len() + value.len()) as u32;
        packet.key = key.into();
        packet.extras = extras;
        packet.value = value.into();
        Ok(packet)
    }

    pub fn get(key: &[u8]) -> Result<Self, Error> {
        verify_key(key)?;
        Packet::request(GET_OPCODE, key, b"", b"")
    }

    pub fn set(key: &[u8], value: &[u8], extras: SetExtras) -> Result<Self, Error> {
        verify_key(key)?;
        Packet::request(SET_OPCODE, key, &extras, value)
    }

    pub fn add(key: &[u8], value: &[u8], extras: SetExtras) -> Result<Self, Error> {
        verify_key(key)?;
        Packet::request(ADD_OPCODE, key, &extras, value)
    }

    pub fn replace(key: &[u8], value: &[u8], extras: SetExtras) -> Result<Self, Error> {
        verify_key(key)?;
        Packet::request(REPLACE_OPCODE, key, &extras, value)
    }

    pub fn delete(key: &[u8]) -> Result<Self, Error> {
        verify_key(key)?;
        Packet::request(DELETE_OPCODE, key, b"", b"")
    }

    pub fn increment(key: &[u8], extras: CounterExtras) -> Result<Self, Error> {
        verify_key(key)?;
        Packet::request(INCREMENT_OPCODE, key, &extras, b"")
    }

    pub fn decrement(key: &[u8], extras: CounterExtras) -> Result<Self, Error> {
        verify_key(key)?;
        Packet::request(DECREMENT_OPCODE, key, &extras, b"")
    }

    pub fn flush(extras: FlushExtras) -> Result<Self, Error> {
        Packet::request(FLUSH_OPCODE, b"", &extras, b"")
    }

    pub fn noop() -> Result<Self, Error> {
        Packet::request(NOOP_OPCODE, b"", b"", b"")
    }

    pub fn quit() -> Result<Self, Error> {
        Packet::request(QUIT_OPCODE, b"", b"", b"")
    }

    pub fn append(key: &[u8], value: &[u8]) -> Result<Self, Error> {
        verify_key(key)?;
        Packet::request(APPEND_OPCODE, key, b"", value)
    }

    pub fn prepend(key: &[u8], value: &[u8]) -> Result<Self, Error> {
        verify_key(key)?;
        Packet::request(PREPEND_OPCODE, key, b"", value)
    }

    // An empty stat key asks for the whole statistics dump, so the cache-key
    // rules do not apply here.
    pub fn stat(key: &[u8]) -> Result<Self, Error> {
        Packet::request(STAT_OPCODE, key, b"", b"")
    }

    /// Convert into the quiet variant of the same request: the server stays
    /// silent on success, and the opaque marker lets the parser recognize
    /// (and discard) the error responses quiet commands can still produce.
    pub fn quiet(mut self) -> Self {
        self.header.opcode = match self.header.opcode {
            APPEND_OPCODE => APPENDQ_OPCODE,
            PREPEND_OPCODE => PREPENDQ_OPCODE,
            opcode => opcode + QUIET_OFFSET,
        };
        self.header.opaque = QUIET_OPAQUE;
        self
    }
}

impl From<Packet> for Vec<u8> {
    fn from(p: Packet) -> Self {
        vec![
            &p.header.magic.to_be_bytes()[..],
            &p.header.opcode.to_be_bytes()[..],
            &p.header.key_length.to_be_bytes()[..],
            &p.header.extras_length.to_be_bytes()[..],
            &p.header.data_type.to_be_bytes()[..],
            &p.header.status.to_be_bytes()[..],
            &p.header.body_len.to_be_bytes()[..],
            &p.header.opaque.to_be_bytes()[..],
            &p.header.cas.to_be_bytes()[..],
            &p.extras[..],
            &p.key[..],
            &p.value[..],
        ]
        .concat()
    }
}
