//! Memcached binary protocol definitions.
//!
//! Requests and responses share a fixed 24-byte header followed by extras,
//! key and value segments. Request frames carry magic `0x80`, response
//! frames `0x81`.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::{BufMut, Bytes, BytesMut};

pub(crate) const HEADER_LEN: usize = 24;
pub(crate) const REQUEST_MAGIC: u8 = 0x80;
pub(crate) const RESPONSE_MAGIC: u8 = 0x81;

static OPAQUE_SEQ: AtomicU32 = AtomicU32::new(0);

/// Produce the next request-chosen opaque token.
///
/// The opaque is echoed back by the server and is used for diagnostics and
/// for disambiguating skipped quiet commands, never as a correlation key.
pub(crate) fn next_opaque() -> u32 {
    OPAQUE_SEQ.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff
}

/// Command opcodes of the binary protocol.
///
/// The `*Q` variants are "quiet": the server sends no response on success
/// and replies only on error. The SASL family is reserved; the client
/// rejects it as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    Verbosity = 0x1b,
    Touch = 0x1c,
    Gat = 0x1d,
    GatQ = 0x1e,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    /// `Gets` is `Get` on the wire; the distinction is that the caller wants
    /// the CAS token from the response header.
    Gets = 0x48,
    GetsQ = 0x49,
}

impl Opcode {
    /// Byte value sent on the wire. `Gets`/`GetsQ` are client-side aliases
    /// that encode as plain `Get`/`GetQ`.
    pub fn wire_value(self) -> u8 {
        match self {
            Opcode::Gets => Opcode::Get as u8,
            Opcode::GetsQ => Opcode::GetQ as u8,
            other => other as u8,
        }
    }

    /// Whether the server suppresses the success response for this opcode.
    pub fn is_quiet(self) -> bool {
        matches!(
            self,
            Opcode::GetQ
                | Opcode::GetKQ
                | Opcode::SetQ
                | Opcode::AddQ
                | Opcode::ReplaceQ
                | Opcode::DeleteQ
                | Opcode::IncrementQ
                | Opcode::DecrementQ
                | Opcode::QuitQ
                | Opcode::FlushQ
                | Opcode::AppendQ
                | Opcode::PrependQ
                | Opcode::GatQ
                | Opcode::GetsQ
        )
    }
}

/// Response status field. Zero means success; everything else is an error
/// reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    NoError,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    NonNumericValue,
    UnknownCommand,
    OutOfMemory,
    Other(u16),
}

impl Default for Status {
    fn default() -> Self {
        Status::NoError
    }
}

impl Status {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            0x0000 => Status::NoError,
            0x0001 => Status::KeyNotFound,
            0x0002 => Status::KeyExists,
            0x0003 => Status::ValueTooLarge,
            0x0004 => Status::InvalidArguments,
            0x0005 => Status::ItemNotStored,
            0x0006 => Status::NonNumericValue,
            0x0081 => Status::UnknownCommand,
            0x0082 => Status::OutOfMemory,
            other => Status::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Status::NoError => 0x0000,
            Status::KeyNotFound => 0x0001,
            Status::KeyExists => 0x0002,
            Status::ValueTooLarge => 0x0003,
            Status::InvalidArguments => 0x0004,
            Status::ItemNotStored => 0x0005,
            Status::NonNumericValue => 0x0006,
            Status::UnknownCommand => 0x0081,
            Status::OutOfMemory => 0x0082,
            Status::Other(raw) => raw,
        }
    }

    pub fn is_error(self) -> bool {
        self != Status::NoError
    }
}

/// Request extras segment. Each command family carries a fixed shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Extras {
    None,
    /// `Set`/`Add`/`Replace`: flags then expiration, 8 bytes.
    Store { flags: u32, expiration: u32 },
    /// `Increment`/`Decrement`: delta, initial value, expiration, 20 bytes.
    Counter { delta: u64, initial: u64, expiration: u32 },
    /// `Touch`/`GAT`/`Flush` with a deadline: expiration only, 4 bytes.
    Expiration(u32),
    /// `Verbosity`: the new verbosity level, 4 bytes.
    Verbosity(u32),
}

impl Extras {
    pub(crate) fn len(self) -> usize {
        match self {
            Extras::None => 0,
            Extras::Store { .. } => 8,
            Extras::Counter { .. } => 20,
            Extras::Expiration(_) | Extras::Verbosity(_) => 4,
        }
    }

    pub(crate) fn write_to(self, buf: &mut BytesMut) {
        match self {
            Extras::None => {}
            Extras::Store { flags, expiration } => {
                buf.put_u32(flags);
                buf.put_u32(expiration);
            }
            Extras::Counter { delta, initial, expiration } => {
                buf.put_u64(delta);
                buf.put_u64(initial);
                buf.put_u32(expiration);
            }
            Extras::Expiration(value) | Extras::Verbosity(value) => {
                buf.put_u32(value);
            }
        }
    }
}

/// One request frame, ready to be encoded onto a connection.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub op: Opcode,
    pub opaque: u32,
    pub cas: u64,
    pub vbucket: u16,
    pub extras: Extras,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl Request {
    pub(crate) fn new(op: Opcode) -> Self {
        Self {
            op,
            opaque: 0,
            cas: 0,
            vbucket: 0,
            extras: Extras::None,
            key: None,
            value: None,
        }
    }

    pub(crate) fn key_len(&self) -> usize {
        self.key.as_ref().map(Bytes::len).unwrap_or(0)
    }

    pub(crate) fn value_len(&self) -> usize {
        self.value.as_ref().map(Bytes::len).unwrap_or(0)
    }

    /// Full on-wire size of this frame.
    pub(crate) fn packet_len(&self) -> usize {
        HEADER_LEN + self.extras.len() + self.key_len() + self.value_len()
    }

    /// Write the 24-byte header plus extras into `buf`.
    pub(crate) fn write_header_and_extras(&self, buf: &mut BytesMut) {
        let total_body = self.extras.len() + self.key_len() + self.value_len();
        buf.put_u8(REQUEST_MAGIC);
        buf.put_u8(self.op.wire_value());
        buf.put_u16(self.key_len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(0); // data type
        buf.put_u16(self.vbucket);
        buf.put_u32(total_body as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        self.extras.write_to(buf);
    }
}

/// Parsed response header fields, before extras/key/value are consumed.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ResponseHeader {
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub status: Status,
    pub total_body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_classification_matches_wire_table() {
        assert!(Opcode::GetQ.is_quiet());
        assert!(Opcode::SetQ.is_quiet());
        assert!(Opcode::GetsQ.is_quiet());
        assert!(!Opcode::Get.is_quiet());
        assert!(!Opcode::Stat.is_quiet());
        assert!(!Opcode::Noop.is_quiet());
    }

    #[test]
    fn gets_encodes_as_get_on_the_wire() {
        assert_eq!(Opcode::Gets.wire_value(), 0x00);
        assert_eq!(Opcode::GetsQ.wire_value(), 0x09);
        assert_eq!(Opcode::Touch.wire_value(), 0x1c);
    }

    #[test]
    fn status_round_trips() {
        for raw in [0x0000u16, 0x0001, 0x0005, 0x0081, 0x1234] {
            assert_eq!(Status::from_u16(raw).as_u16(), raw);
        }
        assert!(!Status::NoError.is_error());
        assert!(Status::KeyNotFound.is_error());
    }

    #[test]
    fn header_layout_is_24_bytes_plus_extras() {
        let mut request = Request::new(Opcode::Set);
        request.opaque = 0x2a;
        request.cas = 7;
        request.extras = Extras::Store { flags: 0xdead_beef, expiration: 60 };
        request.key = Some(Bytes::from_static(b"HELLO"));
        request.value = Some(Bytes::from_static(b"WORLD"));

        let mut buf = BytesMut::new();
        request.write_header_and_extras(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN + 8);
        assert_eq!(buf[0], REQUEST_MAGIC);
        assert_eq!(buf[1], 0x01);
        // key length big-endian
        assert_eq!(&buf[2..4], &[0x00, 0x05]);
        assert_eq!(buf[4], 8);
        // total body = extras + key + value
        assert_eq!(&buf[8..12], &[0x00, 0x00, 0x00, 0x12]);
        assert_eq!(&buf[12..16], &[0x00, 0x00, 0x00, 0x2a]);
        assert_eq!(&buf[16..24], &[0, 0, 0, 0, 0, 0, 0, 7]);
        assert_eq!(&buf[24..28], &[0xde, 0xad, 0xbe, 0xef]);
    }
}
