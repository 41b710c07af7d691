//! Wire protocol shared by the proxy family
//!
//! - Request/response header codec
//! - Destination addresses
//! - Streaming chunk body codec
//!
//! Bit assignments and command values here are wire-frozen; changing any
//! of them breaks interoperability with deployed peers.

mod address;
mod chunk;
mod request;

pub use address::Address;
pub use chunk::{decode_chunk, encode_chunk, encode_chunk_end, MAX_CHUNK_SIZE};
pub use request::{
    read_request, RequestHeader, ResponseCommand, ResponseHeader, REQUEST_VERSION,
};

use crate::error::CodecError;

/// Request option bits
pub const OPT_CHUNK_STREAM: u8 = 0x01;
pub const OPT_CONNECTION_REUSE: u8 = 0x02;
pub const OPT_CHUNK_MASKING: u8 = 0x04;
pub const OPT_GLOBAL_PADDING: u8 = 0x08;
pub const OPT_AUTHENTICATED_LENGTH: u8 = 0x10;

/// Flow name requesting the zero-copy raw-buffer splice path
pub const FLOW_RAW_SPLICE: &str = "raw-splice";

const OPT_ALL: u8 = OPT_CHUNK_STREAM
    | OPT_CONNECTION_REUSE
    | OPT_CHUNK_MASKING
    | OPT_GLOBAL_PADDING
    | OPT_AUTHENTICATED_LENGTH;

/// Session commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Stream transfer to a TCP destination
    Tcp = 0x01,
    /// Datagram transfer
    Udp = 0x02,
    /// Multiplexed stream transfer
    Mux = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Tcp),
            0x02 => Ok(Command::Udp),
            0x03 => Ok(Command::Mux),
            _ => Err(CodecError::Malformed("invalid command")),
        }
    }
}

impl Command {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Which relay mode this command selects
    pub fn transfer_kind(&self) -> TransferKind {
        match self {
            Command::Tcp | Command::Mux => TransferKind::Stream,
            Command::Udp => TransferKind::Datagram,
        }
    }
}

/// Relay mode decided by the command byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Stream,
    Datagram,
}

/// Negotiable cipher modes, as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityType {
    Unknown = 0,
    Legacy = 1,
    Auto = 2,
    Aes128Gcm = 3,
    ChaCha20Poly1305 = 4,
    None = 5,
    Zero = 6,
}

impl TryFrom<u8> for SecurityType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SecurityType::Unknown),
            1 => Ok(SecurityType::Legacy),
            2 => Ok(SecurityType::Auto),
            3 => Ok(SecurityType::Aes128Gcm),
            4 => Ok(SecurityType::ChaCha20Poly1305),
            5 => Ok(SecurityType::None),
            6 => Ok(SecurityType::Zero),
            _ => Err(CodecError::Malformed("invalid security type")),
        }
    }
}

impl SecurityType {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Decoded option bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestOptions {
    pub chunk_stream: bool,
    pub connection_reuse: bool,
    pub chunk_masking: bool,
    pub global_padding: bool,
    pub authenticated_length: bool,
}

impl RequestOptions {
    pub fn from_bits(bits: u8) -> Result<Self, CodecError> {
        if bits & !OPT_ALL != 0 {
            return Err(CodecError::Malformed("unknown option bits"));
        }
        Ok(Self {
            chunk_stream: bits & OPT_CHUNK_STREAM != 0,
            connection_reuse: bits & OPT_CONNECTION_REUSE != 0,
            chunk_masking: bits & OPT_CHUNK_MASKING != 0,
            global_padding: bits & OPT_GLOBAL_PADDING != 0,
            authenticated_length: bits & OPT_AUTHENTICATED_LENGTH != 0,
        })
    }

    pub fn bits(&self) -> u8 {
        let mut bits = 0u8;
        if self.chunk_stream {
            bits |= OPT_CHUNK_STREAM;
        }
        if self.connection_reuse {
            bits |= OPT_CONNECTION_REUSE;
        }
        if self.chunk_masking {
            bits |= OPT_CHUNK_MASKING;
        }
        if self.global_padding {
            bits |= OPT_GLOBAL_PADDING;
        }
        if self.authenticated_length {
            bits |= OPT_AUTHENTICATED_LENGTH;
        }
        bits
    }
}
