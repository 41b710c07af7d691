//! Request/response header codec
//!
//! Request wire form:
//!   version(1) | credential(16) | command(1) | options(1) | security(1)
//!   | flow_len(1) | flow | address
//! Anything left in the buffer after the header is the first payload.
//!
//! Decode consults the timed authenticator: lookup first, then burn, so a
//! structurally broken packet never spends the one-shot credential.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::auth::{Account, TimedAuthenticator};
use crate::error::CodecError;
use crate::logger::log;

use super::{Address, Command, RequestOptions, SecurityType, TransferKind};

/// Current protocol version byte
pub const REQUEST_VERSION: u8 = 0x01;

/// Fixed-size prefix: version + credential + command + options + security
/// + flow length
const FIXED_PREFIX: usize = 1 + 16 + 1 + 1 + 1 + 1;

/// A decoded, authenticated request. Never mutated after decode.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub version: u8,
    pub command: Command,
    pub options: RequestOptions,
    pub security: SecurityType,
    /// Flow the peer requested; empty string is carried as `None`
    pub flow: Option<String>,
    pub destination: Address,
    /// Account the presented credential resolved to
    pub account: Arc<Account>,
    /// Epoch second the matched time bucket encodes
    pub time_offset: i64,
}

impl RequestHeader {
    /// Decode a request from the front of `buf`, consuming the header and
    /// leaving any initial payload in place.
    ///
    /// `NeedMoreData` leaves the buffer untouched. With `enforce_auth`
    /// unset (fallback/sniffing paths) failures are still surfaced but
    /// logged quietly instead of raising an alarm.
    pub fn decode(
        buf: &mut BytesMut,
        authenticator: &TimedAuthenticator,
        enforce_auth: bool,
    ) -> Result<Self, CodecError> {
        if buf.len() < FIXED_PREFIX {
            return Err(CodecError::NeedMoreData);
        }

        let version = buf[0];
        if version != REQUEST_VERSION {
            return Err(CodecError::Malformed("unsupported version"));
        }

        let mut credential = [0u8; 16];
        credential.copy_from_slice(&buf[1..17]);

        let command = Command::try_from(buf[17])?;
        let options = RequestOptions::from_bits(buf[18])?;
        let security = SecurityType::try_from(buf[19])?;

        let flow_len = buf[20] as usize;
        if buf.len() < FIXED_PREFIX + flow_len {
            return Err(CodecError::NeedMoreData);
        }
        let flow_bytes = &buf[FIXED_PREFIX..FIXED_PREFIX + flow_len];
        let flow = if flow_len == 0 {
            None
        } else {
            Some(
                std::str::from_utf8(flow_bytes)
                    .map_err(|_| CodecError::Malformed("invalid flow encoding"))?
                    .to_string(),
            )
        };

        let (destination, addr_len) = Address::decode(&buf[FIXED_PREFIX + flow_len..])?;
        let header_len = FIXED_PREFIX + flow_len + addr_len;

        // Structure is fully valid; only now touch the one-shot credential.
        let (account, time_offset) = match authenticator.authenticate(&credential) {
            Ok(found) => found,
            Err(e) => {
                if enforce_auth {
                    log::protocol("request", Some("credential rejected"));
                    // Hash prefix only, enough to correlate probe bursts
                    log::debug!(
                        credential = %hex::encode(&credential[..4]),
                        error = %e,
                        "Credential rejected"
                    );
                } else {
                    log::debug!(error = %e, "Unauthenticated request (sniffing)");
                }
                return Err(e.into());
            }
        };
        // Flow rules are part of the handshake: reject before burning so
        // a mismatched request does not spend the one-shot credential.
        validate_flow(&account, flow.as_deref(), command)?;

        authenticator.burn(&credential)?;

        let _ = buf.split_to(header_len);

        Ok(Self {
            version,
            command,
            options,
            security,
            flow,
            destination,
            account,
            time_offset,
        })
    }

    /// Encode this header using `presented` as the credential hash.
    /// Client side of the family; the server uses it in tests.
    pub fn encode(&self, presented: &[u8; 16], buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u8(self.version);
        buf.put_slice(presented);
        buf.put_u8(self.command.as_u8());
        buf.put_u8(self.options.bits());
        buf.put_u8(self.security.as_u8());
        match &self.flow {
            Some(flow) => {
                // The length prefix is one byte; a longer name would
                // truncate and desynchronize the header
                if flow.len() > u8::MAX as usize {
                    return Err(CodecError::Malformed("flow name too long"));
                }
                buf.put_u8(flow.len() as u8);
                buf.put_slice(flow.as_bytes());
            }
            None => buf.put_u8(0),
        }
        self.destination.encode(buf)
    }
}

/// An account with a configured flow requires stream requests to present
/// exactly that flow; accounts without one reject any declared flow.
fn validate_flow(
    account: &Account,
    requested: Option<&str>,
    command: Command,
) -> Result<(), CodecError> {
    match (&account.flow, requested) {
        (Some(_), None) => {
            if command.transfer_kind() == TransferKind::Stream {
                Err(CodecError::FlowRequired)
            } else {
                Ok(())
            }
        }
        (Some(configured), Some(requested)) if configured != requested => {
            Err(CodecError::FlowMismatch)
        }
        (None, Some(_)) => Err(CodecError::FlowMismatch),
        _ => Ok(()),
    }
}

/// Response command payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCommand {
    /// Advise the peer to switch to another account identifier
    SwitchAccount { id: Uuid, valid_minutes: u8 },
}

const RESPONSE_CMD_NONE: u8 = 0x00;
const RESPONSE_CMD_SWITCH_ACCOUNT: u8 = 0x01;

/// Constructed once per session by the encode path
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    pub options: RequestOptions,
    pub command: Option<ResponseCommand>,
}

impl ResponseHeader {
    /// Wire form: options(1) | cmd(1) | [len(1) | payload]
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.options.bits());
        match &self.command {
            None => buf.put_u8(RESPONSE_CMD_NONE),
            Some(ResponseCommand::SwitchAccount { id, valid_minutes }) => {
                buf.put_u8(RESPONSE_CMD_SWITCH_ACCOUNT);
                buf.put_u8(17);
                buf.put_slice(id.as_bytes());
                buf.put_u8(*valid_minutes);
            }
        }
    }

    /// Decode from the front of `buf`, consuming the header
    pub fn decode(buf: &mut BytesMut) -> Result<Self, CodecError> {
        if buf.len() < 2 {
            return Err(CodecError::NeedMoreData);
        }
        let options = RequestOptions::from_bits(buf[0])?;
        let command = match buf[1] {
            RESPONSE_CMD_NONE => {
                let _ = buf.split_to(2);
                None
            }
            RESPONSE_CMD_SWITCH_ACCOUNT => {
                if buf.len() < 3 {
                    return Err(CodecError::NeedMoreData);
                }
                let len = buf[2] as usize;
                if len != 17 {
                    return Err(CodecError::Malformed("bad switch-account length"));
                }
                if buf.len() < 3 + len {
                    return Err(CodecError::NeedMoreData);
                }
                let mut id_bytes = [0u8; 16];
                id_bytes.copy_from_slice(&buf[3..19]);
                let valid_minutes = buf[19];
                let _ = buf.split_to(3 + len);
                Some(ResponseCommand::SwitchAccount {
                    id: Uuid::from_bytes(id_bytes),
                    valid_minutes,
                })
            }
            _ => return Err(CodecError::Malformed("unknown response command")),
        };
        Ok(Self { options, command })
    }
}

/// Read and decode a complete request, buffering partial reads.
///
/// Returns the header; bytes past the header stay in `buf` as the first
/// uplink payload. The buffer is capped to keep a hostile peer from
/// growing it without ever completing a header.
pub async fn read_request<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut BytesMut,
    authenticator: &TimedAuthenticator,
    enforce_auth: bool,
    max_header_size: usize,
) -> Result<RequestHeader, CodecError> {
    let mut temp = vec![0u8; 4 * 1024];
    loop {
        if !buf.is_empty() {
            match RequestHeader::decode(buf, authenticator, enforce_auth) {
                Ok(header) => return Ok(header),
                Err(CodecError::NeedMoreData) => {}
                Err(e) => return Err(e),
            }
        }

        if buf.len() > max_header_size {
            return Err(CodecError::Malformed("request header too large"));
        }

        let n = stream.read(&mut temp).await?;
        if n == 0 {
            return Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                if buf.is_empty() {
                    "connection closed before request"
                } else {
                    "connection closed with incomplete request"
                },
            )));
        }
        buf.extend_from_slice(&temp[..n]);
    }
}
