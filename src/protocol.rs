//! Quarry wire protocol message encoding and decoding.
//!
//! All messages are framed as `type: u8, length: u32` (big-endian, counting
//! the length field but not the type byte) followed by the body. Client
//! messages encode themselves into a shared [`Writer`] so several can be
//! flushed in one write; server messages decode from a framed [`Reader`].

use crate::buffer::{Reader, Writer};
use crate::error::{Error, ErrorCode, Result};

/// Protocol version sent in the client handshake.
pub const PROTO_VER_MAJOR: u16 = 0;
pub const PROTO_VER_MINOR: u16 = 13;

// Client message types.
pub const CLIENT_HANDSHAKE: u8 = 0x56;
pub const AUTH_SASL_INITIAL_RESPONSE: u8 = 0x70;
pub const AUTH_SASL_RESPONSE: u8 = 0x72;
pub const PREPARE: u8 = 0x50;
pub const DESCRIBE_STATEMENT: u8 = 0x44;
pub const EXECUTE: u8 = 0x45;
pub const OPTIMISTIC_EXECUTE: u8 = 0x4f;
pub const EXECUTE_SCRIPT: u8 = 0x51;
pub const SYNC: u8 = 0x53;
pub const TERMINATE: u8 = 0x58;

// Server message types.
pub const SERVER_HANDSHAKE: u8 = 0x76;
pub const AUTHENTICATION: u8 = 0x52;
pub const SERVER_KEY_DATA: u8 = 0x4b;
pub const PARAMETER_STATUS: u8 = 0x53;
pub const READY_FOR_COMMAND: u8 = 0x5a;
pub const PREPARE_COMPLETE: u8 = 0x31;
pub const COMMAND_DATA_DESCRIPTION: u8 = 0x54;
pub const DATA: u8 = 0x44;
pub const COMMAND_COMPLETE: u8 = 0x43;
pub const ERROR_RESPONSE: u8 = 0x45;
pub const LOG_MESSAGE: u8 = 0x4c;

/// Describe aspect requesting the full data description.
pub const ASPECT_DATA_DESCRIPTION: u8 = 0x54;

/// Header code carrying the allowed-capabilities mask.
pub const HEADER_ALLOW_CAPABILITIES: u16 = 0xff04;

/// All capabilities enabled.
pub const CAPABILITIES_ALL: u64 = 0xffff_ffff_ffff_ffff;

/// Requested or announced row count of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cardinality {
    NoResult = 0x6e,
    AtMostOne = 0x6f,
    One = 0x41,
    Many = 0x6d,
}

impl Cardinality {
    pub fn from_u8(b: u8) -> Result<Self> {
        match b {
            0x6e => Ok(Cardinality::NoResult),
            0x6f => Ok(Cardinality::AtMostOne),
            0x41 => Ok(Cardinality::One),
            0x6d => Ok(Cardinality::Many),
            other => Err(Error::Protocol(format!(
                "unknown cardinality byte 0x{:02x}",
                other
            ))),
        }
    }
}

/// Result serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IoFormat {
    Binary = 0x62,
    Json = 0x6a,
}

/// Server transaction state reported by ReadyForCommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    InTransaction,
    InError,
}

impl TxState {
    pub fn from_u8(b: u8) -> Result<Self> {
        match b {
            0x49 => Ok(TxState::Idle),
            0x54 => Ok(TxState::InTransaction),
            0x45 => Ok(TxState::InError),
            other => Err(Error::Protocol(format!(
                "unknown transaction state byte 0x{:02x}",
                other
            ))),
        }
    }
}

fn write_headers(w: &mut Writer, headers: &[(u16, Vec<u8>)]) {
    w.push_u16(headers.len() as u16);
    for (code, value) in headers {
        w.push_u16(*code);
        w.push_len_prefixed(value);
    }
}

fn skip_headers(r: &mut Reader) -> Result<()> {
    let n = r.pop_u16()?;
    for _ in 0..n {
        r.pop_u16()?;
        r.pop_len_prefixed()?;
    }
    Ok(())
}

fn capability_headers(allow_capabilities: u64) -> [(u16, Vec<u8>); 1] {
    [(
        HEADER_ALLOW_CAPABILITIES,
        allow_capabilities.to_be_bytes().to_vec(),
    )]
}

/// Client-to-server messages.
pub trait ClientMessage {
    fn encode(&self, w: &mut Writer) -> Result<()>;
}

/// Opening message of the handshake.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    pub user: String,
    pub database: String,
}

impl ClientMessage for ClientHandshake {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(CLIENT_HANDSHAKE)?;
        w.push_u16(PROTO_VER_MAJOR);
        w.push_u16(PROTO_VER_MINOR);
        w.push_u16(2);
        w.push_str("user");
        w.push_str(&self.user);
        w.push_str("database");
        w.push_str(&self.database);
        // no protocol extensions
        w.push_u16(0);
        w.end_message()
    }
}

/// First SCRAM message, naming the mechanism.
#[derive(Debug, Clone)]
pub struct SaslInitialResponse {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl ClientMessage for SaslInitialResponse {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(AUTH_SASL_INITIAL_RESPONSE)?;
        w.push_str(&self.mechanism);
        w.push_len_prefixed(&self.data);
        w.end_message()
    }
}

/// Subsequent SCRAM messages.
#[derive(Debug, Clone)]
pub struct SaslResponse {
    pub data: Vec<u8>,
}

impl ClientMessage for SaslResponse {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(AUTH_SASL_RESPONSE)?;
        w.push_len_prefixed(&self.data);
        w.end_message()
    }
}

/// Compile a command and negotiate its type descriptors.
#[derive(Debug, Clone)]
pub struct Prepare {
    pub io_format: IoFormat,
    pub expected_cardinality: Cardinality,
    pub statement_name: Vec<u8>,
    pub command: String,
    pub allow_capabilities: u64,
}

impl ClientMessage for Prepare {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(PREPARE)?;
        write_headers(w, &capability_headers(self.allow_capabilities));
        w.push_u8(self.io_format as u8);
        w.push_u8(self.expected_cardinality as u8);
        w.push_len_prefixed(&self.statement_name);
        w.push_str(&self.command);
        w.end_message()
    }
}

/// Request the full data description of a prepared statement.
#[derive(Debug, Clone)]
pub struct DescribeStatement {
    pub aspect: u8,
    pub statement_name: Vec<u8>,
}

impl ClientMessage for DescribeStatement {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(DESCRIBE_STATEMENT)?;
        write_headers(w, &[]);
        w.push_u8(self.aspect);
        w.push_len_prefixed(&self.statement_name);
        w.end_message()
    }
}

/// Execute a prepared statement. `arguments` is the blob produced by the
/// argument codec, already carrying its own length prefix.
#[derive(Debug, Clone)]
pub struct Execute {
    pub statement_name: Vec<u8>,
    pub arguments: Vec<u8>,
}

impl ClientMessage for Execute {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(EXECUTE)?;
        write_headers(w, &capability_headers(CAPABILITIES_ALL));
        w.push_len_prefixed(&self.statement_name);
        w.push_bytes(&self.arguments);
        w.end_message()
    }
}

/// Prepare and execute in one round trip against cached descriptor ids.
#[derive(Debug, Clone)]
pub struct OptimisticExecute {
    pub io_format: IoFormat,
    pub expected_cardinality: Cardinality,
    pub command: String,
    pub input_id: [u8; 16],
    pub output_id: [u8; 16],
    pub arguments: Vec<u8>,
}

impl ClientMessage for OptimisticExecute {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(OPTIMISTIC_EXECUTE)?;
        write_headers(w, &capability_headers(CAPABILITIES_ALL));
        w.push_u8(self.io_format as u8);
        w.push_u8(self.expected_cardinality as u8);
        w.push_str(&self.command);
        w.push_uuid(self.input_id);
        w.push_uuid(self.output_id);
        w.push_bytes(&self.arguments);
        w.end_message()
    }
}

/// Run a bare script without preparing or returning rows.
#[derive(Debug, Clone)]
pub struct ExecuteScript {
    pub script: String,
}

impl ClientMessage for ExecuteScript {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(EXECUTE_SCRIPT)?;
        write_headers(w, &[]);
        w.push_str(&self.script);
        w.end_message()
    }
}

/// End of a command sequence; the server answers with ReadyForCommand.
#[derive(Debug, Clone, Copy)]
pub struct Sync;

impl ClientMessage for Sync {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(SYNC)?;
        w.end_message()
    }
}

/// Close the connection.
#[derive(Debug, Clone, Copy)]
pub struct Terminate;

impl ClientMessage for Terminate {
    fn encode(&self, w: &mut Writer) -> Result<()> {
        w.begin_message(TERMINATE)?;
        w.end_message()
    }
}

/// Authentication sub-states of the `0x52` message.
#[derive(Debug, Clone)]
pub enum Authentication {
    Ok,
    SaslRequired { methods: Vec<String> },
    SaslContinue { data: Vec<u8> },
    SaslFinal { data: Vec<u8> },
}

/// Server-to-client messages.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    ServerHandshake {
        major: u16,
        minor: u16,
    },
    Authentication(Authentication),
    ServerKeyData {
        data: [u8; 32],
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    ReadyForCommand {
        tx_state: TxState,
    },
    PrepareComplete {
        cardinality: Cardinality,
        input_id: [u8; 16],
        output_id: [u8; 16],
    },
    CommandDataDescription {
        cardinality: Cardinality,
        input_id: [u8; 16],
        input_typedesc: Vec<u8>,
        output_id: [u8; 16],
        output_typedesc: Vec<u8>,
    },
    /// One row per element; each element retains its own length prefix so
    /// the result codec can decode it directly.
    Data {
        elements: Vec<Vec<u8>>,
    },
    CommandComplete {
        status: String,
    },
    ErrorResponse {
        severity: u8,
        code: ErrorCode,
        message: String,
    },
    LogMessage {
        severity: u8,
        code: u32,
        text: String,
    },
}

impl ServerMessage {
    /// Decode the current message of `r` (positioned by `next_message`).
    pub fn decode(r: &mut Reader) -> Result<ServerMessage> {
        match r.msg_type() {
            SERVER_HANDSHAKE => {
                let major = r.pop_u16()?;
                let minor = r.pop_u16()?;
                let n_ext = r.pop_u16()?;
                for _ in 0..n_ext {
                    r.pop_str()?;
                    skip_headers(r)?;
                }
                Ok(ServerMessage::ServerHandshake { major, minor })
            }
            AUTHENTICATION => Self::decode_authentication(r),
            SERVER_KEY_DATA => {
                let bytes = r.pop_bytes(32)?;
                let mut data = [0u8; 32];
                data.copy_from_slice(bytes);
                Ok(ServerMessage::ServerKeyData { data })
            }
            PARAMETER_STATUS => {
                let name = r.pop_str()?;
                let value = r.pop_str()?;
                Ok(ServerMessage::ParameterStatus { name, value })
            }
            READY_FOR_COMMAND => {
                skip_headers(r)?;
                let tx_state = TxState::from_u8(r.pop_u8()?)?;
                Ok(ServerMessage::ReadyForCommand { tx_state })
            }
            PREPARE_COMPLETE => {
                skip_headers(r)?;
                let cardinality = Cardinality::from_u8(r.pop_u8()?)?;
                let input_id = r.pop_uuid()?;
                let output_id = r.pop_uuid()?;
                Ok(ServerMessage::PrepareComplete {
                    cardinality,
                    input_id,
                    output_id,
                })
            }
            COMMAND_DATA_DESCRIPTION => {
                skip_headers(r)?;
                let cardinality = Cardinality::from_u8(r.pop_u8()?)?;
                let input_id = r.pop_uuid()?;
                let input_typedesc = r.pop_len_prefixed()?.to_vec();
                let output_id = r.pop_uuid()?;
                let output_typedesc = r.pop_len_prefixed()?.to_vec();
                Ok(ServerMessage::CommandDataDescription {
                    cardinality,
                    input_id,
                    input_typedesc,
                    output_id,
                    output_typedesc,
                })
            }
            DATA => {
                let count = r.pop_u16()? as usize;
                let mut elements = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = r.pop_u32()?;
                    let data = r.pop_bytes(len as usize)?;
                    let mut element = Vec::with_capacity(4 + data.len());
                    element.extend_from_slice(&len.to_be_bytes());
                    element.extend_from_slice(data);
                    elements.push(element);
                }
                Ok(ServerMessage::Data { elements })
            }
            COMMAND_COMPLETE => {
                skip_headers(r)?;
                let status = r.pop_str()?;
                Ok(ServerMessage::CommandComplete { status })
            }
            ERROR_RESPONSE => {
                let severity = r.pop_u8()?;
                let code = ErrorCode(r.pop_u32()?);
                let message = r.pop_str()?;
                skip_headers(r)?;
                Ok(ServerMessage::ErrorResponse {
                    severity,
                    code,
                    message,
                })
            }
            LOG_MESSAGE => {
                let severity = r.pop_u8()?;
                let code = r.pop_u32()?;
                let text = r.pop_str()?;
                skip_headers(r)?;
                Ok(ServerMessage::LogMessage {
                    severity,
                    code,
                    text,
                })
            }
            other => Err(Error::Protocol(format!(
                "unknown server message type 0x{:02x}",
                other
            ))),
        }
    }

    fn decode_authentication(r: &mut Reader) -> Result<ServerMessage> {
        let status = r.pop_u32()?;
        let auth = match status {
            0x00 => Authentication::Ok,
            0x0a => {
                let n = r.pop_u32()?;
                let mut methods = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    methods.push(r.pop_str()?);
                }
                Authentication::SaslRequired { methods }
            }
            0x0b => Authentication::SaslContinue {
                data: r.pop_len_prefixed()?.to_vec(),
            },
            0x0c => Authentication::SaslFinal {
                data: r.pop_len_prefixed()?.to_vec(),
            },
            other => {
                return Err(Error::Protocol(format!(
                    "unknown authentication status 0x{:02x}",
                    other
                )))
            }
        };
        Ok(ServerMessage::Authentication(auth))
    }

}
