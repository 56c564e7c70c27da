//! PostgreSQL wire protocol messages.
//!
//! Frontend/Backend Protocol 3.0, restricted to what the client needs:
//! startup and authentication, the extended query flow
//! (Parse/Bind/Execute/Sync), simple queries for transaction control, and
//! out-of-band cancellation.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{BufMut, BytesMut};

/// Protocol version 3.0.
const PROTOCOL_VERSION: i32 = 196608;

/// Request code for CancelRequest frames.
const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Client → server messages.
#[derive(Debug, Clone)]
pub enum FrontendMessage {
    /// First message on a connection; has no type byte.
    Startup { user: String, database: String },
    /// Cleartext or MD5 password response.
    Password(String),
    /// First message of a SASL exchange.
    SaslInitial { mechanism: String, data: Vec<u8> },
    /// Subsequent SASL messages.
    Sasl(Vec<u8>),
    /// Simple query (transaction control and session settings).
    Query(String),
    /// Parse an unnamed statement.
    Parse { sql: String },
    /// Bind text-format parameters to the unnamed statement, requesting
    /// results in the given format (0 text, 1 binary).
    Bind {
        params: Vec<Option<Vec<u8>>>,
        result_format: i16,
    },
    /// Execute the unnamed portal without a row limit.
    Execute,
    Sync,
    Terminate,
    /// Out-of-band cancellation; sent on a dedicated connection and has no
    /// type byte.
    CancelRequest { process_id: i32, secret_key: i32 },
}

impl FrontendMessage {
    /// Encode this message into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            FrontendMessage::Startup { user, database } => {
                let mut body = Vec::new();
                body.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
                body.extend_from_slice(b"user\0");
                body.extend_from_slice(user.as_bytes());
                body.push(0);
                body.extend_from_slice(b"database\0");
                body.extend_from_slice(database.as_bytes());
                body.push(0);
                body.push(0);
                buf.put_i32((body.len() + 4) as i32);
                buf.put_slice(&body);
            }
            FrontendMessage::Password(password) => {
                buf.put_u8(b'p');
                buf.put_i32((password.len() + 1 + 4) as i32);
                buf.put_slice(password.as_bytes());
                buf.put_u8(0);
            }
            FrontendMessage::SaslInitial { mechanism, data } => {
                buf.put_u8(b'p');
                let body_len = mechanism.len() + 1 + 4 + data.len();
                buf.put_i32((body_len + 4) as i32);
                buf.put_slice(mechanism.as_bytes());
                buf.put_u8(0);
                buf.put_i32(data.len() as i32);
                buf.put_slice(data);
            }
            FrontendMessage::Sasl(data) => {
                buf.put_u8(b'p');
                buf.put_i32((data.len() + 4) as i32);
                buf.put_slice(data);
            }
            FrontendMessage::Query(sql) => {
                buf.put_u8(b'Q');
                buf.put_i32((sql.len() + 1 + 4) as i32);
                buf.put_slice(sql.as_bytes());
                buf.put_u8(0);
            }
            FrontendMessage::Parse { sql } => {
                buf.put_u8(b'P');
                // Unnamed statement, no pre-declared parameter types.
                let body_len = 1 + sql.len() + 1 + 2;
                buf.put_i32((body_len + 4) as i32);
                buf.put_u8(0);
                buf.put_slice(sql.as_bytes());
                buf.put_u8(0);
                buf.put_i16(0);
            }
            FrontendMessage::Bind {
                params,
                result_format,
            } => {
                buf.put_u8(b'B');
                let params_len: usize = params
                    .iter()
                    .map(|p| 4 + p.as_ref().map(|d| d.len()).unwrap_or(0))
                    .sum();
                // portal + statement names (both unnamed), one param format
                // code (text), param count + data, one result format code.
                let body_len = 1 + 1 + 2 + 2 + 2 + params_len + 2 + 2;
                buf.put_i32((body_len + 4) as i32);
                buf.put_u8(0);
                buf.put_u8(0);
                buf.put_i16(1);
                buf.put_i16(0);
                buf.put_i16(params.len() as i16);
                for param in params {
                    match param {
                        None => buf.put_i32(-1),
                        Some(data) => {
                            buf.put_i32(data.len() as i32);
                            buf.put_slice(data);
                        }
                    }
                }
                buf.put_i16(1);
                buf.put_i16(*result_format);
            }
            FrontendMessage::Execute => {
                buf.put_u8(b'E');
                buf.put_i32(4 + 1 + 4);
                buf.put_u8(0);
                buf.put_i32(0);
            }
            FrontendMessage::Sync => {
                buf.put_slice(&[b'S', 0, 0, 0, 4]);
            }
            FrontendMessage::Terminate => {
                buf.put_slice(&[b'X', 0, 0, 0, 4]);
            }
            FrontendMessage::CancelRequest {
                process_id,
                secret_key,
            } => {
                buf.put_i32(16);
                buf.put_i32(CANCEL_REQUEST_CODE);
                buf.put_i32(*process_id);
                buf.put_i32(*secret_key);
            }
        }
    }
}

/// Server → client messages.
#[derive(Debug, Clone)]
pub enum BackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password([u8; 4]),
    AuthenticationSasl(Vec<String>),
    AuthenticationSaslContinue(Vec<u8>),
    AuthenticationSaslFinal(Vec<u8>),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery,
    RowDescription(Vec<String>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete(String),
    EmptyQueryResponse,
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    ParseComplete,
    BindComplete,
    NoData,
    PortalSuspended,
    /// Anything the client does not act on (notifications and the like).
    Other(u8),
}

/// Fields of an ErrorResponse / NoticeResponse.
#[derive(Debug, Clone, Default)]
pub struct ErrorFields {
    pub severity: String,
    pub code: String,
    pub message: String,
}

impl BackendMessage {
    /// Decode one complete frame (`msg_type` byte plus payload without the
    /// length word).
    pub fn decode(msg_type: u8, payload: &[u8]) -> Result<Self, String> {
        let message = match msg_type {
            b'R' => Self::decode_auth(payload)?,
            b'S' => Self::decode_parameter_status(payload),
            b'K' => Self::decode_backend_key(payload)?,
            b'Z' => BackendMessage::ReadyForQuery,
            b'T' => Self::decode_row_description(payload)?,
            b'D' => Self::decode_data_row(payload)?,
            b'C' => BackendMessage::CommandComplete(read_cstr_lossy(payload)),
            b'I' => BackendMessage::EmptyQueryResponse,
            b'E' => BackendMessage::ErrorResponse(parse_error_fields(payload)),
            b'N' => BackendMessage::NoticeResponse(parse_error_fields(payload)),
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            other => BackendMessage::Other(other),
        };
        Ok(message)
    }

    fn decode_auth(payload: &[u8]) -> Result<Self, String> {
        if payload.len() < 4 {
            return Err("authentication payload too short".to_string());
        }
        let auth_type = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        match auth_type {
            0 => Ok(BackendMessage::AuthenticationOk),
            3 => Ok(BackendMessage::AuthenticationCleartextPassword),
            5 => {
                let salt: [u8; 4] = payload
                    .get(4..8)
                    .ok_or("md5 salt missing")?
                    .try_into()
                    .map_err(|_| "md5 salt malformed".to_string())?;
                Ok(BackendMessage::AuthenticationMd5Password(salt))
            }
            10 => {
                let mut mechanisms = Vec::new();
                let mut pos = 4;
                while pos < payload.len() && payload[pos] != 0 {
                    let end = payload[pos..]
                        .iter()
                        .position(|&b| b == 0)
                        .map(|p| pos + p)
                        .unwrap_or(payload.len());
                    mechanisms.push(String::from_utf8_lossy(&payload[pos..end]).to_string());
                    pos = end + 1;
                }
                Ok(BackendMessage::AuthenticationSasl(mechanisms))
            }
            11 => Ok(BackendMessage::AuthenticationSaslContinue(
                payload[4..].to_vec(),
            )),
            12 => Ok(BackendMessage::AuthenticationSaslFinal(payload[4..].to_vec())),
            other => Err(format!("unsupported authentication request: {other}")),
        }
    }

    fn decode_parameter_status(payload: &[u8]) -> Self {
        let mut parts = payload.split(|&b| b == 0);
        let name = String::from_utf8_lossy(parts.next().unwrap_or(b"")).to_string();
        let value = String::from_utf8_lossy(parts.next().unwrap_or(b"")).to_string();
        BackendMessage::ParameterStatus { name, value }
    }

    fn decode_backend_key(payload: &[u8]) -> Result<Self, String> {
        if payload.len() < 8 {
            return Err("BackendKeyData payload too short".to_string());
        }
        Ok(BackendMessage::BackendKeyData {
            process_id: i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
            secret_key: i32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
        })
    }

    fn decode_row_description(payload: &[u8]) -> Result<Self, String> {
        if payload.len() < 2 {
            return Err("RowDescription payload too short".to_string());
        }
        let field_count = i16::from_be_bytes([payload[0], payload[1]]) as usize;
        let mut names = Vec::with_capacity(field_count);
        let mut pos = 2;
        for _ in 0..field_count {
            let name_end = payload[pos..]
                .iter()
                .position(|&b| b == 0)
                .ok_or("missing terminator in field name")?;
            names.push(String::from_utf8_lossy(&payload[pos..pos + name_end]).to_string());
            // Skip terminator plus the fixed 18 bytes of field metadata.
            pos += name_end + 1 + 18;
            if pos > payload.len() {
                return Err("RowDescription field truncated".to_string());
            }
        }
        Ok(BackendMessage::RowDescription(names))
    }

    fn decode_data_row(payload: &[u8]) -> Result<Self, String> {
        if payload.len() < 2 {
            return Err("DataRow payload too short".to_string());
        }
        let column_count = i16::from_be_bytes([payload[0], payload[1]]) as usize;
        let mut columns = Vec::with_capacity(column_count);
        let mut pos = 2;
        for _ in 0..column_count {
            if pos + 4 > payload.len() {
                return Err("DataRow truncated".to_string());
            }
            let len = i32::from_be_bytes([
                payload[pos],
                payload[pos + 1],
                payload[pos + 2],
                payload[pos + 3],
            ]);
            pos += 4;
            if len < 0 {
                columns.push(None);
            } else {
                let len = len as usize;
                if pos + len > payload.len() {
                    return Err("DataRow column truncated".to_string());
                }
                columns.push(Some(payload[pos..pos + len].to_vec()));
                pos += len;
            }
        }
        Ok(BackendMessage::DataRow(columns))
    }
}

fn read_cstr_lossy(payload: &[u8]) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).to_string()
}

fn parse_error_fields(payload: &[u8]) -> ErrorFields {
    let mut fields = ErrorFields::default();
    let mut i = 0;
    while i < payload.len() && payload[i] != 0 {
        let field_type = payload[i];
        i += 1;
        let end = payload[i..].iter().position(|&b| b == 0).unwrap_or(0) + i;
        let value = String::from_utf8_lossy(&payload[i..end]).to_string();
        i = end + 1;
        match field_type {
            b'S' => fields.severity = value,
            b'C' => fields.code = value,
            b'M' => fields.message = value,
            _ => {}
        }
    }
    fields
}
