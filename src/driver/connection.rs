//! A raw PostgreSQL session.
//!
//! One TCP connection speaking protocol 3.0: startup and authentication
//! (cleartext, MD5, SCRAM-SHA-256), the extended query flow for
//! parameterized statements, and the simple query flow for transaction
//! control. Connections are owned by the pool and never shared.

use bytes::BytesMut;
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::executor::{Param, ResultFormat};
use crate::protocol::{BackendMessage, ErrorFields, FrontendMessage, ScramExchange, SCRAM_MECHANISM};
use crate::rows::Rows;
use crate::wire::ConnectSpec;

/// Initial read buffer capacity.
const BUFFER_CAPACITY: usize = 65536;

/// A live PostgreSQL connection.
pub struct PgConnection {
    stream: TcpStream,
    buffer: BytesMut,
    out: BytesMut,
    host: String,
    port: u16,
    process_id: i32,
    secret_key: i32,
    server_version: String,
    /// True while a protocol exchange is in flight. A connection dropped or
    /// errored while dirty must not be reused.
    dirty: bool,
}

impl PgConnection {
    /// Dial and authenticate.
    pub async fn connect(spec: &ConnectSpec) -> Result<Self> {
        let addr = format!("{}:{}", spec.host, spec.port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::Connection(format!("cannot reach {addr}: {e}")))?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            buffer: BytesMut::with_capacity(BUFFER_CAPACITY),
            out: BytesMut::with_capacity(BUFFER_CAPACITY),
            host: spec.host.clone(),
            port: spec.port,
            process_id: 0,
            secret_key: 0,
            server_version: String::new(),
            dirty: false,
        };

        conn.send(FrontendMessage::Startup {
            user: spec.user.clone(),
            database: spec.dbname.clone(),
        })
        .await?;
        conn.handshake(spec).await?;
        Ok(conn)
    }

    /// First whitespace token of the server's advertised version.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Backend process id, usable as a connection identifier.
    pub fn backend_pid(&self) -> i32 {
        self.process_id
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Force this connection to be treated as broken: the pool will close
    /// and replace it instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.dirty = true;
    }

    /// Token for out-of-band cancellation of whatever this connection is
    /// currently running.
    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            host: self.host.clone(),
            port: self.port,
            process_id: self.process_id,
            secret_key: self.secret_key,
        }
    }

    /// Execute one parameterized statement via Parse/Bind/Execute/Sync and
    /// collect every row in the requested result format.
    pub async fn query(
        &mut self,
        sql: &str,
        params: &[Param],
        format: ResultFormat,
    ) -> Result<Rows> {
        self.ensure_in_sync()?;
        self.dirty = true;
        self.out.clear();
        FrontendMessage::Parse {
            sql: sql.to_string(),
        }
        .encode(&mut self.out);
        FrontendMessage::Bind {
            params: params.iter().map(Param::to_wire).collect(),
            result_format: format.code(),
        }
        .encode(&mut self.out);
        FrontendMessage::Execute.encode(&mut self.out);
        FrontendMessage::Sync.encode(&mut self.out);
        let frame = self.out.split();
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;

        let mut names: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<Option<Vec<u8>>>> = Vec::new();
        let mut failure: Option<ErrorFields> = None;
        loop {
            match self.recv().await? {
                BackendMessage::ParseComplete
                | BackendMessage::BindComplete
                | BackendMessage::NoData
                | BackendMessage::PortalSuspended
                | BackendMessage::EmptyQueryResponse
                | BackendMessage::CommandComplete(_) => {}
                BackendMessage::RowDescription(fields) => names = fields,
                BackendMessage::DataRow(columns) => rows.push(columns),
                BackendMessage::ErrorResponse(fields) => failure = Some(fields),
                BackendMessage::ReadyForQuery => {
                    // Only now is the session back in sync and reusable.
                    self.dirty = false;
                    return match failure {
                        Some(fields) => Err(Error::Query {
                            message: fields.message,
                            sql: sql.to_string(),
                        }),
                        None => Ok(Rows::from_raw(names, rows)),
                    };
                }
                _ => {}
            }
        }
    }

    /// Run a statement through the simple query flow, discarding any rows.
    /// Used for transaction control and session settings.
    pub async fn batch(&mut self, sql: &str) -> Result<()> {
        self.ensure_in_sync()?;
        self.dirty = true;
        self.send(FrontendMessage::Query(sql.to_string())).await?;
        let mut failure: Option<ErrorFields> = None;
        loop {
            match self.recv().await? {
                BackendMessage::ErrorResponse(fields) => failure = Some(fields),
                BackendMessage::ReadyForQuery => {
                    self.dirty = false;
                    return match failure {
                        Some(fields) => Err(Error::Query {
                            message: fields.message,
                            sql: sql.to_string(),
                        }),
                        None => Ok(()),
                    };
                }
                _ => {}
            }
        }
    }

    /// A statement abandoned mid-flight leaves unread frames on the wire;
    /// any further use would misread them.
    fn ensure_in_sync(&self) -> Result<()> {
        if self.dirty {
            return Err(Error::Connection(
                "connection is out of sync after an abandoned statement".to_string(),
            ));
        }
        Ok(())
    }

    /// Best-effort graceful close.
    pub async fn terminate(mut self) {
        self.out.clear();
        FrontendMessage::Terminate.encode(&mut self.out);
        let frame = self.out.split();
        let _ = self.stream.write_all(&frame).await;
        let _ = self.stream.shutdown().await;
    }

    async fn send(&mut self, msg: FrontendMessage) -> Result<()> {
        self.out.clear();
        msg.encode(&mut self.out);
        let frame = self.out.split();
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Receive the next complete backend message, reading from the socket
    /// as needed.
    async fn recv(&mut self) -> Result<BackendMessage> {
        loop {
            if self.buffer.len() >= 5 {
                let frame_len = u32::from_be_bytes([
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                    self.buffer[4],
                ]) as usize;
                if self.buffer.len() >= frame_len + 1 {
                    let frame = self.buffer.split_to(frame_len + 1);
                    return BackendMessage::decode(frame[0], &frame[5..])
                        .map_err(|e| Error::Connection(format!("protocol error: {e}")));
                }
            }
            if self.buffer.capacity() - self.buffer.len() < BUFFER_CAPACITY {
                self.buffer.reserve(BUFFER_CAPACITY * 2);
            }
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(Error::Connection("connection closed by server".to_string()));
            }
        }
    }

    /// Drive authentication and the remainder of startup until the first
    /// ReadyForQuery, capturing the server version and the cancel key.
    async fn handshake(&mut self, spec: &ConnectSpec) -> Result<()> {
        let mut scram: Option<ScramExchange> = None;
        loop {
            match self.recv().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = required_password(spec)?;
                    self.send(FrontendMessage::Password(password.to_string()))
                        .await?;
                }
                BackendMessage::AuthenticationMd5Password(salt) => {
                    let password = required_password(spec)?;
                    let response = md5_password(&spec.user, password, &salt);
                    self.send(FrontendMessage::Password(response)).await?;
                }
                BackendMessage::AuthenticationSasl(mechanisms) => {
                    if !mechanisms.iter().any(|m| m == SCRAM_MECHANISM) {
                        return Err(Error::Connection(format!(
                            "server offers no supported SASL mechanism (got: {})",
                            mechanisms.join(", ")
                        )));
                    }
                    let password = required_password(spec)?;
                    let exchange = ScramExchange::new(&spec.user, password);
                    let first = exchange.client_first();
                    scram = Some(exchange);
                    self.send(FrontendMessage::SaslInitial {
                        mechanism: SCRAM_MECHANISM.to_string(),
                        data: first,
                    })
                    .await?;
                }
                BackendMessage::AuthenticationSaslContinue(challenge) => {
                    let exchange = scram
                        .as_mut()
                        .ok_or_else(|| Error::Connection("unexpected SASL challenge".to_string()))?;
                    let response = exchange.client_final(&challenge)?;
                    self.send(FrontendMessage::Sasl(response)).await?;
                }
                BackendMessage::AuthenticationSaslFinal(signature) => {
                    let exchange = scram
                        .as_ref()
                        .ok_or_else(|| Error::Connection("unexpected SASL final".to_string()))?;
                    exchange.verify_server(&signature)?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    if name == "server_version" {
                        self.server_version = value
                            .split_whitespace()
                            .next()
                            .unwrap_or_default()
                            .to_string();
                    }
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.process_id = process_id;
                    self.secret_key = secret_key;
                }
                BackendMessage::ReadyForQuery => return Ok(()),
                BackendMessage::ErrorResponse(fields) => {
                    return Err(Error::Connection(format!(
                        "startup failed: {}",
                        fields.message
                    )));
                }
                _ => {}
            }
        }
    }
}

fn required_password<'a>(spec: &'a ConnectSpec) -> Result<&'a str> {
    spec.password.as_deref().ok_or_else(|| {
        Error::Connection("server requested a password but none was configured".to_string())
    })
}

/// `md5` + hex(md5(hex(md5(password + user)) + salt)).
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = hex(Md5::new()
        .chain_update(password.as_bytes())
        .chain_update(user.as_bytes())
        .finalize()
        .as_slice());
    let outer = hex(Md5::new()
        .chain_update(inner.as_bytes())
        .chain_update(salt)
        .finalize()
        .as_slice());
    format!("md5{outer}")
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_response_matches_known_vector() {
        // md5(md5("secretapp") + salt) for user "app", password "secret".
        let response = md5_password("app", "secret", &[1, 2, 3, 4]);
        assert!(response.starts_with("md5"));
        assert_eq!(response.len(), 3 + 32);
        // Deterministic: same inputs, same digest.
        assert_eq!(response, md5_password("app", "secret", &[1, 2, 3, 4]));
        assert_ne!(response, md5_password("app", "other", &[1, 2, 3, 4]));
    }
}
