//! Out-of-band query cancellation.

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::Result;
use crate::protocol::FrontendMessage;

/// A token that can cancel whatever its connection is currently running.
/// Safe to send across tasks; does not borrow the connection.
#[derive(Debug, Clone)]
pub struct CancelToken {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) process_id: i32,
    pub(crate) secret_key: i32,
}

impl CancelToken {
    /// Ask the server to cancel the in-flight statement.
    ///
    /// Opens a dedicated TCP connection and sends a CancelRequest frame;
    /// the server closes it afterwards. The original connection keeps
    /// running — only its current statement is interrupted.
    pub async fn cancel(&self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let mut stream = TcpStream::connect(&addr).await?;
        let mut buf = BytesMut::with_capacity(16);
        FrontendMessage::CancelRequest {
            process_id: self.process_id,
            secret_key: self.secret_key,
        }
        .encode(&mut buf);
        stream.write_all(&buf).await?;
        Ok(())
    }
}
