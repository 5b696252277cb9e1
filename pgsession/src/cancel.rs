//! Out of band query cancellation.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-CANCELING-REQUESTS>
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    Result,
    common::{ByteStr, logging},
    connection::Config,
    net::Socket,
    postgres::{backend::BackendKeyData, frontend},
};

/// Token to cancel the query in progress on a connection.
///
/// Cancellation is best effort, the server never replies. If the cancellation is effective,
/// the running command fails with a query error.
#[derive(Debug, Clone)]
pub struct CancelToken {
    host: ByteStr,
    port: u16,
    nodelay: bool,
    key: BackendKeyData,
}

impl CancelToken {
    pub(crate) fn new(config: &Config, key: BackendKeyData) -> CancelToken {
        CancelToken {
            host: config.host.clone(),
            port: config.port,
            nodelay: config.nodelay,
            key,
        }
    }

    /// Backend process id of the connection.
    pub fn process_id(&self) -> u32 {
        self.key.process_id
    }

    /// Open a new connection and send `CancelRequest`.
    pub async fn cancel(&self) -> Result<()> {
        let mut socket = match self.host.strip_prefix('/') {
            Some(_) => Socket::connect_socket(&format!("{}/.s.PGSQL.{}", self.host, self.port)).await?,
            None => Socket::connect_tcp(&self.host, self.port, self.nodelay).await?,
        };

        let mut buf = BytesMut::with_capacity(16);
        frontend::CancelRequest {
            process_id: self.key.process_id,
            secret_key: self.key.secret_key,
        }
        .write(&mut buf);

        socket.write_all(&buf).await?;
        socket.flush().await?;

        // server closes the connection without a response
        let mut eof = [0u8; 1];
        let _ = socket.read(&mut eof).await;

        logging!(debug, "cancel request sent to backend {}", self.key.process_id);
        Ok(())
    }
}
