//! Establish a session with the server.
use std::{fmt, io};

use crate::{
    Result,
    common::logging,
    net::Socket,
    postgres::{DbError, ProtocolError},
    stream::PgStream,
};

mod config;
mod startup;

pub use config::{Config, DEFAULT_STATEMENT_CACHE, ParseError, Password, SslMode};
pub use startup::{StartupResponse, startup};

/// Open a socket according to `config`, and perform the startup handshake.
pub async fn connect(config: &Config) -> Result<(PgStream, StartupResponse)> {
    if config.ssl_mode == SslMode::Require {
        return Err(ConnectError::TlsUnsupported.into());
    }

    let connect = async {
        let socket = match config.host.strip_prefix('/') {
            Some(_) => {
                let path = format!("{}/.s.PGSQL.{}", config.host, config.port);
                Socket::connect_socket(&path).await?
            },
            None => Socket::connect_tcp(&config.host, config.port, config.nodelay).await?,
        };
        let mut stream = PgStream::new(socket);
        let response = startup(config, &mut stream).await?;
        Ok::<_, crate::Error>((stream, response))
    };

    let result = match config.connect_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout.into()),
        },
        None => connect.await,
    };

    result.map_err(|err| {
        logging!(error, "failed to connect to {}:{}: {err}", config.host, config.port);
        err.into_connect()
    })
}

/// An error before a usable session exists.
pub enum ConnectError {
    Io(io::Error),
    Protocol(ProtocolError),
    /// Server rejected the startup, e.g. wrong password or unknown database.
    Rejected(DbError),
    /// Server asked for an authentication method that is not implemented.
    UnsupportedAuth(&'static str),
    /// [`SslMode::Require`] was requested.
    TlsUnsupported,
    Timeout,
}

impl std::error::Error for ConnectError { }

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to connect, ")?;
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Rejected(e) => e.fmt(f),
            Self::UnsupportedAuth(auth) => write!(f, "unsupported authentication `{auth}`"),
            Self::TlsUnsupported => f.write_str("tls is not supported"),
            Self::Timeout => f.write_str("connect timeout"),
        }
    }
}

impl fmt::Debug for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
