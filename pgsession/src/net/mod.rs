//! Socket connection to postgres.
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// an either `TcpStream` or `UnixStream`, which implement
/// `AsyncRead` and `AsyncWrite` transparently
pub struct Socket {
    kind: Kind,
}

enum Kind {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    UnixSocket(tokio::net::UnixStream),
}

impl Socket {
    pub async fn connect_tcp(host: &str, port: u16, nodelay: bool) -> io::Result<Socket> {
        let socket = tokio::net::TcpStream::connect((host, port)).await?;
        socket.set_nodelay(nodelay)?;
        Ok(Socket { kind: Kind::Tcp(socket) })
    }

    #[cfg(unix)]
    pub async fn connect_socket(path: &str) -> io::Result<Socket> {
        let socket = tokio::net::UnixStream::connect(path).await?;
        Ok(Socket { kind: Kind::UnixSocket(socket) })
    }

    #[cfg(not(unix))]
    pub async fn connect_socket(_: &str) -> io::Result<Socket> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "unix socket is not supported"))
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_read(cx, buf),
            #[cfg(unix)]
            Kind::UnixSocket(u) => Pin::new(u).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_write(cx, buf),
            #[cfg(unix)]
            Kind::UnixSocket(u) => Pin::new(u).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_flush(cx),
            #[cfg(unix)]
            Kind::UnixSocket(u) => Pin::new(u).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_shutdown(cx),
            #[cfg(unix)]
            Kind::UnixSocket(u) => Pin::new(u).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Tcp(tcp) => std::fmt::Debug::fmt(tcp, f),
            #[cfg(unix)]
            Kind::UnixSocket(unix) => std::fmt::Debug::fmt(unix, f),
        }
    }
}
