//! Buffered socket implementing [`PgTransport`].
use bytes::{Buf, BufMut, BytesMut};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    Result,
    common::verbose,
    net::Socket,
    postgres::{BackendProtocol, FrontendProtocol, ProtocolError, frontend},
    transport::PgTransport,
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// msgtype + length
const HEADER: usize = 1 + 4;

/// Buffered connection to postgres.
#[derive(Debug)]
pub struct PgStream {
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl PgStream {
    pub fn new(socket: Socket) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
        }
    }

    fn poll_read_socket(&mut self, cx: &mut Context) -> Poll<io::Result<usize>> {
        let n = {
            let dst = self.read_buf.chunk_mut();
            let dst = unsafe { dst.as_uninit_slice_mut() };
            let mut buf = ReadBuf::uninit(dst);
            let ptr = buf.filled().as_ptr();
            ready!(Pin::new(&mut self.socket).poll_read(cx, &mut buf)?);

            // Ensure the pointer does not change from under us
            assert_eq!(ptr, buf.filled().as_ptr());
            buf.filled().len()
        };

        // Safety: This is guaranteed to be the number of initialized (and read)
        // bytes due to the invariants provided by `ReadBuf::filled`.
        unsafe {
            self.read_buf.advance_mut(n);
        }

        Poll::Ready(Ok(n))
    }
}

impl PgTransport for PgStream {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.socket).poll_write(cx, &self.write_buf)?);
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Pin::new(&mut self.socket).poll_flush(cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        if !self.write_buf.is_empty() {
            ready!(self.poll_flush(cx)?);
        }

        loop {
            if let Some(mut header) = self.read_buf.get(..HEADER) {
                let msgtype = header.get_u8();
                let len = header.get_i32();
                if len < 4 {
                    return Poll::Ready(Err(ProtocolError::malformed("invalid message length").into()));
                }
                let len = len as usize;

                if self.read_buf.len() - 1/*msgtype*/ >= len {
                    self.read_buf.advance(HEADER);
                    let body = self.read_buf.split_to(len - 4).freeze();

                    verbose!("(B){:?}", crate::postgres::BackendMessage::message_name(msgtype));

                    return Poll::Ready(B::decode(msgtype, body).map_err(Into::into));
                }

                self.read_buf.reserve(1 + len);
            } else {
                self.read_buf.reserve(DEFAULT_BUF_CAPACITY);
            }

            if ready!(self.poll_read_socket(cx)?) == 0 {
                return Poll::Ready(Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()));
            }
        }
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        verbose!("(F){:?}", F::MSGTYPE as char);
        frontend::write(message, &mut self.write_buf);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        startup.write(&mut self.write_buf);
    }

    fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        Pin::new(&mut self.socket).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod test {
    use std::future::poll_fn;
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    use super::*;
    use crate::{ErrorKind, postgres::BackendMessage};

    async fn pair() -> (PgStream, tokio::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let socket = Socket::connect_tcp("127.0.0.1", port, true).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        (PgStream::new(socket), peer)
    }

    #[tokio::test]
    async fn message_split_across_reads() {
        let (mut stream, mut peer) = pair().await;

        let write = async {
            peer.write_all(&[b'Z', 0, 0]).await.unwrap();
            tokio::task::yield_now().await;
            peer.write_all(&[0, 5, b'I']).await.unwrap();
        };
        let (_, message) = tokio::join!(write, poll_fn(|cx| stream.poll_recv::<BackendMessage>(cx)));
        assert!(matches!(message.unwrap(), BackendMessage::ReadyForQuery(_)));
    }

    #[tokio::test]
    async fn invalid_length() {
        let (mut stream, mut peer) = pair().await;
        peer.write_all(&[b'Z', 0, 0, 0, 2]).await.unwrap();

        let err = poll_fn(|cx| stream.poll_recv::<BackendMessage>(cx)).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(_)));
    }

    #[tokio::test]
    async fn closed_by_peer() {
        let (mut stream, peer) = pair().await;
        drop(peer);

        let err = poll_fn(|cx| stream.poll_recv::<BackendMessage>(cx)).await.unwrap_err();
        assert!(err.is_transport());
    }
}
