//! The [`PgTransport`] trait.
use std::{
    io,
    task::{Context, Poll},
};

use crate::{
    Result,
    postgres::{BackendProtocol, FrontendProtocol, frontend},
};

/// A buffered stream which can send and receive postgres message.
///
/// The session layer only talks to the server through this trait, the shipped implementation
/// is [`PgStream`][crate::stream::PgStream].
pub trait PgTransport: Unpin + Send + 'static {
    /// Poll to flush the underlying io.
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;

    /// Poll to receive a message.
    ///
    /// Calling `poll_recv` will also try to [`poll_flush`][1] if there is buffered message.
    ///
    /// Every message is returned as is, including `ErrorResponse`, `NoticeResponse` and
    /// `NotificationResponse`, the session decides what to do with them.
    ///
    /// Implementor must be cancel safe: a partially received message stays buffered
    /// until the next call.
    ///
    /// [1]: PgTransport::poll_flush
    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>>;

    /// Send message to the backend.
    ///
    /// Note that this send is buffered, caller must also call
    /// [`poll_flush`][1] or [`flush`][2] afterwards.
    ///
    /// [1]: PgTransport::poll_flush
    /// [2]: PgTransportExt::flush
    fn send<F: FrontendProtocol>(&mut self, message: F);

    /// Send [`Startup`][1] message to the backend.
    ///
    /// For historical reasons, the very first message sent by the client (the startup message)
    /// has no initial message-type byte.
    ///
    /// Thus, [`Startup`][1] does not implement [`FrontendProtocol`]
    ///
    /// [1]: frontend::Startup
    fn send_startup(&mut self, startup: frontend::Startup);

    /// Poll to shutdown the underlying io.
    fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>>;
}

impl<P> PgTransport for Box<P> where P: PgTransport {
    fn poll_flush(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_flush(self, cx)
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        P::poll_recv(self, cx)
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        P::send(self, message);
    }

    fn send_startup(&mut self, startup: frontend::Startup) {
        P::send_startup(self, startup);
    }

    fn poll_shutdown(&mut self, cx: &mut Context) -> Poll<io::Result<()>> {
        P::poll_shutdown(self, cx)
    }
}

/// An extension trait to provide `Future` API for [`PgTransport`].
pub trait PgTransportExt: PgTransport {
    /// Flush the underlying io.
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx| self.poll_flush(cx))
    }

    /// Receive a backend message.
    fn recv<B: BackendProtocol>(&mut self) -> impl Future<Output = Result<B>> {
        std::future::poll_fn(|cx| self.poll_recv(cx))
    }

    /// Receive a backend message only if one is already available.
    fn try_recv<B: BackendProtocol>(&mut self) -> impl Future<Output = Result<Option<B>>> {
        std::future::poll_fn(|cx| match self.poll_recv(cx) {
            Poll::Ready(ready) => Poll::Ready(ready.map(Some)),
            Poll::Pending => Poll::Ready(Ok(None)),
        })
    }

    /// Shutdown the underlying io.
    fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> {
        std::future::poll_fn(|cx| self.poll_shutdown(cx))
    }
}

impl<T> PgTransportExt for T where T: PgTransport { }
