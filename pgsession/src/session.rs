//! Connection state owned by the worker.
//!
//! A [`Session`] is only ever touched by its worker task, every operation borrows it
//! mutably for the whole command so server messages of two commands never interleave.
use lru::LruCache;
use std::{collections::HashMap, future::poll_fn, num::NonZeroUsize, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    Error, Result,
    common::{ByteStr, logging, verbose},
    connection::{Config, StartupResponse},
    copy::CopyState,
    postgres::{
        BackendMessage, DbError, NoticeResponse, PgFormat, ProtocolError,
        backend::{BackendKeyData, NotificationResponse, ParameterStatus},
        frontend,
    },
    replication::Streaming,
    simple::CommandStatus,
    statement::{Column, Statement, statement_name},
    transport::PgTransport,
    types::{TextCodec, TypeRegistry},
};

/// Message the server sends outside of a command response.
#[derive(Debug, Clone, PartialEq)]
pub enum AsyncMessage {
    /// `NOTIFY` on a channel this session listens to.
    Notification {
        process_id: u32,
        channel: ByteStr,
        payload: ByteStr,
    },
    /// Warning or informational report.
    Notice(DbError),
    /// The server rejected COPY data, the COPY is aborted.
    CopyError(DbError),
    /// Run time parameter changed.
    ParameterStatus {
        name: ByteStr,
        value: ByteStr,
    },
    /// Error reported while no command was running, usually followed by the connection close.
    Error(DbError),
}

/// Backend transaction status, as reported by `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl TransactionStatus {
    pub(crate) fn from_indicator(status: u8) -> TransactionStatus {
        match status {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

/// Single connection state.
pub(crate) struct Session<IO> {
    pub(crate) io: IO,
    pub(crate) registry: TypeRegistry,
    /// Persistent statements keyed by sql hash.
    pub(crate) statements: Option<LruCache<u64, Statement>>,
    /// Last generated statement name.
    statement_id: u32,
    pub(crate) tx_status: TransactionStatus,
    pub(crate) last_status: Option<CommandStatus>,
    pub(crate) copy: CopyState,
    pub(crate) streaming: Option<Streaming>,
    pub(crate) replication_mode: bool,
    pub(crate) params: HashMap<ByteStr, ByteStr>,
    pub(crate) key_data: Option<BackendKeyData>,
    async_sender: Option<UnboundedSender<AsyncMessage>>,
}

impl<IO: PgTransport> Session<IO> {
    pub(crate) fn new(io: IO, startup: StartupResponse, config: &Config) -> Session<IO> {
        let mut registry = TypeRegistry::new();
        match &config.codecs {
            Some(codecs) => {
                for (name, codec) in codecs {
                    registry.register(name.clone(), Arc::clone(codec));
                }
            },
            None => {
                registry.register("hstore", Arc::new(TextCodec));
                registry.register("citext", Arc::new(TextCodec));
            },
        }

        Session {
            io,
            registry,
            statements: NonZeroUsize::new(config.statement_cache_capacity).map(LruCache::new),
            statement_id: 0,
            tx_status: TransactionStatus::Idle,
            last_status: None,
            copy: CopyState::Normal,
            streaming: None,
            replication_mode: config.replication,
            params: startup.param_status.into_iter().collect(),
            key_data: startup.backend_key_data,
            async_sender: config.async_receiver.clone(),
        }
    }

    /// Name for the next persistent statement, unique within this connection.
    pub(crate) fn next_statement_name(&mut self) -> ByteStr {
        self.statement_id = self.statement_id.wrapping_add(1);
        statement_name(self.statement_id)
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        poll_fn(|cx| self.io.poll_flush(cx)).await?;
        Ok(())
    }

    /// Receive the next response message.
    ///
    /// Asynchronous messages are delivered to the receiver and skipped,
    /// `ErrorResponse` is returned as [`Err`].
    pub(crate) async fn recv(&mut self) -> Result<BackendMessage> {
        loop {
            let message = poll_fn(|cx| self.io.poll_recv::<BackendMessage>(cx)).await?;
            match message {
                BackendMessage::NoticeResponse(notice) => self.notice(notice)?,
                BackendMessage::NotificationResponse(notify) => self.notification(notify),
                BackendMessage::ParameterStatus(param) => self.parameter_status(param),
                BackendMessage::ErrorResponse(err) => {
                    let err = err.to_db_error()?;
                    verbose!("server error: {err}");
                    return Err(err.into());
                },
                BackendMessage::CommandComplete(cmd) => {
                    self.last_status = Some(CommandStatus::parse(&cmd.tag));
                    return Ok(BackendMessage::CommandComplete(cmd));
                },
                BackendMessage::ReadyForQuery(ready) => {
                    self.tx_status = TransactionStatus::from_indicator(ready.tx_status);
                    return Ok(BackendMessage::ReadyForQuery(ready));
                },
                message => return Ok(message),
            }
        }
    }

    /// Receive the next response message as `B`.
    pub(crate) async fn recv_as<B>(&mut self) -> Result<B>
    where
        B: TryFrom<BackendMessage, Error = ProtocolError>,
    {
        Ok(B::try_from(self.recv().await?)?)
    }

    /// Receive a message only if one is already buffered or readable.
    pub(crate) async fn try_recv(&mut self) -> Result<Option<BackendMessage>> {
        poll_fn(|cx| match self.io.poll_recv::<BackendMessage>(cx) {
            std::task::Poll::Ready(ready) => std::task::Poll::Ready(ready.map(Some)),
            std::task::Poll::Pending => std::task::Poll::Ready(Ok(None)),
        })
        .await
    }

    /// Wait for `ReadyForQuery`, discarding everything before it.
    pub(crate) async fn wait_ready(&mut self) -> Result<()> {
        loop {
            match self.recv().await {
                Ok(BackendMessage::ReadyForQuery(_)) => return Ok(()),
                Ok(_) => { },
                Err(err) if err.is_database() => {
                    logging!(debug, "discarded error while waiting for ready: {err}");
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// After a query error in a pipeline without `Sync`, issue `Sync` so the server
    /// leaves its error state, then return the original error.
    pub(crate) async fn sync_after(&mut self, err: Error) -> Error {
        if !err.is_database() {
            return err;
        }
        self.io.send(frontend::Sync);
        if let Err(transport) = self.flush().await {
            return transport;
        }
        match self.wait_ready().await {
            Ok(()) => err,
            Err(transport) => transport,
        }
    }

    /// After a failure in a pipeline ending in `Sync`, wait for `ReadyForQuery`,
    /// then return the original error.
    pub(crate) async fn ready_after(&mut self, err: Error) -> Error {
        if err.is_transport() {
            return err;
        }
        match self.wait_ready().await {
            Ok(()) => err,
            Err(transport) => transport,
        }
    }

    /// Handle a message received while no command is running.
    pub(crate) async fn unsolicited(&mut self, message: BackendMessage) -> Result<()> {
        match message {
            BackendMessage::NoticeResponse(notice) => self.notice(notice)?,
            BackendMessage::NotificationResponse(notify) => self.notification(notify),
            BackendMessage::ParameterStatus(param) => self.parameter_status(param),
            BackendMessage::ErrorResponse(err) => {
                let err = err.to_db_error()?;
                if self.copy.is_copy_in() {
                    self.copy_aborted(err);
                } else {
                    logging!(error, "unsolicited server error: {err}");
                    self.send_async(AsyncMessage::Error(err));
                }
            },
            BackendMessage::ReadyForQuery(ready) => {
                self.tx_status = TransactionStatus::from_indicator(ready.tx_status);
            },
            BackendMessage::CommandComplete(cmd) => {
                self.last_status = Some(CommandStatus::parse(&cmd.tag));
            },
            BackendMessage::CopyData(data) if self.streaming.is_some() => {
                self.replication_data(data.data).await?;
            },
            BackendMessage::CopyDone(_) if self.streaming.is_some() => {
                self.replication_done().await?;
            },
            f => Err(ProtocolError::unexpected_during(f.msgtype(), "idle"))?,
        }
        Ok(())
    }

    pub(crate) fn send_async(&self, message: AsyncMessage) {
        match &self.async_sender {
            Some(sender) => {
                if let Err(_err) = sender.send(message) {
                    logging!(debug, "async receiver closed, dropped {:?}", _err.0);
                }
            },
            None => {
                logging!(debug, "no async receiver, dropped {message:?}");
            },
        }
    }

    fn notice(&mut self, notice: NoticeResponse) -> Result<()> {
        let notice = notice.to_db_error()?;
        match &self.async_sender {
            Some(_) => self.send_async(AsyncMessage::Notice(notice)),
            None => {
                logging!(info, "{notice}");
            },
        }
        Ok(())
    }

    fn notification(&mut self, notify: NotificationResponse) {
        let NotificationResponse { process_id, channel, payload } = notify;
        self.send_async(AsyncMessage::Notification { process_id, channel, payload });
    }

    fn parameter_status(&mut self, param: ParameterStatus) {
        verbose!("{} = {}", param.name, param.value);
        self.params.insert(param.name.clone(), param.value.clone());
        if self.async_sender.is_some() {
            self.send_async(AsyncMessage::ParameterStatus { name: param.name, value: param.value });
        }
    }

    /// Columns of `statement` with the result format this session requests at Bind.
    pub(crate) fn bound_columns(&self, statement: &Statement) -> Arc<[Column]> {
        statement
            .columns()
            .iter()
            .map(|col| col.with_format(self.registry.result_format(col.type_oid())))
            .collect()
    }

    pub(crate) fn result_formats(columns: &[Column]) -> Vec<PgFormat> {
        columns.iter().map(Column::format).collect()
    }

    /// Send `Terminate` and shutdown the transport.
    pub(crate) async fn terminate(&mut self) {
        self.io.send(frontend::Terminate);
        if let Err(_err) = self.flush().await {
            logging!(debug, "failed to send terminate: {_err}");
        }
        self.shutdown().await;
    }

    pub(crate) async fn shutdown(&mut self) {
        if let Err(_err) = poll_fn(|cx| self.io.poll_shutdown(cx)).await {
            logging!(debug, "failed to shutdown transport: {_err}");
        }
    }
}

impl<IO> std::fmt::Debug for Session<IO> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tx_status", &self.tx_status)
            .field("copy", &self.copy)
            .field("streaming", &self.streaming.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc;

    use super::*;
    use crate::testing;

    #[tokio::test]
    async fn notices_go_to_async_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (client, _server) = testing::client_with(Config::new().async_receiver(tx)).await;

        client.simple_query("SELECT notice()").await.unwrap();
        let message = rx.recv().await.unwrap();
        let AsyncMessage::Notice(notice) = message else {
            panic!("expected notice, found {message:?}");
        };
        assert_eq!(notice.message(), "hello from server");
    }
}
