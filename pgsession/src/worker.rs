//! Connection worker and its [`Client`] handle.
use std::{fmt, future::poll_fn};
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot,
};

use crate::{
    Error, Result,
    cancel::CancelToken,
    command::{Command, Response, call},
    common::logging,
    connection::{self, Config, StartupResponse},
    error::Closed,
    postgres::BackendMessage,
    session::{Session, TransactionStatus},
    transport::PgTransport,
};

pub(crate) struct Request {
    command: Command,
    /// [`None`] for fire and forget commands.
    reply: Option<oneshot::Sender<Result<Response>>>,
}

/// Handle to one postgres connection.
///
/// The connection is owned by a worker task which runs one command at a time, in the order
/// they are requested. Cloning the handle is cheap, all clones share the same connection.
/// The connection is closed once [`Client::close`] is called or every handle is dropped.
///
/// # Example
///
/// ```no_run
/// use pgsession::{Client, Config, Value};
///
/// # async fn app() -> pgsession::Result<()> {
/// let client = Client::connect(Config::from_env()).await?;
///
/// let result = client.equery("SELECT $1::int + 1", &[Value::Int4(41)]).await?;
/// assert_eq!(result.rows[0].try_get::<_, i32>(0)?, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    send: UnboundedSender<Request>,
    cancel: Option<CancelToken>,
}

impl Client {
    /// Connect to the server and spawn the connection worker.
    ///
    /// This requires a tokio runtime.
    pub async fn connect(config: Config) -> Result<Client> {
        let (stream, startup) = connection::connect(&config).await?;
        Client::start(stream, startup, config).await
    }

    /// Connect using [`Config::from_env`].
    pub async fn connect_env() -> Result<Client> {
        Client::connect(Config::from_env()).await
    }

    /// Perform the startup handshake over an already connected transport.
    pub async fn with_transport<IO: PgTransport>(mut io: IO, config: Config) -> Result<Client> {
        let startup = connection::startup(&config, &mut io).await.map_err(Error::into_connect)?;
        Client::start(io, startup, config).await
    }

    async fn start<IO: PgTransport>(io: IO, startup: StartupResponse, config: Config) -> Result<Client> {
        let cancel = startup
            .backend_key_data
            .map(|key| CancelToken::new(&config, key));
        let mut session = Session::new(io, startup, &config);

        if config.codecs.as_ref().is_none_or(|codecs| !codecs.is_empty()) {
            if let Err(err) = session.update_type_cache(vec![]).await {
                if err.is_transport() {
                    return Err(err.into_connect());
                }
                logging!(warn, "failed to refresh type cache: {err}");
            }
        }

        let (send, recv) = mpsc::unbounded_channel();
        tokio::spawn(run(session, recv));
        Ok(Client { send, cancel })
    }

    /// Send a command and wait for its response.
    pub(crate) async fn request(&self, command: Command) -> Result<Response> {
        let (reply, response) = oneshot::channel();
        self.send
            .send(Request { command, reply: Some(reply) })
            .map_err(|_| Closed)?;
        response.await.map_err(|_| Closed)?
    }

    /// Queue a command without waiting for it.
    pub(crate) fn enqueue(&self, command: Command) {
        if self.send.send(Request { command, reply: None }).is_err() {
            logging!(debug, "connection closed, queued command dropped");
        }
    }

    /// Returns `true` if the worker is gone.
    pub fn is_closed(&self) -> bool {
        self.send.is_closed()
    }

    /// Token to cancel the query in progress from another connection.
    ///
    /// Returns [`None`] if the server did not send its key data.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.cancel.clone()
    }

    /// Transaction status as of the last `ReadyForQuery`.
    pub async fn transaction_status(&self) -> Result<TransactionStatus> {
        call!(self, Command::TransactionStatus => TxStatus)
    }

    /// Send `Terminate` and stop the worker.
    ///
    /// Every other handle fails with [`Closed`] afterwards.
    pub async fn close(&self) -> Result<()> {
        call!(self, Command::Close => Unit)
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Worker loop.
///
/// While idle, server messages are handled before pending commands, so asynchronous
/// errors are seen before the next command runs.
async fn run<IO: PgTransport>(mut session: Session<IO>, mut recv: UnboundedReceiver<Request>) {
    loop {
        tokio::select! {
            biased;
            message = poll_fn(|cx| session.io.poll_recv::<BackendMessage>(cx)) => {
                let result = match message {
                    Ok(message) => session.unsolicited(message).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = result {
                    if err.is_transport() {
                        logging!(error, "connection lost: {err}");
                        break;
                    }
                    logging!(warn, "{err}");
                }
            },
            request = recv.recv() => {
                let Some(Request { command, reply }) = request else {
                    session.terminate().await;
                    break;
                };

                let close = matches!(command, Command::Close);
                let result = session.dispatch(command).await;
                let fatal = matches!(&result, Err(err) if err.is_transport());

                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    },
                    None => {
                        if let Err(_err) = result {
                            logging!(warn, "queued command failed: {_err}");
                        }
                    },
                }

                if fatal {
                    logging!(error, "connection closed after transport failure");
                    session.shutdown().await;
                }
                if close || fatal {
                    break;
                }
            },
        }
    }

    logging!(debug, "connection worker exit");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ErrorKind, testing};

    #[tokio::test]
    async fn close_stops_every_handle() {
        let (client, server) = testing::client().await;
        let other = client.clone();
        client.close().await.unwrap();

        assert!(matches!(other.simple_query("SELECT 1").await.unwrap_err().kind(), ErrorKind::Closed(_)));
        assert_eq!(server.frames().last().map(|f| f.0), Some(b'X'));
    }

    #[tokio::test]
    async fn commands_run_in_order() {
        let (client, _server) = testing::client().await;
        let a = client.clone();
        let b = client.clone();
        let (ra, rb) = tokio::join!(a.simple_query("SELECT 1"), b.simple_query("BEGIN"));
        assert_eq!(ra.unwrap().len(), 1);
        assert_eq!(rb.unwrap().len(), 1);
        assert_eq!(client.transaction_status().await.unwrap(), TransactionStatus::InTransaction);
    }

    #[tokio::test]
    async fn no_codecs_skips_type_cache() {
        let (client, server) = testing::client_with(Config::new().no_codecs()).await;
        assert!(server.queries().is_empty());
        assert_eq!(client.simple_query("SELECT 1").await.unwrap().len(), 1);
        assert!(!server.queries().iter().any(|q| q.contains("FROM pg_type")));

        let (_client, server) = testing::client().await;
        assert!(server.queries().iter().any(|q| q.contains("FROM pg_type")));
    }
}
