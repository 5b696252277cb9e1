//! Transaction scope.
//!
//! [`Client::with_transaction`] runs a closure between `BEGIN` and `COMMIT`, rolling back
//! when anything fails. [`Client::begin`] returns an RAII [`Transaction`] instead.
use std::ops::Deref;

use crate::{
    Client, Error, Result,
    command::Command,
    common::{ByteStr, logging},
    error::{CommitVerificationError, StateError},
    simple::CommandStatus,
};

/// Options of [`Client::with_transaction`].
#[derive(Debug, Clone)]
pub struct TransactionOptions {
    /// Return the work error as [`Err`] instead of [`Outcome::RolledBack`], default `true`.
    pub reraise: bool,
    /// Check that `COMMIT` actually committed, default `false`.
    pub ensure_committed: bool,
    /// Appended to `BEGIN`, e.g. `ISOLATION LEVEL SERIALIZABLE`.
    pub begin_opts: String,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            reraise: true,
            ensure_committed: false,
            begin_opts: String::new(),
        }
    }
}

impl TransactionOptions {
    pub fn new() -> TransactionOptions {
        TransactionOptions::default()
    }

    pub fn reraise(mut self, reraise: bool) -> Self {
        self.reraise = reraise;
        self
    }

    pub fn ensure_committed(mut self, ensure_committed: bool) -> Self {
        self.ensure_committed = ensure_committed;
        self
    }

    pub fn begin_opts(mut self, begin_opts: impl Into<String>) -> Self {
        self.begin_opts = begin_opts.into();
        self
    }
}

/// Result of a transaction that did not reraise.
#[derive(Debug)]
pub enum Outcome<T, E> {
    Committed(T),
    /// The work or the commit failed and the transaction was rolled back.
    RolledBack(E),
}

impl<T, E> Outcome<T, E> {
    pub fn is_committed(&self) -> bool {
        matches!(self, Outcome::Committed(_))
    }

    /// Returns the committed value, [`None`] if rolled back.
    pub fn committed(self) -> Option<T> {
        match self {
            Outcome::Committed(value) => Some(value),
            Outcome::RolledBack(_) => None,
        }
    }
}

impl Client {
    /// Run `work` inside a transaction.
    ///
    /// `work` receives a handle to this connection. If it fails, or `COMMIT` fails,
    /// `ROLLBACK` is sent and the error is either returned as is or wrapped in
    /// [`Outcome::RolledBack`], depending on [`TransactionOptions::reraise`].
    /// A failed `BEGIN` is always returned as [`Err`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use pgsession::{Client, Outcome, TransactionOptions, Value};
    ///
    /// # async fn app(client: Client) -> pgsession::Result<()> {
    /// let outcome = client
    ///     .with_transaction(TransactionOptions::new(), |tx| async move {
    ///         tx.equery("INSERT INTO post(name) VALUES ($1)", &[Value::from("foo")]).await?;
    ///         Ok::<_, pgsession::Error>(())
    ///     })
    ///     .await?;
    /// assert!(outcome.is_committed());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_transaction<F, Fut, T, E>(
        &self,
        opts: TransactionOptions,
        work: F,
    ) -> Result<Outcome<T, E>, E>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        self.send_begin(&opts.begin_opts).await?;

        let value = match work(self.clone()).await {
            Ok(value) => value,
            Err(err) => return self.rolled_back(opts.reraise, err).await,
        };

        match self.send_commit(opts.ensure_committed).await {
            Ok(()) => Ok(Outcome::Committed(value)),
            Err(err) => self.rolled_back(opts.reraise, E::from(err)).await,
        }
    }

    async fn rolled_back<T, E>(&self, reraise: bool, err: E) -> Result<Outcome<T, E>, E> {
        self.send_rollback().await;
        match reraise {
            true => Err(err),
            false => Ok(Outcome::RolledBack(err)),
        }
    }

    /// `BEGIN` must be acknowledged without rows.
    async fn send_begin(&self, begin_opts: &str) -> Result<()> {
        let sql = match begin_opts.trim() {
            "" => String::from("BEGIN"),
            opts => format!("BEGIN {opts}"),
        };
        let results = self.simple_query(&sql).await?;
        match results.as_slice() {
            [result] if result.rows.is_empty() && result.status == Some(CommandStatus::Begin) => Ok(()),
            _ => Err(StateError { reason: "BEGIN was not acknowledged" }.into()),
        }
    }

    async fn send_commit(&self, ensure_committed: bool) -> Result<()> {
        let results = self.simple_query("COMMIT").await?;
        if !ensure_committed {
            return Ok(());
        }
        // status of this very `COMMIT`, other handles may run commands in between
        match results.into_iter().last().and_then(|result| result.status) {
            Some(CommandStatus::Commit) => Ok(()),
            status => Err(CommitVerificationError { status }.into()),
        }
    }

    async fn send_rollback(&self) {
        if let Err(_err) = self.simple_query("ROLLBACK").await {
            logging!(warn, "rollback failed: {_err}");
        }
    }

    /// Start a transaction scope, `begin_opts` is appended to `BEGIN`.
    ///
    /// The transaction is rolled back when the returned [`Transaction`] is dropped
    /// without [`Transaction::commit`].
    pub async fn begin(&self, begin_opts: &str) -> Result<Transaction> {
        self.send_begin(begin_opts).await?;
        Ok(Transaction { client: self.clone(), done: false })
    }
}

/// An RAII implementation of transaction scope.
///
/// To begin a transaction, use [`Client::begin`].
///
/// To commit transaction, use [`Transaction::commit`].
///
/// If not commited, when this structure is dropped, transaction will be rolled back.
///
/// # Example
///
/// ```no_run
/// # async fn test(client: pgsession::Client) -> pgsession::Result<()> {
/// let tx = client.begin("").await?;
///
/// tx.simple_query("insert into post(name) values('foo')").await?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Transaction {
    client: Client,
    done: bool,
}

impl Transaction {
    /// Commit transaction.
    ///
    /// Fails with [`CommitVerificationError`] if the server rolled back instead.
    pub async fn commit(mut self) -> Result<()> {
        self.done = true;
        let result = self.client.send_commit(true).await;
        if result.is_err() {
            self.client.send_rollback().await;
        }
        result
    }

    /// Rollback transaction.
    pub async fn rollback(mut self) -> Result<()> {
        self.done = true;
        self.client.simple_query("ROLLBACK").await?;
        Ok(())
    }
}

impl Deref for Transaction {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.done {
            self.client.enqueue(Command::SimpleQuery { sql: ByteStr::from_static("ROLLBACK") });
        }
    }
}
