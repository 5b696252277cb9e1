//! Extended query protocol.
//!
//! Parse, Bind, Describe and Close are sent with `Flush` and their completion awaited one
//! command at a time. When one of them fails, `Sync` is sent before the error is returned
//! so the server leaves its error state, `Execute` leaves that to the caller.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-EXT-QUERY>
use std::sync::Arc;

use crate::{
    Client, Result,
    command::{Command, StatementRef, call},
    common::{ByteStr, verbose},
    error::ParamMismatch,
    postgres::{
        BackendMessage, Oid, PgFormat, ProtocolError,
        backend::{BindComplete, CloseComplete, ParameterDescription, ParseComplete, ReadyForQuery},
        frontend,
    },
    row::{QueryResult, Row, RowBatch},
    session::Session,
    sql::{Sql, sql_id},
    statement::{Column, Statement},
    transport::PgTransport,
    value::Value,
};

impl<IO: PgTransport> Session<IO> {
    pub(crate) async fn parse(&mut self, name: ByteStr, sql: &str, types: &[Oid]) -> Result<Statement> {
        self.io.send(frontend::Parse { prepare_name: &name, sql, oids: types });
        self.io.send(frontend::Describe { kind: b'S', name: &name });
        self.io.send(frontend::Flush);
        self.flush().await?;

        match self.read_parse(name).await {
            Ok(ok) => Ok(ok),
            Err(err) => Err(self.sync_after(err).await),
        }
    }

    async fn read_parse(&mut self, name: ByteStr) -> Result<Statement> {
        self.recv_as::<ParseComplete>().await?;
        self.read_description(name).await
    }

    /// `ParameterDescription` followed by `RowDescription` or `NoData`.
    async fn read_description(&mut self, name: ByteStr) -> Result<Statement> {
        let ParameterDescription { oids } = self.recv_as().await?;
        let columns = match self.recv().await? {
            BackendMessage::RowDescription(desc) => Column::decode_all(desc)?,
            BackendMessage::NoData(_) => vec![],
            f => Err(ProtocolError::unexpected_during(f.msgtype(), "statement description"))?,
        };
        Ok(Statement::new(name, oids, columns))
    }

    /// Parse through the statement cache.
    pub(crate) async fn prepare(&mut self, sql: &str, persistent: bool) -> Result<Statement> {
        if !persistent || self.statements.is_none() {
            return self.parse(ByteStr::default(), sql, &[]).await;
        }

        let key = sql_id(sql);
        if let Some(statement) = self.statements.as_mut().and_then(|cache| cache.get(&key)) {
            verbose!("statement cache hit: {}", statement.name());
            return Ok(statement.clone());
        }

        let evicted = match self.statements.as_mut() {
            Some(cache) if cache.len() == cache.cap().get() => cache.pop_lru().map(|(_, stmt)| stmt),
            _ => None,
        };
        if let Some(evicted) = &evicted {
            verbose!("statement cache evict: {}", evicted.name());
            self.io.send(frontend::Close { variant: b'S', name: evicted.name() });
        }

        let name = self.next_statement_name();
        self.io.send(frontend::Parse { prepare_name: &name, sql, oids: &[] });
        self.io.send(frontend::Describe { kind: b'S', name: &name });
        self.io.send(frontend::Flush);
        self.flush().await?;

        let read = async {
            if evicted.is_some() {
                self.recv_as::<CloseComplete>().await?;
            }
            self.read_parse(name).await
        };
        let statement = match read.await {
            Ok(ok) => ok,
            Err(err) => return Err(self.sync_after(err).await),
        };

        if let Some(cache) = self.statements.as_mut() {
            cache.put(key, statement.clone());
        }
        Ok(statement)
    }

    /// Encode parameters of `statement`, failing before any traffic.
    fn encode_bind(&self, statement: &Statement, params: &[Value]) -> Result<(Vec<PgFormat>, Vec<Option<bytes::Bytes>>)> {
        ParamMismatch::check(statement.param_types().len(), params.len())?;
        Ok(self.registry.encode_params(statement.param_types(), params)?)
    }

    fn send_bind(
        &mut self,
        portal: &str,
        statement: &Statement,
        (formats, values): &(Vec<PgFormat>, Vec<Option<bytes::Bytes>>),
        columns: &[Column],
    ) {
        let result_formats = Self::result_formats(columns);
        self.io.send(frontend::Bind {
            portal_name: portal,
            stmt_name: statement.name(),
            param_formats: PgFormat::compact(formats),
            params: values,
            result_formats: PgFormat::compact(&result_formats),
        });
    }

    pub(crate) async fn bind(&mut self, statement: &Statement, portal: &str, params: &[Value]) -> Result<()> {
        let encoded = self.encode_bind(statement, params)?;
        let columns = self.bound_columns(statement);
        self.send_bind(portal, statement, &encoded, &columns);
        self.io.send(frontend::Flush);
        self.flush().await?;

        match self.recv_as::<BindComplete>().await {
            Ok(_) => Ok(()),
            Err(err) => Err(self.sync_after(err).await),
        }
    }

    pub(crate) async fn execute(&mut self, statement: &Statement, portal: &str, max_row: u32) -> Result<RowBatch> {
        let columns = self.bound_columns(statement);
        self.io.send(frontend::Execute { portal_name: portal, max_row });
        self.io.send(frontend::Flush);
        self.flush().await?;
        self.read_rows(&columns).await
    }

    /// `DataRow` until `CommandComplete`, `EmptyQueryResponse` or `PortalSuspended`.
    ///
    /// A row that fails to decode does not stop reading, the error is returned
    /// once the portal is done.
    pub(crate) async fn read_rows(&mut self, columns: &Arc<[Column]>) -> Result<RowBatch> {
        let mut rows = vec![];
        let mut failed = None;
        let mut batch = loop {
            match self.recv().await? {
                BackendMessage::DataRow(row) => match Row::decode(columns, row, &self.registry) {
                    Ok(row) => rows.push(row),
                    Err(err) => {
                        failed.get_or_insert(err);
                    },
                },
                BackendMessage::CommandComplete(_) => {
                    break RowBatch { rows: vec![], status: self.last_status.clone(), suspended: false };
                },
                BackendMessage::EmptyQueryResponse(_) => {
                    break RowBatch { rows: vec![], status: None, suspended: false };
                },
                BackendMessage::PortalSuspended(_) => {
                    break RowBatch { rows: vec![], status: None, suspended: true };
                },
                f => Err(ProtocolError::unexpected_during(f.msgtype(), "execute"))?,
            }
        };
        if let Some(err) = failed {
            return Err(err);
        }
        batch.rows = rows;
        Ok(batch)
    }

    pub(crate) async fn describe_statement(&mut self, name: ByteStr) -> Result<Statement> {
        self.io.send(frontend::Describe { kind: b'S', name: &name });
        self.io.send(frontend::Flush);
        self.flush().await?;

        match self.read_description(name).await {
            Ok(ok) => Ok(ok),
            Err(err) => Err(self.sync_after(err).await),
        }
    }

    pub(crate) async fn describe_portal(&mut self, name: &str) -> Result<Vec<Column>> {
        self.io.send(frontend::Describe { kind: b'P', name });
        self.io.send(frontend::Flush);
        self.flush().await?;

        let read = match self.recv().await {
            Ok(BackendMessage::RowDescription(desc)) => Column::decode_all(desc).map_err(Into::into),
            Ok(BackendMessage::NoData(_)) => Ok(vec![]),
            Ok(f) => Err(ProtocolError::unexpected_during(f.msgtype(), "portal description").into()),
            Err(err) => Err(err),
        };
        match read {
            Ok(ok) => Ok(ok),
            Err(err) => Err(self.sync_after(err).await),
        }
    }

    /// Close a statement (`S`) or a portal (`P`).
    pub(crate) async fn close(&mut self, variant: u8, name: &str) -> Result<()> {
        self.io.send(frontend::Close { variant, name });
        self.io.send(frontend::Flush);
        self.flush().await?;

        if variant == b'S' {
            self.evict(name);
        }

        match self.recv_as::<CloseComplete>().await {
            Ok(_) => Ok(()),
            Err(err) => Err(self.sync_after(err).await),
        }
    }

    /// Remove a statement from the cache by name.
    fn evict(&mut self, name: &str) {
        let Some(cache) = self.statements.as_mut() else {
            return;
        };
        let key = cache.iter().find(|(_, stmt)| stmt.name() == name).map(|(key, _)| *key);
        if let Some(key) = key {
            cache.pop(&key);
        }
    }

    pub(crate) async fn sync(&mut self) -> Result<()> {
        self.io.send(frontend::Sync);
        self.flush().await?;
        self.wait_ready().await
    }

    /// Parse into the unnamed statement, then Bind, Execute, Close and Sync in one pipeline.
    pub(crate) async fn extended_query(&mut self, sql: &str, types: &[Oid], params: &[Value]) -> Result<QueryResult> {
        let statement = self.parse(ByteStr::default(), sql, types).await?;
        let encoded = self.encode_bind(&statement, params)?;
        let columns = self.bound_columns(&statement);

        self.send_bind("", &statement, &encoded, &columns);
        self.io.send(frontend::Execute { portal_name: "", max_row: 0 });
        self.io.send(frontend::Close { variant: b'S', name: "" });
        self.io.send(frontend::Sync);
        self.flush().await?;

        match self.read_query(&columns, true).await {
            Ok(batch) => Ok(QueryResult::new(columns, batch)),
            Err(err) => Err(self.ready_after(err).await),
        }
    }

    pub(crate) async fn prepared_query(&mut self, statement: StatementRef, params: &[Value]) -> Result<QueryResult> {
        let statement = match statement {
            StatementRef::Statement(statement) => statement,
            StatementRef::Name(name) => self.describe_statement(name).await?,
        };
        let encoded = self.encode_bind(&statement, params)?;
        let columns = self.bound_columns(&statement);

        self.send_bind("", &statement, &encoded, &columns);
        self.io.send(frontend::Execute { portal_name: "", max_row: 0 });
        self.io.send(frontend::Sync);
        self.flush().await?;

        match self.read_query(&columns, false).await {
            Ok(batch) => Ok(QueryResult::new(columns, batch)),
            Err(err) => Err(self.ready_after(err).await),
        }
    }

    async fn read_query(&mut self, columns: &Arc<[Column]>, close: bool) -> Result<RowBatch> {
        self.recv_as::<BindComplete>().await?;
        let batch = self.read_rows(columns).await?;
        if close {
            self.recv_as::<CloseComplete>().await?;
        }
        self.recv_as::<ReadyForQuery>().await?;
        Ok(batch)
    }

    /// Bind and Execute of one batch item, without Sync.
    pub(crate) fn send_portal(
        &mut self,
        statement: &Statement,
        encoded: &(Vec<PgFormat>, Vec<Option<bytes::Bytes>>),
        columns: &[Column],
    ) {
        self.send_bind("", statement, encoded, columns);
        self.io.send(frontend::Execute { portal_name: "", max_row: 0 });
    }

    pub(crate) async fn read_portal(&mut self, columns: &Arc<[Column]>) -> Result<RowBatch> {
        self.recv_as::<BindComplete>().await?;
        self.read_rows(columns).await
    }

    pub(crate) fn encode_all(&self, statement: &Statement, lists: &[Vec<Value>]) -> Result<Vec<(Vec<PgFormat>, Vec<Option<bytes::Bytes>>)>> {
        lists.iter().map(|params| self.encode_bind(statement, params)).collect()
    }
}

impl Client {
    /// Parse `sql` into a statement named `name`, an empty name is the unnamed statement.
    ///
    /// `types` optionally specify parameter types, zero leaves the type unspecified.
    pub async fn parse(&self, name: &str, sql: &str, types: &[Oid]) -> Result<Statement> {
        let command = Command::Parse {
            name: ByteStr::copy_from_str(name),
            sql: ByteStr::copy_from_str(sql),
            types: types.to_vec(),
        };
        call!(self, command => Statement)
    }

    /// Parse `sql` through the statement cache.
    ///
    /// A `&str` is parsed once per connection and reused, use [`SqlExt::once`][crate::SqlExt::once]
    /// to parse into the unnamed statement instead.
    pub async fn prepare(&self, sql: impl Sql) -> Result<Statement> {
        let command = Command::Prepare {
            sql: ByteStr::copy_from_str(sql.sql()),
            persistent: sql.persistent(),
        };
        call!(self, command => Statement)
    }

    /// Bind `params` to `statement` into `portal`.
    pub async fn bind(&self, statement: &Statement, portal: &str, params: &[Value]) -> Result<()> {
        let command = Command::Bind {
            statement: statement.clone(),
            portal: ByteStr::copy_from_str(portal),
            params: params.to_vec(),
        };
        call!(self, command => Unit)
    }

    /// Execute `portal`, bound from `statement`, returning at most `max_row` rows, zero for no limit.
    ///
    /// A query error is returned without `Sync`, call [`Client::sync`] afterwards.
    pub async fn execute(&self, statement: &Statement, portal: &str, max_row: u32) -> Result<RowBatch> {
        let command = Command::Execute {
            statement: statement.clone(),
            portal: ByteStr::copy_from_str(portal),
            max_row,
        };
        call!(self, command => Batch)
    }

    pub async fn describe_statement(&self, name: &str) -> Result<Statement> {
        call!(self, Command::DescribeStatement { name: ByteStr::copy_from_str(name) } => Statement)
    }

    pub async fn describe_portal(&self, name: &str) -> Result<Vec<Column>> {
        call!(self, Command::DescribePortal { name: ByteStr::copy_from_str(name) } => Columns)
    }

    /// Close a prepared statement, removing it from the statement cache.
    pub async fn close_statement(&self, name: &str) -> Result<()> {
        call!(self, Command::CloseStatement { name: ByteStr::copy_from_str(name) } => Unit)
    }

    pub async fn close_portal(&self, name: &str) -> Result<()> {
        call!(self, Command::ClosePortal { name: ByteStr::copy_from_str(name) } => Unit)
    }

    /// Send `Sync` and wait for `ReadyForQuery`.
    pub async fn sync(&self) -> Result<()> {
        call!(self, Command::Sync => Unit)
    }

    /// Run `sql` with `params` through the unnamed statement.
    pub async fn equery(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.equery_with_types(sql, &[], params).await
    }

    /// Same as [`Client::equery`] with explicit parameter types.
    pub async fn equery_with_types(&self, sql: &str, types: &[Oid], params: &[Value]) -> Result<QueryResult> {
        let command = Command::ExtendedQuery {
            sql: ByteStr::copy_from_str(sql),
            types: types.to_vec(),
            params: params.to_vec(),
        };
        call!(self, command => Result)
    }

    /// Run a prepared statement, given by value or by name.
    pub async fn prepared_query(&self, statement: impl Into<StatementRef>, params: &[Value]) -> Result<QueryResult> {
        let command = Command::PreparedQuery {
            statement: statement.into(),
            params: params.to_vec(),
        };
        call!(self, command => Result)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ErrorKind, SqlExt, postgres::oid, testing};

    #[tokio::test]
    async fn parse_bind_execute() {
        let (client, _server) = testing::client().await;

        let statement = client.parse("", "SELECT $1::int", &[]).await.unwrap();
        assert!(statement.is_unnamed());
        assert_eq!(statement.param_types(), &[oid::INT4]);
        assert_eq!(statement.columns().len(), 1);

        client.bind(&statement, "", &[Value::Int4(42)]).await.unwrap();
        let batch = client.execute(&statement, "", 0).await.unwrap();
        client.sync().await.unwrap();

        assert_eq!(batch.rows.len(), 1);
        assert_eq!(batch.rows[0].len(), 1);
        assert_eq!(batch.rows[0].try_get::<_, i32>(0).unwrap(), 42);
        assert_eq!(batch.rows[0].columns()[0].type_oid(), oid::INT4);
        assert!(!batch.suspended);
    }

    #[tokio::test]
    async fn parse_error_is_followed_by_sync() {
        let (client, server) = testing::client().await;

        let err = client.parse("", "SELEC syntax error", &[]).await.unwrap_err();
        assert_eq!(err.as_db_error().unwrap().code(), "42601");

        let frames = server.frames();
        let kinds: Vec<u8> = frames.iter().rev().take(4).map(|f| f.0).collect();
        assert_eq!(kinds, [b'S', b'H', b'D', b'P']);

        // usable for a fresh pipeline
        let result = client.equery("SELECT $1::int", &[Value::Int4(7)]).await.unwrap();
        assert_eq!(result.rows[0].try_get::<_, i32>(0).unwrap(), 7);
    }

    #[tokio::test]
    async fn bind_error_is_followed_by_sync() {
        let (client, server) = testing::client().await;
        let statement = Statement::new("missing".into(), vec![], vec![]);

        let err = client.bind(&statement, "", &[]).await.unwrap_err();
        assert!(err.is_database());
        assert_eq!(server.frames().last().map(|f| f.0), Some(b'S'));
        assert_eq!(client.equery("SELECT 1", &[]).await.unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn describe_error_is_followed_by_sync() {
        let (client, server) = testing::client().await;

        let err = client.describe_statement("missing").await.unwrap_err();
        assert_eq!(err.as_db_error().unwrap().code(), "26000");
        let kinds: Vec<u8> = server.frames().iter().rev().take(3).map(|f| f.0).collect();
        assert_eq!(kinds, [b'S', b'H', b'D']);

        let err = client.describe_portal("missing").await.unwrap_err();
        assert_eq!(err.as_db_error().unwrap().code(), "34000");
        assert_eq!(server.frames().last().map(|f| f.0), Some(b'S'));

        assert_eq!(client.equery("SELECT 1", &[]).await.unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn close_error_is_followed_by_sync() {
        let (client, server) = testing::client().await;
        let statement = client.prepare("SELECT $1::int").await.unwrap();
        server.fail_next(b'C');

        let err = client.close_statement(statement.name()).await.unwrap_err();
        assert_eq!(err.as_db_error().unwrap().code(), "XX000");
        let kinds: Vec<u8> = server.frames().iter().rev().take(3).map(|f| f.0).collect();
        assert_eq!(kinds, [b'S', b'H', b'C']);

        let result = client.equery("SELECT $1::int", &[Value::Int4(3)]).await.unwrap();
        assert_eq!(result.rows[0].try_get::<_, i32>(0).unwrap(), 3);
    }

    #[tokio::test]
    async fn execute_error_waits_for_caller_sync() {
        let (client, server) = testing::client().await;
        let statement = client.parse("", "SELECT 1", &[]).await.unwrap();
        let syncs = server.count(b'S');

        let err = client.execute(&statement, "nope", 0).await.unwrap_err();
        assert_eq!(err.as_db_error().unwrap().code(), "34000");
        assert_eq!(server.count(b'S'), syncs);

        // the server skips until Sync
        client.sync().await.unwrap();
        assert_eq!(server.count(b'S'), syncs + 1);
        assert_eq!(client.equery("SELECT 1", &[]).await.unwrap().rows.len(), 1);
    }

    #[tokio::test]
    async fn param_mismatch_sends_nothing() {
        let (client, server) = testing::client().await;
        let statement = client.parse("", "SELECT $1::int", &[]).await.unwrap();
        let sent = server.frames().len();

        let err = client.bind(&statement, "", &[]).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ParamMismatch(ParamMismatch { expected: 1, found: 0 })));

        let err = client.prepared_query(&statement, &[Value::Int4(1), Value::Int4(2)]).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ParamMismatch(_)));
        assert_eq!(server.frames().len(), sent);
    }

    #[tokio::test]
    async fn equery_pipeline() {
        let (client, server) = testing::client().await;
        let result = client.equery("SELECT $1::int", &[Value::Int4(42)]).await.unwrap();
        assert_eq!(result.columns.len(), 1);
        assert_eq!(result.rows[0].try_get::<_, i64>(0).unwrap(), 42);

        let kinds: Vec<u8> = server.frames().iter().rev().take(7).map(|f| f.0).collect();
        assert_eq!(kinds, [b'S', b'C', b'E', b'B', b'H', b'D', b'P']);

        // unnamed portal and statement, then a single format code for every parameter
        let bind = server.frames().into_iter().find(|f| f.0 == b'B').unwrap().1;
        assert_eq!(&bind[..6], &[0, 0, 0, 1, 0, 1]);
    }

    #[tokio::test]
    async fn statement_cache() {
        let (client, server) = testing::client_with(crate::Config::new().statement_cache_capacity(1)).await;

        let a = client.prepare("SELECT $1::int").await.unwrap();
        let again = client.prepare("SELECT $1::int").await.unwrap();
        assert_eq!(a, again);
        assert!(!a.is_unnamed());
        assert_eq!(server.count(b'P'), 1);

        let once = client.prepare("SELECT $1::int".once()).await.unwrap();
        assert!(once.is_unnamed());

        // evicts `a`
        let b = client.prepare("SELECT 1").await.unwrap();
        assert_ne!(a.name(), b.name());
        assert!(server.frames().iter().any(|f| f.0 == b'C' && f.1[1..].starts_with(a.name().as_bytes())));

        let result = client.prepared_query(b.name(), &[]).await.unwrap();
        assert_eq!(result.rows.len(), 1);
    }

    #[tokio::test]
    async fn statement_names_per_connection() {
        let (a, _) = testing::client().await;
        let (b, _) = testing::client().await;

        let first = a.prepare("SELECT $1::int").await.unwrap();
        let second = a.prepare("SELECT 1").await.unwrap();
        assert_eq!(first.name(), "s00001");
        assert_eq!(second.name(), "s00002");

        // another connection does not advance the counter
        let other = b.prepare("SELECT 1").await.unwrap();
        assert_eq!(other.name(), "s00001");
    }

    #[tokio::test]
    async fn row_limit_suspends_portal() {
        let (client, _server) = testing::client().await;
        let statement = client.parse("", "SELECT 1", &[]).await.unwrap();
        client.bind(&statement, "p1", &[]).await.unwrap();

        let batch = client.execute(&statement, "p1", 1).await.unwrap();
        assert!(batch.suspended);
        assert_eq!(batch.rows.len(), 1);

        let columns = client.describe_portal("p1").await.unwrap();
        assert_eq!(columns.len(), 1);
        client.close_portal("p1").await.unwrap();
        client.sync().await.unwrap();
    }
}
