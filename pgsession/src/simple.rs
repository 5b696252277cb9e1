//! Simple query protocol.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-SIMPLE-QUERY>
use std::{fmt, sync::Arc};

use crate::{
    Client, Result,
    command::{Command, call},
    common::{ByteStr, logging},
    postgres::{BackendMessage, ProtocolError, frontend},
    row::{QueryResult, Row},
    session::Session,
    statement::Column,
    transport::PgTransport,
};

/// Parsed `CommandComplete` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandStatus {
    Begin,
    Commit,
    Rollback,
    Insert(u64),
    Update(u64),
    Delete(u64),
    Select(u64),
    Copy(u64),
    Fetch(u64),
    Move(u64),
    Merge(u64),
    /// Any other tag, e.g. `CREATE TABLE`.
    Other(ByteStr),
}

impl CommandStatus {
    /// Parse the command tag.
    pub fn parse(tag: &ByteStr) -> CommandStatus {
        let mut whs = tag.split_whitespace();
        let name = whs.next().unwrap_or_default();
        let rows = match name {
            // INSERT oid rows
            "INSERT" => whs.nth(1),
            _ => whs.next(),
        };
        let rows = || rows.and_then(|r| r.parse().ok()).unwrap_or_default();

        match name {
            "BEGIN" => CommandStatus::Begin,
            "COMMIT" => CommandStatus::Commit,
            "ROLLBACK" => CommandStatus::Rollback,
            "INSERT" => CommandStatus::Insert(rows()),
            "UPDATE" => CommandStatus::Update(rows()),
            "DELETE" => CommandStatus::Delete(rows()),
            "SELECT" => CommandStatus::Select(rows()),
            "COPY" => CommandStatus::Copy(rows()),
            "FETCH" => CommandStatus::Fetch(rows()),
            "MOVE" => CommandStatus::Move(rows()),
            "MERGE" => CommandStatus::Merge(rows()),
            _ => CommandStatus::Other(tag.clone()),
        }
    }

    /// Number of rows processed, zero for commands without a row count.
    pub fn rows(&self) -> u64 {
        match self {
            CommandStatus::Insert(n)
            | CommandStatus::Update(n)
            | CommandStatus::Delete(n)
            | CommandStatus::Select(n)
            | CommandStatus::Copy(n)
            | CommandStatus::Fetch(n)
            | CommandStatus::Move(n)
            | CommandStatus::Merge(n) => *n,
            _ => 0,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandStatus::Begin => f.write_str("BEGIN"),
            CommandStatus::Commit => f.write_str("COMMIT"),
            CommandStatus::Rollback => f.write_str("ROLLBACK"),
            CommandStatus::Insert(n) => write!(f, "INSERT 0 {n}"),
            CommandStatus::Update(n) => write!(f, "UPDATE {n}"),
            CommandStatus::Delete(n) => write!(f, "DELETE {n}"),
            CommandStatus::Select(n) => write!(f, "SELECT {n}"),
            CommandStatus::Copy(n) => write!(f, "COPY {n}"),
            CommandStatus::Fetch(n) => write!(f, "FETCH {n}"),
            CommandStatus::Move(n) => write!(f, "MOVE {n}"),
            CommandStatus::Merge(n) => write!(f, "MERGE {n}"),
            CommandStatus::Other(tag) => f.write_str(tag),
        }
    }
}

impl<IO: PgTransport> Session<IO> {
    /// Run one or more `;` separated statements.
    ///
    /// Rows are received in text format.
    pub(crate) async fn simple_query(&mut self, sql: &str) -> Result<Vec<QueryResult>> {
        self.io.send(frontend::Query { sql });
        self.flush().await?;

        let mut results = vec![];
        let mut columns: Arc<[Column]> = Arc::new([]);
        let mut rows = vec![];
        let mut failed = None;

        loop {
            use BackendMessage::*;
            let message = match self.recv().await {
                Ok(ok) => ok,
                Err(err) if err.is_database() => {
                    failed.get_or_insert(err);
                    continue;
                },
                Err(err) => return Err(err),
            };

            match message {
                RowDescription(desc) => columns = Column::decode_all(desc)?.into(),
                DataRow(row) => match Row::decode(&columns, row, &self.registry) {
                    Ok(row) => rows.push(row),
                    Err(err) => { failed.get_or_insert(err); },
                },
                CommandComplete(_) => results.push(QueryResult {
                    columns: std::mem::replace(&mut columns, Arc::new([])),
                    rows: std::mem::take(&mut rows),
                    status: self.last_status.clone(),
                }),
                EmptyQueryResponse(_) => results.push(QueryResult {
                    columns: Arc::new([]),
                    rows: vec![],
                    status: None,
                }),
                CopyInResponse(_) => {
                    self.io.send(frontend::CopyFail { message: "COPY FROM STDIN is not supported in simple query" });
                    self.flush().await?;
                },
                CopyOutResponse(_) | CopyData(_) | CopyDone(_) => { },
                ReadyForQuery(_) => break,
                f => Err(ProtocolError::unexpected_during(f.msgtype(), "simple query"))?,
            }
        }

        match failed {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    /// Resolve oids of the dynamic type names from `pg_type`.
    pub(crate) async fn update_type_cache(&mut self, names: Vec<ByteStr>) -> Result<()> {
        let mut names = names;
        if names.is_empty() {
            names = self.registry.dynamic_names();
        }
        if names.is_empty() {
            return Ok(());
        }

        let mut sql = String::from("SELECT typname, oid, typarray FROM pg_type WHERE typname IN (");
        for (i, name) in names.iter().enumerate() {
            if i != 0 {
                sql.push(',');
            }
            sql.push('\'');
            sql.push_str(&name.replace('\'', "''"));
            sql.push('\'');
        }
        sql.push(')');

        let results = self.simple_query(&sql).await?;
        for row in results.iter().flat_map(|r| &r.rows) {
            let name = row.try_get::<_, String>(0)?;
            let oid = u32::try_from(row.try_get::<_, i64>(1)?).ok();
            let array = u32::try_from(row.try_get::<_, i64>(2)?).ok();
            match oid {
                Some(oid) => self.registry.resolve(&name, oid, array),
                None => {
                    logging!(warn, "invalid oid for type `{name}`");
                },
            }
        }

        Ok(())
    }
}

impl Client {
    /// Run one or more `;` separated statements with the simple query protocol.
    ///
    /// Returns one [`QueryResult`] per statement, values are decoded from text format.
    pub async fn simple_query(&self, sql: &str) -> Result<Vec<QueryResult>> {
        call!(self, Command::SimpleQuery { sql: ByteStr::copy_from_str(sql) } => Simple)
    }

    /// Resolve registered type names to their oid in this database.
    ///
    /// An empty `names` refreshes every registered dynamic type.
    pub async fn update_type_cache(&self, names: &[&str]) -> Result<()> {
        let names = names.iter().map(|n| ByteStr::copy_from_str(n)).collect();
        call!(self, Command::UpdateTypeCache { names } => Unit)
    }

    /// Tag of the last completed command.
    pub async fn command_status(&self) -> Result<Option<CommandStatus>> {
        call!(self, Command::CommandStatus => Status)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{testing, value::Value};

    #[test]
    fn parse_command_tag() {
        assert_eq!(CommandStatus::parse(&"INSERT 0 3".into()), CommandStatus::Insert(3));
        assert_eq!(CommandStatus::parse(&"SELECT 12".into()), CommandStatus::Select(12));
        assert_eq!(CommandStatus::parse(&"COMMIT".into()), CommandStatus::Commit);
        assert_eq!(CommandStatus::parse(&"ROLLBACK".into()), CommandStatus::Rollback);
        assert_eq!(
            CommandStatus::parse(&"CREATE TABLE".into()),
            CommandStatus::Other("CREATE TABLE".into()),
        );
        assert_eq!(CommandStatus::Copy(2).rows(), 2);
        assert_eq!(CommandStatus::Insert(3).to_string(), "INSERT 0 3");
    }

    #[tokio::test]
    async fn simple_query_text_rows() {
        let (client, _server) = testing::client().await;
        let results = client.simple_query("SELECT 1").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rows[0].values(), &[Value::Int4(1)]);
        assert_eq!(results[0].status, Some(CommandStatus::Select(1)));
        assert_eq!(client.command_status().await.unwrap(), Some(CommandStatus::Select(1)));
    }

    #[tokio::test]
    async fn type_cache_resolves_extension_types() {
        let (client, server) = testing::client().await;
        assert!(server.queries().iter().any(|q| q.contains("FROM pg_type")));
        client.update_type_cache(&["hstore"]).await.unwrap();
    }
}
