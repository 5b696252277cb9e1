//! Pipelined batch execution.
//!
//! Every Bind and Execute pair of a batch is written before a single `Sync`, results are
//! read back in input order. When one item fails, the server skips the rest up to `Sync`.
use crate::{
    Client, Result,
    command::{Command, call},
    common::{ByteStr, verbose},
    postgres::{backend::ReadyForQuery, frontend},
    row::RowBatch,
    session::Session,
    statement::{Column, Statement},
    transport::PgTransport,
    value::Value,
};

impl<IO: PgTransport> Session<IO> {
    /// Run `statement` once per parameter list.
    pub(crate) async fn execute_batch(
        &mut self,
        statement: &Statement,
        lists: &[Vec<Value>],
    ) -> Result<(Vec<Column>, Vec<RowBatch>)> {
        // columns as bound, with the result formats the rows are decoded with
        let bound = self.bound_columns(statement);
        let columns = bound.to_vec();
        if lists.is_empty() {
            return Ok((columns, vec![]));
        }

        let encoded = self.encode_all(statement, lists)?;
        verbose!("batch of {} on `{}`", lists.len(), statement.name());

        for encoded in &encoded {
            self.send_portal(statement, encoded, &bound);
        }
        self.io.send(frontend::Sync);
        self.flush().await?;

        let read = async {
            let mut batches = Vec::with_capacity(lists.len());
            for _ in 0..lists.len() {
                batches.push(self.read_portal(&bound).await?);
            }
            self.recv_as::<ReadyForQuery>().await?;
            Ok(batches)
        };
        match read.await {
            Ok(batches) => Ok((columns, batches)),
            Err(err) => Err(self.ready_after(err).await),
        }
    }

    /// Parse `sql` into the unnamed statement, then run it once per parameter list.
    pub(crate) async fn execute_batch_sql(
        &mut self,
        sql: &str,
        lists: &[Vec<Value>],
    ) -> Result<(Vec<Column>, Vec<RowBatch>)> {
        let statement = self.parse(ByteStr::default(), sql, &[]).await?;
        self.execute_batch(&statement, lists).await
    }

    /// Run a batch of different statements.
    pub(crate) async fn execute_batch_mixed(&mut self, items: &[(Statement, Vec<Value>)]) -> Result<Vec<RowBatch>> {
        if items.is_empty() {
            return Ok(vec![]);
        }

        let mut pending = Vec::with_capacity(items.len());
        for (statement, params) in items {
            let encoded = self.encode_all(statement, std::slice::from_ref(params))?;
            pending.push((encoded, self.bound_columns(statement)));
        }

        for ((statement, _), (encoded, bound)) in items.iter().zip(&pending) {
            for encoded in encoded {
                self.send_portal(statement, encoded, bound);
            }
        }
        self.io.send(frontend::Sync);
        self.flush().await?;

        let read = async {
            let mut batches = Vec::with_capacity(items.len());
            for (_, bound) in &pending {
                batches.push(self.read_portal(bound).await?);
            }
            self.recv_as::<ReadyForQuery>().await?;
            Ok(batches)
        };
        match read.await {
            Ok(batches) => Ok(batches),
            Err(err) => Err(self.ready_after(err).await),
        }
    }
}

impl Client {
    /// Run `statement` once per parameter list in one round trip.
    ///
    /// Results are in the order of `params`, columns are returned once.
    /// Every list is checked against the statement before anything is sent.
    pub async fn execute_batch(
        &self,
        statement: &Statement,
        params: Vec<Vec<Value>>,
    ) -> Result<(Vec<Column>, Vec<RowBatch>)> {
        call!(self, Command::Batch { statement: statement.clone(), params } => Batches)
    }

    /// Same as [`Client::execute_batch`], parsing `sql` first.
    pub async fn execute_batch_sql(&self, sql: &str, params: Vec<Vec<Value>>) -> Result<(Vec<Column>, Vec<RowBatch>)> {
        call!(self, Command::BatchSql { sql: ByteStr::copy_from_str(sql), params } => Batches)
    }

    /// Run different statements in one round trip.
    pub async fn execute_batch_mixed(&self, items: Vec<(Statement, Vec<Value>)>) -> Result<Vec<RowBatch>> {
        call!(self, Command::BatchMixed { items } => Mixed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ErrorKind, postgres::PgFormat, simple::CommandStatus, testing};

    #[tokio::test]
    async fn results_in_input_order() {
        let (client, server) = testing::client().await;
        let statement = client.parse("", "SELECT $1::int", &[]).await.unwrap();

        let params = (1..=3).map(|i| vec![Value::Int4(i)]).collect();
        let (columns, batches) = client.execute_batch(&statement, params).await.unwrap();

        assert_eq!(columns.len(), 1);
        assert_eq!(batches.len(), 3);
        assert_eq!(columns[0].format(), PgFormat::Binary);
        assert_eq!(columns[0].format(), batches[0].rows[0].columns()[0].format());
        for (i, batch) in batches.iter().enumerate() {
            assert_eq!(batch.rows[0].try_get::<_, i32>(0).unwrap(), i as i32 + 1);
            assert_eq!(batch.status, Some(CommandStatus::Select(1)));
        }
        // one Sync for the whole batch
        assert_eq!(server.count(b'S'), 1);
    }

    #[tokio::test]
    async fn batch_sql_parses_once() {
        let (client, server) = testing::client().await;
        let (columns, batches) = client
            .execute_batch_sql("INSERT INTO t VALUES ($1::int)", vec![vec![Value::Int4(1)], vec![Value::Int4(2)]])
            .await
            .unwrap();

        assert!(columns.is_empty());
        assert_eq!(batches.iter().map(RowBatch::rows_affected).sum::<u64>(), 2);
        assert_eq!(server.count(b'P'), 1);
    }

    #[tokio::test]
    async fn mixed_batch() {
        let (client, _server) = testing::client().await;
        let select = client.prepare("SELECT $1::int").await.unwrap();
        let insert = client.prepare("INSERT INTO t VALUES ($1::int)").await.unwrap();

        let batches = client
            .execute_batch_mixed(vec![
                (insert.clone(), vec![Value::Int4(5)]),
                (select, vec![Value::Int4(9)]),
                (insert, vec![Value::Null]),
            ])
            .await
            .unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].status, Some(CommandStatus::Insert(1)));
        assert_eq!(batches[1].rows[0].try_get::<_, i32>(0).unwrap(), 9);
        assert!(batches[2].rows.is_empty());
    }

    #[tokio::test]
    async fn mismatch_in_any_list_sends_nothing() {
        let (client, server) = testing::client().await;
        let statement = client.parse("", "SELECT $1::int", &[]).await.unwrap();
        let sent = server.frames().len();

        let err = client
            .execute_batch(&statement, vec![vec![Value::Int4(1)], vec![]])
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ParamMismatch(_)));
        assert_eq!(server.frames().len(), sent);
    }

    #[tokio::test]
    async fn failing_item_waits_for_ready() {
        let (client, _server) = testing::client().await;
        let statement = client.parse("", "SELECT 10 / $1::int", &[]).await.unwrap();

        let err = client
            .execute_batch(&statement, vec![vec![Value::Int4(2)], vec![Value::Int4(0)], vec![Value::Int4(5)]])
            .await
            .unwrap_err();
        assert_eq!(err.as_db_error().unwrap().code(), "22012");

        let result = client.equery("SELECT 1", &[]).await.unwrap();
        assert_eq!(result.rows.len(), 1);
    }
}
