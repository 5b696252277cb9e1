//! In-memory backend for tests.
//!
//! [`FakeTransport`] records every frontend message and answers it synchronously the way a
//! postgres server would, for a small, fixed model of statements:
//!
//! - parameters are counted from `$n`, `$n::int` is `int4`, anything else `text`
//! - each select list item is an `int4` column: a literal, a `$n` parameter or `literal / $n`
//! - `INSERT` returns no rows and `INSERT 0 1`
//! - sql containing `syntax error` fails to parse
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll, Waker},
};

use crate::{
    Client, Config, Result,
    ext::BufMutExt,
    postgres::{BackendProtocol, FrontendProtocol, Oid, frontend, oid},
    transport::PgTransport,
};

/// Connect a client to a fresh fake server.
pub(crate) async fn client() -> (Client, Server) {
    client_with(Config::new()).await
}

pub(crate) async fn client_with(config: Config) -> (Client, Server) {
    let server = Server::default();
    let io = FakeTransport { server: server.clone() };
    let client = Client::with_transport(io, config).await.unwrap();
    (client, server)
}

/// Handle to inspect the fake server.
#[derive(Clone, Default)]
pub(crate) struct Server {
    inner: Arc<Mutex<Backend>>,
}

impl Server {
    fn lock(&self) -> MutexGuard<'_, Backend> {
        self.inner.lock().unwrap()
    }

    /// Every frontend message received, as message type and body.
    pub(crate) fn frames(&self) -> Vec<(u8, Bytes)> {
        self.lock().frames.clone()
    }

    /// Number of received messages of `msgtype`.
    pub(crate) fn count(&self, msgtype: u8) -> usize {
        self.lock().frames.iter().filter(|f| f.0 == msgtype).count()
    }

    /// Simple queries received.
    pub(crate) fn queries(&self) -> Vec<String> {
        self.lock().queries.clone()
    }

    /// Answer every following `COMMIT` with `ROLLBACK`, as for an aborted transaction.
    pub(crate) fn fail_commit(&self) {
        self.lock().fail_commit = true;
    }

    /// Fail the next `msgtype` message with an internal error.
    pub(crate) fn fail_next(&self, msgtype: u8) {
        self.lock().fail_next = Some(msgtype);
    }

    /// Stop accepting writes, every flush stays pending.
    pub(crate) fn stall_writes(&self) {
        self.lock().stalled = true;
    }
}

pub(crate) struct FakeTransport {
    server: Server,
}

impl PgTransport for FakeTransport {
    fn poll_flush(&mut self, _: &mut Context) -> Poll<io::Result<()>> {
        match self.server.lock().stalled {
            true => Poll::Pending,
            false => Poll::Ready(Ok(())),
        }
    }

    fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        let mut backend = self.server.lock();
        match backend.outbox.pop_front() {
            Some((msgtype, body)) => Poll::Ready(B::decode(msgtype, body).map_err(Into::into)),
            None => {
                backend.waker = Some(cx.waker().clone());
                Poll::Pending
            },
        }
    }

    fn send<F: FrontendProtocol>(&mut self, message: F) {
        let mut buf = BytesMut::new();
        frontend::write(message, &mut buf);
        let msgtype = buf.get_u8();
        let _len = buf.get_u32();
        self.server.lock().receive(msgtype, buf.freeze());
    }

    fn send_startup(&mut self, _: frontend::Startup) {
        let mut backend = self.server.lock();
        backend.push(b'R', |b| b.put_u32(0));
        backend.push(b'S', |b| {
            b.put_nul_string("server_version");
            b.put_nul_string("17.0");
        });
        backend.push(b'K', |b| {
            b.put_u32(42);
            b.put_u32(7);
        });
        backend.push(b'Z', |b| b.put_u8(b'I'));
    }

    fn poll_shutdown(&mut self, _: &mut Context) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct FakeStatement {
    sql: String,
    params: Vec<Oid>,
    /// Select list items, every one an int4 column.
    items: Vec<String>,
}

struct Portal {
    statement: String,
    params: Vec<Option<i32>>,
    binary: bool,
}

#[derive(Default)]
struct CopyIn {
    binary: bool,
    data: BytesMut,
}

struct Backend {
    frames: Vec<(u8, Bytes)>,
    queries: Vec<String>,
    outbox: VecDeque<(u8, Bytes)>,
    waker: Option<Waker>,
    /// Extended query messages are ignored until Sync.
    skipping: bool,
    tx: u8,
    statements: HashMap<String, FakeStatement>,
    portals: HashMap<String, Portal>,
    copy: Option<CopyIn>,
    streaming: bool,
    fail_commit: bool,
    fail_next: Option<u8>,
    stalled: bool,
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            frames: vec![],
            queries: vec![],
            outbox: VecDeque::new(),
            waker: None,
            skipping: false,
            tx: b'I',
            statements: HashMap::new(),
            portals: HashMap::new(),
            copy: None,
            streaming: false,
            fail_commit: false,
            fail_next: None,
            stalled: false,
        }
    }
}

type Failure = (&'static str, String);

fn get_str(body: &mut Bytes) -> String {
    let end = body.iter().position(|b| *b == 0).unwrap();
    let s = String::from_utf8(body.split_to(end).to_vec()).unwrap();
    body.advance(1);
    s
}

impl Backend {
    fn push(&mut self, msgtype: u8, f: impl FnOnce(&mut BytesMut)) {
        let mut body = BytesMut::new();
        f(&mut body);
        self.outbox.push_back((msgtype, body.freeze()));
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    fn error(&mut self, (code, message): Failure) {
        self.push(b'E', |b| {
            for (field, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', code), (b'M', message.as_str())] {
                b.put_u8(field);
                b.put_nul_string(value);
            }
            b.put_u8(0);
        });
        if self.tx == b'T' {
            self.tx = b'E';
        }
    }

    fn notice(&mut self, severity: &str, code: &str, message: &str) {
        self.push(b'N', |b| {
            for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
                b.put_u8(field);
                b.put_nul_string(value);
            }
            b.put_u8(0);
        });
    }

    fn ready(&mut self) {
        let tx = self.tx;
        self.push(b'Z', |b| b.put_u8(tx));
    }

    fn complete(&mut self, tag: &str) {
        self.push(b'C', |b| b.put_nul_string(tag));
    }

    fn row_description(&mut self, columns: &[(&str, Oid)], binary: bool) {
        self.push(b'T', |b| {
            b.put_u16(columns.len() as u16);
            for (name, oid) in columns {
                b.put_nul_string(name);
                b.put_u32(0);
                b.put_i16(0);
                b.put_u32(*oid);
                b.put_i16(-1);
                b.put_i32(-1);
                b.put_i16(binary as i16);
            }
        });
    }

    fn data_row(&mut self, values: &[Option<Vec<u8>>]) {
        self.push(b'D', |b| {
            b.put_u16(values.len() as u16);
            for value in values {
                match value {
                    Some(value) => {
                        b.put_u32(value.len() as u32);
                        b.put_slice(value);
                    },
                    None => b.put_i32(-1),
                }
            }
        });
    }

    fn receive(&mut self, msgtype: u8, body: Bytes) {
        self.frames.push((msgtype, body.clone()));
        let extended = matches!(msgtype, b'P' | b'B' | b'D' | b'E' | b'C' | b'H');
        if extended && self.skipping {
            return;
        }
        if self.fail_next == Some(msgtype) {
            self.fail_next = None;
            self.error(("XX000", "internal error".into()));
            self.skipping = true;
            return;
        }

        let result = match msgtype {
            b'P' => self.parse(body),
            b'B' => self.bind(body),
            b'D' => self.describe(body),
            b'E' => self.execute(body),
            b'C' => {
                self.close(body);
                Ok(())
            },
            b'S' => {
                self.skipping = false;
                self.ready();
                Ok(())
            },
            b'Q' => {
                self.query(get_str(&mut body.clone()));
                Ok(())
            },
            b'd' => {
                self.copy_data(body);
                Ok(())
            },
            b'c' => {
                self.copy_done();
                Ok(())
            },
            b'f' => {
                if self.copy.take().is_some() {
                    self.error(("57014", format!("COPY from stdin failed: {}", get_str(&mut body.clone()))));
                    self.ready();
                }
                Ok(())
            },
            _ => Ok(()),
        };

        if let Err(failure) = result {
            self.error(failure);
            self.skipping = true;
        }
    }

    fn prepare(sql: &str, hints: &[Oid]) -> Result<FakeStatement, Failure> {
        if sql.contains("syntax error") {
            return Err(("42601", "syntax error at or near \"SELEC\"".into()));
        }

        let count = (1..=9).rev().find(|n| sql.contains(&format!("${n}"))).unwrap_or(0);
        let params = (1..=count)
            .map(|n| match hints.get(n - 1) {
                Some(hint) if *hint != 0 => *hint,
                _ if sql.contains(&format!("${n}::int")) => oid::INT4,
                _ => oid::TEXT,
            })
            .collect();

        let items = match sql.strip_prefix("SELECT ") {
            Some(list) => list.split(',').map(|item| item.trim().to_owned()).collect(),
            None => vec![],
        };
        Ok(FakeStatement { sql: sql.to_owned(), params, items })
    }

    fn parse(&mut self, mut body: Bytes) -> Result<(), Failure> {
        let name = get_str(&mut body);
        let sql = get_str(&mut body);
        let hints: Vec<Oid> = (0..body.get_u16()).map(|_| body.get_u32()).collect();
        if !name.is_empty() && self.statements.contains_key(&name) {
            return Err(("42P05", format!("prepared statement \"{name}\" already exists")));
        }
        let statement = Self::prepare(&sql, &hints)?;
        self.statements.insert(name, statement);
        self.push(b'1', |_| { });
        Ok(())
    }

    fn columns(statement: &FakeStatement) -> Vec<(&str, Oid)> {
        statement.items.iter().map(|_| ("?column?", oid::INT4)).collect()
    }

    fn bind(&mut self, mut body: Bytes) -> Result<(), Failure> {
        let portal = get_str(&mut body);
        let name = get_str(&mut body);
        let formats: Vec<u16> = (0..body.get_u16()).map(|_| body.get_u16()).collect();
        let mut params = vec![];
        for i in 0..body.get_u16() as usize {
            let len = body.get_i32();
            if len < 0 {
                params.push(None);
                continue;
            }
            let raw = body.split_to(len as usize);
            let binary = formats.get(i).or(formats.first()).is_some_and(|f| *f == 1);
            params.push(match binary {
                true if raw.len() == 4 => Some(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
                true => None,
                false => std::str::from_utf8(&raw).ok().and_then(|s| s.parse().ok()),
            });
        }
        let results: Vec<u16> = (0..body.get_u16()).map(|_| body.get_u16()).collect();

        let Some(statement) = self.statements.get(&name) else {
            return Err(("26000", format!("prepared statement \"{name}\" does not exist")));
        };
        if statement.params.len() != params.len() {
            return Err(("08P01", "bind message supplies wrong number of parameters".into()));
        }

        let binary = results.iter().any(|f| *f == 1);
        self.portals.insert(portal, Portal { statement: name, params, binary });
        self.push(b'2', |_| { });
        Ok(())
    }

    fn describe(&mut self, mut body: Bytes) -> Result<(), Failure> {
        let kind = body.get_u8();
        let name = get_str(&mut body);
        let (params, columns, binary) = match kind {
            b'S' => {
                let Some(statement) = self.statements.get(&name) else {
                    return Err(("26000", format!("prepared statement \"{name}\" does not exist")));
                };
                (Some(statement.params.clone()), statement.items.len(), false)
            },
            _ => {
                let Some(portal) = self.portals.get(&name) else {
                    return Err(("34000", format!("portal \"{name}\" does not exist")));
                };
                let columns = self.statements.get(&portal.statement).map_or(0, |s| s.items.len());
                (None, columns, portal.binary)
            },
        };

        if let Some(params) = params {
            self.push(b't', |b| {
                b.put_u16(params.len() as u16);
                for oid in params {
                    b.put_u32(oid);
                }
            });
        }
        match columns {
            0 => self.push(b'n', |_| { }),
            n => self.row_description(&vec![("?column?", oid::INT4); n], binary),
        }
        Ok(())
    }

    fn evaluate(statement: &FakeStatement, params: &[Option<i32>]) -> Result<Vec<Option<i32>>, Failure> {
        let param = |item: &str| {
            let n: usize = item.trim().trim_start_matches('$').split("::").next()?.parse().ok()?;
            params.get(n - 1).copied().flatten()
        };
        statement
            .items
            .iter()
            .map(|item| match item.split_once('/') {
                Some((lhs, rhs)) => {
                    let lhs: i32 = lhs.trim().parse().unwrap_or_default();
                    match param(rhs) {
                        Some(0) => Err(("22012", "division by zero".into())),
                        rhs => Ok(rhs.map(|rhs| lhs / rhs)),
                    }
                },
                None if item.starts_with('$') => Ok(param(item.as_str())),
                None => Ok(item.parse().ok()),
            })
            .collect()
    }

    fn encode(value: Option<i32>, binary: bool) -> Option<Vec<u8>> {
        value.map(|v| match binary {
            true => v.to_be_bytes().to_vec(),
            false => v.to_string().into_bytes(),
        })
    }

    fn execute(&mut self, mut body: Bytes) -> Result<(), Failure> {
        let name = get_str(&mut body);
        let max_row = body.get_u32();
        let Some(portal) = self.portals.get(&name) else {
            return Err(("34000", format!("portal \"{name}\" does not exist")));
        };
        let Some(statement) = self.statements.get(&portal.statement) else {
            return Err(("26000", "prepared statement does not exist".into()));
        };
        let insert = statement.sql.starts_with("INSERT");
        let binary = portal.binary;
        let row = match statement.items.is_empty() {
            true => None,
            false => Some(Self::evaluate(statement, &portal.params)?),
        };

        if insert {
            self.complete("INSERT 0 1");
            return Ok(());
        }
        let Some(row) = row else {
            self.push(b'I', |_| { });
            return Ok(());
        };

        let row: Vec<_> = row.into_iter().map(|v| Self::encode(v, binary)).collect();
        self.data_row(&row);
        match max_row {
            0 => self.complete("SELECT 1"),
            _ => self.push(b's', |_| { }),
        }
        Ok(())
    }

    fn close(&mut self, mut body: Bytes) {
        let kind = body.get_u8();
        let name = get_str(&mut body);
        match kind {
            b'S' => self.statements.remove(&name).map(drop),
            _ => self.portals.remove(&name).map(drop),
        };
        self.push(b'3', |_| { });
    }

    fn query(&mut self, sql: String) {
        self.queries.push(sql.clone());

        if sql.starts_with("BEGIN") {
            self.tx = b'T';
            self.complete("BEGIN");
        } else if sql == "COMMIT" {
            let tag = match self.tx == b'E' || self.fail_commit {
                true => "ROLLBACK",
                false => "COMMIT",
            };
            self.tx = b'I';
            self.complete(tag);
        } else if sql == "ROLLBACK" {
            if self.tx == b'I' {
                self.notice("WARNING", "25P01", "there is no transaction in progress");
            }
            self.tx = b'I';
            self.complete("ROLLBACK");
        } else if sql == "SELECT notice()" {
            self.notice("NOTICE", "00000", "hello from server");
            self.row_description(&[("notice", oid::TEXT)], false);
            self.data_row(&[Some(vec![])]);
            self.complete("SELECT 1");
        } else if sql.contains("FROM pg_type") {
            self.type_rows(&sql);
        } else if sql.starts_with("COPY") {
            let binary = sql.contains("BINARY");
            let columns = match (sql.find('('), sql.find(')')) {
                (Some(start), Some(end)) => sql[start..end].split(',').count(),
                _ => 1,
            };
            self.copy = Some(CopyIn { binary, ..CopyIn::default() });
            self.push(b'G', |b| {
                b.put_u8(binary as u8);
                b.put_u16(columns as u16);
                for _ in 0..columns {
                    b.put_u16(binary as u16);
                }
            });
            return;
        } else if sql.starts_with("START_REPLICATION") {
            self.start_streaming();
            return;
        } else {
            match Self::prepare(&sql, &[]).and_then(|s| Self::evaluate(&s, &[]).map(|row| (s, row))) {
                Ok((statement, row)) if !row.is_empty() => {
                    self.row_description(&Self::columns(&statement), false);
                    let row: Vec<_> = row.into_iter().map(|v| Self::encode(v, false)).collect();
                    self.data_row(&row);
                    self.complete("SELECT 1");
                },
                Ok(_) if sql.starts_with("INSERT") => self.complete("INSERT 0 1"),
                Ok(_) => self.push(b'I', |_| { }),
                Err(failure) => self.error(failure),
            }
        }
        self.ready();
    }

    fn type_rows(&mut self, sql: &str) {
        let names: Vec<&str> = sql.split('\'').skip(1).step_by(2).collect();
        self.row_description(&[("typname", oid::NAME), ("oid", oid::OID), ("typarray", oid::OID)], false);
        let mut found = 0;
        for (name, type_oid, array) in [("hstore", 16385, 16390), ("citext", 16400, 16405)] {
            if names.contains(&name) {
                found += 1;
                self.data_row(&[
                    Some(name.as_bytes().to_vec()),
                    Some(type_oid.to_string().into_bytes()),
                    Some(array.to_string().into_bytes()),
                ]);
            }
        }
        self.complete(&format!("SELECT {found}"));
    }

    fn copy_data(&mut self, body: Bytes) {
        if self.streaming {
            // standby status update
            return;
        }
        let Some(binary) = self.copy.as_ref().map(|copy| copy.binary) else {
            // dropped after a failed COPY
            return;
        };
        if !binary && body.windows(7).any(|w| w == b"invalid") {
            self.copy = None;
            self.error(("22P02", "invalid input syntax for type integer: \"invalid\"".into()));
            self.ready();
            return;
        }
        if let Some(copy) = self.copy.as_mut() {
            copy.data.put_slice(&body);
        }
    }

    fn copy_done(&mut self) {
        if self.streaming {
            self.streaming = false;
            self.push(b'c', |_| { });
            self.complete("START_REPLICATION");
            self.ready();
            return;
        }
        let Some(copy) = self.copy.take() else {
            return;
        };

        let rows = match copy.binary {
            false => copy.data.iter().filter(|b| **b == b'\n').count(),
            true => {
                let mut data = copy.data.freeze();
                data.advance(19);
                let mut rows = 0;
                loop {
                    let fields = data.get_i16();
                    if fields < 0 {
                        break;
                    }
                    for _ in 0..fields {
                        let len = data.get_i32();
                        if len > 0 {
                            data.advance(len as usize);
                        }
                    }
                    rows += 1;
                }
                rows
            },
        };
        self.complete(&format!("COPY {rows}"));
        self.ready();
    }

    /// CopyBothResponse, two records with a keepalive asking for a reply in between.
    fn start_streaming(&mut self) {
        self.streaming = true;
        self.push(b'W', |b| {
            b.put_u8(0);
            b.put_u16(0);
        });
        for (start, end, data) in [(0x1000u64, 0x1008u64, b"insert 1"), (0x1008, 0x1010, b"insert 2")] {
            self.push(b'd', |b| {
                b.put_u8(b'w');
                b.put_u64(start);
                b.put_u64(end);
                b.put_i64(0);
                b.put_slice(data);
            });
            if start == 0x1000 {
                self.push(b'd', |b| {
                    b.put_u8(b'k');
                    b.put_u64(end);
                    b.put_i64(0);
                    b.put_u8(1);
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn statement_model() {
        let statement = Backend::prepare("SELECT $1::int, 7, 10 / $2", &[0, oid::INT8]).unwrap();
        assert_eq!(statement.params, [oid::INT4, oid::INT8]);
        assert_eq!(Backend::evaluate(&statement, &[Some(3), Some(5)]).unwrap(), [Some(3), Some(7), Some(2)]);
        assert!(Backend::evaluate(&statement, &[Some(3), Some(0)]).is_err());
        assert!(Backend::prepare("SELEC syntax error", &[]).is_err());
    }
}
