//! Logical replication receiver.
//!
//! After `START_REPLICATION` the connection streams `XLogData` inside `CopyData` until
//! either side sends `CopyDone`. Each record is handed to a [`ReplicationHandler`], which
//! reports how far it has flushed and applied. The reported positions never move backward
//! and never pass the last received position.
//!
//! <https://www.postgresql.org/docs/current/protocol-replication.html>
use bytes::Bytes;
use std::{
    fmt,
    str::FromStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    Client, Result,
    command::{Command, call},
    common::{ByteStr, logging, unit_error, verbose},
    error::StateError,
    postgres::{BackendMessage, ReplicationMessage, frontend},
    session::Session,
    transport::PgTransport,
};

/// Seconds from unix epoch to 2000-01-01, the postgres epoch.
const PG_EPOCH: Duration = Duration::from_secs(946_684_800);

/// Write-ahead log position.
///
/// Displayed and parsed as two hexadecimal halves, `16/B374D848`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Let the server choose the start position.
    pub const ZERO: Lsn = Lsn(0);

    fn add(self, len: usize) -> Lsn {
        Lsn(self.0.saturating_add(len as u64))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

impl fmt::Debug for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn({self})")
    }
}

unit_error! {
    /// Lsn is not in `X/Y` hexadecimal form.
    pub struct ParseLsnError("invalid lsn");
}

impl FromStr for Lsn {
    type Err = ParseLsnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s.split_once('/').ok_or(ParseLsnError)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| ParseLsnError)?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| ParseLsnError)?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Lsn {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Lsn {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let lsn = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        lsn.parse().map_err(serde::de::Error::custom)
    }
}

/// Positions acknowledged to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationState {
    pub received: Lsn,
    pub flushed: Lsn,
    pub applied: Lsn,
}

impl ReplicationState {
    fn receive(&mut self, lsn: Lsn) {
        self.received = self.received.max(lsn);
    }

    fn advance(&mut self, flushed: Lsn, applied: Lsn) {
        self.flushed = self.flushed.max(flushed.min(self.received));
        self.applied = self.applied.max(applied.min(self.received));
    }

    fn align(&mut self) {
        self.advance(self.received, self.received);
    }
}

/// Consumer of `XLogData`.
///
/// `State` is threaded through calls, starting from the value given to
/// [`Client::start_replication`].
pub trait ReplicationHandler: Send + 'static {
    type State: Send + 'static;

    /// Handle one WAL record starting at `start`, `end` is the server WAL end.
    ///
    /// Returns the flushed and applied positions, [`Lsn::ZERO`] reports no progress.
    fn handle_x_log_data(&mut self, start: Lsn, end: Lsn, data: Bytes, state: Self::State) -> (Lsn, Lsn, Self::State);
}

/// WAL record forwarded by [`ChannelHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    pub start: Lsn,
    pub end: Lsn,
    pub data: Bytes,
}

/// Handler that forwards every record to a channel and reports no progress.
///
/// The receiver acknowledges with [`Client::standby_status_update`].
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    sender: UnboundedSender<XLogData>,
}

impl ChannelHandler {
    pub fn new(sender: UnboundedSender<XLogData>) -> ChannelHandler {
        ChannelHandler { sender }
    }
}

impl ReplicationHandler for ChannelHandler {
    type State = ();

    fn handle_x_log_data(&mut self, start: Lsn, end: Lsn, data: Bytes, _: ()) -> (Lsn, Lsn, ()) {
        if self.sender.send(XLogData { start, end, data }).is_err() {
            logging!(debug, "replication receiver closed, dropped record at {start}");
        }
        (Lsn::ZERO, Lsn::ZERO, ())
    }
}

/// Handler with its state, as owned by the session.
pub(crate) trait ErasedHandler: Send {
    fn handle(&mut self, start: Lsn, end: Lsn, data: Bytes) -> (Lsn, Lsn);
}

struct Erased<H: ReplicationHandler> {
    handler: H,
    state: Option<H::State>,
}

impl<H: ReplicationHandler> ErasedHandler for Erased<H> {
    fn handle(&mut self, start: Lsn, end: Lsn, data: Bytes) -> (Lsn, Lsn) {
        let Some(state) = self.state.take() else {
            return (Lsn::ZERO, Lsn::ZERO);
        };
        let (flushed, applied, state) = self.handler.handle_x_log_data(start, end, data, state);
        self.state = Some(state);
        (flushed, applied)
    }
}

/// Streaming options.
#[derive(Debug, Clone, Default)]
pub struct ReplicationOptions {
    /// When the server asks for a reply, acknowledge everything received so far.
    pub align_lsn: bool,
}

impl ReplicationOptions {
    pub fn new() -> ReplicationOptions {
        ReplicationOptions::default()
    }

    pub fn align_lsn(mut self, align_lsn: bool) -> Self {
        self.align_lsn = align_lsn;
        self
    }
}

pub(crate) struct Streaming {
    handler: Box<dyn ErasedHandler>,
    state: ReplicationState,
    align_lsn: bool,
}

/// Microseconds since 2000-01-01.
fn pg_clock() -> i64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    now.saturating_sub(PG_EPOCH).as_micros() as i64
}

impl<IO: PgTransport> Session<IO> {
    pub(crate) async fn start_replication(
        &mut self,
        slot: &str,
        handler: Box<dyn ErasedHandler>,
        start: Lsn,
        plugin_opts: Option<&str>,
        opts: ReplicationOptions,
    ) -> Result<()> {
        if !self.replication_mode {
            return Err(StateError { reason: "connection is not in replication mode" }.into());
        }

        let sql = match plugin_opts.filter(|opts| !opts.is_empty()) {
            Some(plugin_opts) => format!("START_REPLICATION SLOT {slot} LOGICAL {start} ({plugin_opts})"),
            None => format!("START_REPLICATION SLOT {slot} LOGICAL {start}"),
        };
        self.io.send(frontend::Query { sql: &sql });
        self.flush().await?;

        loop {
            match self.recv().await {
                Ok(BackendMessage::CopyBothResponse(_)) => break,
                Ok(BackendMessage::ReadyForQuery(_)) => {
                    return Err(StateError { reason: "server did not start streaming" }.into());
                },
                Ok(_) => { },
                Err(err) => return Err(self.ready_after(err).await),
            }
        }

        logging!(info, "replication started on slot {slot} at {start}");
        self.streaming = Some(Streaming {
            handler,
            state: ReplicationState { received: start, flushed: start, applied: start },
            align_lsn: opts.align_lsn,
        });
        Ok(())
    }

    /// `CopyData` received while streaming.
    pub(crate) async fn replication_data(&mut self, data: Bytes) -> Result<()> {
        match ReplicationMessage::parse(data)? {
            ReplicationMessage::XLogData { start, end, data, .. } => {
                self.x_log_data(Lsn(start), Lsn(end), data);
            },
            ReplicationMessage::PrimaryKeepAlive { wal_end: _wal_end, reply, .. } => {
                verbose!("keepalive, server wal end {}", Lsn(_wal_end));
                if !reply {
                    return Ok(());
                }
                if let Some(streaming) = self.streaming.as_mut().filter(|s| s.align_lsn) {
                    streaming.state.align();
                }
                self.send_status()?;
                self.flush().await?;
            },
        }
        Ok(())
    }

    fn x_log_data(&mut self, start: Lsn, end: Lsn, data: Bytes) {
        let Some(streaming) = self.streaming.as_mut() else {
            return;
        };
        streaming.state.receive(end.max(start.add(data.len())));
        let (flushed, applied) = streaming.handler.handle(start, end, data);
        streaming.state.advance(flushed, applied);
    }

    fn send_status(&mut self) -> Result<()> {
        let state = self.replication_state()?;
        verbose!("standby status {state:?}");
        self.io.send(frontend::StandbyStatusUpdate {
            write: state.received.0,
            flush: state.flushed.0,
            apply: state.applied.0,
            clock: pg_clock(),
            reply: 0,
        });
        Ok(())
    }

    pub(crate) async fn standby_status_update(&mut self, flushed: Lsn, applied: Lsn) -> Result<()> {
        let Some(streaming) = self.streaming.as_mut() else {
            return Err(StateError { reason: "not streaming replication" }.into());
        };
        streaming.state.advance(flushed, applied);
        self.send_status()?;
        self.flush().await
    }

    pub(crate) fn replication_state(&self) -> Result<ReplicationState> {
        match &self.streaming {
            Some(streaming) => Ok(streaming.state),
            None => Err(StateError { reason: "not streaming replication" }.into()),
        }
    }

    /// The server ended the stream.
    pub(crate) async fn replication_done(&mut self) -> Result<()> {
        logging!(info, "replication stream ended by server");
        self.streaming = None;
        self.io.send(frontend::CopyDone);
        self.flush().await?;
        self.wait_ready().await
    }

    /// End the stream, handing remaining records to the handler.
    pub(crate) async fn stop_replication(&mut self) -> Result<()> {
        if self.streaming.is_none() {
            return Err(StateError { reason: "not streaming replication" }.into());
        }
        self.io.send(frontend::CopyDone);
        self.flush().await?;

        let result = loop {
            match self.recv().await {
                Ok(BackendMessage::CopyData(data)) => {
                    if let ReplicationMessage::XLogData { start, end, data, .. } = ReplicationMessage::parse(data.data)? {
                        self.x_log_data(Lsn(start), Lsn(end), data);
                    }
                },
                Ok(BackendMessage::ReadyForQuery(_)) => break Ok(()),
                Ok(_) => { },
                Err(err) => break Err(self.ready_after(err).await),
            }
        };
        self.streaming = None;
        result
    }
}

impl Client {
    /// Start logical replication from `slot`.
    ///
    /// The connection must be configured with [`Config::replication`][crate::Config::replication].
    /// Records are handed to `handler` by the connection worker, starting with `state`.
    /// [`Lsn::ZERO`] as `wal_start` lets the server choose, `plugin_opts` are passed verbatim
    /// to the output plugin.
    ///
    /// While streaming, only [`Client::standby_status_update`], [`Client::replication_state`]
    /// and [`Client::stop_replication`] are accepted.
    pub async fn start_replication<H: ReplicationHandler>(
        &self,
        slot: &str,
        handler: H,
        state: H::State,
        wal_start: Lsn,
        plugin_opts: Option<&str>,
        opts: ReplicationOptions,
    ) -> Result<()> {
        let command = Command::StartReplication {
            slot: ByteStr::copy_from_str(slot),
            handler: Box::new(Erased { handler, state: Some(state) }),
            start: wal_start,
            plugin_opts: plugin_opts.map(ByteStr::copy_from_str),
            opts,
        };
        call!(self, command => Unit)
    }

    /// Start logical replication, forwarding records to the returned channel.
    pub async fn start_replication_channel(
        &self,
        slot: &str,
        wal_start: Lsn,
        plugin_opts: Option<&str>,
        opts: ReplicationOptions,
    ) -> Result<UnboundedReceiver<XLogData>> {
        let (send, recv) = mpsc::unbounded_channel();
        self.start_replication(slot, ChannelHandler::new(send), (), wal_start, plugin_opts, opts)
            .await?;
        Ok(recv)
    }

    /// Report flushed and applied positions.
    ///
    /// Positions behind the last report are ignored.
    pub async fn standby_status_update(&self, flushed: Lsn, applied: Lsn) -> Result<()> {
        call!(self, Command::StandbyStatusUpdate { flushed, applied } => Unit)
    }

    pub async fn replication_state(&self) -> Result<ReplicationState> {
        call!(self, Command::ReplicationState => Replication)
    }

    pub async fn stop_replication(&self) -> Result<()> {
        call!(self, Command::StopReplication => Unit)
    }
}

#[cfg(test)]
mod test {
    use bytes::Buf;

    use super::*;
    use crate::{Config, ErrorKind, testing};

    #[cfg(feature = "json")]
    #[test]
    fn lsn_as_json_string() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(serde_json::to_string(&lsn).unwrap(), "\"16/B374D848\"");
        assert_eq!(serde_json::from_str::<Lsn>("\"16/B374D848\"").unwrap(), lsn);
        assert!(serde_json::from_str::<Lsn>("\"16\"").is_err());
    }

    struct Recorder(UnboundedSender<Lsn>);

    impl ReplicationHandler for Recorder {
        type State = usize;

        fn handle_x_log_data(&mut self, start: Lsn, _: Lsn, _: Bytes, seen: usize) -> (Lsn, Lsn, usize) {
            self.0.send(start).unwrap();
            (start, start, seen + 1)
        }
    }

    /// Flush positions of every standby status update sent.
    fn reported(server: &testing::Server) -> Vec<(u64, u64, u64)> {
        server
            .frames()
            .into_iter()
            .filter(|f| f.0 == b'd' && f.1.first() == Some(&b'r'))
            .map(|f| {
                let mut body = f.1.slice(1..);
                (body.get_u64(), body.get_u64(), body.get_u64())
            })
            .collect()
    }

    #[test]
    fn lsn_text_form() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn, Lsn(0x16_B374_D848));
        assert_eq!(lsn.to_string(), "16/B374D848");
        assert_eq!(Lsn::ZERO.to_string(), "0/0");
        assert!("16B374D848".parse::<Lsn>().is_err());
    }

    #[test]
    fn state_never_regresses() {
        let mut state = ReplicationState::default();
        state.receive(Lsn(100));
        state.advance(Lsn(200), Lsn(50));
        assert_eq!(state.flushed, Lsn(100));
        assert_eq!(state.applied, Lsn(50));

        state.advance(Lsn(10), Lsn(10));
        assert_eq!((state.flushed, state.applied), (Lsn(100), Lsn(50)));

        state.align();
        assert_eq!(state.applied, Lsn(100));
    }

    #[tokio::test]
    async fn requires_replication_mode() {
        let (client, server) = testing::client().await;
        let sent = server.frames().len();
        let (send, _recv) = mpsc::unbounded_channel();

        let err = client
            .start_replication("slot", ChannelHandler::new(send), (), Lsn::ZERO, None, ReplicationOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::State(_)));
        assert_eq!(server.frames().len(), sent);
    }

    #[tokio::test]
    async fn acknowledgements_are_monotonic() {
        let (client, server) = testing::client_with(Config::new().replication(true)).await;
        let (send, mut recv) = mpsc::unbounded_channel();

        client
            .start_replication("slot", Recorder(send), 0, Lsn::ZERO, Some("proto_version '1'"), ReplicationOptions::new().align_lsn(true))
            .await
            .unwrap();
        assert!(server.queries().iter().any(|q| q == "START_REPLICATION SLOT slot LOGICAL 0/0 (proto_version '1')"));

        assert_eq!(recv.recv().await, Some(Lsn(0x1000)));
        assert_eq!(recv.recv().await, Some(Lsn(0x1008)));

        // anything but replication commands is rejected
        let err = client.simple_query("SELECT 1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::State(_)));

        client.standby_status_update(Lsn(0x50), Lsn(0x50)).await.unwrap();
        let state = client.replication_state().await.unwrap();
        assert_eq!(state.received, Lsn(0x1010));
        assert_eq!(state.flushed, Lsn(0x1008));

        let reported = reported(&server);
        assert_eq!(reported.len(), 2);
        assert_eq!(reported[0], (0x1008, 0x1008, 0x1008));
        for pair in reported.windows(2) {
            assert!(pair[0].1 <= pair[1].1 && pair[0].2 <= pair[1].2);
        }

        client.stop_replication().await.unwrap();
        assert!(matches!(client.replication_state().await.unwrap_err().kind(), ErrorKind::State(_)));
    }

    #[tokio::test]
    async fn keepalive_without_align() {
        let (client, server) = testing::client_with(Config::new().replication(true)).await;
        let mut recv = client
            .start_replication_channel("slot", Lsn::ZERO, None, ReplicationOptions::new())
            .await
            .unwrap();

        let first = recv.recv().await.unwrap();
        assert_eq!(first.start, Lsn(0x1000));
        recv.recv().await.unwrap();

        // channel handler reports nothing, the reply carries the start position
        let state = client.replication_state().await.unwrap();
        assert_eq!(state.flushed, Lsn::ZERO);
        assert_eq!(reported(&server), [(0x1008, 0, 0)]);

        client.standby_status_update(first.end, first.end).await.unwrap();
        assert_eq!(reported(&server)[1], (0x1010, 0x1008, 0x1008));
    }
}
