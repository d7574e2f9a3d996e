//! Barrier backends for gang-scheduled stepping
//!
//! - `LocalBarrier`: participants are tokio tasks in one process
//! - `TcpBarrier`: one participant talking to a `gangsim-coordinator`
//!
//! Both release a step only once every expected participant has arrived,
//! and both turn a participant that vanishes mid-run into a
//! `BarrierDisconnect` for everybody still waiting.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use gangsim_core::protocol::{ClientMessage, ServerMessage, decode_line, encode_line};
use gangsim_core::{Barrier, GangError, Result};

/// Timeout for establishing the coordinator connection
const CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Default)]
struct PathState {
    members: HashSet<String>,
    /// Pending arrivals per step
    arrivals: BTreeMap<u64, HashSet<String>>,
    /// Highest released step; steps are released in order
    last_released: Option<u64>,
    /// (participant, reason) of the first abort
    aborted: Option<(String, String)>,
}

/// In-process barrier shared by `expected` participants
#[derive(Debug)]
pub struct LocalBarrier {
    expected: usize,
    paths: Mutex<HashMap<String, PathState>>,
    changed: Notify,
}

impl LocalBarrier {
    pub fn new(expected: usize) -> Arc<Self> {
        Arc::new(Self {
            expected: expected.max(1),
            paths: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        })
    }

    /// Handle for one participant
    pub fn participant(self: &Arc<Self>, id: impl Into<String>) -> LocalParticipant {
        LocalParticipant {
            barrier: Arc::clone(self),
            id: id.into(),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Number of participants that have joined `path`
    pub fn members(&self, path: &str) -> usize {
        self.lock().get(path).map(|s| s.members.len()).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PathState>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn arrive(&self, participant: &str, path: &str, step: u64) -> Result<()> {
        loop {
            // Register for wakeups before inspecting state so a release
            // between the check and the await is not missed
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut paths = self.lock();
                let state = paths.entry(path.to_string()).or_default();

                // A released step stays released even if the path aborts later
                if state.last_released.is_some_and(|released| released >= step) {
                    return Ok(());
                }
                if let Some((who, reason)) = &state.aborted {
                    return Err(GangError::barrier_disconnect(
                        path,
                        step,
                        format!("participant {who} aborted: {reason}"),
                    ));
                }

                state.members.insert(participant.to_string());
                let arrived = state.arrivals.entry(step).or_default();
                arrived.insert(participant.to_string());

                if arrived.len() >= self.expected {
                    state.arrivals.remove(&step);
                    state.last_released = Some(step);
                    drop(paths);

                    debug!(path, step, participants = self.expected, "Barrier released");
                    self.changed.notify_waiters();
                    return Ok(());
                }
            }

            notified.await;
        }
    }

    fn leave(&self, participant: &str, path: &str) {
        let mut paths = self.lock();
        if let Some(state) = paths.get_mut(path) {
            state.members.remove(participant);
            if state.members.is_empty() && state.aborted.is_none() {
                paths.remove(path);
            }
        }
    }

    fn abort(&self, participant: &str, path: &str, reason: &str) {
        {
            let mut paths = self.lock();
            let state = paths.entry(path.to_string()).or_default();
            if state.aborted.is_none() {
                state.aborted = Some((participant.to_string(), reason.to_string()));
            }
        }
        warn!(path, participant, reason, "Barrier aborted");
        self.changed.notify_waiters();
    }
}

/// One participant of a `LocalBarrier`
///
/// Dropping the handle while it still belongs to a path aborts that path,
/// which is how a crashed participant looks to the others.
#[derive(Debug)]
pub struct LocalParticipant {
    barrier: Arc<LocalBarrier>,
    id: String,
    /// Paths joined and not yet left
    active: Mutex<HashSet<String>>,
}

impl LocalParticipant {
    /// Drop out without leaving
    pub fn disconnect(self) {
        drop(self);
    }

    fn active(&self) -> MutexGuard<'_, HashSet<String>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Barrier for LocalParticipant {
    async fn arrive(&self, path: &str, step: u64) -> Result<()> {
        self.active().insert(path.to_string());
        self.barrier.arrive(&self.id, path, step).await
    }

    async fn leave(&self, path: &str) -> Result<()> {
        self.active().remove(path);
        self.barrier.leave(&self.id, path);
        Ok(())
    }

    async fn abort(&self, path: &str, reason: &str) -> Result<()> {
        self.active().remove(path);
        self.barrier.abort(&self.id, path, reason);
        Ok(())
    }

    fn participant(&self) -> &str {
        &self.id
    }
}

impl Drop for LocalParticipant {
    fn drop(&mut self) {
        let paths: Vec<String> = self.active().drain().collect();
        for path in paths {
            self.barrier.abort(&self.id, &path, "disconnected");
        }
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    joined: HashSet<String>,
}

impl Connection {
    async fn send(&mut self, message: &ClientMessage) -> std::io::Result<()> {
        let line = encode_line(message).map_err(std::io::Error::other)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await
    }

    /// Next server message; `None` once the coordinator hangs up
    async fn recv(&mut self) -> Result<Option<ServerMessage>> {
        match self.lines.next_line().await? {
            Some(line) => Ok(Some(decode_line(&line)?)),
            None => Ok(None),
        }
    }
}

/// Barrier client for a remote `gangsim-coordinator`
///
/// Connects lazily on the first `arrive` and joins each path once. Any
/// transport failure drops the connection, which the coordinator reports to
/// the other members as an abort.
pub struct TcpBarrier {
    endpoint: String,
    participant: String,
    expected: usize,
    conn: tokio::sync::Mutex<Option<Connection>>,
}

impl TcpBarrier {
    pub fn new(endpoint: impl Into<String>, participant: impl Into<String>, expected: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            participant: participant.into(),
            expected,
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self, path: &str, step: u64) -> Result<Connection> {
        let connect = TcpStream::connect(&self.endpoint);
        let stream = match tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(GangError::barrier_disconnect(
                    path,
                    step,
                    format!("cannot reach coordinator {}: {e}", self.endpoint),
                ));
            }
            Err(_) => {
                return Err(GangError::barrier_disconnect(
                    path,
                    step,
                    format!("timed out connecting to coordinator {}", self.endpoint),
                ));
            }
        };
        stream.set_nodelay(true)?;

        info!(
            endpoint = %self.endpoint,
            participant = %self.participant,
            "Connected to barrier coordinator"
        );

        let (read, writer) = stream.into_split();
        Ok(Connection {
            lines: BufReader::new(read).lines(),
            writer,
            joined: HashSet::new(),
        })
    }

    async fn join(&self, conn: &mut Connection, path: &str, step: u64) -> Result<()> {
        let join = ClientMessage::Join {
            path: path.to_string(),
            participant: self.participant.clone(),
            expected: self.expected,
        };
        conn.send(&join)
            .await
            .map_err(|e| GangError::barrier_disconnect(path, step, e.to_string()))?;

        loop {
            match conn.recv().await {
                Ok(Some(ServerMessage::Joined { path: p, members })) if p == path => {
                    debug!(path, members, "Joined barrier");
                    conn.joined.insert(path.to_string());
                    return Ok(());
                }
                Ok(Some(message)) => self.unexpected(path, step, message)?,
                Ok(None) => {
                    return Err(GangError::barrier_disconnect(path, step, "coordinator closed the connection"));
                }
                Err(e) => return Err(GangError::barrier_disconnect(path, step, e.to_string())),
            }
        }
    }

    async fn wait_released(&self, conn: &mut Connection, path: &str, step: u64) -> Result<()> {
        let arrive = ClientMessage::Arrive {
            path: path.to_string(),
            step,
        };
        conn.send(&arrive)
            .await
            .map_err(|e| GangError::barrier_disconnect(path, step, e.to_string()))?;

        loop {
            match conn.recv().await {
                Ok(Some(ServerMessage::Released { path: p, step: s })) if p == path && s == step => {
                    return Ok(());
                }
                Ok(Some(message)) => self.unexpected(path, step, message)?,
                Ok(None) => {
                    return Err(GangError::barrier_disconnect(path, step, "coordinator closed the connection"));
                }
                Err(e) => return Err(GangError::barrier_disconnect(path, step, e.to_string())),
            }
        }
    }

    /// Aborts and errors are fatal; stale releases for other paths are skipped
    fn unexpected(&self, path: &str, step: u64, message: ServerMessage) -> Result<()> {
        match message {
            ServerMessage::Aborted {
                path: p,
                participant,
                reason,
            } if p == path => Err(GangError::barrier_disconnect(
                path,
                step,
                format!("participant {participant} aborted: {reason}"),
            )),
            ServerMessage::Error { message } => Err(GangError::barrier_disconnect(
                path,
                step,
                format!("coordinator rejected request: {message}"),
            )),
            other => {
                debug!(?other, "Ignoring unrelated coordinator message");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Barrier for TcpBarrier {
    async fn arrive(&self, path: &str, step: u64) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect(path, step).await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(GangError::barrier_disconnect(path, step, "no coordinator connection"));
        };

        let result = async {
            if !conn.joined.contains(path) {
                self.join(conn, path, step).await?;
            }
            self.wait_released(conn, path, step).await
        }
        .await;

        if result.is_err() {
            // Never reuse a connection in an unknown state
            *guard = None;
        }
        result
    }

    async fn leave(&self, path: &str) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_mut() {
            if conn.joined.remove(path) {
                conn.send(&ClientMessage::Leave {
                    path: path.to_string(),
                })
                .await?;
                debug!(path, participant = %self.participant, "Left barrier");
            }
            if conn.joined.is_empty() {
                *guard = None;
            }
        }
        Ok(())
    }

    /// Connects first if this participant failed before its first arrival
    async fn abort(&self, path: &str, reason: &str) -> Result<()> {
        let mut guard = self.conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.connect(path, 0).await?,
        };

        let abort = ClientMessage::Abort {
            path: path.to_string(),
            participant: self.participant.clone(),
            reason: reason.to_string(),
        };
        // The connection is dropped either way
        let sent = conn.send(&abort).await;
        if sent.is_ok() {
            let _ = conn.writer.shutdown().await;
        }
        sent.map_err(|e| GangError::barrier_disconnect(path, 0, format!("failed to send abort: {e}")))?;

        debug!(path, participant = %self.participant, "Sent barrier abort");
        Ok(())
    }

    fn participant(&self) -> &str {
        &self.participant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangsim_coordinator::CoordinatorServer;
    use tokio_test::{assert_pending, assert_ready, task};

    const PATH: &str = "/gangsim/test";

    #[test]
    fn test_local_barrier_blocks_until_all_arrive() {
        let barrier = LocalBarrier::new(3);
        let a = barrier.participant("a");
        let b = barrier.participant("b");
        let c = barrier.participant("c");

        let mut wait_a = task::spawn(a.arrive(PATH, 0));
        let mut wait_b = task::spawn(b.arrive(PATH, 0));
        assert_pending!(wait_a.poll());
        assert_pending!(wait_b.poll());

        let mut wait_c = task::spawn(c.arrive(PATH, 0));
        assert_ready!(wait_c.poll()).unwrap();

        assert!(wait_a.is_woken());
        assert!(wait_b.is_woken());
        assert_ready!(wait_a.poll()).unwrap();
        assert_ready!(wait_b.poll()).unwrap();
        assert_eq!(barrier.members(PATH), 3);
    }

    #[test]
    fn test_local_barrier_steps_are_independent() {
        let barrier = LocalBarrier::new(2);
        let a = barrier.participant("a");
        let b = barrier.participant("b");

        assert_pending!(task::spawn(a.arrive(PATH, 0)).poll());
        assert_ready!(task::spawn(b.arrive(PATH, 0)).poll()).unwrap();

        // Step 1 needs both again
        let mut next = task::spawn(b.arrive(PATH, 1));
        assert_pending!(next.poll());
        assert_ready!(task::spawn(a.arrive(PATH, 1)).poll()).unwrap();
        assert_ready!(next.poll()).unwrap();
    }

    #[test]
    fn test_dropped_participant_aborts_waiters() {
        let barrier = LocalBarrier::new(3);
        let a = barrier.participant("a");
        let b = barrier.participant("b");
        let c = barrier.participant("c");

        // c takes part in step 0 and then vanishes
        assert_pending!(task::spawn(c.arrive(PATH, 0)).poll());
        assert_pending!(task::spawn(a.arrive(PATH, 0)).poll());
        assert_ready!(task::spawn(b.arrive(PATH, 0)).poll()).unwrap();

        let mut wait_a = task::spawn(a.arrive(PATH, 1));
        assert_pending!(wait_a.poll());

        c.disconnect();

        assert!(wait_a.is_woken());
        match assert_ready!(wait_a.poll()) {
            Err(GangError::BarrierDisconnect { path, step, reason }) => {
                assert_eq!(path, PATH);
                assert_eq!(step, 1);
                assert!(reason.contains('c'));
            }
            other => panic!("expected BarrierDisconnect, got {other:?}"),
        }

        // Later arrivals fail immediately
        assert!(matches!(
            assert_ready!(task::spawn(b.arrive(PATH, 1)).poll()),
            Err(GangError::BarrierDisconnect { .. })
        ));
    }

    #[test]
    fn test_released_step_survives_later_abort() {
        let barrier = LocalBarrier::new(2);
        let a = barrier.participant("a");
        let b = barrier.participant("b");

        let mut wait_a = task::spawn(a.arrive(PATH, 0));
        assert_pending!(wait_a.poll());
        assert_ready!(task::spawn(b.arrive(PATH, 0)).poll()).unwrap();

        // b fails at step 1 before a gets to observe the release of step 0
        assert_ready!(task::spawn(b.abort(PATH, "boom")).poll()).unwrap();

        assert_ready!(wait_a.poll()).unwrap();
        match assert_ready!(task::spawn(a.arrive(PATH, 1)).poll()) {
            Err(GangError::BarrierDisconnect { step, reason, .. }) => {
                assert_eq!(step, 1);
                assert!(reason.contains("boom"));
            }
            other => panic!("expected BarrierDisconnect, got {other:?}"),
        }
    }

    #[test]
    fn test_leave_does_not_abort() {
        let barrier = LocalBarrier::new(1);
        let a = barrier.participant("a");

        assert_ready!(task::spawn(a.arrive(PATH, 0)).poll()).unwrap();
        assert_ready!(task::spawn(a.leave(PATH)).poll()).unwrap();
        drop(a);

        let b = barrier.participant("b");
        assert_ready!(task::spawn(b.arrive(PATH, 1)).poll()).unwrap();
    }

    #[tokio::test]
    async fn test_tcp_barrier_releases_through_coordinator() {
        let server = CoordinatorServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let _handle = server.spawn();

        let a = TcpBarrier::new(addr.clone(), "a", 2);
        let b = TcpBarrier::new(addr, "b", 2);

        for step in 0..3 {
            let (ra, rb) = tokio::join!(a.arrive(PATH, step), b.arrive(PATH, step));
            ra.unwrap();
            rb.unwrap();
        }

        a.leave(PATH).await.unwrap();
        b.leave(PATH).await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_barrier_abort_reaches_peer() {
        let server = CoordinatorServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let _handle = server.spawn();

        let a = Arc::new(TcpBarrier::new(addr.clone(), "a", 2));
        let b = TcpBarrier::new(addr, "b", 2);

        let (ra, rb) = tokio::join!(a.arrive(PATH, 0), b.arrive(PATH, 0));
        ra.unwrap();
        rb.unwrap();

        let waiter = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.arrive(PATH, 1).await })
        };
        b.abort(PATH, "policy failure").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(GangError::BarrierDisconnect { step: 1, .. })));
    }

    #[tokio::test]
    async fn test_tcp_abort_before_first_arrival_releases_waiter() {
        let server = CoordinatorServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let _handle = server.spawn();

        let a = Arc::new(TcpBarrier::new(addr.clone(), "a", 2));
        let b = TcpBarrier::new(addr, "b", 2);

        let waiter = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.arrive(PATH, 0).await })
        };
        tokio::task::yield_now().await;

        // b never connected: its policy failed at step 0
        b.abort(PATH, "policy failure at step 0").await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(GangError::BarrierDisconnect { step: 0, .. })));
    }

    #[tokio::test]
    async fn test_tcp_late_joiner_after_abort_is_refused() {
        let server = CoordinatorServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let _handle = server.spawn();

        let a = TcpBarrier::new(addr.clone(), "a", 2);
        a.abort(PATH, "crashed").await.unwrap();

        let b = TcpBarrier::new(addr, "b", 2);
        let result = tokio::time::timeout(Duration::from_secs(5), b.arrive(PATH, 0))
            .await
            .unwrap();
        match result {
            Err(GangError::BarrierDisconnect { step, reason, .. }) => {
                assert_eq!(step, 0);
                assert!(reason.contains("crashed"));
            }
            other => panic!("expected BarrierDisconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tcp_barrier_unreachable_is_disconnect() {
        // Grab a free port, then close it
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let barrier = TcpBarrier::new(addr, "a", 1);
        assert!(matches!(
            barrier.arrive(PATH, 0).await,
            Err(GangError::BarrierDisconnect { step: 0, .. })
        ));
    }
}
