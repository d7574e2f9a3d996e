//! Gangsim barrier coordinator
//!
//! Serves named barriers to simulation participants over TCP, one JSON
//! message per line (see `gangsim_core::protocol`).
//!
//! For every path the coordinator tracks:
//! - membership (participants that joined and have not left)
//! - arrivals per step, released once `expected` participants arrived
//! - whether the path was aborted, after which it refuses further steps
//!
//! A member that disconnects without `leave` aborts every path it belongs to.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gangsim_core::protocol::{ClientMessage, ServerMessage, decode_line, encode_line};
use gangsim_core::Result;

/// Connection identifier assigned by the server
pub type ConnId = u64;

/// Messages to deliver, addressed by connection
pub type Outbox = Vec<(ConnId, ServerMessage)>;

#[derive(Debug)]
struct Group {
    expected: usize,
    /// participant -> connection
    members: HashMap<String, ConnId>,
    arrivals: BTreeMap<u64, HashSet<String>>,
    aborted: Option<(String, String)>,
}

impl Group {
    fn aborted_message(&self, path: &str) -> Option<ServerMessage> {
        self.aborted.as_ref().map(|(participant, reason)| ServerMessage::Aborted {
            path: path.to_string(),
            participant: participant.clone(),
            reason: reason.clone(),
        })
    }
}

/// Barrier bookkeeping, independent of the transport
#[derive(Debug, Default)]
pub struct Registry {
    groups: HashMap<String, Group>,
    /// connection -> (path -> participant)
    memberships: HashMap<ConnId, HashMap<String, String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one client message and return the resulting deliveries
    pub fn handle(&mut self, conn: ConnId, message: ClientMessage) -> Outbox {
        match message {
            ClientMessage::Join {
                path,
                participant,
                expected,
            } => self.join(conn, path, participant, expected),
            ClientMessage::Arrive { path, step } => self.arrive(conn, path, step),
            ClientMessage::Leave { path } => self.leave(conn, path),
            ClientMessage::Abort {
                path,
                participant,
                reason,
            } => self.abort(conn, &path, Some(participant), reason),
        }
    }

    /// A connection went away; abort every path it had not left
    pub fn disconnect(&mut self, conn: ConnId) -> Outbox {
        let paths: Vec<String> = self
            .memberships
            .get(&conn)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();

        let mut outbox = Vec::new();
        for path in paths {
            outbox.extend(self.abort(conn, &path, None, "disconnected".to_string()));
        }
        self.memberships.remove(&conn);
        outbox
    }

    /// Number of members currently joined to `path`
    pub fn members(&self, path: &str) -> usize {
        self.groups.get(path).map(|g| g.members.len()).unwrap_or(0)
    }

    pub fn is_aborted(&self, path: &str) -> bool {
        self.groups.get(path).is_some_and(|g| g.aborted.is_some())
    }

    fn join(&mut self, conn: ConnId, path: String, participant: String, expected: usize) -> Outbox {
        if expected == 0 {
            return error(conn, "expected participant count must be at least 1");
        }

        let group = self.groups.entry(path.clone()).or_insert_with(|| Group {
            expected,
            members: HashMap::new(),
            arrivals: BTreeMap::new(),
            aborted: None,
        });

        if let Some(aborted) = group.aborted_message(&path) {
            return vec![(conn, aborted)];
        }
        if group.expected != expected {
            return error(
                conn,
                format!(
                    "path {path} expects {} participants, join requested {expected}",
                    group.expected
                ),
            );
        }
        match group.members.get(&participant) {
            Some(owner) if *owner != conn => {
                return error(conn, format!("participant {participant} already joined {path}"));
            }
            Some(_) => {}
            None if group.members.len() >= group.expected => {
                return error(conn, format!("path {path} is full"));
            }
            None => {
                group.members.insert(participant.clone(), conn);
            }
        }

        let members = group.members.len();
        self.memberships
            .entry(conn)
            .or_default()
            .insert(path.clone(), participant.clone());

        info!(%path, %participant, members, expected, "Participant joined");
        vec![(conn, ServerMessage::Joined { path, members })]
    }

    fn arrive(&mut self, conn: ConnId, path: String, step: u64) -> Outbox {
        let Some(participant) = self.participant_of(conn, &path) else {
            return error(conn, format!("arrive on {path} without join"));
        };
        let Some(group) = self.groups.get_mut(&path) else {
            return error(conn, format!("unknown path {path}"));
        };
        if let Some(aborted) = group.aborted_message(&path) {
            return vec![(conn, aborted)];
        }

        let arrived = group.arrivals.entry(step).or_default();
        arrived.insert(participant);
        debug!(%path, step, arrived = arrived.len(), expected = group.expected, "Arrival");

        if arrived.len() < group.expected {
            return Vec::new();
        }

        group.arrivals.remove(&step);
        debug!(%path, step, "Releasing barrier");
        group
            .members
            .values()
            .map(|member| {
                (
                    *member,
                    ServerMessage::Released {
                        path: path.clone(),
                        step,
                    },
                )
            })
            .collect()
    }

    fn leave(&mut self, conn: ConnId, path: String) -> Outbox {
        let Some(participant) = self
            .memberships
            .get_mut(&conn)
            .and_then(|m| m.remove(&path))
        else {
            return Vec::new();
        };

        if let Some(group) = self.groups.get_mut(&path) {
            group.members.remove(&participant);
            // Aborted paths stay as tombstones for late joiners
            if group.members.is_empty() && group.aborted.is_none() {
                self.groups.remove(&path);
            }
        }

        info!(%path, %participant, "Participant left");
        Vec::new()
    }

    /// Abort `path` on behalf of `conn`
    ///
    /// A member aborts under the name it joined with. A connection that never
    /// joined `path` aborts as `claimed`, which covers a participant failing
    /// before its first arrival.
    fn abort(&mut self, conn: ConnId, path: &str, claimed: Option<String>, reason: String) -> Outbox {
        let member = self.memberships.get_mut(&conn).and_then(|m| m.remove(path));
        let Some(participant) = member.or(claimed) else {
            return Vec::new();
        };

        let group = self.groups.entry(path.to_string()).or_insert_with(|| Group {
            expected: 0,
            members: HashMap::new(),
            arrivals: BTreeMap::new(),
            aborted: None,
        });

        if group.members.get(&participant) == Some(&conn) {
            group.members.remove(&participant);
        }
        group.arrivals.clear();
        if group.aborted.is_none() {
            warn!(path, %participant, %reason, "Barrier aborted");
            group.aborted = Some((participant, reason));
        }

        match group.aborted_message(path) {
            Some(aborted) => group
                .members
                .values()
                .map(|member| (*member, aborted.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    fn participant_of(&self, conn: ConnId, path: &str) -> Option<String> {
        self.memberships.get(&conn)?.get(path).cloned()
    }
}

fn error(conn: ConnId, message: impl Into<String>) -> Outbox {
    vec![(
        conn,
        ServerMessage::Error {
            message: message.into(),
        },
    )]
}

#[derive(Default)]
struct Shared {
    registry: Registry,
    senders: HashMap<ConnId, mpsc::UnboundedSender<ServerMessage>>,
    next_conn: ConnId,
}

impl Shared {
    fn deliver(&self, outbox: Outbox) {
        for (conn, message) in outbox {
            if let Some(sender) = self.senders.get(&conn) {
                // A closed receiver means the connection is already going away
                let _ = sender.send(message);
            }
        }
    }
}

/// TCP barrier coordinator
pub struct CoordinatorServer {
    listener: TcpListener,
    shared: Arc<Mutex<Shared>>,
}

impl CoordinatorServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            shared: Arc::new(Mutex::new(Shared::default())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.listener.local_addr()?, "Barrier coordinator listening");

        loop {
            let (stream, peer) = self.listener.accept().await?;
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(shared, stream, peer).await {
                    warn!(%peer, error = %e, "Connection ended with error");
                }
            });
        }
    }

    /// Run on a background task
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn serve_connection(shared: Arc<Mutex<Shared>>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    stream.set_nodelay(true)?;
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let conn = {
        let mut guard = lock(&shared);
        let conn = guard.next_conn;
        guard.next_conn += 1;
        guard.senders.insert(conn, tx);
        conn
    };
    debug!(%peer, conn, "Connection accepted");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let line = encode_line(&message)?;
            write.write_all(line.as_bytes()).await?;
        }
        Ok::<_, gangsim_core::GangError>(())
    });

    let mut lines = BufReader::new(read).lines();
    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }

        let mut guard = lock(&shared);
        let outbox = match decode_line::<ClientMessage>(&line) {
            Ok(message) => guard.registry.handle(conn, message),
            Err(e) => error(conn, format!("malformed message: {e}")),
        };
        guard.deliver(outbox);
    };

    {
        let mut guard = lock(&shared);
        let outbox = guard.registry.disconnect(conn);
        guard.deliver(outbox);
        guard.senders.remove(&conn);
    }
    debug!(%peer, conn, "Connection closed");

    // Sender dropped above, so the writer drains and exits
    let _ = writer.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "/gangsim/barrier";

    fn join(registry: &mut Registry, conn: ConnId, participant: &str, expected: usize) -> Outbox {
        registry.handle(
            conn,
            ClientMessage::Join {
                path: PATH.to_string(),
                participant: participant.to_string(),
                expected,
            },
        )
    }

    fn arrive(registry: &mut Registry, conn: ConnId, step: u64) -> Outbox {
        registry.handle(
            conn,
            ClientMessage::Arrive {
                path: PATH.to_string(),
                step,
            },
        )
    }

    #[test]
    fn test_release_only_after_all_arrive() {
        let mut registry = Registry::new();
        join(&mut registry, 1, "a", 2);
        let joined = join(&mut registry, 2, "b", 2);
        assert_eq!(
            joined,
            vec![(
                2,
                ServerMessage::Joined {
                    path: PATH.to_string(),
                    members: 2
                }
            )]
        );

        assert!(arrive(&mut registry, 1, 0).is_empty());

        let mut released = arrive(&mut registry, 2, 0);
        released.sort_by_key(|(conn, _)| *conn);
        let expected = ServerMessage::Released {
            path: PATH.to_string(),
            step: 0,
        };
        assert_eq!(released, vec![(1, expected.clone()), (2, expected)]);
    }

    #[test]
    fn test_disconnect_aborts_remaining_members() {
        let mut registry = Registry::new();
        join(&mut registry, 1, "a", 2);
        join(&mut registry, 2, "b", 2);
        arrive(&mut registry, 1, 0);

        let outbox = registry.disconnect(2);
        assert_eq!(outbox.len(), 1);
        assert!(matches!(
            &outbox[0],
            (1, ServerMessage::Aborted { participant, .. }) if participant == "b"
        ));
        assert!(registry.is_aborted(PATH));

        // Further arrivals are refused
        let refused = arrive(&mut registry, 1, 1);
        assert!(matches!(refused[0].1, ServerMessage::Aborted { .. }));
    }

    #[test]
    fn test_leave_then_disconnect_is_clean() {
        let mut registry = Registry::new();
        join(&mut registry, 1, "a", 1);
        arrive(&mut registry, 1, 0);
        registry.handle(1, ClientMessage::Leave { path: PATH.to_string() });

        assert!(registry.disconnect(1).is_empty());
        assert_eq!(registry.members(PATH), 0);
        assert!(!registry.is_aborted(PATH));
    }

    fn abort(registry: &mut Registry, conn: ConnId, participant: &str) -> Outbox {
        registry.handle(
            conn,
            ClientMessage::Abort {
                path: PATH.to_string(),
                participant: participant.to_string(),
                reason: "policy failure at step 0".to_string(),
            },
        )
    }

    #[test]
    fn test_abort_before_first_arrival_reaches_waiters() {
        let mut registry = Registry::new();
        join(&mut registry, 1, "a", 2);
        assert!(arrive(&mut registry, 1, 0).is_empty());

        // b failed before it ever joined
        let outbox = abort(&mut registry, 2, "b");
        assert_eq!(
            outbox,
            vec![(
                1,
                ServerMessage::Aborted {
                    path: PATH.to_string(),
                    participant: "b".to_string(),
                    reason: "policy failure at step 0".to_string(),
                }
            )]
        );
        assert!(registry.is_aborted(PATH));
        assert_eq!(registry.members(PATH), 1);
    }

    #[test]
    fn test_aborted_path_refuses_late_joiners() {
        let mut registry = Registry::new();
        join(&mut registry, 1, "a", 2);

        // Last member aborts; the path must not be forgotten
        assert!(abort(&mut registry, 1, "a").is_empty());
        assert!(registry.is_aborted(PATH));

        let late = join(&mut registry, 2, "b", 2);
        assert!(matches!(
            &late[0],
            (2, ServerMessage::Aborted { participant, .. }) if participant == "a"
        ));
        assert_eq!(registry.members(PATH), 0);
    }

    #[test]
    fn test_abort_of_unknown_path_is_remembered() {
        let mut registry = Registry::new();
        assert!(abort(&mut registry, 7, "early").is_empty());

        let late = join(&mut registry, 1, "a", 2);
        assert!(matches!(late[0].1, ServerMessage::Aborted { .. }));
    }

    #[test]
    fn test_join_rejections() {
        let mut registry = Registry::new();
        join(&mut registry, 1, "a", 2);

        let mismatch = join(&mut registry, 2, "b", 3);
        assert!(matches!(mismatch[0].1, ServerMessage::Error { .. }));

        let duplicate = join(&mut registry, 2, "a", 2);
        assert!(matches!(duplicate[0].1, ServerMessage::Error { .. }));

        join(&mut registry, 2, "b", 2);
        let full = join(&mut registry, 3, "c", 2);
        assert!(matches!(full[0].1, ServerMessage::Error { .. }));

        let unjoined = arrive(&mut registry, 3, 0);
        assert!(matches!(unjoined[0].1, ServerMessage::Error { .. }));
    }

    #[tokio::test]
    async fn test_server_releases_over_tcp() {
        let server = CoordinatorServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let _handle = server.spawn();

        let mut clients = Vec::new();
        for name in ["a", "b"] {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, mut write) = stream.into_split();
            let join = ClientMessage::Join {
                path: PATH.to_string(),
                participant: name.to_string(),
                expected: 2,
            };
            write.write_all(encode_line(&join).unwrap().as_bytes()).await.unwrap();
            let mut lines = BufReader::new(read).lines();
            let reply: ServerMessage = decode_line(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert!(matches!(reply, ServerMessage::Joined { .. }));
            clients.push((lines, write));
        }

        for (_, write) in clients.iter_mut() {
            let arrive = ClientMessage::Arrive {
                path: PATH.to_string(),
                step: 0,
            };
            write.write_all(encode_line(&arrive).unwrap().as_bytes()).await.unwrap();
        }

        for (lines, _) in clients.iter_mut() {
            let reply: ServerMessage = decode_line(&lines.next_line().await.unwrap().unwrap()).unwrap();
            assert_eq!(
                reply,
                ServerMessage::Released {
                    path: PATH.to_string(),
                    step: 0
                }
            );
        }
    }
}
