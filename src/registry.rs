//! Terminal Registry (C4): the process-wide table of `(client, pipe, lock)`
//! triples, and the sole rendezvous between the multiplexer and session
//! workers.
//!
//! Owned exclusively by the engine (single-threaded driver, §5) so no
//! internal locking is needed for the table itself; "snapshot-safe
//! iteration" is satisfied by handing out an owned `Vec` of client ids to
//! iterate, so a callback that unregisters one entry mid-iteration never
//! invalidates the iterator of another.

use std::collections::HashMap;

use crate::client::ClientId;
use crate::client::ClientSocket;
use crate::pipe::Triple;

/// One registered session: its socket plus its pipe/lock half.
pub struct Session {
    pub client: ClientSocket,
    pub triple: Triple,
    /// Suppresses duplicate `ConnectionTimeout` delivery until the session
    /// exits or is reaped (resolved open question, see DESIGN.md).
    pub timeout_notified: bool,
}

/// The registry itself.
#[derive(Default)]
pub struct TerminalRegistry {
    sessions: HashMap<ClientId, Session>,
}

impl TerminalRegistry {
    pub fn new() -> Self {
        TerminalRegistry {
            sessions: HashMap::new(),
        }
    }

    /// Insertion is the responsibility of the session-spawn path.
    pub fn register(&mut self, id: ClientId, client: ClientSocket, triple: Triple) {
        self.sessions.insert(
            id,
            Session {
                client,
                triple,
                timeout_notified: false,
            },
        );
    }

    /// Removal is the responsibility of the engine when a session
    /// terminates. Safe to call while iterating a snapshot from `ids()`.
    pub fn unregister(&mut self, id: ClientId) -> Option<Session> {
        self.sessions.remove(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Session> {
        self.sessions.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// A snapshot of currently-registered ids, safe to iterate even as the
    /// caller unregisters entries (including the one it's currently on).
    pub fn ids(&self) -> Vec<ClientId> {
        self.sessions.keys().copied().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ClientId, &mut Session)> {
        self.sessions.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ClientId, &Session)> {
        self.sessions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_socket(id: ClientId) -> (ClientSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, peer_addr) = listener.accept().await.unwrap();
        let peer = connector.await.unwrap();
        (ClientSocket::new(id, peer_addr, server_stream), peer)
    }

    #[tokio::test]
    async fn snapshot_survives_removal_mid_iteration() {
        let mut registry = TerminalRegistry::new();
        let (s1, _p1) = connected_socket(1).await;
        let (s2, _p2) = connected_socket(2).await;
        let (t1, _sess1) = pipe();
        let (t2, _sess2) = pipe();
        registry.register(1, s1, t1);
        registry.register(2, s2, t2);

        let snapshot = registry.ids();
        assert_eq!(snapshot.len(), 2);
        for id in snapshot {
            registry.unregister(id);
        }
        assert!(registry.is_empty());
    }
}
