//! Listener (C2): owns the listening socket, accepts new connections, and
//! enforces the configured connection cap.
//!
//! Grounded on `x84/engine.py::_loop`'s accept branch: `telnetd.client_count()
//! > MAX_CONNECTIONS` closes the new socket and logs at error level rather
//! than refusing to `accept()` at all — the connection is always accepted
//! off the kernel's backlog and then immediately dropped, which is what
//! lets scenario 6 in §8 observe "accepted, then closed before any data."

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::error;

use crate::client::{ClientId, ClientSocket};
use crate::error::CoreError;

/// Owns the bound socket and the table of currently-accepted clients,
/// keyed by id (the Rust stand-in for "keyed by descriptor").
pub struct Listener {
    listener: TcpListener,
    max_connections: usize,
    next_id: ClientId,
    clients: HashMap<ClientId, ()>,
}

/// What `accept_one` produced: either a new client ready to be registered,
/// or a connection that was accepted and immediately refused.
pub enum Accepted {
    Admitted(ClientSocket),
    Refused,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, max_connections: usize) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Listener {
            listener,
            max_connections,
            next_id: 0,
            clients: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Waits for the next inbound connection. Cancel-safe (delegates to
    /// `TcpListener::accept`), so it can live as one branch of a larger
    /// `select!` in the engine's wait step.
    pub async fn accept_ready(&self) -> std::io::Result<(TcpStream, SocketAddr)> {
        self.listener.accept().await
    }

    /// Applies the admission policy to an already-accepted socket: over
    /// the cap, close immediately and log at error level; otherwise build
    /// a `ClientSocket`, assign it an id, and register it in this table.
    pub fn admit(&mut self, stream: TcpStream, addr: SocketAddr) -> Accepted {
        if self.clients.len() >= self.max_connections {
            let err = CoreError::Refused;
            error!(%addr, max = self.max_connections, %err, "maximum reached");
            return Accepted::Refused;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.clients.insert(id, ());
        Accepted::Admitted(ClientSocket::new(id, addr, stream))
    }

    /// Removes a client from the listener's table (step 1, Reap).
    pub fn forget(&mut self, id: ClientId) {
        self.clients.remove(&id);
    }

    /// Whether `id` is still present in the listener's table. Used by
    /// Reap to avoid sending a second `Disconnect` to a triple that
    /// outlived its listener entry while waiting on the session to exit.
    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn accept_at_exactly_max_connections_succeeds() {
        let mut listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 2)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        for _ in 0..2 {
            let _connector = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
            let (stream, peer) = listener.accept_ready().await.unwrap();
            match listener.admit(stream, peer) {
                Accepted::Admitted(_) => {}
                Accepted::Refused => panic!("should have been admitted"),
            }
        }
        assert_eq!(listener.client_count(), 2);
    }

    #[tokio::test]
    async fn one_beyond_max_connections_is_refused() {
        let mut listener = Listener::bind("127.0.0.1:0".parse().unwrap(), 1)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let _c1 = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (s1, p1) = listener.accept_ready().await.unwrap();
        assert!(matches!(listener.admit(s1, p1), Accepted::Admitted(_)));

        let _c2 = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (s2, p2) = listener.accept_ready().await.unwrap();
        assert!(matches!(listener.admit(s2, p2), Accepted::Refused));
    }
}
