//! Client Socket (C1): the multiplexer's exclusive view of one accepted
//! TCP connection.
//!
//! No entity other than the event loop ever touches a `ClientSocket`.
//! Sessions only see bytes and strings handed to them over the pipe.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::message::OutputPayload;

/// Opaque identifier for a client, stable for the lifetime of the connection.
pub type ClientId = u64;

/// One accepted TCP connection and its buffers.
pub struct ClientSocket {
    id: ClientId,
    addr: SocketAddr,
    stream: TcpStream,
    active: bool,
    last_input: Instant,
    inbound: BytesMut,
    outbound: BytesMut,
    cols: u16,
    rows: u16,
}

impl ClientSocket {
    pub fn new(id: ClientId, addr: SocketAddr, stream: TcpStream) -> Self {
        ClientSocket {
            id,
            addr,
            stream,
            active: true,
            last_input: Instant::now(),
            inbound: BytesMut::with_capacity(4096),
            outbound: BytesMut::with_capacity(4096),
            cols: 80,
            rows: 24,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn active(&self) -> bool {
        self.active
    }

    /// Sets `active` to false. Idempotent: calling this any number of times
    /// has the same effect as calling it once.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Seconds since the last byte was observed on this socket.
    pub fn idle(&self) -> Duration {
        self.last_input.elapsed()
    }

    pub fn window_size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    /// Invoked by the external `on_naws` callback when the Telnet subsystem
    /// decodes a window-size (NAWS) option.
    pub fn set_window_size(&mut self, cols: u16, rows: u16) {
        self.cols = cols;
        self.rows = rows;
    }

    pub fn input_ready(&self) -> bool {
        !self.inbound.is_empty()
    }

    pub fn send_ready(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Removes and returns all accumulated input bytes.
    pub fn take_input(&mut self) -> Bytes {
        self.inbound.split().freeze()
    }

    /// Appends rendered bytes to the outbound buffer.
    ///
    /// Both encodings ultimately append bytes verbatim; the distinction is
    /// in how those bytes were produced. Unicode text is rendered to its
    /// UTF-8 representation. Raw 8-bit payloads are legacy codepage bytes
    /// the core must never attempt to re-decode, so they pass through
    /// unchanged.
    pub fn queue_unicode(&mut self, payload: OutputPayload) {
        match payload {
            OutputPayload::Unicode(text) => self.outbound.extend_from_slice(text.as_bytes()),
            OutputPayload::Raw(bytes) => self.outbound.extend_from_slice(&bytes),
        }
    }

    /// Waits until the socket is readable or writable, whichever a caller
    /// asks for. Used by the event loop's readiness wait (step 3).
    pub async fn readable(&self) -> std::io::Result<()> {
        self.stream.readable().await
    }

    /// Drains the socket's receive queue into the inbound buffer.
    ///
    /// Returns `Ok(true)` if any bytes were read, `Ok(false)` if the socket
    /// would block having read nothing (benign, nothing to do), and `Err`
    /// when the peer closed the connection or the socket faulted — the
    /// caller must mark the client for deactivation in that case.
    pub fn recv(&mut self) -> std::io::Result<bool> {
        let mut read_any = false;
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "peer closed connection",
                    ));
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&buf[..n]);
                    self.last_input = Instant::now();
                    read_any = true;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return Ok(read_any);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Flushes as much of the outbound buffer as the socket accepts without
    /// blocking. Same failure contract as `recv`.
    pub fn send_pending(&mut self) -> std::io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.try_write(&self.outbound) {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "failed to write any bytes",
                    ));
                }
                Ok(n) => {
                    let _ = self.outbound.split_to(n);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connect_pair() -> (ClientSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server_stream, peer_addr) = listener.accept().await.unwrap();
        let peer = connector.await.unwrap();
        (ClientSocket::new(1, peer_addr, server_stream), peer)
    }

    #[tokio::test]
    async fn deactivate_is_idempotent() {
        let (mut client, _peer) = connect_pair().await;
        assert!(client.active());
        client.deactivate();
        client.deactivate();
        client.deactivate();
        assert!(!client.active());
    }

    #[tokio::test]
    async fn recv_accumulates_bytes_in_order() {
        let (mut client, mut peer) = connect_pair().await;
        peer.write_all(b"abc").await.unwrap();
        client.readable().await.unwrap();
        client.recv().unwrap();
        peer.write_all(b"def").await.unwrap();
        client.readable().await.unwrap();
        client.recv().unwrap();
        assert_eq!(&client.take_input()[..], b"abcdef");
    }

    #[tokio::test]
    async fn recv_reports_connection_closed_on_eof() {
        let (mut client, peer) = connect_pair().await;
        drop(peer);
        // Give the FIN a moment to arrive.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = loop {
            client.readable().await.unwrap();
            match client.recv() {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn send_pending_flushes_to_peer() {
        let (mut client, mut peer) = connect_pair().await;
        client.queue_unicode(OutputPayload::Unicode("hello".to_string()));
        assert!(client.send_ready());
        client.send_pending().unwrap();
        assert!(!client.send_ready());
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn raw_payload_passes_through_unchanged() {
        let mut buf = BytesMut::new();
        let raw = Bytes::from_static(&[0xA3, 0x9F, 0x00, 0xFF]);
        buf.extend_from_slice(&raw);
        assert_eq!(&buf[..], &raw[..]);
    }
}
