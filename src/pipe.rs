//! The bidirectional pipe (§3 "Pipe") connecting the multiplexer to one
//! session worker, plus the non-reentrant try-lock paired with it.
//!
//! A session worker in this crate is just another Tokio task, so the pipe
//! is a pair of unbounded `mpsc` channels rather than an OS pipe. Core ->
//! session traffic carries the already-decoded `Message` (the core never
//! needs to re-encode what it produced itself); session -> core traffic
//! carries a raw `Frame` that the core decodes at the dispatch boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::message::{Frame, Message};

/// The non-reentrant, non-blocking try-lock paired with each session triple.
///
/// Its sole purpose is to serialize the multiplexer against detached
/// helpers (the DB offload reply path, see `storage`) that post onto the
/// same pipe. Acquisition is a single compare-exchange; it is never held
/// across an `.await`, so a plain `AtomicBool` is enough — no need for
/// `tokio::sync::Mutex` machinery here.
#[derive(Debug, Default)]
pub struct SessionLock {
    held: AtomicBool,
}

/// RAII guard returned by a successful `try_acquire`. Dropping it releases
/// the lock, which keeps the "always release within the tick" invariant
/// (§8) true even on an early `return` or a dispatch error.
pub struct LockGuard<'a> {
    lock: &'a SessionLock,
}

impl SessionLock {
    pub fn new() -> Self {
        SessionLock {
            held: AtomicBool::new(false),
        }
    }

    /// Attempts to acquire the lock. Never blocks.
    pub fn try_acquire(&self) -> Option<LockGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LockGuard { lock: self })
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

/// The multiplexer's end of a pipe: owned exclusively by the engine,
/// never cloned, never shared. Removal of a triple drops this, which
/// closes both channels and surfaces as end-of-stream to the session.
pub struct CorePipeEnd {
    to_session: mpsc::UnboundedSender<Message>,
    from_session: mpsc::UnboundedReceiver<Frame>,
}

/// A cheaply-clonable handle a detached DB helper uses to post its reply.
/// Deliberately thin: it can send but cannot receive, and it has no access
/// to the Terminal Registry, matching "detached workers ... must not touch
/// the Terminal Registry" (§4.6).
#[derive(Clone)]
pub struct ReplyHandle {
    to_session: mpsc::UnboundedSender<Message>,
    lock: Arc<SessionLock>,
}

/// The session worker's end of a pipe.
pub struct SessionPipeEnd {
    to_core: mpsc::UnboundedSender<Frame>,
    from_core: mpsc::UnboundedReceiver<Message>,
}

impl CorePipeEnd {
    /// Receives the next session-originated frame, or `None` on
    /// end-of-stream (the session dropped its sender).
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_session.recv().await
    }

    /// Non-blocking drain step: used to "aggressively drain" a pipe once
    /// awoken, without waiting for another message to arrive.
    pub fn try_recv(&mut self) -> Result<Frame, mpsc::error::TryRecvError> {
        self.from_session.try_recv()
    }

    /// Posts a message to the session. Silently dropped if the session has
    /// already exited and its receiver was dropped — nothing downstream
    /// depends on this succeeding once the triple is being torn down.
    pub fn send(&self, message: Message) {
        let _ = self.to_session.send(message);
    }
}

impl ReplyHandle {
    pub fn send(&self, message: Message) {
        let _ = self.to_session.send(message);
    }

    pub fn lock(&self) -> &SessionLock {
        &self.lock
    }
}

impl SessionPipeEnd {
    pub async fn recv(&mut self) -> Option<Message> {
        self.from_core.recv().await
    }

    pub fn send(&self, frame: Frame) {
        let _ = self.to_core.send(frame);
    }
}

/// One session triple's non-socket half: the pipe ends plus the lock.
pub struct Triple {
    pub core: CorePipeEnd,
    pub lock: Arc<SessionLock>,
}

impl Triple {
    pub fn reply_handle(&self) -> ReplyHandle {
        ReplyHandle {
            to_session: self.core.to_session.clone(),
            lock: self.lock.clone(),
        }
    }
}

/// Builds a fresh pipe, returning the core's triple half and the session's
/// half. Called once per accepted connection by the session-spawn path.
pub fn pipe() -> (Triple, SessionPipeEnd) {
    let (to_session_tx, to_session_rx) = mpsc::unbounded_channel();
    let (to_core_tx, to_core_rx) = mpsc::unbounded_channel();

    let triple = Triple {
        core: CorePipeEnd {
            to_session: to_session_tx,
            from_session: to_core_rx,
        },
        lock: Arc::new(SessionLock::new()),
    };
    let session = SessionPipeEnd {
        to_core: to_core_tx,
        from_core: to_session_rx,
    };
    (triple, session)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_is_exclusive_until_released() {
        let lock = SessionLock::new();
        let guard = lock.try_acquire().expect("first acquire succeeds");
        assert!(lock.try_acquire().is_none(), "second acquire must fail while held");
        drop(guard);
        assert!(lock.try_acquire().is_some(), "lock is free again after release");
    }

    #[tokio::test]
    async fn pipe_delivers_messages_in_order() {
        let (triple, mut session) = pipe();
        triple.core.send(Message::Input(bytes::Bytes::from_static(b"a")));
        triple.core.send(Message::Input(bytes::Bytes::from_static(b"b")));
        match session.recv().await {
            Some(Message::Input(b)) => assert_eq!(&b[..], b"a"),
            other => panic!("unexpected {:?}", other),
        }
        match session.recv().await {
            Some(Message::Input(b)) => assert_eq!(&b[..], b"b"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn dropping_triple_observes_as_end_of_stream_on_session() {
        let (triple, mut session) = pipe();
        drop(triple);
        assert!(session.recv().await.is_none());
    }
}
