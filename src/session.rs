//! Session Worker (C3) — interface only.
//!
//! The core does not care whether a session is a thread, a process, or a
//! task, only that it is a separate execution context reached solely
//! through its pipe (§4.3). In this crate a session is a Tokio task; the
//! `SessionSpawn` callback type is the Rust stand-in for the external
//! `on_connect` collaborator in §4.2/§6 that a real deployment supplies.
//!
//! The concrete worker shipped here is an echo session (§4.3): it relays
//! `input` back as `output` and exits on an empty line. It exists for the
//! engine's own tests and as a minimal demonstration; real interactive
//! "scripts" are an external concern reached through the same spawn
//! interface.

use bytes::Bytes;

use crate::message::{Message, OutputPayload};
use crate::pipe::SessionPipeEnd;

/// A session-spawn callback: given the session's end of a freshly-built
/// pipe, start whatever execution context will drive the interactive
/// session, then return immediately. The engine calls this synchronously
/// from the accept path (§4.2's `on_connect`), so implementations that
/// need their own concurrency (the normal case) must spawn their own task
/// rather than block here.
pub trait SessionSpawn: Send + Sync + 'static {
    fn spawn(&self, session: SessionPipeEnd);
}

impl<F> SessionSpawn for F
where
    F: Fn(SessionPipeEnd) + Send + Sync + 'static,
{
    fn spawn(&self, session: SessionPipeEnd) {
        (self)(session)
    }
}

/// Spawns the demonstration echo session as a Tokio task.
pub fn spawn_echo_session(mut session: SessionPipeEnd) {
    tokio::spawn(async move {
        while let Some(message) = session.recv().await {
            if let Message::Input(bytes) = message {
                if is_blank_line(&bytes) {
                    session.send(crate::message::Frame::new(
                        "exit",
                        crate::message::Payload::None,
                    ));
                    return;
                }
                let text = String::from_utf8_lossy(&bytes).into_owned();
                session.send(crate::message::Frame::new(
                    "output",
                    crate::message::Payload::Output(OutputPayload::Unicode(text)),
                ));
            }
            // Exceptions (`ConnectionTimeout`, `Disconnect`) and lock/db
            // replies are out of scope for this minimal demonstration
            // worker; a real session script reacts to all of them.
        }
    });
}

fn is_blank_line(bytes: &Bytes) -> bool {
    bytes.iter().all(|b| matches!(b, b'\r' | b'\n'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::pipe;

    #[tokio::test]
    async fn echo_session_relays_input_as_output() {
        let (triple, session) = pipe();
        spawn_echo_session(session);

        triple.core.send(Message::Input(Bytes::from_static(b"abc")));
        let frame = triple.core.recv().await.expect("echo reply");
        assert_eq!(frame.tag, "output");
        match frame.payload {
            crate::message::Payload::Output(OutputPayload::Unicode(text)) => {
                assert_eq!(text, "abc")
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn echo_session_exits_on_blank_line() {
        let (triple, session) = pipe();
        spawn_echo_session(session);

        triple.core.send(Message::Input(Bytes::from_static(b"\n")));
        let frame = triple.core.recv().await.expect("exit frame");
        assert_eq!(frame.tag, "exit");
    }
}
