//! The typed message protocol carried across every pipe.
//!
//! A session emits `Frame`s: a string event tag plus an opaque `Payload`,
//! mirroring the wire-level protocol described in the design (`input`,
//! `output`, `global`, `exit`, `logger`, `exception`, `db*`, `lock*`). The
//! core decodes each `Frame` into a `Message` at the dispatch boundary
//! (`Message::decode`); an unrecognized tag decodes to nothing and the
//! caller raises `CoreError::ProtocolViolation`.
//!
//! The core, by contrast, already knows what it means to send — `Input`,
//! `Exception`, `Global`, `DbReply`, `LockReply` — so core-to-session
//! traffic is the decoded `Message` directly; there is no need to encode and
//! immediately re-decode a value the core itself produced.

use bytes::Bytes;

/// A textual event tag, exactly as a session would write it on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTag(pub String);

impl std::fmt::Display for EventTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output text arrives in one of two encodings; see the Client Socket design.
#[derive(Debug, Clone)]
pub enum OutputPayload {
    /// UTF-8 (or negotiated terminal) text. Rendered to bytes before queuing.
    Unicode(String),
    /// Legacy 8-bit codepage bytes, shipped through unchanged.
    Raw(Bytes),
}

/// The two conditions a session is notified of asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionException {
    Disconnect,
    ConnectionTimeout,
}

/// A named-lock request's operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Acquire,
    Release,
}

/// A single log record forwarded from a session over the `logger` tag.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: tracing::Level,
    pub target: String,
    pub message: String,
}

/// The result of a storage query, carried back on a `db*` reply.
pub type DbResult = std::result::Result<Bytes, String>;

/// The payload half of a raw `Frame`, as a session would hand it to the core.
#[derive(Debug, Clone)]
pub enum Payload {
    None,
    Bytes(Bytes),
    Output(OutputPayload),
    Lock { op: LockOp, stale: Option<u64> },
    Log(LogRecord),
}

/// A raw, untyped pipe message: an event tag plus its payload.
///
/// This is what a session actually sends; `Message::decode` turns it into a
/// validated `Message`, or rejects it as a protocol violation.
#[derive(Debug, Clone)]
pub struct Frame {
    pub tag: String,
    pub payload: Payload,
}

impl Frame {
    pub fn new(tag: impl Into<String>, payload: Payload) -> Self {
        Frame {
            tag: tag.into(),
            payload,
        }
    }
}

/// Everything that can flow across a pipe, decoded.
#[derive(Debug, Clone)]
pub enum Message {
    /// Core -> session: bytes read from the socket since the last `Input`.
    Input(Bytes),
    /// Session -> core: text to append to the client's outbound buffer.
    Output { payload: OutputPayload },
    /// Session -> core: fan out `payload` to every other registered session.
    /// Core -> session: a `Global` message originated by another session.
    Global { tag: String, payload: Bytes },
    /// Session -> core: this session is done; unregister and disconnect.
    Exit,
    /// Session -> core: forward this record to the process logger.
    Logger(LogRecord),
    /// Core -> session: an asynchronous condition the session should react to.
    Exception(SessionException),
    /// Session -> core: a storage query named `op`, handed to a detached worker.
    Db { op: String, payload: Bytes },
    /// Core -> session: the reply to a previously issued `Db { op, .. }`.
    DbReply { op: String, result: DbResult },
    /// Session -> core: acquire or release the named lock `name`.
    Lock {
        name: String,
        op: LockOp,
        stale: Option<u64>,
    },
    /// Core -> session: the reply to a previously issued `Lock { name, .. }`
    /// acquire request. Releases get no reply (see Lock Registry design).
    LockReply { name: String, granted: bool },
}

impl Message {
    /// Decode a raw session-originated frame into a `Message`.
    ///
    /// Returns `None` when the tag matches none of the recognized shapes in
    /// the event-tag table; the caller is expected to treat that as a fatal
    /// `ProtocolViolation`.
    pub fn decode(frame: Frame) -> Option<Message> {
        match frame.tag.as_str() {
            "output" => match frame.payload {
                Payload::Output(payload) => Some(Message::Output { payload }),
                _ => None,
            },
            "global" => match frame.payload {
                Payload::Bytes(payload) => Some(Message::Global {
                    tag: frame.tag,
                    payload,
                }),
                _ => None,
            },
            "exit" => Some(Message::Exit),
            "logger" => match frame.payload {
                Payload::Log(record) => Some(Message::Logger(record)),
                _ => None,
            },
            tag if tag.starts_with("db") => match frame.payload {
                Payload::Bytes(payload) => Some(Message::Db {
                    op: tag.trim_start_matches("db").trim_start_matches(':').to_string(),
                    payload,
                }),
                _ => None,
            },
            tag if tag.starts_with("lock") => match frame.payload {
                Payload::Lock { op, stale } => Some(Message::Lock {
                    name: tag.trim_start_matches("lock").trim_start_matches(':').to_string(),
                    op,
                    stale,
                }),
                _ => None,
            },
            _ => None,
        }
    }

    /// The wire-level event tag this message would arrive/depart under.
    /// Used only for logging and for constructing `ProtocolViolation`.
    pub fn tag(&self) -> EventTag {
        let s = match self {
            Message::Input(_) => "input".to_string(),
            Message::Output { .. } => "output".to_string(),
            Message::Global { .. } => "global".to_string(),
            Message::Exit => "exit".to_string(),
            Message::Logger(_) => "logger".to_string(),
            Message::Exception(_) => "exception".to_string(),
            Message::Db { op, .. } | Message::DbReply { op, .. } => format!("db:{}", op),
            Message::Lock { name, .. } | Message::LockReply { name, .. } => {
                format!("lock:{}", name)
            }
        };
        EventTag(s)
    }
}
