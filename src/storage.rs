//! DB Offload (C6): the storage backend and the detached-worker handoff
//! that keeps every `db*` query off the multiplexer's task.
//!
//! The key/value half of the original `Db` in this teacher's `db.rs`
//! (entries map, shallow `Bytes` clones, `set`/`get`) is the shape this
//! module generalizes: instead of a fixed Redis command set, any event tag
//! beginning with `db` names an opaque operation dispatched to a
//! `StorageBackend` trait object on a detached task, per §4.6's pinned
//! reply schema (same tag, `DbResult` payload).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::error;

use crate::message::{DbResult, Message};
use crate::pipe::ReplyHandle;

/// The storage operations a `db:<op>` request may name. The core does not
/// interpret `key`/`value` beyond handing them to the backend; a real
/// deployment's backend is an external collaborator (§1 Out of scope).
#[derive(Debug, Clone)]
pub enum StorageOp {
    Get { key: String },
    Set { key: String, value: Bytes },
    Delete { key: String },
}

/// What a session actually hands the core on a `db:<op>` tag: the
/// raw bytes payload is decoded into a `StorageOp` by `decode_request`,
/// kept separate from `Message::Db` so the wire shape and the backend
/// trait can evolve independently.
pub fn decode_request(op: &str, payload: Bytes) -> Option<StorageOp> {
    match op {
        "get" => std::str::from_utf8(&payload).ok().map(|key| StorageOp::Get {
            key: key.to_string(),
        }),
        "set" => {
            let text = std::str::from_utf8(&payload).ok()?;
            let mut parts = text.splitn(2, '\u{0}');
            let key = parts.next()?.to_string();
            let value = Bytes::copy_from_slice(parts.next()?.as_bytes());
            Some(StorageOp::Set { key, value })
        }
        "delete" => std::str::from_utf8(&payload).ok().map(|key| StorageOp::Delete {
            key: key.to_string(),
        }),
        _ => None,
    }
}

/// The storage primitive the multiplexer must never call directly (§5).
/// Implementors run entirely on the detached offload task.
pub trait StorageBackend: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<Bytes>, String>;
    fn set(&self, key: &str, value: Bytes) -> Result<(), String>;
    fn delete(&self, key: &str) -> Result<(), String>;
}

/// An in-memory reference implementation, sufficient for tests and for a
/// default deployment without a real on-disk engine (§4.6: "the core
/// ships ... an in-memory reference implementation ... but does not
/// specify a real on-disk engine").
#[derive(Default)]
pub struct InMemoryStorage {
    entries: Mutex<HashMap<String, Bytes>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        InMemoryStorage {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl StorageBackend for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Bytes>, String> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: Bytes) -> Result<(), String> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), String> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

fn run_op(backend: &dyn StorageBackend, op: StorageOp) -> DbResult {
    match op {
        StorageOp::Get { key } => backend.get(&key).map(|v| v.unwrap_or_default()),
        StorageOp::Set { key, value } => backend.set(&key, value).map(|_| Bytes::new()),
        StorageOp::Delete { key } => backend.delete(&key).map(|_| Bytes::new()),
    }
}

/// Hands `(reply, op, op_name, payload)` to a detached task that performs
/// the storage operation and posts the reply under the same tag.
///
/// The multiplexer calls this and returns to its loop immediately; the
/// task is intentionally not tracked for join (§4.6, §Glossary
/// "Detached helper").
pub fn offload(backend: Arc<dyn StorageBackend>, reply: ReplyHandle, op_name: String, payload: Bytes) {
    tokio::spawn(async move {
        let result = match decode_request(&op_name, payload) {
            Some(op) => run_op(backend.as_ref(), op),
            None => Err(format!("malformed db request for op {:?}", op_name)),
        };

        // Mirrors the engine's own try-lock discipline (§4.5/§9): a
        // detached helper posting onto a pipe still serializes against
        // the multiplexer manipulating the same triple. Retried rather
        // than blocked, since acquisition must never block.
        loop {
            if let Some(_guard) = reply.lock().try_acquire() {
                reply.send(Message::DbReply {
                    op: op_name.clone(),
                    result: result.clone(),
                });
                break;
            }
            tokio::task::yield_now().await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_round_trips() {
        let backend = InMemoryStorage::new();
        backend.set("k", Bytes::from_static(b"v")).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(Bytes::from_static(b"v")));
    }

    #[test]
    fn get_of_missing_key_is_none() {
        let backend = InMemoryStorage::new();
        assert_eq!(backend.get("missing").unwrap(), None);
    }

    #[test]
    fn delete_removes_entry() {
        let backend = InMemoryStorage::new();
        backend.set("k", Bytes::from_static(b"v")).unwrap();
        backend.delete("k").unwrap();
        assert_eq!(backend.get("k").unwrap(), None);
    }

    #[test]
    fn decode_get_request() {
        let op = decode_request("get", Bytes::from_static(b"hello")).unwrap();
        assert!(matches!(op, StorageOp::Get { key } if key == "hello"));
    }

    #[tokio::test]
    async fn offload_posts_reply_on_same_tag() {
        use crate::pipe::pipe;

        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryStorage::new());
        backend.set("k", Bytes::from_static(b"v")).unwrap();

        let (triple, mut session) = pipe();
        let reply = triple.reply_handle();
        offload(backend, reply, "get".to_string(), Bytes::from_static(b"k"));

        match session.recv().await {
            Some(Message::DbReply { op, result }) => {
                assert_eq!(op, "get");
                assert_eq!(result.unwrap(), Bytes::from_static(b"v"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
