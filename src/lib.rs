///! A single-threaded connection multiplexer for a telnet-style bulletin
///! board system.
///!
///! A process built from this crate owns the listening socket directly,
///! accepts connections itself, and runs every session as an independent
///! worker reachable only through a typed pipe — the multiplexer never
///! blocks on a session, and a session never touches another session's
///! socket.
///!
///! # Layout
///!
///! - `client`: the accepted TCP connection and its read/write buffers,
///!   owned exclusively by the event loop.
///! - `message`: the typed frame/message protocol carried over every pipe.
///! - `pipe`: the pipe pair plus the non-reentrant try-lock guarding it.
///! - `registry`: the Terminal Registry, the `(client, pipe, lock)` table.
///! - `lock_registry`: named cooperative locks shared across sessions.
///! - `storage`: the DB offload path and its detached-worker handoff.
///! - `listener`: the listening socket and connection admission policy.
///! - `session`: the session-worker spawn interface and a demonstration
///!   echo worker.
///! - `engine`: the event loop itself.
///! - `config`: layered INI configuration loading.
///! - `logging`: `tracing` subscriber initialization.
///! - `error`: the crate-wide error taxonomy.
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod lock_registry;
pub mod logging;
pub mod message;
pub mod pipe;
pub mod registry;
pub mod session;
pub mod storage;

pub use error::{CoreError, Result};
