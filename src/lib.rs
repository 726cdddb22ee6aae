//! Multi-service WebSockets server for the Tokio stack.
//!
//! A single listener accepts HTTP upgrade requests, dispatches each connection to a
//! named service identified by the request path, and from then on relays WebSocket
//! text frames between that connection and the worker hosting the service. Many
//! independent services coexist in one process, each isolated in its own worker with
//! its own inbound and outbound queues.
//!
//! The crate is built around four pieces: a resumable byte-level frame codec for
//! [RFC 6455](https://datatracker.ietf.org/doc/html/rfc6455) text frames, a manager
//! that multiplexes I/O across all live connections and operates the switchboard
//! between per-connection and per-service queues, a path-addressed service directory
//! with lazy spawning and liveness-based eviction, and the HTTP/1.1 upgrade
//! handshake that gates admission.

pub mod config;
mod connection;
pub mod directory;
pub mod error;
pub mod frame;
pub mod handshake;
mod manager;
pub mod server;
pub mod service;
pub mod transaction;
