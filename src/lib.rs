//! Per-user launcher and message broker for input-method backends.
//!
//! Many short-lived text-service clients connect over a per-user pipe;
//! a handful of long-lived backend engine processes serve them. The
//! broker sits in between: it resolves each client's declared profile
//! id to a backend, spawns that backend on first demand, and shuttles
//! opaque text messages both ways, tagging each with a client id so one
//! backend can multiplex many clients.
//!
//! ```text
//! client pipe ── session ──┐                 ┌── stdin  ── backend A
//! client pipe ── session ──┤── registry ─────┤
//! client pipe ── session ──┘   route_reply ◄─┴── stdout ── backend A
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod ipc;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
