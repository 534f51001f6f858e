//! Per-user control endpoint.
//!
//! Clients reach the broker over a per-user, message-oriented channel.
//! On Windows that is the message-mode named pipe
//! `\\.\pipe\<username>\PIME\Launcher`, created with security
//! attributes that let sandboxed app-container clients connect. On Unix
//! it is a stream socket under the user runtime directory, with
//! newline-delimited messages standing in for pipe message boundaries.
//!
//! The platform split is confined to this module: everything above it
//! works with [`Listener`], [`Endpoint`] and the message reader/writer
//! halves.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use self::unix::{connect, Endpoint, EndpointPath, Listener, MessageReader, MessageWriter};

#[cfg(windows)]
mod security;
#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::{connect, Endpoint, EndpointPath, Listener, MessageReader, MessageWriter};
