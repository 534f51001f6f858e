//! Client-facing message grammar.
//!
//! Clients speak opaque text messages; the broker inspects just enough
//! of them to route. Two shapes matter: the 4-byte control message
//! `quit`, and the JSON init handshake `{"method":"init","id":...}`.
//! Everything else passes through untouched.

use serde::Deserialize;

/// The control message that shuts the broker down.
pub const QUIT_MESSAGE: &[u8] = b"quit";

/// Synthetic frame payload sent to a backend when a bound client
/// disconnects. 18 bytes of text, no trailing NUL.
pub const CLOSE_NOTIFICATION: &[u8] = br#"{"method":"close"}"#;

/// The subset of a client message the broker ever looks at.
#[derive(Debug, Deserialize)]
struct ClientEnvelope {
    method: Option<String>,
    id: Option<String>,
}

/// Broker-side classification of one inbound client message.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientMessage<'a> {
    /// Shut the broker down.
    Quit,
    /// Init handshake carrying a profile id (already lowercased).
    Init { profile_id: String },
    /// Anything else; forwarded verbatim once the session is bound.
    Other(&'a [u8]),
}

/// Classify a raw client message.
///
/// Profile ids are matched case-insensitively, so the id is lowercased
/// here. A message that fails to parse as JSON, or parses but is not an
/// init, is `Other`; whether that gets forwarded or dropped depends on
/// the session's binding state.
pub fn classify(raw: &[u8]) -> ClientMessage<'_> {
    if raw == QUIT_MESSAGE {
        return ClientMessage::Quit;
    }

    if let Ok(envelope) = serde_json::from_slice::<ClientEnvelope>(raw) {
        if envelope.method.as_deref() == Some("init") {
            if let Some(id) = envelope.id {
                return ClientMessage::Init {
                    profile_id: id.to_lowercase(),
                };
            }
        }
    }

    ClientMessage::Other(raw)
}
