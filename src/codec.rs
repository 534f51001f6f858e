//! Framing codec for the backend stdio pipes.
//!
//! A backend frame is `<client_id>\t<payload>\n`: the client id carries
//! neither HT nor LF, and the payload carries no LF. One frame per
//! write on the backend's stdin; frames on its stdout are recovered
//! incrementally, so a read that straddles a line boundary keeps the
//! unread suffix for the next read.
//!
//! A backend may emit a single NUL byte as the very first byte of its
//! stdout stream to signal that it finished initialising. The sentinel
//! is not a frame and is reported as its own event.

use log::warn;

use crate::error::{BrokerError, BrokerResult};

/// Separator between the client id and the payload.
const FRAME_SEP: u8 = b'\t';

/// Frame terminator.
const FRAME_END: u8 = b'\n';

/// Encode one frame for a backend's stdin.
///
/// Fails with [`BrokerError::InvalidFrame`] if `client_id` contains a
/// tab or line feed, or if `payload` contains a line feed.
pub fn encode(client_id: &str, payload: &[u8]) -> BrokerResult<Vec<u8>> {
    if client_id
        .bytes()
        .any(|b| b == FRAME_SEP || b == FRAME_END)
    {
        return Err(BrokerError::InvalidFrame("client id contains a separator"));
    }
    if payload.contains(&FRAME_END) {
        return Err(BrokerError::InvalidFrame("payload contains a line feed"));
    }

    let mut frame = Vec::with_capacity(client_id.len() + payload.len() + 2);
    frame.extend_from_slice(client_id.as_bytes());
    frame.push(FRAME_SEP);
    frame.extend_from_slice(payload);
    frame.push(FRAME_END);
    Ok(frame)
}

/// One decoded unit from a backend's stdout stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdoutEvent {
    /// The leading NUL ready sentinel.
    Ready,
    /// A complete `<client_id>\t<payload>` line.
    Frame { client_id: String, payload: Vec<u8> },
}

/// Incremental decoder for a backend's stdout stream.
///
/// Bytes are fed in whatever chunks the pipe delivers; complete lines
/// come out as [`StdoutEvent`]s and a partial trailing line is retained
/// across calls. Lines without a tab separator are dropped (and
/// counted), not treated as stream errors.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    started: bool,
    malformed: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of malformed lines dropped so far.
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    /// Feed a chunk of stdout bytes, returning every event it completes.
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<StdoutEvent> {
        let mut events = Vec::new();

        if !self.started && !data.is_empty() {
            self.started = true;
            if data[0] == 0 {
                events.push(StdoutEvent::Ready);
                data = &data[1..];
            }
        }

        self.buf.extend_from_slice(data);

        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == FRAME_END) {
            let line = &self.buf[start..start + offset];
            match split_frame(line) {
                Ok((client_id, payload)) => events.push(StdoutEvent::Frame {
                    client_id,
                    payload,
                }),
                Err(err) => {
                    self.malformed += 1;
                    warn!("{err}, dropping {} byte line", line.len());
                }
            }
            start += offset + 1;
        }
        self.buf.drain(..start);

        events
    }
}

/// Split one complete line at the first tab. Fails if the line has no
/// tab or the client id is not valid UTF-8.
fn split_frame(line: &[u8]) -> BrokerResult<(String, Vec<u8>)> {
    let sep = line
        .iter()
        .position(|&b| b == FRAME_SEP)
        .ok_or(BrokerError::MalformedFrame)?;
    let client_id = std::str::from_utf8(&line[..sep]).map_err(|_| BrokerError::MalformedFrame)?;
    Ok((client_id.to_string(), line[sep + 1..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(client_id: &str, payload: &[u8]) -> StdoutEvent {
        StdoutEvent::Frame {
            client_id: client_id.to_string(),
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn encode_builds_envelope() {
        let bytes = encode("c7", br#"{"ok":true}"#).unwrap();
        assert_eq!(bytes, b"c7\t{\"ok\":true}\n");
    }

    #[test]
    fn encode_rejects_separators() {
        assert!(encode("a\tb", b"x").is_err());
        assert!(encode("a\nb", b"x").is_err());
        assert!(encode("ab", b"x\ny").is_err());
        // A tab in the payload is allowed; only the first one splits.
        assert!(encode("ab", b"x\ty").is_ok());
    }

    #[test]
    fn round_trip() {
        let mut decoder = FrameDecoder::new();
        let bytes = encode("c1", b"hello").unwrap();
        let events = decoder.feed(&bytes);
        assert_eq!(events, vec![frame("c1", b"hello")]);
    }

    #[test]
    fn decode_splits_on_first_tab_only() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(b"c1\ta\tb\n");
        assert_eq!(events, vec![frame("c1", b"a\tb")]);
    }

    #[test]
    fn partial_tail_is_retained() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(b"c1\tpart").is_empty());
        let events = decoder.feed(b"ial\nc2\tnext\n");
        assert_eq!(events, vec![frame("c1", b"partial"), frame("c2", b"next")]);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(b"no separator here\nc1\tok\n");
        assert_eq!(events, vec![frame("c1", b"ok")]);
        assert_eq!(decoder.malformed_count(), 1);
    }

    #[test]
    fn ready_sentinel_precedes_frames() {
        let mut decoder = FrameDecoder::new();
        let events = decoder.feed(b"\0c1\tfirst\n");
        assert_eq!(events, vec![StdoutEvent::Ready, frame("c1", b"first")]);
    }

    #[test]
    fn nul_later_in_stream_is_not_a_sentinel() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"c1\tx\n");
        let events = decoder.feed(b"\0c2\ty\n");
        // Past the first byte a NUL is ordinary data.
        assert_eq!(events, vec![frame("\0c2", b"y")]);
    }

    #[test]
    fn arbitrary_chunking_yields_same_frames() {
        let stream = b"\0c1\tone\nc2\ttwo\nbad line\nc3\tthree\n";

        let mut whole = FrameDecoder::new();
        let expected = whole.feed(stream);

        for chunk_size in 1..stream.len() {
            let mut decoder = FrameDecoder::new();
            let mut events = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                events.extend(decoder.feed(chunk));
            }
            assert_eq!(events, expected, "chunk size {chunk_size}");
            assert_eq!(decoder.malformed_count(), 1);
        }
    }
}
