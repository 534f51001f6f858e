//! Unix rendition of the control endpoint: a per-user stream socket
//! with newline-delimited messages.

use std::fmt;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};

/// Filesystem address of the per-user control socket.
#[derive(Debug, Clone)]
pub struct EndpointPath(PathBuf);

impl EndpointPath {
    /// The well-known per-user location: the user runtime directory
    /// when available, a per-user temp directory otherwise.
    pub fn per_user() -> Self {
        let base = match std::env::var("XDG_RUNTIME_DIR") {
            Ok(dir) => PathBuf::from(dir).join("pime"),
            Err(_) => {
                let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
                std::env::temp_dir().join(format!("pime-{user}"))
            }
        };
        Self(base.join("launcher.sock"))
    }

    /// An explicit socket path, mainly for tests.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }
}

impl fmt::Display for EndpointPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

/// The listening end of the control socket.
pub struct Listener {
    inner: UnixListener,
}

impl Listener {
    /// Bind the control socket, creating its directory (0700) and
    /// clearing a stale socket file first. Failure here is fatal to the
    /// broker.
    pub fn bind(path: &EndpointPath) -> Result<Self> {
        if let Some(dir) = path.0.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating socket directory {}", dir.display()))?;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
                .with_context(|| format!("restricting socket directory {}", dir.display()))?;
        }
        if path.0.exists() {
            debug!("removing stale socket {}", path.0.display());
            std::fs::remove_file(&path.0)
                .with_context(|| format!("removing stale socket {}", path.0.display()))?;
        }

        let inner = UnixListener::bind(&path.0)
            .with_context(|| format!("binding control socket {}", path.0.display()))?;
        Ok(Self { inner })
    }

    pub async fn accept(&mut self) -> io::Result<Endpoint> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(Endpoint { stream })
    }
}

/// One connected client channel.
pub struct Endpoint {
    stream: UnixStream,
}

impl Endpoint {
    pub fn split(self) -> (MessageReader, MessageWriter) {
        let (read, write) = self.stream.into_split();
        (
            MessageReader {
                inner: BufReader::new(read),
            },
            MessageWriter { inner: write },
        )
    }
}

pub struct MessageReader {
    inner: BufReader<OwnedReadHalf>,
}

impl MessageReader {
    /// Read one message. `None` on a clean EOF.
    pub async fn next_message(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let n = self.inner.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        Ok(Some(buf))
    }
}

pub struct MessageWriter {
    inner: OwnedWriteHalf,
}

impl MessageWriter {
    /// Write one message, appending the message terminator.
    pub async fn write_message(&mut self, payload: &[u8]) -> io::Result<()> {
        self.inner.write_all(payload).await?;
        self.inner.write_all(b"\n").await
    }
}

/// Connect to a broker listening at `path` (used by `--quit`).
pub async fn connect(path: &EndpointPath) -> io::Result<Endpoint> {
    let stream = UnixStream::connect(&path.0).await?;
    Ok(Endpoint { stream })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn message_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = EndpointPath::from_path(dir.path().join("test.sock"));

        let mut listener = Listener::bind(&path).unwrap();
        let client = connect(&path).await.unwrap();

        let server_end = listener.accept().await.unwrap();
        let (mut server_reader, mut server_writer) = server_end.split();
        let (mut client_reader, mut client_writer) = client.split();

        client_writer.write_message(b"hello").await.unwrap();
        assert_eq!(
            server_reader.next_message().await.unwrap().unwrap(),
            b"hello"
        );

        server_writer.write_message(b"world").await.unwrap();
        assert_eq!(
            client_reader.next_message().await.unwrap().unwrap(),
            b"world"
        );

        drop(client_writer);
        drop(client_reader);
        assert!(server_reader.next_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = EndpointPath::from_path(dir.path().join("test.sock"));

        let first = Listener::bind(&path).unwrap();
        drop(first);
        // The socket file is left behind; a rebind must clear it.
        Listener::bind(&path).unwrap();
    }
}
