//! Windows rendition of the control endpoint: a per-user message-mode
//! named pipe with an explicit DACL.

use std::fmt;
use std::io;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, PipeMode, ServerOptions};

use super::security::PipeSecurity;

/// Largest client message accepted in one pipe read.
const MAX_MESSAGE: usize = 64 * 1024;

/// Name of the per-user control pipe.
#[derive(Debug, Clone)]
pub struct EndpointPath(String);

impl EndpointPath {
    /// The well-known per-user pipe name. Scoping it by username keeps
    /// separate interactive sessions on one machine from colliding.
    pub fn per_user() -> Self {
        let user = std::env::var("USERNAME").unwrap_or_else(|_| "unknown".to_string());
        Self(format!(r"\\.\pipe\{user}\PIME\Launcher"))
    }

    /// An explicit pipe name, mainly for tests.
    pub fn from_path(path: impl Into<String>) -> Self {
        Self(path.into())
    }
}

impl fmt::Display for EndpointPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

trait PipeStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> PipeStream for T {}

/// The listening end of the control pipe. A fresh server instance is
/// armed ahead of every accept so no connect attempt finds the name
/// missing.
pub struct Listener {
    path: String,
    security: PipeSecurity,
    next: Option<NamedPipeServer>,
}

impl Listener {
    /// Create the first pipe instance. Failure here is fatal to the
    /// broker; in particular, another running instance already owns the
    /// name.
    pub fn bind(path: &EndpointPath) -> Result<Self> {
        let security =
            PipeSecurity::broker_default().context("building pipe security attributes")?;
        let first = create_instance(&path.0, &security, true)
            .with_context(|| format!("binding control pipe {}", path.0))?;
        Ok(Self {
            path: path.0.clone(),
            security,
            next: Some(first),
        })
    }

    pub async fn accept(&mut self) -> io::Result<Endpoint> {
        let server = match self.next.take() {
            Some(server) => server,
            None => create_instance(&self.path, &self.security, false)?,
        };
        server.connect().await?;
        self.next = Some(create_instance(&self.path, &self.security, false)?);
        Ok(Endpoint {
            inner: Box::new(server),
        })
    }
}

fn create_instance(
    path: &str,
    security: &PipeSecurity,
    first: bool,
) -> io::Result<NamedPipeServer> {
    let mut options = ServerOptions::new();
    options
        .pipe_mode(PipeMode::Message)
        .reject_remote_clients(true)
        .first_pipe_instance(first);
    // SAFETY: the security attributes outlive the call; the kernel
    // copies the descriptor into the pipe object.
    unsafe { options.create_with_security_attributes_raw(path, security.attributes_ptr()) }
}

/// One connected client channel.
pub struct Endpoint {
    inner: Box<dyn PipeStream>,
}

impl Endpoint {
    pub fn split(self) -> (MessageReader, MessageWriter) {
        let (read, write) = tokio::io::split(self.inner);
        (
            MessageReader {
                inner: Box::new(read),
            },
            MessageWriter {
                inner: Box::new(write),
            },
        )
    }
}

pub struct MessageReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
}

impl MessageReader {
    /// Read one pipe message. `None` once the peer has gone away.
    pub async fn next_message(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_MESSAGE];
        match self.inner.read(&mut buf).await {
            Ok(0) => Ok(None),
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(None),
            Err(err) => Err(err),
        }
    }
}

pub struct MessageWriter {
    inner: Box<dyn AsyncWrite + Send + Unpin>,
}

impl MessageWriter {
    /// Write one message. In message mode a single write is delivered
    /// as a single message.
    pub async fn write_message(&mut self, payload: &[u8]) -> io::Result<()> {
        self.inner.write_all(payload).await
    }
}

/// Connect to a broker listening at `path` (used by `--quit`).
pub async fn connect(path: &EndpointPath) -> io::Result<Endpoint> {
    let client = ClientOptions::new().open(&path.0)?;
    Ok(Endpoint {
        inner: Box::new(client),
    })
}
