//! Local pipes between a parent and its child processes.
//!
//! - Unix: Unix domain socket
//! - Windows: named pipe
//!
//! # Example
//!
//! ```no_run
//! use proclink::transport::{generate_pipe_path, PipeListener, PipeStream};
//!
//! # async fn example() -> proclink::Result<()> {
//! let path = generate_pipe_path();
//! let listener = PipeListener::bind(&path).await?;
//! let (accepted, connected) = tokio::join!(listener.accept(), PipeStream::connect(&path));
//! let (reader, writer) = accepted?.into_split();
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

/// Unique pipe path for this process.
///
/// - Unix: `/tmp/proclink-{pid}-{seq}-{nonce}.sock`
/// - Windows: `\\.\pipe\proclink-{pid}-{seq}-{nonce}`
pub fn generate_pipe_path() -> String {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let pid = std::process::id();
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let nonce = nonce();

    #[cfg(unix)]
    {
        format!("/tmp/proclink-{pid}-{seq}-{nonce:x}.sock")
    }

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\proclink-{pid}-{seq}-{nonce:x}")
    }
}

/// Time-derived value so paths from a restarted process with a reused pid
/// do not collide.
fn nonce() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos.wrapping_mul(0x517cc1b727220a95) >> 16
}

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::Path;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::{UnixListener, UnixStream};

    /// Listens on a Unix domain socket; the socket file is removed on drop.
    #[derive(Debug)]
    pub struct PipeListener {
        listener: UnixListener,
        path: String,
    }

    /// A connected pipe.
    #[derive(Debug)]
    pub struct PipeStream {
        stream: UnixStream,
    }

    /// Read half of a [`PipeStream`].
    pub type PipeReader = OwnedReadHalf;

    /// Write half of a [`PipeStream`].
    pub type PipeWriter = OwnedWriteHalf;

    impl PipeListener {
        /// Bind to `path`, replacing a stale socket file.
        pub async fn bind(path: &str) -> Result<Self> {
            if Path::new(path).exists() {
                std::fs::remove_file(path)?;
            }
            let listener = UnixListener::bind(path)?;
            tracing::debug!(path, "Pipe listening");
            Ok(Self {
                listener,
                path: path.to_string(),
            })
        }

        pub async fn accept(&self) -> Result<PipeStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(PipeStream { stream })
        }

        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl Drop for PipeListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    impl PipeStream {
        /// Connect to a listening pipe.
        pub async fn connect(path: &str) -> Result<Self> {
            let stream = UnixStream::connect(path).await?;
            Ok(Self { stream })
        }

        /// Split into halves suitable for a connection or connector.
        pub fn into_split(self) -> (PipeReader, PipeWriter) {
            self.stream.into_split()
        }
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    /// Named pipe server; each accept creates the next instance.
    #[derive(Debug)]
    pub struct PipeListener {
        path: String,
    }

    #[derive(Debug)]
    enum End {
        Server(NamedPipeServer),
        Client(NamedPipeClient),
    }

    /// A connected pipe.
    #[derive(Debug)]
    pub struct PipeStream {
        end: End,
    }

    /// Read half of a [`PipeStream`].
    pub type PipeReader = ReadHalf<PipeStream>;

    /// Write half of a [`PipeStream`].
    pub type PipeWriter = WriteHalf<PipeStream>;

    impl PipeListener {
        pub async fn bind(path: &str) -> Result<Self> {
            // Fails early if another server already owns the name.
            let _ = ServerOptions::new().first_pipe_instance(true).create(path)?;
            tracing::debug!(path, "Pipe listening");
            Ok(Self {
                path: path.to_string(),
            })
        }

        pub async fn accept(&self) -> Result<PipeStream> {
            let server = ServerOptions::new()
                .first_pipe_instance(false)
                .create(&self.path)?;
            server.connect().await?;
            Ok(PipeStream {
                end: End::Server(server),
            })
        }

        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl PipeStream {
        /// Connect to a listening pipe.
        pub async fn connect(path: &str) -> Result<Self> {
            let client = ClientOptions::new().open(path)?;
            Ok(Self {
                end: End::Client(client),
            })
        }

        /// Split into halves suitable for a connection or connector.
        pub fn into_split(self) -> (PipeReader, PipeWriter) {
            tokio::io::split(self)
        }
    }

    impl AsyncRead for PipeStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match &mut self.end {
                End::Server(pipe) => Pin::new(pipe).poll_read(cx, buf),
                End::Client(pipe) => Pin::new(pipe).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for PipeStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            match &mut self.end {
                End::Server(pipe) => Pin::new(pipe).poll_write(cx, buf),
                End::Client(pipe) => Pin::new(pipe).poll_write(cx, buf),
            }
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            match &mut self.end {
                End::Server(pipe) => Pin::new(pipe).poll_flush(cx),
                End::Client(pipe) => Pin::new(pipe).poll_flush(cx),
            }
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            match &mut self.end {
                End::Server(pipe) => Pin::new(pipe).poll_shutdown(cx),
                End::Client(pipe) => Pin::new(pipe).poll_shutdown(cx),
            }
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{PipeListener, PipeReader, PipeStream, PipeWriter};

#[cfg(windows)]
pub use windows_impl::{PipeListener, PipeReader, PipeStream, PipeWriter};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_path_format() {
        let path = generate_pipe_path();
        let pid = std::process::id().to_string();
        assert!(path.contains(&pid));

        #[cfg(unix)]
        {
            assert!(path.starts_with("/tmp/proclink-"));
            assert!(path.ends_with(".sock"));
        }

        #[cfg(windows)]
        assert!(path.starts_with(r"\\.\pipe\proclink-"));
    }

    #[test]
    fn test_pipe_paths_unique() {
        let mut paths: Vec<String> = (0..32).map(|_| generate_pipe_path()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 32);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_accept_connect() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let path = generate_pipe_path();
        let listener = PipeListener::bind(&path).await.unwrap();
        let (accepted, connected) = tokio::join!(listener.accept(), PipeStream::connect(&path));

        let (_r, mut w) = connected.unwrap().into_split();
        let (mut r, _w) = accepted.unwrap().into_split();
        w.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(listener);
        assert!(!std::path::Path::new(&path).exists());
    }
}
