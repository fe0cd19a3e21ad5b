//! Transport: byte streams between local processes.
//!
//! Provides abstraction over:
//! - Unix Domain Sockets (Linux/macOS)
//! - Named Pipes (Windows)
//!
//! The protocol itself runs over any `AsyncRead`/`AsyncWrite` pair; these
//! types only produce such pairs for the common local case.

mod pipe;

pub use pipe::{generate_pipe_path, PipeListener, PipeReader, PipeStream, PipeWriter};
