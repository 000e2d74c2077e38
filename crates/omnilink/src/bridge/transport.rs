//! Byte channel to the server process.
//!
//! The process manager owns the child; the bridge only receives its stdio
//! halves (or any other AsyncRead/AsyncWrite pair, e.g. an in-memory duplex
//! in tests).

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;

use crate::error::BridgeError;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read and write halves of the server connection.
pub struct Channel {
    pub(crate) reader: BoxedReader,
    pub(crate) writer: BoxedWriter,
}

impl Channel {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Take the piped stdout/stdin of a spawned server.
    pub fn from_child(child: &mut Child) -> Result<Self, BridgeError> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::transport("server stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::transport("server stdout not captured"))?;
        Ok(Self::new(stdout, stdin))
    }

    pub(crate) fn into_split(self) -> (BoxedReader, BoxedWriter) {
        (self.reader, self.writer)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").finish_non_exhaustive()
    }
}
