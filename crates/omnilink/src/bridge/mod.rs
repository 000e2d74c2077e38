//! Wire layer between the bridge and the server process.
//!
//! - **protocol**: Request / Response / Event types and inbound classification
//! - **codec**: Content-Length framing for AsyncRead/AsyncWrite
//! - **transport**: the read/write channel handed over by the process manager

pub mod codec;
pub mod protocol;
pub mod transport;
