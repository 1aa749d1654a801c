//! IPC bridge between a service client and its host process.
//!
//! This module provides the wire protocol and codec for communication between
//! the client (parent) and the host subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Response)
//! - **codec**: Newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
