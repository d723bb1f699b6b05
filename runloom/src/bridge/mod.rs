//! IPC bridge for server-worker communication.
//!
//! This module provides the wire protocol, codec, and transport for
//! communication between the orchestrator (parent) and worker subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Message types (ControlRequest/Response, SlotRequest/Response)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite
//! - **transport**: Unix domain socket allocation per worker slot

pub mod codec;
pub mod protocol;
pub mod transport;
