//! PostgreSQL wire protocol implementation.
//!
//! This module provides low-level primitives for:
//! - Reading and writing PostgreSQL frontend/backend frames ([`framing`])
//! - Decoding backend frames into typed messages ([`messages`])
//!
//! # Wire Protocol Overview
//!
//! PostgreSQL uses a message-based protocol where each message consists of:
//! - 1 byte: message type tag
//! - 4 bytes: big-endian message length (including these 4 bytes)
//! - N bytes: message payload
//!
//! Exception: the startup message omits the type tag.
//!
//! Two string encodings coexist inside payloads and are never interchangeable:
//! null-terminated cstrings for identifiers (startup parameters, SASL
//! mechanism names, column names) and `int32`-length-prefixed fields (with
//! `-1` meaning NULL) for query-result values.

pub mod framing;
pub mod messages;

pub use framing::{PROTOCOL_VERSION, RawMessage};
pub use messages::{
    AuthRequest, BackendIdentity, BackendMessage, ColumnDescription, FieldFormat,
    TransactionStatus,
};
