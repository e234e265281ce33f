//! Authentication mechanisms for PostgreSQL connections.
//!
//! Only **SCRAM-SHA-256** is implemented (the channel-binding `-PLUS`
//! variant is never negotiated). The other methods PostgreSQL can request
//! are recognized by name in [`crate::protocol::messages::AuthRequest`] so
//! the handshake can reject them with a useful error:
//!
//! - Cleartext password (insecure over plain TCP)
//! - MD5 (deprecated)
//! - GSSAPI / Kerberos / SSPI

pub mod scram;

pub use scram::{ScramSession, ScramState};

/// The one SASL mechanism this client negotiates.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
