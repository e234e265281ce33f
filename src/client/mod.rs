//! PostgreSQL connection facade.
//!
//! # Architecture
//!
//! ```text
//! PgConnection (facade, serialization lock, lifecycle state)
//!   |- handshake::run   startup + authentication to ReadyForQuery
//!   |     '- ScramSession   SASL sub-exchange (short-lived)
//!   '- query::execute   one simple-query round trip
//! ```
//!
//! Both phases run on the same stream through the same frame codec
//! ([`crate::protocol::framing`]). The protocol is half-duplex: at most one
//! request is outstanding per connection, enforced by the facade's mutex.

mod connection;
mod handshake;
mod query;

pub use connection::{ConnectionState, PgConnection};
pub use handshake::HandshakeSummary;
pub use query::QueryResult;
