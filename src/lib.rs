#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

//! A minimal PostgreSQL wire protocol (v3) client.
//!
//! Supports the startup handshake, SCRAM-SHA-256 authentication, and the
//! simple query protocol. SSL/TLS negotiation, MD5/Kerberos authentication,
//! COPY, the extended-query protocol and connection pooling are out of
//! scope.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;

pub use client::{ConnectionState, PgConnection, QueryResult};
pub use config::ConnectionConfig;
pub use error::{PgError, Result};
pub use protocol::messages::{BackendIdentity, ColumnDescription, FieldFormat};
