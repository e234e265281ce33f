//! Simple-query executor.
//!
//! One `execute` call is one full round trip: a Query frame out, then
//! RowDescription/DataRow/CommandComplete/ErrorResponse in, ending at
//! ReadyForQuery. Column and row order is preserved exactly as the backend
//! emitted it; values stay as decoded text with no type coercion.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{PgError, Result};
use crate::protocol::framing::{read_message, write_query};
use crate::protocol::messages::{BackendMessage, ColumnDescription};

/// Result of one simple-query round trip. Immutable once returned.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Column descriptors in backend order.
    pub columns: Vec<ColumnDescription>,
    /// Rows in backend order; `None` is SQL NULL.
    pub rows: Vec<Vec<Option<String>>>,
    /// Command tag from CommandComplete (e.g. `SELECT 1`), if any.
    pub command_tag: Option<String>,
}

/// Send `sql` as a simple-query message and collect the response.
///
/// A backend `ErrorResponse` aborts the query: partial results are
/// discarded, but the stream is drained to ReadyForQuery first so the
/// connection stays aligned for the next call.
pub async fn execute<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    sql: &str,
) -> Result<QueryResult> {
    tracing::debug!(sql, "executing simple query");
    write_query(stream, sql).await?;

    let mut result = QueryResult::default();
    let mut described = false;
    let mut server_error: Option<PgError> = None;

    loop {
        let raw = read_message(stream).await?;
        match BackendMessage::decode(&raw)? {
            BackendMessage::RowDescription(columns) => {
                if server_error.is_some() {
                    continue;
                }
                if described {
                    return Err(PgError::ProtocolOrder(
                        "second RowDescription within one simple query".into(),
                    ));
                }
                described = true;
                result.columns = columns;
            }
            BackendMessage::DataRow(row) => {
                if server_error.is_some() {
                    continue;
                }
                if !described {
                    return Err(PgError::ProtocolOrder(
                        "DataRow before RowDescription".into(),
                    ));
                }
                result.rows.push(row);
            }
            BackendMessage::CommandComplete(tag) => {
                if server_error.is_none() {
                    result.command_tag = Some(tag);
                }
            }
            BackendMessage::ErrorResponse(msg) => {
                // Keep draining; ReadyForQuery still follows the error.
                if server_error.is_none() {
                    server_error = Some(PgError::Server(msg));
                }
            }
            BackendMessage::ReadyForQuery(_) => {
                return match server_error {
                    Some(err) => Err(err),
                    None => {
                        tracing::debug!(
                            columns = result.columns.len(),
                            rows = result.rows.len(),
                            "query complete"
                        );
                        Ok(result)
                    }
                };
            }
            BackendMessage::Authentication(_) | BackendMessage::BackendKeyData(_) => {
                return Err(PgError::ProtocolOrder(format!(
                    "handshake message '{}' during query execution",
                    raw.tag as char
                )));
            }
            BackendMessage::ParameterStatus { name, value } => {
                tracing::trace!(%name, %value, "parameter status during query");
            }
            BackendMessage::NoticeResponse(msg) => {
                tracing::debug!("server notice: {msg}");
            }
            BackendMessage::Unknown { tag } => {
                tracing::trace!("ignoring unknown tag 0x{tag:02x} during query");
            }
        }
    }
}
