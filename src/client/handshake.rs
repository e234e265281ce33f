//! Startup-phase state machine.
//!
//! Drives the backend messages that follow the startup frame until
//! ReadyForQuery, delegating the SASL sub-exchange to a short-lived
//! [`ScramSession`] that is dropped when this loop returns.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::scram::{self, ScramSession};
use crate::auth::SCRAM_SHA_256;
use crate::config::ConnectionConfig;
use crate::error::{PgError, Result};
use crate::protocol::framing::{read_message, write_password_message};
use crate::protocol::messages::{AuthRequest, BackendIdentity, BackendMessage};

/// Everything the handshake learned about the session.
#[derive(Debug, Default)]
pub struct HandshakeSummary {
    /// Process id / secret key from BackendKeyData, if the server sent one.
    pub backend: Option<BackendIdentity>,
    /// ParameterStatus pairs in arrival order (server_version, TimeZone, ...).
    pub parameters: Vec<(String, String)>,
}

/// Run the post-startup handshake to ReadyForQuery.
///
/// Protocol ordering is enforced: query-phase messages before ReadyForQuery
/// are rejected, as is AuthenticationOk while a SASL exchange is still
/// unverified. Unknown tags are ignored for forward compatibility.
pub async fn run<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    config: &ConnectionConfig,
) -> Result<HandshakeSummary> {
    let mut summary = HandshakeSummary::default();
    let mut session: Option<ScramSession> = None;

    loop {
        let raw = read_message(stream).await?;
        match BackendMessage::decode(&raw)? {
            BackendMessage::Authentication(req) => {
                handle_auth_request(stream, config, &mut session, req).await?;
            }
            BackendMessage::ParameterStatus { name, value } => {
                tracing::trace!(%name, %value, "parameter status");
                summary.parameters.push((name, value));
            }
            BackendMessage::BackendKeyData(identity) => {
                tracing::debug!(pid = identity.process_id, "backend key data");
                summary.backend = Some(identity);
            }
            BackendMessage::ErrorResponse(msg) => return Err(PgError::Server(msg)),
            BackendMessage::ReadyForQuery(status) => {
                tracing::debug!(?status, "handshake complete");
                return Ok(summary);
            }
            BackendMessage::RowDescription(_)
            | BackendMessage::DataRow(_)
            | BackendMessage::CommandComplete(_) => {
                return Err(PgError::ProtocolOrder(format!(
                    "query-result message '{}' during connection handshake",
                    raw.tag as char
                )));
            }
            BackendMessage::NoticeResponse(msg) => {
                tracing::debug!("server notice during handshake: {msg}");
            }
            BackendMessage::Unknown { tag } => {
                tracing::trace!("ignoring unknown tag 0x{tag:02x} during handshake");
            }
        }
    }
}

async fn handle_auth_request<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    config: &ConnectionConfig,
    session: &mut Option<ScramSession>,
    req: AuthRequest,
) -> Result<()> {
    match req {
        AuthRequest::Ok => {
            // Valid with no SASL exchange at all, or after one reached Verified.
            match session.take() {
                None => {}
                Some(s) if s.is_verified() => {}
                Some(s) => {
                    return Err(PgError::ProtocolOrder(format!(
                        "AuthenticationOk before SASL exchange completed (state: {:?})",
                        s.state()
                    )));
                }
            }
            tracing::debug!("authentication ok");
            Ok(())
        }
        AuthRequest::Sasl(mechanisms) => {
            if session.is_some() {
                return Err(PgError::ProtocolOrder("repeated SASL offer".into()));
            }
            if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                return Err(PgError::Auth(format!(
                    "server does not offer {SCRAM_SHA_256}: {mechanisms:?}"
                )));
            }
            let mut s = ScramSession::new(&config.user);
            let initial = s.initial_response()?;
            write_password_message(stream, &initial).await?;
            *session = Some(s);
            Ok(())
        }
        AuthRequest::SaslContinue(data) => {
            let Some(s) = session.as_mut() else {
                return Err(PgError::ProtocolOrder(
                    "SASLContinue without a SASL exchange in progress".into(),
                ));
            };
            let server_first = scram::sasl_text(&data)?;
            let client_final = s.respond_to_server_first(&config.password, &server_first)?;
            write_password_message(stream, client_final.as_bytes()).await?;
            Ok(())
        }
        AuthRequest::SaslFinal(data) => {
            let Some(s) = session.as_mut() else {
                return Err(PgError::ProtocolOrder(
                    "SASLFinal without a SASL exchange in progress".into(),
                ));
            };
            let server_final = scram::sasl_text(&data)?;
            s.verify_server_final(&server_final)
        }
        other => Err(PgError::Auth(format!(
            "unsupported authentication method: {}",
            other.describe()
        ))),
    }
}
