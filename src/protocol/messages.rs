//! Decoded backend messages.
//!
//! [`BackendMessage`] is a closed tagged union over every backend tag this
//! client understands, so the handshake and query loops dispatch with an
//! exhaustive `match` instead of falling through on raw tag bytes. Tags
//! outside the set decode to [`BackendMessage::Unknown`] and are ignored by
//! callers for forward compatibility.

use bytes::{Buf, Bytes};

use crate::error::{PgError, Result};
use crate::protocol::framing::{RawMessage, get_cstring};

/// Process id and secret key from BackendKeyData.
///
/// Retained for the connection's lifetime; needed only for out-of-band
/// cancellation, which this client does not issue itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendIdentity {
    pub process_id: i32,
    pub secret_key: i32,
}

/// Transaction status byte carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// 'I' - not in a transaction block.
    Idle,
    /// 'T' - inside a transaction block.
    InTransaction,
    /// 'E' - in a failed transaction block.
    Failed,
}

/// Wire format of a result field: 0 = text, 1 = binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    Text,
    Binary,
}

/// One column descriptor from a RowDescription message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: i32,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: FieldFormat,
}

/// Authentication request sub-codes (int32 inside an 'R' payload).
///
/// Only `Ok` and the SASL family are implemented; the other methods are
/// recognized so the handshake can name them when rejecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    KerberosV5,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    ScmCredential,
    Gss,
    GssContinue,
    Sspi,
    /// Offered SASL mechanism names (decoded cstring list).
    Sasl(Vec<String>),
    /// server-first-message bytes.
    SaslContinue(Bytes),
    /// server-final-message bytes.
    SaslFinal(Bytes),
    Other(i32),
}

impl AuthRequest {
    /// Human-readable method name for error messages.
    pub fn describe(&self) -> String {
        match self {
            AuthRequest::Ok => "Ok".into(),
            AuthRequest::KerberosV5 => "KerberosV5".into(),
            AuthRequest::CleartextPassword => "CleartextPassword".into(),
            AuthRequest::Md5Password { .. } => "MD5Password".into(),
            AuthRequest::ScmCredential => "SCMCredential".into(),
            AuthRequest::Gss => "GSS".into(),
            AuthRequest::GssContinue => "GSSContinue".into(),
            AuthRequest::Sspi => "SSPI".into(),
            AuthRequest::Sasl(_) => "SASL".into(),
            AuthRequest::SaslContinue(_) => "SASLContinue".into(),
            AuthRequest::SaslFinal(_) => "SASLFinal".into(),
            AuthRequest::Other(code) => format!("Unknown({code})"),
        }
    }
}

/// A backend message, decoded from a [`RawMessage`].
#[derive(Debug, Clone)]
pub enum BackendMessage {
    /// 'R'
    Authentication(AuthRequest),
    /// 'S'
    ParameterStatus { name: String, value: String },
    /// 'K'
    BackendKeyData(BackendIdentity),
    /// 'Z'
    ReadyForQuery(TransactionStatus),
    /// 'T'
    RowDescription(Vec<ColumnDescription>),
    /// 'D' - one value per field, `None` for SQL NULL (wire length -1).
    DataRow(Vec<Option<String>>),
    /// 'C' - command tag such as `SELECT 1`.
    CommandComplete(String),
    /// 'E' - formatted server error text.
    ErrorResponse(String),
    /// 'N' - formatted server notice text.
    NoticeResponse(String),
    /// Any tag this client does not understand.
    Unknown { tag: u8 },
}

impl BackendMessage {
    pub fn decode(raw: &RawMessage) -> Result<BackendMessage> {
        let payload = raw.payload.clone();
        match raw.tag {
            b'R' => Ok(BackendMessage::Authentication(parse_auth_request(payload)?)),
            b'S' => parse_parameter_status(payload),
            b'K' => parse_backend_key_data(payload),
            b'Z' => parse_ready_for_query(payload),
            b'T' => Ok(BackendMessage::RowDescription(parse_row_description(
                payload,
            )?)),
            b'D' => Ok(BackendMessage::DataRow(parse_data_row(payload)?)),
            b'C' => {
                let mut p = payload;
                Ok(BackendMessage::CommandComplete(get_cstring(&mut p)?))
            }
            b'E' => Ok(BackendMessage::ErrorResponse(parse_error_fields(&payload))),
            b'N' => Ok(BackendMessage::NoticeResponse(parse_error_fields(&payload))),
            tag => Ok(BackendMessage::Unknown { tag }),
        }
    }
}

fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(PgError::Framing(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

fn parse_auth_request(mut payload: Bytes) -> Result<AuthRequest> {
    need(&payload, 4, "authentication request")?;
    let code = payload.get_i32();
    let req = match code {
        0 => AuthRequest::Ok,
        2 => AuthRequest::KerberosV5,
        3 => AuthRequest::CleartextPassword,
        5 => {
            need(&payload, 4, "md5 salt")?;
            let mut salt = [0u8; 4];
            payload.copy_to_slice(&mut salt);
            AuthRequest::Md5Password { salt }
        }
        6 => AuthRequest::ScmCredential,
        7 => AuthRequest::Gss,
        8 => AuthRequest::GssContinue,
        9 => AuthRequest::Sspi,
        10 => AuthRequest::Sasl(parse_mechanism_list(payload)?),
        11 => AuthRequest::SaslContinue(payload),
        12 => AuthRequest::SaslFinal(payload),
        other => AuthRequest::Other(other),
    };
    Ok(req)
}

/// Decode a SASL mechanism offer: cstrings, list ended by an empty string.
fn parse_mechanism_list(mut payload: Bytes) -> Result<Vec<String>> {
    let mut mechanisms = Vec::new();
    while payload.has_remaining() {
        let name = get_cstring(&mut payload)?;
        if name.is_empty() {
            break;
        }
        mechanisms.push(name);
    }
    Ok(mechanisms)
}

fn parse_parameter_status(mut payload: Bytes) -> Result<BackendMessage> {
    let name = get_cstring(&mut payload)?;
    let value = get_cstring(&mut payload)?;
    Ok(BackendMessage::ParameterStatus { name, value })
}

fn parse_backend_key_data(mut payload: Bytes) -> Result<BackendMessage> {
    need(&payload, 8, "backend key data")?;
    Ok(BackendMessage::BackendKeyData(BackendIdentity {
        process_id: payload.get_i32(),
        secret_key: payload.get_i32(),
    }))
}

fn parse_ready_for_query(mut payload: Bytes) -> Result<BackendMessage> {
    need(&payload, 1, "ready-for-query status")?;
    let status = match payload.get_u8() {
        b'I' => TransactionStatus::Idle,
        b'T' => TransactionStatus::InTransaction,
        b'E' => TransactionStatus::Failed,
        other => {
            return Err(PgError::Framing(format!(
                "unknown transaction status byte: 0x{other:02x}"
            )));
        }
    };
    Ok(BackendMessage::ReadyForQuery(status))
}

fn parse_row_description(mut payload: Bytes) -> Result<Vec<ColumnDescription>> {
    need(&payload, 2, "row description")?;
    let field_count = payload.get_i16();
    let mut columns = Vec::with_capacity(field_count.max(0) as usize);
    for _ in 0..field_count {
        let name = get_cstring(&mut payload)?;
        need(&payload, 18, "column descriptor")?;
        columns.push(ColumnDescription {
            name,
            table_oid: payload.get_i32(),
            column_attr: payload.get_i16(),
            type_oid: payload.get_i32(),
            type_size: payload.get_i16(),
            type_modifier: payload.get_i32(),
            format: if payload.get_i16() == 0 {
                FieldFormat::Text
            } else {
                FieldFormat::Binary
            },
        });
    }
    Ok(columns)
}

fn parse_data_row(mut payload: Bytes) -> Result<Vec<Option<String>>> {
    need(&payload, 2, "data row")?;
    let field_count = payload.get_i16();
    let mut row = Vec::with_capacity(field_count.max(0) as usize);
    for _ in 0..field_count {
        need(&payload, 4, "field length")?;
        let len = payload.get_i32();
        if len == -1 {
            row.push(None);
        } else if len < 0 {
            return Err(PgError::Framing(format!("invalid field length: {len}")));
        } else {
            need(&payload, len as usize, "field value")?;
            let value = payload.split_to(len as usize);
            row.push(Some(String::from_utf8_lossy(&value).to_string()));
        }
    }
    Ok(row)
}

/// Flatten an ErrorResponse/NoticeResponse field list into one line.
///
/// Fields are `(code_byte, cstring)` pairs terminated by a zero byte;
/// only the message ('M') and SQLSTATE ('C') fields are surfaced.
fn parse_error_fields(payload: &[u8]) -> String {
    let mut b = payload;
    let mut msg = None;
    let mut sqlstate = None;

    while !b.is_empty() {
        let code = b[0];
        b = &b[1..];
        if code == 0 {
            break;
        }
        if let Some(pos) = b.iter().position(|&x| x == 0) {
            let s = String::from_utf8_lossy(&b[..pos]).to_string();
            if code == b'M' {
                msg = Some(s);
            } else if code == b'C' {
                sqlstate = Some(s);
            }
            b = &b[pos + 1..];
        } else {
            break;
        }
    }

    match (msg, sqlstate) {
        (Some(m), Some(c)) => format!("{m} (SQLSTATE {c})"),
        (Some(m), None) => m,
        _ => "unknown server error".to_string(),
    }
}
