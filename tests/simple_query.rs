//! End-to-end tests against a scripted mock backend on loopback TCP.
//!
//! The mock speaks just enough of the server side of the protocol to drive
//! the client through startup, a real SCRAM-SHA-256 exchange (computed with
//! the same crypto primitives, not canned bytes), and simple queries.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use hmac::{Hmac, Mac};
use pgwire_client::{ConnectionConfig, ConnectionState, PgConnection};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PASSWORD: &str = "secret";
const SALT: &[u8] = b"0123456789abcdef";
const ITERATIONS: u32 = 4096;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

fn config(port: u16) -> ConnectionConfig {
    ConnectionConfig {
        host: "127.0.0.1".into(),
        port,
        user: "postgres".into(),
        password: PASSWORD.into(),
        database: "movie".into(),
        application_name: None,
    }
}

// ---------------------------------------------------------------------------
// Mock backend plumbing
// ---------------------------------------------------------------------------

fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&((payload.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn auth_frame(code: i32, rest: &[u8]) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(rest);
    frame(b'R', &payload)
}

fn error_frame(message: &str, sqlstate: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(b'M');
    payload.extend_from_slice(message.as_bytes());
    payload.push(0);
    payload.push(b'C');
    payload.extend_from_slice(sqlstate.as_bytes());
    payload.push(0);
    payload.push(0);
    frame(b'E', &payload)
}

fn row_description_frame(names: &[&str]) -> Vec<u8> {
    let mut payload = (names.len() as i16).to_be_bytes().to_vec();
    for name in names {
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&0i32.to_be_bytes()); // table oid
        payload.extend_from_slice(&0i16.to_be_bytes()); // column attr
        payload.extend_from_slice(&23i32.to_be_bytes()); // int4
        payload.extend_from_slice(&4i16.to_be_bytes()); // type size
        payload.extend_from_slice(&(-1i32).to_be_bytes()); // type modifier
        payload.extend_from_slice(&0i16.to_be_bytes()); // text format
    }
    frame(b'T', &payload)
}

fn data_row_frame(values: &[Option<&str>]) -> Vec<u8> {
    let mut payload = (values.len() as i16).to_be_bytes().to_vec();
    for v in values {
        match v {
            None => payload.extend_from_slice(&(-1i32).to_be_bytes()),
            Some(s) => {
                payload.extend_from_slice(&(s.len() as i32).to_be_bytes());
                payload.extend_from_slice(s.as_bytes());
            }
        }
    }
    frame(b'D', &payload)
}

fn command_complete_frame(tag: &str) -> Vec<u8> {
    let mut payload = tag.as_bytes().to_vec();
    payload.push(0);
    frame(b'C', &payload)
}

fn ready_frame() -> Vec<u8> {
    frame(b'Z', b"I")
}

/// Read the untagged startup message, returning its key/value pairs.
async fn read_startup(stream: &mut TcpStream) -> Vec<(String, String)> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = i32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await.unwrap();

    let version = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    assert_eq!(version, 196608, "protocol version must be 3.0");

    let mut params = Vec::new();
    let mut rest = &body[4..];
    while rest[0] != 0 {
        let k_end = rest.iter().position(|&b| b == 0).unwrap();
        let key = String::from_utf8(rest[..k_end].to_vec()).unwrap();
        rest = &rest[k_end + 1..];
        let v_end = rest.iter().position(|&b| b == 0).unwrap();
        let value = String::from_utf8(rest[..v_end].to_vec()).unwrap();
        rest = &rest[v_end + 1..];
        params.push((key, value));
    }
    params
}

/// Read one tagged frontend frame.
async fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut hdr = [0u8; 5];
    stream.read_exact(&mut hdr).await.unwrap();
    let len = i32::from_be_bytes([hdr[1], hdr[2], hdr[3], hdr[4]]) as usize;
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await.unwrap();
    (hdr[0], body)
}

async fn read_query(stream: &mut TcpStream) -> String {
    let (tag, mut body) = read_frame(stream).await;
    assert_eq!(tag, b'Q');
    assert_eq!(body.pop(), Some(0));
    String::from_utf8(body).unwrap()
}

fn hmac(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).unwrap();
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut s1 = salt.to_vec();
    s1.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac(password, &s1);
    let mut out = u.clone();
    for _ in 1..iterations {
        u = hmac(password, &u);
        for (o, x) in out.iter_mut().zip(u.iter()) {
            *o ^= *x;
        }
    }
    out
}

/// Drive the server side of a SCRAM-SHA-256 exchange, verifying the client
/// proof. `tamper_signature` corrupts the server signature before sending.
async fn serve_scram(stream: &mut TcpStream, tamper_signature: bool) {
    stream
        .write_all(&auth_frame(10, b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0"))
        .await
        .unwrap();

    // SASLInitialResponse: mechanism cstring + int32 length + client-first
    let (tag, body) = read_frame(stream).await;
    assert_eq!(tag, b'p');
    let nul = body.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&body[..nul], b"SCRAM-SHA-256");
    let declared = i32::from_be_bytes([body[nul + 1], body[nul + 2], body[nul + 3], body[nul + 4]]);
    let client_first = String::from_utf8(body[nul + 5..].to_vec()).unwrap();
    assert_eq!(declared as usize, client_first.len());
    let client_first_bare = client_first.strip_prefix("n,,").unwrap().to_string();
    assert!(client_first_bare.starts_with("n=postgres,r="));
    let client_nonce = client_first_bare.split("r=").nth(1).unwrap().to_string();

    let combined = format!("{client_nonce}3rfcNHYJY1ZVvWVs7j");
    let server_first = format!("r={combined},s={},i={ITERATIONS}", B64.encode(SALT));
    stream
        .write_all(&auth_frame(11, server_first.as_bytes()))
        .await
        .unwrap();

    // SASLResponse: client-final-message
    let (tag, body) = read_frame(stream).await;
    assert_eq!(tag, b'p');
    let client_final = String::from_utf8(body).unwrap();
    assert!(client_final.starts_with(&format!("c=biws,r={combined},p=")));
    let without_proof = client_final.split(",p=").next().unwrap();

    let auth_message = format!("{client_first_bare},{server_first},{without_proof}");
    let salted = hi(PASSWORD.as_bytes(), SALT, ITERATIONS);
    let client_key = hmac(&salted, b"Client Key");
    let stored_key = Sha256::digest(&client_key);
    let client_sig = hmac(stored_key.as_slice(), auth_message.as_bytes());
    let proof = B64
        .decode(client_final.split(",p=").nth(1).unwrap())
        .unwrap();
    let recovered: Vec<u8> = proof.iter().zip(client_sig.iter()).map(|(a, b)| a ^ b).collect();
    assert_eq!(recovered, client_key, "client proof did not verify");

    let server_key = hmac(&salted, b"Server Key");
    let mut server_sig = hmac(&server_key, auth_message.as_bytes());
    if tamper_signature {
        server_sig[0] ^= 0xFF;
    }
    stream
        .write_all(&auth_frame(12, format!("v={}", B64.encode(&server_sig)).as_bytes()))
        .await
        .unwrap();
    stream.write_all(&auth_frame(0, &[])).await.unwrap();
}

/// Accept one connection and run it through startup + SCRAM to ReadyForQuery.
async fn serve_handshake(listener: TcpListener, tamper_signature: bool) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();
    let params = read_startup(&mut stream).await;
    assert!(params.contains(&("user".to_string(), "postgres".to_string())));
    assert!(params.contains(&("database".to_string(), "movie".to_string())));
    assert!(params.contains(&("client_encoding".to_string(), "UTF8".to_string())));

    serve_scram(&mut stream, tamper_signature).await;
    if tamper_signature {
        return stream; // client bails before ReadyForQuery
    }

    stream
        .write_all(&frame(b'S', b"server_version\x0016.3\x00"))
        .await
        .unwrap();
    let mut key = 7777i32.to_be_bytes().to_vec();
    key.extend_from_slice(&424242i32.to_be_bytes());
    stream.write_all(&frame(b'K', &key)).await.unwrap();
    stream.write_all(&ready_frame()).await.unwrap();
    stream
}

async fn bind_mock() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn end_to_end_scram_and_select_one() {
    init_tracing();
    let (listener, port) = bind_mock().await;

    let server = tokio::spawn(async move {
        let mut stream = serve_handshake(listener, false).await;

        let sql = read_query(&mut stream).await;
        assert_eq!(sql, "SELECT 1");
        let mut reply = row_description_frame(&["?column?"]);
        reply.extend_from_slice(&data_row_frame(&[Some("1")]));
        reply.extend_from_slice(&command_complete_frame("SELECT 1"));
        reply.extend_from_slice(&ready_frame());
        stream.write_all(&reply).await.unwrap();
    });

    let conn = PgConnection::new(config(port));
    conn.connect().await.unwrap();
    assert_eq!(conn.state().await, ConnectionState::Ready);

    let identity = conn.backend_identity().await.unwrap();
    assert_eq!(identity.process_id, 7777);
    assert_eq!(identity.secret_key, 424242);
    assert_eq!(conn.parameter("server_version").await.as_deref(), Some("16.3"));

    let result = conn.execute("SELECT 1").await.unwrap();
    assert_eq!(result.columns.len(), 1);
    assert_eq!(result.columns[0].name, "?column?");
    assert_eq!(result.rows, vec![vec![Some("1".to_string())]]);
    assert_eq!(result.command_tag.as_deref(), Some("SELECT 1"));

    conn.close().await;
    assert_eq!(conn.state().await, ConnectionState::Closed);
    server.await.unwrap();
}

#[tokio::test]
async fn null_fields_decode_to_none() {
    init_tracing();
    let (listener, port) = bind_mock().await;

    let server = tokio::spawn(async move {
        let mut stream = serve_handshake(listener, false).await;
        let _ = read_query(&mut stream).await;
        let mut reply = row_description_frame(&["a", "b"]);
        reply.extend_from_slice(&data_row_frame(&[None, Some("")]));
        reply.extend_from_slice(&command_complete_frame("SELECT 1"));
        reply.extend_from_slice(&ready_frame());
        stream.write_all(&reply).await.unwrap();
    });

    let conn = PgConnection::new(config(port));
    conn.connect().await.unwrap();
    let result = conn.execute("SELECT NULL, ''").await.unwrap();
    // NULL is None; the empty string stays a value
    assert_eq!(result.rows, vec![vec![None, Some(String::new())]]);
    server.await.unwrap();
}

#[tokio::test]
async fn tampered_server_signature_faults_the_connection() {
    init_tracing();
    let (listener, port) = bind_mock().await;

    let server = tokio::spawn(async move {
        let _stream = serve_handshake(listener, true).await;
    });

    let conn = PgConnection::new(config(port));
    let err = conn.connect().await.unwrap_err();
    assert!(err.is_auth(), "got {err:?}");
    assert_eq!(conn.state().await, ConnectionState::Faulted);

    // a faulted connection must not execute
    let err = conn.execute("SELECT 1").await.unwrap_err();
    assert!(err.is_protocol_order());
    let _ = server.await;
}

#[tokio::test]
async fn server_error_during_query_leaves_connection_usable() {
    init_tracing();
    let (listener, port) = bind_mock().await;

    let server = tokio::spawn(async move {
        let mut stream = serve_handshake(listener, false).await;

        let _ = read_query(&mut stream).await;
        let mut reply = error_frame("relation \"missing\" does not exist", "42P01");
        reply.extend_from_slice(&ready_frame());
        stream.write_all(&reply).await.unwrap();

        let sql = read_query(&mut stream).await;
        assert_eq!(sql, "SELECT 1");
        let mut reply = row_description_frame(&["?column?"]);
        reply.extend_from_slice(&data_row_frame(&[Some("1")]));
        reply.extend_from_slice(&command_complete_frame("SELECT 1"));
        reply.extend_from_slice(&ready_frame());
        stream.write_all(&reply).await.unwrap();
    });

    let conn = PgConnection::new(config(port));
    conn.connect().await.unwrap();

    let err = conn.execute("SELECT * FROM missing").await.unwrap_err();
    assert!(err.is_server());
    assert!(err.to_string().contains("42P01"));
    assert_eq!(conn.state().await, ConnectionState::Ready);

    let result = conn.execute("SELECT 1").await.unwrap();
    assert_eq!(result.rows, vec![vec![Some("1".to_string())]]);
    server.await.unwrap();
}

#[tokio::test]
async fn data_row_before_ready_for_query_is_protocol_order_error() {
    init_tracing();
    let (listener, port) = bind_mock().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_startup(&mut stream).await;
        serve_scram(&mut stream, false).await;
        // query-result message before ReadyForQuery: ordering violation
        stream
            .write_all(&data_row_frame(&[Some("1")]))
            .await
            .unwrap();
    });

    let conn = PgConnection::new(config(port));
    let err = conn.connect().await.unwrap_err();
    assert!(err.is_protocol_order(), "got {err:?}");
    assert_eq!(conn.state().await, ConnectionState::Faulted);
    let _ = server.await;
}

#[tokio::test]
async fn connect_while_ready_is_rejected() {
    init_tracing();
    let (listener, port) = bind_mock().await;

    let server = tokio::spawn(async move {
        let _stream = serve_handshake(listener, false).await;
        // hold the socket open while the client tries to reconnect
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let conn = PgConnection::new(config(port));
    conn.connect().await.unwrap();
    let err = conn.connect().await.unwrap_err();
    assert!(err.is_protocol_order());
    // the failed connect must not disturb the ready connection
    assert_eq!(conn.state().await, ConnectionState::Ready);
    let _ = server.await;
}

#[tokio::test]
async fn close_during_in_flight_query_fails_it_instead_of_hanging() {
    init_tracing();
    let (listener, port) = bind_mock().await;

    let server = tokio::spawn(async move {
        let mut stream = serve_handshake(listener, false).await;
        let _ = read_query(&mut stream).await;
        // never answer; the query must be failed by close(), not the server
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let conn = std::sync::Arc::new(PgConnection::new(config(port)));
    conn.connect().await.unwrap();

    let conn2 = conn.clone();
    let query = tokio::spawn(async move { conn2.execute("SELECT pg_sleep(60)").await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    conn.close().await;

    let err = tokio::time::timeout(Duration::from_secs(2), query)
        .await
        .expect("query must not hang after close")
        .unwrap()
        .unwrap_err();
    assert!(err.is_io(), "got {err:?}");
    assert_eq!(conn.state().await, ConnectionState::Closed);
    server.abort();
}
