//! End-to-end protocol tests against a scripted server.
//!
//! Each test owns both halves of an in-memory duplex stream: the engine
//! drives the client half while the test plays the server, byte for byte.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac_array;
use pg_proto::{
    AuthenticationMode, ConnectionBuilder, Error, Param, PgConnection, TextRows, Verbatim,
    negotiate_tls,
};
use sha2::Sha256;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

// ---------------------------------------------------------------------------
// Server-side scripting helpers

fn msg(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut m = vec![tag];
    m.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
    m.extend_from_slice(body);
    m
}

fn auth(code: i32, extra: &[u8]) -> Vec<u8> {
    let mut body = code.to_be_bytes().to_vec();
    body.extend_from_slice(extra);
    msg(b'R', &body)
}

fn ready() -> Vec<u8> {
    msg(b'Z', b"I")
}

fn key_data(process_id: i32, secret_key: i32) -> Vec<u8> {
    let mut body = process_id.to_be_bytes().to_vec();
    body.extend_from_slice(&secret_key.to_be_bytes());
    msg(b'K', &body)
}

fn parameter_status(name: &str, value: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(name.as_bytes());
    body.push(0);
    body.extend_from_slice(value.as_bytes());
    body.push(0);
    msg(b'S', &body)
}

fn row_description(names: &[&str]) -> Vec<u8> {
    let mut body = (names.len() as i16).to_be_bytes().to_vec();
    for name in names {
        body.extend_from_slice(name.as_bytes());
        body.push(0);
        body.extend_from_slice(&[0u8; 18]);
    }
    msg(b'T', &body)
}

fn data_row(columns: &[Option<&[u8]>]) -> Vec<u8> {
    let mut body = (columns.len() as i16).to_be_bytes().to_vec();
    for column in columns {
        match column {
            Some(value) => {
                body.extend_from_slice(&(value.len() as i32).to_be_bytes());
                body.extend_from_slice(value);
            }
            None => body.extend_from_slice(&(-1i32).to_be_bytes()),
        }
    }
    msg(b'D', &body)
}

fn command_complete(tag: &str) -> Vec<u8> {
    let mut body = tag.as_bytes().to_vec();
    body.push(0);
    msg(b'C', &body)
}

fn error_response(fields: &[(u8, &str)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (code, value) in fields {
        body.push(*code);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    msg(b'E', &body)
}

fn notice_response(fields: &[(u8, &str)]) -> Vec<u8> {
    let mut m = error_response(fields);
    m[0] = b'N';
    m
}

async fn read_frame(server: &mut DuplexStream) -> (u8, Vec<u8>) {
    let mut tag = [0u8; 1];
    server.read_exact(&mut tag).await.unwrap();
    let mut len = [0u8; 4];
    server.read_exact(&mut len).await.unwrap();
    let n = u32::from_be_bytes(len) as usize - 4;
    let mut body = vec![0u8; n];
    server.read_exact(&mut body).await.unwrap();
    (tag[0], body)
}

async fn read_startup(server: &mut DuplexStream) -> Vec<u8> {
    let mut len = [0u8; 4];
    server.read_exact(&mut len).await.unwrap();
    let n = u32::from_be_bytes(len) as usize - 4;
    let mut body = vec![0u8; n];
    server.read_exact(&mut body).await.unwrap();
    body
}

// ---------------------------------------------------------------------------
// SCRAM server-side arithmetic (RFC 5802), for the handshake test

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ---------------------------------------------------------------------------

#[tokio::test]
async fn startup_with_md5_then_simple_query() {
    let (client, mut server) = tokio::io::duplex(1 << 16);
    let salt = [0x12, 0x34, 0x56, 0x78];

    let client_task = async move {
        let mut conn = ConnectionBuilder::new("u")
            .auth(AuthenticationMode::Password("p".into()))
            .connect(client)
            .await
            .unwrap();
        assert_eq!(42, conn.process_id());
        assert_eq!(7, conn.secret_key());

        let res = conn
            .query_simple(&Verbatim, "SELECT 1, 2, 3", &[])
            .await
            .unwrap();
        assert_eq!(b"SELECT 3".as_slice(), res.command_tag());
        assert_eq!(3, res.rows_returned());
        assert_eq!(Some(3), res.rows_affected());
    };

    let server_task = async move {
        read_startup(&mut server).await;
        server.write_all(&auth(5, &salt)).await.unwrap();

        let (tag, body) = read_frame(&mut server).await;
        assert_eq!(b'p', tag);
        let inner = format!("{:x}", md5::compute(b"pu"));
        let mut outer = inner.into_bytes();
        outer.extend_from_slice(&salt);
        let mut expected = format!("md5{:x}", md5::compute(outer)).into_bytes();
        expected.push(0);
        assert_eq!(expected, body);

        server.write_all(&auth(0, &[])).await.unwrap();
        server.write_all(&key_data(42, 7)).await.unwrap();
        server
            .write_all(&parameter_status("client_encoding", "UTF8"))
            .await
            .unwrap();
        server.write_all(&ready()).await.unwrap();

        let (tag, body) = read_frame(&mut server).await;
        assert_eq!(b'Q', tag);
        assert_eq!(body, b"SELECT 1, 2, 3\0");

        server.write_all(&row_description(&["n"])).await.unwrap();
        for v in [b"1".as_slice(), b"2".as_slice(), b"3".as_slice()] {
            server.write_all(&data_row(&[Some(v)])).await.unwrap();
        }
        server.write_all(&command_complete("SELECT 3")).await.unwrap();
        server.write_all(&ready()).await.unwrap();
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn server_error_mid_query_leaves_connection_usable() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let mut conn = PgConnection::raw(client);

        let err = conn
            .query_simple(&Verbatim, "INSERT INTO t VALUES (1)", &[])
            .await
            .unwrap_err();
        match &err {
            Error::Server(e) => {
                assert_eq!("23505", e.code().unwrap());
                assert_eq!("ERROR", e.severity().unwrap());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.poisons_connection());

        // The error was drained to ReadyForQuery; the next query succeeds.
        let res = conn.query_simple(&Verbatim, "SELECT 1", &[]).await.unwrap();
        assert_eq!(b"SELECT 1".as_slice(), res.command_tag());
    };

    let server_task = async move {
        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'Q', tag);
        server.write_all(&row_description(&["n"])).await.unwrap();
        server.write_all(&data_row(&[Some(b"1".as_slice())])).await.unwrap();
        server
            .write_all(&error_response(&[
                (b'S', "ERROR"),
                (b'C', "23505"),
                (b'M', "duplicate key value violates unique constraint"),
            ]))
            .await
            .unwrap();
        server.write_all(&ready()).await.unwrap();

        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'Q', tag);
        server.write_all(&data_row(&[Some(b"1".as_slice())])).await.unwrap();
        server.write_all(&command_complete("SELECT 1")).await.unwrap();
        server.write_all(&ready()).await.unwrap();
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn ssl_refused() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let res = negotiate_tls(client, |s| async move {
            Ok::<DuplexStream, std::io::Error>(s)
        })
        .await;
        match res {
            Err(Error::SslNotSupported) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("upgrade should have been refused"),
        }
    };

    let server_task = async move {
        let mut request = [0u8; 8];
        server.read_exact(&mut request).await.unwrap();
        assert_eq!([0x00, 0x00, 0x00, 0x08, 0x04, 0xD2, 0x16, 0x2F], request);
        server.write_all(b"N").await.unwrap();
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn startup_with_scram_sha_256() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let conn = ConnectionBuilder::new("u")
            .auth(AuthenticationMode::Password("p".into()))
            .connect(client)
            .await
            .unwrap();
        assert_eq!(99, conn.process_id());
        assert_eq!(3, conn.secret_key());
    };

    let server_task = async move {
        read_startup(&mut server).await;
        server
            .write_all(&auth(10, b"SCRAM-SHA-256\0\0"))
            .await
            .unwrap();

        // SASLInitialResponse: mechanism, i32 length, client-first-message.
        let (tag, body) = read_frame(&mut server).await;
        assert_eq!(b'p', tag);
        let nul = body.iter().position(|&b| b == 0).unwrap();
        assert_eq!(b"SCRAM-SHA-256".as_slice(), &body[..nul]);
        let len = u32::from_be_bytes(body[nul + 1..nul + 5].try_into().unwrap()) as usize;
        let client_first =
            std::str::from_utf8(&body[nul + 5..nul + 5 + len]).unwrap().to_string();
        assert!(client_first.starts_with("n,,"));
        let client_first_bare = client_first[3..].to_string();
        let client_nonce = client_first_bare
            .split(',')
            .find_map(|f| f.strip_prefix("r="))
            .unwrap();

        let salt = b"0123456789abcdef";
        let iterations = 4096u32;
        let server_nonce = format!("{client_nonce}0a1b2c3d4e5f");
        let server_first = format!(
            "r={server_nonce},s={},i={iterations}",
            STANDARD.encode(salt)
        );
        server
            .write_all(&auth(11, server_first.as_bytes()))
            .await
            .unwrap();

        // SASLResponse: the whole body is the client-final-message.
        let (tag, body) = read_frame(&mut server).await;
        assert_eq!(b'p', tag);
        let client_final = std::str::from_utf8(&body).unwrap().to_string();
        let proof_at = client_final.find(",p=").unwrap();
        let client_final_without_proof = &client_final[..proof_at];

        let auth_message =
            format!("{client_first_bare},{server_first},{client_final_without_proof}");
        let salted = pbkdf2_hmac_array::<Sha256, 32>(b"p", salt, iterations);
        let server_key = hmac_sha256(&salted, b"Server Key");
        let signature = hmac_sha256(&server_key, auth_message.as_bytes());
        let server_final = format!("v={}", STANDARD.encode(signature));
        server
            .write_all(&auth(12, server_final.as_bytes()))
            .await
            .unwrap();

        server.write_all(&auth(0, &[])).await.unwrap();
        server.write_all(&key_data(99, 3)).await.unwrap();
        server.write_all(&ready()).await.unwrap();
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn sasl_without_supported_mechanism() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let err = ConnectionBuilder::new("u")
            .auth(AuthenticationMode::Password("p".into()))
            .connect(client)
            .await
            .unwrap_err();
        match &err {
            Error::UnsupportedSaslMechanism(offered) => {
                assert_eq!("SCRAM-SHA-256-PLUS", offered);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.poisons_connection());
    };

    let server_task = async move {
        read_startup(&mut server).await;
        let _ = server.write_all(&auth(10, b"SCRAM-SHA-256-PLUS\0\0")).await;
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn unknown_message_poisons_connection() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let mut conn = PgConnection::raw(client);
        let err = conn
            .query_simple(&Verbatim, "SELECT 1", &[])
            .await
            .unwrap_err();
        match &err {
            Error::UnexpectedMessage { reader, code } => {
                assert_eq!(&"read_simple_query", reader);
                assert_eq!(*code, b'!');
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.poisons_connection());
    };

    let server_task = async move {
        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'Q', tag);
        server.write_all(&row_description(&["n"])).await.unwrap();
        server.write_all(&data_row(&[Some(b"1".as_slice())])).await.unwrap();
        let _ = server.write_all(&msg(b'!', b"")).await;
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn copy_from_streams_and_returns_tag() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let mut conn = PgConnection::raw(client);
        let mut src = &b"1\talice\n2\tbob\n"[..];
        let res = conn
            .copy_from(&Verbatim, "COPY t FROM STDIN", &[], &mut src)
            .await
            .unwrap();
        assert_eq!(b"COPY 2".as_slice(), res.command_tag());
        assert_eq!(Some(2), res.rows_affected());
        assert_eq!(0, res.rows_returned());
    };

    let server_task = async move {
        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'Q', tag);
        // CopyInResponse: overall format 0, zero column formats.
        server.write_all(&msg(b'G', &[0, 0, 0])).await.unwrap();

        let mut received = Vec::new();
        loop {
            let (tag, body) = read_frame(&mut server).await;
            match tag {
                b'd' => received.extend_from_slice(&body),
                b'c' => break,
                other => panic!("unexpected client message {}", other as char),
            }
        }
        assert_eq!(received, b"1\talice\n2\tbob\n");

        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'S', tag);

        server.write_all(&command_complete("COPY 2")).await.unwrap();
        server.write_all(&ready()).await.unwrap();
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn copy_to_collects_frames() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let mut conn = PgConnection::raw(client);
        let mut dst = Vec::new();
        let res = conn
            .copy_to(&Verbatim, "COPY t TO STDOUT", &[], &mut dst)
            .await
            .unwrap();
        assert_eq!(b"COPY 2".as_slice(), res.command_tag());
        assert_eq!(dst, b"1\talice\n2\tbob\n");
    };

    let server_task = async move {
        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'Q', tag);
        server.write_all(&msg(b'H', &[0, 0, 0])).await.unwrap();
        server.write_all(&msg(b'd', b"1\talice\n")).await.unwrap();
        server.write_all(&msg(b'd', b"2\tbob\n")).await.unwrap();
        server.write_all(&msg(b'c', b"")).await.unwrap();
        server.write_all(&command_complete("COPY 2")).await.unwrap();
        server.write_all(&ready()).await.unwrap();
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn prepare_bind_execute_with_model() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let mut conn = PgConnection::raw(client);

        let columns = conn
            .prepare("stmt1", "SELECT id, name FROM users WHERE id > $1")
            .await
            .unwrap();
        assert_eq!(vec![b"id".to_vec(), b"name".to_vec()], columns);

        let (res, rows) = conn
            .bind_execute_with_model("stmt1", &[Param::Int4(0)], &columns, |cols| {
                assert_eq!(2, cols.len());
                Ok(TextRows::new())
            })
            .await
            .unwrap();
        assert_eq!(b"SELECT 2".as_slice(), res.command_tag());
        assert_eq!(2, res.rows_returned());
        assert_eq!(2, rows.rows().len());
        assert_eq!(Some("1".to_string()), rows.rows()[0][0]);
        assert_eq!(None, rows.rows()[0][1]);
        assert_eq!(Some("bob".to_string()), rows.rows()[1][1]);

        conn.close_statement("stmt1").await.unwrap();
    };

    let server_task = async move {
        // Parse, Describe, Sync as one flush unit.
        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'P', tag);
        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'D', tag);
        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'S', tag);
        server.write_all(&msg(b'1', b"")).await.unwrap();
        server.write_all(&row_description(&["id", "name"])).await.unwrap();
        server.write_all(&ready()).await.unwrap();

        // Bind, Execute, Sync.
        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'B', tag);
        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'E', tag);
        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'S', tag);
        server.write_all(&msg(b'2', b"")).await.unwrap();
        server.write_all(&data_row(&[Some(b"1".as_slice()), None])).await.unwrap();
        server
            .write_all(&data_row(&[Some(b"2".as_slice()), Some(b"bob".as_slice())]))
            .await
            .unwrap();
        server.write_all(&command_complete("SELECT 2")).await.unwrap();
        server.write_all(&ready()).await.unwrap();

        // Close, Sync.
        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'C', tag);
        let (tag, _) = read_frame(&mut server).await;
        assert_eq!(b'S', tag);
        server.write_all(&msg(b'3', b"")).await.unwrap();
        server.write_all(&ready()).await.unwrap();
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn prepare_without_result_set_returns_empty_columns() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let mut conn = PgConnection::raw(client);
        let columns = conn
            .prepare("stmt2", "INSERT INTO t VALUES ($1)")
            .await
            .unwrap();
        assert!(columns.is_empty());
    };

    let server_task = async move {
        for _ in 0..3 {
            read_frame(&mut server).await;
        }
        server.write_all(&msg(b'1', b"")).await.unwrap();
        server.write_all(&msg(b't', &0i16.to_be_bytes())).await.unwrap();
        server.write_all(&msg(b'n', b"")).await.unwrap();
        server.write_all(&ready()).await.unwrap();
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn side_channel_messages_are_invisible() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let mut conn = PgConnection::raw(client);
        let res = conn.query_simple(&Verbatim, "SELECT 1", &[]).await.unwrap();
        assert_eq!(b"SELECT 2".as_slice(), res.command_tag());
        assert_eq!(2, res.rows_returned());
    };

    let server_task = async move {
        read_frame(&mut server).await;
        server.write_all(&row_description(&["n"])).await.unwrap();
        server
            .write_all(&notice_response(&[(b'S', "NOTICE"), (b'M', "heads up")]))
            .await
            .unwrap();
        server.write_all(&data_row(&[Some(b"1".as_slice())])).await.unwrap();
        server
            .write_all(&parameter_status("TimeZone", "UTC"))
            .await
            .unwrap();
        server.write_all(&data_row(&[Some(b"2".as_slice())])).await.unwrap();
        server.write_all(&command_complete("SELECT 2")).await.unwrap();
        server.write_all(&ready()).await.unwrap();
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn model_failure_still_drains_to_ready() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let mut conn = PgConnection::raw(client);

        let err = conn
            .query_simple_with_model::<TextRows, _>(&Verbatim, "SELECT 1", &[], |_| {
                Err("no model for you".into())
            })
            .await
            .unwrap_err();
        match &err {
            Error::Model(e) => assert_eq!("no model for you", e.0),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.poisons_connection());

        // Rows after the failure were discarded and the sync point consumed.
        let res = conn.query_simple(&Verbatim, "SELECT 1", &[]).await.unwrap();
        assert_eq!(b"SELECT 1".as_slice(), res.command_tag());
    };

    let server_task = async move {
        read_frame(&mut server).await;
        server.write_all(&row_description(&["n"])).await.unwrap();
        server.write_all(&data_row(&[Some(b"1".as_slice())])).await.unwrap();
        server.write_all(&command_complete("SELECT 1")).await.unwrap();
        server.write_all(&ready()).await.unwrap();

        read_frame(&mut server).await;
        server.write_all(&data_row(&[Some(b"1".as_slice())])).await.unwrap();
        server.write_all(&command_complete("SELECT 1")).await.unwrap();
        server.write_all(&ready()).await.unwrap();
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn wait_notification_passes_through_completions() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let mut conn = PgConnection::raw(client);
        let notification = conn.wait_notification().await.unwrap();
        assert_eq!(4711, notification.process_id);
        assert_eq!("events", notification.channel);
        assert_eq!("hello", notification.payload);
    };

    let server_task = async move {
        // Completions of the LISTEN itself arrive first and pass through.
        server.write_all(&command_complete("LISTEN")).await.unwrap();
        server.write_all(&ready()).await.unwrap();

        let mut body = 4711i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"events\0hello\0");
        server.write_all(&msg(b'A', &body)).await.unwrap();
    };

    tokio::join!(client_task, server_task);
}

#[tokio::test]
async fn error_during_prepare_is_drained() {
    let (client, mut server) = tokio::io::duplex(1 << 16);

    let client_task = async move {
        let mut conn = PgConnection::raw(client);

        let err = conn.prepare("bad", "SELEC 1").await.unwrap_err();
        match &err {
            Error::Server(e) => assert_eq!("42601", e.code().unwrap()),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.poisons_connection());

        let res = conn.query_simple(&Verbatim, "SELECT 1", &[]).await.unwrap();
        assert_eq!(b"SELECT 1".as_slice(), res.command_tag());
    };

    let server_task = async move {
        for _ in 0..3 {
            read_frame(&mut server).await;
        }
        server
            .write_all(&error_response(&[
                (b'S', "ERROR"),
                (b'C', "42601"),
                (b'M', "syntax error"),
            ]))
            .await
            .unwrap();
        server.write_all(&ready()).await.unwrap();

        read_frame(&mut server).await;
        server.write_all(&command_complete("SELECT 1")).await.unwrap();
        server.write_all(&ready()).await.unwrap();
    };

    tokio::join!(client_task, server_task);
}
