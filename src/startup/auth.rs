use bytes::BufMut;
use scram::ScramClient;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    buffer::WriteBuffer,
    error::{Error, Result, ServerError},
    messages::{
        backend::{self, read_frame},
        frontend::{self, put_cstring},
    },
};

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
const SCRAM_SHA_256_PLUS: &str = "SCRAM-SHA-256-PLUS";

/// One Authentication (`R`) message, dispatched on its i32 sub-code.
pub(crate) enum AuthMessage {
    Ok,
    KerberosV5,
    CleartextPassword,
    Md5Password([u8; 4]),
    Gss,
    GssContinue,
    Sspi,
    Sasl(Vec<String>),
    SaslContinue(String),
    SaslFinal(String),
}

impl AuthMessage {
    pub(crate) fn code(&self) -> i32 {
        match self {
            AuthMessage::Ok => 0,
            AuthMessage::KerberosV5 => 2,
            AuthMessage::CleartextPassword => 3,
            AuthMessage::Md5Password(_) => 5,
            AuthMessage::Gss => 7,
            AuthMessage::GssContinue => 8,
            AuthMessage::Sspi => 9,
            AuthMessage::Sasl(_) => 10,
            AuthMessage::SaslContinue(_) => 11,
            AuthMessage::SaslFinal(_) => 12,
        }
    }
}

impl std::fmt::Display for AuthMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuthMessage::Ok => "AuthenticationOk",
            AuthMessage::KerberosV5 => "AuthenticationKerberosV5",
            AuthMessage::CleartextPassword => "AuthenticationCleartextPassword",
            AuthMessage::Md5Password(_) => "AuthenticationMD5Password",
            AuthMessage::Gss => "AuthenticationGSS",
            AuthMessage::GssContinue => "AuthenticationGSSContinue",
            AuthMessage::Sspi => "AuthenticationSSPI",
            AuthMessage::Sasl(_) => "AuthenticationSASL",
            AuthMessage::SaslContinue(_) => "AuthenticationSASLContinue",
            AuthMessage::SaslFinal(_) => "AuthenticationSASLFinal",
        };
        write!(f, "{name}({})", self.code())
    }
}

/// Parses the body of an Authentication message.
pub(crate) fn parse_auth_message(frame: backend::PgFrame) -> Result<AuthMessage> {
    let mut body = frame.body;
    let code = backend::read_i32(&mut body)?;
    let msg = match code {
        0 => AuthMessage::Ok,
        2 => AuthMessage::KerberosV5,
        3 => AuthMessage::CleartextPassword,
        5 => {
            let mut salt = [0u8; 4];
            salt.copy_from_slice(&backend::read_exact(&mut body, 4)?);
            AuthMessage::Md5Password(salt)
        }
        7 => AuthMessage::Gss,
        8 => AuthMessage::GssContinue,
        9 => AuthMessage::Sspi,
        10 => {
            // A NUL-separated mechanism list, terminated by an empty name.
            let mut mechanisms = Vec::new();
            loop {
                let name = backend::read_cstring(&mut body)?;
                if name.is_empty() {
                    break;
                }
                mechanisms.push(name);
            }
            AuthMessage::Sasl(mechanisms)
        }
        11 => AuthMessage::SaslContinue(String::from_utf8_lossy(&body).to_string()),
        12 => AuthMessage::SaslFinal(String::from_utf8_lossy(&body).to_string()),
        code => return Err(Error::UnknownAuthCode(code)),
    };
    Ok(msg)
}

/// Reads the next message during an authentication exchange: an
/// Authentication message, or an ErrorResponse surfaced as `Err`.
pub(crate) async fn read_auth_message<S>(
    stream: &mut S,
    remote_addr: &Option<String>,
) -> Result<AuthMessage>
where
    S: AsyncRead + Unpin,
{
    let frame = read_frame(stream).await?;
    match frame.code {
        backend::MessageCode::ERROR_RESPONSE => {
            Err(ServerError::parse(frame.body, remote_addr.clone()).into())
        }
        backend::MessageCode::AUTHENTICATION => parse_auth_message(frame),
        code => Err(Error::UnexpectedMessage {
            reader: "read_auth_message",
            code,
        }),
    }
}

/// Drives one authentication request to completion, starting from the
/// sub-code the server opened with. On return the server has accepted the
/// credentials; the caller keeps consuming the startup stream.
pub(crate) async fn authenticate<S>(
    stream: &mut S,
    first: AuthMessage,
    user: &str,
    password: Option<&str>,
    remote_addr: &Option<String>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match first {
        AuthMessage::Ok => Ok(()),
        AuthMessage::CleartextPassword => {
            let password = password.ok_or(Error::PasswordRequired)?;
            send_password(stream, password.as_bytes()).await?;
            expect_auth_ok(stream, remote_addr).await
        }
        AuthMessage::Md5Password(salt) => {
            let password = password.ok_or(Error::PasswordRequired)?;
            let secret = md5_password(user, password, &salt);
            send_password(stream, secret.as_bytes()).await?;
            expect_auth_ok(stream, remote_addr).await
        }
        AuthMessage::Sasl(mechanisms) => {
            let password = password.ok_or(Error::PasswordRequired)?;
            select_mechanism(&mechanisms)?;
            sasl_authenticate(stream, user, password, remote_addr).await
        }
        other => Err(Error::UnknownAuthCode(other.code())),
    }
}

/// The MD5 challenge-response secret:
/// `"md5" || hex(md5(hex(md5(password || user)) || salt))`.
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}

/// Picks SCRAM-SHA-256 from the server's mechanism list. The channel-binding
/// variant is skipped, not rejected.
pub(crate) fn select_mechanism(offered: &[String]) -> Result<&'static str> {
    for name in offered {
        match name.as_str() {
            SCRAM_SHA_256 => return Ok(SCRAM_SHA_256),
            SCRAM_SHA_256_PLUS => {}
            _ => {}
        }
    }
    Err(Error::UnsupportedSaslMechanism(offered.join(",")))
}

async fn send_password<S>(stream: &mut S, password: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = WriteBuffer::new();
    buf.message(frontend::MessageCode::PASSWORD_MESSAGE, |b| {
        put_cstring(b, password);
    });
    stream.write_all(buf.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

async fn expect_auth_ok<S>(stream: &mut S, remote_addr: &Option<String>) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    match read_auth_message(stream, remote_addr).await? {
        AuthMessage::Ok => Ok(()),
        other => Err(Error::UnknownAuthCode(other.code())),
    }
}

/// The three-message SCRAM-SHA-256 exchange: SASLInitialResponse with the
/// client-first payload, SASLResponse with the client-final payload, and
/// verification of the server-final signature.
async fn sasl_authenticate<S>(
    stream: &mut S,
    user: &str,
    password: &str,
    remote_addr: &Option<String>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let scram = ScramClient::new(user, password, None);
    let (scram, client_first) = scram.client_first();

    let mut buf = WriteBuffer::new();
    buf.message(frontend::MessageCode::SASL_INITIAL_RESPONSE, |b| {
        put_cstring(b, SCRAM_SHA_256.as_bytes());
        b.put_u32(client_first.len() as u32);
        b.put_slice(client_first.as_bytes());
    });
    stream.write_all(buf.as_bytes()).await?;
    stream.flush().await?;

    let server_first = match read_auth_message(stream, remote_addr).await? {
        AuthMessage::SaslContinue(server_first) => server_first,
        other => {
            return Err(Error::Sasl(format!(
                "got {other}, wanted AuthenticationSASLContinue(11)"
            )));
        }
    };

    let scram = scram
        .handle_server_first(&server_first)
        .map_err(|e| Error::Sasl(e.to_string()))?;
    let (scram, client_final) = scram.client_final();

    let mut buf = WriteBuffer::new();
    buf.message(frontend::MessageCode::SASL_RESPONSE, |b| {
        b.put_slice(client_final.as_bytes());
    });
    stream.write_all(buf.as_bytes()).await?;
    stream.flush().await?;

    let server_final = match read_auth_message(stream, remote_addr).await? {
        AuthMessage::SaslFinal(server_final) => server_final,
        other => {
            return Err(Error::Sasl(format!(
                "got {other}, wanted AuthenticationSASLFinal(12)"
            )));
        }
    };

    // A signature mismatch here means the server never proved knowledge of
    // the password.
    scram
        .handle_server_final(&server_final)
        .map_err(|e| Error::Sasl(e.to_string()))?;

    expect_auth_ok(stream, remote_addr).await
}
