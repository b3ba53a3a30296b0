//! Connection establishment: the optional SSL upgrade, the startup message,
//! and the authentication loop ending at the first ReadyForQuery.

use std::{collections::HashMap, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    conn::PgConnection,
    error::{Error, Result, ServerError},
    logger::{ProtocolLogger, TracingLogger},
    messages::{backend, frontend},
};

mod auth;

/// Authentication mode for a Postgres connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthenticationMode {
    /// Trust authentication (no password required).
    Trust,
    /// Password authentication with the provided password. Serves the
    /// cleartext, MD5 and SCRAM-SHA-256 challenges alike.
    Password(String),
}

impl AuthenticationMode {
    fn password(&self) -> Option<&str> {
        match self {
            AuthenticationMode::Trust => None,
            AuthenticationMode::Password(pw) => Some(pw),
        }
    }
}

const CURRENT_VERSION: ProtocolVersion = ProtocolVersion::new(3, 0);

/// Postgres protocol version number.
///
/// The version is encoded as a 32-bit integer where the upper 16 bits
/// represent the major version and the lower 16 bits represent the minor
/// version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ProtocolVersion(u32);

impl ProtocolVersion {
    const fn new(major: u16, minor: u16) -> Self {
        Self(((major as u32) << 16) | (minor as u32))
    }

    fn major(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    fn minor(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }
}

impl From<u32> for ProtocolVersion {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ProtocolVersion> for u32 {
    fn from(value: ProtocolVersion) -> Self {
        value.0
    }
}

impl PartialEq<u32> for ProtocolVersion {
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl PartialEq<ProtocolVersion> for u32 {
    fn eq(&self, other: &ProtocolVersion) -> bool {
        *self == other.0
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Negotiates the pre-startup TLS upgrade.
///
/// Writes the SSLRequest, reads exactly one byte, and hands the stream to
/// `upgrade_fn` on `S`. `N` (or anything else) yields
/// [`Error::SslNotSupported`] with the stream otherwise untouched, so the
/// caller may still proceed in plaintext on the same stream.
pub async fn negotiate_tls<S, T, F, Fut>(mut stream: S, upgrade_fn: F) -> Result<T>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(S) -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    stream.write_all(frontend::SSL_REQUEST).await?;
    stream.flush().await?;

    let mut buf = [0; 1];
    stream.read_exact(&mut buf).await?;

    match buf[0] {
        b'S' => Ok(upgrade_fn(stream).await?),
        _ => Err(Error::SslNotSupported),
    }
}

/// Builder for configuring and establishing Postgres connections.
pub struct ConnectionBuilder {
    auth: AuthenticationMode,
    protocol: ProtocolVersion,
    options: HashMap<String, String>,
    remote_addr: Option<String>,
    logger: Arc<dyn ProtocolLogger + Send + Sync>,
}

impl ConnectionBuilder {
    /// Creates a new connection builder with the specified user.
    ///
    /// Defaults to trust authentication and protocol version 3.0.
    pub fn new(user: impl Into<String>) -> Self {
        let user = user.into();

        let mut options = HashMap::new();
        options.insert("application_name".into(), "pg_proto".into());
        options.insert("database".into(), user.clone());
        options.insert("user".into(), user);

        Self {
            auth: AuthenticationMode::Trust,
            protocol: CURRENT_VERSION,
            options,
            remote_addr: None,
            logger: Arc::new(TracingLogger),
        }
    }

    /// Sets the database name to connect to.
    ///
    /// If not specified, defaults to the username.
    pub fn database(self, db: impl Into<String>) -> Self {
        self.add_option("database", db.into())
    }

    /// Sets the username for authentication.
    pub fn user(self, user: impl Into<String>) -> Self {
        self.add_option("user", user.into())
    }

    /// Sets the authentication mode.
    pub fn auth(mut self, auth: AuthenticationMode) -> Self {
        self.auth = auth;
        self
    }

    /// Sets the application name.
    pub fn application_name(self, app: impl Into<String>) -> Self {
        self.add_option("application_name", app.into())
    }

    /// Sets the Postgres protocol version.
    pub fn protocol(mut self, protocol: impl Into<ProtocolVersion>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Adds a startup parameter option.
    pub fn add_option(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.options.insert(key.into(), val.into());
        self
    }

    /// Records the peer address for diagnostics. Server errors and notices
    /// carry it alongside the fields the server sent.
    pub fn remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Replaces the logger receiving notices and parameter-status updates.
    pub fn logger(mut self, logger: Arc<dyn ProtocolLogger + Send + Sync>) -> Self {
        self.logger = logger;
        self
    }

    fn get_user(&self) -> &str {
        self.options.get("user").expect("user should always be set")
    }

    fn as_startup_message(&self) -> Bytes {
        let mut buf = BytesMut::new();
        frontend::frame(&mut buf, |buf| {
            buf.put_u32(self.protocol.into());

            for (key, val) in &self.options {
                frontend::put_cstring(buf, key.as_bytes());
                frontend::put_cstring(buf, val.as_bytes());
            }

            buf.put_u8(0);
        });

        buf.freeze()
    }

    /// Establishes a Postgres connection with TLS upgrade.
    ///
    /// Sends an SSL request to the server and upgrades the connection using
    /// the provided async upgrade function if the server supports TLS.
    pub async fn connect_with_tls<S, T, F, Fut>(
        &self,
        stream: S,
        upgrade_fn: F,
    ) -> Result<PgConnection<T>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        T: AsyncRead + AsyncWrite + Unpin,
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = std::io::Result<T>>,
    {
        let stream = negotiate_tls(stream, upgrade_fn).await?;
        self.connect(stream).await
    }

    /// Establishes a Postgres connection over the provided stream.
    ///
    /// Performs the startup handshake, handles authentication, and consumes
    /// messages until the server is ready for queries. The backend key data
    /// captured here is what [`cancel_request`][crate::cancel_request] needs
    /// later.
    pub async fn connect<S>(&self, mut stream: S) -> Result<PgConnection<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let startup_msg = self.as_startup_message();
        stream.write_all(&startup_msg).await?;
        stream.flush().await?;

        let mut process_id = 0;
        let mut secret_key = 0;

        loop {
            let mut frame = backend::read_frame(&mut stream).await?;
            match frame.code {
                backend::MessageCode::AUTHENTICATION => {
                    let first = auth::parse_auth_message(frame)?;
                    auth::authenticate(
                        &mut stream,
                        first,
                        self.get_user(),
                        self.auth.password(),
                        &self.remote_addr,
                    )
                    .await?;
                }
                backend::MessageCode::BACKEND_KEY_DATA => {
                    process_id = backend::read_i32(&mut frame.body)?;
                    secret_key = backend::read_i32(&mut frame.body)?;
                }
                backend::MessageCode::PARAMETER_STATUS => {
                    let name = backend::read_cstring(&mut frame.body)?;
                    let value = backend::read_cstring(&mut frame.body)?;
                    self.logger.parameter_status(&name, &value);
                }
                backend::MessageCode::NOTICE_RESPONSE => {
                    let notice = ServerError::parse(frame.body, self.remote_addr.clone());
                    self.logger.notice(&notice);
                }
                // The 1-byte transaction status arrived within the frame
                // body, so the sync point is fully drained here.
                backend::MessageCode::READY_FOR_QUERY => break,
                backend::MessageCode::ERROR_RESPONSE => {
                    return Err(ServerError::parse(frame.body, self.remote_addr.clone()).into());
                }
                code => {
                    return Err(Error::UnexpectedMessage {
                        reader: "startup",
                        code,
                    });
                }
            }
        }

        Ok(PgConnection::started_up(
            stream,
            process_id,
            secret_key,
            self.remote_addr.clone(),
            Arc::clone(&self.logger),
        ))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Buf;

    use super::{ConnectionBuilder, ProtocolVersion};

    #[test]
    fn test_protocol_version() {
        let major = 3;
        let minor = 0;
        let version = ProtocolVersion::new(major, minor);
        assert_eq!(major, version.major());
        assert_eq!(minor, version.minor());
        assert_eq!(196608, version.0);
    }

    #[test]
    fn test_startup_message_layout() {
        let builder = ConnectionBuilder::new("alice").database("inventory");
        let msg = builder.as_startup_message();

        let mut buf = &msg[..];
        let len = buf.get_u32();
        assert_eq!(len as usize, msg.len());
        assert_eq!(196608, buf.get_u32());

        // Key/value pairs in map order, with the terminating empty key.
        let body = &msg[8..];
        assert_eq!(0, body[body.len() - 1]);
        let contains = |needle: &[u8]| body.windows(needle.len()).any(|w| w == needle);
        assert!(contains(b"user\0alice\0"));
        assert!(contains(b"database\0inventory\0"));
    }
}
