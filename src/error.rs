use std::{borrow::Cow, ops::Range};

use bytes::Bytes;

use crate::messages::backend::{self, MessageCode, PgFrame};

pub type Result<T> = std::result::Result<T, Error>;

/// Field code under which the peer address is reported, alongside the fields
/// the server actually sent. Postgres never uses this code itself.
pub const REMOTE_ADDR_FIELD: u8 = b'a';

/// A zero-copy representation of a Postgres ErrorResponse or NoticeResponse.
///
/// Every field of the response is retained, keyed by its single-byte code,
/// and the connection's peer address is injected under
/// [`REMOTE_ADDR_FIELD`] when known. SQLSTATE is surfaced verbatim and never
/// interpreted here.
pub struct ServerError {
    body: Bytes,
    fields: Vec<(u8, Range<usize>)>,
    remote_addr: Option<String>,
}

impl ServerError {
    pub(crate) fn parse(body: Bytes, remote_addr: Option<String>) -> Self {
        let mut fields = Vec::new();

        let mut offset = 0;
        while offset < body.len() {
            let code = body[offset];
            if code == 0 {
                break;
            }
            let start = offset + 1;
            let end = body[start..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| start + p)
                .unwrap_or(body.len());
            fields.push((code, start..end));
            offset = end + 1;
        }

        ServerError {
            body,
            fields,
            remote_addr,
        }
    }

    /// Looks up a field by its protocol code byte (`'C'` for SQLSTATE, `'M'`
    /// for the primary message, and so on).
    pub fn field(&self, code: u8) -> Option<Cow<'_, str>> {
        if code == REMOTE_ADDR_FIELD {
            return self.remote_addr.as_deref().map(Cow::Borrowed);
        }
        self.fields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, r)| String::from_utf8_lossy(&self.body[r.start..r.end]))
    }

    /// Number of fields carried, counting the injected peer address.
    pub fn len(&self) -> usize {
        self.fields.len() + usize::from(self.remote_addr.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn severity(&self) -> Option<Cow<'_, str>> {
        self.field(b'S')
    }

    /// The SQLSTATE code.
    pub fn code(&self) -> Option<Cow<'_, str>> {
        self.field(b'C')
    }

    pub fn message(&self) -> Option<Cow<'_, str>> {
        self.field(b'M')
    }

    pub fn detail(&self) -> Option<Cow<'_, str>> {
        self.field(b'D')
    }

    pub fn hint(&self) -> Option<Cow<'_, str>> {
        self.field(b'H')
    }

    pub fn position(&self) -> Option<Cow<'_, str>> {
        self.field(b'P')
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sev = self.severity().unwrap_or("UNKNOWN".into());
        let code = self.code().unwrap_or("?????".into());
        let msg = self.message().unwrap_or("<no message>".into());
        write!(f, "[{sev}] {code}: {msg}")?;
        if let Some(addr) = self.remote_addr() {
            write!(f, " (addr={addr})")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerError")
            .field("severity", &self.severity())
            .field("code", &self.code())
            .field("message", &self.message())
            .field("detail", &self.detail())
            .field("hint", &self.hint())
            .field("position", &self.position())
            .field("remote_addr", &self.remote_addr())
            .finish_non_exhaustive()
    }
}

impl TryFrom<PgFrame> for ServerError {
    type Error = PgFrame;

    fn try_from(frame: PgFrame) -> std::result::Result<Self, Self::Error> {
        if frame.code == backend::MessageCode::ERROR_RESPONSE
            || frame.code == backend::MessageCode::NOTICE_RESPONSE
        {
            Ok(ServerError::parse(frame.body, None))
        } else {
            Err(frame)
        }
    }
}

/// A failure to encode a query or parameter before any bytes were flushed.
/// The write buffer has been unwound; the connection stays usable.
#[derive(Debug)]
pub struct EncodeError(pub String);

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for EncodeError {}

impl From<String> for EncodeError {
    fn from(value: String) -> Self {
        EncodeError(value)
    }
}

impl From<&str> for EncodeError {
    fn from(value: &str) -> Self {
        EncodeError(value.to_string())
    }
}

/// A failure reported by a result-materialization capability: a column
/// scanner, or a model rejecting a row.
#[derive(Debug)]
pub struct ModelError(pub String);

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ModelError {}

impl From<String> for ModelError {
    fn from(value: String) -> Self {
        ModelError(value)
    }
}

impl From<&str> for ModelError {
    fn from(value: &str) -> Self {
        ModelError(value.to_string())
    }
}

/// The error type for engine operations.
///
/// [`poisons_connection`][Error::poisons_connection] separates errors that
/// lose protocol synchronization from those that leave the connection at
/// ReadyForQuery; a pool keeps the connection in the second case only.
#[derive(Debug)]
pub enum Error {
    /// Transport failure. The connection must be discarded.
    Io(std::io::Error),
    /// The server refused the SSLRequest. The stream is untouched beyond the
    /// single response byte.
    SslNotSupported,
    /// A message tag no reader expects. Synchronization is lost.
    UnexpectedMessage {
        reader: &'static str,
        code: MessageCode,
    },
    /// An authentication sub-code this engine does not speak.
    UnknownAuthCode(i32),
    /// The server offered no SASL mechanism we support.
    UnsupportedSaslMechanism(String),
    /// The SCRAM exchange failed or arrived out of order.
    Sasl(String),
    /// Password authentication was requested but no password is configured.
    PasswordRequired,
    /// An ErrorResponse, drained to the next ReadyForQuery.
    Server(ServerError),
    /// A query or parameter failed to encode; nothing was sent.
    Encode(EncodeError),
    /// A column scanner rejected a value. The rest of the row was consumed.
    Scan { column: String, source: ModelError },
    /// A model could not be created or refused a row.
    Model(ModelError),
}

impl Error {
    /// Whether the connection lost protocol synchronization and must be
    /// discarded rather than returned to a pool.
    pub fn poisons_connection(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::UnexpectedMessage { .. }
            | Error::UnknownAuthCode(_)
            | Error::UnsupportedSaslMechanism(_)
            | Error::Sasl(_)
            | Error::PasswordRequired => true,
            Error::SslNotSupported
            | Error::Server(_)
            | Error::Encode(_)
            | Error::Scan { .. }
            | Error::Model(_) => false,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(e) => write!(f, "encountered I/O error: {e}"),
            Error::SslNotSupported => write!(f, "server does not support SSL"),
            Error::UnexpectedMessage { reader, code } => {
                write!(f, "{reader}: unexpected message {code}")
            }
            Error::UnknownAuthCode(code) => {
                write!(f, "unknown authentication code: {code}")
            }
            Error::UnsupportedSaslMechanism(offered) => {
                write!(f, "no supported SASL mechanism, server offered: {offered}")
            }
            Error::Sasl(reason) => write!(f, "SASL handshake failed: {reason}"),
            Error::PasswordRequired => write!(f, "password is required"),
            Error::Server(e) => write!(f, "server error: {e}"),
            Error::Encode(e) => write!(f, "encode error: {e}"),
            Error::Scan { column, source } => {
                write!(f, "scan error on column {column:?}: {source}")
            }
            Error::Model(e) => write!(f, "model error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Encode(e) => Some(e),
            Error::Scan { source, .. } | Error::Model(source) => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<ServerError> for Error {
    fn from(value: ServerError) -> Self {
        Error::Server(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Error::Encode(value)
    }
}
