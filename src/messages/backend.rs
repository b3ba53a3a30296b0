//! Inbound framing: backend message codes, whole-frame reads, and the
//! helpers that pick integers and strings out of a frame body.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Hard cap on a single inbound frame: 1 GiB, which is also the server's own
/// allocation ceiling. A declared length beyond this is a protocol violation,
/// not an allocation request we should honor.
const MAX_FRAME_SIZE_BYTES: usize = 1 << 30;

/// Identifies one kind of backend message: a single ASCII byte, followed on
/// the wire by a big-endian u32 length (which counts itself) and the payload.
///
/// The full tag set is listed in
/// <https://www.postgresql.org/docs/current/protocol-message-formats.html>.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageCode(u8);

impl MessageCode {
    pub const AUTHENTICATION: Self = Self(b'R');
    pub const BACKEND_KEY_DATA: Self = Self(b'K');
    pub const BIND_COMPLETE: Self = Self(b'2');
    pub const CLOSE_COMPLETE: Self = Self(b'3');
    pub const COMMAND_COMPLETE: Self = Self(b'C');
    pub const COPY_DATA: Self = Self(b'd');
    pub const COPY_DONE: Self = Self(b'c');
    pub const COPY_IN_RESPONSE: Self = Self(b'G');
    pub const COPY_OUT_RESPONSE: Self = Self(b'H');
    pub const DATA_ROW: Self = Self(b'D');
    pub const EMPTY_QUERY_RESPONSE: Self = Self(b'I');
    pub const ERROR_RESPONSE: Self = Self(b'E');
    pub const NO_DATA: Self = Self(b'n');
    pub const NOTICE_RESPONSE: Self = Self(b'N');
    pub const NOTIFICATION_RESPONSE: Self = Self(b'A');
    pub const PARAMETER_DESCRIPTION: Self = Self(b't');
    pub const PARAMETER_STATUS: Self = Self(b'S');
    pub const PARSE_COMPLETE: Self = Self(b'1');
    pub const PORTAL_SUSPENDED: Self = Self(b's');
    pub const READY_FOR_QUERY: Self = Self(b'Z');
    pub const ROW_DESCRIPTION: Self = Self(b'T');
}

impl From<u8> for MessageCode {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl From<MessageCode> for u8 {
    fn from(value: MessageCode) -> Self {
        value.0
    }
}

impl PartialEq<u8> for MessageCode {
    fn eq(&self, other: &u8) -> bool {
        self.0 == *other
    }
}

impl PartialEq<MessageCode> for u8 {
    fn eq(&self, other: &MessageCode) -> bool {
        *self == other.0
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            MessageCode::AUTHENTICATION => "Authentication",
            MessageCode::BACKEND_KEY_DATA => "BackendKeyData",
            MessageCode::BIND_COMPLETE => "BindComplete",
            MessageCode::CLOSE_COMPLETE => "CloseComplete",
            MessageCode::COMMAND_COMPLETE => "CommandComplete",
            MessageCode::COPY_DATA => "CopyData",
            MessageCode::COPY_DONE => "CopyDone",
            MessageCode::COPY_IN_RESPONSE => "CopyInResponse",
            MessageCode::COPY_OUT_RESPONSE => "CopyOutResponse",
            MessageCode::DATA_ROW => "DataRow",
            MessageCode::EMPTY_QUERY_RESPONSE => "EmptyQueryResponse",
            MessageCode::ERROR_RESPONSE => "ErrorResponse",
            MessageCode::NO_DATA => "NoData",
            MessageCode::NOTICE_RESPONSE => "NoticeResponse",
            MessageCode::NOTIFICATION_RESPONSE => "NotificationResponse",
            MessageCode::PARAMETER_DESCRIPTION => "ParameterDescription",
            MessageCode::PARAMETER_STATUS => "ParameterStatus",
            MessageCode::PARSE_COMPLETE => "ParseComplete",
            MessageCode::PORTAL_SUSPENDED => "PortalSuspended",
            MessageCode::READY_FOR_QUERY => "ReadyForQuery",
            MessageCode::ROW_DESCRIPTION => "RowDescription",
            _ => "Unknown",
        };
        write!(f, "{name}({})", self.0 as char)
    }
}

impl std::fmt::Debug for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageCode({})", self.0 as char)
    }
}

/// One inbound message: its code plus the raw payload.
///
/// The body shares one allocation with the frame read; slices split off it
/// are valid until the caller drops them, but column names and error fields
/// that must outlive the frame are copied by their consumers.
#[derive(Debug, Clone)]
pub struct PgFrame {
    pub code: MessageCode,
    pub body: Bytes,
}

impl PgFrame {
    pub fn new(code: impl Into<MessageCode>, body: impl Into<Bytes>) -> Self {
        Self {
            code: code.into(),
            body: body.into(),
        }
    }
}

impl std::fmt::Display for PgFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {:?}", self.code, self.body)
    }
}

/// Pulls the next frame off the stream: one tag byte, the u32 length, then
/// the payload. Because the wire length counts its own 4 bytes, the returned
/// body holds `length - 4` of them.
pub async fn read_frame(mut stream: impl AsyncRead + Unpin) -> std::io::Result<PgFrame> {
    let mut buf = [0; 1];
    stream.read_exact(&mut buf).await?;
    let code: MessageCode = u8::from_be_bytes(buf).into();

    let mut buf = [0; 4];
    stream.read_exact(&mut buf).await?;
    let len = u32::from_be_bytes(buf) as usize;

    if len > MAX_FRAME_SIZE_BYTES {
        let err_msg = format!("frame size exceeds {MAX_FRAME_SIZE_BYTES}B");
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, err_msg));
    }
    if len < size_of::<u32>() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame length smaller than its own length field",
        ));
    }

    let mut body = BytesMut::new();
    body.resize(len - size_of::<u32>(), 0);
    stream.read_exact(&mut body).await?;

    Ok(PgFrame::new(code, body))
}

/// Takes the NUL-terminated string at the front of `bytes`, consuming the
/// terminator but not returning it. Errors when no terminator exists in the
/// remaining body or the content is not UTF-8.
pub(crate) fn read_cstring(bytes: &mut Bytes) -> std::io::Result<String> {
    let end = bytes.iter().position(|&b| b == 0).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "unterminated string")
    })?;

    let value = bytes.split_to(end);
    bytes.advance(1);
    String::from_utf8(value.to_vec()).map_err(std::io::Error::other)
}

/// Reads a big-endian i16 from a message body.
pub(crate) fn read_i16(bytes: &mut Bytes) -> std::io::Result<i16> {
    if bytes.remaining() < 2 {
        return Err(truncated());
    }
    Ok(bytes.get_i16())
}

/// Reads a big-endian i32 from a message body.
pub(crate) fn read_i32(bytes: &mut Bytes) -> std::io::Result<i32> {
    if bytes.remaining() < 4 {
        return Err(truncated());
    }
    Ok(bytes.get_i32())
}

/// Splits exactly `n` bytes off the front of a message body.
pub(crate) fn read_exact(bytes: &mut Bytes, n: usize) -> std::io::Result<Bytes> {
    if bytes.remaining() < n {
        return Err(truncated());
    }
    Ok(bytes.split_to(n))
}

fn truncated() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "message body truncated")
}
