//! The connection: one duplex stream, one write buffer, one in-flight
//! operation at a time.

use std::sync::Arc;

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    buffer::WriteBuffer,
    error::{Error, ModelError, Result},
    logger::{ProtocolLogger, TracingLogger},
    messages::frontend::{self, MessageCode, put_cstring},
    model::Model,
    query::{Param, QueryAppender, QueryFormatter, QueryResult},
};

const COPY_CHUNK_SIZE: usize = 8192;

/// An asynchronous notification delivered by LISTEN/NOTIFY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Process ID of the notifying backend.
    pub process_id: i32,
    /// The channel the notification was sent on.
    pub channel: String,
    /// The payload string, empty when none was given.
    pub payload: String,
}

/// A Postgres connection in the protocol-engine sense: an open duplex byte
/// stream plus the state the protocol requires per connection.
///
/// Every operation takes `&mut self`, so at most one request/response cycle
/// is in flight; concurrency across connections belongs to the caller. On
/// success the connection is back at ReadyForQuery. On error, consult
/// [`Error::poisons_connection`] before reusing it.
pub struct PgConnection<S> {
    pub(crate) stream: S,
    pub(crate) buf: WriteBuffer,
    pub(crate) process_id: i32,
    pub(crate) secret_key: i32,
    /// Column names of the current result set, reused across queries to
    /// avoid re-allocating the row header. Overwritten, never aliased.
    pub(crate) columns: Vec<Vec<u8>>,
    pub(crate) remote_addr: Option<String>,
    pub(crate) logger: Arc<dyn ProtocolLogger + Send + Sync>,
}

impl<S> std::fmt::Debug for PgConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("process_id", &self.process_id)
            .field("secret_key", &self.secret_key)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

impl<S> PgConnection<S> {
    /// Wraps a stream without performing the startup handshake. The server
    /// side must already be at ReadyForQuery for operations to make sense.
    pub fn raw(stream: S) -> Self {
        PgConnection {
            stream,
            buf: WriteBuffer::new(),
            process_id: 0,
            secret_key: 0,
            columns: Vec::new(),
            remote_addr: None,
            logger: Arc::new(TracingLogger),
        }
    }

    pub(crate) fn started_up(
        stream: S,
        process_id: i32,
        secret_key: i32,
        remote_addr: Option<String>,
        logger: Arc<dyn ProtocolLogger + Send + Sync>,
    ) -> Self {
        PgConnection {
            stream,
            buf: WriteBuffer::new(),
            process_id,
            secret_key,
            columns: Vec::new(),
            remote_addr,
            logger,
        }
    }

    /// Backend process ID captured during startup.
    pub fn process_id(&self) -> i32 {
        self.process_id
    }

    /// Cancellation key captured during startup. Pass both to
    /// [`cancel_request`] on a second connection to cancel an operation in
    /// flight on this one.
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Consumes the connection and returns the underlying stream.
    pub fn into_stream(self) -> S {
        self.stream
    }

    fn put_query(
        &mut self,
        fmter: &dyn QueryFormatter,
        query: &str,
        params: &[Param],
    ) -> Result<()> {
        self.buf.start_message(MessageCode::QUERY);
        let sql_start = self.buf.len();
        if let Err(e) = fmter.format_query(self.buf.bytes_mut(), query, params) {
            // Unwind the partial message; nothing reached the stream, so the
            // connection stays usable for the next attempt.
            self.buf.reset();
            return Err(Error::Encode(e));
        }
        self.logger.query(&self.buf.as_bytes()[sql_start..]);
        self.buf.write_byte(0);
        self.buf.finish_message();
        Ok(())
    }

    fn put_appender_query(&mut self, query: &dyn QueryAppender) -> Result<()> {
        self.buf.start_message(MessageCode::QUERY);
        let sql_start = self.buf.len();
        if let Err(e) = query.append_query(self.buf.bytes_mut()) {
            self.buf.reset();
            return Err(Error::Encode(e));
        }
        self.logger.query(&self.buf.as_bytes()[sql_start..]);
        self.buf.write_byte(0);
        self.buf.finish_message();
        Ok(())
    }

    fn put_parse_describe_sync(&mut self, name: &str, query: &str) {
        self.buf.message(MessageCode::PARSE, |b| {
            put_cstring(b, name.as_bytes());
            put_cstring(b, query.as_bytes());
            b.put_i16(0);
        });
        self.buf.message(MessageCode::DESCRIBE, |b| {
            b.put_u8(b'S');
            put_cstring(b, name.as_bytes());
        });
        self.put_sync();
    }

    fn put_bind_execute(&mut self, name: &str, params: &[Param]) {
        self.buf.start_message(MessageCode::BIND);
        self.buf.write_cstring(b""); // unnamed portal
        self.buf.write_cstring(name.as_bytes());
        self.buf.write_i16(0); // parameter format codes: all default text
        self.buf.write_i16(params.len() as i16);
        for param in params {
            self.buf.start_param();
            match param.append(self.buf.bytes_mut()) {
                Some(()) => self.buf.finish_param(),
                None => self.buf.finish_null_param(),
            }
        }
        self.buf.write_i16(0); // result format codes
        self.buf.finish_message();

        self.buf.message(MessageCode::EXECUTE, |b| {
            put_cstring(b, b""); // unnamed portal
            b.put_i32(0); // no row limit
        });

        self.put_sync();
    }

    fn put_close(&mut self, name: &str) {
        self.buf.message(MessageCode::CLOSE, |b| {
            b.put_u8(b'S');
            put_cstring(b, name.as_bytes());
        });
        self.put_sync();
    }

    /// Queues a Sync message, ending an extended-query unit.
    pub fn put_sync(&mut self) {
        self.buf.message(MessageCode::SYNC, |_| {});
    }

    /// Queues a Flush message, asking the server to emit pending responses
    /// without ending the unit.
    pub fn put_flush(&mut self) {
        self.buf.message(MessageCode::FLUSH, |_| {});
    }
}

impl<S> PgConnection<S>
where
    S: AsyncWrite + Unpin,
{
    async fn flush(&mut self) -> std::io::Result<()> {
        self.stream.write_all_buf(self.buf.bytes_mut()).await?;
        self.stream.flush().await
    }

    /// Sends the Terminate message and shuts the connection down. No
    /// response is expected; the stream is returned for the caller to close.
    ///
    /// The bytes go directly to the stream rather than through the write
    /// buffer, which may still be owned by a concurrent reader.
    pub async fn terminate(mut self) -> std::io::Result<S> {
        self.stream.write_all(frontend::TERMINATE_MESSAGE).await?;
        self.stream.flush().await?;
        Ok(self.stream)
    }
}

impl<S> PgConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs a simple query and returns its command tag and row count. Row
    /// payloads are discarded; use
    /// [`query_simple_with_model`][Self::query_simple_with_model] to keep
    /// them.
    pub async fn query_simple(
        &mut self,
        fmter: &dyn QueryFormatter,
        query: &str,
        params: &[Param],
    ) -> Result<QueryResult> {
        self.put_query(fmter, query, params)?;
        self.flush().await?;
        self.read_simple_query().await
    }

    /// Runs a simple query, materializing rows into the model produced by
    /// `model_fn` from the captured column names.
    pub async fn query_simple_with_model<M, F>(
        &mut self,
        fmter: &dyn QueryFormatter,
        query: &str,
        params: &[Param],
        model_fn: F,
    ) -> Result<(QueryResult, M)>
    where
        M: Model,
        F: FnOnce(&[Vec<u8>]) -> std::result::Result<M, ModelError>,
    {
        self.put_query(fmter, query, params)?;
        self.flush().await?;
        self.read_simple_query_data(model_fn).await
    }

    /// Runs a pre-bound query.
    pub async fn query_appender(&mut self, query: &dyn QueryAppender) -> Result<QueryResult> {
        self.put_appender_query(query)?;
        self.flush().await?;
        self.read_simple_query().await
    }

    /// Creates a named prepared statement and returns the column names of
    /// its result set, empty for statements without one.
    pub async fn prepare(&mut self, name: &str, query: &str) -> Result<Vec<Vec<u8>>> {
        self.put_parse_describe_sync(name, query);
        self.flush().await?;
        self.read_parse_describe_sync().await
    }

    /// Binds parameters to a prepared statement and executes it, discarding
    /// row payloads.
    pub async fn bind_execute(&mut self, name: &str, params: &[Param]) -> Result<QueryResult> {
        self.put_bind_execute(name, params);
        self.flush().await?;
        self.read_ext_query().await
    }

    /// Binds parameters to a prepared statement and executes it,
    /// materializing rows. `columns` is the row description captured by
    /// [`prepare`][Self::prepare].
    pub async fn bind_execute_with_model<M, F>(
        &mut self,
        name: &str,
        params: &[Param],
        columns: &[Vec<u8>],
        model_fn: F,
    ) -> Result<(QueryResult, M)>
    where
        M: Model,
        F: FnOnce(&[Vec<u8>]) -> std::result::Result<M, ModelError>,
    {
        self.put_bind_execute(name, params);
        self.flush().await?;
        self.read_ext_query_data(columns, model_fn).await
    }

    /// Closes a named prepared statement on the server.
    pub async fn close_statement(&mut self, name: &str) -> Result<()> {
        self.put_close(name);
        self.flush().await?;
        self.read_close_complete().await
    }

    /// Runs a `COPY ... FROM STDIN` query, streaming `src` to the server in
    /// CopyData frames.
    pub async fn copy_from<R>(
        &mut self,
        fmter: &dyn QueryFormatter,
        query: &str,
        params: &[Param],
        src: &mut R,
    ) -> Result<QueryResult>
    where
        R: AsyncRead + Unpin,
    {
        self.put_query(fmter, query, params)?;
        self.flush().await?;
        self.read_copy_in_response().await?;

        let mut chunk = [0u8; COPY_CHUNK_SIZE];
        loop {
            let n = src.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            self.buf.message(MessageCode::COPY_DATA, |b| {
                b.put_slice(&chunk[..n]);
            });
            self.flush().await?;
        }

        self.buf.message(MessageCode::COPY_DONE, |_| {});
        self.put_sync();
        self.flush().await?;

        self.read_ready_for_query().await
    }

    /// Runs a `COPY ... TO STDOUT` query, streaming the server's CopyData
    /// frames into `dst`.
    pub async fn copy_to<W>(
        &mut self,
        fmter: &dyn QueryFormatter,
        query: &str,
        params: &[Param],
        dst: &mut W,
    ) -> Result<QueryResult>
    where
        W: AsyncWrite + Unpin,
    {
        self.put_query(fmter, query, params)?;
        self.flush().await?;
        self.read_copy_out_response().await?;
        self.read_copy_data(dst).await
    }

    /// Waits for the next notification on this connection. Completions of an
    /// earlier LISTEN pass through, so this can be called directly after
    /// sending one.
    pub async fn wait_notification(&mut self) -> Result<Notification> {
        self.read_notification().await
    }
}

/// Asks the server to cancel the operation in flight on another connection.
///
/// This is out-of-band by design: `stream` must be a second, freshly opened
/// connection to the same server, and `process_id`/`secret_key` are the
/// values captured during the first connection's startup. The server never
/// answers; the caller drops the stream afterwards. The cancelled connection
/// observes the result as an ErrorResponse at its next protocol boundary.
pub async fn cancel_request<S>(
    stream: &mut S,
    process_id: i32,
    secret_key: i32,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = WriteBuffer::new();
    buf.start_message(0u8);
    buf.write_i32(frontend::CANCEL_REQUEST_CODE);
    buf.write_i32(process_id);
    buf.write_i32(secret_key);
    buf.finish_message();

    stream.write_all(buf.as_bytes()).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use bytes::{Buf, BytesMut};

    use super::{PgConnection, cancel_request};
    use crate::{
        error::Error,
        query::{Param, Verbatim},
    };

    #[test]
    fn test_put_query() {
        let mut conn = PgConnection::raw(Vec::<u8>::new());
        conn.put_query(&Verbatim, "SELECT 1", &[]).unwrap();

        let mut buf = conn.buf.as_bytes();
        assert_eq!(b'Q', buf.get_u8());
        assert_eq!(13, buf.get_u32());
        assert_eq!(&b"SELECT 1\0"[..], buf);
    }

    #[test]
    fn test_put_query_encode_failure_resets_buffer() {
        let mut conn = PgConnection::raw(Vec::<u8>::new());
        let err = conn
            .put_query(&Verbatim, "SELECT $1", &[Param::Int4(1)])
            .unwrap_err();

        assert!(matches!(err, Error::Encode(_)));
        assert!(!err.poisons_connection());
        assert!(conn.buf.is_empty());

        // The connection takes the next message cleanly.
        conn.put_query(&Verbatim, "SELECT 2", &[]).unwrap();
        assert_eq!(b'Q', conn.buf.as_bytes()[0]);
    }

    #[test]
    fn test_put_parse_describe_sync() {
        let mut conn = PgConnection::raw(Vec::<u8>::new());
        conn.put_parse_describe_sync("stmt", "SELECT 1");

        let mut buf = conn.buf.as_bytes();
        assert_eq!(b'P', buf.get_u8());
        assert_eq!(20, buf.get_u32());
        let (head, rest) = buf.split_at(b"stmt\0SELECT 1\0".len());
        assert_eq!(&b"stmt\0SELECT 1\0"[..], head);
        buf = rest;
        assert_eq!(0, buf.get_i16());

        assert_eq!(b'D', buf.get_u8());
        assert_eq!(10, buf.get_u32());
        assert_eq!(b'S', buf.get_u8());
        let (head, rest) = buf.split_at(5);
        assert_eq!(&b"stmt\0"[..], head);
        buf = rest;

        assert_eq!(b'S', buf.get_u8());
        assert_eq!(4, buf.get_u32());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_put_bind_execute() {
        let mut conn = PgConnection::raw(Vec::<u8>::new());
        conn.put_bind_execute("stmt", &[Param::Int4(42), Param::Null]);

        let mut buf = conn.buf.as_bytes();
        assert_eq!(b'B', buf.get_u8());
        assert_eq!(26, buf.get_u32());
        assert_eq!(0, buf.get_u8()); // unnamed portal
        let (head, rest) = buf.split_at(5);
        assert_eq!(&b"stmt\0"[..], head);
        buf = rest;
        assert_eq!(0, buf.get_i16()); // parameter format codes
        assert_eq!(2, buf.get_i16()); // parameter count
        assert_eq!(2, buf.get_i32());
        assert_eq!(b'4', buf.get_u8());
        assert_eq!(b'2', buf.get_u8());
        assert_eq!(-1, buf.get_i32()); // NULL parameter
        assert_eq!(0, buf.get_i16()); // result format codes

        assert_eq!(b'E', buf.get_u8());
        assert_eq!(9, buf.get_u32());
        assert_eq!(0, buf.get_u8()); // unnamed portal
        assert_eq!(0, buf.get_u32()); // no row limit

        assert_eq!(b'S', buf.get_u8());
        assert_eq!(4, buf.get_u32());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_put_close() {
        let mut conn = PgConnection::raw(Vec::<u8>::new());
        conn.put_close("stmt");

        let mut buf = conn.buf.as_bytes();
        assert_eq!(b'C', buf.get_u8());
        assert_eq!(10, buf.get_u32());
        assert_eq!(b'S', buf.get_u8());
        let (head, rest) = buf.split_at(5);
        assert_eq!(&b"stmt\0"[..], head);
        buf = rest;
        assert_eq!(b'S', buf.get_u8());
        assert_eq!(4, buf.get_u32());
    }

    #[test]
    fn test_put_sync_and_flush() {
        let mut conn = PgConnection::raw(Vec::<u8>::new());
        conn.put_sync();
        conn.put_flush();

        let mut buf = conn.buf.as_bytes();
        assert_eq!(b'S', buf.get_u8());
        assert_eq!(4, buf.get_u32());
        assert_eq!(b'H', buf.get_u8());
        assert_eq!(4, buf.get_u32());
    }

    #[tokio::test]
    async fn test_cancel_request_layout() {
        let mut stream = Vec::<u8>::new();
        cancel_request(&mut stream, 7, 11).await.unwrap();

        let mut buf = BytesMut::from(&stream[..]);
        assert_eq!(16, buf.get_u32());
        assert_eq!(80877102, buf.get_i32());
        assert_eq!(7, buf.get_i32());
        assert_eq!(11, buf.get_i32());
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_writes_directly() {
        let conn = PgConnection::raw(Vec::<u8>::new());
        let stream = conn.terminate().await.unwrap();
        assert_eq!(&[b'X', 0, 0, 0, 4], &stream[..]);
    }
}
