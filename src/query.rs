//! Query text sources, parameter values and command results.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::EncodeError;

/// Formats a SQL query with positional parameters into the write buffer.
///
/// The engine never interprets the SQL text; substitution rules (quoting,
/// placeholders) belong to the formatter. A failed format unwinds the
/// message being built, so nothing reaches the stream.
pub trait QueryFormatter {
    fn format_query(
        &self,
        dst: &mut BytesMut,
        query: &str,
        params: &[Param],
    ) -> Result<(), EncodeError>;
}

/// A pre-bound query that appends its own text.
pub trait QueryAppender {
    fn append_query(&self, dst: &mut BytesMut) -> Result<(), EncodeError>;
}

/// The trivial formatter: appends the SQL text verbatim and accepts no
/// parameters.
pub struct Verbatim;

impl QueryFormatter for Verbatim {
    fn format_query(
        &self,
        dst: &mut BytesMut,
        query: &str,
        params: &[Param],
    ) -> Result<(), EncodeError> {
        if !params.is_empty() {
            return Err("verbatim query takes no parameters".into());
        }
        dst.put_slice(query.as_bytes());
        Ok(())
    }
}

/// A parameter value bound to an extended-query Execute.
///
/// All values are sent in the default text format; the Bind message
/// advertises no per-parameter format codes.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Bytes),
}

impl Param {
    /// Appends the text encoding of the value. Returns `None` for SQL NULL,
    /// in which case nothing was written.
    pub fn append(&self, dst: &mut BytesMut) -> Option<()> {
        match self {
            Param::Null => return None,
            Param::Bool(b) => dst.put_slice(if *b { b"true" } else { b"false" }),
            Param::Int2(v) => dst.put_slice(v.to_string().as_bytes()),
            Param::Int4(v) => dst.put_slice(v.to_string().as_bytes()),
            Param::Int8(v) => dst.put_slice(v.to_string().as_bytes()),
            Param::Float4(v) => dst.put_slice(v.to_string().as_bytes()),
            Param::Float8(v) => dst.put_slice(v.to_string().as_bytes()),
            Param::Text(s) => dst.put_slice(s.as_bytes()),
            Param::Bytea(b) => {
                dst.put_slice(b"\\x");
                for byte in b.iter() {
                    dst.put_slice(format!("{byte:02x}").as_bytes());
                }
            }
        }
        Some(())
    }
}

impl From<i16> for Param {
    fn from(v: i16) -> Self {
        Param::Int2(v)
    }
}

impl From<i32> for Param {
    fn from(v: i32) -> Self {
        Param::Int4(v)
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int8(v)
    }
}

impl From<f32> for Param {
    fn from(v: f32) -> Self {
        Param::Float4(v)
    }
}

impl From<f64> for Param {
    fn from(v: f64) -> Self {
        Param::Float8(v)
    }
}

impl From<bool> for Param {
    fn from(v: bool) -> Self {
        Param::Bool(v)
    }
}

impl From<String> for Param {
    fn from(v: String) -> Self {
        Param::Text(v)
    }
}

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::Text(v.to_string())
    }
}

impl From<Bytes> for Param {
    fn from(v: Bytes) -> Self {
        Param::Bytea(v)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => v.into(),
            None => Param::Null,
        }
    }
}

/// The outcome of one completed operation: the server's command tag plus the
/// number of DataRow messages the reader consumed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    tag: Bytes,
    rows_returned: usize,
}

impl QueryResult {
    pub(crate) fn new(tag: Bytes, rows_returned: usize) -> Self {
        QueryResult { tag, rows_returned }
    }

    /// The textual completion tag, e.g. `SELECT 3` or `INSERT 0 5`. Empty
    /// when the server sent no CommandComplete in the cycle.
    pub fn command_tag(&self) -> &[u8] {
        &self.tag
    }

    /// Rows consumed by the reader in this operation.
    pub fn rows_returned(&self) -> usize {
        self.rows_returned
    }

    /// The affected-row count parsed from the command tag. This is the
    /// authoritative count for INSERT/UPDATE/DELETE; `None` when the tag
    /// carries no count (`CREATE TABLE` and friends, or no tag at all).
    pub fn rows_affected(&self) -> Option<u64> {
        let tag = std::str::from_utf8(&self.tag).ok()?;
        tag.rsplit(' ').next()?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::{Param, QueryFormatter, QueryResult, Verbatim};

    #[test]
    fn test_param_text_encodings() {
        let cases: [(Param, &[u8]); 6] = [
            (Param::Bool(true), b"true"),
            (Param::Int4(-7), b"-7"),
            (Param::Int8(42), b"42"),
            (Param::Float8(1.5), b"1.5"),
            (Param::Text("hi".into()), b"hi"),
            (Param::Bytea(Bytes::from_static(&[0xde, 0xad])), b"\\xdead"),
        ];
        for (param, expected) in cases {
            let mut dst = BytesMut::new();
            assert_eq!(Some(()), param.append(&mut dst));
            assert_eq!(expected, &dst[..]);
        }
    }

    #[test]
    fn test_null_param_writes_nothing() {
        let mut dst = BytesMut::new();
        assert_eq!(None, Param::Null.append(&mut dst));
        assert!(dst.is_empty());
    }

    #[test]
    fn test_verbatim_rejects_params() {
        let mut dst = BytesMut::new();
        let err = Verbatim.format_query(&mut dst, "SELECT $1", &[Param::Int4(1)]);
        assert!(err.is_err());
        assert!(dst.is_empty());
    }

    #[test]
    fn test_rows_affected_from_tag() {
        let res = QueryResult::new(Bytes::from_static(b"INSERT 0 5"), 0);
        assert_eq!(Some(5), res.rows_affected());

        let res = QueryResult::new(Bytes::from_static(b"SELECT 3"), 3);
        assert_eq!(Some(3), res.rows_affected());
        assert_eq!(3, res.rows_returned());

        let res = QueryResult::new(Bytes::from_static(b"CREATE TABLE"), 0);
        assert_eq!(None, res.rows_affected());

        let res = QueryResult::default();
        assert_eq!(None, res.rows_affected());
    }
}
