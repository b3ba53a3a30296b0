//! pg_proto.
//!
//! This crate is the frontend protocol engine of a Postgres client: it owns
//! framing, authentication, and the request/response message loops of the
//! v3 wire protocol over a single duplex byte stream, and translates them
//! into command tags, row streams, errors and notifications. Everything
//! above the stream — pooling, reconnection, query building, value codecs,
//! result types — is expected to live in the caller and plug in through
//! small traits.
//!
//! # Overview
//!
//! The crate is organized around a few core concepts:
//!
//! - **Connection establishment** via [`ConnectionBuilder`], with cleartext,
//!   MD5 and SCRAM-SHA-256 authentication and optional TLS negotiation
//! - **Operations** on [`PgConnection`]: simple and extended queries,
//!   prepared statements, COPY streaming, notifications
//! - **Capabilities** the engine consumes: [`QueryFormatter`],
//!   [`ColumnScanner`], [`Model`], [`ProtocolLogger`]
//!
//! # Example: Simple Query
//!
//! ```no_run
//! use pg_proto::{AuthenticationMode, ConnectionBuilder, Verbatim};
//!
//! # #[tokio::main]
//! # async fn main() -> pg_proto::Result<()> {
//! let stream = tokio::net::TcpStream::connect("localhost:5432").await?;
//!
//! let mut conn = ConnectionBuilder::new("postgres")
//!     .database("mydb")
//!     .auth(AuthenticationMode::Password("secret".into()))
//!     .connect(stream)
//!     .await?;
//!
//! let res = conn.query_simple(&Verbatim, "SELECT 1", &[]).await?;
//! println!("{} rows", res.rows_returned());
//! # Ok(())
//! # }
//! ```
//!
//! # Example: Prepared Statements
//!
//! ```no_run
//! # use pg_proto::{PgConnection, Param, TextRows};
//! # async fn example(
//! #     mut conn: PgConnection<tokio::net::TcpStream>,
//! # ) -> pg_proto::Result<()> {
//! let columns = conn.prepare("stmt", "SELECT id, name FROM users WHERE id = $1").await?;
//!
//! let (res, rows) = conn
//!     .bind_execute_with_model("stmt", &[Param::Int4(42)], &columns, |_| Ok(TextRows::new()))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Protocol state
//!
//! Every successful operation leaves the server at ReadyForQuery with the
//! synchronization message fully consumed, so the connection can be handed
//! back to a pool immediately. Server errors inside a response are drained
//! to the same point: the first error is returned and the connection stays
//! usable. Errors that lose synchronization — transport failures, unknown
//! tags, a broken authentication exchange — answer `true` from
//! [`Error::poisons_connection`], and the connection must be discarded.
//!
//! # Cancellation
//!
//! Cancellation is out-of-band: open a second connection and call
//! [`cancel_request`] with the `(process_id, secret_key)` pair captured by
//! the first connection's startup. The running operation observes the
//! cancellation as an ordinary server error at its next protocol boundary.

mod buffer;
mod conn;
mod error;
mod logger;
pub mod messages;
mod model;
mod query;
mod readers;
mod startup;

pub use buffer::WriteBuffer;
pub use conn::{Notification, PgConnection, cancel_request};
pub use error::{
    EncodeError, Error, ModelError, REMOTE_ADDR_FIELD, Result, ServerError,
};
pub use logger::{NopLogger, ProtocolLogger, TracingLogger};
pub use model::{ColumnScanner, Discard, Model, TextRow, TextRows};
pub use query::{Param, QueryAppender, QueryFormatter, QueryResult, Verbatim};
pub use startup::{AuthenticationMode, ConnectionBuilder, ProtocolVersion, negotiate_tls};
