//! The response readers.
//!
//! Each reader is a message loop over one server response: it dispatches on
//! the tag byte, accepts the side-channel messages (`NoticeResponse`,
//! `ParameterStatus`) at any point, and ends when the protocol reaches its
//! synchronization point.
//!
//! A reader that hits an ErrorResponse mid-response records the first error
//! and keeps draining: the server always finishes the cycle with
//! ReadyForQuery, and the connection is only reusable once that message has
//! been consumed. Returning early would leave unread messages on the stream
//! and poison the connection.

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{
    conn::{Notification, PgConnection},
    error::{Error, ModelError, Result},
    messages::backend::{self, MessageCode},
    model::{ColumnScanner, Discard, Model},
    query::QueryResult,
};

/// A model slot that degrades to [`Discard`] when creation fails, so the
/// response is still drained while the creation error is preserved.
enum ActiveModel<M: Model> {
    Live(M),
    Fallback(Discard),
}

enum ActiveRow<R> {
    Live(R),
    Fallback(Discard),
}

impl<M: Model> ActiveModel<M> {
    /// Builds the model through `make`, resetting it before use. On failure
    /// the error lands in `slot` and rows fall through to [`Discard`].
    fn create(
        make: impl FnOnce() -> std::result::Result<M, ModelError>,
        slot: &mut Option<Error>,
    ) -> Self {
        let build = || -> std::result::Result<M, ModelError> {
            let mut model = make()?;
            model.reset()?;
            Ok(model)
        };
        match build() {
            Ok(model) => ActiveModel::Live(model),
            Err(e) => {
                coalesce(slot, Error::Model(e));
                ActiveModel::Fallback(Discard)
            }
        }
    }

    fn new_row(&mut self) -> ActiveRow<M::Row> {
        match self {
            ActiveModel::Live(m) => ActiveRow::Live(m.new_row()),
            ActiveModel::Fallback(_) => ActiveRow::Fallback(Discard),
        }
    }

    fn add_row(&mut self, row: ActiveRow<M::Row>) -> std::result::Result<(), ModelError> {
        match (self, row) {
            (ActiveModel::Live(m), ActiveRow::Live(r)) => m.add_row(r),
            _ => Ok(()),
        }
    }
}

impl<R: ColumnScanner> ColumnScanner for ActiveRow<R> {
    fn scan_column(
        &mut self,
        index: usize,
        name: &str,
        value: Option<&[u8]>,
    ) -> std::result::Result<(), ModelError> {
        match self {
            ActiveRow::Live(r) => r.scan_column(index, name, value),
            ActiveRow::Fallback(d) => d.scan_column(index, name, value),
        }
    }
}

fn coalesce(slot: &mut Option<Error>, err: Error) {
    if slot.is_none() {
        *slot = Some(err);
    }
}

fn finish<T>(first_err: Option<Error>, ok: T) -> Result<T> {
    match first_err {
        Some(e) => Err(e),
        None => Ok(ok),
    }
}

/// Strips the trailing NUL off a CommandComplete payload.
fn command_tag(mut body: Bytes) -> Bytes {
    if body.last() == Some(&0) {
        body.truncate(body.len() - 1);
    }
    body
}

/// Decodes a RowDescription body into `columns`, keeping only the column
/// names. The storage is reused across queries: entries are overwritten in
/// place and the vector grows only when the field count exceeds its length.
///
/// After the name, each field carries exactly 18 bytes of metadata (table
/// OID, attribute number, type OID, type size, type modifier, format code),
/// which are read and discarded.
pub(crate) fn parse_row_description(
    body: &mut Bytes,
    columns: &mut Vec<Vec<u8>>,
) -> std::io::Result<()> {
    let n = backend::read_i16(body)? as usize;
    if columns.len() < n {
        columns.resize_with(n, Vec::new);
    } else {
        columns.truncate(n);
    }
    for col in columns.iter_mut() {
        let Some(end) = body.iter().position(|&b| b == 0) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "null terminator missing",
            ));
        };
        col.clear();
        col.extend_from_slice(&body[..end]);
        body.advance(end + 1);
        backend::read_exact(body, 18)?;
    }
    Ok(())
}

/// Decodes a DataRow body, handing each column to the scanner. A column
/// length of -1 is SQL NULL and consumes no value bytes.
///
/// Scan errors are per-column: the first is returned in the `Ok` payload
/// while the remaining fields are still consumed. Only a truncated body is
/// an `Err`, which costs the connection its synchronization.
pub(crate) fn read_data_row(
    body: &mut Bytes,
    scanner: &mut dyn ColumnScanner,
    columns: &[Vec<u8>],
) -> std::io::Result<Option<Error>> {
    let mut first_err = None;

    let n = backend::read_i16(body)?;
    for idx in 0..n as usize {
        let len = backend::read_i32(body)?;
        let value = if len == -1 {
            None
        } else {
            Some(backend::read_exact(body, len as usize)?)
        };

        let name_bytes = columns.get(idx).map(Vec::as_slice).unwrap_or_default();
        let name = String::from_utf8_lossy(name_bytes);
        if let Err(e) = scanner.scan_column(idx, &name, value.as_deref())
            && first_err.is_none()
        {
            first_err = Some(Error::Scan {
                column: name.into_owned(),
                source: e,
            });
        }
    }

    Ok(first_err)
}

impl<S> PgConnection<S>
where
    S: AsyncRead + Unpin,
{
    fn server_error(&self, body: Bytes) -> Error {
        Error::Server(crate::error::ServerError::parse(
            body,
            self.remote_addr.clone(),
        ))
    }

    fn log_notice(&self, body: Bytes) {
        let notice = crate::error::ServerError::parse(body, self.remote_addr.clone());
        self.logger.notice(&notice);
    }

    fn log_parameter_status(&self, body: &mut Bytes) -> Result<()> {
        let name = backend::read_cstring(body)?;
        let value = backend::read_cstring(body)?;
        self.logger.parameter_status(&name, &value);
        Ok(())
    }

    /// The untyped simple-query reader: row payloads are discarded, only the
    /// count and the last command tag survive.
    pub(crate) async fn read_simple_query(&mut self) -> Result<QueryResult> {
        let mut first_err = None;
        let mut rows = 0;
        let mut res = None;

        loop {
            let mut frame = backend::read_frame(&mut self.stream).await?;
            match frame.code {
                MessageCode::COMMAND_COMPLETE => {
                    res = Some(QueryResult::new(command_tag(frame.body), rows));
                }
                MessageCode::ROW_DESCRIPTION => {}
                MessageCode::DATA_ROW => rows += 1,
                MessageCode::READY_FOR_QUERY => {
                    let res = res.unwrap_or_else(|| QueryResult::new(Bytes::new(), rows));
                    return finish(first_err, res);
                }
                MessageCode::ERROR_RESPONSE => {
                    let e = self.server_error(frame.body);
                    coalesce(&mut first_err, e);
                }
                MessageCode::NOTICE_RESPONSE => self.log_notice(frame.body),
                MessageCode::PARAMETER_STATUS => self.log_parameter_status(&mut frame.body)?,
                code => {
                    return Err(Error::UnexpectedMessage {
                        reader: "read_simple_query",
                        code,
                    });
                }
            }
        }
    }

    /// The simple-query reader that materializes rows into a model built
    /// from the captured row description.
    pub(crate) async fn read_simple_query_data<M, F>(
        &mut self,
        model_fn: F,
    ) -> Result<(QueryResult, M)>
    where
        M: Model,
        F: FnOnce(&[Vec<u8>]) -> std::result::Result<M, ModelError>,
    {
        let mut first_err = None;
        let mut rows = 0;
        let mut res = None;
        let mut model_fn = Some(model_fn);
        let mut active: Option<ActiveModel<M>> = None;

        loop {
            let mut frame = backend::read_frame(&mut self.stream).await?;
            match frame.code {
                MessageCode::ROW_DESCRIPTION => {
                    parse_row_description(&mut frame.body, &mut self.columns)?;
                    if active.is_none()
                        && let Some(f) = model_fn.take()
                    {
                        active = Some(ActiveModel::create(|| f(&self.columns), &mut first_err));
                    }
                }
                MessageCode::DATA_ROW => {
                    rows += 1;
                    let sink = active.get_or_insert_with(|| ActiveModel::Fallback(Discard));
                    let mut row = sink.new_row();
                    match read_data_row(&mut frame.body, &mut row, &self.columns)? {
                        Some(scan_err) => coalesce(&mut first_err, scan_err),
                        None => {
                            if let Err(e) = sink.add_row(row) {
                                coalesce(&mut first_err, Error::Model(e));
                            }
                        }
                    }
                }
                MessageCode::COMMAND_COMPLETE => {
                    res = Some(QueryResult::new(command_tag(frame.body), rows));
                }
                MessageCode::READY_FOR_QUERY => {
                    let res = res.unwrap_or_else(|| QueryResult::new(Bytes::new(), rows));
                    if let Some(e) = first_err {
                        return Err(e);
                    }
                    return match (active, model_fn) {
                        (Some(ActiveModel::Live(m)), _) => Ok((res, m)),
                        // No row description arrived (DDL and friends):
                        // produce the model empty.
                        (None, Some(f)) => {
                            let mut model = f(&[]).map_err(Error::Model)?;
                            model.reset().map_err(Error::Model)?;
                            Ok((res, model))
                        }
                        _ => Err(Error::Model("result model was discarded".into())),
                    };
                }
                MessageCode::ERROR_RESPONSE => {
                    let e = self.server_error(frame.body);
                    coalesce(&mut first_err, e);
                }
                MessageCode::NOTICE_RESPONSE => self.log_notice(frame.body),
                MessageCode::PARAMETER_STATUS => self.log_parameter_status(&mut frame.body)?,
                code => {
                    return Err(Error::UnexpectedMessage {
                        reader: "read_simple_query_data",
                        code,
                    });
                }
            }
        }
    }

    /// The extended-query reader, consuming the response to a
    /// Bind/Execute/Sync unit.
    pub(crate) async fn read_ext_query(&mut self) -> Result<QueryResult> {
        let mut first_err = None;
        let mut rows = 0;
        let mut res = None;

        loop {
            let mut frame = backend::read_frame(&mut self.stream).await?;
            match frame.code {
                MessageCode::BIND_COMPLETE => {}
                MessageCode::DATA_ROW => rows += 1,
                MessageCode::COMMAND_COMPLETE => {
                    res = Some(QueryResult::new(command_tag(frame.body), rows));
                }
                MessageCode::READY_FOR_QUERY => {
                    let res = res.unwrap_or_else(|| QueryResult::new(Bytes::new(), rows));
                    return finish(first_err, res);
                }
                MessageCode::ERROR_RESPONSE => {
                    let e = self.server_error(frame.body);
                    coalesce(&mut first_err, e);
                }
                MessageCode::NOTICE_RESPONSE => self.log_notice(frame.body),
                MessageCode::PARAMETER_STATUS => self.log_parameter_status(&mut frame.body)?,
                code => {
                    return Err(Error::UnexpectedMessage {
                        reader: "read_ext_query",
                        code,
                    });
                }
            }
        }
    }

    /// The extended-query reader with a model. The column names come from
    /// the caller's prepared statement, so the model is created lazily on
    /// the first DataRow.
    pub(crate) async fn read_ext_query_data<M, F>(
        &mut self,
        columns: &[Vec<u8>],
        model_fn: F,
    ) -> Result<(QueryResult, M)>
    where
        M: Model,
        F: FnOnce(&[Vec<u8>]) -> std::result::Result<M, ModelError>,
    {
        let mut first_err = None;
        let mut rows = 0;
        let mut res = None;
        let mut model_fn = Some(model_fn);
        let mut active: Option<ActiveModel<M>> = None;

        loop {
            let mut frame = backend::read_frame(&mut self.stream).await?;
            match frame.code {
                MessageCode::BIND_COMPLETE => {}
                MessageCode::DATA_ROW => {
                    rows += 1;
                    if active.is_none()
                        && let Some(f) = model_fn.take()
                    {
                        active = Some(ActiveModel::create(|| f(columns), &mut first_err));
                    }
                    let sink = active.get_or_insert_with(|| ActiveModel::Fallback(Discard));
                    let mut row = sink.new_row();
                    match read_data_row(&mut frame.body, &mut row, columns)? {
                        Some(scan_err) => coalesce(&mut first_err, scan_err),
                        None => {
                            if let Err(e) = sink.add_row(row) {
                                coalesce(&mut first_err, Error::Model(e));
                            }
                        }
                    }
                }
                MessageCode::COMMAND_COMPLETE => {
                    res = Some(QueryResult::new(command_tag(frame.body), rows));
                }
                MessageCode::READY_FOR_QUERY => {
                    let res = res.unwrap_or_else(|| QueryResult::new(Bytes::new(), rows));
                    if let Some(e) = first_err {
                        return Err(e);
                    }
                    return match (active, model_fn) {
                        (Some(ActiveModel::Live(m)), _) => Ok((res, m)),
                        (None, Some(f)) => {
                            let mut model = f(columns).map_err(Error::Model)?;
                            model.reset().map_err(Error::Model)?;
                            Ok((res, model))
                        }
                        _ => Err(Error::Model("result model was discarded".into())),
                    };
                }
                MessageCode::ERROR_RESPONSE => {
                    let e = self.server_error(frame.body);
                    coalesce(&mut first_err, e);
                }
                MessageCode::NOTICE_RESPONSE => self.log_notice(frame.body),
                MessageCode::PARAMETER_STATUS => self.log_parameter_status(&mut frame.body)?,
                code => {
                    return Err(Error::UnexpectedMessage {
                        reader: "read_ext_query_data",
                        code,
                    });
                }
            }
        }
    }

    /// Consumes the response to a Parse/Describe/Sync unit and returns the
    /// captured column names.
    ///
    /// Statements without a result set answer NoData rather than
    /// RowDescription; both end up as an empty column list here.
    pub(crate) async fn read_parse_describe_sync(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut first_err = None;
        let mut columns = Vec::new();

        loop {
            let mut frame = backend::read_frame(&mut self.stream).await?;
            match frame.code {
                MessageCode::PARSE_COMPLETE => {}
                MessageCode::ROW_DESCRIPTION => {
                    parse_row_description(&mut frame.body, &mut columns)?;
                }
                MessageCode::PARAMETER_DESCRIPTION => {}
                MessageCode::NO_DATA => {}
                MessageCode::READY_FOR_QUERY => return finish(first_err, columns),
                MessageCode::ERROR_RESPONSE => {
                    let e = self.server_error(frame.body);
                    coalesce(&mut first_err, e);
                }
                MessageCode::NOTICE_RESPONSE => self.log_notice(frame.body),
                MessageCode::PARAMETER_STATUS => self.log_parameter_status(&mut frame.body)?,
                code => {
                    return Err(Error::UnexpectedMessage {
                        reader: "read_parse_describe_sync",
                        code,
                    });
                }
            }
        }
    }

    /// Consumes the response to a Close/Sync unit.
    pub(crate) async fn read_close_complete(&mut self) -> Result<()> {
        let mut first_err = None;

        loop {
            let mut frame = backend::read_frame(&mut self.stream).await?;
            match frame.code {
                MessageCode::CLOSE_COMPLETE => {}
                MessageCode::READY_FOR_QUERY => return finish(first_err, ()),
                MessageCode::ERROR_RESPONSE => {
                    let e = self.server_error(frame.body);
                    coalesce(&mut first_err, e);
                }
                MessageCode::NOTICE_RESPONSE => self.log_notice(frame.body),
                MessageCode::PARAMETER_STATUS => self.log_parameter_status(&mut frame.body)?,
                code => {
                    return Err(Error::UnexpectedMessage {
                        reader: "read_close_complete",
                        code,
                    });
                }
            }
        }
    }

    /// Waits for the server to accept a COPY FROM STDIN. After this returns
    /// the caller streams CopyData, then CopyDone and Sync, then drains with
    /// [`read_ready_for_query`][Self::read_ready_for_query].
    pub(crate) async fn read_copy_in_response(&mut self) -> Result<()> {
        loop {
            let mut frame = backend::read_frame(&mut self.stream).await?;
            match frame.code {
                MessageCode::COPY_IN_RESPONSE => return Ok(()),
                MessageCode::ERROR_RESPONSE => return Err(self.server_error(frame.body)),
                MessageCode::NOTICE_RESPONSE => self.log_notice(frame.body),
                MessageCode::PARAMETER_STATUS => self.log_parameter_status(&mut frame.body)?,
                code => {
                    return Err(Error::UnexpectedMessage {
                        reader: "read_copy_in_response",
                        code,
                    });
                }
            }
        }
    }

    /// Waits for the server to announce a COPY TO STDOUT stream.
    pub(crate) async fn read_copy_out_response(&mut self) -> Result<()> {
        loop {
            let mut frame = backend::read_frame(&mut self.stream).await?;
            match frame.code {
                MessageCode::COPY_OUT_RESPONSE => return Ok(()),
                MessageCode::ERROR_RESPONSE => return Err(self.server_error(frame.body)),
                MessageCode::NOTICE_RESPONSE => self.log_notice(frame.body),
                MessageCode::PARAMETER_STATUS => self.log_parameter_status(&mut frame.body)?,
                code => {
                    return Err(Error::UnexpectedMessage {
                        reader: "read_copy_out_response",
                        code,
                    });
                }
            }
        }
    }

    /// Streams CopyData frames into `dst` until the server completes the
    /// COPY and returns to idle.
    pub(crate) async fn read_copy_data<W>(&mut self, dst: &mut W) -> Result<QueryResult>
    where
        W: AsyncWrite + Unpin,
    {
        let mut res = None;

        loop {
            let mut frame = backend::read_frame(&mut self.stream).await?;
            match frame.code {
                MessageCode::COPY_DATA => dst.write_all(&frame.body).await?,
                MessageCode::COPY_DONE => {}
                MessageCode::COMMAND_COMPLETE => {
                    res = Some(QueryResult::new(command_tag(frame.body), 0));
                }
                MessageCode::READY_FOR_QUERY => return Ok(res.unwrap_or_default()),
                MessageCode::ERROR_RESPONSE => return Err(self.server_error(frame.body)),
                MessageCode::NOTICE_RESPONSE => self.log_notice(frame.body),
                MessageCode::PARAMETER_STATUS => self.log_parameter_status(&mut frame.body)?,
                code => {
                    return Err(Error::UnexpectedMessage {
                        reader: "read_copy_data",
                        code,
                    });
                }
            }
        }
    }

    /// Drains to the next ReadyForQuery, keeping the last command tag. Used
    /// after the client side of a COPY finishes.
    pub(crate) async fn read_ready_for_query(&mut self) -> Result<QueryResult> {
        let mut first_err = None;
        let mut res = None;

        loop {
            let mut frame = backend::read_frame(&mut self.stream).await?;
            match frame.code {
                MessageCode::COMMAND_COMPLETE => {
                    res = Some(QueryResult::new(command_tag(frame.body), 0));
                }
                MessageCode::READY_FOR_QUERY => {
                    return finish(first_err, res.unwrap_or_default());
                }
                MessageCode::ERROR_RESPONSE => {
                    let e = self.server_error(frame.body);
                    coalesce(&mut first_err, e);
                }
                MessageCode::NOTICE_RESPONSE => self.log_notice(frame.body),
                MessageCode::PARAMETER_STATUS => self.log_parameter_status(&mut frame.body)?,
                code => {
                    return Err(Error::UnexpectedMessage {
                        reader: "read_ready_for_query",
                        code,
                    });
                }
            }
        }
    }

    /// Blocks until a NotificationResponse arrives. Synchronous completions
    /// from an earlier LISTEN pass through silently, so the same loop works
    /// both right after the LISTEN and on an idle connection.
    pub(crate) async fn read_notification(&mut self) -> Result<Notification> {
        loop {
            let mut frame = backend::read_frame(&mut self.stream).await?;
            match frame.code {
                MessageCode::NOTIFICATION_RESPONSE => {
                    let process_id = backend::read_i32(&mut frame.body)?;
                    let channel = backend::read_cstring(&mut frame.body)?;
                    let payload = backend::read_cstring(&mut frame.body)?;
                    return Ok(Notification {
                        process_id,
                        channel,
                        payload,
                    });
                }
                MessageCode::COMMAND_COMPLETE => {}
                MessageCode::READY_FOR_QUERY => {}
                MessageCode::ERROR_RESPONSE => return Err(self.server_error(frame.body)),
                MessageCode::NOTICE_RESPONSE => self.log_notice(frame.body),
                MessageCode::PARAMETER_STATUS => self.log_parameter_status(&mut frame.body)?,
                code => {
                    return Err(Error::UnexpectedMessage {
                        reader: "read_notification",
                        code,
                    });
                }
            }
        }
    }
}
