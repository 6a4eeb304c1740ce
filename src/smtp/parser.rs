use std::{io, pin::Pin, task::Context, task::Poll, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
    time::timeout,
};

use super::stream::SmtpStream;

const READ_BUFFER: usize = 4096;

/// How much of the message body may sit between the parser and a slow
/// `on_data` reader before the transport stops being read.
pub const DATA_PIPE_CAPACITY: usize = 16 * 1024;

/// Byte totals observed while draining a DATA payload.
#[derive(Debug, Clone, Copy)]
pub struct DataSummary {
    /// Message bytes as received on the wire (pre-unstuffing), excluding
    /// the terminating `.<CR><LF>` line.
    pub bytes: u64,
}

/// The readable end of the DATA sink handed to the `on_data` hook.
///
/// Yields the dot-unstuffed message body and reaches end-of-stream once
/// the client has sent the `<CR><LF>.<CR><LF>` terminator.
pub struct BodyStream {
    inner: DuplexStream,
}

impl BodyStream {
    pub(crate) fn new(inner: DuplexStream) -> Self {
        Self { inner }
    }
}

impl AsyncRead for BodyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// Position within the CRLF-framed DATA stream, tracked so that the
/// `<CR><LF>.<CR><LF>` terminator and leading-dot stuffing are recognized
/// regardless of how the bytes were chunked by the transport.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum DataState {
    /// At the beginning of a line.
    Bol,
    /// Line opened with a single `.` whose meaning is not yet known.
    Dot,
    /// Seen `.` then CR; one more LF makes this the terminator.
    DotCr,
    InLine,
    /// Seen CR inside a line; LF would close it.
    Cr,
}

/// Incremental protocol reader with two modes.
///
/// In COMMAND mode [`Self::next_line`] yields one CRLF-terminated command
/// line at a time; no further input is consumed until it is called again,
/// which is what serializes handler execution. [`Self::read_data`] switches
/// to DATA mode until the terminator, after which any bytes the client
/// pipelined behind the terminator remain buffered for COMMAND mode.
#[derive(Default)]
pub struct LineParser {
    buf: Vec<u8>,
}

impl LineParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard any buffered input. Used when the transport is being
    /// replaced underneath the parser (STARTTLS), where plaintext bytes
    /// pipelined behind the upgrade must not be interpreted.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Read once from the transport into the buffer, returning the number
    /// of bytes added (0 means the peer closed).
    pub(crate) async fn fill<S>(&mut self, stream: &mut SmtpStream<S>) -> io::Result<usize>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    {
        let mut chunk = [0; READ_BUFFER];
        let read = stream.receive(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    /// Produce the next command line, without its CRLF terminator.
    ///
    /// Lone CR or LF bytes are tolerated as part of the line; only CRLF
    /// ends it. Returns `Ok(None)` once the peer has closed the stream,
    /// and `ErrorKind::TimedOut` if the peer idles past `idle`.
    pub(crate) async fn next_line<S>(
        &mut self,
        stream: &mut SmtpStream<S>,
        idle: Duration,
    ) -> io::Result<Option<Vec<u8>>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|window| window == b"\r\n") {
                let mut line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                line.truncate(pos);
                return Ok(Some(line));
            }

            let read = timeout(idle, self.fill(stream))
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;

            if read == 0 {
                return Ok(None);
            }
        }
    }

    /// Drain the DATA payload into `sink`, unstuffing leading dots, until
    /// the terminator line.
    ///
    /// The sink is closed (end-of-stream) when the terminator arrives. If
    /// the sink's reader goes away early the remaining payload is still
    /// consumed and discarded, so the protocol stays in sync. The byte
    /// count keeps growing past any size limit; enforcement is the DATA
    /// handler's concern.
    pub(crate) async fn read_data<S>(
        &mut self,
        stream: &mut SmtpStream<S>,
        mut sink: DuplexStream,
        idle: Duration,
    ) -> io::Result<DataSummary>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    {
        // DATA always starts at a line boundary, which makes the initial
        // CRLF of the terminator sequence implicit.
        let mut state = DataState::Bol;
        let mut bytes: u64 = 0;
        let mut sink_open = true;

        loop {
            if self.buf.is_empty() {
                let read = timeout(idle, self.fill(stream))
                    .await
                    .map_err(|_| io::Error::from(io::ErrorKind::TimedOut))??;

                if read == 0 {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
            }

            let mut out = Vec::with_capacity(self.buf.len());
            let mut consumed = 0;
            let mut finished = false;

            for (idx, &byte) in self.buf.iter().enumerate() {
                consumed = idx + 1;
                bytes += 1;

                state = match (state, byte) {
                    (DataState::Bol, b'.') => DataState::Dot,
                    (DataState::Bol | DataState::InLine, b'\r') => {
                        out.push(byte);
                        DataState::Cr
                    }
                    (DataState::Bol | DataState::InLine, _) => {
                        out.push(byte);
                        DataState::InLine
                    }
                    (DataState::Dot, b'\r') => DataState::DotCr,
                    (DataState::Dot, b'.') => {
                        // A line beginning `..` loses one dot.
                        out.push(b'.');
                        DataState::InLine
                    }
                    (DataState::Dot, _) => {
                        out.push(b'.');
                        out.push(byte);
                        DataState::InLine
                    }
                    (DataState::DotCr, b'\n') => {
                        finished = true;
                        DataState::Bol
                    }
                    (DataState::DotCr, b'\r') => {
                        out.extend_from_slice(b".\r");
                        out.push(byte);
                        DataState::Cr
                    }
                    (DataState::DotCr, _) => {
                        out.extend_from_slice(b".\r");
                        out.push(byte);
                        DataState::InLine
                    }
                    (DataState::Cr, b'\n') => {
                        out.push(byte);
                        DataState::Bol
                    }
                    (DataState::Cr, b'\r') => {
                        out.push(byte);
                        DataState::Cr
                    }
                    (DataState::Cr, _) => {
                        out.push(byte);
                        DataState::InLine
                    }
                };

                if finished {
                    break;
                }
            }

            self.buf.drain(..consumed);

            if sink_open && !out.is_empty() && sink.write_all(&out).await.is_err() {
                sink_open = false;
            }

            if finished {
                // The terminator line itself is not part of the payload.
                bytes = bytes.saturating_sub(3);
                let _ = sink.shutdown().await;
                return Ok(DataSummary { bytes });
            }
        }
    }
}
