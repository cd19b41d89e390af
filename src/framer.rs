use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol;

/// Longest line accepted before the stream is considered corrupt.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Splits a byte stream into LF-terminated lines.
///
/// Only complete lines are returned; a short read is buffered until the
/// terminator arrives. When the stream closes, buffered bytes are returned
/// as a final line and every later call yields `Ok(None)`.
#[derive(Debug)]
pub struct LineFramer<R> {
    reader: R,
    buf: BytesMut,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineFramer<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, buf: BytesMut::with_capacity(8 * 1024), eof: false }
    }

    pub async fn read_next(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = protocol::try_extract_line(&mut self.buf) {
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let rest = self.buf.split();
                let line = String::from_utf8_lossy(&rest);
                return Ok(Some(line.trim_end_matches('\r').to_string()));
            }
            if self.buf.len() > MAX_LINE_LENGTH {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {} bytes", MAX_LINE_LENGTH),
                ));
            }
            self.buf.reserve(4096);
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                self.eof = true;
            }
        }
    }

    /// Bytes received but not yet returned as a line.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
