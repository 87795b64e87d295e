use std::io;

use bytes::{Bytes, BytesMut};
use itertools::Itertools;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest line accepted, CRLF excluded. Job bodies travel inline, so this
/// also bounds the size of a job.
pub const MAX_LINE_LEN: usize = 1024 * 1024;

/// Splits a byte stream into CRLF-terminated lines.
pub struct LineReader<T> {
    /// Bytes read but not yet returned as part of a line.
    buf: BytesMut,
    /// How much of `buf` is known to hold no CRLF. The last scanned byte may
    /// still be the `\r` of a CRLF split across reads, so scanning resumes
    /// one byte before this.
    scanned: usize,
    reader: T,
    /// A read error held back until the lines buffered before it are out.
    pending_error: Option<io::Error>,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Returns the next line without its CRLF, or `None` at the end of the
    /// stream. A partial line left at the end of the stream is dropped.
    ///
    /// Cancel-safe: the only await is a single `read_buf` into the internal
    /// buffer, so no received bytes are lost if the future is dropped.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(line) = self.split_line()? {
                return Ok(Some(line));
            }

            if let Some(e) = self.pending_error.take() {
                return Err(e);
            }

            let n = match self.reader.read_buf(&mut self.buf).await {
                Ok(n) => n,
                Err(e) => {
                    // Lines already buffered are still worth returning.
                    self.pending_error = Some(e);
                    continue;
                },
            };

            if n == 0 {
                return Ok(None);
            }
        }
    }

    /// Takes the first complete line out of the buffer, if there is one.
    fn split_line(&mut self) -> io::Result<Option<Bytes>> {
        let from = self.scanned.saturating_sub(1);
        let found = self
            .buf
            .iter()
            .skip(from)
            .tuple_windows::<(_, _)>()
            .position(|pair| pair == (&b'\r', &b'\n'));

        match found {
            Some(at) => {
                let mut line = self.buf.split_to(from + at + 2);
                line.truncate(line.len() - 2);
                self.scanned = 0;
                Ok(Some(line.freeze()))
            },
            None if self.buf.len() > MAX_LINE_LEN + 1 => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "line too long",
            )),
            None => {
                self.scanned = self.buf.len();
                Ok(None)
            },
        }
    }
}

impl<T> From<T> for LineReader<T> {
    fn from(reader: T) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            reader,
            pending_error: None,
        }
    }
}
