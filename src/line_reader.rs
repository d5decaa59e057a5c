use memchr::memchr;
use tokio::io::{AsyncRead, AsyncReadExt};

const DEFAULT_BUFFER_SIZE: usize = 16384;

/// Buffered CRLF line reader. Bytes read past the last returned line stay available
/// through `unparsed_data`.
pub struct LineReader {
    buf: Box<[u8]>,
    start_offset: usize,
    end_offset: usize,
}

impl LineReader {
    pub fn new() -> Self {
        Self::new_with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn new_with_buffer_size(buffer_size: usize) -> Self {
        // note that `buffer_size` also represents the maximum line length that can be read.
        Self {
            buf: vec![0u8; buffer_size].into_boxed_slice(),
            start_offset: 0usize,
            end_offset: 0usize,
        }
    }

    fn reset_buf_offset(&mut self) {
        if self.start_offset == 0 {
            return;
        }
        self.buf.copy_within(self.start_offset..self.end_offset, 0);
        self.end_offset -= self.start_offset;
        self.start_offset = 0;
    }

    pub async fn read_line_bytes<T: AsyncRead + Unpin + ?Sized>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<&[u8]> {
        loop {
            match memchr(b'\n', &self.buf[self.start_offset..self.end_offset]) {
                Some(pos) => {
                    let line_start = self.start_offset;
                    let newline_pos = line_start + pos;
                    let line_end = if newline_pos > line_start && self.buf[newline_pos - 1] == b'\r'
                    {
                        newline_pos - 1
                    } else {
                        newline_pos
                    };
                    let new_start_offset = newline_pos + 1;
                    if new_start_offset == self.end_offset {
                        self.start_offset = 0;
                        self.end_offset = 0;
                    } else {
                        self.start_offset = new_start_offset;
                    }
                    // The consumed range stays intact until the next read.
                    return Ok(&self.buf[line_start..line_end]);
                }
                None => {
                    // There are no more newlines.
                    self.read(stream).await?;
                }
            }
        }
    }

    pub async fn read_line<T: AsyncRead + Unpin + ?Sized>(
        &mut self,
        stream: &mut T,
    ) -> std::io::Result<&str> {
        let line_bytes = self.read_line_bytes(stream).await?;
        std::str::from_utf8(line_bytes).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to decode utf8: {e}"),
            )
        })
    }

    pub fn unparsed_data(&self) -> &[u8] {
        &self.buf[self.start_offset..self.end_offset]
    }

    async fn read<T: AsyncRead + Unpin + ?Sized>(&mut self, stream: &mut T) -> std::io::Result<()> {
        if self.is_cache_full() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "line is too long",
            ));
        }

        // Clear the offset so there's space for the next line.
        self.reset_buf_offset();

        loop {
            match stream.read(&mut self.buf[self.end_offset..]).await {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "EOF while reading",
                    ));
                }
                Ok(len) => {
                    self.end_offset += len;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn is_cache_full(&self) -> bool {
        self.start_offset == 0 && self.end_offset == self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_lines_keeps_trailing_data() {
        let mut input: &[u8] = b"GET / HTTP/1.1\r\nHost: a\nrest\x00\x01";
        let mut reader = LineReader::new();
        assert_eq!(reader.read_line(&mut input).await.unwrap(), "GET / HTTP/1.1");
        assert_eq!(reader.read_line(&mut input).await.unwrap(), "Host: a");
        assert_eq!(reader.unparsed_data(), b"rest\x00\x01");
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let data = vec![b'a'; 64];
        let mut input: &[u8] = &data;
        let mut reader = LineReader::new_with_buffer_size(32);
        let err = reader.read_line(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_eof_before_newline() {
        let mut input: &[u8] = b"partial";
        let mut reader = LineReader::new();
        let err = reader.read_line(&mut input).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
