//! Length-prefixed framing for the socket channel.
//!
//! Every socket frame is a `u32` little-endian length followed by a frame
//! body (see [`crate::codec`] for the body layout):
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   body             |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes. A zero length is a
//! valid keepalive frame and is skipped by the reader.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The body size exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    TooLarge {
        /// The declared or actual size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// The connection was closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads length-prefixed frames into a reusable buffer.
pub struct FramedReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_size: usize,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    /// Wrap `reader`, rejecting frames larger than `max_size`.
    pub fn new(reader: R, max_size: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_size,
        }
    }

    /// Read the next non-empty frame body.
    ///
    /// The returned slice borrows the internal buffer and is valid until the
    /// next call. Oversized frames are an error: the stream cannot be
    /// resynchronized after one, so the caller must close the connection.
    pub async fn next_frame(&mut self) -> Result<&[u8], FrameError> {
        loop {
            let mut len_buf = [0u8; 4];
            self.reader.read_exact(&mut len_buf).await.map_err(eof)?;
            let len = u32::from_le_bytes(len_buf) as usize;

            if len > self.max_size {
                return Err(FrameError::TooLarge {
                    size: len,
                    max: self.max_size,
                });
            }
            if len == 0 {
                continue;
            }

            self.buf.resize(len, 0);
            self.reader.read_exact(&mut self.buf).await.map_err(eof)?;
            return Ok(&self.buf);
        }
    }
}

fn eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Write one length-prefixed frame.
///
/// Prefix and body go out in a single write so a frame is never interleaved
/// with another writer's bytes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    body: &[u8],
    max_size: usize,
) -> Result<(), FrameError> {
    if body.len() > max_size || u32::try_from(body.len()).is_err() {
        return Err(FrameError::TooLarge {
            size: body.len(),
            max: max_size,
        });
    }

    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    const MAX: usize = 1_048_576;

    #[tokio::test]
    async fn test_single_frame_roundtrip() {
        let (mut client, server) = duplex(8192);
        let mut reader = FramedReader::new(server, MAX);

        write_frame(&mut client, b"hello world", MAX).await.unwrap();
        assert_eq!(reader.next_frame().await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_multiple_frames_in_sequence() {
        let (mut client, server) = duplex(8192);
        let mut reader = FramedReader::new(server, MAX);

        let frames: Vec<&[u8]> = vec![b"first", b"second", b"third"];
        for frame in &frames {
            write_frame(&mut client, frame, MAX).await.unwrap();
        }
        for expected in &frames {
            assert_eq!(reader.next_frame().await.unwrap(), *expected);
        }
    }

    #[tokio::test]
    async fn test_zero_length_frames_are_skipped() {
        let (mut client, server) = duplex(8192);
        let mut reader = FramedReader::new(server, MAX);

        write_frame(&mut client, b"", MAX).await.unwrap();
        write_frame(&mut client, b"", MAX).await.unwrap();
        write_frame(&mut client, b"data", MAX).await.unwrap();
        assert_eq!(reader.next_frame().await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut client, server) = duplex(8192);
        let mut reader = FramedReader::new(server, 16);

        client.write_all(&100u32.to_le_bytes()).await.unwrap();
        assert!(matches!(
            reader.next_frame().await,
            Err(FrameError::TooLarge { size: 100, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut client, _server) = duplex(8192);
        let result = write_frame(&mut client, &[0u8; 32], 16).await;
        assert!(matches!(result, Err(FrameError::TooLarge { size: 32, max: 16 })));
    }

    #[tokio::test]
    async fn test_connection_closed_mid_frame() {
        let (mut client, server) = duplex(8192);
        let mut reader = FramedReader::new(server, MAX);

        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        assert!(matches!(
            reader.next_frame().await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_connection_closed_between_frames() {
        let (client, server) = duplex(8192);
        let mut reader = FramedReader::new(server, MAX);
        drop(client);
        assert!(matches!(
            reader.next_frame().await,
            Err(FrameError::ConnectionClosed)
        ));
    }
}
