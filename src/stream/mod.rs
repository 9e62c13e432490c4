/// Streaming adapters used by the upload pipeline
pub mod bounded;
pub mod hashing;

pub use bounded::{BoundedReader, FileTooLarge};
pub use hashing::HashingReader;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy buffer size for spool and backend transfers (8 MiB)
pub const COPY_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Copy `reader` into `writer` through one fixed-size buffer
///
/// Returns the number of bytes written. The writer is flushed but not
/// synced; callers that need durability call `sync_all` themselves.
pub async fn copy_buffered<R, W>(reader: &mut R, writer: &mut W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    writer.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_copy_buffered_through_both_adapters() {
        let data = vec![5u8; 3000];
        let mut reader = HashingReader::new(BoundedReader::new(Cursor::new(data.clone()), 4096));
        let mut out = Vec::new();

        let copied = copy_buffered(&mut reader, &mut out).await.unwrap();
        assert_eq!(copied, 3000);
        assert_eq!(out, data);
        assert_eq!(reader.bytes_read(), 3000);
    }

    #[tokio::test]
    async fn test_copy_buffered_stops_on_limit() {
        let mut reader = HashingReader::new(BoundedReader::new(Cursor::new(vec![1u8; 100]), 10));
        let mut out = Vec::new();

        let err = copy_buffered(&mut reader, &mut out).await.unwrap_err();
        assert!(FileTooLarge::from_io(&err).is_some());
        assert_eq!(out.len(), 10);
    }
}
