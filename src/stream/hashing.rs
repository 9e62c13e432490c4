/// Hashing stream adapter
///
/// Wraps any async byte source and feeds every byte it yields into a running
/// SHA-256 state and a byte counter. The bytes themselves pass through
/// unchanged.
///
/// When the inner source is seekable the adapter is seekable too, but only
/// back to the start: `SeekFrom::Start(0)` reinitialises the digest and
/// zeroes the counter, any other target is rejected. Object store uploads
/// rely on this to retry from a spool file without re-reading the client.
use sha2::{Digest, Sha256};
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};

/// Reader that hashes and counts what passes through it
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    bytes_read: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_read: 0,
        }
    }

    /// Number of bytes yielded since construction or the last rewind
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Lowercase hex SHA-256 of the bytes yielded so far
    ///
    /// Snapshot only: reading further keeps extending the same digest.
    pub fn final_sum(&self) -> String {
        hex::encode(self.hasher.clone().finalize())
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn reset(&mut self) {
        self.hasher = Sha256::new();
        self.bytes_read = 0;
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[before..];
                if !fresh.is_empty() {
                    this.hasher.update(fresh);
                    this.bytes_read += fresh.len() as u64;
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<R: AsyncSeek + Unpin> AsyncSeek for HashingReader<R> {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        if position != SeekFrom::Start(0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "hashing reader can only be rewound to the start",
            ));
        }

        let this = self.get_mut();
        Pin::new(&mut this.inner).start_seek(position)?;
        this.reset();
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.get_mut().inner).poll_complete(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[tokio::test]
    async fn test_passes_bytes_through_and_hashes() {
        let mut reader = HashingReader::new(Cursor::new(b"abc".to_vec()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, b"abc");
        assert_eq!(reader.bytes_read(), 3);
        assert_eq!(reader.final_sum(), ABC_SHA256);
    }

    #[tokio::test]
    async fn test_empty_source() {
        let mut reader = HashingReader::new(Cursor::new(Vec::new()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert!(out.is_empty());
        assert_eq!(reader.bytes_read(), 0);
        assert_eq!(reader.final_sum(), EMPTY_SHA256);
    }

    #[tokio::test]
    async fn test_small_reads_produce_same_digest() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let expected = hex::encode(Sha256::digest(&data));

        let mut reader = HashingReader::new(Cursor::new(data.clone()));
        let mut out = Vec::new();
        let mut chunk = [0u8; 7];
        loop {
            let n = reader.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }

        assert_eq!(out, data);
        assert_eq!(reader.final_sum(), expected);
    }

    #[tokio::test]
    async fn test_rewind_resets_digest_and_counter() {
        let mut reader = HashingReader::new(Cursor::new(b"abc".to_vec()));

        // Partial read, then rewind as a retrying client would
        let mut first = [0u8; 2];
        reader.read_exact(&mut first).await.unwrap();
        assert_eq!(reader.bytes_read(), 2);

        reader.rewind().await.unwrap();
        assert_eq!(reader.bytes_read(), 0);
        assert_eq!(reader.final_sum(), EMPTY_SHA256);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
        assert_eq!(reader.final_sum(), ABC_SHA256);

        // Second full pass yields the same bytes and digest
        reader.seek(SeekFrom::Start(0)).await.unwrap();
        let mut again = Vec::new();
        reader.read_to_end(&mut again).await.unwrap();
        assert_eq!(again, out);
        assert_eq!(reader.bytes_read(), 3);
        assert_eq!(reader.final_sum(), ABC_SHA256);
    }

    #[tokio::test]
    async fn test_other_seeks_are_rejected() {
        let mut reader = HashingReader::new(Cursor::new(b"abcdef".to_vec()));
        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).await.unwrap();

        let err = reader.seek(SeekFrom::Start(1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = reader.seek(SeekFrom::Current(-1)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        // State is untouched by the rejected seeks
        assert_eq!(reader.bytes_read(), 3);
    }
}
