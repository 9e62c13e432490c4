/// Bounded reader
///
/// Fail-fast wrapper that yields at most `limit` bytes from its source. Once
/// the budget is spent a single one-byte probe tells a source that ended
/// exactly on the limit apart from one that would have produced more. In the
/// latter case the reader enters the exceeded state and every read, then and
/// after, returns a `FileTooLarge` error. Reads after a natural EOF keep
/// returning EOF.
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Error carried inside the `io::Error` returned when the budget is exceeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream exceeds the limit of {limit} bytes")]
pub struct FileTooLarge {
    pub limit: u64,
}

impl FileTooLarge {
    fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }

    /// Extract the marker from an `io::Error`, if that is what it carries
    pub fn from_io(err: &io::Error) -> Option<Self> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<FileTooLarge>())
            .copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Reading,
    Eof,
    Exceeded,
}

/// Reader with a remaining-bytes budget
pub struct BoundedReader<R> {
    inner: R,
    limit: u64,
    remaining: u64,
    state: State,
}

impl<R> BoundedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            limit,
            remaining: limit,
            state: State::Reading,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes handed out so far
    pub fn consumed(&self) -> u64 {
        self.limit - self.remaining
    }

    pub fn is_exceeded(&self) -> bool {
        self.state == State::Exceeded
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for BoundedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.state {
            State::Exceeded => return Poll::Ready(Err(FileTooLarge { limit: this.limit }.into_io())),
            State::Eof => return Poll::Ready(Ok(())),
            State::Reading => {}
        }

        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.remaining == 0 {
            // Budget spent: probe for one more byte
            let mut probe = [0u8; 1];
            let mut probe_buf = ReadBuf::new(&mut probe);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut probe_buf))?;

            return if probe_buf.filled().is_empty() {
                this.state = State::Eof;
                Poll::Ready(Ok(()))
            } else {
                this.state = State::Exceeded;
                Poll::Ready(Err(FileTooLarge { limit: this.limit }.into_io()))
            };
        }

        let max = usize::try_from(this.remaining)
            .unwrap_or(usize::MAX)
            .min(buf.remaining());

        let n = {
            let window = buf.initialize_unfilled_to(max);
            let mut clamped = ReadBuf::new(window);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut clamped))?;
            clamped.filled().len()
        };

        if n == 0 {
            this.state = State::Eof;
        } else {
            buf.advance(n);
            this.remaining -= n as u64;
        }

        Poll::Ready(Ok(()))
    }
}
