//! Adapt Tokio I/O to the `hyper` 1.x runtime traits.
//!
//! Both ends of an HTTP/1 exchange in this crate are driven by hyper over a
//! Tokio stream: [`Http1Transport`](crate::transport::Http1Transport) on the
//! client side, and the in-memory servers used in tests. [`TokioIo`] is the
//! adapter between the two I/O models. Writes keep their vectored path, so
//! hyper can send headers and body chunks in one gathered write when the
//! stream supports it.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};

/// A Tokio stream usable as [`hyper::rt::Read`] and [`hyper::rt::Write`].
#[derive(Debug)]
#[pin_project::pin_project]
pub struct TokioIo<T> {
    #[pin]
    io: T,
}

impl<T> TokioIo<T> {
    /// Wrap a Tokio stream.
    pub fn new(io: T) -> Self {
        Self { io }
    }

    /// A reference to the wrapped stream.
    pub fn get_ref(&self) -> &T {
        &self.io
    }

    /// Unwrap the stream.
    pub fn into_inner(self) -> T {
        self.io
    }
}

impl<T> From<T> for TokioIo<T> {
    fn from(io: T) -> Self {
        Self::new(io)
    }
}

impl<T: AsyncRead> hyper::rt::Read for TokioIo<T> {
    #[allow(unsafe_code)]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut cursor: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        // SAFETY: the Tokio buffer never de-initializes bytes, and the cursor
        // is advanced by exactly the count Tokio reports as filled.
        unsafe {
            let mut unfilled = tokio::io::ReadBuf::uninit(cursor.as_mut());
            ready!(self.project().io.poll_read(cx, &mut unfilled))?;
            let read = unfilled.filled().len();
            cursor.advance(read);
        }
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite> hyper::rt::Write for TokioIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().io.poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().io.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().io.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {

    use hyper::rt::{Read as _, Write as _};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;

    /// Records how each write arrived.
    #[derive(Debug, Default)]
    struct Gather {
        written: Vec<u8>,
        vectored_calls: usize,
    }

    impl AsyncWrite for Gather {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.written.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_write_vectored(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            bufs: &[io::IoSlice<'_>],
        ) -> Poll<io::Result<usize>> {
            self.vectored_calls += 1;
            let mut total = 0;
            for buf in bufs {
                self.written.extend_from_slice(buf);
                total += buf.len();
            }
            Poll::Ready(Ok(total))
        }

        fn is_write_vectored(&self) -> bool {
            true
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn bytes_cross_the_bridge() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut io = TokioIo::new(client);

        std::future::poll_fn(|cx| Pin::new(&mut io).poll_write(cx, b"ping"))
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        let mut storage = [std::mem::MaybeUninit::<u8>::uninit(); 8];
        let mut read = hyper::rt::ReadBuf::uninit(&mut storage);
        std::future::poll_fn(|cx| Pin::new(&mut io).poll_read(cx, read.unfilled()))
            .await
            .unwrap();
        assert_eq!(read.filled(), b"pong");
    }

    #[tokio::test]
    async fn vectored_writes_reach_the_stream() {
        let mut io = TokioIo::new(Gather::default());
        assert!(io.is_write_vectored());

        let head = io::IoSlice::new(b"HTTP/1.1 200 OK\r\n\r\n");
        let body = io::IoSlice::new(b"hello");
        let written = std::future::poll_fn(|cx| {
            Pin::new(&mut io).poll_write_vectored(cx, &[head, body])
        })
        .await
        .unwrap();

        assert_eq!(written, 24);
        let inner = io.into_inner();
        assert_eq!(inner.vectored_calls, 1);
        assert_eq!(inner.written, b"HTTP/1.1 200 OK\r\n\r\nhello");
    }
}
