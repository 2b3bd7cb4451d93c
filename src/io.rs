//! futures-io adapters for [`Stream`].
//!
//! The poll implementations drive boxed futures over the stream's async
//! methods, so a `Stream` satisfies the same `AsyncRead + AsyncWrite`
//! contract the session consumes — including as the transport of a nested
//! session.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::io::{AsyncRead, AsyncWrite};
use futures::FutureExt;

use crate::error::Error;
use crate::stream::{SharedStream, Stream};

async fn read_chunk(shared: Arc<SharedStream>, cap: usize) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0u8; cap];
    let n = shared.read_into(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if !this.read_leftover.is_empty() {
                let n = buf.len().min(this.read_leftover.len());
                for (dst, byte) in buf.iter_mut().zip(this.read_leftover.drain(..n)) {
                    *dst = byte;
                }
                return Poll::Ready(Ok(n));
            }
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let cap = buf.len();
            let fut = this
                .read_fut
                .get_or_insert_with(|| Box::pin(read_chunk(Arc::clone(&this.shared), cap)));
            match fut.poll_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => {
                    this.read_fut = None;
                    match result {
                        Ok(chunk) if chunk.is_empty() => return Poll::Ready(Ok(0)),
                        Ok(chunk) => this.read_leftover = chunk.into(),
                        Err(err) => return Poll::Ready(Err(err.into())),
                    }
                }
            }
        }
    }
}

impl AsyncWrite for Stream {
    /// The bytes are captured up front; the returned count always refers to
    /// the buffer the in-flight write started with.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let fut = this.write_fut.get_or_insert_with(|| {
            let shared = Arc::clone(&this.shared);
            let data = buf.to_vec();
            Box::pin(async move { shared.write_chunk(&data).await })
        });
        match fut.poll_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.write_fut = None;
                Poll::Ready(result.map_err(Into::into))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Writes are acknowledged by the send loop before completing, so
        // there is nothing left to flush.
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let fut = this.close_fut.get_or_insert_with(|| {
            let shared = Arc::clone(&this.shared);
            Box::pin(async move { shared.close().await })
        });
        match fut.poll_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.close_fut = None;
                Poll::Ready(result.map_err(Into::into))
            }
        }
    }
}
