//! Per-stream state and the user-facing stream handle.
//!
//! A [`Stream`] is one reliable ordered byte channel inside a session. The
//! handle is a cheap clone over shared state; the session's receive loop
//! feeds that state from the wire while user tasks drain it. Blocked readers
//! and writers park on oneshot waiters (at most one of each) and are woken by
//! frame arrival, credit grants, resets, or session shutdown.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_lock::Mutex;
use futures::channel::oneshot;
use futures::io::{AsyncRead, AsyncReadExt};

/// Like [`futures::future::BoxFuture`], but also `Sync` so that `Stream`
/// (which holds these across `.await` points behind `&self` methods) stays
/// `Sync` itself.
pub(crate) type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + Sync + 'a>>;

use crate::error::Error;
use crate::frame::{Flags, Frame, Header};
use crate::session::StreamCtx;

/// Lifecycle of a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    /// Created locally, SYN not yet sent.
    Init,
    /// SYN sent, nothing heard back.
    SynSent,
    /// Peer's SYN received, no reply sent yet.
    SynReceived,
    Established,
    /// We sent FIN; the peer may still send data.
    LocalClose,
    /// Peer sent FIN; we may still send data.
    RemoteClose,
    Closed,
    Reset,
}

struct StreamInner {
    state: StreamState,
    /// Set by session force-close; every operation afterwards fails
    /// `SessionShutdown`.
    shutdown: bool,
    recv_buf: VecDeque<u8>,
    /// Credits advertised to the peer and not yet consumed by its data.
    recv_window: u32,
    /// Credits granted by the peer and not yet consumed by our data.
    send_window: u32,
    read_waiter: Option<oneshot::Sender<()>>,
    write_waiter: Option<oneshot::Sender<()>>,
}

impl StreamInner {
    /// Flags to piggyback on the next outgoing frame, advancing the handshake.
    fn send_flags(&mut self) -> Flags {
        match self.state {
            StreamState::Init => {
                self.state = StreamState::SynSent;
                Flags::SYN
            }
            StreamState::SynReceived => {
                self.state = StreamState::Established;
                Flags::ACK
            }
            _ => Flags::default(),
        }
    }

    fn wake_reader(&mut self) {
        if let Some(waiter) = self.read_waiter.take() {
            let _ = waiter.send(());
        }
    }

    fn wake_writer(&mut self) {
        if let Some(waiter) = self.write_waiter.take() {
            let _ = waiter.send(());
        }
    }
}

/// Stream state shared between the session loops and every [`Stream`] handle.
pub(crate) struct SharedStream {
    id: u32,
    ctx: StreamCtx,
    inner: Mutex<StreamInner>,
}

impl SharedStream {
    pub(crate) fn new(id: u32, state: StreamState, ctx: StreamCtx) -> Self {
        let window = ctx.max_window();
        SharedStream {
            id,
            ctx,
            inner: Mutex::new(StreamInner {
                state,
                shutdown: false,
                recv_buf: VecDeque::new(),
                recv_window: window,
                send_window: window,
                read_waiter: None,
                write_waiter: None,
            }),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) async fn is_reset(&self) -> bool {
        self.inner.lock().await.state == StreamState::Reset
    }

    /// Read into `buf`, waiting while the stream is open and empty.
    ///
    /// Returns 0 only on orderly close with the buffer drained.
    pub(crate) async fn read_into(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let waiter = {
                let mut inner = self.inner.lock().await;
                if inner.shutdown {
                    return Err(Error::SessionShutdown);
                }
                if inner.state == StreamState::Reset {
                    return Err(Error::ConnectionReset);
                }
                if !inner.recv_buf.is_empty() {
                    let n = buf.len().min(inner.recv_buf.len());
                    for (dst, byte) in buf.iter_mut().zip(inner.recv_buf.drain(..n)) {
                        *dst = byte;
                    }
                    drop(inner);
                    // The bytes are already handed to the caller; a failed
                    // re-advertisement only happens while the session is
                    // going down and must not turn into a lost read.
                    if let Err(err) = self.send_window_update().await {
                        tracing::debug!(stream = self.id, %err, "window update not sent");
                    }
                    return Ok(n);
                }
                match inner.state {
                    StreamState::RemoteClose | StreamState::Closed => return Ok(0),
                    _ => {
                        let (tx, rx) = oneshot::channel();
                        inner.read_waiter = Some(tx);
                        rx
                    }
                }
            };
            // A dropped waiter just means we lost the slot to a competing
            // reader; re-check the state either way.
            let _ = waiter.await;
        }
    }

    /// Write as much of `buf` as the current send window allows, waiting
    /// while the window is zero. Returns the number of bytes consumed.
    pub(crate) async fn write_chunk(&self, buf: &[u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let step = {
                let mut inner = self.inner.lock().await;
                if inner.shutdown {
                    return Err(Error::SessionShutdown);
                }
                match inner.state {
                    StreamState::Reset => return Err(Error::ConnectionReset),
                    StreamState::LocalClose | StreamState::Closed => {
                        return Err(Error::StreamClosed)
                    }
                    _ => {}
                }
                if inner.send_window == 0 {
                    let (tx, rx) = oneshot::channel();
                    inner.write_waiter = Some(tx);
                    Err(rx)
                } else {
                    let n = (inner.send_window as usize).min(buf.len());
                    let flags = inner.send_flags();
                    inner.send_window -= n as u32;
                    Ok((n, flags))
                }
            };
            match step {
                Ok((n, flags)) => {
                    let frame = Frame::data(flags, self.id, buf[..n].to_vec());
                    self.ctx.wait_for_send(frame).await?;
                    return Ok(n);
                }
                Err(waiter) => {
                    let _ = waiter.await;
                }
            }
        }
    }

    /// Re-advertise receive credit if enough has been consumed, or if
    /// handshake flags are waiting for a carrier frame.
    ///
    /// Credit bookkeeping matches the wire contract: the peer debits its
    /// send window when it transmits, we debit `recv_window` on arrival, and
    /// the delta advertised here restores `recv_buf.len() + recv_window` to
    /// the full window size.
    pub(crate) async fn send_window_update(&self) -> Result<(), Error> {
        let max = self.ctx.max_window();
        let header = {
            let mut inner = self.inner.lock().await;
            let buffered = inner.recv_buf.len() as u32;
            let delta = max - buffered - inner.recv_window;
            let flags = inner.send_flags();
            if delta < max / 2 && flags.is_empty() {
                return Ok(());
            }
            inner.recv_window += delta;
            Header::window_update(flags, self.id, delta)
        };
        self.ctx.wait_for_send(Frame::control(header)).await
    }

    /// Send FIN and transition the local side to closed.
    pub(crate) async fn close(&self) -> Result<(), Error> {
        let (header, remove) = {
            let mut inner = self.inner.lock().await;
            if inner.shutdown {
                return Ok(());
            }
            match inner.state {
                StreamState::LocalClose | StreamState::Closed | StreamState::Reset => {
                    return Ok(())
                }
                _ => {}
            }
            let flags = inner.send_flags() | Flags::FIN;
            let remove = if inner.state == StreamState::RemoteClose {
                inner.state = StreamState::Closed;
                true
            } else {
                inner.state = StreamState::LocalClose;
                false
            };
            (Header::window_update(flags, self.id, 0), remove)
        };
        self.ctx.wait_for_send(Frame::control(header)).await?;
        if remove {
            self.ctx.close_stream(self.id).await;
        }
        Ok(())
    }

    /// Abortively close: send RST and fail all pending operations.
    pub(crate) async fn reset(&self) -> Result<(), Error> {
        {
            let mut inner = self.inner.lock().await;
            if inner.shutdown
                || matches!(inner.state, StreamState::Closed | StreamState::Reset)
            {
                return Ok(());
            }
            inner.state = StreamState::Reset;
            inner.wake_reader();
            inner.wake_writer();
        }
        self.ctx
            .send_no_wait(Header::window_update(Flags::RST, self.id, 0))
            .await;
        self.ctx.close_stream(self.id).await;
        Ok(())
    }

    /// Receive-loop ingest of one data frame body.
    ///
    /// Reads exactly `len` bytes from the transport into the receive buffer.
    /// The window check happens before anything is read so a peer overrun
    /// never allocates for the violating frame.
    pub(crate) async fn ingest_data<R>(&self, reader: &mut R, len: u32) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
    {
        if len == 0 {
            return Ok(());
        }
        {
            let inner = self.inner.lock().await;
            if len > inner.recv_window {
                tracing::warn!(
                    stream = self.id,
                    len,
                    window = inner.recv_window,
                    "peer exceeded the receive window"
                );
                return Err(Error::RecvWindowExceeded(self.id));
            }
        }
        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await?;

        let mut inner = self.inner.lock().await;
        inner.recv_window -= len;
        inner.recv_buf.extend(body);
        inner.wake_reader();
        Ok(())
    }

    /// Receive-loop credit grant from a window update frame.
    pub(crate) async fn credit_send_window(&self, delta: u32) {
        if delta == 0 {
            return;
        }
        let mut inner = self.inner.lock().await;
        inner.send_window = inner.send_window.saturating_add(delta);
        inner.wake_writer();
    }

    /// Apply handshake/teardown flags from a received frame.
    ///
    /// Returns true when the stream must leave the session's table.
    pub(crate) async fn apply_flags(&self, flags: Flags) -> bool {
        let mut inner = self.inner.lock().await;
        // Any frame from the peer acknowledges our SYN.
        if inner.state == StreamState::SynSent {
            inner.state = StreamState::Established;
        }
        let mut remove = false;
        if flags.contains(Flags::FIN) {
            match inner.state {
                StreamState::SynReceived | StreamState::Established => {
                    inner.state = StreamState::RemoteClose;
                }
                StreamState::LocalClose => {
                    inner.state = StreamState::Closed;
                    remove = true;
                }
                other => {
                    tracing::warn!(stream = self.id, state = ?other, "ignoring redundant FIN");
                }
            }
            inner.wake_reader();
        }
        if flags.contains(Flags::RST) {
            inner.state = StreamState::Reset;
            inner.wake_reader();
            inner.wake_writer();
            remove = true;
        }
        remove
    }

    /// Session shutdown: fail everything, wake everyone.
    pub(crate) async fn force_close(&self) {
        let mut inner = self.inner.lock().await;
        inner.shutdown = true;
        if inner.state != StreamState::Reset {
            inner.state = StreamState::Closed;
        }
        inner.wake_reader();
        inner.wake_writer();
    }
}

/// One multiplexed byte stream.
///
/// Handles are cheap to clone and share the underlying stream state. Reads
/// and writes are asynchronous; [`AsyncRead`](futures::io::AsyncRead) and
/// [`AsyncWrite`](futures::io::AsyncWrite) implementations are provided so a
/// stream can serve anywhere a byte transport is expected, including as the
/// transport of a nested session.
pub struct Stream {
    pub(crate) shared: Arc<SharedStream>,
    pub(crate) read_leftover: VecDeque<u8>,
    pub(crate) read_fut: Option<BoxFuture<'static, Result<Vec<u8>, Error>>>,
    pub(crate) write_fut: Option<BoxFuture<'static, Result<usize, Error>>>,
    pub(crate) close_fut: Option<BoxFuture<'static, Result<(), Error>>>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<SharedStream>) -> Self {
        Stream {
            shared,
            read_leftover: VecDeque::new(),
            read_fut: None,
            write_fut: None,
            close_fut: None,
        }
    }

    /// The stream's id within its session.
    pub fn id(&self) -> u32 {
        self.shared.id()
    }

    /// Read up to `buf.len()` bytes, waiting while the stream is open and
    /// empty. Returns 0 only after the peer's orderly close once the buffer
    /// is drained.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionReset`] after a reset, [`Error::SessionShutdown`]
    /// after the session closes.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        self.shared.read_into(buf).await
    }

    /// Write as many bytes as the current send window admits, waiting while
    /// the window is zero. Returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// [`Error::StreamClosed`] once locally closed, [`Error::ConnectionReset`]
    /// after a reset, [`Error::SessionShutdown`] after the session closes.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, Error> {
        self.shared.write_chunk(buf).await
    }

    /// Write the whole buffer, looping over window refills.
    ///
    /// # Errors
    ///
    /// As [`write`](Stream::write).
    pub async fn write_all(&self, mut buf: &[u8]) -> Result<(), Error> {
        while !buf.is_empty() {
            let n = self.shared.write_chunk(buf).await?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Half-close: send FIN. The peer can keep sending until its own close.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the send failure if the FIN frame cannot be delivered.
    pub async fn close(&self) -> Result<(), Error> {
        self.shared.close().await
    }

    /// Abortive close: send RST and fail pending reads and writes on both
    /// sides.
    ///
    /// # Errors
    ///
    /// Currently infallible; the RST is sent best-effort.
    pub async fn reset(&self) -> Result<(), Error> {
        self.shared.reset().await
    }
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        Stream::new(Arc::clone(&self.shared))
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_ctx;
    use futures::executor::block_on;

    fn shared(state: StreamState, window: u32) -> (SharedStream, impl Sized) {
        let (ctx, rx) = test_ctx(window);
        (SharedStream::new(3, state, ctx), rx)
    }

    #[test]
    fn syn_piggybacks_on_first_frame_only() {
        let (stream, _rx) = shared(StreamState::Init, 64);
        block_on(async {
            let mut inner = stream.inner.lock().await;
            assert_eq!(inner.send_flags(), Flags::SYN);
            assert_eq!(inner.state, StreamState::SynSent);
            assert!(inner.send_flags().is_empty());
        });
    }

    #[test]
    fn ack_piggybacks_on_first_reply() {
        let (stream, _rx) = shared(StreamState::SynReceived, 64);
        block_on(async {
            let mut inner = stream.inner.lock().await;
            assert_eq!(inner.send_flags(), Flags::ACK);
            assert_eq!(inner.state, StreamState::Established);
        });
    }

    #[test]
    fn ingest_debits_window_and_buffers() {
        let (stream, _rx) = shared(StreamState::Established, 16);
        block_on(async {
            let mut wire: &[u8] = b"hello";
            stream.ingest_data(&mut wire, 5).await.unwrap();
            let inner = stream.inner.lock().await;
            assert_eq!(inner.recv_window, 11);
            assert_eq!(inner.recv_buf.len(), 5);
        });
    }

    #[test]
    fn ingest_rejects_window_overrun() {
        let (stream, _rx) = shared(StreamState::Established, 4);
        block_on(async {
            let mut wire: &[u8] = b"too much data";
            let err = stream.ingest_data(&mut wire, 13).await.unwrap_err();
            assert!(matches!(err, Error::RecvWindowExceeded(3)));
            // Nothing consumed, nothing buffered.
            assert_eq!(stream.inner.lock().await.recv_buf.len(), 0);
        });
    }

    #[test]
    fn fin_then_drain_reaches_eof() {
        let (stream, _rx) = shared(StreamState::Established, 16);
        block_on(async {
            let mut wire: &[u8] = b"bye";
            stream.ingest_data(&mut wire, 3).await.unwrap();
            assert!(!stream.apply_flags(Flags::FIN).await);
            assert_eq!(
                stream.inner.lock().await.state,
                StreamState::RemoteClose
            );

            let mut buf = [0u8; 8];
            assert_eq!(stream.read_into(&mut buf).await.unwrap(), 3);
            assert_eq!(&buf[..3], b"bye");
            assert_eq!(stream.read_into(&mut buf).await.unwrap(), 0);
        });
    }

    #[test]
    fn rst_discards_buffered_data() {
        let (stream, _rx) = shared(StreamState::Established, 16);
        block_on(async {
            let mut wire: &[u8] = b"stale";
            stream.ingest_data(&mut wire, 5).await.unwrap();
            assert!(stream.apply_flags(Flags::RST).await);

            let mut buf = [0u8; 8];
            assert!(matches!(
                stream.read_into(&mut buf).await,
                Err(Error::ConnectionReset)
            ));
        });
    }

    #[test]
    fn force_close_fails_operations_with_shutdown() {
        let (stream, _rx) = shared(StreamState::Established, 16);
        block_on(async {
            stream.force_close().await;
            let mut buf = [0u8; 8];
            assert!(matches!(
                stream.read_into(&mut buf).await,
                Err(Error::SessionShutdown)
            ));
            assert!(matches!(
                stream.write_chunk(b"x").await,
                Err(Error::SessionShutdown)
            ));
        });
    }

    #[test]
    fn credit_saturates_instead_of_wrapping() {
        let (stream, _rx) = shared(StreamState::Established, 16);
        block_on(async {
            stream.credit_send_window(u32::MAX).await;
            assert_eq!(stream.inner.lock().await.send_window, u32::MAX);
        });
    }
}
