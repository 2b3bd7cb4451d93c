//! Session multiplexing over one reliable transport.
//!
//! A session owns the transport and runs two permanent background loops: the
//! receive loop parses frames off the read half and dispatches them to the
//! stream table, the ping table, or the go-away handler; the send loop is the
//! only writer of the transport, draining a bounded queue so frames from many
//! streams are byte-serialized. Both loops live inside a [`SessionDriver`]
//! future which the caller spawns; shutting the session down aborts them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_lock::{Mutex, RwLock};
use futures::channel::{mpsc, oneshot};
use futures::future::BoxFuture;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use futures::stream::{AbortHandle, Abortable};
use futures::{FutureExt, SinkExt, StreamExt};
use futures_timer::Delay;

use crate::config::Config;
use crate::error::Error;
use crate::frame::{Flags, Frame, FrameType, GoAwayCode, Header, HEADER_SIZE};
use crate::stream::{SharedStream, Stream, StreamState};

/// Depth of the serialized send queue. Bounded so a slow transport exerts
/// backpressure on writers instead of growing memory.
const SEND_QUEUE_DEPTH: usize = 64;

/// Which side of the connection this session is.
///
/// The role decides stream-id parity: clients open odd ids, servers even.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_stream_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn local_parity(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 0,
        }
    }
}

/// One queued write: a frame plus an optional acknowledgement the send loop
/// fires once the bytes are on the transport.
pub(crate) struct SendRequest {
    frame: Frame,
    ack: Option<oneshot::Sender<Result<(), Error>>>,
}

#[derive(Default)]
struct PingTable {
    next_id: u32,
    pending: HashMap<u32, oneshot::Sender<()>>,
}

#[derive(Default)]
struct Shutdown {
    done: bool,
    cause: Option<Error>,
}

/// Everything a stream needs from its session: the send queue, the window
/// size, and a non-owning way back to the stream table. Streams never hold a
/// strong session reference, so session and streams cannot keep each other
/// alive.
pub(crate) struct StreamCtx {
    send_tx: mpsc::Sender<SendRequest>,
    window: u32,
    session: Weak<SessionShared>,
}

impl StreamCtx {
    pub(crate) fn max_window(&self) -> u32 {
        self.window
    }

    pub(crate) async fn wait_for_send(&self, frame: Frame) -> Result<(), Error> {
        enqueue_wait(&self.send_tx, frame).await
    }

    pub(crate) async fn send_no_wait(&self, header: Header) {
        enqueue_no_wait(&self.send_tx, header).await;
    }

    pub(crate) async fn close_stream(&self, id: u32) {
        if let Some(session) = self.session.upgrade() {
            session.remove_stream(id).await;
        }
    }
}

/// Enqueue a frame and wait for the send loop to report the write outcome.
///
/// Must only be called from tasks holding no locks: the queue is bounded and
/// the wait lasts until the transport accepted the bytes.
async fn enqueue_wait(sender: &mpsc::Sender<SendRequest>, frame: Frame) -> Result<(), Error> {
    let (ack, outcome) = oneshot::channel();
    let mut sender = sender.clone();
    sender
        .send(SendRequest {
            frame,
            ack: Some(ack),
        })
        .await
        .map_err(|_| Error::SessionShutdown)?;
    match outcome.await {
        Ok(result) => result,
        Err(_) => Err(Error::SessionShutdown),
    }
}

/// Enqueue a control frame without waiting for the write outcome. Dropped
/// silently while the session is shutting down.
async fn enqueue_no_wait(sender: &mpsc::Sender<SendRequest>, header: Header) {
    let mut sender = sender.clone();
    let request = SendRequest {
        frame: Frame::control(header),
        ack: None,
    };
    if sender.send(request).await.is_err() {
        tracing::trace!(?header, "dropping control frame during shutdown");
    }
}

pub(crate) struct SessionShared {
    role: Role,
    config: Config,
    next_stream_id: AtomicU32,
    streams: RwLock<HashMap<u32, Arc<SharedStream>>>,
    accept_tx: async_channel::Sender<Arc<SharedStream>>,
    accept_rx: async_channel::Receiver<Arc<SharedStream>>,
    send_tx: mpsc::Sender<SendRequest>,
    pings: Mutex<PingTable>,
    local_go_away: AtomicBool,
    remote_go_away: AtomicBool,
    is_shutdown: AtomicBool,
    shutdown: Mutex<Shutdown>,
    /// Receive loop, send loop, keepalive — in that order.
    aborts: [AbortHandle; 3],
}

impl SessionShared {
    fn stream_ctx(self: &Arc<Self>) -> StreamCtx {
        StreamCtx {
            send_tx: self.send_tx.clone(),
            window: self.config.max_stream_window_size,
            session: Arc::downgrade(self),
        }
    }

    async fn wait_for_send(&self, frame: Frame) -> Result<(), Error> {
        enqueue_wait(&self.send_tx, frame).await
    }

    async fn send_no_wait(&self, header: Header) {
        enqueue_no_wait(&self.send_tx, header).await;
    }

    fn allocate_stream_id(&self) -> Result<u32, Error> {
        let mut id = self.next_stream_id.load(Ordering::SeqCst);
        loop {
            if id >= u32::MAX - 1 {
                return Err(Error::StreamsExhausted);
            }
            match self.next_stream_id.compare_exchange(
                id,
                id + 2,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(id),
                Err(current) => id = current,
            }
        }
    }

    pub(crate) async fn remove_stream(&self, id: u32) {
        if self.streams.write().await.remove(&id).is_some() {
            tracing::debug!(stream = id, "stream left the table");
        }
    }

    async fn shutdown_cause(&self) -> Error {
        self.shutdown
            .lock()
            .await
            .cause
            .clone()
            .unwrap_or(Error::SessionShutdown)
    }

    /// Record `err` as the shutdown cause and tear the session down.
    async fn exit_with(&self, err: Error) {
        tracing::debug!(%err, "session terminating");
        self.shutdown_with(err).await;
    }

    /// Idempotent teardown: abort the loops, close the accept queue,
    /// force-close every stream, fail every pending ping.
    async fn shutdown_with(&self, cause: Error) {
        {
            let mut shutdown = self.shutdown.lock().await;
            if shutdown.done {
                return;
            }
            shutdown.done = true;
            shutdown.cause.get_or_insert(cause);
        }
        self.is_shutdown.store(true, Ordering::SeqCst);
        for handle in &self.aborts {
            handle.abort();
        }
        self.accept_rx.close();
        let drained: Vec<Arc<SharedStream>> = {
            let mut streams = self.streams.write().await;
            streams.drain().map(|(_, stream)| stream).collect()
        };
        for stream in &drained {
            stream.force_close().await;
        }
        self.pings.lock().await.pending.clear();
        tracing::debug!("session closed");
    }

    async fn ping(&self) -> Result<Duration, Error> {
        if self.is_shutdown.load(Ordering::SeqCst) {
            return Err(Error::SessionShutdown);
        }
        let (id, response) = {
            let mut pings = self.pings.lock().await;
            let id = pings.next_id;
            pings.next_id = pings.next_id.wrapping_add(1);
            let (tx, rx) = oneshot::channel();
            pings.pending.insert(id, tx);
            (id, rx)
        };
        if let Err(err) = self
            .wait_for_send(Frame::control(Header::ping(Flags::SYN, id)))
            .await
        {
            self.pings.lock().await.pending.remove(&id);
            return Err(err);
        }
        let start = Instant::now();
        match response.await {
            Ok(()) => Ok(start.elapsed()),
            // Waiter dropped by shutdown.
            Err(_) => Err(Error::SessionShutdown),
        }
    }

    async fn handle_ping(&self, header: Header) {
        let ping_id = header.length();
        if header.flags().contains(Flags::SYN) {
            // Answer on the non-blocking path; dropped only at shutdown.
            self.send_no_wait(Header::ping(Flags::ACK, ping_id)).await;
            return;
        }
        match self.pings.lock().await.pending.remove(&ping_id) {
            Some(waiter) => {
                let _ = waiter.send(());
            }
            None => tracing::warn!(ping_id, "unsolicited ping response"),
        }
    }

    fn handle_go_away(&self, header: Header) -> Result<(), Error> {
        match GoAwayCode::try_from(header.length())? {
            GoAwayCode::Normal => {
                tracing::debug!("remote has stopped accepting streams");
                self.remote_go_away.store(true, Ordering::SeqCst);
                Ok(())
            }
            GoAwayCode::ProtocolError => Err(Error::RemoteProtocolError),
            GoAwayCode::InternalError => Err(Error::RemoteInternalError),
        }
    }

    /// Handle a data or window update frame.
    async fn handle_stream_frame<R>(
        self: &Arc<Self>,
        reader: &mut R,
        header: Header,
    ) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
    {
        let id = header.stream_id();
        let flags = header.flags();
        let is_data = header.frame_type() == FrameType::Data;

        // A new incoming stream is constructed now but enters the table only
        // after the whole frame is consumed, so a mid-frame transport failure
        // never leaves a half-initialized entry behind.
        let mut incoming: Option<Arc<SharedStream>> = None;
        if flags.contains(Flags::SYN) {
            match self.begin_incoming(id).await? {
                Some(stream) => incoming = Some(stream),
                None => {
                    // Refused under local go-away; keep framing in sync.
                    if is_data {
                        discard_body(reader, u64::from(header.length())).await?;
                    }
                    return Ok(());
                }
            }
        }

        let stream = match &incoming {
            Some(stream) => Arc::clone(stream),
            None => {
                // Clone out of the table before awaiting anything.
                let known = self.streams.read().await.get(&id).cloned();
                match known {
                    Some(stream) => stream,
                    None => {
                        self.send_no_wait(Header::go_away(GoAwayCode::ProtocolError))
                            .await;
                        return Err(Error::MissingStream(id));
                    }
                }
            }
        };

        if is_data {
            match stream.ingest_data(reader, header.length()).await {
                Ok(()) => {}
                Err(err @ Error::RecvWindowExceeded(_)) => {
                    self.send_no_wait(Header::go_away(GoAwayCode::ProtocolError))
                        .await;
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        } else {
            stream.credit_send_window(header.length()).await;
        }

        if stream.apply_flags(flags).await {
            self.remove_stream(id).await;
        }

        if let Some(stream) = incoming {
            self.finish_incoming(stream).await;
        }
        Ok(())
    }

    /// Validate an incoming SYN. Returns the new stream, or `None` when it
    /// was refused with a reset.
    async fn begin_incoming(
        self: &Arc<Self>,
        id: u32,
    ) -> Result<Option<Arc<SharedStream>>, Error> {
        if self.local_go_away.load(Ordering::SeqCst) {
            tracing::debug!(stream = id, "resetting incoming stream while going away");
            self.send_no_wait(Header::window_update(Flags::RST, id, 0))
                .await;
            return Ok(None);
        }
        if id == 0 || id % 2 == self.role.local_parity() {
            self.send_no_wait(Header::go_away(GoAwayCode::ProtocolError))
                .await;
            return Err(Error::InvalidStreamId(id));
        }
        let duplicate = self.streams.read().await.contains_key(&id);
        if duplicate {
            self.send_no_wait(Header::go_away(GoAwayCode::ProtocolError))
                .await;
            return Err(Error::DuplicateStream(id));
        }
        Ok(Some(Arc::new(SharedStream::new(
            id,
            StreamState::SynReceived,
            self.stream_ctx(),
        ))))
    }

    /// Insert a fully-ingested incoming stream and offer it for accept,
    /// resetting it when the backlog is full.
    async fn finish_incoming(&self, stream: Arc<SharedStream>) {
        if stream.is_reset().await {
            return;
        }
        let id = stream.id();
        self.streams.write().await.insert(id, Arc::clone(&stream));
        match self.accept_tx.try_send(stream) {
            Ok(()) => tracing::debug!(stream = id, "incoming stream queued"),
            Err(async_channel::TrySendError::Full(_)) => {
                tracing::warn!(stream = id, "accept backlog exceeded, resetting stream");
                self.streams.write().await.remove(&id);
                self.send_no_wait(Header::window_update(Flags::RST, id, 0))
                    .await;
            }
            Err(async_channel::TrySendError::Closed(_)) => {}
        }
    }
}

/// Handle to one multiplexed session.
///
/// Cheap to clone; all clones drive the same connection. Construction also
/// yields a [`SessionDriver`] that must be spawned for any of this to make
/// progress.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Multiplex `transport` as the client side: locally opened streams get
    /// odd ids.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the configuration fails validation.
    pub fn client<T>(transport: T, config: Config) -> Result<(Session, SessionDriver), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Session::new(transport, config, Role::Client)
    }

    /// Multiplex `transport` as the server side: locally opened streams get
    /// even ids.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the configuration fails validation.
    pub fn server<T>(transport: T, config: Config) -> Result<(Session, SessionDriver), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Session::new(transport, config, Role::Server)
    }

    /// Multiplex `transport` with an explicit [`Role`].
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when the configuration fails validation.
    pub fn new<T>(
        transport: T,
        config: Config,
        role: Role,
    ) -> Result<(Session, SessionDriver), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        config.validate()?;

        let (reader, writer) = transport.split();
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (accept_tx, accept_rx) = async_channel::bounded(config.accept_backlog);
        let (recv_abort, recv_reg) = AbortHandle::new_pair();
        let (send_abort, send_reg) = AbortHandle::new_pair();
        let (keepalive_abort, keepalive_reg) = AbortHandle::new_pair();
        let enable_keepalive = config.enable_keepalive;

        let shared = Arc::new(SessionShared {
            role,
            next_stream_id: AtomicU32::new(role.first_stream_id()),
            streams: RwLock::new(HashMap::new()),
            accept_tx,
            accept_rx,
            send_tx,
            pings: Mutex::new(PingTable::default()),
            local_go_away: AtomicBool::new(false),
            remote_go_away: AtomicBool::new(false),
            is_shutdown: AtomicBool::new(false),
            shutdown: Mutex::new(Shutdown::default()),
            aborts: [recv_abort, send_abort, keepalive_abort],
            config,
        });

        let session = Session {
            shared: Arc::clone(&shared),
        };
        let keepalive_session = session.clone();
        let fut = async move {
            let recv = Abortable::new(recv_loop(Arc::clone(&shared), reader), recv_reg);
            let send = Abortable::new(send_loop(writer, send_rx), send_reg);
            let keepalive = enable_keepalive
                .then(|| Abortable::new(keepalive_loop(keepalive_session), keepalive_reg));

            futures::join!(
                async {
                    if let Ok(Err(err)) = recv.await {
                        shared.exit_with(err).await;
                    }
                },
                async {
                    if let Ok(Err(err)) = send.await {
                        shared.exit_with(err).await;
                    }
                },
                async {
                    if let Some(task) = keepalive {
                        if let Ok(Err(err)) = task.await {
                            shared.exit_with(err).await;
                        }
                    }
                },
            );
            // Both loops are gone; make sure the session is finalized even
            // when they ended without recording a cause.
            shared.shutdown_with(Error::SessionShutdown).await;
        }
        .boxed();

        Ok((session, SessionDriver { fut }))
    }

    /// Open a new outgoing stream and announce it with a SYN window update.
    ///
    /// # Errors
    ///
    /// [`Error::SessionShutdown`] after close, [`Error::RemoteGoAway`] once
    /// the peer refused new streams, [`Error::StreamsExhausted`] when the id
    /// space is depleted.
    pub async fn open(&self) -> Result<Stream, Error> {
        let shared = &self.shared;
        if shared.is_shutdown.load(Ordering::SeqCst) {
            return Err(Error::SessionShutdown);
        }
        if shared.remote_go_away.load(Ordering::SeqCst) {
            return Err(Error::RemoteGoAway);
        }
        let id = shared.allocate_stream_id()?;
        let stream = Arc::new(SharedStream::new(
            id,
            StreamState::Init,
            shared.stream_ctx(),
        ));
        shared
            .streams
            .write()
            .await
            .insert(id, Arc::clone(&stream));
        if let Err(err) = stream.send_window_update().await {
            shared.remove_stream(id).await;
            return Err(err);
        }
        tracing::debug!(stream = id, "opened stream");
        Ok(Stream::new(stream))
    }

    /// Wait for the next peer-opened stream.
    ///
    /// # Errors
    ///
    /// The recorded shutdown cause once the session is closed.
    pub async fn accept(&self) -> Result<Stream, Error> {
        if self.shared.is_shutdown.load(Ordering::SeqCst) {
            return Err(self.shared.shutdown_cause().await);
        }
        match self.shared.accept_rx.recv().await {
            Ok(stream) => {
                tracing::debug!(stream = stream.id(), "accepted stream");
                Ok(Stream::new(stream))
            }
            Err(_) => Err(self.shared.shutdown_cause().await),
        }
    }

    /// Round-trip probe. The peer's receive loop answers without user
    /// involvement.
    ///
    /// # Errors
    ///
    /// [`Error::SessionShutdown`] when the session closes before the
    /// response arrives.
    pub async fn ping(&self) -> Result<Duration, Error> {
        self.shared.ping().await
    }

    /// Stop accepting new streams and tell the peer so. Existing streams
    /// keep working; the transport stays open.
    pub async fn go_away(&self) {
        self.shared.local_go_away.store(true, Ordering::SeqCst);
        tracing::debug!("refusing new incoming streams");
        self.shared
            .send_no_wait(Header::go_away(GoAwayCode::Normal))
            .await;
    }

    /// Shut the session down: stop both loops, close the transport, and fail
    /// every pending operation. Idempotent.
    pub async fn close(&self) {
        self.shared.shutdown_with(Error::SessionShutdown).await;
    }

    /// Whether the session has shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.is_shutdown.load(Ordering::SeqCst)
    }

    /// The error recorded at shutdown, if the session has shut down.
    pub async fn shutdown_cause(&self) -> Option<Error> {
        self.shared.shutdown.lock().await.cause.clone()
    }

    /// Number of live streams.
    pub async fn num_streams(&self) -> usize {
        self.shared.streams.read().await.len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.shared.role)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Future driving a session's background loops.
///
/// Resolves once the session has shut down and both loops have terminated.
#[must_use = "a session makes no progress unless its driver is spawned"]
pub struct SessionDriver {
    fut: BoxFuture<'static, ()>,
}

impl Future for SessionDriver {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.fut.as_mut().poll(cx)
    }
}

impl fmt::Debug for SessionDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDriver").finish_non_exhaustive()
    }
}

/// Receive loop: reads exactly one header at a time off the transport and
/// dispatches on the frame type. Any error is fatal to the session.
async fn recv_loop<T>(shared: Arc<SessionShared>, mut reader: ReadHalf<T>) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    loop {
        reader.read_exact(&mut header_buf).await?;
        let header = Header::decode(&header_buf)?;
        tracing::trace!(?header, "frame received");
        match header.frame_type() {
            FrameType::Data | FrameType::WindowUpdate => {
                shared.handle_stream_frame(&mut reader, header).await?;
            }
            FrameType::Ping => shared.handle_ping(header).await,
            FrameType::GoAway => shared.handle_go_away(header)?,
        }
    }
}

/// Send loop: the sole writer of the transport. Writes each queued frame
/// fully, then acknowledges it; a write error acknowledges the in-flight
/// request with the failure and exits.
async fn send_loop<T>(
    mut writer: WriteHalf<T>,
    mut queue: mpsc::Receiver<SendRequest>,
) -> Result<(), Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(request) = queue.next().await {
        match write_frame(&mut writer, &request.frame).await {
            Ok(()) => {
                if let Some(ack) = request.ack {
                    let _ = ack.send(Ok(()));
                }
            }
            Err(err) => {
                let err = Error::from(err);
                if let Some(ack) = request.ack {
                    let _ = ack.send(Err(err.clone()));
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.header.encode()).await?;
    if !frame.body.is_empty() {
        writer.write_all(&frame.body).await?;
    }
    writer.flush().await
}

/// Periodic liveness probe; ends quietly at shutdown, fatally on any other
/// ping failure.
async fn keepalive_loop(session: Session) -> Result<(), Error> {
    let interval = session.shared.config.keepalive_interval;
    loop {
        Delay::new(interval).await;
        match session.ping().await {
            Ok(rtt) => tracing::trace!(?rtt, "keepalive ping"),
            Err(Error::SessionShutdown) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

/// Read and throw away `len` body bytes of a frame whose stream was refused.
async fn discard_body<R>(reader: &mut R, len: u64) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let copied = futures::io::copy(reader.take(len), &mut futures::io::sink()).await?;
    if copied < len {
        return Err(Error::from(std::io::Error::from(
            std::io::ErrorKind::UnexpectedEof,
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_ctx(window: u32) -> (StreamCtx, mpsc::Receiver<SendRequest>) {
    let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
    let ctx = StreamCtx {
        send_tx,
        window,
        session: Weak::new(),
    };
    (ctx, send_rx)
}
