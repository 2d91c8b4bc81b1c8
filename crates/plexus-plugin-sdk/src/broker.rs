//! Numbered logical sub-connections multiplexed over one physical link.
//!
//! Every frame on the link is length-delimited and carries
//! `u32 stream id | u8 kind | payload`. Stream 0 is the control stream and
//! exists from the start on both sides; every other stream is announced with
//! `Open` by the dialer and confirmed with `Ack` (or refused with `Reset`) by
//! the acceptor.
//!
//! Each stream is flow controlled in both directions. A writer may have at
//! most [`INITIAL_WINDOW`] unacknowledged bytes in flight; the reader hands
//! credit back with `Window` frames as it consumes data. A slow reader stalls
//! only its own stream, and a peer that overruns the window has the stream
//! reset. Dropping a connection makes the peer's further writes fail.

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
    task::{ready, Context, Poll, Waker},
    time::Duration,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
    sync::PollSender,
};

pub type StreamId = u32;

/// Pre-established stream used by the hook transport.
pub const CONTROL_STREAM: StreamId = 0;

pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_DATA_FRAME: usize = 64 * 1024;
const MAX_LINK_FRAME: usize = 1024 * 1024;
const OUTBOUND_QUEUE: usize = 256;

/// Bytes a writer may send on one stream before the reader grants more.
pub const INITIAL_WINDOW: usize = 256 * 1024;
const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("stream {0} not found")]
    NotFound(StreamId),
    #[error("stream {0} is already in use")]
    InUse(StreamId),
    #[error("timed out waiting for stream {0}")]
    Timeout(StreamId),
    #[error("broker link closed")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Which end of the link this broker serves. The host issues odd stream ids,
/// the plugin even ones, so both sides may allocate without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Plugin,
}

impl Side {
    const fn first_id(self) -> StreamId {
        match self {
            Side::Host => 1,
            Side::Plugin => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Upper bound for a dial to be acknowledged and for an accept to see its
    /// peer; also how long an unclaimed `Open` stays parked.
    pub accept_timeout: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    Open = 0,
    Ack = 1,
    Data = 2,
    Close = 3,
    Reset = 4,
    Window = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = BrokerError;

    fn try_from(value: u8) -> Result<Self, BrokerError> {
        Ok(match value {
            0 => FrameKind::Open,
            1 => FrameKind::Ack,
            2 => FrameKind::Data,
            3 => FrameKind::Close,
            4 => FrameKind::Reset,
            5 => FrameKind::Window,
            other => return Err(BrokerError::Malformed(format!("unknown frame kind {other}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Frame {
    stream: StreamId,
    kind: FrameKind,
    payload: Bytes,
}

impl Frame {
    fn control(stream: StreamId, kind: FrameKind) -> Self {
        Self {
            stream,
            kind,
            payload: Bytes::new(),
        }
    }

    fn data(stream: StreamId, payload: Bytes) -> Self {
        Self {
            stream,
            kind: FrameKind::Data,
            payload,
        }
    }

    fn window(stream: StreamId, credit: u32) -> Self {
        Self {
            stream,
            kind: FrameKind::Window,
            payload: Bytes::copy_from_slice(&credit.to_be_bytes()),
        }
    }

    fn encode(self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.stream);
        buf.put_u8(self.kind as u8);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    fn decode(mut buf: BytesMut) -> Result<Self, BrokerError> {
        if buf.len() < HEADER_LEN {
            return Err(BrokerError::Malformed(format!(
                "frame of {} bytes is shorter than its header",
                buf.len()
            )));
        }
        let stream = buf.get_u32();
        let kind = FrameKind::try_from(buf.get_u8())?;
        Ok(Self {
            stream,
            kind,
            payload: buf.freeze(),
        })
    }
}

type InboundRx = mpsc::UnboundedReceiver<io::Result<Bytes>>;

/// Receiving half of a stream as seen by the link reader.
struct Inbound {
    tx: mpsc::UnboundedSender<io::Result<Bytes>>,
    /// Bytes the peer may still send before it needs a `Window` grant.
    allowance: usize,
}

impl Inbound {
    fn new() -> (Self, InboundRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                allowance: INITIAL_WINDOW,
            },
            rx,
        )
    }

    fn fail(self, kind: io::ErrorKind, reason: impl Into<String>) {
        let _ = self.tx.send(Err(io::Error::new(kind, reason.into())));
    }
}

#[derive(Default)]
struct CreditState {
    available: usize,
    closed: bool,
    waker: Option<Waker>,
}

/// Sending half of a stream's window, shared with the link reader.
#[derive(Clone, Default)]
struct Credit(Arc<Mutex<CreditState>>);

impl Credit {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(CreditState {
            available: INITIAL_WINDOW,
            ..CreditState::default()
        })))
    }

    fn lock(&self) -> MutexGuard<'_, CreditState> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn grant(&self, bytes: usize) {
        let mut credit = self.lock();
        credit.available = credit.available.saturating_add(bytes);
        if let Some(waker) = credit.waker.take() {
            waker.wake();
        }
    }

    fn close(&self) {
        let mut credit = self.lock();
        credit.closed = true;
        if let Some(waker) = credit.waker.take() {
            waker.wake();
        }
    }

    /// Takes up to `max` bytes of credit, waiting while none is left.
    fn poll_take(&self, cx: &mut Context<'_>, max: usize) -> Poll<io::Result<usize>> {
        let mut credit = self.lock();
        if credit.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed by peer",
            )));
        }
        if credit.available == 0 {
            credit.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let taken = credit.available.min(max);
        credit.available -= taken;
        Poll::Ready(Ok(taken))
    }
}

#[derive(Default)]
struct State {
    closed: bool,
    /// Live streams, including dials still waiting for their `Ack`.
    streams: HashMap<StreamId, Inbound>,
    /// Send windows of every stream with a local `Connection`.
    credits: HashMap<StreamId, Credit>,
    listeners: HashMap<StreamId, oneshot::Sender<Connection>>,
    dialing: HashMap<StreamId, oneshot::Sender<Result<(), BrokerError>>>,
    /// Peer opens that arrived before anyone listened on the id.
    parked: HashSet<StreamId>,
    control: Option<InboundRx>,
}

struct Inner {
    side: Side,
    next_id: AtomicU32,
    outbound: mpsc::Sender<Frame>,
    state: Mutex<State>,
    options: BrokerOptions,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn send(&self, frame: Frame) -> Result<(), BrokerError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| BrokerError::Closed)
    }

    fn register(state: &mut State, id: StreamId) -> (InboundRx, Credit) {
        let (inbound, rx) = Inbound::new();
        let credit = Credit::new();
        state.streams.insert(id, inbound);
        state.credits.insert(id, credit.clone());
        (rx, credit)
    }

    fn open_stream(self: &Arc<Self>, state: &mut State, id: StreamId) -> Connection {
        let (rx, credit) = Self::register(state, id);
        Connection::new(id, rx, credit, self.clone())
    }

    fn close_all(&self, reason: &str) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        state.closed = true;
        for (_, inbound) in state.streams.drain() {
            inbound.fail(io::ErrorKind::BrokenPipe, reason);
        }
        for credit in state.credits.values() {
            credit.close();
        }
        for (_, tx) in state.dialing.drain() {
            let _ = tx.send(Err(BrokerError::Closed));
        }
        state.listeners.clear();
        state.parked.clear();
        tracing::debug!(side = ?self.side, reason, "broker closed");
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) {
        let id = frame.stream;
        match frame.kind {
            FrameKind::Data => {
                let mut state = self.state();
                let Some(inbound) = state.streams.get_mut(&id) else {
                    tracing::trace!(stream = id, "dropping data for unknown stream");
                    return;
                };
                if frame.payload.len() <= inbound.allowance {
                    inbound.allowance -= frame.payload.len();
                    let _ = inbound.tx.send(Ok(frame.payload));
                    return;
                }
                tracing::warn!(stream = id, bytes = frame.payload.len(), "peer overran the stream window; resetting");
                if let Some(inbound) = state.streams.remove(&id) {
                    inbound.fail(io::ErrorKind::InvalidData, format!("stream {id} overran its window"));
                }
                if let Some(credit) = state.credits.get(&id) {
                    credit.close();
                }
                drop(state);
                self.queue(Frame::control(id, FrameKind::Reset));
            }
            FrameKind::Window => {
                let grant = <[u8; 4]>::try_from(&frame.payload[..]).map(u32::from_be_bytes);
                match (grant, self.state().credits.get(&id)) {
                    (Ok(bytes), Some(credit)) => credit.grant(bytes as usize),
                    (Err(_), _) => tracing::debug!(stream = id, "ignoring malformed window frame"),
                    (Ok(_), None) => {}
                }
            }
            FrameKind::Close => {
                let mut state = self.state();
                state.streams.remove(&id);
                state.parked.remove(&id);
            }
            FrameKind::Ack => {
                if let Some(tx) = self.state().dialing.remove(&id) {
                    let _ = tx.send(Ok(()));
                }
            }
            FrameKind::Reset => {
                let mut state = self.state();
                if let Some(tx) = state.dialing.remove(&id) {
                    let _ = tx.send(Err(BrokerError::NotFound(id)));
                }
                if let Some(inbound) = state.streams.remove(&id) {
                    inbound.fail(io::ErrorKind::ConnectionReset, format!("stream {id} reset by peer"));
                }
                if let Some(credit) = state.credits.get(&id) {
                    credit.close();
                }
            }
            FrameKind::Open => self.handle_open(id),
        }
    }

    fn handle_open(self: &Arc<Self>, id: StreamId) {
        let reply = {
            let mut state = self.state();
            if id == CONTROL_STREAM || state.streams.contains_key(&id) || state.parked.contains(&id)
            {
                Some(FrameKind::Reset)
            } else if let Some(listener) = state.listeners.remove(&id) {
                let connection = self.open_stream(&mut state, id);
                // Ack is queued before the acceptor can write anything.
                self.queue(Frame::control(id, FrameKind::Ack));
                if let Err(connection) = listener.send(connection) {
                    drop(state);
                    drop(connection);
                }
                None
            } else {
                state.parked.insert(id);
                self.expire_parked(id);
                None
            }
        };
        if let Some(kind) = reply {
            tracing::debug!(stream = id, "refusing open for unavailable stream");
            self.queue(Frame::control(id, kind));
        }
    }

    fn expire_parked(self: &Arc<Self>, id: StreamId) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.options.accept_timeout).await;
            let expired = inner.state().parked.remove(&id);
            if expired {
                tracing::debug!(stream = id, "no acceptor for parked stream; resetting");
                let _ = inner.send(Frame::control(id, FrameKind::Reset)).await;
            }
        });
    }

    /// Enqueues a frame from a synchronous context.
    fn queue(&self, frame: Frame) {
        self.queue_all(vec![frame]);
    }

    /// Enqueues frames in order; whatever does not fit right away is sent
    /// from a task, still in order.
    fn queue_all(&self, frames: Vec<Frame>) {
        let mut frames = frames.into_iter();
        while let Some(frame) = frames.next() {
            match self.outbound.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(frame)) => {
                    let outbound = self.outbound.clone();
                    if let Ok(handle) = tokio::runtime::Handle::try_current() {
                        handle.spawn(async move {
                            for frame in std::iter::once(frame).chain(frames) {
                                if outbound.send(frame).await.is_err() {
                                    break;
                                }
                            }
                        });
                    }
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }
}

/// Cheaply cloneable handle to one multiplexed link.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    pub fn new<R, W>(side: Side, reader: R, writer: W, options: BrokerOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let mut state = State::default();
        let (control_rx, _) = Inner::register(&mut state, CONTROL_STREAM);
        state.control = Some(control_rx);

        let inner = Arc::new(Inner {
            side,
            next_id: AtomicU32::new(side.first_id()),
            outbound,
            state: Mutex::new(state),
            options,
            tasks: Mutex::new(Vec::new()),
        });

        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(MAX_LINK_FRAME)
                .new_codec()
        };
        let writer_task = tokio::spawn(writer_loop(
            FramedWrite::new(writer, codec()),
            outbound_rx,
            Arc::downgrade(&inner),
        ));
        let reader_task = tokio::spawn(reader_loop(FramedRead::new(reader, codec()), inner.clone()));
        inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend([writer_task, reader_task]);

        Self { inner }
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    /// Issues a fresh stream id; never repeats for the lifetime of the broker.
    pub fn next_id(&self) -> StreamId {
        self.inner.next_id.fetch_add(2, Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Takes the pre-established control stream. Succeeds once.
    pub fn control(&self) -> Result<Connection, BrokerError> {
        let (rx, credit) = {
            let mut state = self.inner.state();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            let rx = state.control.take().ok_or(BrokerError::InUse(CONTROL_STREAM))?;
            let credit = state.credits.get(&CONTROL_STREAM).cloned().unwrap_or_default();
            (rx, credit)
        };
        Ok(Connection::new(CONTROL_STREAM, rx, credit, self.inner.clone()))
    }

    /// Registers interest in `id` immediately; the returned handle resolves
    /// once the peer dials it.
    pub fn listen(&self, id: StreamId) -> Result<PendingAccept, BrokerError> {
        let mut state = self.inner.state();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if id == CONTROL_STREAM
            || state.listeners.contains_key(&id)
            || state.streams.contains_key(&id)
        {
            return Err(BrokerError::InUse(id));
        }
        if state.parked.remove(&id) {
            let connection = self.inner.open_stream(&mut state, id);
            return Ok(PendingAccept {
                id,
                inner: self.inner.clone(),
                wait: Wait::Parked(Some(connection)),
            });
        }
        let (tx, rx) = oneshot::channel();
        state.listeners.insert(id, tx);
        Ok(PendingAccept {
            id,
            inner: self.inner.clone(),
            wait: Wait::Listening(rx),
        })
    }

    pub async fn accept(&self, id: StreamId) -> Result<Connection, BrokerError> {
        self.listen(id)?.wait().await
    }

    /// Listens on `id` right away and serves the accepted connection in a
    /// background task with a handler built for that connection only.
    pub fn accept_and_serve<F, Fut>(&self, id: StreamId, serve: F) -> Result<JoinHandle<()>, BrokerError>
    where
        F: FnOnce(Connection) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pending = self.listen(id)?;
        Ok(tokio::spawn(async move {
            match pending.wait().await {
                Ok(connection) => serve(connection).await,
                Err(err) => tracing::warn!(stream = id, error = %err, "accept failed"),
            }
        }))
    }

    pub async fn dial(&self, id: StreamId) -> Result<Connection, BrokerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (rx, credit) = {
            let mut state = self.inner.state();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if id == CONTROL_STREAM || state.streams.contains_key(&id) || state.dialing.contains_key(&id)
            {
                return Err(BrokerError::InUse(id));
            }
            state.dialing.insert(id, ack_tx);
            Inner::register(&mut state, id)
        };

        let outcome = match self.inner.send(Frame::control(id, FrameKind::Open)).await {
            Ok(()) => match timeout(self.inner.options.accept_timeout, ack_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(BrokerError::Closed),
                Err(_) => Err(BrokerError::Timeout(id)),
            },
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => Ok(Connection::new(id, rx, credit, self.inner.clone())),
            Err(err) => {
                let mut state = self.inner.state();
                state.dialing.remove(&id);
                state.streams.remove(&id);
                state.credits.remove(&id);
                Err(err)
            }
        }
    }

    /// Stops the link tasks and fails everything still pending.
    pub fn close(&self) {
        self.inner.close_all("broker closed locally");
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("side", &self.inner.side)
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum Wait {
    Listening(oneshot::Receiver<Connection>),
    Parked(Option<Connection>),
}

/// An accept registered with [`Broker::listen`].
pub struct PendingAccept {
    id: StreamId,
    inner: Arc<Inner>,
    wait: Wait,
}

impl PendingAccept {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn wait(mut self) -> Result<Connection, BrokerError> {
        let id = self.id;
        let inner = self.inner.clone();
        match std::mem::replace(&mut self.wait, Wait::Parked(None)) {
            Wait::Parked(connection) => {
                let connection = connection.ok_or(BrokerError::NotFound(id))?;
                inner.send(Frame::control(id, FrameKind::Ack)).await?;
                Ok(connection)
            }
            Wait::Listening(mut rx) => match timeout(inner.options.accept_timeout, &mut rx).await {
                Ok(Ok(connection)) => Ok(connection),
                Ok(Err(_)) => Err(BrokerError::Closed),
                Err(_) => {
                    inner.state().listeners.remove(&id);
                    // The peer may have raced the deadline.
                    rx.try_recv().map_err(|_| BrokerError::Timeout(id))
                }
            },
        }
    }
}

impl Drop for PendingAccept {
    fn drop(&mut self) {
        if let Wait::Listening(_) = self.wait {
            self.inner.state().listeners.remove(&self.id);
        }
    }
}

/// One logical, bidirectional byte stream on the link.
pub struct Connection {
    id: StreamId,
    inner: Arc<Inner>,
    rx: InboundRx,
    pending: Bytes,
    /// Read bytes not yet granted back to the peer.
    consumed: usize,
    credit: Credit,
    /// Credit taken but not yet spent on a frame.
    held: usize,
    sender: PollSender<Frame>,
    write_closed: bool,
}

impl Connection {
    fn new(id: StreamId, rx: InboundRx, credit: Credit, inner: Arc<Inner>) -> Self {
        let sender = PollSender::new(inner.outbound.clone());
        Self {
            id,
            inner,
            rx,
            pending: Bytes::new(),
            consumed: 0,
            credit,
            held: 0,
            sender,
            write_closed: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Abandons the stream: the peer's reads end with an error instead of
    /// EOF and its writes fail.
    pub fn reset(mut self) {
        {
            let mut state = self.inner.state();
            state.streams.remove(&self.id);
            state.credits.remove(&self.id);
        }
        self.write_closed = true;
        self.sender.abort_send();
        self.inner.queue(Frame::control(self.id, FrameKind::Reset));
    }

    fn release(&mut self, bytes: usize) {
        self.consumed += bytes;
        if self.consumed < INITIAL_WINDOW / 2 {
            return;
        }
        let granted = std::mem::take(&mut self.consumed);
        {
            let mut state = self.inner.state();
            match state.streams.get_mut(&self.id) {
                Some(inbound) => inbound.allowance += granted,
                // The peer finished writing; nothing left to grant.
                None => return,
            }
        }
        self.inner.queue(Frame::window(self.id, granted as u32));
    }
}

fn link_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, BrokerError::Closed)
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..n]);
                self.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(self.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => {
                    self.release(chunk.len());
                    self.pending = chunk;
                }
                Some(Err(err)) => return Poll::Ready(Err(err)),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after shutdown",
            )));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.held == 0 {
            self.held = ready!(self.credit.poll_take(cx, MAX_DATA_FRAME))?;
        }
        ready!(self.sender.poll_reserve(cx)).map_err(|_| link_gone())?;
        let n = buf.len().min(self.held);
        self.held -= n;
        let frame = Frame::data(self.id, Bytes::copy_from_slice(&buf[..n]));
        self.sender.send_item(frame).map_err(|_| link_gone())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.write_closed {
            return Poll::Ready(Ok(()));
        }
        ready!(self.sender.poll_reserve(cx)).map_err(|_| link_gone())?;
        let frame = Frame::control(self.id, FrameKind::Close);
        self.sender.send_item(frame).map_err(|_| link_gone())?;
        self.write_closed = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let was_open = {
            let mut state = self.inner.state();
            state.credits.remove(&self.id);
            state.streams.remove(&self.id).is_some()
        };
        if self.write_closed {
            if was_open {
                // Our side is gone; stop the peer from writing into the void.
                self.inner.queue(Frame::control(self.id, FrameKind::Reset));
            }
            return;
        }
        self.sender.abort_send();
        let mut frames = vec![Frame::control(self.id, FrameKind::Close)];
        if was_open {
            frames.push(Frame::control(self.id, FrameKind::Reset));
        }
        self.inner.queue_all(frames);
    }
}

impl std::fmt::Debug for PendingAccept {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingAccept").field("id", &self.id).finish()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

async fn writer_loop<W>(
    mut sink: FramedWrite<W, LengthDelimitedCodec>,
    mut rx: mpsc::Receiver<Frame>,
    inner: std::sync::Weak<Inner>,
) where
    W: AsyncWrite + Unpin,
{
    let result: io::Result<()> = async {
        while let Some(frame) = rx.recv().await {
            sink.feed(frame.encode()).await?;
            while let Ok(frame) = rx.try_recv() {
                sink.feed(frame.encode()).await?;
            }
            SinkExt::<Bytes>::flush(&mut sink).await?;
        }
        Ok(())
    }
    .await;
    if let Err(err) = result {
        tracing::warn!(error = %err, "broker link write failed");
        if let Some(inner) = inner.upgrade() {
            inner.close_all("link write failed");
        }
    }
}

async fn reader_loop<R>(mut frames: FramedRead<R, LengthDelimitedCodec>, inner: Arc<Inner>)
where
    R: AsyncRead + Unpin,
{
    while let Some(item) = frames.next().await {
        let frame = match item {
            Ok(raw) => Frame::decode(raw),
            Err(err) => {
                tracing::warn!(error = %err, "broker link read failed");
                break;
            }
        };
        match frame {
            Ok(frame) => inner.handle_frame(frame),
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed frame");
                break;
            }
        }
    }
    inner.close_all("link closed by peer");
}
