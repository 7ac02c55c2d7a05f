//! Per-connection session state machine.
//!
//! A session owns two half-duplex legs: inbound (client to proxy) and
//! outbound (proxy to target). Bytes read from one leg are handed to
//! the other leg's write path. Each leg tracks its own state, an
//! at-most-one-in-flight write, and a FIFO queue of pending items; a
//! `Close` queue item flushes everything queued before it and then
//! shuts the leg down.
//!
//! All session state lives in a single event-loop task. Reads and
//! writes are performed by small helper tasks that report completions
//! into the session's event channel, so completion handling stays
//! strictly sequential and lock-free:
//!
//! ```text
//! inbound reader ──┐                         ┌── inbound writer
//!                  ├──> event loop (state) ──┤
//! outbound reader ─┘        │                └── outbound writer
//!                           └─ connect task / force-close watch
//! ```
//!
//! Close discipline: when a leg's transport is observed closed, the
//! other leg is closed gracefully (flush, then FIN). The session
//! reports itself for removal exactly once, after both legs are
//! closed.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, debug_span, trace, warn, Instrument, Span};

use crate::stream::BoxedStream;

/// Identifies a session within its listener's registry.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Read buffer size for leg reader tasks.
const READ_BUF_SIZE: usize = 8192;

/// Session event channel capacity. Bounds how far a reader can run
/// ahead of the state machine before it is made to wait.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One of the two half-duplex connections belonging to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegId {
    /// Client-to-proxy connection.
    Inbound,
    /// Proxy-to-target connection.
    Outbound,
}

impl LegId {
    /// The leg on the other side of the relay.
    pub fn other(self) -> LegId {
        match self {
            LegId::Inbound => LegId::Outbound,
            LegId::Outbound => LegId::Inbound,
        }
    }
}

/// Connection state of a leg. `Connecting` only ever applies to the
/// outbound leg; the inbound leg arrives already accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegState {
    Closed,
    Connecting,
    Connected,
}

/// Item in a leg's pending write queue.
enum WriteItem {
    Data(Bytes),
    /// Close the leg once everything queued before this item has been
    /// flushed.
    Close,
}

/// Completions reported to the session event loop.
enum SessionEvent {
    /// The outbound connect attempt finished.
    ConnectFinished(io::Result<BoxedStream>),
    /// A read on the given leg completed with data.
    Data(LegId, Bytes),
    /// The leg's peer closed the connection (EOF or read error).
    PeerClosed(LegId),
    /// The in-flight write on the given leg completed.
    WriteDone(LegId, io::Result<()>),
    /// The leg's writer flushed a `Close` item and shut the transport
    /// down.
    CloseDone(LegId),
    /// Abrupt teardown of both legs, requested by the listener.
    ForceClose,
}

/// Opens the outbound transport for a session.
///
/// The listener builds one connector per its target/TLS configuration
/// and shares it across all sessions it creates.
#[async_trait]
pub trait OutboundConnector: Send + Sync {
    async fn connect(&self) -> io::Result<BoxedStream>;
}

/// Per-listener state a factory needs to spawn sessions.
#[derive(Clone)]
pub struct SessionContext {
    /// Dials the listener's target, originating TLS if configured.
    pub connector: Arc<dyn OutboundConnector>,
    pub(crate) removal_tx: mpsc::UnboundedSender<SessionId>,
    pub(crate) force_close: watch::Receiver<bool>,
}

/// Callback points a session variant may intercept. Every hook is a
/// no-op by default; the base relay behavior always runs regardless.
pub trait SessionHooks: Send {
    fn on_create(&mut self, _id: SessionId) {}
    fn on_outbound_connected(&mut self) {}
    /// Data read from the inbound leg (client to target direction).
    fn on_inbound_data(&mut self, _data: &Bytes) {}
    /// Data read from the outbound leg (target to client direction).
    fn on_outbound_data(&mut self, _data: &Bytes) {}
    fn on_inbound_closed(&mut self) {}
    fn on_outbound_closed(&mut self) {}
}

/// The default hooks: pure relay, no interception.
pub struct NoopHooks;

impl SessionHooks for NoopHooks {}

/// Handle returned to the listener when a session is spawned.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub peer: SocketAddr,
}

struct Leg {
    state: LegState,
    /// True while exactly one write is in flight on this leg.
    writing: bool,
    /// Data (and possibly a trailing `Close`) waiting for the current
    /// write to finish, or for the leg to finish connecting.
    pending: VecDeque<WriteItem>,
    write_tx: Option<mpsc::Sender<WriteItem>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Leg {
    fn new(state: LegState) -> Self {
        Self {
            state,
            writing: false,
            pending: VecDeque::new(),
            write_tx: None,
            reader: None,
            writer: None,
        }
    }
}

/// The relay state machine for one proxied connection.
pub struct Session {
    id: SessionId,
    inbound: Leg,
    outbound: Leg,
    hooks: Box<dyn SessionHooks>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: mpsc::Receiver<SessionEvent>,
    removal_tx: mpsc::UnboundedSender<SessionId>,
    force_close: watch::Receiver<bool>,
    span: Span,
}

impl Session {
    /// Spawn a relay session: the inbound leg is live, the outbound
    /// leg starts connecting via the context's connector.
    pub fn spawn_relay(
        id: SessionId,
        inbound: BoxedStream,
        peer: SocketAddr,
        hooks: Box<dyn SessionHooks>,
        ctx: &SessionContext,
    ) -> SessionHandle {
        let mut session = Session::new(id, peer, hooks, ctx, LegState::Connecting);
        session.start_leg(LegId::Inbound, inbound);

        let connector = Arc::clone(&ctx.connector);
        let events = session.events_tx.clone();
        tokio::spawn(
            async move {
                let result = connector.connect().await;
                let _ = events.send(SessionEvent::ConnectFinished(result)).await;
            }
            .instrument(session.span.clone()),
        );

        let span = session.span.clone();
        tokio::spawn(session.run().instrument(span));
        SessionHandle { id, peer }
    }

    /// Spawn a replay session: the queued chunks are written to the
    /// inbound leg and the leg is then closed gracefully. No outbound
    /// connection is ever opened.
    pub fn spawn_replay(
        id: SessionId,
        inbound: BoxedStream,
        peer: SocketAddr,
        chunks: Vec<Bytes>,
        ctx: &SessionContext,
    ) -> SessionHandle {
        let mut session = Session::new(id, peer, Box::new(NoopHooks), ctx, LegState::Closed);
        session.start_leg(LegId::Inbound, inbound);

        session.inbound.pending = chunks.into_iter().map(WriteItem::Data).collect();
        session.inbound.pending.push_back(WriteItem::Close);
        if let Some(item) = session.inbound.pending.pop_front() {
            session.issue_write(LegId::Inbound, item);
        }

        let span = session.span.clone();
        tokio::spawn(session.run().instrument(span));
        SessionHandle { id, peer }
    }

    fn new(
        id: SessionId,
        peer: SocketAddr,
        hooks: Box<dyn SessionHooks>,
        ctx: &SessionContext,
        outbound_state: LegState,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Session {
            id,
            inbound: Leg::new(LegState::Connected),
            outbound: Leg::new(outbound_state),
            hooks,
            events_tx,
            events_rx,
            removal_tx: ctx.removal_tx.clone(),
            force_close: ctx.force_close.clone(),
            span: debug_span!("session", id, peer = %peer),
        }
    }

    async fn run(mut self) {
        self.hooks.on_create(self.id);
        debug!("session started");

        let mut watch_dead = false;
        loop {
            let event = tokio::select! {
                res = self.force_close.changed(), if !watch_dead => match res {
                    Ok(()) => {
                        if *self.force_close.borrow_and_update() {
                            SessionEvent::ForceClose
                        } else {
                            continue;
                        }
                    }
                    // Listener dropped; sessions keep running.
                    Err(_) => {
                        watch_dead = true;
                        continue;
                    }
                },
                maybe = self.events_rx.recv() => match maybe {
                    Some(event) => event,
                    None => SessionEvent::ForceClose,
                },
            };
            if self.handle_event(event) {
                break;
            }
        }

        // Both legs are closed; report for registry removal, once.
        let _ = self.removal_tx.send(self.id);
        debug!("session finished");
    }

    /// Dispatch one completion. Returns true when the session is
    /// terminal (both legs closed).
    fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::ConnectFinished(Ok(stream)) => self.on_outbound_connected(stream),
            SessionEvent::ConnectFinished(Err(err)) => {
                warn!(error = %err, "outbound connect failed");
                self.on_transport_closed(LegId::Outbound)
            }
            SessionEvent::Data(leg, data) => self.on_data(leg, data),
            SessionEvent::PeerClosed(leg) => {
                trace!(leg = ?leg, "peer closed");
                self.on_transport_closed(leg)
            }
            SessionEvent::WriteDone(leg, Ok(())) => self.on_write_done(leg),
            SessionEvent::WriteDone(leg, Err(err)) => {
                trace!(leg = ?leg, error = %err, "write failed");
                self.on_transport_closed(leg)
            }
            SessionEvent::CloseDone(leg) => self.on_transport_closed(leg),
            SessionEvent::ForceClose => self.force_close_all(),
        }
    }

    /// The outbound connect attempt succeeded.
    fn on_outbound_connected(&mut self, stream: BoxedStream) -> bool {
        if self.outbound.state != LegState::Connecting {
            // Force-closed while connecting; dropping the stream
            // closes the freshly opened socket.
            return false;
        }
        trace!("outbound connected");
        self.outbound.state = LegState::Connected;
        self.start_leg(LegId::Outbound, stream);
        self.hooks.on_outbound_connected();

        // Nothing can be in flight yet, so the head of the queue
        // accumulated while connecting is issued directly; the rest
        // drains through the write-completion path.
        debug_assert!(!self.outbound.writing);
        if let Some(item) = self.outbound.pending.pop_front() {
            self.issue_write(LegId::Outbound, item);
        }
        false
    }

    /// A read on `source` completed; hand the data to the other leg.
    fn on_data(&mut self, source: LegId, data: Bytes) -> bool {
        match source {
            LegId::Inbound => self.hooks.on_inbound_data(&data),
            LegId::Outbound => self.hooks.on_outbound_data(&data),
        }
        self.start_write(source.other(), WriteItem::Data(data));
        false
    }

    /// The in-flight write on `leg` finished; issue the next queued
    /// item, if any.
    fn on_write_done(&mut self, leg_id: LegId) -> bool {
        let leg = self.leg_mut(leg_id);
        if leg.state == LegState::Closed {
            return false;
        }
        debug_assert!(leg.writing);
        leg.writing = false;
        if let Some(item) = leg.pending.pop_front() {
            self.issue_write(leg_id, item);
        }
        false
    }

    /// The leg's underlying transport has definitively closed: peer
    /// disconnect, read/write error, connect failure, or our own
    /// graceful close completing. Runs the close-propagation rule.
    fn on_transport_closed(&mut self, leg_id: LegId) -> bool {
        if self.leg(leg_id).state == LegState::Closed {
            return false;
        }
        self.set_closed(leg_id);
        let other = leg_id.other();
        if self.leg(other).state == LegState::Closed {
            return true;
        }
        self.start_write(other, WriteItem::Close);
        false
    }

    /// Queue or issue a write on a leg, per its state:
    /// still connecting means queue, closed means drop, connected
    /// means issue now unless a write is already in flight.
    fn start_write(&mut self, leg_id: LegId, item: WriteItem) {
        let leg = self.leg_mut(leg_id);
        match leg.state {
            LegState::Connecting => leg.pending.push_back(item),
            // No leg to deliver to; dropped by design.
            LegState::Closed => {}
            LegState::Connected => {
                if leg.writing {
                    leg.pending.push_back(item);
                } else {
                    self.issue_write(leg_id, item);
                }
            }
        }
    }

    /// Hand one item to the leg's writer task. The leg must not have
    /// a write in flight.
    fn issue_write(&mut self, leg_id: LegId, item: WriteItem) {
        let leg = self.leg_mut(leg_id);
        debug_assert!(!leg.writing, "second write issued on a leg");
        let Some(tx) = leg.write_tx.clone() else {
            return;
        };
        leg.writing = true;
        if tx.try_send(item).is_err() {
            // Writer already exited after a failure; the matching
            // WriteDone error event is on its way.
            leg.writing = false;
        }
    }

    /// Abrupt teardown: both legs drop their queues and close
    /// immediately, without flushing.
    fn force_close_all(&mut self) -> bool {
        debug!("force close");
        if self.inbound.state != LegState::Closed {
            self.set_closed(LegId::Inbound);
        }
        if self.outbound.state != LegState::Closed {
            self.set_closed(LegId::Outbound);
        }
        true
    }

    /// Mark a leg closed and release its I/O tasks. Aborting the
    /// reader and writer drops both stream halves, which closes the
    /// underlying socket.
    fn set_closed(&mut self, leg_id: LegId) {
        let leg = self.leg_mut(leg_id);
        leg.state = LegState::Closed;
        leg.writing = false;
        leg.pending.clear();
        leg.write_tx = None;
        if let Some(reader) = leg.reader.take() {
            reader.abort();
        }
        if let Some(writer) = leg.writer.take() {
            writer.abort();
        }
        debug!(leg = ?leg_id, "leg closed");
        match leg_id {
            LegId::Inbound => self.hooks.on_inbound_closed(),
            LegId::Outbound => self.hooks.on_outbound_closed(),
        }
    }

    /// Split the stream and arm the leg's reader and writer tasks.
    fn start_leg(&mut self, leg_id: LegId, stream: BoxedStream) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::channel(1);

        let writer = tokio::spawn(
            run_writer(leg_id, write_half, write_rx, self.events_tx.clone())
                .instrument(self.span.clone()),
        );
        let reader = tokio::spawn(
            run_reader(leg_id, read_half, self.events_tx.clone()).instrument(self.span.clone()),
        );

        let leg = self.leg_mut(leg_id);
        debug_assert!(leg.reader.is_none(), "second read armed on a leg");
        leg.write_tx = Some(write_tx);
        leg.reader = Some(reader);
        leg.writer = Some(writer);
    }

    fn leg(&self, leg_id: LegId) -> &Leg {
        match leg_id {
            LegId::Inbound => &self.inbound,
            LegId::Outbound => &self.outbound,
        }
    }

    fn leg_mut(&mut self, leg_id: LegId) -> &mut Leg {
        match leg_id {
            LegId::Inbound => &mut self.inbound,
            LegId::Outbound => &mut self.outbound,
        }
    }
}

/// Long-lived read loop for one leg: at most one read is outstanding
/// at any time, re-armed after each completion.
async fn run_reader(
    leg: LegId,
    mut read_half: ReadHalf<BoxedStream>,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if events.send(SessionEvent::Data(leg, data)).await.is_err() {
                    return;
                }
            }
            // A failed read means the transport is gone; reported the
            // same way as a peer disconnect.
            Err(_) => break,
        }
    }
    let _ = events.send(SessionEvent::PeerClosed(leg)).await;
}

/// Writer task for one leg: performs one item at a time, reporting
/// each completion before the state machine hands it the next.
async fn run_writer(
    leg: LegId,
    mut write_half: WriteHalf<BoxedStream>,
    mut items: mpsc::Receiver<WriteItem>,
    events: mpsc::Sender<SessionEvent>,
) {
    while let Some(item) = items.recv().await {
        match item {
            WriteItem::Data(data) => {
                let result = write_half.write_all(&data).await;
                let failed = result.is_err();
                if events.send(SessionEvent::WriteDone(leg, result)).await.is_err() {
                    return;
                }
                if failed {
                    return;
                }
            }
            WriteItem::Close => {
                // Everything queued before the sentinel has been
                // flushed; send FIN.
                let _ = write_half.shutdown().await;
                let _ = events.send(SessionEvent::CloseDone(leg)).await;
                return;
            }
        }
    }
}
