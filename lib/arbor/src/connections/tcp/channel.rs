use crate::base::async_op::AsyncOperation;
use crate::base::ring::RingBuffer;
use crate::connections::tcp::reactor::Reactor;
use crate::connections::tcp::shake::{self, HandshakeOutcome};
use crate::connections::{CommunicatorRef, Connection, ConnectionRef};
use crate::errors::{ErrorCode, Result};
use crate::logging::{self, Logger};
use crate::msg::{wire, Message, HEARTBEAT};
use crate::scheduling::Scheduler;

use std::io::{Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Passing this as the timeout to `assign` disables heartbeats entirely.
pub const HEARTBEATS_DISABLED: Duration = Duration::MAX;

type DeathHandler = Box<dyn FnOnce(ErrorCode) + Send>;

struct ChanState {
    communicator: Option<CommunicatorRef>,
    scheduler: Option<Arc<dyn Scheduler>>,
    assigning: bool,
    ready: bool,
    remote_is_node: bool,
    timeout: Duration,
    heartbeats: bool,
    hb_since_recv: u32,
    hb_since_send: u32,
    deadline: Option<Instant>,
    token: Option<usize>,
    deserialize_running: bool,
}

struct RxState {
    header: Vec<u8>,
    scratch: Vec<u8>,
    filled: usize,
    remaining: usize,
}

enum TimerAction {
    Nothing,
    SendHeartbeat,
    Die,
}

/// Shared state of one TCP wire endpoint. The user-facing handle is
/// `TcpConnection`; communicators and the reactor hold this inner object.
pub(crate) struct ChanInner {
    stream: mio::net::TcpStream,
    description: String,
    remote_version: String,
    remote_identification: Vec<u8>,

    alive: AtomicBool,
    read_paused: AtomicBool,

    in_ring: RingBuffer,
    out_ring: RingBuffer,

    // Serializes whole frames across sender threads; the inner scratch lock
    // pairs with the condvar for ring back-pressure.
    send_order: Mutex<()>,
    tx: Mutex<Vec<u8>>,
    tx_cv: Condvar,

    state: Mutex<ChanState>,
    rx: Mutex<RxState>,

    death_op: AsyncOperation<DeathHandler>,
    self_ref: Mutex<Weak<ChanInner>>,
    reactor: Arc<Reactor>,
    log: Logger,
}

impl ChanInner {
    pub(crate) fn stream(&self) -> &mio::net::TcpStream {
        &self.stream
    }

    fn upgrade_self(&self) -> Option<Arc<ChanInner>> {
        self.self_ref.lock().unwrap().upgrade()
    }

    fn connection_ref(&self) -> Option<ConnectionRef> {
        self.upgrade_self().map(|arc| arc as ConnectionRef)
    }

    pub(crate) fn timer_deadline(&self) -> Option<Instant> {
        if !self.alive.load(Ordering::Acquire) {
            return None;
        }
        self.state.lock().unwrap().deadline
    }

    fn notify_senders(&self) {
        let _guard = self.tx.lock().unwrap();
        drop(_guard);
        self.tx_cv.notify_all();
    }

    /// Tears the connection down and fires the death notification exactly
    /// once. The first cause wins; later calls are no-ops.
    fn die(&self, cause: ErrorCode) {
        if self.alive.swap(false, Ordering::AcqRel) {
            logging::debug!(self.log, "connection died";
                            "peer" => &self.description,
                            "cause" => %cause);

            let token = self.state.lock().unwrap().token.take();
            let _ = self.stream.shutdown(Shutdown::Both);
            if let Some(token) = token {
                self.reactor.deregister(token);
            }

            self.death_op.fire(|handler| handler(cause));
            self.notify_senders();
            self.reactor.wake();
        }
    }

    /// Drains the socket into the RX ring. Runs on the reactor thread only.
    pub(crate) fn handle_readable(&self) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }

        loop {
            if self.in_ring.full() {
                self.read_paused.store(true, Ordering::Release);
                break;
            }

            let mut reader = &self.stream;
            match self.in_ring.read_from(&mut reader) {
                Ok(0) => {
                    self.die(ErrorCode::ConnectionClosed);
                    return;
                }
                Ok(_) => {
                    self.state.lock().unwrap().hb_since_recv = 0;
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.die(ErrorCode::from_io(&err));
                    return;
                }
            }
        }

        self.consume_communicator_type();
        self.start_deserialize();
    }

    /// The first byte after the handshake is the peer's communicator type;
    /// everything after that is framed traffic.
    fn consume_communicator_type(&self) {
        let communicator = {
            let mut state = self.state.lock().unwrap();
            if state.ready || state.communicator.is_none() || self.in_ring.empty() {
                None
            } else {
                let byte = self.in_ring.front();
                self.in_ring.pop();
                state.remote_is_node = byte == 1;
                state.ready = true;
                state.communicator.clone()
            }
        };

        if let Some(communicator) = communicator {
            logging::debug!(self.log, "connection ready";
                            "peer" => &self.description,
                            "remote_is_node" => self.state.lock().unwrap().remote_is_node);

            let conn_ref = match self.connection_ref() {
                Some(conn_ref) => conn_ref,
                None => return,
            };

            if let Err(err) = communicator.on_connection_started(&conn_ref) {
                logging::error!(self.log, "starting the communicator failed";
                                "peer" => &self.description,
                                "error" => %err);
                self.die(ErrorCode::SocketBroken);
            }
        }
    }

    /// Posts the cooperative deserializer if it is not already running.
    fn start_deserialize(&self) {
        let scheduler = {
            let mut state = self.state.lock().unwrap();
            if state.deserialize_running
                || !state.ready
                || self.in_ring.empty()
                || !self.alive.load(Ordering::Acquire)
            {
                None
            } else {
                state.deserialize_running = true;
                state.scheduler.clone()
            }
        };

        if let Some(scheduler) = scheduler {
            if let Some(this) = self.upgrade_self() {
                scheduler.post(Box::new(move || this.deserialize()));
            }
        }
    }

    fn clear_deserialize_flag(&self) {
        self.state.lock().unwrap().deserialize_running = false;
    }

    /// Asks the reactor to read again if the RX ring was full and now has
    /// space. Socket I/O stays on the reactor thread.
    fn unpause_read(&self) {
        if self.read_paused.load(Ordering::Acquire) && !self.in_ring.full() {
            self.reactor.wake();
        }
    }

    /// Peels frames off the RX ring one at a time, suspending when the ring
    /// underruns mid-frame. Runs on the communicator's scheduler; at most
    /// one instance per connection.
    fn deserialize(self: Arc<ChanInner>) {
        'frames: loop {
            if !self.alive.load(Ordering::Acquire) {
                self.clear_deserialize_flag();
                return;
            }

            let frame = {
                let mut rx = self.rx.lock().unwrap();

                // Header phase: accumulate bytes until the size varint is
                // decodable. A zero size is a heartbeat and carries nothing.
                while rx.remaining == 0 {
                    match wire::try_read_varint(&rx.header) {
                        Err(_) => {
                            drop(rx);
                            self.die(ErrorCode::SocketBroken);
                            self.clear_deserialize_flag();
                            return;
                        }
                        Ok(Some((size, _))) => {
                            rx.header.clear();
                            if size == 0 {
                                continue; // heartbeat
                            }
                            rx.remaining = size as usize;
                            rx.filled = 0;
                            rx.scratch.clear();
                            rx.scratch.resize(size as usize, 0);
                        }
                        Ok(None) => {
                            if self.in_ring.empty() {
                                drop(rx);
                                self.suspend_deserialize();
                                return;
                            }
                            let byte = self.in_ring.front();
                            self.in_ring.pop();
                            rx.header.push(byte);
                        }
                    }
                }

                // Payload phase: drain the ring into the per-message scratch.
                let filled = rx.filled;
                let got = self.in_ring.read(&mut rx.scratch[filled..]);
                rx.filled += got;
                rx.remaining -= got;
                self.unpause_read();

                if rx.remaining > 0 {
                    drop(rx);
                    self.suspend_deserialize();
                    return;
                }

                std::mem::replace(&mut rx.scratch, Vec::new())
            };

            let msg = match Message::decode_frame_contents(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    logging::error!(self.log, "received malformed frame, closing connection";
                                    "peer" => &self.description,
                                    "error" => %err);
                    self.die(ErrorCode::SocketBroken);
                    self.clear_deserialize_flag();
                    return;
                }
            };

            let communicator = self.state.lock().unwrap().communicator.clone();
            if let (Some(communicator), Some(conn_ref)) = (communicator, self.connection_ref()) {
                if !self.alive.load(Ordering::Acquire) {
                    self.clear_deserialize_flag();
                    return;
                }

                if let Err(err) = communicator.on_message_received(msg, &conn_ref) {
                    logging::error!(self.log, "error processing message, closing connection";
                                    "peer" => &self.description,
                                    "error" => %err);
                    self.die(ErrorCode::SocketBroken);
                    self.clear_deserialize_flag();
                    return;
                }
            }

            continue 'frames;
        }
    }

    fn suspend_deserialize(&self) {
        self.clear_deserialize_flag();
        self.unpause_read();

        // Bytes may have landed between our empty-check and the flag clear.
        if !self.in_ring.empty() {
            self.start_deserialize();
        }
    }

    /// Drains the TX ring to the socket. Runs on the reactor thread only.
    pub(crate) fn handle_writable(&self) {
        self.flush();
    }

    pub(crate) fn flush(&self) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }

        loop {
            if self.out_ring.empty() {
                break;
            }

            let mut writer = &self.stream;
            match self.out_ring.write_to(&mut writer) {
                Ok(0) => break,
                Ok(_) => {
                    self.state.lock().unwrap().hb_since_send = 0;
                    self.notify_senders();
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.die(ErrorCode::from_io(&err));
                    return;
                }
            }
        }
    }

    pub(crate) fn resume_read(&self) {
        if self.read_paused.swap(false, Ordering::AcqRel) {
            self.handle_readable();
        }
    }

    /// Heartbeat rule: the timer fires at half the timeout. Two ticks with
    /// no received byte kill the link; a tick without outgoing traffic since
    /// the previous one sends a heartbeat.
    pub(crate) fn handle_timer(&self, now: Instant) {
        let action = {
            let mut state = self.state.lock().unwrap();
            if !self.alive.load(Ordering::Acquire) || !state.heartbeats {
                TimerAction::Nothing
            } else {
                match state.deadline {
                    Some(deadline) if now >= deadline => {
                        if state.hb_since_recv >= 2 {
                            TimerAction::Die
                        } else {
                            state.hb_since_recv += 1;
                            state.deadline = Some(now + state.timeout / 2);

                            if state.hb_since_send >= 1 {
                                TimerAction::SendHeartbeat
                            } else {
                                state.hb_since_send += 1;
                                TimerAction::Nothing
                            }
                        }
                    }
                    _ => TimerAction::Nothing,
                }
            }
        };

        match action {
            TimerAction::Nothing => {}
            TimerAction::Die => {
                logging::error!(self.log, "connection timed out"; "peer" => &self.description);
                self.die(ErrorCode::Timeout);
            }
            TimerAction::SendHeartbeat => {
                // A full ring means traffic is already pending, which serves
                // the same purpose as the heartbeat.
                let _guard = self.tx.lock().unwrap();
                self.out_ring.write(&HEARTBEAT);
                drop(_guard);
                self.flush_from_any_thread();
            }
        }
    }

    fn flush_from_any_thread(&self) {
        self.reactor.wake();
    }
}

impl Connection for ChanInner {
    /// Serializes the message and writes it into the TX ring, blocking on
    /// the condvar while the ring is full. A dead connection swallows the
    /// message; the loss is reported through `async_await_death`.
    fn send(&self, msg: &Message) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }

        let _order = self.send_order.lock().unwrap();
        let mut scratch = self.tx.lock().unwrap();
        scratch.clear();
        msg.encode_frame(&mut scratch);

        let mut written = 0;
        loop {
            written += self.out_ring.write(&scratch[written..]);
            self.reactor.wake();

            if written == scratch.len() {
                return;
            }

            scratch = self.tx_cv.wait(scratch).unwrap();
            if !self.alive.load(Ordering::Acquire) {
                return;
            }
        }
    }

    fn remote_is_node(&self) -> Result<bool> {
        let state = self.state.lock().unwrap();
        if !state.ready {
            return Err(ErrorCode::NotReady);
        }
        Ok(state.remote_is_node)
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn remote_version(&self) -> String {
        self.remote_version.clone()
    }

    fn remote_identification(&self) -> Vec<u8> {
        self.remote_identification.clone()
    }
}

/// One wire endpoint of the fabric. Produced by a successful handshake;
/// becomes functional once a leaf or node is attached with `assign`.
/// Dropping the handle tears the link down and detaches the communicator
/// after all in-flight deliveries have drained.
pub struct TcpConnection {
    inner: Arc<ChanInner>,
}

impl TcpConnection {
    /// Runs the blocking handshake on `stream` and wraps it. `timeout`
    /// bounds the whole exchange; `Duration::MAX` waits indefinitely.
    pub fn shake_hands(
        stream: std::net::TcpStream,
        identification: &[u8],
        timeout: Duration,
    ) -> Result<TcpConnection> {
        let deadline = if timeout == Duration::MAX {
            None
        } else {
            Some(Instant::now() + timeout)
        };

        let canceled = AtomicBool::new(false);
        let outcome = shake::shake_hands(&stream, identification, deadline, &canceled)?;
        TcpConnection::from_handshake(stream, outcome, logging::discard())
    }

    pub(crate) fn from_handshake(
        stream: std::net::TcpStream,
        outcome: HandshakeOutcome,
        log: Logger,
    ) -> Result<TcpConnection> {
        let _ = stream.set_nodelay(true);
        let _ = stream.set_read_timeout(None);
        let _ = stream.set_write_timeout(None);
        stream.set_nonblocking(true).map_err(|_| ErrorCode::SocketBroken)?;

        let description = match stream.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "UNCONNECTED".to_owned(),
        };

        let stream = mio::net::TcpStream::from_stream(stream).map_err(|_| ErrorCode::SocketBroken)?;

        let inner = Arc::new(ChanInner {
            stream,
            description,
            remote_version: outcome.remote_version,
            remote_identification: outcome.remote_identification,
            alive: AtomicBool::new(true),
            read_paused: AtomicBool::new(false),
            in_ring: RingBuffer::new(),
            out_ring: RingBuffer::new(),
            send_order: Mutex::new(()),
            tx: Mutex::new(Vec::new()),
            tx_cv: Condvar::new(),
            state: Mutex::new(ChanState {
                communicator: None,
                scheduler: None,
                assigning: false,
                ready: false,
                remote_is_node: false,
                timeout: HEARTBEATS_DISABLED,
                heartbeats: false,
                hb_since_recv: 0,
                hb_since_send: 0,
                deadline: None,
                token: None,
                deserialize_running: false,
            }),
            rx: Mutex::new(RxState {
                header: Vec::new(),
                scratch: Vec::new(),
                filled: 0,
                remaining: 0,
            }),
            death_op: AsyncOperation::new(),
            self_ref: Mutex::new(Weak::new()),
            reactor: Reactor::global(),
            log,
        });

        *inner.self_ref.lock().unwrap() = Arc::downgrade(&inner);

        logging::info!(inner.log, "TCP connection created";
                       "peer" => &inner.description,
                       "remote_version" => &inner.remote_version);

        Ok(TcpConnection { inner })
    }

    /// Attaches a communicator. Sends our communicator-type byte, starts the
    /// heartbeat timer and begins the main I/O loop; the connection becomes
    /// ready once the peer's type byte arrives.
    pub fn assign(&self, communicator: &CommunicatorRef, timeout: Duration) -> Result<()> {
        let inner = &self.inner;

        {
            let mut state = inner.state.lock().unwrap();
            if state.communicator.is_some() || state.assigning {
                return Err(ErrorCode::AlreadyAssigned);
            }
            state.assigning = true;
        }

        if !inner.alive.load(Ordering::Acquire) {
            inner.state.lock().unwrap().assigning = false;
            return Err(ErrorCode::ConnectionDead);
        }

        let heartbeats = timeout != HEARTBEATS_DISABLED;
        if heartbeats && timeout.as_millis() / 2 == 0 {
            inner.state.lock().unwrap().assigning = false;
            return Err(ErrorCode::InvalidParam);
        }

        if let Err(err) = communicator.on_new_connection(&(inner.clone() as ConnectionRef)) {
            inner.state.lock().unwrap().assigning = false;
            return Err(err);
        }

        {
            let mut state = inner.state.lock().unwrap();
            state.communicator = Some(communicator.clone());
            state.scheduler = Some(communicator.scheduler());
            state.timeout = timeout;
            state.heartbeats = heartbeats;
            if heartbeats {
                state.deadline = Some(Instant::now() + timeout / 2);
            }
        }

        // Our communicator-type byte precedes all framed traffic. A single
        // byte into a fresh socket buffer does not block in practice.
        let byte = [communicator.communicator_is_node() as u8];
        loop {
            let mut writer = &inner.stream;
            match writer.write(&byte) {
                Ok(1) => break,
                Ok(_) => {
                    inner.die(ErrorCode::SocketBroken);
                    return Err(ErrorCode::SocketBroken);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if !inner.alive.load(Ordering::Acquire) {
                        return Err(ErrorCode::ConnectionDead);
                    }
                    thread::yield_now();
                }
                Err(err) => {
                    let cause = ErrorCode::from_io(&err);
                    inner.die(cause);
                    return Err(cause);
                }
            }
        }

        let token = inner.reactor.register(inner);
        inner.state.lock().unwrap().token = Some(token);

        // Force an initial read pass in case the peer's byte already landed.
        inner.read_paused.store(true, Ordering::Release);
        inner.reactor.wake();

        Ok(())
    }

    /// Arms the single-shot death notification. Fires exactly once with
    /// ConnectionClosed, Timeout, SocketBroken or Canceled.
    pub fn async_await_death<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode) + Send + 'static,
    {
        if !self.inner.alive.load(Ordering::Acquire) {
            return Err(ErrorCode::ConnectionDead);
        }

        self.inner.death_op.arm(Box::new(handler))
    }

    pub fn cancel_await_death(&self) {
        self.inner.death_op.fire(|handler| handler(ErrorCode::Canceled));
    }

    pub fn alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// The trait-object identity communicators see for this connection.
    pub(crate) fn connection_ref(&self) -> ConnectionRef {
        self.inner.clone()
    }

    pub fn remote_is_node(&self) -> Result<bool> {
        Connection::remote_is_node(&*self.inner)
    }

    pub fn description(&self) -> String {
        self.inner.description.clone()
    }

    pub fn remote_version(&self) -> String {
        self.inner.remote_version.clone()
    }

    pub fn remote_identification(&self) -> Vec<u8> {
        self.inner.remote_identification.clone()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        let inner = &self.inner;

        let communicator = inner.state.lock().unwrap().communicator.take();

        // Silent teardown: the armed death handler sees Canceled, matching
        // an explicit cancel, not a wire failure.
        if inner.alive.swap(false, Ordering::AcqRel) {
            let token = inner.state.lock().unwrap().token.take();
            let _ = inner.stream.shutdown(Shutdown::Both);
            if let Some(token) = token {
                inner.reactor.deregister(token);
            }
            inner.notify_senders();
            inner.reactor.wake();
        }

        inner.death_op.fire(|handler| handler(ErrorCode::Canceled));
        inner.death_op.await_idle();

        while inner.state.lock().unwrap().deserialize_running {
            thread::yield_now();
        }

        if let Some(communicator) = communicator {
            let conn_ref: ConnectionRef = inner.clone();
            communicator.on_connection_destroyed(&conn_ref);
        }
    }
}
