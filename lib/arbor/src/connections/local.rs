use crate::connections::{CommunicatorRef, Connection, ConnectionRef};
use crate::errors::Result;
use crate::logging::{self, Logger};
use crate::msg::Message;
use crate::scheduling::Strand;
use crate::VERSION;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

const STATE_REGISTRATION: usize = 0;
const STATE_RUNNING: usize = 1;
const STATE_CLOSED: usize = 2;

struct LocalShared {
    state: AtomicUsize,
    active_posts: AtomicUsize,
    log: Logger,
}

impl LocalShared {
    fn await_idle(&self) {
        while self.active_posts.load(Ordering::Acquire) > 0 {
            thread::yield_now();
        }
    }
}

/// One direction of a local connection. The half handed to communicator X
/// delivers X's messages into the opposite communicator's strand.
struct LocalHalf {
    shared: Arc<LocalShared>,
    receiver: CommunicatorRef,
    receiver_is_node: bool,
    strand: Strand,
    self_ref: Mutex<Weak<LocalHalf>>,
    peer: Mutex<Weak<LocalHalf>>,
}

impl LocalHalf {
    fn new(shared: Arc<LocalShared>, receiver: &CommunicatorRef) -> Arc<LocalHalf> {
        let half = Arc::new(LocalHalf {
            shared: shared.clone(),
            receiver: receiver.clone(),
            receiver_is_node: receiver.communicator_is_node(),
            strand: Strand::new(receiver.scheduler()),
            self_ref: Mutex::new(Weak::new()),
            peer: Mutex::new(Weak::new()),
        });

        *half.self_ref.lock().unwrap() = Arc::downgrade(&half);
        half
    }

    fn link(self: &Arc<LocalHalf>, peer: &Arc<LocalHalf>) {
        *self.peer.lock().unwrap() = Arc::downgrade(peer);
    }

    fn upgrade_self(&self) -> Option<Arc<LocalHalf>> {
        self.self_ref.lock().unwrap().upgrade()
    }

    /// Delivers one message on the receiver's strand. Posted work spins
    /// through the registration window and is dropped once the connection
    /// has closed.
    fn deliver(self: &Arc<LocalHalf>, msg: Message) {
        while self.shared.state.load(Ordering::Acquire) == STATE_REGISTRATION {
            thread::yield_now();
        }

        if self.shared.state.load(Ordering::Acquire) == STATE_CLOSED {
            self.shared.active_posts.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        // The receiver was registered with the opposite half; deliveries
        // must carry that identity as their origin.
        let origin: ConnectionRef = match self.peer.lock().unwrap().upgrade() {
            Some(peer) => peer,
            None => {
                self.shared.active_posts.fetch_sub(1, Ordering::AcqRel);
                return;
            }
        };

        if let Err(err) = self.receiver.on_message_received(msg, &origin) {
            logging::error!(self.shared.log, "error processing local message, closing connection";
                            "error" => %err);
            self.close();
        }

        self.shared.active_posts.fetch_sub(1, Ordering::AcqRel);
    }

    fn post_death(self: &Arc<LocalHalf>) {
        let peer = match self.peer.lock().unwrap().upgrade() {
            Some(peer) => peer,
            None => return,
        };

        self.shared.active_posts.fetch_add(1, Ordering::AcqRel);

        let this = self.clone();
        self.strand.post(Box::new(move || {
            let origin: ConnectionRef = peer.clone();
            this.receiver.on_connection_destroyed(&origin);
            this.shared.active_posts.fetch_sub(1, Ordering::AcqRel);
        }));
    }

    /// Closes both directions; death notifications are queued behind any
    /// deliveries already on the strands.
    fn close(self: &Arc<LocalHalf>) {
        if self.shared.state.swap(STATE_CLOSED, Ordering::AcqRel) != STATE_CLOSED {
            self.post_death();
            if let Some(peer) = self.peer.lock().unwrap().upgrade() {
                peer.post_death();
            }
        }
    }
}

impl Connection for LocalHalf {
    /// Messages are cloned on the sender's thread and posted to the
    /// receiver's strand, so delivery into a communicator is serialized
    /// without a lock.
    fn send(&self, msg: &Message) {
        if self.shared.state.load(Ordering::Acquire) == STATE_CLOSED {
            return;
        }

        let this = match self.upgrade_self() {
            Some(this) => this,
            None => return,
        };

        self.shared.active_posts.fetch_add(1, Ordering::AcqRel);

        let msg = msg.clone();
        self.strand.post(Box::new(move || this.deliver(msg)));
    }

    fn remote_is_node(&self) -> Result<bool> {
        Ok(self.receiver_is_node)
    }

    fn description(&self) -> String {
        "Local Connection".to_owned()
    }

    fn remote_version(&self) -> String {
        VERSION.to_owned()
    }

    fn remote_identification(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Connects two in-process communicators bidirectionally without
/// serialization. Local connections are not heartbeated; they die when this
/// object is dropped or when a delivery fails.
pub struct LocalConnection {
    shared: Arc<LocalShared>,
    half_for_a: Arc<LocalHalf>,
    half_for_b: Arc<LocalHalf>,
}

impl LocalConnection {
    pub fn new(side_a: &CommunicatorRef, side_b: &CommunicatorRef) -> Result<LocalConnection> {
        LocalConnection::with_logger(side_a, side_b, logging::discard())
    }

    pub fn with_logger(
        side_a: &CommunicatorRef,
        side_b: &CommunicatorRef,
        log: Logger,
    ) -> Result<LocalConnection> {
        let shared = Arc::new(LocalShared {
            state: AtomicUsize::new(STATE_REGISTRATION),
            active_posts: AtomicUsize::new(0),
            log,
        });

        // The half handed to A delivers into B and vice versa. A half's
        // remote is the communicator the *other* half delivers into.
        let half_for_a = LocalHalf::new(shared.clone(), side_b);
        let half_for_b = LocalHalf::new(shared.clone(), side_a);
        half_for_a.link(&half_for_b);
        half_for_b.link(&half_for_a);

        let conn = LocalConnection {
            shared,
            half_for_a,
            half_for_b,
        };
        conn.register(side_a, side_b)?;

        Ok(conn)
    }

    fn register(&self, side_a: &CommunicatorRef, side_b: &CommunicatorRef) -> Result<()> {
        let ref_a: ConnectionRef = self.half_for_a.clone();
        let ref_b: ConnectionRef = self.half_for_b.clone();

        let result = (|| {
            side_a.on_new_connection(&ref_a)?;
            if let Err(err) = side_a.on_connection_started(&ref_a) {
                self.half_for_b.post_death();
                return Err(err);
            }

            if let Err(err) = side_b.on_new_connection(&ref_b) {
                self.half_for_b.post_death();
                return Err(err);
            }
            if let Err(err) = side_b.on_connection_started(&ref_b) {
                // Both sides recorded the link; tell both it died before
                // running. Deaths for a side are delivered by the half whose
                // receiver that side is.
                self.half_for_b.post_death();
                self.half_for_a.post_death();
                return Err(err);
            }

            Ok(())
        })();

        match result {
            Ok(()) => {
                self.shared.state.store(STATE_RUNNING, Ordering::Release);
                Ok(())
            }
            Err(err) => {
                self.shared.state.store(STATE_CLOSED, Ordering::Release);
                self.shared.await_idle();
                Err(err)
            }
        }
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.half_for_a.close();
        self.shared.await_idle();
    }
}
