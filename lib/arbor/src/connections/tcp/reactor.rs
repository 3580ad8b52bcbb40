use crate::connections::tcp::channel::ChanInner;
use crate::connections::Connection;
use crate::logging::{self, Logger};

use hashbrown::HashMap;
use lazy_static::lazy_static;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const WAKE_TOKEN: Token = Token(0);
const FIRST_CONN_TOKEN: usize = 1;

struct ReactorState {
    conns: HashMap<usize, Arc<ChanInner>>,
    next_token: usize,
}

/// The process-wide poll loop servicing every live TCP connection.
///
/// One thread multiplexes socket readiness, ring-buffer housekeeping and the
/// heartbeat timers. Connections register after their pre-messaging exchange
/// is set up and deregister when they die; all socket I/O happens on this
/// thread, which is what makes the rings single-producer/single-consumer.
pub(crate) struct Reactor {
    poll: Poll,
    wake: SetReadiness,
    state: Mutex<ReactorState>,
    // The reactor outlives every connection, so it keeps its own stderr
    // root; a poll or registration failure here must never vanish into a
    // discard drain.
    log: Logger,
}

lazy_static! {
    static ref GLOBAL: Arc<Reactor> = Reactor::start();
}

impl Reactor {
    pub fn global() -> Arc<Reactor> {
        GLOBAL.clone()
    }

    fn start() -> Arc<Reactor> {
        let poll = Poll::new().expect("Creating the reactor poll failed");

        let (registration, wake) = Registration::new2();
        poll.register(&registration, WAKE_TOKEN, Ready::readable(), PollOpt::edge())
            .expect("Registering the reactor wakeup failed");

        let reactor = Arc::new(Reactor {
            poll,
            wake,
            state: Mutex::new(ReactorState {
                conns: HashMap::new(),
                next_token: FIRST_CONN_TOKEN,
            }),
            log: logging::terminal(logging::VB_INFO),
        });

        {
            let reactor = reactor.clone();
            thread::Builder::new()
                .name("arbor-reactor".to_owned())
                .spawn(move || reactor.run(registration))
                .expect("Spawning the reactor thread failed");
        }

        reactor
    }

    /// Registers a connection for readiness events and returns its token.
    pub fn register(&self, conn: &Arc<ChanInner>) -> usize {
        logging::trace!(self.log, "registering connection"; "peer" => conn.description());

        let mut state = self.state.lock().unwrap();
        let token = state.next_token;
        state.next_token += 1;

        self.poll
            .register(
                conn.stream(),
                Token(token),
                Ready::readable() | Ready::writable(),
                PollOpt::edge(),
            )
            .expect("Registering a connection with the reactor failed");

        state.conns.insert(token, conn.clone());
        token
    }

    pub fn deregister(&self, token: usize) {
        let mut state = self.state.lock().unwrap();
        if let Some(conn) = state.conns.remove(&token) {
            let _ = self.poll.deregister(conn.stream());
        }
    }

    /// Nudges the loop so it re-runs the housekeeping pass (TX flush, read
    /// resume, timer recalculation).
    pub fn wake(&self) {
        let _ = self.wake.set_readiness(Ready::readable());
    }

    fn snapshot(&self) -> Vec<Arc<ChanInner>> {
        self.state.lock().unwrap().conns.values().cloned().collect()
    }

    fn next_deadline(&self, conns: &[Arc<ChanInner>]) -> Option<Duration> {
        let now = Instant::now();
        conns
            .iter()
            .filter_map(|conn| conn.timer_deadline())
            .map(|deadline| {
                if deadline > now {
                    deadline - now
                } else {
                    Duration::from_millis(0)
                }
            })
            .min()
    }

    fn run(self: Arc<Reactor>, _wake_handle: Registration) {
        let mut events = Events::with_capacity(1024);

        loop {
            let conns = self.snapshot();
            let timeout = self.next_deadline(&conns);

            if let Err(err) = self.poll.poll(&mut events, timeout) {
                logging::error!(self.log, "reactor poll failed"; "error" => %err);
                continue;
            }

            for event in &events {
                if event.token() == WAKE_TOKEN {
                    // Reset the user-space readiness so the next wake-up
                    // registers as a fresh edge.
                    let _ = self.wake.set_readiness(Ready::empty());
                    continue;
                }

                let conn = {
                    let state = self.state.lock().unwrap();
                    state.conns.get(&event.token().0).cloned()
                };

                if let Some(conn) = conn {
                    if event.readiness().is_writable() {
                        conn.handle_writable();
                    }
                    if event.readiness().is_readable() {
                        conn.handle_readable();
                    }
                }
            }

            // Housekeeping: drain pending output, resume paused reads and
            // fire due heartbeat timers for every connection.
            let now = Instant::now();
            for conn in self.snapshot() {
                conn.flush();
                conn.resume_read();
                conn.handle_timer(now);
            }
        }
    }
}
