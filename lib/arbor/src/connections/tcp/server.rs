use crate::base::async_op::AsyncOperation;
use crate::connections::tcp::channel::TcpConnection;
use crate::connections::tcp::shake;
use crate::errors::{ErrorCode, Result};
use crate::logging::{self, Logger};
use crate::scheduling::Scheduler;
use crate::MAX_IDENTIFICATION_SIZE;

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub type AcceptHandler = Box<dyn FnOnce(Result<TcpConnection>) + Send>;

struct Armed {
    timeout: Duration,
    handler: AcceptHandler,
}

struct ServerInner {
    scheduler: Arc<dyn Scheduler>,
    identification: Vec<u8>,
    listener: TcpListener,
    accept_op: AsyncOperation<Armed>,
    stop: AtomicBool,
    canceled: AtomicBool,
    log: Logger,
}

fn map_bind_error(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::AddrInUse => ErrorCode::AddressInUse,
        io::ErrorKind::PermissionDenied => ErrorCode::CannotOpenSocket,
        io::ErrorKind::AddrNotAvailable => ErrorCode::CannotBindSocket,
        _ => ErrorCode::CannotListenOnSocket,
    }
}

/// Listens on one interface/port pair and shakes hands with inbound
/// sockets. A single accept operation is armed at a time; each armed
/// operation produces exactly one handler call.
pub struct TcpServer {
    inner: Arc<ServerInner>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TcpServer {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        address: &str,
        port: u16,
        identification: &[u8],
        log: Logger,
    ) -> Result<TcpServer> {
        if identification.len() > MAX_IDENTIFICATION_SIZE {
            return Err(ErrorCode::IdentificationTooLarge);
        }
        if port == 0 {
            return Err(ErrorCode::InvalidPortNumber);
        }

        let ip: IpAddr = address.parse().map_err(|_| ErrorCode::InvalidIpAddress)?;

        let listener = TcpListener::bind(SocketAddr::new(ip, port)).map_err(|e| map_bind_error(&e))?;
        listener
            .set_nonblocking(true)
            .map_err(|_| ErrorCode::CannotListenOnSocket)?;

        let inner = Arc::new(ServerInner {
            scheduler,
            identification: identification.to_vec(),
            listener,
            accept_op: AsyncOperation::new(),
            stop: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            log,
        });

        let thread = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("arbor-tcp-server".to_owned())
                .spawn(move || Self::accept_loop(inner))
                .expect("Spawning the acceptor thread failed")
        };

        logging::info!(inner.log, "TCP server listening"; "address" => address, "port" => port);

        Ok(TcpServer {
            inner,
            thread: Some(thread),
        })
    }

    /// Arms one accept. The handler fires with a ready-to-assign connection,
    /// or with AcceptFailed / a handshake error / Canceled.
    pub fn async_accept<F>(&self, handshake_timeout: Duration, handler: F) -> Result<()>
    where
        F: FnOnce(Result<TcpConnection>) + Send + 'static,
    {
        self.inner.canceled.store(false, Ordering::Release);
        self.inner.accept_op.arm(Armed {
            timeout: handshake_timeout,
            handler: Box::new(handler),
        })
    }

    pub fn cancel_accept(&self) {
        self.inner.canceled.store(true, Ordering::Release);
        self.inner
            .accept_op
            .fire(|armed| (armed.handler)(Err(ErrorCode::Canceled)));
    }

    fn accept_loop(inner: Arc<ServerInner>) {
        while !inner.stop.load(Ordering::Acquire) {
            if !inner.accept_op.armed() {
                thread::sleep(Duration::from_millis(2));
                continue;
            }

            match inner.listener.accept() {
                Ok((stream, addr)) => {
                    logging::debug!(inner.log, "accepted socket"; "peer" => %addr);
                    Self::complete(&inner, stream);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(2));
                }
                Err(err) => {
                    logging::error!(inner.log, "accepting a connection failed"; "error" => %err);
                    inner
                        .accept_op
                        .fire(|armed| (armed.handler)(Err(ErrorCode::AcceptFailed)));
                }
            }
        }
    }

    /// Shakes hands on the accepted socket and fires the armed handler via
    /// the scheduler.
    fn complete(inner: &Arc<ServerInner>, stream: std::net::TcpStream) {
        // The handshake runs on a blocking socket with deadline-derived
        // timeouts; the nonblocking flag may be inherited from the listener.
        let _ = stream.set_nonblocking(false);

        let identification = inner.identification.clone();
        let log = inner.log.clone();
        let canceled = &inner.canceled;

        inner.accept_op.fire(|armed| {
            let deadline = if armed.timeout == Duration::MAX {
                None
            } else {
                Some(Instant::now() + armed.timeout)
            };

            let result = shake::shake_hands(&stream, &identification, deadline, canceled)
                .and_then(|outcome| TcpConnection::from_handshake(stream, outcome, log));

            let handler = armed.handler;
            inner.scheduler.post(Box::new(move || handler(result)));
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.inner.stop.store(true, Ordering::Release);
        self.cancel_accept();

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
