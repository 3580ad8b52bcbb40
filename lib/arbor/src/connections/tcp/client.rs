use crate::base::async_op::AsyncOperation;
use crate::connections::tcp::channel::TcpConnection;
use crate::connections::tcp::shake;
use crate::errors::{ErrorCode, Result};
use crate::logging::{self, Logger};
use crate::scheduling::Scheduler;
use crate::MAX_IDENTIFICATION_SIZE;

use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type ConnectHandler = Box<dyn FnOnce(Result<TcpConnection>) + Send>;

struct ClientInner {
    scheduler: Arc<dyn Scheduler>,
    identification: Vec<u8>,
    connect_op: AsyncOperation<ConnectHandler>,
    canceled: AtomicBool,
    in_flight: Mutex<Option<TcpStream>>,
    log: Logger,
}

fn map_connect_error(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => ErrorCode::ConnectionRefused,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorCode::Timeout,
        io::ErrorKind::AddrNotAvailable => ErrorCode::HostUnreachable,
        _ => ErrorCode::ConnectFailed,
    }
}

/// Establishes outbound connections: resolve, connect, shake hands. One
/// connect operation at a time; the armed handler fires exactly once.
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl TcpClient {
    pub fn new(scheduler: Arc<dyn Scheduler>, identification: &[u8], log: Logger) -> Result<TcpClient> {
        if identification.len() > MAX_IDENTIFICATION_SIZE {
            return Err(ErrorCode::IdentificationTooLarge);
        }

        Ok(TcpClient {
            inner: Arc::new(ClientInner {
                scheduler,
                identification: identification.to_vec(),
                connect_op: AsyncOperation::new(),
                canceled: AtomicBool::new(false),
                in_flight: Mutex::new(None),
                log,
            }),
        })
    }

    /// Connects to `host:port` and shakes hands, with `timeout` bounding
    /// the whole sequence (`Duration::MAX` for no bound).
    pub fn async_connect<F>(&self, host: &str, port: u16, timeout: Duration, handler: F) -> Result<()>
    where
        F: FnOnce(Result<TcpConnection>) + Send + 'static,
    {
        if port == 0 {
            return Err(ErrorCode::InvalidPortNumber);
        }

        self.inner.canceled.store(false, Ordering::Release);
        self.inner.connect_op.arm(Box::new(handler))?;

        let inner = self.inner.clone();
        let host = host.to_owned();

        thread::Builder::new()
            .name("arbor-tcp-connect".to_owned())
            .spawn(move || Self::connect(inner, host, port, timeout))
            .expect("Spawning the connect thread failed");

        Ok(())
    }

    pub fn cancel_connect(&self) {
        self.inner.canceled.store(true, Ordering::Release);

        if let Some(stream) = self.inner.in_flight.lock().unwrap().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        self.inner
            .connect_op
            .fire(|handler| handler(Err(ErrorCode::Canceled)));
    }

    fn connect(inner: Arc<ClientInner>, host: String, port: u16, timeout: Duration) {
        let deadline = if timeout == Duration::MAX {
            None
        } else {
            Some(Instant::now() + timeout)
        };

        let result = Self::establish(&inner, &host, port, deadline);

        if let Err(err) = &result {
            logging::debug!(inner.log, "connect failed";
                            "host" => &host,
                            "port" => port,
                            "error" => %err);
        }

        inner.in_flight.lock().unwrap().take();

        let scheduler = inner.scheduler.clone();
        inner.connect_op.fire(move |handler| {
            scheduler.post(Box::new(move || handler(result)));
        });
    }

    fn establish(
        inner: &Arc<ClientInner>,
        host: &str,
        port: u16,
        deadline: Option<Instant>,
    ) -> Result<TcpConnection> {
        let mut addrs = (host, port).to_socket_addrs().map_err(|_| ErrorCode::ResolveFailed)?;
        let addr = addrs.next().ok_or(ErrorCode::ResolveFailed)?;

        let stream = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(ErrorCode::Timeout);
                }
                TcpStream::connect_timeout(&addr, deadline - now).map_err(|e| map_connect_error(&e))?
            }
            None => TcpStream::connect(addr).map_err(|e| map_connect_error(&e))?,
        };

        if inner.canceled.load(Ordering::Acquire) {
            return Err(ErrorCode::Canceled);
        }

        *inner.in_flight.lock().unwrap() = Some(stream.try_clone().map_err(|_| ErrorCode::SocketBroken)?);

        let outcome = shake::shake_hands(&stream, &inner.identification, deadline, &inner.canceled)?;
        TcpConnection::from_handshake(stream, outcome, inner.log.clone())
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.cancel_connect();
    }
}
