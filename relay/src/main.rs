//! Standalone routing hub. Hosts a node behind a TCP server so any number
//! of leaves and other hubs can interconnect through it.

mod config;

use crate::config::RelayConfig;

use arbor::connections::tcp::{TcpConnection, TcpServer};
use arbor::connections::CommunicatorRef;
use arbor::core::Node;
use arbor::logging::{self, Logger};
use arbor::scheduling::{MultiThreadedScheduler, Scheduler};
use arbor::ErrorCode;

use clap::{App, Arg};

use std::io::BufRead;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Relay {
    node: Arc<Node>,
    server: Arc<TcpServer>,
    conns: Arc<Mutex<Vec<TcpConnection>>>,
    timeout: Duration,
    handshake_timeout: Duration,
    log: Logger,
}

/// Arms the next accept; every accepted socket is attached to the node and
/// kept until its link dies.
fn arm_accept(relay: &Arc<Relay>) {
    let this = relay.clone();

    let result = relay.server.async_accept(relay.handshake_timeout, move |result| {
        match result {
            Ok(conn) => {
                logging::info!(this.log, "peer connected";
                               "peer" => conn.description(),
                               "version" => conn.remote_version());

                let node_comm: CommunicatorRef = this.node.clone();
                match conn.assign(&node_comm, this.timeout) {
                    Ok(()) => {
                        let mut conns = this.conns.lock().unwrap();
                        conns.retain(|c| c.alive());
                        conns.push(conn);
                    }
                    Err(err) => {
                        logging::error!(this.log, "attaching peer failed"; "error" => %err);
                    }
                }
            }
            Err(ErrorCode::Canceled) => return,
            Err(err) => {
                logging::error!(this.log, "accepting peer failed"; "error" => %err);
            }
        }

        arm_accept(&this);
    });

    if let Err(err) = result {
        logging::error!(relay.log, "arming accept failed"; "error" => %err);
    }
}

fn run() -> arbor::Result<()> {
    let matches = App::new("arbor-relay")
        .version(arbor::VERSION)
        .about("Messaging fabric routing hub")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("Path to the TOML configuration file"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .takes_value(true)
                .help("Overrides the configured listening port"),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => RelayConfig::load(path),
        None => RelayConfig::default(),
    };

    if let Some(port) = matches.value_of("port") {
        config.server.port = port.parse().map_err(|_| ErrorCode::InvalidPortNumber)?;
    }

    let log = match &config.log.file {
        Some(path) => logging::file(path, config.log.verbosity)?,
        None => logging::terminal(config.log.verbosity),
    };

    let scheduler: Arc<dyn Scheduler> = Arc::new(MultiThreadedScheduler::new(2)?);
    let node = Node::with_logger(scheduler.clone(), log.clone());

    let server = Arc::new(TcpServer::new(
        scheduler,
        &config.server.address,
        config.server.port,
        config.server.identification.as_bytes(),
        log.clone(),
    )?);

    logging::info!(log, "relay up";
                   "address" => &config.server.address,
                   "port" => config.server.port);

    let relay = Arc::new(Relay {
        node,
        server,
        conns: Arc::new(Mutex::new(Vec::new())),
        timeout: Duration::from_millis(config.connections.timeout_ms),
        handshake_timeout: Duration::from_millis(config.connections.handshake_timeout_ms),
        log: log.clone(),
    });
    arm_accept(&relay);

    // Serve until stdin closes.
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        if line.is_err() {
            break;
        }
    }

    logging::info!(log, "shutting down");
    relay.server.cancel_accept();

    Ok(())
}

fn main() {
    match run() {
        Ok(()) => process::exit(0),
        Err(err) => {
            eprintln!("Initialisation failed: {}", err);
            process::exit(1);
        }
    }
}
