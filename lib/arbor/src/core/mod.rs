pub(crate) mod arena;
pub mod bindings;
pub mod leaf;
pub mod node;
pub mod pattern;
pub mod terminals;

pub use self::bindings::{Binding, BindingState};
pub use self::leaf::Leaf;
pub use self::node::{KnownTerminalChange, KnownTerminals, Node};
pub use self::pattern::Pattern;
pub use self::terminals::{
    CachedConsumerTerminal, CachedMasterTerminal, CachedProducerTerminal,
    CachedPublishSubscribeTerminal, CachedSlaveTerminal, ClientTerminal, ConsumerTerminal,
    DeafMuteTerminal, MasterTerminal, ProducerTerminal, PublishSubscribeTerminal,
    ScatterGatherTerminal, ServiceTerminal, SlaveTerminal,
};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::connections::{Connection, ConnectionRef};
    use crate::errors::Result;
    use crate::msg::Message;
    use crate::VERSION;

    use std::sync::{Arc, Mutex};

    /// Connection stub for driving leaf and node logic directly: records
    /// everything sent through it.
    pub struct MockConnection {
        node: bool,
        pub sent: Mutex<Vec<Message>>,
    }

    impl MockConnection {
        pub fn leaf_peer() -> Arc<MockConnection> {
            MockConnection::new(false)
        }

        pub fn node_peer() -> Arc<MockConnection> {
            MockConnection::new(true)
        }

        fn new(node: bool) -> Arc<MockConnection> {
            Arc::new(MockConnection {
                node,
                sent: Mutex::new(Vec::new()),
            })
        }

        /// Drains and returns everything sent so far.
        pub fn take_sent(&self) -> Vec<Message> {
            std::mem::replace(&mut *self.sent.lock().unwrap(), Vec::new())
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    impl Connection for MockConnection {
        fn send(&self, msg: &Message) {
            self.sent.lock().unwrap().push(msg.clone());
        }

        fn remote_is_node(&self) -> Result<bool> {
            Ok(self.node)
        }

        fn description(&self) -> String {
            "Mock Connection".to_owned()
        }

        fn remote_version(&self) -> String {
            VERSION.to_owned()
        }

        fn remote_identification(&self) -> Vec<u8> {
            Vec::new()
        }
    }

    /// Convenience upcast.
    pub fn conn_ref(conn: &Arc<MockConnection>) -> ConnectionRef {
        conn.clone()
    }
}

#[cfg(test)]
mod fabric_tests {
    use super::*;
    use crate::connections::local::LocalConnection;
    use crate::connections::CommunicatorRef;
    use crate::errors::ErrorCode;
    use crate::identity::Identifier;
    use crate::msg::GatherFlags;
    use crate::scheduling::{MultiThreadedScheduler, Scheduler};

    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_for<F: FnMut() -> bool>(what: &str, mut condition: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            if Instant::now() > deadline {
                panic!("Timed out waiting for {}", what);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    struct Fabric {
        scheduler: Arc<dyn Scheduler>,
        node: Arc<Node>,
    }

    impl Fabric {
        fn new() -> Fabric {
            let scheduler: Arc<dyn Scheduler> = Arc::new(MultiThreadedScheduler::new(2).unwrap());
            let node = Node::new(scheduler.clone());
            Fabric { scheduler, node }
        }

        fn leaf(&self) -> Arc<Leaf> {
            Leaf::new(self.scheduler.clone())
        }

        fn connect(&self, leaf: &Arc<Leaf>) -> LocalConnection {
            let leaf_comm: CommunicatorRef = leaf.clone();
            let node_comm: CommunicatorRef = self.node.clone();
            LocalConnection::new(&leaf_comm, &node_comm).unwrap()
        }
    }

    /// Publish-subscribe through a node: a publisher on one leaf reaches the
    /// bound terminal on another leaf, and never itself.
    #[test]
    fn test_publish_subscribe_through_node() {
        let fabric = Fabric::new();

        let leaf_a = fabric.leaf();
        let leaf_b = fabric.leaf();

        let term_a = PublishSubscribeTerminal::new(&leaf_a, 0, "a").unwrap();
        let term_b = PublishSubscribeTerminal::new(&leaf_b, 0, "a").unwrap();
        let binding_b = term_b.make_binding("a").unwrap();

        let received_b = Arc::new(Mutex::new(Vec::new()));
        let sink = received_b.clone();
        term_b
            .async_receive(64, move |code, payload| {
                sink.lock().unwrap().push((code, payload));
            })
            .unwrap();

        let woken_a = Arc::new(Mutex::new(Vec::new()));
        let sink = woken_a.clone();
        term_a
            .async_receive(64, move |code, payload| {
                sink.lock().unwrap().push((code, payload));
            })
            .unwrap();

        let _conn_a = fabric.connect(&leaf_a);
        let _conn_b = fabric.connect(&leaf_b);

        wait_for("binding to establish", || binding_b.state() == BindingState::Established);

        // The node's subscription takes a moment to propagate; publishes
        // before that report unreachable and are dropped.
        wait_for("publish to reach the fabric", || {
            term_a.publish(b"ab".to_vec()).unwrap()
        });

        wait_for("delivery on the bound terminal", || {
            !received_b.lock().unwrap().is_empty()
        });
        let received = received_b.lock().unwrap();
        assert_eq!((ErrorCode::Ok, b"ab".to_vec()), received[0]);

        // The publisher's own receive stays armed.
        assert!(woken_a.lock().unwrap().is_empty());
    }

    /// Cached publish-subscribe: a payload published before the subscriber
    /// attaches is delivered from the caches with the cached flag set, and
    /// live publishes after that arrive with it cleared.
    #[test]
    fn test_cached_late_subscribe() {
        let fabric = Fabric::new();

        let leaf_a = fabric.leaf();
        let term_a = CachedPublishSubscribeTerminal::new(&leaf_a, 0, "t").unwrap();
        let _conn_a = fabric.connect(&leaf_a);

        // Nothing is reachable yet; the payload only lands in the cache.
        assert_eq!(false, term_a.publish(b"cd".to_vec()).unwrap());

        let leaf_b = fabric.leaf();
        let term_b = CachedPublishSubscribeTerminal::new(&leaf_b, 0, "t").unwrap();
        let _binding_b = term_b.make_binding("t").unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        term_b
            .async_receive(64, move |code, payload, cached| {
                sink.lock().unwrap().push((code, payload, cached));
            })
            .unwrap();

        let _conn_b = fabric.connect(&leaf_b);

        wait_for("cached payload to arrive", || !received.lock().unwrap().is_empty());
        assert_eq!(
            (ErrorCode::Ok, b"cd".to_vec(), true),
            received.lock().unwrap()[0].clone()
        );

        // A live publish follows with the cached flag cleared.
        let sink = received.clone();
        term_b
            .async_receive(64, move |code, payload, cached| {
                sink.lock().unwrap().push((code, payload, cached));
            })
            .unwrap();

        wait_for("live publish to reach the fabric", || {
            term_a.publish(b"ef".to_vec()).unwrap()
        });
        wait_for("live payload to arrive", || received.lock().unwrap().len() >= 2);
        let second = received.lock().unwrap()[1].clone();
        assert_eq!(ErrorCode::Ok, second.0);
        assert_eq!(b"ef".to_vec(), second.1);
        assert_eq!(false, second.2);
    }

    struct Responder {
        _leaf: Arc<Leaf>,
        _terminal: Arc<ScatterGatherTerminal>,
        binding: Binding,
        _conn: LocalConnection,
    }

    /// A leaf answering scatters on "a": with a payload, or by ignoring.
    /// The returned binding handle doubles as the readiness signal - once it
    /// is established the node routes scatters this way.
    fn make_responder(fabric: &Fabric, respond_with: Option<Vec<u8>>) -> Responder {
        let leaf = fabric.leaf();
        let terminal = Arc::new(ScatterGatherTerminal::new(&leaf, 0, "a").unwrap());
        let binding = terminal.make_binding("a").unwrap();

        let inner = terminal.clone();
        terminal
            .async_receive_scattered(64, move |code, operation, _payload| {
                if code != ErrorCode::Ok {
                    return;
                }
                let _ = match respond_with {
                    Some(payload) => inner.respond_to_scattered(operation, payload),
                    None => inner.ignore_scattered(operation),
                };
            })
            .unwrap();

        let conn = fabric.connect(&leaf);
        Responder {
            _leaf: leaf,
            _terminal: terminal,
            binding,
            _conn: conn,
        }
    }

    /// Scatter-gather to two responders through a node: one answers, one
    /// ignores; the initiator sees the ignore flag and exactly one FINISHED.
    #[test]
    fn test_scatter_gather_two_responders() {
        let fabric = Fabric::new();

        let leaf_a = fabric.leaf();
        let term_a = ScatterGatherTerminal::new(&leaf_a, 0, "a").unwrap();
        let _conn_a = fabric.connect(&leaf_a);

        let responder = make_responder(&fabric, Some(b"y".to_vec()));
        let ignorer = make_responder(&fabric, None);

        wait_for("both responders to be routed to", || {
            responder.binding.state() == BindingState::Established
                && ignorer.binding.state() == BindingState::Established
        });

        let calls = Arc::new(Mutex::new(Vec::new()));

        // Scattering additionally needs the node's subscription to have
        // landed on the initiating leaf.
        wait_for("scatter to become possible", || {
            let sink = calls.clone();
            term_a
                .async_scatter_gather(b"x".to_vec(), 64, move |code, _op, flags, payload| {
                    sink.lock().unwrap().push((code, flags, payload.to_vec()));
                    true
                })
                .is_ok()
        });

        wait_for("the operation to finish", || {
            calls
                .lock()
                .unwrap()
                .iter()
                .any(|(_, flags, _)| flags.contains(GatherFlags::FINISHED))
        });

        let calls = calls.lock().unwrap();
        assert!(calls.iter().all(|(code, _, _)| *code == ErrorCode::Ok));
        assert!(calls
            .iter()
            .any(|(_, flags, payload)| flags.contains(GatherFlags::IGNORED) && payload.is_empty()));
        assert!(calls.iter().any(|(_, _, payload)| payload == b"y"));
        assert_eq!(
            1,
            calls
                .iter()
                .filter(|(_, flags, _)| flags.contains(GatherFlags::FINISHED))
                .count()
        );
        assert!(calls.last().unwrap().1.contains(GatherFlags::FINISHED));
    }

    /// Losing a responder's connection mid-operation terminates the
    /// operation with CONNECTION_LOST | FINISHED.
    #[test]
    fn test_scatter_gather_connection_lost() {
        let fabric = Fabric::new();

        let leaf_a = fabric.leaf();
        let term_a = ScatterGatherTerminal::new(&leaf_a, 0, "a").unwrap();
        let _conn_a = fabric.connect(&leaf_a);

        let responder = make_responder(&fabric, Some(b"y".to_vec()));

        // The silent one never answers; its link is torn down mid-operation.
        let silent_leaf = fabric.leaf();
        let silent_term = ScatterGatherTerminal::new(&silent_leaf, 0, "a").unwrap();
        let silent_binding = silent_term.make_binding("a").unwrap();
        silent_term.async_receive_scattered(64, |_, _, _| {}).unwrap();
        let silent_conn = fabric.connect(&silent_leaf);

        wait_for("both responders to be routed to", || {
            responder.binding.state() == BindingState::Established
                && silent_binding.state() == BindingState::Established
        });

        let calls: Arc<Mutex<Vec<(ErrorCode, GatherFlags)>>> = Arc::new(Mutex::new(Vec::new()));

        wait_for("scatter to become possible", || {
            let sink = calls.clone();
            term_a
                .async_scatter_gather(b"x".to_vec(), 64, move |code, _op, flags, _payload| {
                    sink.lock().unwrap().push((code, flags));
                    true
                })
                .is_ok()
        });

        // Wait until the well-behaved responder's answer went through, then
        // cut the silent responder's link.
        wait_for("the first response", || !calls.lock().unwrap().is_empty());
        drop(silent_conn);
        drop(responder);

        wait_for("the terminating response", || {
            calls
                .lock()
                .unwrap()
                .iter()
                .any(|(_, flags)| flags.contains(GatherFlags::FINISHED))
        });

        let calls = calls.lock().unwrap();
        let terminating = calls
            .iter()
            .find(|(_, flags)| flags.contains(GatherFlags::FINISHED))
            .unwrap();
        assert!(terminating.1.contains(GatherFlags::CONNECTION_LOST));
    }

    /// Consumer terminals receive what producers publish; the producer's
    /// reachability follows the consumer's presence.
    #[test]
    fn test_producer_consumer_through_node() {
        let fabric = Fabric::new();

        let leaf_a = fabric.leaf();
        let producer = ProducerTerminal::new(&leaf_a, 9, "metrics").unwrap();
        let _conn_a = fabric.connect(&leaf_a);

        let leaf_b = fabric.leaf();
        let consumer = ConsumerTerminal::new(&leaf_b, 9, "metrics").unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        consumer
            .async_receive(64, move |code, payload| {
                sink.lock().unwrap().push((code, payload));
            })
            .unwrap();

        let _conn_b = fabric.connect(&leaf_b);

        wait_for("consumer binding to establish", || {
            consumer.state() == BindingState::Established
        });
        wait_for("publish to reach the fabric", || {
            producer.publish(b"42".to_vec()).unwrap()
        });
        wait_for("delivery at the consumer", || !received.lock().unwrap().is_empty());

        assert_eq!(
            (ErrorCode::Ok, b"42".to_vec()),
            received.lock().unwrap()[0].clone()
        );
    }

    /// A slave's publish reaches the master, which echoes it back out to the
    /// other slaves.
    #[test]
    fn test_master_slave_echo_through_node() {
        let fabric = Fabric::new();

        let master_leaf = fabric.leaf();
        let master = MasterTerminal::new(&master_leaf, 0, "state").unwrap();
        let master_received = Arc::new(Mutex::new(Vec::new()));
        let sink = master_received.clone();
        master
            .async_receive(64, move |code, payload| {
                sink.lock().unwrap().push((code, payload));
            })
            .unwrap();
        let _conn_m = fabric.connect(&master_leaf);

        let slave1_leaf = fabric.leaf();
        let slave1 = SlaveTerminal::new(&slave1_leaf, 0, "state").unwrap();
        let _conn_s1 = fabric.connect(&slave1_leaf);

        let slave2_leaf = fabric.leaf();
        let slave2 = SlaveTerminal::new(&slave2_leaf, 0, "state").unwrap();
        let slave2_received = Arc::new(Mutex::new(Vec::new()));
        let sink = slave2_received.clone();
        slave2
            .async_receive(64, move |code, payload| {
                sink.lock().unwrap().push((code, payload));
            })
            .unwrap();
        let _conn_s2 = fabric.connect(&slave2_leaf);

        // Both slaves must be routed to before the echo can reach them.
        wait_for("slaves to bind to the master", || {
            slave1.state() == BindingState::Established && slave2.state() == BindingState::Established
        });

        wait_for("the slave's publish to reach the fabric", || {
            slave1.publish(b"on".to_vec()).unwrap()
        });

        // The master hears the slave directly; the other slave hears the
        // master's echo.
        wait_for("delivery at the master", || !master_received.lock().unwrap().is_empty());
        assert_eq!(
            (ErrorCode::Ok, b"on".to_vec()),
            master_received.lock().unwrap()[0].clone()
        );

        wait_for("echo at the other slave", || {
            !slave2_received.lock().unwrap().is_empty()
        });
        assert_eq!(
            (ErrorCode::Ok, b"on".to_vec()),
            slave2_received.lock().unwrap()[0].clone()
        );
    }

    /// Service/client RPC through the node.
    #[test]
    fn test_service_client_through_node() {
        let fabric = Fabric::new();

        let service_leaf = fabric.leaf();
        let service = Arc::new(ServiceTerminal::new(&service_leaf, 3, "lookup").unwrap());

        let inner = service.clone();
        service
            .async_receive_scattered(64, move |code, operation, payload| {
                assert_eq!(ErrorCode::Ok, code);
                let mut reply = payload;
                reply.reverse();
                inner.respond_to_request(operation, reply).unwrap();
            })
            .unwrap();
        let _conn_s = fabric.connect(&service_leaf);

        let client_leaf = fabric.leaf();
        let client = ClientTerminal::new(&client_leaf, 3, "lookup").unwrap();
        let _conn_c = fabric.connect(&client_leaf);

        let replies = Arc::new(Mutex::new(Vec::new()));

        wait_for("request to become possible", || {
            let sink = replies.clone();
            client
                .async_request(b"abc".to_vec(), 64, move |code, _op, flags, payload| {
                    sink.lock().unwrap().push((code, flags, payload.to_vec()));
                    true
                })
                .is_ok()
        });

        wait_for("the reply", || {
            replies
                .lock()
                .unwrap()
                .iter()
                .any(|(_, flags, _)| flags.contains(GatherFlags::FINISHED))
        });

        let replies = replies.lock().unwrap();
        let reply = replies.last().unwrap();
        assert_eq!(ErrorCode::Ok, reply.0);
        assert_eq!(b"cba".to_vec(), reply.2);
    }

    /// The node reports known terminals and their changes; hidden halves
    /// (consumers, clients, slaves) stay invisible.
    #[test]
    fn test_known_terminals_through_fabric() {
        let fabric = Fabric::new();

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        fabric
            .node
            .async_await_known_terminals_change(move |code, change| {
                sink.lock().unwrap().push((code, change));
            })
            .unwrap();

        let leaf = fabric.leaf();
        let _producer = ProducerTerminal::new(&leaf, 1, "p").unwrap();
        let _consumer = ConsumerTerminal::new(&leaf, 1, "p").unwrap();
        let _conn = fabric.connect(&leaf);

        wait_for("the change notification", || !changes.lock().unwrap().is_empty());

        let changes = changes.lock().unwrap();
        assert_eq!(1, changes.len());
        let (code, change) = &changes[0];
        assert_eq!(ErrorCode::Ok, *code);
        let change = change.as_ref().unwrap();
        assert_eq!(Pattern::ProducerConsumer, change.pattern);
        assert_eq!(Identifier::new(1, "p", false), change.identifier);
        assert!(change.added);

        let known = fabric.node.get_known_terminals();
        assert_eq!(1, known.of(Pattern::ProducerConsumer).len());
    }
}
