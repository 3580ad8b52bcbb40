//! User-facing terminal handles.
//!
//! Fourteen terminal types cover the nine wire patterns; the role-typed
//! variants (producer/consumer, master/slave, service/client) restrict which
//! operations exist at the API boundary and wire up their automatic binding
//! to the opposite role. Hidden identities mark the secondary halves so they
//! stay out of known-terminal listings while still taking part in routing.

use crate::core::bindings::{Binding, BindingState};
use crate::core::leaf::Leaf;
use crate::core::pattern::Pattern;
use crate::errors::{ErrorCode, Result};
use crate::identity::{Id, Identifier};
use crate::msg::GatherFlags;

use std::sync::Arc;

/// Common core of every terminal handle: the owning leaf, the pattern and
/// the leaf-local id. Dropping it retires the terminal (the id is recycled
/// once the peer acknowledges the removal).
struct RawTerminal {
    leaf: Arc<Leaf>,
    pattern: Pattern,
    ident: Identifier,
    id: Id,
}

impl RawTerminal {
    fn create(leaf: &Arc<Leaf>, pattern: Pattern, ident: Identifier) -> Result<RawTerminal> {
        let id = leaf.create_terminal(pattern, ident.clone())?;
        Ok(RawTerminal {
            leaf: leaf.clone(),
            pattern,
            ident,
            id,
        })
    }

    fn make_binding(&self, targets: &str, hidden_targets: bool) -> Result<Binding> {
        let (group, member, core) = self
            .leaf
            .create_binding(self.pattern, self.id, targets, hidden_targets)?;
        Ok(Binding::new(self.leaf.clone(), self.pattern, group, member, core))
    }

    fn publish(&self, payload: Vec<u8>) -> Result<bool> {
        self.leaf.publish(self.pattern, self.id, payload)
    }

    fn async_receive<F>(&self, capacity: usize, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Vec<u8>, bool) + Send + 'static,
    {
        self.leaf
            .async_receive(self.pattern, self.id, capacity, Box::new(handler))
    }

    fn cancel_receive(&self) {
        self.leaf.cancel_receive(self.pattern, self.id);
    }

    fn get_cache(&self) -> Result<Vec<u8>> {
        self.leaf.get_cache(self.pattern, self.id)
    }

    fn async_scatter_gather<F>(&self, payload: Vec<u8>, capacity: usize, handler: F) -> Result<Id>
    where
        F: FnMut(ErrorCode, Id, GatherFlags, &[u8]) -> bool + Send + 'static,
    {
        self.leaf
            .async_scatter_gather(self.pattern, self.id, payload, capacity, Box::new(handler))
    }

    fn cancel_scatter_gather(&self, operation: Id) -> Result<()> {
        self.leaf.cancel_scatter_gather(self.pattern, self.id, operation)
    }

    fn async_receive_scattered<F>(&self, capacity: usize, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Id, Vec<u8>) + Send + 'static,
    {
        self.leaf
            .async_receive_scattered(self.pattern, self.id, capacity, Box::new(handler))
    }

    fn cancel_receive_scattered(&self) {
        self.leaf.cancel_receive_scattered(self.pattern, self.id);
    }

    fn respond_to_scattered(&self, operation: Id, payload: Vec<u8>) -> Result<()> {
        self.leaf
            .respond_to_scattered(self.pattern, self.id, operation, GatherFlags::NONE, payload)
    }

    fn ignore_scattered(&self, operation: Id) -> Result<()> {
        self.leaf
            .respond_to_scattered(self.pattern, self.id, operation, GatherFlags::IGNORED, Vec::new())
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        self.leaf.destroy_terminal(self.pattern, self.id);
    }
}

macro_rules! terminal_accessors {
    () => {
        pub fn id(&self) -> Id {
            self.raw.id
        }

        pub fn identifier(&self) -> &Identifier {
            &self.raw.ident
        }
    };
}

macro_rules! binding_accessors {
    () => {
        /// The automatic binding to this terminal's counterpart role.
        pub fn binding(&self) -> &Binding {
            &self.binding
        }

        pub fn state(&self) -> BindingState {
            self.binding.state()
        }
    };
}

/// Existence detection only: no data is exchanged, but bindings report
/// whether a matching terminal is reachable anywhere in the graph.
pub struct DeafMuteTerminal {
    raw: RawTerminal,
}

impl DeafMuteTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<DeafMuteTerminal> {
        Ok(DeafMuteTerminal {
            raw: RawTerminal::create(leaf, Pattern::DeafMute, Identifier::new(signature, name, false))?,
        })
    }

    pub fn make_binding(&self, targets: &str) -> Result<Binding> {
        self.raw.make_binding(targets, false)
    }

    terminal_accessors!();
}

/// The plain publish-subscribe building block: publish to whoever is bound,
/// receive what the terminals we bind to publish.
pub struct PublishSubscribeTerminal {
    raw: RawTerminal,
}

impl PublishSubscribeTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<PublishSubscribeTerminal> {
        Ok(PublishSubscribeTerminal {
            raw: RawTerminal::create(
                leaf,
                Pattern::PublishSubscribe,
                Identifier::new(signature, name, false),
            )?,
        })
    }

    /// Returns whether the message actually went out (i.e. the terminal has
    /// any upstream reachability).
    pub fn publish(&self, payload: Vec<u8>) -> Result<bool> {
        self.raw.publish(payload)
    }

    /// Arms the single receive operation. The handler gets the payload and
    /// `BufferTooSmall` if it exceeds `capacity`.
    pub fn async_receive<F>(&self, capacity: usize, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Vec<u8>) + Send + 'static,
    {
        self.raw
            .async_receive(capacity, move |code, payload, _cached| handler(code, payload))
    }

    pub fn cancel_receive(&self) {
        self.raw.cancel_receive();
    }

    pub fn make_binding(&self, targets: &str) -> Result<Binding> {
        self.raw.make_binding(targets, false)
    }

    terminal_accessors!();
}

/// Request/response fan-out: scatter a payload to every bound terminal and
/// gather their flag-bearing responses.
pub struct ScatterGatherTerminal {
    raw: RawTerminal,
}

impl ScatterGatherTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<ScatterGatherTerminal> {
        Ok(ScatterGatherTerminal {
            raw: RawTerminal::create(
                leaf,
                Pattern::ScatterGather,
                Identifier::new(signature, name, false),
            )?,
        })
    }

    /// Starts an operation; the handler is invoked per response and returns
    /// whether it wants further deliveries. Exactly one delivery carries the
    /// FINISHED flag. Fails with `NotBound` when nothing is reachable.
    pub fn async_scatter_gather<F>(&self, payload: Vec<u8>, gather_capacity: usize, handler: F) -> Result<Id>
    where
        F: FnMut(ErrorCode, Id, GatherFlags, &[u8]) -> bool + Send + 'static,
    {
        self.raw.async_scatter_gather(payload, gather_capacity, handler)
    }

    pub fn cancel_scatter_gather(&self, operation: Id) -> Result<()> {
        self.raw.cancel_scatter_gather(operation)
    }

    pub fn async_receive_scattered<F>(&self, capacity: usize, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Id, Vec<u8>) + Send + 'static,
    {
        self.raw.async_receive_scattered(capacity, handler)
    }

    pub fn cancel_receive_scattered(&self) {
        self.raw.cancel_receive_scattered();
    }

    /// Answers a scattered message with a payload.
    pub fn respond_to_scattered(&self, operation: Id, payload: Vec<u8>) -> Result<()> {
        self.raw.respond_to_scattered(operation, payload)
    }

    /// Declines a scattered message; the requester sees the IGNORED flag.
    pub fn ignore_scattered(&self, operation: Id) -> Result<()> {
        self.raw.ignore_scattered(operation)
    }

    pub fn make_binding(&self, targets: &str) -> Result<Binding> {
        self.raw.make_binding(targets, false)
    }

    terminal_accessors!();
}

/// Publish-subscribe with a one-deep cache: late subscribers immediately
/// receive the last published payload.
pub struct CachedPublishSubscribeTerminal {
    raw: RawTerminal,
}

impl CachedPublishSubscribeTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<CachedPublishSubscribeTerminal> {
        Ok(CachedPublishSubscribeTerminal {
            raw: RawTerminal::create(
                leaf,
                Pattern::CachedPublishSubscribe,
                Identifier::new(signature, name, false),
            )?,
        })
    }

    pub fn publish(&self, payload: Vec<u8>) -> Result<bool> {
        self.raw.publish(payload)
    }

    /// The handler's last argument reports whether the payload came out of
    /// a cache rather than a live publish.
    pub fn async_receive<F>(&self, capacity: usize, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Vec<u8>, bool) + Send + 'static,
    {
        self.raw.async_receive(capacity, handler)
    }

    pub fn cancel_receive(&self) {
        self.raw.cancel_receive();
    }

    /// Last received payload; `Uninitialized` before anything arrived.
    pub fn get_cache(&self) -> Result<Vec<u8>> {
        self.raw.get_cache()
    }

    pub fn make_binding(&self, targets: &str) -> Result<Binding> {
        self.raw.make_binding(targets, false)
    }

    terminal_accessors!();
}

/// Producing half of a producer/consumer pair; may only publish.
pub struct ProducerTerminal {
    raw: RawTerminal,
}

impl ProducerTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<ProducerTerminal> {
        Ok(ProducerTerminal {
            raw: RawTerminal::create(
                leaf,
                Pattern::ProducerConsumer,
                Identifier::new(signature, name, false),
            )?,
        })
    }

    pub fn publish(&self, payload: Vec<u8>) -> Result<bool> {
        self.raw.publish(payload)
    }

    terminal_accessors!();
}

/// Consuming half of a producer/consumer pair; hidden, automatically bound
/// to the producer of the same name, and receive-only.
pub struct ConsumerTerminal {
    binding: Binding,
    raw: RawTerminal,
}

impl ConsumerTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<ConsumerTerminal> {
        let raw = RawTerminal::create(
            leaf,
            Pattern::ProducerConsumer,
            Identifier::new(signature, name, true),
        )?;
        let binding = raw.make_binding(name, false)?;
        Ok(ConsumerTerminal { binding, raw })
    }

    pub fn async_receive<F>(&self, capacity: usize, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Vec<u8>) + Send + 'static,
    {
        self.raw
            .async_receive(capacity, move |code, payload, _cached| handler(code, payload))
    }

    pub fn cancel_receive(&self) {
        self.raw.cancel_receive();
    }

    terminal_accessors!();
    binding_accessors!();
}

/// Producer with the one-deep cache of the cached patterns.
pub struct CachedProducerTerminal {
    raw: RawTerminal,
}

impl CachedProducerTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<CachedProducerTerminal> {
        Ok(CachedProducerTerminal {
            raw: RawTerminal::create(
                leaf,
                Pattern::CachedProducerConsumer,
                Identifier::new(signature, name, false),
            )?,
        })
    }

    pub fn publish(&self, payload: Vec<u8>) -> Result<bool> {
        self.raw.publish(payload)
    }

    terminal_accessors!();
}

/// Consumer with the one-deep cache of the cached patterns.
pub struct CachedConsumerTerminal {
    binding: Binding,
    raw: RawTerminal,
}

impl CachedConsumerTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<CachedConsumerTerminal> {
        let raw = RawTerminal::create(
            leaf,
            Pattern::CachedProducerConsumer,
            Identifier::new(signature, name, true),
        )?;
        let binding = raw.make_binding(name, false)?;
        Ok(CachedConsumerTerminal { binding, raw })
    }

    pub fn async_receive<F>(&self, capacity: usize, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Vec<u8>, bool) + Send + 'static,
    {
        self.raw.async_receive(capacity, handler)
    }

    pub fn cancel_receive(&self) {
        self.raw.cancel_receive();
    }

    pub fn get_cache(&self) -> Result<Vec<u8>> {
        self.raw.get_cache()
    }

    terminal_accessors!();
    binding_accessors!();
}

/// Owner side of a master/slave pair. Data received from slaves is
/// re-broadcast by the leaf so every other slave sees it.
pub struct MasterTerminal {
    binding: Binding,
    raw: RawTerminal,
}

impl MasterTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<MasterTerminal> {
        let raw = RawTerminal::create(
            leaf,
            Pattern::MasterSlave,
            Identifier::new(signature, name, false),
        )?;
        let binding = raw.make_binding(name, true)?;
        Ok(MasterTerminal { binding, raw })
    }

    pub fn publish(&self, payload: Vec<u8>) -> Result<bool> {
        self.raw.publish(payload)
    }

    pub fn async_receive<F>(&self, capacity: usize, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Vec<u8>) + Send + 'static,
    {
        self.raw
            .async_receive(capacity, move |code, payload, _cached| handler(code, payload))
    }

    pub fn cancel_receive(&self) {
        self.raw.cancel_receive();
    }

    terminal_accessors!();
    binding_accessors!();
}

/// User side of a master/slave pair; hidden, bound to the master. Slave
/// publishes reach the masters only, never the other slaves directly.
pub struct SlaveTerminal {
    binding: Binding,
    raw: RawTerminal,
}

impl SlaveTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<SlaveTerminal> {
        let raw = RawTerminal::create(
            leaf,
            Pattern::MasterSlave,
            Identifier::new(signature, name, true),
        )?;
        let binding = raw.make_binding(name, false)?;
        Ok(SlaveTerminal { binding, raw })
    }

    pub fn publish(&self, payload: Vec<u8>) -> Result<bool> {
        self.raw.publish(payload)
    }

    pub fn async_receive<F>(&self, capacity: usize, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Vec<u8>) + Send + 'static,
    {
        self.raw
            .async_receive(capacity, move |code, payload, _cached| handler(code, payload))
    }

    pub fn cancel_receive(&self) {
        self.raw.cancel_receive();
    }

    terminal_accessors!();
    binding_accessors!();
}

/// Master with the one-deep cache of the cached patterns.
pub struct CachedMasterTerminal {
    binding: Binding,
    raw: RawTerminal,
}

impl CachedMasterTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<CachedMasterTerminal> {
        let raw = RawTerminal::create(
            leaf,
            Pattern::CachedMasterSlave,
            Identifier::new(signature, name, false),
        )?;
        let binding = raw.make_binding(name, true)?;
        Ok(CachedMasterTerminal { binding, raw })
    }

    pub fn publish(&self, payload: Vec<u8>) -> Result<bool> {
        self.raw.publish(payload)
    }

    pub fn async_receive<F>(&self, capacity: usize, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Vec<u8>, bool) + Send + 'static,
    {
        self.raw.async_receive(capacity, handler)
    }

    pub fn cancel_receive(&self) {
        self.raw.cancel_receive();
    }

    pub fn get_cache(&self) -> Result<Vec<u8>> {
        self.raw.get_cache()
    }

    terminal_accessors!();
    binding_accessors!();
}

/// Slave with the one-deep cache of the cached patterns.
pub struct CachedSlaveTerminal {
    binding: Binding,
    raw: RawTerminal,
}

impl CachedSlaveTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<CachedSlaveTerminal> {
        let raw = RawTerminal::create(
            leaf,
            Pattern::CachedMasterSlave,
            Identifier::new(signature, name, true),
        )?;
        let binding = raw.make_binding(name, false)?;
        Ok(CachedSlaveTerminal { binding, raw })
    }

    pub fn publish(&self, payload: Vec<u8>) -> Result<bool> {
        self.raw.publish(payload)
    }

    pub fn async_receive<F>(&self, capacity: usize, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Vec<u8>, bool) + Send + 'static,
    {
        self.raw.async_receive(capacity, handler)
    }

    pub fn cancel_receive(&self) {
        self.raw.cancel_receive();
    }

    pub fn get_cache(&self) -> Result<Vec<u8>> {
        self.raw.get_cache()
    }

    terminal_accessors!();
    binding_accessors!();
}

/// Responding half of an RPC pair; bound to the hidden client terminals and
/// only able to receive and answer requests.
pub struct ServiceTerminal {
    binding: Binding,
    raw: RawTerminal,
}

impl ServiceTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<ServiceTerminal> {
        let raw = RawTerminal::create(
            leaf,
            Pattern::ServiceClient,
            Identifier::new(signature, name, false),
        )?;
        let binding = raw.make_binding(name, true)?;
        Ok(ServiceTerminal { binding, raw })
    }

    pub fn async_receive_scattered<F>(&self, capacity: usize, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Id, Vec<u8>) + Send + 'static,
    {
        self.raw.async_receive_scattered(capacity, handler)
    }

    pub fn cancel_receive_scattered(&self) {
        self.raw.cancel_receive_scattered();
    }

    pub fn respond_to_request(&self, operation: Id, payload: Vec<u8>) -> Result<()> {
        self.raw.respond_to_scattered(operation, payload)
    }

    pub fn ignore_request(&self, operation: Id) -> Result<()> {
        self.raw.ignore_scattered(operation)
    }

    terminal_accessors!();
    binding_accessors!();
}

/// Requesting half of an RPC pair; hidden and only able to initiate.
pub struct ClientTerminal {
    raw: RawTerminal,
}

impl ClientTerminal {
    pub fn new(leaf: &Arc<Leaf>, signature: u32, name: &str) -> Result<ClientTerminal> {
        Ok(ClientTerminal {
            raw: RawTerminal::create(
                leaf,
                Pattern::ServiceClient,
                Identifier::new(signature, name, true),
            )?,
        })
    }

    pub fn async_request<F>(&self, payload: Vec<u8>, gather_capacity: usize, handler: F) -> Result<Id>
    where
        F: FnMut(ErrorCode, Id, GatherFlags, &[u8]) -> bool + Send + 'static,
    {
        self.raw.async_scatter_gather(payload, gather_capacity, handler)
    }

    pub fn cancel_request(&self, operation: Id) -> Result<()> {
        self.raw.cancel_scatter_gather(operation)
    }

    terminal_accessors!();
}
