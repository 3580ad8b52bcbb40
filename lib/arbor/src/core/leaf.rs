use crate::connections::{Communicator, ConnectionRef, WeakConnectionRef};
use crate::core::arena::Arena;
use crate::core::bindings::{BindingCore, BindingState};
use crate::core::pattern::{Pattern, PATTERN_COUNT};
use crate::errors::{ErrorCode, Result};
use crate::identity::{Id, Identifier};
use crate::logging::{self, Logger};
use crate::msg::{Body, GatherFlags, Message};
use crate::scheduling::Scheduler;

use hashbrown::HashMap;
use indexmap::IndexSet;

use std::sync::{Arc, Mutex};

pub(crate) type ReceiveHandler = Box<dyn FnOnce(ErrorCode, Vec<u8>, bool) + Send>;
pub(crate) type ScatteredHandler = Box<dyn FnOnce(ErrorCode, Id, Vec<u8>) + Send>;
pub(crate) type GatherHandler = Box<dyn FnMut(ErrorCode, Id, GatherFlags, &[u8]) -> bool + Send>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Mapping {
    /// No peer state for this entity yet (or the link is down).
    Unmapped,
    /// The peer's id for this entity; used to address it in outbound
    /// messages.
    Mapped(Id),
    /// The peer saw the description but had nothing to map it to. No
    /// removal announcement is owed on destruction.
    Noticed,
}

impl Mapping {
    fn peer_id(self) -> Option<Id> {
        match self {
            Mapping::Mapped(id) => Some(id),
            _ => None,
        }
    }
}

struct ReceiveOp {
    capacity: usize,
    handler: ReceiveHandler,
}

struct ScatteredOp {
    capacity: usize,
    handler: ScatteredHandler,
}

struct TerminalRecord {
    ident: Identifier,
    mapping: Mapping,
    described: bool,
    subscribed: bool,
    pub_cache: Option<Vec<u8>>,
    rcv_cache: Option<Vec<u8>>,
    receive_op: Option<ReceiveOp>,
    scattered_op: Option<ScatteredOp>,
    dying: bool,
}

impl TerminalRecord {
    fn new(ident: Identifier) -> TerminalRecord {
        TerminalRecord {
            ident,
            mapping: Mapping::Unmapped,
            described: false,
            subscribed: false,
            pub_cache: None,
            rcv_cache: None,
            receive_op: None,
            scattered_op: None,
            dying: false,
        }
    }
}

struct Member {
    member: u64,
    terminal: Id,
    core: Arc<BindingCore>,
}

struct GroupRecord {
    ident: Identifier,
    members: Vec<Member>,
    mapping: Mapping,
    described: bool,
    established: bool,
    dying: bool,
}

impl GroupRecord {
    fn new(ident: Identifier) -> GroupRecord {
        GroupRecord {
            ident,
            members: Vec::new(),
            mapping: Mapping::Unmapped,
            described: false,
            established: false,
            dying: false,
        }
    }
}

/// An outbound scatter-gather operation initiated by a local terminal.
struct ScatterOp {
    terminal: Id,
    capacity: usize,
    handler: Arc<Mutex<GatherHandler>>,
    stopped: bool,
}

/// An inbound scatter being answered by local terminals; tracked until every
/// terminal that received it has responded.
struct GatherOp {
    group: Id,
    pending: IndexSet<u32>,
}

struct LeafRegistry {
    pattern: Pattern,
    terminals: Arena<TerminalRecord>,
    ident_index: HashMap<Identifier, Id>,
    groups: Arena<GroupRecord>,
    group_index: HashMap<Identifier, Id>,
    next_op: u32,
    scatter_ops: HashMap<u32, ScatterOp>,
    gather_ops: HashMap<u32, GatherOp>,
}

impl LeafRegistry {
    fn new(pattern: Pattern) -> LeafRegistry {
        LeafRegistry {
            pattern,
            terminals: Arena::new(),
            ident_index: HashMap::new(),
            groups: Arena::new(),
            group_index: HashMap::new(),
            next_op: 1,
            scatter_ops: HashMap::new(),
            gather_ops: HashMap::new(),
        }
    }
}

struct LeafState {
    connection: Option<WeakConnectionRef>,
    remote_is_node: bool,
    started: bool,
    next_member: u64,
    registries: Vec<LeafRegistry>,
}

impl LeafState {
    fn registry(&mut self, pattern: Pattern) -> &mut LeafRegistry {
        &mut self.registries[pattern.index()]
    }

    fn reachable(&self, record: &TerminalRecord) -> bool {
        match record.mapping {
            Mapping::Mapped(_) => {
                if self.remote_is_node {
                    record.subscribed
                } else {
                    true
                }
            }
            _ => false,
        }
    }
}

/// Work computed under the leaf lock and executed after it is released, so
/// user handlers and blocking sends never run with the lock held.
enum Action {
    Send(Message),
    BindingState(Arc<BindingCore>, BindingState),
    Receive {
        handler: ReceiveHandler,
        code: ErrorCode,
        payload: Vec<u8>,
        cached: bool,
    },
    Scattered {
        handler: ScatteredHandler,
        code: ErrorCode,
        operation: Id,
        payload: Vec<u8>,
    },
    Gather {
        handler: Arc<Mutex<GatherHandler>>,
        pattern: Pattern,
        code: ErrorCode,
        operation: Id,
        flags: GatherFlags,
        payload: Vec<u8>,
    },
}

/// Endpoint communicator: hosts terminals and bindings, owns at most one
/// upstream connection and multiplexes the nine pattern logics over one
/// message handler table.
pub struct Leaf {
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<LeafState>,
    log: Logger,
}

impl Leaf {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Arc<Leaf> {
        Leaf::with_logger(scheduler, logging::discard())
    }

    pub fn with_logger(scheduler: Arc<dyn Scheduler>, log: Logger) -> Arc<Leaf> {
        debug_assert_eq!(PATTERN_COUNT, Pattern::ALL.len());

        Arc::new(Leaf {
            scheduler,
            state: Mutex::new(LeafState {
                connection: None,
                remote_is_node: false,
                started: false,
                next_member: 1,
                registries: Pattern::ALL.iter().map(|&p| LeafRegistry::new(p)).collect(),
            }),
            log,
        })
    }

    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    /// Runs `f` under the leaf lock, then executes the produced actions with
    /// the lock released.
    fn with_state<R>(&self, f: impl FnOnce(&mut LeafState, &mut Vec<Action>) -> R) -> R {
        let mut actions = Vec::new();
        let (result, conn) = {
            let mut state = self.state.lock().unwrap();
            let result = f(&mut state, &mut actions);
            let conn = state.connection.as_ref().and_then(|weak| weak.upgrade());
            (result, conn)
        };

        self.run_actions(conn, actions);
        result
    }

    fn run_actions(&self, conn: Option<ConnectionRef>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(msg) => {
                    if let Some(conn) = conn.as_ref() {
                        conn.send(&msg);
                    }
                }
                Action::BindingState(core, state) => core.publish_state(state),
                Action::Receive {
                    handler,
                    code,
                    payload,
                    cached,
                } => handler(code, payload, cached),
                Action::Scattered {
                    handler,
                    code,
                    operation,
                    payload,
                } => handler(code, operation, payload),
                Action::Gather {
                    handler,
                    pattern,
                    code,
                    operation,
                    flags,
                    payload,
                } => {
                    let keep_going = (handler.lock().unwrap())(code, operation, flags, &payload);
                    if !keep_going {
                        self.stop_scatter_deliveries(pattern, operation);
                    }
                }
            }
        }
    }

    /// Called when a gather handler asked for no further deliveries; the
    /// operation is swallowed silently until its terminating response.
    fn stop_scatter_deliveries(&self, pattern: Pattern, operation: Id) {
        let mut state = self.state.lock().unwrap();
        if let Some(op) = state.registry(pattern).scatter_ops.get_mut(&operation.number()) {
            op.stopped = true;
        }
    }
}

// Terminal and binding registration, driven by the user-facing handles.
impl Leaf {
    pub(crate) fn create_terminal(&self, pattern: Pattern, ident: Identifier) -> Result<Id> {
        self.with_state(|state, actions| {
            let started = state.started;
            let reg = state.registry(pattern);

            if reg.ident_index.contains_key(&ident) {
                return Err(ErrorCode::AmbiguousIdentifier);
            }

            let mut record = TerminalRecord::new(ident.clone());
            record.described = started;
            let id = reg.terminals.insert(record);
            reg.ident_index.insert(ident.clone(), id);

            if started {
                actions.push(Action::Send(Message::new(
                    pattern,
                    Body::TerminalDescription {
                        identifier: ident,
                        my_id: id,
                    },
                )));
            }

            Ok(id)
        })
    }

    pub(crate) fn destroy_terminal(&self, pattern: Pattern, id: Id) {
        self.with_state(|state, actions| {
            let started = state.started;
            let reg = state.registry(pattern);

            // Terminate scatter operations initiated from this terminal.
            let dead_ops: Vec<u32> = reg
                .scatter_ops
                .iter()
                .filter(|(_, op)| op.terminal == id)
                .map(|(&num, _)| num)
                .collect();
            for num in dead_ops {
                let op = reg.scatter_ops.remove(&num).unwrap();
                actions.push(Action::Gather {
                    handler: op.handler,
                    pattern,
                    code: ErrorCode::Canceled,
                    operation: Id::new(num),
                    flags: GatherFlags::FINISHED,
                    payload: Vec::new(),
                });
            }

            // This terminal no longer answers inbound scatters.
            let mut finished = Vec::new();
            for (&num, gop) in reg.gather_ops.iter_mut() {
                if gop.pending.remove(&id.number()) && gop.pending.is_empty() {
                    finished.push(num);
                }
            }
            for num in finished {
                reg.gather_ops.remove(&num);
                actions.push(Action::Send(Message::new(
                    pattern,
                    Body::Gather {
                        operation: Id::new(num),
                        flags: GatherFlags::BINDING_DESTROYED | GatherFlags::FINISHED,
                        payload: Vec::new(),
                    },
                )));
            }

            let record = match reg.terminals.get_mut(id) {
                Some(record) => record,
                None => return,
            };

            reg.ident_index.remove(&record.ident);

            if let Some(op) = record.receive_op.take() {
                actions.push(Action::Receive {
                    handler: op.handler,
                    code: ErrorCode::Canceled,
                    payload: Vec::new(),
                    cached: false,
                });
            }
            if let Some(op) = record.scattered_op.take() {
                actions.push(Action::Scattered {
                    handler: op.handler,
                    code: ErrorCode::Canceled,
                    operation: Id::NONE,
                    payload: Vec::new(),
                });
            }

            match record.mapping {
                Mapping::Mapped(peer_id) if started => {
                    record.dying = true;
                    actions.push(Action::Send(Message::new(
                        pattern,
                        Body::TerminalRemoved { id: peer_id },
                    )));
                }
                Mapping::Unmapped if started && record.described => {
                    // Described but not mapped yet: wait for the peer's
                    // reply so the removal can be announced with its id.
                    record.dying = true;
                }
                _ => {
                    reg.terminals.remove(id);
                }
            }
        })
    }

    pub(crate) fn create_binding(
        &self,
        pattern: Pattern,
        terminal: Id,
        targets: &str,
        hidden_targets: bool,
    ) -> Result<(Id, u64, Arc<BindingCore>)> {
        self.with_state(|state, actions| {
            let started = state.started;
            let member = state.next_member;
            state.next_member += 1;

            let reg = state.registry(pattern);

            let signature = match reg.terminals.get(terminal) {
                Some(record) => record.ident.signature(),
                None => return Err(ErrorCode::InvalidId),
            };

            let ident = Identifier::new(signature, targets, hidden_targets);
            let group = match reg.group_index.get(&ident) {
                Some(&group) => group,
                None => {
                    let mut record = GroupRecord::new(ident.clone());
                    record.described = started;
                    let group = reg.groups.insert(record);
                    reg.group_index.insert(ident.clone(), group);

                    if started {
                        actions.push(Action::Send(Message::new(
                            pattern,
                            Body::BindingDescription {
                                identifier: ident,
                                my_id: group,
                            },
                        )));
                    }

                    group
                }
            };

            let core = BindingCore::new();
            let record = reg.groups.get_mut(group).expect("Group was just resolved");
            record.members.push(Member {
                member,
                terminal,
                core: core.clone(),
            });

            if record.established {
                actions.push(Action::BindingState(core.clone(), BindingState::Established));
            }

            Ok((group, member, core))
        })
    }

    pub(crate) fn destroy_binding(&self, pattern: Pattern, group: Id, member: u64) {
        self.with_state(|state, actions| {
            let started = state.started;
            let reg = state.registry(pattern);

            let record = match reg.groups.get_mut(group) {
                Some(record) => record,
                None => return,
            };

            let terminal = match record.members.iter().position(|m| m.member == member) {
                Some(index) => record.members.remove(index).terminal,
                None => return,
            };

            // A destroyed binding stops answering inbound scatters.
            let mut finished = Vec::new();
            for (&num, gop) in reg.gather_ops.iter_mut() {
                if gop.group == group && gop.pending.remove(&terminal.number()) && gop.pending.is_empty() {
                    finished.push(num);
                }
            }
            for num in finished {
                reg.gather_ops.remove(&num);
                actions.push(Action::Send(Message::new(
                    pattern,
                    Body::Gather {
                        operation: Id::new(num),
                        flags: GatherFlags::BINDING_DESTROYED | GatherFlags::FINISHED,
                        payload: Vec::new(),
                    },
                )));
            }

            let record = reg.groups.get_mut(group).expect("Group still present");
            if record.members.is_empty() {
                reg.group_index.remove(&record.ident);

                match record.mapping {
                    Mapping::Mapped(peer_id) if started => {
                        record.dying = true;
                        actions.push(Action::Send(Message::new(
                            pattern,
                            Body::BindingRemoved { id: peer_id },
                        )));
                    }
                    Mapping::Unmapped if started && record.described => {
                        record.dying = true;
                    }
                    _ => {
                        reg.groups.remove(group);
                    }
                }
            }
        })
    }
}

// Data-plane operations, driven by the user-facing handles.
impl Leaf {
    /// Publishes a payload. Returns whether the terminal currently has any
    /// upstream reachability: a leaf peer with a matching binding, or a node
    /// peer with at least one subscriber.
    pub(crate) fn publish(&self, pattern: Pattern, terminal: Id, payload: Vec<u8>) -> Result<bool> {
        self.with_state(|state, actions| {
            let reachable = {
                let record = state.registries[pattern.index()]
                    .terminals
                    .get(terminal)
                    .ok_or(ErrorCode::InvalidId)?;
                if record.dying {
                    return Err(ErrorCode::InvalidId);
                }
                state.reachable(record)
            };

            let record = state
                .registry(pattern)
                .terminals
                .get_mut(terminal)
                .expect("Checked above");

            // The cache always remembers the last publish so late
            // subscribers can be served even when nothing was reachable at
            // publish time.
            if pattern.cached() {
                record.pub_cache = Some(payload.clone());
            }

            if !reachable {
                return Ok(false);
            }

            let peer_id = record.mapping.peer_id().expect("Reachable implies mapped");

            actions.push(Action::Send(Message::new(
                pattern,
                Body::Data {
                    id: peer_id,
                    payload,
                },
            )));

            Ok(true)
        })
    }

    /// Last payload this terminal received. `Uninitialized` until the first
    /// data message lands.
    pub(crate) fn get_cache(&self, pattern: Pattern, terminal: Id) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let record = state.registries[pattern.index()]
            .terminals
            .get(terminal)
            .ok_or(ErrorCode::InvalidId)?;

        record.rcv_cache.clone().ok_or(ErrorCode::Uninitialized)
    }

    pub(crate) fn async_receive(
        &self,
        pattern: Pattern,
        terminal: Id,
        capacity: usize,
        handler: ReceiveHandler,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .registry(pattern)
            .terminals
            .get_mut(terminal)
            .ok_or(ErrorCode::InvalidId)?;

        if record.receive_op.is_some() {
            return Err(ErrorCode::AsyncOperationRunning);
        }

        record.receive_op = Some(ReceiveOp { capacity, handler });
        Ok(())
    }

    pub(crate) fn cancel_receive(&self, pattern: Pattern, terminal: Id) {
        self.with_state(|state, actions| {
            if let Some(record) = state.registry(pattern).terminals.get_mut(terminal) {
                if let Some(op) = record.receive_op.take() {
                    actions.push(Action::Receive {
                        handler: op.handler,
                        code: ErrorCode::Canceled,
                        payload: Vec::new(),
                        cached: false,
                    });
                }
            }
        })
    }

    pub(crate) fn async_receive_scattered(
        &self,
        pattern: Pattern,
        terminal: Id,
        capacity: usize,
        handler: ScatteredHandler,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .registry(pattern)
            .terminals
            .get_mut(terminal)
            .ok_or(ErrorCode::InvalidId)?;

        if record.scattered_op.is_some() {
            return Err(ErrorCode::AsyncOperationRunning);
        }

        record.scattered_op = Some(ScatteredOp { capacity, handler });
        Ok(())
    }

    pub(crate) fn cancel_receive_scattered(&self, pattern: Pattern, terminal: Id) {
        self.with_state(|state, actions| {
            if let Some(record) = state.registry(pattern).terminals.get_mut(terminal) {
                if let Some(op) = record.scattered_op.take() {
                    actions.push(Action::Scattered {
                        handler: op.handler,
                        code: ErrorCode::Canceled,
                        operation: Id::NONE,
                        payload: Vec::new(),
                    });
                }
            }
        })
    }

    /// Fans a request out to the terminal's current upstream mapping and
    /// installs the response tracker. Fails synchronously with `NotBound`
    /// when the terminal has no reachability.
    pub(crate) fn async_scatter_gather(
        &self,
        pattern: Pattern,
        terminal: Id,
        payload: Vec<u8>,
        capacity: usize,
        handler: GatherHandler,
    ) -> Result<Id> {
        self.with_state(|state, actions| {
            let reachable = {
                let record = state.registries[pattern.index()]
                    .terminals
                    .get(terminal)
                    .ok_or(ErrorCode::InvalidId)?;
                state.reachable(record)
            };

            if !reachable {
                return Err(ErrorCode::NotBound);
            }

            let reg = state.registry(pattern);
            let record = reg.terminals.get(terminal).expect("Checked above");
            let target = record.mapping.peer_id().expect("Reachable implies mapped");

            let number = reg.next_op;
            reg.next_op += 1;
            let operation = Id::new(number);

            reg.scatter_ops.insert(
                number,
                ScatterOp {
                    terminal,
                    capacity,
                    handler: Arc::new(Mutex::new(handler)),
                    stopped: false,
                },
            );

            actions.push(Action::Send(Message::new(
                pattern,
                Body::Scatter {
                    target,
                    operation,
                    payload,
                },
            )));

            Ok(operation)
        })
    }

    /// Cancels an outstanding operation: the handler sees one terminating
    /// call with `Canceled` and the FINISHED flag, then nothing more.
    pub(crate) fn cancel_scatter_gather(&self, pattern: Pattern, terminal: Id, operation: Id) -> Result<()> {
        self.with_state(|state, actions| {
            let reg = state.registry(pattern);

            match reg.scatter_ops.get(&operation.number()) {
                Some(op) if op.terminal == terminal => {}
                _ => return Err(ErrorCode::InvalidId),
            }

            let op = reg.scatter_ops.remove(&operation.number()).unwrap();
            actions.push(Action::Gather {
                handler: op.handler,
                pattern,
                code: ErrorCode::Canceled,
                operation,
                flags: GatherFlags::FINISHED,
                payload: Vec::new(),
            });

            Ok(())
        })
    }

    /// Responds to a scattered message. The FINISHED flag is attached
    /// automatically when this terminal is the last one the peer is waiting
    /// for.
    pub(crate) fn respond_to_scattered(
        &self,
        pattern: Pattern,
        terminal: Id,
        operation: Id,
        flags: GatherFlags,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.with_state(|state, actions| {
            let reg = state.registry(pattern);

            let finished = {
                let gop = reg
                    .gather_ops
                    .get_mut(&operation.number())
                    .ok_or(ErrorCode::InvalidId)?;

                if !gop.pending.remove(&terminal.number()) {
                    return Err(ErrorCode::InvalidId);
                }

                gop.pending.is_empty()
            };

            let mut flags = flags;
            if finished {
                flags |= GatherFlags::FINISHED;
                reg.gather_ops.remove(&operation.number());
            }

            actions.push(Action::Send(Message::new(
                pattern,
                Body::Gather {
                    operation,
                    flags,
                    payload,
                },
            )));

            Ok(())
        })
    }
}

// The per-pattern protocol state machine for inbound messages.
impl Leaf {
    fn on_terminal_description(
        state: &mut LeafState,
        actions: &mut Vec<Action>,
        pattern: Pattern,
        identifier: Identifier,
        peer_id: Id,
    ) {
        let reg = state.registry(pattern);

        // A peer terminal matches one of our binding groups iff the group's
        // target identifier equals the terminal's identifier.
        match reg.group_index.get(&identifier).copied() {
            Some(group) => {
                let record = reg.groups.get_mut(group).expect("Index is consistent");
                record.mapping = Mapping::Mapped(peer_id);

                actions.push(Action::Send(Message::new(
                    pattern,
                    Body::TerminalMapping {
                        peer_id,
                        my_id: group,
                    },
                )));

                if !record.established {
                    record.established = true;
                    for member in &record.members {
                        actions.push(Action::BindingState(member.core.clone(), BindingState::Established));
                    }
                }
            }
            None => {
                actions.push(Action::Send(Message::new(
                    pattern,
                    Body::TerminalNoticed { peer_id },
                )));
            }
        }
    }

    fn on_terminal_mapping(
        state: &mut LeafState,
        actions: &mut Vec<Action>,
        pattern: Pattern,
        my_id: Id,
        peer_id: Id,
    ) {
        let reg = state.registry(pattern);
        if let Some(record) = reg.terminals.get_mut(my_id) {
            if record.dying {
                // Raced with our own removal; announce it now that we know
                // the peer's id.
                actions.push(Action::Send(Message::new(
                    pattern,
                    Body::TerminalRemoved { id: peer_id },
                )));
            } else {
                record.mapping = Mapping::Mapped(peer_id);
            }
        }
    }

    fn on_terminal_noticed(state: &mut LeafState, pattern: Pattern, my_id: Id) {
        let reg = state.registry(pattern);
        let retire = match reg.terminals.get_mut(my_id) {
            Some(record) => {
                if record.dying {
                    true
                } else {
                    record.mapping = Mapping::Noticed;
                    false
                }
            }
            None => false,
        };

        if retire {
            reg.terminals.remove(my_id);
        }
    }

    /// The peer removed the terminal one of our binding groups was mapped
    /// to: the group releases and in-flight gather work for it is dropped.
    fn on_terminal_removed(state: &mut LeafState, actions: &mut Vec<Action>, pattern: Pattern, group: Id) {
        let reg = state.registry(pattern);

        let peer_id = match reg.groups.get_mut(group) {
            Some(record) => {
                let peer_id = record.mapping.peer_id();
                record.mapping = Mapping::Unmapped;

                if record.established {
                    record.established = false;
                    for member in &record.members {
                        actions.push(Action::BindingState(member.core.clone(), BindingState::Released));
                    }
                }

                peer_id
            }
            None => None,
        };

        reg.gather_ops.retain(|_, gop| gop.group != group);

        if let Some(peer_id) = peer_id {
            actions.push(Action::Send(Message::new(
                pattern,
                Body::TerminalRemovedAck { id: peer_id },
            )));
        }
    }

    fn on_terminal_removed_ack(state: &mut LeafState, pattern: Pattern, my_id: Id) {
        let reg = state.registry(pattern);
        if reg.terminals.get(my_id).map(|r| r.dying) == Some(true) {
            reg.terminals.remove(my_id);
        }
    }

    fn on_binding_description(
        state: &mut LeafState,
        actions: &mut Vec<Action>,
        pattern: Pattern,
        identifier: Identifier,
        peer_id: Id,
    ) {
        let reg = state.registry(pattern);

        match reg.ident_index.get(&identifier).copied() {
            Some(terminal) => {
                let record = reg.terminals.get_mut(terminal).expect("Index is consistent");
                record.mapping = Mapping::Mapped(peer_id);

                actions.push(Action::Send(Message::new(
                    pattern,
                    Body::BindingMapping {
                        peer_id,
                        my_id: terminal,
                    },
                )));

                // A freshly mapped peer binding receives the cached payload
                // before any further data.
                if pattern.cached() {
                    if let Some(cache) = record.pub_cache.clone() {
                        actions.push(Action::Send(Message::new(
                            pattern,
                            Body::CachedData {
                                id: peer_id,
                                payload: cache,
                            },
                        )));
                    }
                }
            }
            None => {
                actions.push(Action::Send(Message::new(
                    pattern,
                    Body::BindingNoticed { peer_id },
                )));
            }
        }
    }

    fn on_binding_mapping(
        state: &mut LeafState,
        actions: &mut Vec<Action>,
        pattern: Pattern,
        my_id: Id,
        peer_id: Id,
    ) {
        let remote_is_node = state.remote_is_node;
        let reg = state.registry(pattern);

        if let Some(record) = reg.groups.get_mut(my_id) {
            if record.dying {
                actions.push(Action::Send(Message::new(
                    pattern,
                    Body::BindingRemoved { id: peer_id },
                )));
                return;
            }

            record.mapping = Mapping::Mapped(peer_id);

            // A leaf peer only maps a binding when it has the matching
            // terminal, so the mapping itself establishes the binding. A
            // node signals establishment separately.
            if !remote_is_node && !record.established {
                record.established = true;
                for member in &record.members {
                    actions.push(Action::BindingState(member.core.clone(), BindingState::Established));
                }
            }
        }
    }

    fn on_binding_noticed(state: &mut LeafState, pattern: Pattern, my_id: Id) {
        let reg = state.registry(pattern);
        let retire = match reg.groups.get_mut(my_id) {
            Some(record) => {
                if record.dying {
                    true
                } else {
                    record.mapping = Mapping::Noticed;
                    false
                }
            }
            None => false,
        };

        if retire {
            reg.groups.remove(my_id);
        }
    }

    /// The peer's binding to one of our terminals is gone: the terminal
    /// unmaps and scatter operations running through that binding terminate.
    fn on_binding_removed(state: &mut LeafState, actions: &mut Vec<Action>, pattern: Pattern, terminal: Id) {
        let reg = state.registry(pattern);

        let peer_id = match reg.terminals.get_mut(terminal) {
            Some(record) => {
                let peer_id = record.mapping.peer_id();
                record.mapping = Mapping::Unmapped;
                record.subscribed = false;
                peer_id
            }
            None => None,
        };

        let dead_ops: Vec<u32> = reg
            .scatter_ops
            .iter()
            .filter(|(_, op)| op.terminal == terminal)
            .map(|(&num, _)| num)
            .collect();
        for num in dead_ops {
            let op = reg.scatter_ops.remove(&num).unwrap();
            actions.push(Action::Gather {
                handler: op.handler,
                pattern,
                code: ErrorCode::Ok,
                operation: Id::new(num),
                flags: GatherFlags::BINDING_DESTROYED | GatherFlags::FINISHED,
                payload: Vec::new(),
            });
        }

        if let Some(peer_id) = peer_id {
            actions.push(Action::Send(Message::new(
                pattern,
                Body::BindingRemovedAck { id: peer_id },
            )));
        }
    }

    fn on_binding_removed_ack(state: &mut LeafState, pattern: Pattern, my_id: Id) {
        let reg = state.registry(pattern);
        if reg.groups.get(my_id).map(|g| g.dying) == Some(true) {
            reg.groups.remove(my_id);
        }
    }

    fn on_binding_established(
        state: &mut LeafState,
        actions: &mut Vec<Action>,
        pattern: Pattern,
        my_id: Id,
        established: bool,
    ) {
        let reg = state.registry(pattern);
        if let Some(record) = reg.groups.get_mut(my_id) {
            if record.established != established {
                record.established = established;
                let binding_state = if established {
                    BindingState::Established
                } else {
                    BindingState::Released
                };
                for member in &record.members {
                    actions.push(Action::BindingState(member.core.clone(), binding_state));
                }
            }
        }
    }

    fn on_subscribe(
        state: &mut LeafState,
        actions: &mut Vec<Action>,
        pattern: Pattern,
        terminal: Id,
        subscribed: bool,
    ) {
        let reg = state.registry(pattern);
        if let Some(record) = reg.terminals.get_mut(terminal) {
            record.subscribed = subscribed;

            // A fresh subscriber gets the cached payload first.
            if subscribed && pattern.cached() {
                if let (Some(cache), Some(peer_id)) = (record.pub_cache.clone(), record.mapping.peer_id()) {
                    actions.push(Action::Send(Message::new(
                        pattern,
                        Body::CachedData {
                            id: peer_id,
                            payload: cache,
                        },
                    )));
                }
            }
        }
    }

    fn on_data(
        state: &mut LeafState,
        actions: &mut Vec<Action>,
        pattern: Pattern,
        group: Id,
        payload: Vec<u8>,
        cached: bool,
    ) {
        let members: Vec<Id> = {
            let reg = state.registry(pattern);
            match reg.groups.get(group) {
                Some(record) => record.members.iter().map(|m| m.terminal).collect(),
                None => return,
            }
        };

        for terminal in members {
            let echo = {
                let record = match state.registry(pattern).terminals.get_mut(terminal) {
                    Some(record) => record,
                    None => continue,
                };

                if pattern.cached() {
                    record.rcv_cache = Some(payload.clone());
                }

                if let Some(op) = record.receive_op.take() {
                    let code = if payload.len() > op.capacity {
                        ErrorCode::BufferTooSmall
                    } else {
                        ErrorCode::Ok
                    };
                    actions.push(Action::Receive {
                        handler: op.handler,
                        code,
                        payload: payload.clone(),
                        cached,
                    });
                }

                pattern.echoes_on_visible() && !record.ident.hidden()
            };

            // Master terminals re-broadcast inbound data so it reaches the
            // other slaves.
            if echo {
                let reachable = {
                    let record = state.registries[pattern.index()]
                        .terminals
                        .get(terminal)
                        .expect("Still present");
                    state.reachable(record)
                };

                if reachable {
                    let record = state.registry(pattern).terminals.get_mut(terminal).expect("Still present");
                    let peer_id = record.mapping.peer_id().expect("Reachable implies mapped");

                    if pattern.cached() {
                        record.pub_cache = Some(payload.clone());
                    }

                    let body = if cached {
                        Body::CachedData {
                            id: peer_id,
                            payload: payload.clone(),
                        }
                    } else {
                        Body::Data {
                            id: peer_id,
                            payload: payload.clone(),
                        }
                    };
                    actions.push(Action::Send(Message::new(pattern, body)));
                }
            }
        }
    }

    fn on_scatter(
        state: &mut LeafState,
        actions: &mut Vec<Action>,
        pattern: Pattern,
        group: Id,
        operation: Id,
        payload: Vec<u8>,
    ) {
        let members: Vec<Id> = {
            let reg = state.registry(pattern);
            match reg.groups.get(group) {
                Some(record) => record.members.iter().map(|m| m.terminal).collect(),
                None => return,
            }
        };

        let reg = state.registry(pattern);
        let mut pending = IndexSet::new();
        let mut deaf = Vec::new();

        for terminal in members {
            let record = match reg.terminals.get_mut(terminal) {
                Some(record) => record,
                None => continue,
            };

            match record.scattered_op.take() {
                Some(op) => {
                    let code = if payload.len() > op.capacity {
                        ErrorCode::BufferTooSmall
                    } else {
                        ErrorCode::Ok
                    };
                    actions.push(Action::Scattered {
                        handler: op.handler,
                        code,
                        operation,
                        payload: payload.clone(),
                    });
                    pending.insert(terminal.number());
                }
                None => deaf.push(terminal),
            }
        }

        // Terminals with no armed receive answer immediately with DEAF; the
        // last accounting unit carries FINISHED.
        let deaf_count = deaf.len();
        for (index, _) in deaf.iter().enumerate() {
            let mut flags = GatherFlags::DEAF;
            if pending.is_empty() && index == deaf_count - 1 {
                flags |= GatherFlags::FINISHED;
            }
            actions.push(Action::Send(Message::new(
                pattern,
                Body::Gather {
                    operation,
                    flags,
                    payload: Vec::new(),
                },
            )));
        }

        if !pending.is_empty() {
            reg.gather_ops.insert(operation.number(), GatherOp { group, pending });
        }
    }

    fn on_gather(
        state: &mut LeafState,
        actions: &mut Vec<Action>,
        pattern: Pattern,
        operation: Id,
        flags: GatherFlags,
        payload: Vec<u8>,
    ) {
        let reg = state.registry(pattern);

        let (stopped, capacity) = match reg.scatter_ops.get(&operation.number()) {
            Some(op) => (op.stopped, op.capacity),
            None => return,
        };

        if stopped {
            if flags.contains(GatherFlags::FINISHED) {
                reg.scatter_ops.remove(&operation.number());
            }
            return;
        }

        let code = if payload.len() > capacity {
            ErrorCode::BufferTooSmall
        } else {
            ErrorCode::Ok
        };

        let handler = if flags.contains(GatherFlags::FINISHED) {
            reg.scatter_ops
                .remove(&operation.number())
                .expect("Checked above")
                .handler
        } else {
            reg.scatter_ops
                .get(&operation.number())
                .expect("Checked above")
                .handler
                .clone()
        };

        actions.push(Action::Gather {
            handler,
            pattern,
            code,
            operation,
            flags,
            payload,
        });
    }
}

impl Communicator for Leaf {
    fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    fn communicator_is_node(&self) -> bool {
        false
    }

    fn on_new_connection(&self, conn: &ConnectionRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.connection.is_some() {
            return Err(ErrorCode::AlreadyConnected);
        }

        state.connection = Some(Arc::downgrade(conn));
        Ok(())
    }

    /// Announces local state to the fresh peer: terminals only to nodes
    /// (a leaf peer learns about them through our bindings' descriptions),
    /// binding groups always.
    fn on_connection_started(&self, conn: &ConnectionRef) -> Result<()> {
        let remote_is_node = conn.remote_is_node()?;

        self.with_state(|state, actions| {
            state.remote_is_node = remote_is_node;
            state.started = true;

            for reg in state.registries.iter_mut() {
                if remote_is_node {
                    for (id, record) in reg.terminals.iter_mut() {
                        if !record.dying {
                            record.described = true;
                            actions.push(Action::Send(Message::new(
                                reg.pattern,
                                Body::TerminalDescription {
                                    identifier: record.ident.clone(),
                                    my_id: id,
                                },
                            )));
                        }
                    }
                }

                for (id, record) in reg.groups.iter_mut() {
                    if !record.dying {
                        record.described = true;
                        actions.push(Action::Send(Message::new(
                            reg.pattern,
                            Body::BindingDescription {
                                identifier: record.ident.clone(),
                                my_id: id,
                            },
                        )));
                    }
                }
            }

            Ok(())
        })
    }

    /// Forgets all peer-assigned state: every mapping and subscription is
    /// void, established bindings release and in-flight scatter-gathers
    /// terminate with ConnectionLost.
    fn on_connection_destroyed(&self, _conn: &ConnectionRef) {
        self.with_state(|state, actions| {
            state.connection = None;
            state.started = false;
            state.remote_is_node = false;

            for reg in state.registries.iter_mut() {
                let pattern = reg.pattern;

                let dead_terminals: Vec<Id> = reg
                    .terminals
                    .iter()
                    .filter(|(_, r)| r.dying)
                    .map(|(id, _)| id)
                    .collect();
                for id in dead_terminals {
                    reg.terminals.remove(id);
                }
                for (_, record) in reg.terminals.iter_mut() {
                    record.mapping = Mapping::Unmapped;
                    record.described = false;
                    record.subscribed = false;
                }

                let dead_groups: Vec<Id> = reg
                    .groups
                    .iter()
                    .filter(|(_, g)| g.dying)
                    .map(|(id, _)| id)
                    .collect();
                for id in dead_groups {
                    reg.groups.remove(id);
                }
                for (_, record) in reg.groups.iter_mut() {
                    record.mapping = Mapping::Unmapped;
                    record.described = false;
                    if record.established {
                        record.established = false;
                        for member in &record.members {
                            actions.push(Action::BindingState(member.core.clone(), BindingState::Released));
                        }
                    }
                }

                for (num, op) in reg.scatter_ops.drain() {
                    actions.push(Action::Gather {
                        handler: op.handler,
                        pattern,
                        code: ErrorCode::ConnectionLost,
                        operation: Id::new(num),
                        flags: GatherFlags::CONNECTION_LOST | GatherFlags::FINISHED,
                        payload: Vec::new(),
                    });
                }

                reg.gather_ops.clear();
            }
        });

        logging::debug!(self.log, "leaf connection destroyed");
    }

    fn on_message_received(&self, msg: Message, _origin: &ConnectionRef) -> Result<()> {
        let pattern = msg.pattern;

        self.with_state(|state, actions| match msg.body {
            Body::TerminalDescription { identifier, my_id } => {
                Self::on_terminal_description(state, actions, pattern, identifier, my_id);
                Ok(())
            }
            Body::TerminalMapping { peer_id, my_id } => {
                Self::on_terminal_mapping(state, actions, pattern, peer_id, my_id);
                Ok(())
            }
            Body::TerminalNoticed { peer_id } => {
                Self::on_terminal_noticed(state, pattern, peer_id);
                Ok(())
            }
            Body::TerminalRemoved { id } => {
                Self::on_terminal_removed(state, actions, pattern, id);
                Ok(())
            }
            Body::TerminalRemovedAck { id } => {
                Self::on_terminal_removed_ack(state, pattern, id);
                Ok(())
            }
            Body::BindingDescription { identifier, my_id } => {
                Self::on_binding_description(state, actions, pattern, identifier, my_id);
                Ok(())
            }
            Body::BindingMapping { peer_id, my_id } => {
                Self::on_binding_mapping(state, actions, pattern, peer_id, my_id);
                Ok(())
            }
            Body::BindingNoticed { peer_id } => {
                Self::on_binding_noticed(state, pattern, peer_id);
                Ok(())
            }
            Body::BindingRemoved { id } => {
                Self::on_binding_removed(state, actions, pattern, id);
                Ok(())
            }
            Body::BindingRemovedAck { id } => {
                Self::on_binding_removed_ack(state, pattern, id);
                Ok(())
            }
            Body::BindingEstablished { id } => {
                Self::on_binding_established(state, actions, pattern, id, true);
                Ok(())
            }
            Body::BindingReleased { id } => {
                Self::on_binding_established(state, actions, pattern, id, false);
                Ok(())
            }
            Body::Subscribe { id } => {
                Self::on_subscribe(state, actions, pattern, id, true);
                Ok(())
            }
            Body::Unsubscribe { id } => {
                Self::on_subscribe(state, actions, pattern, id, false);
                Ok(())
            }
            Body::Data { id, payload } => {
                Self::on_data(state, actions, pattern, id, payload, false);
                Ok(())
            }
            Body::CachedData { id, payload } => {
                Self::on_data(state, actions, pattern, id, payload, true);
                Ok(())
            }
            Body::Scatter {
                target,
                operation,
                payload,
            } => {
                Self::on_scatter(state, actions, pattern, target, operation, payload);
                Ok(())
            }
            Body::Gather {
                operation,
                flags,
                payload,
            } => {
                Self::on_gather(state, actions, pattern, operation, flags, payload);
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::terminals::{
        CachedPublishSubscribeTerminal, DeafMuteTerminal, MasterTerminal, PublishSubscribeTerminal,
        ScatterGatherTerminal, SlaveTerminal,
    };
    use crate::core::test_support::{conn_ref, MockConnection};
    use crate::scheduling::MultiThreadedScheduler;

    fn make_leaf() -> Arc<Leaf> {
        Leaf::new(Arc::new(MultiThreadedScheduler::new(1).unwrap()))
    }

    fn attach(leaf: &Arc<Leaf>, conn: &Arc<MockConnection>) {
        let conn_ref = conn_ref(conn);
        leaf.on_new_connection(&conn_ref).unwrap();
        leaf.on_connection_started(&conn_ref).unwrap();
    }

    fn detach(leaf: &Arc<Leaf>, conn: &Arc<MockConnection>) {
        let conn_ref = conn_ref(conn);
        leaf.on_connection_destroyed(&conn_ref);
    }

    fn deliver(leaf: &Arc<Leaf>, conn: &Arc<MockConnection>, pattern: Pattern, body: Body) {
        let conn_ref = conn_ref(conn);
        leaf.on_message_received(Message::new(pattern, body), &conn_ref).unwrap();
    }

    fn ident(name: &str) -> Identifier {
        Identifier::new(0, name, false)
    }

    fn hidden_ident(name: &str) -> Identifier {
        Identifier::new(0, name, true)
    }

    #[test]
    fn test_connection_started_describes_state() {
        let leaf = make_leaf();
        let terminal = DeafMuteTerminal::new(&leaf, 0, "T").unwrap();
        let _binding = terminal.make_binding("B").unwrap();

        // A leaf peer learns about terminals through our bindings only.
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);
        assert_eq!(
            vec![Message::new(
                Pattern::DeafMute,
                Body::BindingDescription {
                    identifier: ident("B"),
                    my_id: Id::new(1),
                },
            )],
            peer.take_sent()
        );
        detach(&leaf, &peer);

        // A node peer gets the terminals as well.
        let peer = MockConnection::node_peer();
        attach(&leaf, &peer);
        assert_eq!(
            vec![
                Message::new(
                    Pattern::DeafMute,
                    Body::TerminalDescription {
                        identifier: ident("T"),
                        my_id: Id::new(1),
                    },
                ),
                Message::new(
                    Pattern::DeafMute,
                    Body::BindingDescription {
                        identifier: ident("B"),
                        my_id: Id::new(1),
                    },
                ),
            ],
            peer.take_sent()
        );
    }

    #[test]
    fn test_already_connected() {
        let leaf = make_leaf();
        let first = MockConnection::leaf_peer();
        attach(&leaf, &first);

        let second = MockConnection::leaf_peer();
        let second_ref = conn_ref(&second);
        assert_eq!(
            ErrorCode::AlreadyConnected,
            leaf.on_new_connection(&second_ref).err().unwrap()
        );

        detach(&leaf, &first);
        leaf.on_new_connection(&second_ref).unwrap();
    }

    #[test]
    fn test_ambiguous_identifier() {
        let leaf = make_leaf();
        let _terminal = DeafMuteTerminal::new(&leaf, 1, "A").unwrap();

        assert_eq!(
            ErrorCode::AmbiguousIdentifier,
            DeafMuteTerminal::new(&leaf, 1, "A").err().unwrap()
        );

        // Different signature or hidden flag is a different identity.
        let _other = DeafMuteTerminal::new(&leaf, 2, "A").unwrap();
    }

    #[test]
    fn test_terminal_lifecycle_with_node_peer() {
        let leaf = make_leaf();
        let peer = MockConnection::node_peer();
        attach(&leaf, &peer);

        // Terminal A is mapped by the peer.
        let t1 = DeafMuteTerminal::new(&leaf, 0, "A").unwrap();
        assert_eq!(
            vec![Message::new(
                Pattern::DeafMute,
                Body::TerminalDescription {
                    identifier: ident("A"),
                    my_id: Id::new(1),
                },
            )],
            peer.take_sent()
        );
        deliver(&leaf, &peer, Pattern::DeafMute, Body::TerminalMapping {
            peer_id: Id::new(1),
            my_id: Id::new(123),
        });

        // Terminal B is only noticed.
        let t2 = DeafMuteTerminal::new(&leaf, 0, "B").unwrap();
        peer.take_sent();
        deliver(&leaf, &peer, Pattern::DeafMute, Body::TerminalNoticed {
            peer_id: Id::new(2),
        });

        // Destroying A announces the removal using the peer's id and retires
        // the local id only on acknowledgement.
        drop(t1);
        assert_eq!(
            vec![Message::new(
                Pattern::DeafMute,
                Body::TerminalRemoved { id: Id::new(123) },
            )],
            peer.take_sent()
        );
        deliver(&leaf, &peer, Pattern::DeafMute, Body::TerminalRemovedAck {
            id: Id::new(1),
        });

        // Destroying the noticed terminal is silent.
        drop(t2);
        assert!(peer.take_sent().is_empty());
    }

    #[test]
    fn test_binding_with_leaf_peer() {
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);

        let terminal = DeafMuteTerminal::new(&leaf, 0, "A").unwrap();
        peer.take_sent();

        // b1 maps; with a leaf peer the mapping itself establishes it.
        let b1 = terminal.make_binding("b1").unwrap();
        assert_eq!(
            vec![Message::new(
                Pattern::DeafMute,
                Body::BindingDescription {
                    identifier: ident("b1"),
                    my_id: Id::new(1),
                },
            )],
            peer.take_sent()
        );
        assert_eq!(BindingState::Released, b1.state());

        deliver(&leaf, &peer, Pattern::DeafMute, Body::BindingMapping {
            peer_id: Id::new(1),
            my_id: Id::new(777),
        });
        assert_eq!(BindingState::Established, b1.state());

        // b2 is noticed; it stays released and its removal is silent.
        let b2 = terminal.make_binding("b2").unwrap();
        peer.take_sent();
        deliver(&leaf, &peer, Pattern::DeafMute, Body::BindingNoticed {
            peer_id: Id::new(2),
        });
        assert_eq!(BindingState::Released, b2.state());

        drop(b1);
        assert_eq!(
            vec![Message::new(
                Pattern::DeafMute,
                Body::BindingRemoved { id: Id::new(777) },
            )],
            peer.take_sent()
        );
        deliver(&leaf, &peer, Pattern::DeafMute, Body::BindingRemovedAck {
            id: Id::new(1),
        });

        drop(b2);
        assert!(peer.take_sent().is_empty());
    }

    #[test]
    fn test_binding_establish_release_via_node() {
        let leaf = make_leaf();
        let peer = MockConnection::node_peer();
        attach(&leaf, &peer);

        let terminal = DeafMuteTerminal::new(&leaf, 0, "A").unwrap();
        let binding = terminal.make_binding("b1").unwrap();
        peer.take_sent();

        // A node's mapping does not establish by itself.
        deliver(&leaf, &peer, Pattern::DeafMute, Body::BindingMapping {
            peer_id: Id::new(1),
            my_id: Id::new(777),
        });
        assert_eq!(BindingState::Released, binding.state());

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        binding
            .async_await_state_change(move |code, state| {
                sink.lock().unwrap().push((code, state));
            })
            .unwrap();

        deliver(&leaf, &peer, Pattern::DeafMute, Body::BindingEstablished { id: Id::new(1) });
        assert_eq!(BindingState::Established, binding.state());

        let sink = changes.clone();
        binding
            .async_await_state_change(move |code, state| {
                sink.lock().unwrap().push((code, state));
            })
            .unwrap();

        deliver(&leaf, &peer, Pattern::DeafMute, Body::BindingReleased { id: Id::new(1) });
        assert_eq!(BindingState::Released, binding.state());

        assert_eq!(
            vec![
                (ErrorCode::Ok, BindingState::Established),
                (ErrorCode::Ok, BindingState::Released),
            ],
            *changes.lock().unwrap()
        );
    }

    #[test]
    fn test_publish_gating() {
        let leaf = make_leaf();
        let data = b"ab".to_vec();

        // Leaf peer: publishing works as soon as the terminal is mapped.
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);

        let terminal = PublishSubscribeTerminal::new(&leaf, 0, "T1").unwrap();
        peer.take_sent();
        assert_eq!(false, terminal.publish(data.clone()).unwrap());

        deliver(&leaf, &peer, Pattern::PublishSubscribe, Body::TerminalMapping {
            peer_id: Id::new(1),
            my_id: Id::new(123),
        });
        assert_eq!(true, terminal.publish(data.clone()).unwrap());
        assert_eq!(
            vec![Message::new(
                Pattern::PublishSubscribe,
                Body::Data {
                    id: Id::new(123),
                    payload: data.clone(),
                },
            )],
            peer.take_sent()
        );

        detach(&leaf, &peer);

        // Node peer: publishing additionally requires a subscriber.
        let peer = MockConnection::node_peer();
        attach(&leaf, &peer);
        peer.take_sent();
        deliver(&leaf, &peer, Pattern::PublishSubscribe, Body::TerminalMapping {
            peer_id: Id::new(1),
            my_id: Id::new(456),
        });

        assert_eq!(false, terminal.publish(data.clone()).unwrap());

        deliver(&leaf, &peer, Pattern::PublishSubscribe, Body::Subscribe { id: Id::new(1) });
        assert_eq!(true, terminal.publish(data.clone()).unwrap());
        assert_eq!(
            vec![Message::new(
                Pattern::PublishSubscribe,
                Body::Data {
                    id: Id::new(456),
                    payload: data.clone(),
                },
            )],
            peer.take_sent()
        );

        deliver(&leaf, &peer, Pattern::PublishSubscribe, Body::Unsubscribe { id: Id::new(1) });
        assert_eq!(false, terminal.publish(data).unwrap());
        assert!(peer.take_sent().is_empty());
    }

    #[test]
    fn test_receive_delivery() {
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);

        let terminal = PublishSubscribeTerminal::new(&leaf, 0, "T").unwrap();
        let _binding = terminal.make_binding("x").unwrap();
        peer.take_sent();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        terminal
            .async_receive(16, move |code, payload| {
                sink.lock().unwrap().push((code, payload));
            })
            .unwrap();

        // Data addressed to the binding group reaches the terminal.
        deliver(&leaf, &peer, Pattern::PublishSubscribe, Body::Data {
            id: Id::new(1),
            payload: b"ab".to_vec(),
        });
        assert_eq!(
            vec![(ErrorCode::Ok, b"ab".to_vec())],
            std::mem::replace(&mut *received.lock().unwrap(), Vec::new())
        );

        // Nothing armed: the message is dropped.
        deliver(&leaf, &peer, Pattern::PublishSubscribe, Body::Data {
            id: Id::new(1),
            payload: b"cd".to_vec(),
        });
        assert!(received.lock().unwrap().is_empty());

        // Undersized receive reports BufferTooSmall but still hands over the
        // payload size.
        let sink = received.clone();
        terminal
            .async_receive(1, move |code, payload| {
                sink.lock().unwrap().push((code, payload));
            })
            .unwrap();
        deliver(&leaf, &peer, Pattern::PublishSubscribe, Body::Data {
            id: Id::new(1),
            payload: b"toolarge".to_vec(),
        });
        assert_eq!(
            vec![(ErrorCode::BufferTooSmall, b"toolarge".to_vec())],
            std::mem::replace(&mut *received.lock().unwrap(), Vec::new())
        );

        // Double-arming is refused; cancel fires Canceled.
        terminal.async_receive(16, |_, _| {}).unwrap();
        assert_eq!(
            ErrorCode::AsyncOperationRunning,
            terminal.async_receive(16, |_, _| {}).err().unwrap()
        );
        let sink = received.clone();
        terminal.cancel_receive();
        terminal
            .async_receive(16, move |code, payload| {
                sink.lock().unwrap().push((code, payload));
            })
            .unwrap();
        terminal.cancel_receive();
        assert_eq!(
            vec![(ErrorCode::Canceled, Vec::new())],
            std::mem::replace(&mut *received.lock().unwrap(), Vec::new())
        );
    }

    struct GatherCall {
        code: ErrorCode,
        operation: Id,
        flags: GatherFlags,
        payload: Vec<u8>,
    }

    fn gather_recorder(
        keep_going: bool,
    ) -> (
        Arc<Mutex<Vec<GatherCall>>>,
        impl FnMut(ErrorCode, Id, GatherFlags, &[u8]) -> bool + Send + 'static,
    ) {
        let calls: Arc<Mutex<Vec<GatherCall>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let handler = move |code, operation, flags, payload: &[u8]| {
            sink.lock().unwrap().push(GatherCall {
                code,
                operation,
                flags,
                payload: payload.to_vec(),
            });
            keep_going
        };
        (calls, handler)
    }

    fn mapped_sg_terminal(
        leaf: &Arc<Leaf>,
        peer: &Arc<MockConnection>,
        name: &str,
        peer_id: u32,
    ) -> ScatterGatherTerminal {
        let terminal = ScatterGatherTerminal::new(leaf, 0, name).unwrap();
        let my_id = terminal.id();
        deliver(leaf, peer, Pattern::ScatterGather, Body::TerminalMapping {
            peer_id: my_id,
            my_id: Id::new(peer_id),
        });
        peer.take_sent();
        terminal
    }

    #[test]
    fn test_scatter_not_bound() {
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);

        let terminal = ScatterGatherTerminal::new(&leaf, 0, "T").unwrap();
        let result = terminal.async_scatter_gather(b"x".to_vec(), 16, |_, _, _, _| true);
        assert_eq!(ErrorCode::NotBound, result.err().unwrap());
    }

    #[test]
    fn test_scatter_successful_operation() {
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);
        let terminal = mapped_sg_terminal(&leaf, &peer, "T", 10);

        let (calls, handler) = gather_recorder(true);
        let op = terminal.async_scatter_gather(b"ab".to_vec(), 16, handler).unwrap();
        assert_eq!(1, op.number());
        assert_eq!(
            vec![Message::new(
                Pattern::ScatterGather,
                Body::Scatter {
                    target: Id::new(10),
                    operation: op,
                    payload: b"ab".to_vec(),
                },
            )],
            peer.take_sent()
        );

        deliver(&leaf, &peer, Pattern::ScatterGather, Body::Gather {
            operation: op,
            flags: GatherFlags::IGNORED,
            payload: Vec::new(),
        });
        deliver(&leaf, &peer, Pattern::ScatterGather, Body::Gather {
            operation: op,
            flags: GatherFlags::FINISHED,
            payload: b"ab".to_vec(),
        });

        let calls = calls.lock().unwrap();
        assert_eq!(2, calls.len());
        assert_eq!(GatherFlags::IGNORED, calls[0].flags);
        assert_eq!(ErrorCode::Ok, calls[0].code);
        assert!(calls[0].payload.is_empty());
        assert_eq!(GatherFlags::FINISHED, calls[1].flags);
        assert_eq!(b"ab".to_vec(), calls[1].payload);
    }

    #[test]
    fn test_scatter_stop_after_first_response() {
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);
        let terminal = mapped_sg_terminal(&leaf, &peer, "T", 10);

        let (calls, handler) = gather_recorder(false);
        let op = terminal.async_scatter_gather(b"ab".to_vec(), 16, handler).unwrap();
        peer.take_sent();

        deliver(&leaf, &peer, Pattern::ScatterGather, Body::Gather {
            operation: op,
            flags: GatherFlags::NONE,
            payload: b"ab".to_vec(),
        });
        // The terminating response is swallowed after the handler said stop.
        deliver(&leaf, &peer, Pattern::ScatterGather, Body::Gather {
            operation: op,
            flags: GatherFlags::FINISHED,
            payload: b"ab".to_vec(),
        });

        assert_eq!(1, calls.lock().unwrap().len());
    }

    #[test]
    fn test_scatter_cancel() {
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);
        let terminal = mapped_sg_terminal(&leaf, &peer, "T", 11);

        let (calls, handler) = gather_recorder(true);
        let op = terminal.async_scatter_gather(b"ab".to_vec(), 16, handler).unwrap();
        peer.take_sent();

        terminal.cancel_scatter_gather(op).unwrap();
        assert_eq!(
            ErrorCode::InvalidId,
            terminal.cancel_scatter_gather(op).err().unwrap()
        );

        // A late response is dropped.
        deliver(&leaf, &peer, Pattern::ScatterGather, Body::Gather {
            operation: op,
            flags: GatherFlags::FINISHED,
            payload: Vec::new(),
        });

        let calls = calls.lock().unwrap();
        assert_eq!(1, calls.len());
        assert_eq!(ErrorCode::Canceled, calls[0].code);
        assert_eq!(GatherFlags::FINISHED, calls[0].flags);
    }

    #[test]
    fn test_scatter_binding_destroyed_and_connection_lost() {
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);

        // Peer removes its binding mid-operation.
        let terminal = mapped_sg_terminal(&leaf, &peer, "T", 12);
        let (calls, handler) = gather_recorder(true);
        let _op = terminal.async_scatter_gather(b"ab".to_vec(), 16, handler).unwrap();
        peer.take_sent();

        deliver(&leaf, &peer, Pattern::ScatterGather, Body::BindingRemoved {
            id: terminal.id(),
        });
        {
            let calls = calls.lock().unwrap();
            assert_eq!(1, calls.len());
            assert_eq!(ErrorCode::Ok, calls[0].code);
            assert_eq!(
                GatherFlags::BINDING_DESTROYED | GatherFlags::FINISHED,
                calls[0].flags
            );
        }

        // Connection goes away mid-operation.
        let terminal2 = mapped_sg_terminal(&leaf, &peer, "U", 13);
        let (calls2, handler2) = gather_recorder(true);
        let _op = terminal2.async_scatter_gather(b"ab".to_vec(), 16, handler2).unwrap();

        detach(&leaf, &peer);
        {
            let calls = calls2.lock().unwrap();
            assert_eq!(1, calls.len());
            assert_eq!(ErrorCode::ConnectionLost, calls[0].code);
            assert_eq!(
                GatherFlags::CONNECTION_LOST | GatherFlags::FINISHED,
                calls[0].flags
            );
        }
    }

    #[test]
    fn test_scatter_terminal_destroyed() {
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);
        let terminal = mapped_sg_terminal(&leaf, &peer, "T", 13);

        let (calls, handler) = gather_recorder(true);
        let _op = terminal.async_scatter_gather(b"ab".to_vec(), 16, handler).unwrap();

        drop(terminal);
        let calls = calls.lock().unwrap();
        assert_eq!(1, calls.len());
        assert_eq!(ErrorCode::Canceled, calls[0].code);
        assert_eq!(GatherFlags::FINISHED, calls[0].flags);
    }

    fn armed_responder(
        terminal: &ScatterGatherTerminal,
    ) -> Arc<Mutex<Vec<(ErrorCode, Id, Vec<u8>)>>> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        terminal
            .async_receive_scattered(64, move |code, operation, payload| {
                sink.lock().unwrap().push((code, operation, payload));
            })
            .unwrap();
        calls
    }

    #[test]
    fn test_gather_responder_side() {
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);

        let t1 = ScatterGatherTerminal::new(&leaf, 0, "T1").unwrap();
        let t2 = ScatterGatherTerminal::new(&leaf, 0, "T2").unwrap();
        let _b1 = t1.make_binding("A").unwrap();
        let _b2 = t2.make_binding("A").unwrap();
        peer.take_sent();

        let r1 = armed_responder(&t1);
        let r2 = armed_responder(&t2);

        // One scatter addressed to the shared group reaches both terminals.
        deliver(&leaf, &peer, Pattern::ScatterGather, Body::Scatter {
            target: Id::new(1),
            operation: Id::new(88),
            payload: b"ab".to_vec(),
        });
        assert_eq!(vec![(ErrorCode::Ok, Id::new(88), b"ab".to_vec())], *r1.lock().unwrap());
        assert_eq!(vec![(ErrorCode::Ok, Id::new(88), b"ab".to_vec())], *r2.lock().unwrap());

        // First responder answers, second ignores; the last one carries
        // FINISHED.
        t1.respond_to_scattered(Id::new(88), b"y".to_vec()).unwrap();
        t2.ignore_scattered(Id::new(88)).unwrap();
        assert_eq!(
            vec![
                Message::new(
                    Pattern::ScatterGather,
                    Body::Gather {
                        operation: Id::new(88),
                        flags: GatherFlags::NONE,
                        payload: b"y".to_vec(),
                    },
                ),
                Message::new(
                    Pattern::ScatterGather,
                    Body::Gather {
                        operation: Id::new(88),
                        flags: GatherFlags::IGNORED | GatherFlags::FINISHED,
                        payload: Vec::new(),
                    },
                ),
            ],
            peer.take_sent()
        );

        // Late responses are invalid.
        assert_eq!(
            ErrorCode::InvalidId,
            t1.respond_to_scattered(Id::new(88), Vec::new()).err().unwrap()
        );
    }

    #[test]
    fn test_gather_responder_deaf() {
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);

        let t1 = ScatterGatherTerminal::new(&leaf, 0, "T1").unwrap();
        let _b1 = t1.make_binding("A").unwrap();
        peer.take_sent();

        // No receive armed: the leaf answers DEAF on the terminal's behalf.
        deliver(&leaf, &peer, Pattern::ScatterGather, Body::Scatter {
            target: Id::new(1),
            operation: Id::new(90),
            payload: b"ab".to_vec(),
        });
        assert_eq!(
            vec![Message::new(
                Pattern::ScatterGather,
                Body::Gather {
                    operation: Id::new(90),
                    flags: GatherFlags::DEAF | GatherFlags::FINISHED,
                    payload: Vec::new(),
                },
            )],
            peer.take_sent()
        );
    }

    #[test]
    fn test_gather_responder_binding_destroyed() {
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);

        let t1 = ScatterGatherTerminal::new(&leaf, 0, "T1").unwrap();
        let t2 = ScatterGatherTerminal::new(&leaf, 0, "T2").unwrap();
        let b1 = t1.make_binding("A").unwrap();
        let _b2 = t2.make_binding("A").unwrap();
        peer.take_sent();

        let _r1 = armed_responder(&t1);
        let _r2 = armed_responder(&t2);

        deliver(&leaf, &peer, Pattern::ScatterGather, Body::Scatter {
            target: Id::new(1),
            operation: Id::new(91),
            payload: b"ab".to_vec(),
        });

        // Destroying one of two bindings drops it from the pending set
        // silently; the remaining responder finishes the operation.
        drop(b1);
        assert!(peer.take_sent().is_empty());

        t2.respond_to_scattered(Id::new(91), b"z".to_vec()).unwrap();
        assert_eq!(
            vec![Message::new(
                Pattern::ScatterGather,
                Body::Gather {
                    operation: Id::new(91),
                    flags: GatherFlags::FINISHED,
                    payload: b"z".to_vec(),
                },
            )],
            peer.take_sent()
        );
        assert_eq!(
            ErrorCode::InvalidId,
            t1.respond_to_scattered(Id::new(91), Vec::new()).err().unwrap()
        );

        // Destroying the last pending binding terminates the operation with
        // BINDING_DESTROYED.
        let r2 = armed_responder(&t2);
        deliver(&leaf, &peer, Pattern::ScatterGather, Body::Scatter {
            target: Id::new(1),
            operation: Id::new(92),
            payload: b"ab".to_vec(),
        });
        assert_eq!(1, r2.lock().unwrap().len());

        drop(t2);
        let sent = peer.take_sent();
        assert!(sent.contains(&Message::new(
            Pattern::ScatterGather,
            Body::Gather {
                operation: Id::new(92),
                flags: GatherFlags::BINDING_DESTROYED | GatherFlags::FINISHED,
                payload: Vec::new(),
            },
        )));
    }

    #[test]
    fn test_cached_terminal_with_leaf_peer() {
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);

        let terminal = CachedPublishSubscribeTerminal::new(&leaf, 0, "T1").unwrap();
        deliver(&leaf, &peer, Pattern::CachedPublishSubscribe, Body::TerminalMapping {
            peer_id: Id::new(1),
            my_id: Id::new(123),
        });
        peer.take_sent();

        // Publishing does not fill the receive cache.
        assert!(terminal.publish(b"ab".to_vec()).unwrap());
        assert_eq!(ErrorCode::Uninitialized, terminal.get_cache().err().unwrap());

        let _binding = terminal.make_binding("ABC").unwrap();
        peer.take_sent();

        // Receiving does, and CachedData replaces rather than buffers.
        deliver(&leaf, &peer, Pattern::CachedPublishSubscribe, Body::Data {
            id: Id::new(1),
            payload: b"cd".to_vec(),
        });
        assert_eq!(b"cd".to_vec(), terminal.get_cache().unwrap());

        deliver(&leaf, &peer, Pattern::CachedPublishSubscribe, Body::CachedData {
            id: Id::new(1),
            payload: b"ef".to_vec(),
        });
        assert_eq!(b"ef".to_vec(), terminal.get_cache().unwrap());

        // The cached receive flag distinguishes live data from cache.
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        terminal
            .async_receive(16, move |code, payload, cached| {
                sink.lock().unwrap().push((code, payload, cached));
            })
            .unwrap();
        deliver(&leaf, &peer, Pattern::CachedPublishSubscribe, Body::CachedData {
            id: Id::new(1),
            payload: b"gh".to_vec(),
        });
        assert_eq!(
            vec![(ErrorCode::Ok, b"gh".to_vec(), true)],
            *received.lock().unwrap()
        );

        // A fresh peer binding immediately receives the last published
        // payload.
        deliver(&leaf, &peer, Pattern::CachedPublishSubscribe, Body::BindingRemoved {
            id: Id::new(1),
        });
        peer.take_sent();
        deliver(&leaf, &peer, Pattern::CachedPublishSubscribe, Body::BindingDescription {
            identifier: ident("T1"),
            my_id: Id::new(456),
        });
        assert_eq!(
            vec![
                Message::new(
                    Pattern::CachedPublishSubscribe,
                    Body::BindingMapping {
                        peer_id: Id::new(456),
                        my_id: Id::new(1),
                    },
                ),
                Message::new(
                    Pattern::CachedPublishSubscribe,
                    Body::CachedData {
                        id: Id::new(456),
                        payload: b"ab".to_vec(),
                    },
                ),
            ],
            peer.take_sent()
        );
    }

    #[test]
    fn test_cached_terminal_subscribe_emission() {
        let leaf = make_leaf();
        let peer = MockConnection::node_peer();
        attach(&leaf, &peer);

        let terminal = CachedPublishSubscribeTerminal::new(&leaf, 0, "T1").unwrap();
        deliver(&leaf, &peer, Pattern::CachedPublishSubscribe, Body::TerminalMapping {
            peer_id: Id::new(1),
            my_id: Id::new(123),
        });
        peer.take_sent();

        // First subscribe: no cache, nothing emitted.
        deliver(&leaf, &peer, Pattern::CachedPublishSubscribe, Body::Subscribe { id: Id::new(1) });
        assert!(peer.take_sent().is_empty());

        assert!(terminal.publish(b"ab".to_vec()).unwrap());
        peer.take_sent();

        // Re-subscribe: the cached payload precedes any further data.
        deliver(&leaf, &peer, Pattern::CachedPublishSubscribe, Body::Unsubscribe { id: Id::new(1) });
        deliver(&leaf, &peer, Pattern::CachedPublishSubscribe, Body::Subscribe { id: Id::new(1) });
        assert_eq!(
            vec![Message::new(
                Pattern::CachedPublishSubscribe,
                Body::CachedData {
                    id: Id::new(123),
                    payload: b"ab".to_vec(),
                },
            )],
            peer.take_sent()
        );
    }

    #[test]
    fn test_master_echoes_slave_does_not() {
        let data = b"ab".to_vec();

        // Data received by a master is re-broadcast.
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);

        let master = MasterTerminal::new(&leaf, 0, "T1").unwrap();
        deliver(&leaf, &peer, Pattern::MasterSlave, Body::TerminalMapping {
            peer_id: master.id(),
            my_id: Id::new(123),
        });
        peer.take_sent();

        deliver(&leaf, &peer, Pattern::MasterSlave, Body::Data {
            id: Id::new(1),
            payload: data.clone(),
        });
        assert_eq!(
            vec![Message::new(
                Pattern::MasterSlave,
                Body::Data {
                    id: Id::new(123),
                    payload: data.clone(),
                },
            )],
            peer.take_sent()
        );

        // After the peer's binding goes away the echo has nowhere to go.
        deliver(&leaf, &peer, Pattern::MasterSlave, Body::BindingRemoved { id: master.id() });
        peer.take_sent();
        deliver(&leaf, &peer, Pattern::MasterSlave, Body::Data {
            id: Id::new(1),
            payload: data.clone(),
        });
        assert!(peer.take_sent().is_empty());

        // Data received by a slave is not re-broadcast.
        let leaf = make_leaf();
        let peer = MockConnection::leaf_peer();
        attach(&leaf, &peer);

        let slave = SlaveTerminal::new(&leaf, 0, "T1").unwrap();
        assert_eq!(hidden_ident("T1"), *slave.identifier());
        deliver(&leaf, &peer, Pattern::MasterSlave, Body::TerminalMapping {
            peer_id: slave.id(),
            my_id: Id::new(123),
        });
        peer.take_sent();

        deliver(&leaf, &peer, Pattern::MasterSlave, Body::Data {
            id: Id::new(1),
            payload: data,
        });
        assert!(peer.take_sent().is_empty());
    }

    #[test]
    fn test_terminal_removed_before_mapping() {
        let leaf = make_leaf();
        let peer = MockConnection::node_peer();
        attach(&leaf, &peer);

        let terminal = DeafMuteTerminal::new(&leaf, 0, "A").unwrap();
        peer.take_sent();

        // Destroyed before the peer's mapping arrives: the removal is
        // deferred until the peer's id is known, and the local id is only
        // recycled after the acknowledgement.
        drop(terminal);
        assert!(peer.take_sent().is_empty());

        deliver(&leaf, &peer, Pattern::DeafMute, Body::TerminalMapping {
            peer_id: Id::new(1),
            my_id: Id::new(44),
        });
        assert_eq!(
            vec![Message::new(
                Pattern::DeafMute,
                Body::TerminalRemoved { id: Id::new(44) },
            )],
            peer.take_sent()
        );

        deliver(&leaf, &peer, Pattern::DeafMute, Body::TerminalRemovedAck { id: Id::new(1) });

        // The slot is free again.
        let replacement = DeafMuteTerminal::new(&leaf, 0, "A").unwrap();
        assert_eq!(1, replacement.id().number());
    }
}
