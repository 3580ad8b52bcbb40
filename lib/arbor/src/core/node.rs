use crate::base::async_op::AsyncOperation;
use crate::connections::{connection_key, Communicator, ConnectionRef, WeakConnectionRef};
use crate::core::arena::Arena;
use crate::core::pattern::{Pattern, PATTERN_COUNT};
use crate::errors::{ErrorCode, Result};
use crate::identity::{Id, Identifier};
use crate::logging::{self, Logger};
use crate::msg::{Body, GatherFlags, Message};
use crate::scheduling::Scheduler;

use hashbrown::HashMap;
use indexmap::{IndexMap, IndexSet};

use std::sync::{Arc, Mutex};

/// One known-terminal change as reported to
/// `async_await_known_terminals_change`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KnownTerminalChange {
    pub pattern: Pattern,
    pub identifier: Identifier,
    pub added: bool,
}

type KnownChangeHandler = Box<dyn FnOnce(ErrorCode, Option<KnownTerminalChange>) + Send>;

/// Snapshot of the node's registry, grouped by pattern. Hidden terminals are
/// not reported.
pub struct KnownTerminals {
    per_pattern: Vec<Vec<Identifier>>,
}

impl KnownTerminals {
    pub fn of(&self, pattern: Pattern) -> &[Identifier] {
        &self.per_pattern[pattern.index()]
    }
}

/// Per-connection view of one known terminal. `id` is the peer's id for the
/// terminal in its own numbering: the announced local id when the peer hosts
/// an instance (`uses` set), or the id the peer assigned when acknowledging
/// our description.
struct PeerLink {
    id: Id,
    uses: bool,
    pending_removal: bool,
    awaiting_ack: bool,
}

impl PeerLink {
    fn pending_mapping() -> PeerLink {
        PeerLink {
            id: Id::NONE,
            uses: false,
            pending_removal: false,
            awaiting_ack: false,
        }
    }
}

struct KnownTerminal {
    ident: Identifier,
    links: IndexMap<usize, PeerLink>,
    subs_in: IndexSet<usize>,
    sub_sent: IndexSet<usize>,
    cache: Option<Vec<u8>>,
    dying: bool,
}

impl KnownTerminal {
    fn new(ident: Identifier) -> KnownTerminal {
        KnownTerminal {
            ident,
            links: IndexMap::new(),
            subs_in: IndexSet::new(),
            sub_sent: IndexSet::new(),
            cache: None,
            dying: false,
        }
    }

    fn use_count(&self) -> usize {
        self.links.values().filter(|link| link.uses).count()
    }

    fn used_elsewhere(&self, conn: usize) -> bool {
        self.links.iter().any(|(&key, link)| link.uses && key != conn)
    }

    fn settled(&self) -> bool {
        self.links
            .values()
            .all(|link| !link.awaiting_ack && !link.pending_removal)
    }
}

/// One peer's membership in a binding group.
struct GroupMember {
    remote_id: Id,
    established: bool,
}

/// Bindings from different connections with the same target identifier share
/// one node-side group; the group's id is what the mapping protocol talks
/// about with every peer.
struct BindingGroup {
    ident: Identifier,
    members: IndexMap<usize, GroupMember>,
}

/// One scatter operation being relayed: remembers where it came from and
/// which recipients still owe a FINISHED response.
struct RelayOp {
    origin: usize,
    origin_op: Id,
    terminal: Id,
    pending: IndexSet<usize>,
}

struct NodeRegistry {
    pattern: Pattern,
    terminals: Arena<KnownTerminal>,
    ident_index: HashMap<Identifier, Id>,
    groups: Arena<BindingGroup>,
    group_index: HashMap<Identifier, Id>,
    next_op: u32,
    relays: HashMap<u32, RelayOp>,
}

impl NodeRegistry {
    fn new(pattern: Pattern) -> NodeRegistry {
        NodeRegistry {
            pattern,
            terminals: Arena::new(),
            ident_index: HashMap::new(),
            groups: Arena::new(),
            group_index: HashMap::new(),
            next_op: 1,
            relays: HashMap::new(),
        }
    }

    /// Whether any connection other than `conn` holds interest in `ident`
    /// (a binding group member or a subscribed node peer).
    fn interest_elsewhere(&self, ident: &Identifier, subs_in: &IndexSet<usize>, conn: usize) -> bool {
        if subs_in.iter().any(|&c| c != conn) {
            return true;
        }

        self.group_index
            .get(ident)
            .and_then(|&gid| self.groups.get(gid))
            .map(|group| group.members.keys().any(|&c| c != conn))
            .unwrap_or(false)
    }
}

struct ConnEntry {
    conn: WeakConnectionRef,
    is_node: bool,
}

struct NodeState {
    conns: IndexMap<usize, ConnEntry>,
    registries: Vec<NodeRegistry>,
}

impl NodeState {
    fn node_peers(&self) -> Vec<usize> {
        self.conns
            .iter()
            .filter(|(_, entry)| entry.is_node)
            .map(|(&key, _)| key)
            .collect()
    }
}

enum NodeAction {
    SendTo(usize, Message),
    Change(KnownTerminalChange),
}

/// Routing hub: maintains a global view of known terminals and bindings per
/// pattern and routes data by terminal-id remapping. A node never relays a
/// message across the connection it arrived on.
pub struct Node {
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<NodeState>,
    change_op: AsyncOperation<KnownChangeHandler>,
    log: Logger,
}

impl Node {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Arc<Node> {
        Node::with_logger(scheduler, logging::discard())
    }

    pub fn with_logger(scheduler: Arc<dyn Scheduler>, log: Logger) -> Arc<Node> {
        debug_assert_eq!(PATTERN_COUNT, Pattern::ALL.len());

        Arc::new(Node {
            scheduler,
            state: Mutex::new(NodeState {
                conns: IndexMap::new(),
                registries: Pattern::ALL.iter().map(|&p| NodeRegistry::new(p)).collect(),
            }),
            change_op: AsyncOperation::new(),
            log,
        })
    }

    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    pub fn get_known_terminals(&self) -> KnownTerminals {
        let state = self.state.lock().unwrap();

        KnownTerminals {
            per_pattern: state
                .registries
                .iter()
                .map(|reg| {
                    reg.terminals
                        .iter()
                        .filter(|(_, t)| !t.dying && !t.ident.hidden())
                        .map(|(_, t)| t.ident.clone())
                        .collect()
                })
                .collect(),
        }
    }

    /// Arms a single-shot handler fired on the next change to the set of
    /// known (non-hidden) terminals.
    pub fn async_await_known_terminals_change<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, Option<KnownTerminalChange>) + Send + 'static,
    {
        self.change_op.arm(Box::new(handler))
    }

    pub fn cancel_await_known_terminals_change(&self) {
        self.change_op.fire(|handler| handler(ErrorCode::Canceled, None));
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut NodeState, &mut Vec<NodeAction>) -> R) -> R {
        let mut actions = Vec::new();
        let (result, conns) = {
            let mut state = self.state.lock().unwrap();
            let result = f(&mut state, &mut actions);
            let conns: HashMap<usize, ConnectionRef> = state
                .conns
                .iter()
                .filter_map(|(&key, entry)| entry.conn.upgrade().map(|conn| (key, conn)))
                .collect();
            (result, conns)
        };

        for action in actions {
            match action {
                NodeAction::SendTo(key, msg) => {
                    if let Some(conn) = conns.get(&key) {
                        conn.send(&msg);
                    }
                }
                NodeAction::Change(change) => {
                    self.change_op.fire(|handler| handler(ErrorCode::Ok, Some(change)));
                }
            }
        }

        result
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancel_await_known_terminals_change();
        self.change_op.await_idle();
    }
}

/// Re-evaluates which instance-holding connections should currently carry a
/// subscription, based on interest from everywhere else.
fn refresh_subscriptions(reg: &mut NodeRegistry, tid: Id, actions: &mut Vec<NodeAction>) {
    let pattern = reg.pattern;
    if !pattern.subscribable() {
        return;
    }

    let (ident, subs_in, uses) = {
        let entry = match reg.terminals.get(tid) {
            Some(entry) if !entry.dying => entry,
            _ => return,
        };

        let uses: Vec<(usize, Id)> = entry
            .links
            .iter()
            .filter(|(_, link)| link.uses && link.id.valid())
            .map(|(&key, link)| (key, link.id))
            .collect();

        (entry.ident.clone(), entry.subs_in.clone(), uses)
    };

    for (conn, peer_id) in uses {
        let want = reg.interest_elsewhere(&ident, &subs_in, conn);
        let entry = reg.terminals.get_mut(tid).expect("Present above");
        let have = entry.sub_sent.contains(&conn);

        if want && !have {
            entry.sub_sent.insert(conn);
            actions.push(NodeAction::SendTo(
                conn,
                Message::new(pattern, Body::Subscribe { id: peer_id }),
            ));
        } else if !want && have {
            entry.sub_sent.remove(&conn);
            actions.push(NodeAction::SendTo(
                conn,
                Message::new(pattern, Body::Unsubscribe { id: peer_id }),
            ));
        }
    }
}

/// Drops mapping-only links to peers for whom the terminal no longer exists
/// anywhere else; such a mapping routes nothing.
fn refresh_links(reg: &mut NodeRegistry, tid: Id, actions: &mut Vec<NodeAction>) {
    let pattern = reg.pattern;
    let entry = match reg.terminals.get_mut(tid) {
        Some(entry) if !entry.dying => entry,
        _ => return,
    };

    let candidates: Vec<usize> = entry
        .links
        .iter()
        .filter(|(_, link)| !link.uses && !link.awaiting_ack && !link.pending_removal)
        .map(|(&conn, _)| conn)
        .collect();

    for conn in candidates {
        if entry.used_elsewhere(conn) {
            continue;
        }

        let link = entry.links.get_mut(&conn).expect("Candidate link present");
        if link.id.valid() {
            link.awaiting_ack = true;
            actions.push(NodeAction::SendTo(
                conn,
                Message::new(pattern, Body::TerminalRemoved { id: link.id }),
            ));
        } else {
            link.pending_removal = true;
        }
    }
}

/// The last instance of a terminal is gone: announce the removal to every
/// mapped peer, release the binding groups that pointed at it and retire the
/// entry once all acknowledgements are in.
fn kill_terminal(reg: &mut NodeRegistry, tid: Id, actions: &mut Vec<NodeAction>) {
    let pattern = reg.pattern;

    let ident = {
        let entry = match reg.terminals.get_mut(tid) {
            Some(entry) => entry,
            None => return,
        };

        entry.dying = true;
        entry.subs_in.clear();
        entry.sub_sent.clear();

        for (&conn, link) in entry.links.iter_mut() {
            if link.id.valid() {
                link.awaiting_ack = true;
                actions.push(NodeAction::SendTo(
                    conn,
                    Message::new(pattern, Body::TerminalRemoved { id: link.id }),
                ));
            } else {
                link.pending_removal = true;
            }
        }

        entry.ident.clone()
    };

    reg.ident_index.remove(&ident);

    if !ident.hidden() {
        actions.push(NodeAction::Change(KnownTerminalChange {
            pattern,
            identifier: ident.clone(),
            added: false,
        }));
    }

    if let Some(&gid) = reg.group_index.get(&ident) {
        if let Some(group) = reg.groups.get_mut(gid) {
            for (&conn, member) in group.members.iter_mut() {
                if member.established {
                    member.established = false;
                    actions.push(NodeAction::SendTo(
                        conn,
                        Message::new(pattern, Body::BindingReleased { id: member.remote_id }),
                    ));
                }
            }
        }
    }

    maybe_retire(reg, tid);
}

fn maybe_retire(reg: &mut NodeRegistry, tid: Id) {
    let retire = reg
        .terminals
        .get(tid)
        .map(|entry| entry.dying && entry.settled())
        .unwrap_or(false);

    if retire {
        reg.terminals.remove(tid);
    }
}

/// Re-evaluates the established bit of every group member pointing at this
/// terminal: established iff the terminal has an instance on a connection
/// other than the member's own. A freshly established edge receives the
/// cached payload where the pattern has one.
fn refresh_establishment(reg: &mut NodeRegistry, tid: Id, actions: &mut Vec<NodeAction>) {
    let pattern = reg.pattern;

    let (ident, cache, dying) = match reg.terminals.get(tid) {
        Some(entry) => (entry.ident.clone(), entry.cache.clone(), entry.dying),
        None => return,
    };

    if dying {
        return;
    }

    let gid = match reg.group_index.get(&ident) {
        Some(&gid) => gid,
        None => return,
    };

    let mut transitions = Vec::new();
    {
        let entry = reg.terminals.get(tid).expect("Present above");
        let group = match reg.groups.get_mut(gid) {
            Some(group) => group,
            None => return,
        };

        for (&conn, member) in group.members.iter_mut() {
            let want = entry.used_elsewhere(conn);
            if want != member.established {
                member.established = want;
                transitions.push((conn, member.remote_id, want));
            }
        }
    }

    for (conn, remote_id, established) in transitions {
        if established {
            actions.push(NodeAction::SendTo(
                conn,
                Message::new(pattern, Body::BindingEstablished { id: remote_id }),
            ));
            if let Some(cache) = cache.clone() {
                actions.push(NodeAction::SendTo(
                    conn,
                    Message::new(
                        pattern,
                        Body::CachedData {
                            id: remote_id,
                            payload: cache,
                        },
                    ),
                ));
            }
        } else {
            actions.push(NodeAction::SendTo(
                conn,
                Message::new(pattern, Body::BindingReleased { id: remote_id }),
            ));
        }
    }
}

/// Removes `conn` from relay pending sets with the given loss flag,
/// forwarding a synthesized Gather upstream for each affected operation.
/// With `only_terminal` set, only that terminal's relays are touched.
fn relay_loss(
    reg: &mut NodeRegistry,
    conn: usize,
    loss: GatherFlags,
    only_terminal: Option<Id>,
    actions: &mut Vec<NodeAction>,
) {
    let pattern = reg.pattern;
    let mut finished = Vec::new();

    for (&num, relay) in reg.relays.iter_mut() {
        if let Some(tid) = only_terminal {
            if relay.terminal != tid {
                continue;
            }
        }

        if !relay.pending.remove(&conn) {
            continue;
        }

        let mut flags = loss;
        if relay.pending.is_empty() {
            flags |= GatherFlags::FINISHED;
            finished.push(num);
        }

        actions.push(NodeAction::SendTo(
            relay.origin,
            Message::new(
                pattern,
                Body::Gather {
                    operation: relay.origin_op,
                    flags,
                    payload: Vec::new(),
                },
            ),
        ));
    }

    for num in finished {
        reg.relays.remove(&num);
    }
}

// Inbound protocol handling. Every id in an inbound message is in this
// node's numbering; every id in an outbound message is translated to the
// receiver's numbering first.
impl Node {
    fn on_terminal_description(
        state: &mut NodeState,
        actions: &mut Vec<NodeAction>,
        pattern: Pattern,
        origin: usize,
        ident: Identifier,
        peer_id: Id,
    ) {
        let node_peers = state.node_peers();
        let reg = &mut state.registries[pattern.index()];

        let tid = match reg.ident_index.get(&ident).copied() {
            None => {
                let mut entry = KnownTerminal::new(ident.clone());
                entry.links.insert(
                    origin,
                    PeerLink {
                        id: peer_id,
                        uses: true,
                        pending_removal: false,
                        awaiting_ack: false,
                    },
                );

                let tid = reg.terminals.insert(entry);
                reg.ident_index.insert(ident.clone(), tid);

                actions.push(NodeAction::SendTo(
                    origin,
                    Message::new(pattern, Body::TerminalMapping { peer_id, my_id: tid }),
                ));

                if !ident.hidden() {
                    actions.push(NodeAction::Change(KnownTerminalChange {
                        pattern,
                        identifier: ident.clone(),
                        added: true,
                    }));
                }

                tid
            }
            Some(tid) => {
                let entry = match reg.terminals.get_mut(tid) {
                    Some(entry) => entry,
                    None => return,
                };

                let link = entry.links.entry(origin).or_insert_with(PeerLink::pending_mapping);
                link.id = peer_id;
                link.uses = true;

                actions.push(NodeAction::SendTo(
                    origin,
                    Message::new(pattern, Body::TerminalMapping { peer_id, my_id: tid }),
                ));

                tid
            }
        };

        // Propagate existence to the other routing hubs.
        {
            let entry = reg.terminals.get_mut(tid).expect("Resolved above");
            for peer in node_peers {
                if peer != origin && !entry.links.contains_key(&peer) {
                    entry.links.insert(peer, PeerLink::pending_mapping());
                    actions.push(NodeAction::SendTo(
                        peer,
                        Message::new(
                            pattern,
                            Body::TerminalDescription {
                                identifier: entry.ident.clone(),
                                my_id: tid,
                            },
                        ),
                    ));
                }
            }
        }

        refresh_establishment(reg, tid, actions);
        refresh_subscriptions(reg, tid, actions);
    }

    fn on_terminal_mapping(
        state: &mut NodeState,
        actions: &mut Vec<NodeAction>,
        pattern: Pattern,
        origin: usize,
        my_id: Id,
        peer_id: Id,
    ) {
        let reg = &mut state.registries[pattern.index()];

        if let Some(entry) = reg.terminals.get_mut(my_id) {
            if let Some(link) = entry.links.get_mut(&origin) {
                link.id = peer_id;

                if link.pending_removal {
                    // The terminal vanished before the peer's mapping
                    // arrived; complete the removal now.
                    link.pending_removal = false;
                    link.awaiting_ack = true;
                    actions.push(NodeAction::SendTo(
                        origin,
                        Message::new(pattern, Body::TerminalRemoved { id: peer_id }),
                    ));
                }
            }
        }

        refresh_subscriptions(reg, my_id, actions);
    }

    fn on_terminal_removed(
        state: &mut NodeState,
        actions: &mut Vec<NodeAction>,
        pattern: Pattern,
        origin: usize,
        my_id: Id,
    ) {
        let origin_is_node = state
            .conns
            .get(&origin)
            .map(|entry| entry.is_node)
            .unwrap_or(false);
        let reg = &mut state.registries[pattern.index()];

        // The scatter relays this peer originated through the terminal are
        // dropped; late gathers will find no operation and are swallowed.
        reg.relays
            .retain(|_, relay| !(relay.origin == origin && relay.terminal == my_id));

        let dead = {
            let entry = match reg.terminals.get_mut(my_id) {
                Some(entry) => entry,
                None => return,
            };

            let peer_id = match entry.links.get(&origin) {
                Some(link) => link.id,
                None => return,
            };

            actions.push(NodeAction::SendTo(
                origin,
                Message::new(pattern, Body::TerminalRemovedAck { id: peer_id }),
            ));

            // A leaf's id dies with its instance; a hub keeps the same
            // registry id as long as the terminal exists anywhere, so its
            // link degrades to a plain mapping.
            if origin_is_node {
                if let Some(link) = entry.links.get_mut(&origin) {
                    link.uses = false;
                }
            } else {
                entry.links.remove(&origin);
            }
            entry.sub_sent.remove(&origin);

            !entry.dying && entry.use_count() == 0
        };

        if dead {
            // The remover initiated this; no removal announcement is owed
            // back to it.
            if let Some(entry) = reg.terminals.get_mut(my_id) {
                entry.links.remove(&origin);
            }
            kill_terminal(reg, my_id, actions);
        } else {
            refresh_links(reg, my_id, actions);
            refresh_establishment(reg, my_id, actions);
            refresh_subscriptions(reg, my_id, actions);
            maybe_retire(reg, my_id);
        }
    }

    fn on_terminal_removed_ack(state: &mut NodeState, pattern: Pattern, origin: usize, my_id: Id) {
        let reg = &mut state.registries[pattern.index()];

        if let Some(entry) = reg.terminals.get_mut(my_id) {
            let acked = entry
                .links
                .get(&origin)
                .map(|link| link.awaiting_ack)
                .unwrap_or(false);
            if acked {
                entry.links.remove(&origin);
            }
        }

        maybe_retire(reg, my_id);
    }

    fn on_binding_description(
        state: &mut NodeState,
        actions: &mut Vec<NodeAction>,
        pattern: Pattern,
        origin: usize,
        ident: Identifier,
        peer_id: Id,
    ) {
        let reg = &mut state.registries[pattern.index()];

        let gid = match reg.group_index.get(&ident).copied() {
            Some(gid) => gid,
            None => {
                let gid = reg.groups.insert(BindingGroup {
                    ident: ident.clone(),
                    members: IndexMap::new(),
                });
                reg.group_index.insert(ident.clone(), gid);
                gid
            }
        };

        let established = reg
            .ident_index
            .get(&ident)
            .and_then(|&tid| reg.terminals.get(tid))
            .map(|entry| !entry.dying && entry.used_elsewhere(origin))
            .unwrap_or(false);

        if let Some(group) = reg.groups.get_mut(gid) {
            group.members.insert(
                origin,
                GroupMember {
                    remote_id: peer_id,
                    established,
                },
            );
        }

        actions.push(NodeAction::SendTo(
            origin,
            Message::new(pattern, Body::BindingMapping { peer_id, my_id: gid }),
        ));

        if established {
            actions.push(NodeAction::SendTo(
                origin,
                Message::new(pattern, Body::BindingEstablished { id: peer_id }),
            ));

            if pattern.cached() {
                let cache = reg
                    .ident_index
                    .get(&ident)
                    .and_then(|&tid| reg.terminals.get(tid))
                    .and_then(|entry| entry.cache.clone());
                if let Some(cache) = cache {
                    actions.push(NodeAction::SendTo(
                        origin,
                        Message::new(
                            pattern,
                            Body::CachedData {
                                id: peer_id,
                                payload: cache,
                            },
                        ),
                    ));
                }
            }
        }

        if let Some(&tid) = reg.ident_index.get(&ident) {
            refresh_subscriptions(reg, tid, actions);
        }
    }

    fn on_binding_removed(
        state: &mut NodeState,
        actions: &mut Vec<NodeAction>,
        pattern: Pattern,
        origin: usize,
        my_id: Id,
    ) {
        let reg = &mut state.registries[pattern.index()];

        let ident = {
            let group = match reg.groups.get_mut(my_id) {
                Some(group) => group,
                None => return,
            };

            let member = match group.members.remove(&origin) {
                Some(member) => member,
                None => return,
            };

            actions.push(NodeAction::SendTo(
                origin,
                Message::new(pattern, Body::BindingRemovedAck { id: member.remote_id }),
            ));

            let ident = group.ident.clone();
            if group.members.is_empty() {
                reg.group_index.remove(&ident);
                reg.groups.remove(my_id);
            }
            ident
        };

        if let Some(&tid) = reg.ident_index.get(&ident) {
            relay_loss(reg, origin, GatherFlags::BINDING_DESTROYED, Some(tid), actions);
            refresh_subscriptions(reg, tid, actions);
        }
    }

    fn on_subscribe(
        state: &mut NodeState,
        actions: &mut Vec<NodeAction>,
        pattern: Pattern,
        origin: usize,
        my_id: Id,
        subscribed: bool,
    ) {
        let reg = &mut state.registries[pattern.index()];

        {
            let entry = match reg.terminals.get_mut(my_id) {
                Some(entry) if !entry.dying => entry,
                _ => return,
            };

            if subscribed {
                entry.subs_in.insert(origin);

                // A fresh subscriber receives the cached payload first.
                if pattern.cached() {
                    if let Some(cache) = entry.cache.clone() {
                        let peer_id = entry.links.get(&origin).map(|l| l.id).unwrap_or(Id::NONE);
                        if peer_id.valid() {
                            actions.push(NodeAction::SendTo(
                                origin,
                                Message::new(
                                    pattern,
                                    Body::CachedData {
                                        id: peer_id,
                                        payload: cache,
                                    },
                                ),
                            ));
                        }
                    }
                }
            } else {
                entry.subs_in.remove(&origin);
            }
        }

        if !subscribed {
            relay_loss(reg, origin, GatherFlags::BINDING_DESTROYED, Some(my_id), actions);
        }

        refresh_subscriptions(reg, my_id, actions);
    }

    fn on_data(
        state: &mut NodeState,
        actions: &mut Vec<NodeAction>,
        pattern: Pattern,
        origin: usize,
        my_id: Id,
        payload: Vec<u8>,
        cached: bool,
    ) {
        let reg = &mut state.registries[pattern.index()];

        let ident = {
            let entry = match reg.terminals.get_mut(my_id) {
                Some(entry) if !entry.dying => entry,
                _ => return,
            };

            if pattern.cached() {
                entry.cache = Some(payload.clone());
            }

            entry.ident.clone()
        };

        let make_body = |id: Id, payload: Vec<u8>| {
            if cached {
                Body::CachedData { id, payload }
            } else {
                Body::Data { id, payload }
            }
        };

        if let Some(group) = reg.group_index.get(&ident).and_then(|&gid| reg.groups.get(gid)) {
            for (&conn, member) in group.members.iter() {
                if conn != origin && member.established {
                    actions.push(NodeAction::SendTo(
                        conn,
                        Message::new(pattern, make_body(member.remote_id, payload.clone())),
                    ));
                }
            }
        }

        let entry = reg.terminals.get(my_id).expect("Present above");
        for &peer in entry.subs_in.iter() {
            if peer == origin {
                continue;
            }
            if let Some(link) = entry.links.get(&peer) {
                if link.id.valid() {
                    actions.push(NodeAction::SendTo(
                        peer,
                        Message::new(pattern, make_body(link.id, payload.clone())),
                    ));
                }
            }
        }
    }

    fn on_scatter(
        state: &mut NodeState,
        actions: &mut Vec<NodeAction>,
        pattern: Pattern,
        origin: usize,
        my_id: Id,
        origin_op: Id,
        payload: Vec<u8>,
    ) {
        let reg = &mut state.registries[pattern.index()];
        let my_op_num = reg.next_op;
        let my_op = Id::new(my_op_num);

        let mut pending = IndexSet::new();
        {
            let entry = match reg.terminals.get(my_id) {
                Some(entry) if !entry.dying => entry,
                _ => return,
            };

            if let Some(group) = reg.group_index.get(&entry.ident).and_then(|&gid| reg.groups.get(gid)) {
                for (&conn, member) in group.members.iter() {
                    if conn != origin && member.established {
                        pending.insert(conn);
                        actions.push(NodeAction::SendTo(
                            conn,
                            Message::new(
                                pattern,
                                Body::Scatter {
                                    target: member.remote_id,
                                    operation: my_op,
                                    payload: payload.clone(),
                                },
                            ),
                        ));
                    }
                }
            }

            for &peer in entry.subs_in.iter() {
                if peer == origin || pending.contains(&peer) {
                    continue;
                }
                if let Some(link) = entry.links.get(&peer) {
                    if link.id.valid() {
                        pending.insert(peer);
                        actions.push(NodeAction::SendTo(
                            peer,
                            Message::new(
                                pattern,
                                Body::Scatter {
                                    target: link.id,
                                    operation: my_op,
                                    payload: payload.clone(),
                                },
                            ),
                        ));
                    }
                }
            }
        }

        if pending.is_empty() {
            // Interest vanished under the scatterer's feet; account the
            // operation with a single terminating response.
            actions.push(NodeAction::SendTo(
                origin,
                Message::new(
                    pattern,
                    Body::Gather {
                        operation: origin_op,
                        flags: GatherFlags::BINDING_DESTROYED | GatherFlags::FINISHED,
                        payload: Vec::new(),
                    },
                ),
            ));
            return;
        }

        reg.next_op += 1;
        reg.relays.insert(
            my_op_num,
            RelayOp {
                origin,
                origin_op,
                terminal: my_id,
                pending,
            },
        );
    }

    /// Gathers stream back towards the scatterer; FINISHED is masked off
    /// until the last pending recipient reports in.
    fn on_gather(
        state: &mut NodeState,
        actions: &mut Vec<NodeAction>,
        pattern: Pattern,
        origin: usize,
        my_op: Id,
        flags: GatherFlags,
        payload: Vec<u8>,
    ) {
        let reg = &mut state.registries[pattern.index()];

        let relay = match reg.relays.get_mut(&my_op.number()) {
            Some(relay) => relay,
            None => return,
        };

        if !relay.pending.contains(&origin) {
            return;
        }

        let mut out_flags = flags;
        let mut done = false;
        if flags.contains(GatherFlags::FINISHED) {
            relay.pending.remove(&origin);
            if relay.pending.is_empty() {
                done = true;
            } else {
                out_flags = flags.without(GatherFlags::FINISHED);
            }
        }

        actions.push(NodeAction::SendTo(
            relay.origin,
            Message::new(
                pattern,
                Body::Gather {
                    operation: relay.origin_op,
                    flags: out_flags,
                    payload,
                },
            ),
        ));

        if done {
            reg.relays.remove(&my_op.number());
        }
    }
}

impl Communicator for Node {
    fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.scheduler.clone()
    }

    fn communicator_is_node(&self) -> bool {
        true
    }

    fn on_new_connection(&self, _conn: &ConnectionRef) -> Result<()> {
        Ok(())
    }

    /// Registers the connection and describes every known terminal to a
    /// node peer; leaves learn about terminals through binding state.
    fn on_connection_started(&self, conn: &ConnectionRef) -> Result<()> {
        let is_node = conn.remote_is_node()?;
        let key = connection_key(conn);

        self.with_state(|state, actions| {
            state.conns.insert(
                key,
                ConnEntry {
                    conn: Arc::downgrade(conn),
                    is_node,
                },
            );

            if is_node {
                for reg in state.registries.iter_mut() {
                    let pattern = reg.pattern;
                    for (tid, entry) in reg.terminals.iter_mut() {
                        if entry.dying {
                            continue;
                        }

                        entry.links.insert(key, PeerLink::pending_mapping());
                        actions.push(NodeAction::SendTo(
                            key,
                            Message::new(
                                pattern,
                                Body::TerminalDescription {
                                    identifier: entry.ident.clone(),
                                    my_id: tid,
                                },
                            ),
                        ));
                    }
                }
            }

            Ok(())
        })
    }

    fn on_connection_destroyed(&self, conn: &ConnectionRef) {
        let key = connection_key(conn);

        self.with_state(|state, actions| {
            state.conns.remove(&key);

            for reg in state.registries.iter_mut() {
                // Relays: a lost origin swallows the operation; a lost
                // recipient is accounted with CONNECTION_LOST.
                reg.relays.retain(|_, relay| relay.origin != key);
                relay_loss(reg, key, GatherFlags::CONNECTION_LOST, None, actions);

                // The peer's binding group memberships disappear with it.
                let empty_groups: Vec<Id> = reg
                    .groups
                    .iter_mut()
                    .filter_map(|(gid, group)| {
                        group.members.remove(&key);
                        if group.members.is_empty() {
                            Some(gid)
                        } else {
                            None
                        }
                    })
                    .collect();
                for gid in empty_groups {
                    let ident = reg.groups.get(gid).expect("Just collected").ident.clone();
                    reg.group_index.remove(&ident);
                    reg.groups.remove(gid);
                }

                let tids: Vec<Id> = reg.terminals.iter().map(|(tid, _)| tid).collect();
                for tid in tids {
                    let (had_link, dead) = {
                        let entry = match reg.terminals.get_mut(tid) {
                            Some(entry) => entry,
                            None => continue,
                        };

                        let had_link = entry.links.remove(&key).is_some();
                        entry.subs_in.remove(&key);
                        entry.sub_sent.remove(&key);

                        (had_link, !entry.dying && entry.use_count() == 0)
                    };

                    if dead {
                        kill_terminal(reg, tid, actions);
                    } else {
                        if had_link {
                            refresh_links(reg, tid, actions);
                        }
                        refresh_establishment(reg, tid, actions);
                        refresh_subscriptions(reg, tid, actions);
                        maybe_retire(reg, tid);
                    }
                }
            }
        });

        logging::debug!(self.log, "node connection destroyed"; "conn" => key);
    }

    fn on_message_received(&self, msg: Message, origin: &ConnectionRef) -> Result<()> {
        let pattern = msg.pattern;
        let key = connection_key(origin);

        self.with_state(|state, actions| {
            match msg.body {
                Body::TerminalDescription { identifier, my_id } => {
                    Self::on_terminal_description(state, actions, pattern, key, identifier, my_id);
                }
                Body::TerminalMapping { peer_id, my_id } => {
                    Self::on_terminal_mapping(state, actions, pattern, key, peer_id, my_id);
                }
                Body::TerminalNoticed { .. } => {}
                Body::TerminalRemoved { id } => {
                    Self::on_terminal_removed(state, actions, pattern, key, id);
                }
                Body::TerminalRemovedAck { id } => {
                    Self::on_terminal_removed_ack(state, pattern, key, id);
                }
                Body::BindingDescription { identifier, my_id } => {
                    Self::on_binding_description(state, actions, pattern, key, identifier, my_id);
                }
                Body::BindingMapping { .. } | Body::BindingNoticed { .. } => {}
                Body::BindingRemoved { id } => {
                    Self::on_binding_removed(state, actions, pattern, key, id);
                }
                Body::BindingRemovedAck { .. } => {}
                Body::BindingEstablished { .. } | Body::BindingReleased { .. } => {}
                Body::Subscribe { id } => {
                    Self::on_subscribe(state, actions, pattern, key, id, true);
                }
                Body::Unsubscribe { id } => {
                    Self::on_subscribe(state, actions, pattern, key, id, false);
                }
                Body::Data { id, payload } => {
                    Self::on_data(state, actions, pattern, key, id, payload, false);
                }
                Body::CachedData { id, payload } => {
                    Self::on_data(state, actions, pattern, key, id, payload, true);
                }
                Body::Scatter {
                    target,
                    operation,
                    payload,
                } => {
                    Self::on_scatter(state, actions, pattern, key, target, operation, payload);
                }
                Body::Gather {
                    operation,
                    flags,
                    payload,
                } => {
                    Self::on_gather(state, actions, pattern, key, operation, flags, payload);
                }
            }

            Ok(())
        })
    }
}
