use crate::base::async_op::AsyncOperation;
use crate::core::leaf::Leaf;
use crate::core::pattern::Pattern;
use crate::errors::{ErrorCode, Result};
use crate::identity::Id;

use std::sync::{Arc, Mutex};

/// A binding is released until at least one remote terminal matches its
/// target name and signature.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BindingState {
    Released,
    Established,
}

type StateHandler = Box<dyn FnOnce(ErrorCode, BindingState) + Send>;

/// State shared between a binding handle and the leaf logic that drives it.
pub(crate) struct BindingCore {
    state: Mutex<BindingState>,
    await_change_op: AsyncOperation<StateHandler>,
}

impl BindingCore {
    pub fn new() -> Arc<BindingCore> {
        Arc::new(BindingCore {
            state: Mutex::new(BindingState::Released),
            await_change_op: AsyncOperation::new(),
        })
    }

    pub fn state(&self) -> BindingState {
        *self.state.lock().unwrap()
    }

    /// Records a transition and fires the armed state-change handler.
    pub fn publish_state(&self, state: BindingState) {
        *self.state.lock().unwrap() = state;
        self.await_change_op.fire(|handler| handler(ErrorCode::Ok, state));
    }

    pub fn arm_await_change(&self, handler: StateHandler) -> Result<()> {
        self.await_change_op.arm(handler)
    }

    pub fn cancel_await_change(&self) {
        self.await_change_op
            .fire(|handler| handler(ErrorCode::Canceled, BindingState::Released));
    }
}

/// Owned relation from a local terminal to a remote target name with the
/// same signature. Destroying the handle retires the relation; the local id
/// is announced as removed to the peer and recycled once acknowledged.
pub struct Binding {
    leaf: Arc<Leaf>,
    pattern: Pattern,
    group: Id,
    member: u64,
    core: Arc<BindingCore>,
}

impl Binding {
    pub(crate) fn new(
        leaf: Arc<Leaf>,
        pattern: Pattern,
        group: Id,
        member: u64,
        core: Arc<BindingCore>,
    ) -> Binding {
        Binding {
            leaf,
            pattern,
            group,
            member,
            core,
        }
    }

    /// The binding group's local id; the unit the mapping protocol talks
    /// about. Bindings with identical targets share one group.
    pub fn group_id(&self) -> Id {
        self.group
    }

    pub fn state(&self) -> BindingState {
        self.core.state()
    }

    /// Delivers the current state through a posted handler.
    pub fn async_get_state<F>(&self, handler: F)
    where
        F: FnOnce(ErrorCode, BindingState) + Send + 'static,
    {
        let core = self.core.clone();
        self.leaf.scheduler().post(Box::new(move || {
            handler(ErrorCode::Ok, core.state());
        }));
    }

    /// Arms a single-shot handler fired on the next establish/release
    /// transition.
    pub fn async_await_state_change<F>(&self, handler: F) -> Result<()>
    where
        F: FnOnce(ErrorCode, BindingState) + Send + 'static,
    {
        self.core.arm_await_change(Box::new(handler))
    }

    pub fn cancel_await_state_change(&self) {
        self.core.cancel_await_change();
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.core.cancel_await_change();
        self.leaf.destroy_binding(self.pattern, self.group, self.member);
    }
}
