pub mod local;
pub mod tcp;

use crate::errors::Result;
use crate::msg::Message;
use crate::scheduling::Scheduler;

use std::sync::{Arc, Weak};

/// One end of a bidirectional link as seen by the communicator attached to
/// it. Sending never reports failure; a dead link swallows messages and the
/// loss surfaces through the connection's own death notification.
pub trait Connection: Send + Sync {
    fn send(&self, msg: &Message);

    /// Whether the communicator on the far side is a node. Not known until
    /// the link is ready (`NotReady` before that).
    fn remote_is_node(&self) -> Result<bool>;

    fn description(&self) -> String;
    fn remote_version(&self) -> String;
    fn remote_identification(&self) -> Vec<u8>;
}

pub type ConnectionRef = Arc<dyn Connection>;
pub type WeakConnectionRef = Weak<dyn Connection>;

/// Identity key for a connection end. Stable for the lifetime of the
/// underlying link object; used by nodes to index their routing state.
#[inline]
pub(crate) fn connection_key(conn: &ConnectionRef) -> usize {
    Arc::as_ptr(conn) as *const () as usize
}

/// A leaf or a node. Connections call in through this interface only.
pub trait Communicator: Send + Sync {
    fn scheduler(&self) -> Arc<dyn Scheduler>;

    /// True for nodes; exchanged as the communicator-type byte on TCP links.
    fn communicator_is_node(&self) -> bool;

    fn on_new_connection(&self, conn: &ConnectionRef) -> Result<()>;
    fn on_connection_started(&self, conn: &ConnectionRef) -> Result<()>;
    fn on_connection_destroyed(&self, conn: &ConnectionRef);
    fn on_message_received(&self, msg: Message, origin: &ConnectionRef) -> Result<()>;
}

pub type CommunicatorRef = Arc<dyn Communicator>;
