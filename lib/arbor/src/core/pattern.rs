/// The nine messaging patterns the fabric multiplexes over one link. Each
/// pattern has its own id space for terminals and bindings and its own block
/// of message type-ids; a leaf or node instantiates one registry per pattern.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Pattern {
    DeafMute = 0,
    PublishSubscribe = 1,
    ScatterGather = 2,
    CachedPublishSubscribe = 3,
    ProducerConsumer = 4,
    CachedProducerConsumer = 5,
    MasterSlave = 6,
    CachedMasterSlave = 7,
    ServiceClient = 8,
}

pub const PATTERN_COUNT: usize = 9;

impl Pattern {
    pub const ALL: [Pattern; PATTERN_COUNT] = [
        Pattern::DeafMute,
        Pattern::PublishSubscribe,
        Pattern::ScatterGather,
        Pattern::CachedPublishSubscribe,
        Pattern::ProducerConsumer,
        Pattern::CachedProducerConsumer,
        Pattern::MasterSlave,
        Pattern::CachedMasterSlave,
        Pattern::ServiceClient,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Pattern> {
        Pattern::ALL.get(index).copied()
    }

    /// Whether peers express interest through Subscribe/Unsubscribe. Only
    /// deaf-mute terminals are excluded; they carry no traffic to subscribe
    /// to.
    #[inline]
    pub fn subscribable(self) -> bool {
        self != Pattern::DeafMute
    }

    /// Whether the pattern exchanges Data messages.
    #[inline]
    pub fn data_bearing(self) -> bool {
        match self {
            Pattern::PublishSubscribe
            | Pattern::CachedPublishSubscribe
            | Pattern::ProducerConsumer
            | Pattern::CachedProducerConsumer
            | Pattern::MasterSlave
            | Pattern::CachedMasterSlave => true,
            _ => false,
        }
    }

    /// Whether terminals retain the last payload for late subscribers.
    #[inline]
    pub fn cached(self) -> bool {
        match self {
            Pattern::CachedPublishSubscribe
            | Pattern::CachedProducerConsumer
            | Pattern::CachedMasterSlave => true,
            _ => false,
        }
    }

    /// Whether the pattern exchanges Scatter/Gather messages.
    #[inline]
    pub fn scatter_bearing(self) -> bool {
        self == Pattern::ScatterGather || self == Pattern::ServiceClient
    }

    /// Master/slave patterns echo data received by a visible (master)
    /// terminal back out so it reaches the other slaves.
    #[inline]
    pub fn echoes_on_visible(self) -> bool {
        self == Pattern::MasterSlave || self == Pattern::CachedMasterSlave
    }

    pub fn name(self) -> &'static str {
        match self {
            Pattern::DeafMute => "deaf-mute",
            Pattern::PublishSubscribe => "publish-subscribe",
            Pattern::ScatterGather => "scatter-gather",
            Pattern::CachedPublishSubscribe => "cached-publish-subscribe",
            Pattern::ProducerConsumer => "producer-consumer",
            Pattern::CachedProducerConsumer => "cached-producer-consumer",
            Pattern::MasterSlave => "master-slave",
            Pattern::CachedMasterSlave => "cached-master-slave",
            Pattern::ServiceClient => "service-client",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        for pattern in Pattern::ALL.iter() {
            assert_eq!(Some(*pattern), Pattern::from_index(pattern.index()));
        }
        assert_eq!(None, Pattern::from_index(PATTERN_COUNT));
    }

    #[test]
    fn test_capabilities() {
        assert!(!Pattern::DeafMute.subscribable());
        assert!(Pattern::ScatterGather.subscribable());
        assert!(!Pattern::ScatterGather.data_bearing());
        assert!(Pattern::ServiceClient.scatter_bearing());
        assert!(Pattern::CachedMasterSlave.cached());
        assert!(Pattern::CachedMasterSlave.echoes_on_visible());
        assert!(!Pattern::ProducerConsumer.echoes_on_visible());
    }
}
