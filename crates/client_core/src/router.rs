use shared::protocol::ServerPush;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const PUSH_CHANNEL_CAPACITY: usize = 1024;

/// Fan-out point for server-initiated events.
///
/// Every subscriber gets its own receiver and sees pushes in the order the
/// transport received them. The router does not deduplicate delivery;
/// handlers are expected to be idempotent.
#[derive(Clone)]
pub struct PushRouter {
    tx: broadcast::Sender<ServerPush>,
}

impl PushRouter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(PUSH_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerPush> {
        self.tx.subscribe()
    }

    pub fn stream(&self) -> BroadcastStream<ServerPush> {
        BroadcastStream::new(self.tx.subscribe())
    }

    pub(crate) fn publish(&self, event: ServerPush) {
        let _ = self.tx.send(event);
    }
}

impl Default for PushRouter {
    fn default() -> Self {
        Self::new()
    }
}
