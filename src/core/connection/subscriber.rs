use crate::core::connection::state::ConnectionState;
use crate::core::record::Record;
use crate::domain::error::ErrorInfo;
use tokio::sync::mpsc;

/// Consumer of a connection manager's output.
///
/// Callbacks run on the manager's driver task, one at a time and in
/// registration order. They must not block or call back into the manager;
/// hand work off to a channel or task instead.
pub trait Subscriber: Send + Sync {
    fn on_record(&self, record: &Record);

    fn on_state_change(&self, state: ConnectionState, error: Option<&ErrorInfo>);

    /// Problems that do not change the state: dropped writes, framing errors
    fn on_error(&self, _error: &ErrorInfo) {}
}

/// Handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionToken(pub(crate) u64);

impl SubscriptionToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Owned form of every subscriber callback
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Record(Record),
    State {
        state: ConnectionState,
        error: Option<ErrorInfo>,
    },
    Error(ErrorInfo),
}

/// Subscriber that forwards callbacks into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
    sender: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Subscriber for ChannelSubscriber {
    fn on_record(&self, record: &Record) {
        let _ = self.sender.send(ConnectionEvent::Record(record.clone()));
    }

    fn on_state_change(&self, state: ConnectionState, error: Option<&ErrorInfo>) {
        let _ = self.sender.send(ConnectionEvent::State {
            state,
            error: error.cloned(),
        });
    }

    fn on_error(&self, error: &ErrorInfo) {
        let _ = self.sender.send(ConnectionEvent::Error(error.clone()));
    }
}
