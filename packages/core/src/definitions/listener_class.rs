/// How a unit listens for RF traffic, which decides when the scheduler may
/// hand it messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerClass {
    /// Mains powered, radio always on. Messages go out immediately.
    #[default]
    AlwaysOn,
    /// Wakes up on a beam. Sends work but need the longer beaming ACK window.
    FrequentListener,
    /// Battery powered, radio off. Traffic parks until a wakeup notification.
    Sleeper,
}

impl ListenerClass {
    pub fn is_listening(&self) -> bool {
        !matches!(self, ListenerClass::Sleeper)
    }
}
