use std::collections::HashMap;

/// Channel id -> symbol bindings for the current feed connection.
///
/// Channel ids are only meaningful within one connection; the owner resets the
/// tracker whenever the connection goes away.
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    channels: HashMap<u64, String>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `chan_id` to `symbol`, replacing any previous binding for that id.
    pub fn record(&mut self, chan_id: u64, symbol: impl Into<String>) {
        self.channels.insert(chan_id, symbol.into());
    }

    pub fn resolve(&self, chan_id: u64) -> Option<&str> {
        self.channels.get(&chan_id).map(String::as_str)
    }

    /// True when every target symbol is bound to some channel.
    pub fn is_complete<S: AsRef<str>>(&self, targets: &[S]) -> bool {
        targets
            .iter()
            .all(|t| self.channels.values().any(|s| s == t.as_ref()))
    }

    pub fn missing<'a, S: AsRef<str>>(&self, targets: &'a [S]) -> Vec<&'a str> {
        targets
            .iter()
            .map(|t| t.as_ref())
            .filter(|t| !self.channels.values().any(|s| s == t))
            .collect()
    }

    pub fn reset(&mut self) {
        self.channels.clear();
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
