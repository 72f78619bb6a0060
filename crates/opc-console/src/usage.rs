use std::collections::HashMap;

/// Bytes received from screenshot fetches, globally and per session.
///
/// The global total survives closing a session; only `reset` clears it.
#[derive(Debug, Default, Clone)]
pub struct NetworkUsage {
    total: u64,
    per_session: HashMap<String, u64>,
}

impl NetworkUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, session: &str, bytes: u64) {
        self.total = self.total.saturating_add(bytes);
        let entry = self.per_session.entry(session.to_string()).or_insert(0);
        *entry = entry.saturating_add(bytes);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn session(&self, session: &str) -> u64 {
        self.per_session.get(session).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, session: &str) {
        self.per_session.remove(session);
    }

    pub fn reset(&mut self) {
        self.total = 0;
        self.per_session.clear();
    }
}
