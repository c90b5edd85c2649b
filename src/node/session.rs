use dashmap::DashMap;

/// Remembers which session a host handed out last so a later connect can
/// ask to resume it.
pub trait SessionStore: Send + Sync {
    fn get(&self, host: &str) -> Option<String>;
    fn set(&self, host: &str, session_id: &str);
    fn delete(&self, host: &str);
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, String>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, host: &str) -> Option<String> {
        self.sessions.get(host).map(|entry| entry.value().clone())
    }

    fn set(&self, host: &str, session_id: &str) {
        self.sessions.insert(host.to_string(), session_id.to_string());
    }

    fn delete(&self, host: &str) {
        self.sessions.remove(host);
    }
}
