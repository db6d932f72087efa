//! Per-issue conversational memory.

use std::collections::HashMap;

use smith_ai::Message;

/// Append-only message log keyed by thread identifier (the issue number),
/// so follow-up re-processing of an issue shares conversational context
/// with the original run. Injected into the engine, never ambient.
#[derive(Debug, Default)]
pub struct SessionStore {
    threads: HashMap<String, Vec<Message>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, thread_id: &str) -> Vec<Message> {
        self.threads.get(thread_id).cloned().unwrap_or_default()
    }

    pub fn append(&mut self, thread_id: &str, messages: impl IntoIterator<Item = Message>) {
        self.threads
            .entry(thread_id.to_string())
            .or_default()
            .extend(messages);
    }

    pub fn thread_len(&self, thread_id: &str) -> usize {
        self.threads.get(thread_id).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::SessionStore;
    use smith_ai::Message;

    #[test]
    fn unit_append_accumulates_per_thread() {
        let mut store = SessionStore::new();
        store.append("91", vec![Message::user("first")]);
        store.append("91", vec![Message::assistant_text("done")]);
        store.append("92", vec![Message::user("other thread")]);

        assert_eq!(store.thread_len("91"), 2);
        assert_eq!(store.thread_len("92"), 1);
        assert_eq!(store.history("91")[1].text_content(), "done");
        assert!(store.history("unknown").is_empty());
    }
}
