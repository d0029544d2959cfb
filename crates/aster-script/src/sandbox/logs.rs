//! Captured console output

use std::sync::Arc;

use parking_lot::Mutex;

/// Append-only log lines of one execution
///
/// Cloning shares the buffer, so the executor keeps a handle that survives
/// a timed-out script.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: Arc<Mutex<Vec<String>>>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            max_entries,
        }
    }

    /// Append a line; returns false once the buffer is full
    pub fn push(&self, line: String) -> bool {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_entries {
            return false;
        }
        entries.push(line);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_preserves_order() {
        let logs = LogBuffer::new(10);
        assert!(logs.push("Hello".to_string()));
        assert!(logs.push("World".to_string()));
        assert_eq!(logs.snapshot(), vec!["Hello", "World"]);
    }

    #[test]
    fn test_limit() {
        let logs = LogBuffer::new(1);
        assert!(logs.push("a".to_string()));
        assert!(!logs.push("b".to_string()));
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn test_clones_share_entries() {
        let logs = LogBuffer::new(10);
        let handle = logs.clone();
        logs.push("shared".to_string());
        assert_eq!(handle.snapshot(), vec!["shared"]);
        assert!(!handle.is_empty());
    }
}
