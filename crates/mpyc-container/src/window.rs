//! Most-recently-used window of qstrs shared by the writer and the reader.
//!
//! Both sides apply the same sequence of pushes and accesses, so a string
//! can be replaced by its current index once it has been seen.

use std::collections::VecDeque;

use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QstrWindow {
    entries: VecDeque<String>,
    size: usize,
}

impl QstrWindow {
    /// Create an empty window. `size` may come from an untrusted header, so
    /// nothing is reserved up front.
    pub fn new(size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a newly transmitted string at the front, evicting the oldest.
    pub fn push(&mut self, value: &str) {
        trace!(qstr = value, "window push");
        if self.size == 0 {
            return;
        }
        if self.entries.len() == self.size {
            self.entries.pop_back();
        }
        self.entries.push_front(value.to_string());
    }

    /// Take the entry at `index` and move it to the front.
    pub fn access(&mut self, index: usize) -> Option<&str> {
        trace!(index, "window access");
        let value = self.entries.remove(index)?;
        self.entries.push_front(value);
        self.entries.front().map(String::as_str)
    }

    /// Current index of `value`, if it is in the window.
    pub fn position(&self, value: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry == value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(window: &QstrWindow) -> Vec<&str> {
        window.entries.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut window = QstrWindow::new(2);
        window.push("a");
        window.push("b");
        window.push("c");
        assert_eq!(contents(&window), vec!["c", "b"]);
        assert_eq!(window.position("a"), None);
    }

    #[test]
    fn test_access_moves_to_front() {
        let mut window = QstrWindow::new(4);
        for s in ["a", "b", "c"] {
            window.push(s);
        }
        assert_eq!(window.access(2), Some("a"));
        assert_eq!(contents(&window), vec!["a", "c", "b"]);
        assert_eq!(window.access(3), None);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_zero_size_window_keeps_nothing() {
        let mut window = QstrWindow::new(0);
        window.push("a");
        assert!(window.is_empty());
        assert_eq!(window.access(0), None);
    }
}
