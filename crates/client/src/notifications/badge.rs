//! Title badge and notification dedup bookkeeping.

use std::collections::{HashSet, VecDeque};

/// Unread count shown as a window title prefix.
#[derive(Debug, Clone)]
pub struct TitleBadge {
    base: String,
    unread: u32,
}

impl TitleBadge {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            unread: 0,
        }
    }

    pub fn increment(&mut self) -> u32 {
        self.unread = self.unread.saturating_add(1);
        self.unread
    }

    pub fn reset(&mut self) {
        self.unread = 0;
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    pub fn title(&self) -> String {
        if self.unread > 0 {
            format!("({}) {}", self.unread, self.base)
        } else {
            self.base.clone()
        }
    }
}

/// Bounded set of already-notified ids. Once over capacity it keeps only the
/// most recent half.
#[derive(Debug, Clone)]
pub struct DedupSet {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Record `id`. Returns false if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > self.capacity {
            let keep = self.capacity / 2;
            while self.order.len() > keep {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_prefix() {
        let mut badge = TitleBadge::new("Bidroom");
        assert_eq!(badge.title(), "Bidroom");
        badge.increment();
        badge.increment();
        assert_eq!(badge.title(), "(2) Bidroom");
        badge.reset();
        assert_eq!(badge.title(), "Bidroom");
    }

    #[test]
    fn dedup_trims_to_recent_half() {
        let mut set = DedupSet::new(100);
        for i in 0..100 {
            assert!(set.insert(&format!("m{i}")));
        }
        assert!(!set.insert("m0"));
        assert_eq!(set.len(), 100);

        assert!(set.insert("m100"));
        assert_eq!(set.len(), 50);
        assert!(!set.contains("m50"));
        assert!(set.contains("m51"));
        assert!(set.contains("m100"));
    }
}
