use std::num::NonZeroUsize;

use lru::LruCache;

/// Bounded memory of recently seen message ids.
pub struct DuplicateDetector {
    seen: LruCache<String, ()>,
}

impl DuplicateDetector {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
        }
    }

    pub fn is_most_likely_duplicate(&self, message_id: &str) -> bool {
        self.seen.contains(message_id)
    }

    /// Returns `true` if the id was seen before, otherwise remembers it.
    pub fn check_and_record(&mut self, message_id: &str) -> bool {
        if self.seen.contains(message_id) {
            self.seen.promote(message_id);
            return true;
        }
        self.seen.put(message_id.to_string(), ());
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sighting_is_a_duplicate() {
        let mut detector = DuplicateDetector::new(8);
        assert!(!detector.check_and_record("a"));
        assert!(detector.check_and_record("a"));
        assert!(detector.is_most_likely_duplicate("a"));
        assert!(!detector.is_most_likely_duplicate("b"));
    }

    #[test]
    fn oldest_ids_are_forgotten() {
        let mut detector = DuplicateDetector::new(2);
        detector.check_and_record("a");
        detector.check_and_record("b");
        detector.check_and_record("c");
        assert_eq!(detector.len(), 2);
        assert!(!detector.is_most_likely_duplicate("a"));
        assert!(detector.is_most_likely_duplicate("c"));
    }
}
