use std::collections::HashSet;

/// Breadth-first frontier bookkeeping for one discovery run.
///
/// A target is marked visited when it is admitted, before its task is
/// dequeued, so a target referenced by many edges is enqueued at most once.
/// Only targets shallower than `max_depth` are admitted: targets at
/// `max_depth` get recorded with their edges but are never expanded.
#[derive(Debug)]
pub struct Frontier {
    max_depth: u32,
    visited: HashSet<String>,
}

impl Frontier {
    pub fn new(max_depth: u32) -> Self {
        Self {
            max_depth,
            visited: HashSet::new(),
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Admit `key` for expansion at `depth`. False when too deep or
    /// already admitted.
    pub fn admit(&mut self, key: &str, depth: u32) -> bool {
        if depth >= self.max_depth {
            return false;
        }
        self.visited.insert(key.to_string())
    }

    pub fn visited(&self) -> usize {
        self.visited.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_each_target_once_and_never_at_max_depth() {
        let mut frontier = Frontier::new(2);
        assert!(frontier.admit("a", 0));
        assert!(frontier.admit("b", 1));
        assert!(!frontier.admit("b", 1));
        assert!(!frontier.admit("a", 1));
        assert!(!frontier.admit("d", 2));
        assert_eq!(frontier.visited(), 2);
    }

    #[test]
    fn zero_depth_expands_nothing() {
        let mut frontier = Frontier::new(0);
        assert!(!frontier.admit("seed", 0));
    }
}
