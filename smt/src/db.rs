use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::smt::{Key, Node};

/// Content-addressed node storage. Nodes are keyed by their own hash, so a
/// node is never overwritten with different content and older roots stay
/// readable after newer writes, until the store is pruned.
pub trait Db: Default {
    fn get_node(&self, key: &Key) -> Option<&Node>;
    fn set_node(&mut self, key: Key, value: Node);
    /// Drops every node not in `live`. Returns how many were dropped.
    fn retain_nodes(&mut self, live: &HashSet<Key>) -> usize;
}

/// In-memory node storage that also remembers which nodes were written or
/// dropped since the journal was last drained, so callers can persist only
/// the difference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryDb {
    pub db: HashMap<Key, Node>,
    #[serde(skip)]
    journal: Vec<Key>,
}

impl MemoryDb {
    /// Keys touched since the previous call, deduplicated, each with its
    /// current node or `None` once dropped.
    pub fn take_journal(&mut self) -> Vec<(Key, Option<Node>)> {
        let mut seen = HashSet::new();
        std::mem::take(&mut self.journal)
            .into_iter()
            .filter(|k| seen.insert(*k))
            .map(|k| (k, self.db.get(&k).copied()))
            .collect()
    }

    /// Loads nodes without recording them in the journal.
    pub fn extend<I: IntoIterator<Item = (Key, Node)>>(&mut self, nodes: I) {
        self.db.extend(nodes);
    }

    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

impl Db for MemoryDb {
    fn get_node(&self, key: &Key) -> Option<&Node> {
        self.db.get(key)
    }

    fn set_node(&mut self, key: Key, value: Node) {
        if self.db.insert(key, value).is_none() {
            self.journal.push(key);
        }
    }

    fn retain_nodes(&mut self, live: &HashSet<Key>) -> usize {
        let before = self.db.len();
        let journal = &mut self.journal;
        self.db.retain(|k, _| {
            let keep = live.contains(k);
            if !keep {
                journal.push(*k);
            }
            keep
        });
        before - self.db.len()
    }
}
