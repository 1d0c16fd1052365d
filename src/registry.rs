use std::cmp::Ordering;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::kernel::formula::Formula;
use crate::proof::proof_order;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryEntry {
    /// The best proof seen so far.
    pub proof: String,

    pub conclusion: Formula,
}

/// What happened to a proof handed to the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The conclusion was new.
    Inserted,

    /// The conclusion was known, and the new proof beat the stored one.
    /// The displaced proof had this length.
    Replaced { displaced_length: u32 },

    /// The conclusion was known, with a proof at least as good.
    Redundant,
}

impl InsertOutcome {
    /// Whether the candidate added a conclusion that wasn't there before.
    pub fn is_new(&self) -> bool {
        matches!(self, InsertOutcome::Inserted)
    }
}

/// Maps each canonical conclusion key to the best proof of it.
/// The best proof is the shortest one, ties broken lexicographically, so the contents don't
/// depend on the order proofs arrive in.
///
/// Inserts are safe from many threads at once. Removal takes `&mut self`, so it can't overlap
/// with an insert phase.
#[derive(Debug, Default)]
pub struct Registry {
    entries: DashMap<String, RegistryEntry>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            entries: DashMap::new(),
        }
    }

    pub fn try_insert(&self, key: String, proof: &str, conclusion: Formula) -> InsertOutcome {
        match self.entries.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(RegistryEntry {
                    proof: proof.to_string(),
                    conclusion,
                });
                InsertOutcome::Inserted
            }
            Entry::Occupied(mut occupied) => {
                if proof_order(proof, &occupied.get().proof) == Ordering::Less {
                    let displaced =
                        std::mem::replace(&mut occupied.get_mut().proof, proof.to_string());
                    InsertOutcome::Replaced {
                        displaced_length: displaced.len() as u32,
                    }
                } else {
                    InsertOutcome::Redundant
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn proof_of(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|e| e.proof.clone())
    }

    /// Removes the given keys, returning how many were present.
    pub fn remove_keys<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>) -> usize {
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    /// A copy of every entry whose proof has one of these lengths, sorted by proof.
    pub fn entries_with_lengths(&self, lengths: &[u32]) -> Vec<(String, RegistryEntry)> {
        let mut answer: Vec<(String, RegistryEntry)> = self
            .entries
            .iter()
            .filter(|e| lengths.contains(&(e.proof.len() as u32)))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        answer.sort_by(|a, b| proof_order(&a.1.proof, &b.1.proof));
        answer
    }

    /// A copy of every entry, sorted by proof.
    pub fn snapshot(&self) -> Vec<(String, RegistryEntry)> {
        let mut answer: Vec<(String, RegistryEntry)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        answer.sort_by(|a, b| proof_order(&a.1.proof, &b.1.proof));
        answer
    }
}
