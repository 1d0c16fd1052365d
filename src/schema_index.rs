use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::kernel::formula::Formula;
use crate::kernel::variable_map::is_schema_of;

#[derive(Clone, Debug, PartialEq, Eq)]
struct IndexedFormula {
    key: String,
    proof_length: u32,
    formula: Formula,
}

/// All registered conclusions, bucketed by formula size.
/// It is built once and only read afterwards, so any number of threads can query it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaIndex {
    buckets: BTreeMap<u32, Vec<IndexedFormula>>,
    len: usize,
}

impl SchemaIndex {
    /// Takes (key, proof length, conclusion) triples.
    pub fn build(entries: impl IntoIterator<Item = (String, u32, Formula)>) -> SchemaIndex {
        let mut buckets: BTreeMap<u32, Vec<IndexedFormula>> = BTreeMap::new();
        let mut len = 0;
        for (key, proof_length, formula) in entries {
            buckets
                .entry(formula.size())
                .or_default()
                .push(IndexedFormula {
                    key,
                    proof_length,
                    formula,
                });
            len += 1;
        }
        for bucket in buckets.values_mut() {
            bucket.sort_by(search_order);
        }
        SchemaIndex { buckets, len }
    }

    /// Splits the entries among up to `workers` threads, each building a partial index, and
    /// merges the parts. The result is the same as `build`.
    pub fn build_parallel(entries: Vec<(String, u32, Formula)>, workers: usize) -> SchemaIndex {
        let workers = workers.max(1);
        if workers == 1 || entries.len() < 2 * workers {
            return SchemaIndex::build(entries);
        }
        let chunk_size = entries.len().div_ceil(workers);
        let mut chunks = Vec::with_capacity(workers);
        let mut rest = entries;
        while rest.len() > chunk_size {
            let tail = rest.split_off(chunk_size);
            chunks.push(rest);
            rest = tail;
        }
        chunks.push(rest);

        let parts: Vec<SchemaIndex> = std::thread::scope(|s| {
            let handles: Vec<_> = chunks
                .into_iter()
                .map(|chunk| s.spawn(move || SchemaIndex::build(chunk)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        });

        let mut index = SchemaIndex::default();
        for part in parts {
            index.len += part.len;
            for (size, bucket) in part.buckets {
                index.buckets.entry(size).or_default().extend(bucket);
            }
        }
        for bucket in index.buckets.values_mut() {
            bucket.sort_by(search_order);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finds an indexed conclusion that makes this one redundant.
    /// That is one with a different key, no larger, proven no later, which is a schema of
    /// `formula`. Smaller formulas are tried first.
    /// Returns the key of the generalization.
    pub fn find_generalization(
        &self,
        formula: &Formula,
        proof_length: u32,
        key: &str,
    ) -> Option<&str> {
        for bucket in self.buckets.range(..=formula.size()).map(|(_, b)| b) {
            for entry in bucket {
                if entry.proof_length > proof_length {
                    // Buckets are sorted by proof length.
                    break;
                }
                if entry.key == key {
                    continue;
                }
                if is_schema_of(&entry.formula, formula) {
                    return Some(&entry.key);
                }
            }
        }
        None
    }
}

// Within a bucket, earlier proofs come first.
fn search_order(a: &IndexedFormula, b: &IndexedFormula) -> Ordering {
    a.proof_length
        .cmp(&b.proof_length)
        .then_with(|| a.key.cmp(&b.key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, proof_length: u32) -> (String, u32, Formula) {
        (
            key.to_string(),
            proof_length,
            Formula::parse_polish(key).unwrap(),
        )
    }

    #[test]
    fn test_instance_is_found() {
        let index = SchemaIndex::build(vec![
            entry("C0.0", 5),
            entry("C0C1.0", 1),
            entry("CC0.1C0.0", 3),
        ]);
        assert_eq!(index.len(), 3);
        let instance = Formula::parse_polish("CC0.1C0.1").unwrap();
        assert_eq!(
            index.find_generalization(&instance, 5, "CC0.1C0.1"),
            Some("C0.0")
        );
    }

    #[test]
    fn test_never_removed_against_itself() {
        let index = SchemaIndex::build(vec![entry("C0.0", 5)]);
        let f = Formula::parse_polish("C0.0").unwrap();
        assert_eq!(index.find_generalization(&f, 5, "C0.0"), None);
    }

    #[test]
    fn test_later_proofs_do_not_count() {
        let index = SchemaIndex::build(vec![entry("C0.0", 5)]);
        let instance = Formula::parse_polish("CC0.1C0.1").unwrap();
        assert_eq!(index.find_generalization(&instance, 3, "CC0.1C0.1"), None);
    }

    #[test]
    fn test_parallel_build_matches_sequential() {
        // C0C1C2...Cn-1.n for each n, plus their instances with every variable renamed to 0.
        let mut entries = vec![];
        for n in 1..30u32 {
            let mut formula = Formula::variable(n);
            let mut instance = Formula::variable(0);
            for v in (0..n).rev() {
                formula = Formula::implication(Formula::variable(v), formula);
                instance = Formula::implication(Formula::variable(0), instance);
            }
            entries.push((formula.to_polish(), 1 + 2 * (n % 4), formula));
            entries.push((instance.to_polish(), 7, instance));
        }
        let sequential = SchemaIndex::build(entries.clone());
        for workers in [1, 2, 3, 8] {
            let parallel = SchemaIndex::build_parallel(entries.clone(), workers);
            assert_eq!(parallel, sequential, "{} workers", workers);
        }
        assert_eq!(sequential.len(), 58);
    }

    #[test]
    fn test_larger_formulas_are_skipped() {
        let index = SchemaIndex::build(vec![entry("CC0.1C0.1", 3)]);
        let f = Formula::parse_polish("C0.0").unwrap();
        assert_eq!(index.find_generalization(&f, 5, "C0.0"), None);
    }
}
