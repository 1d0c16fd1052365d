use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::axiom::AxiomSet;
use crate::config::NecessitationLimit;
use crate::kernel::formula::Formula;

const METADATA_FILE: &str = "metadata.txt";

// Creating an output file is retried this many times before giving up.
const CREATE_ATTEMPTS: u32 = 5;
const CREATE_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum StoreError {
    Io { path: PathBuf, source: std::io::Error },

    /// A stored file doesn't have the expected format. Line numbers start at one.
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    CounterOverflow { length: u32 },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn malformed(path: &Path, line: usize, reason: impl Into<String>) -> StoreError {
        StoreError::Malformed {
            path: path.to_path_buf(),
            line,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::Io { path, source } => write!(f, "{}: {}", path.display(), source),
            StoreError::Malformed { path, line, reason } => {
                write!(f, "{}:{}: {}", path.display(), line, reason)
            }
            StoreError::CounterOverflow { length } => {
                write!(f, "counter overflow at length {}", length)
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// One line of a representatives file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredProof {
    pub proof: String,

    /// Only present if the file was written with conclusions.
    pub conclusion: Option<Formula>,
}

/// Run information kept next to the representative files.
///
/// The file starts with the axiom fingerprint in brackets, then lists the axioms, then has
/// one line per counter:
///
///   [default]
///   1: C0C1.0 = 0→(1→0)
///   #iterations;3:9,5:36
///   #removals;3:0,5:3
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub hash: String,
    pub axioms: Vec<String>,

    /// Candidates evaluated per length.
    pub iterations: BTreeMap<u32, u64>,

    /// Schema-redundant conclusions removed per length.
    pub removals: BTreeMap<u32, u64>,
}

impl Metadata {
    pub fn new(axioms: &AxiomSet) -> Metadata {
        Metadata {
            hash: axioms.fingerprint(),
            axioms: axioms.describe(),
            iterations: BTreeMap::new(),
            removals: BTreeMap::new(),
        }
    }

    /// Records the counters for a completed length.
    /// Running a length again replaces its counters.
    pub fn record_round(&mut self, length: u32, iterations: u64, removals: u64) {
        self.iterations.insert(length, iterations);
        self.removals.insert(length, removals);
    }

    /// The number of candidates over all recorded lengths.
    pub fn total_iterations(&self) -> Result<u64, StoreError> {
        let mut total: u64 = 0;
        for (&length, &count) in &self.iterations {
            total = total
                .checked_add(count)
                .ok_or(StoreError::CounterOverflow { length })?;
        }
        Ok(total)
    }

    /// A rough guess at the candidate count for the length after `length`, from the growth
    /// between the last two recorded lengths. Saturates instead of overflowing.
    pub fn estimate_iterations(&self, length: u32) -> Option<u64> {
        let current = *self.iterations.get(&length)?;
        let previous = self
            .iterations
            .range(..length)
            .next_back()
            .map(|(_, &count)| count)
            .filter(|&count| count > 0)?;
        let ratio = current.div_ceil(previous).max(1);
        Some(current.saturating_mul(ratio))
    }

    /// Logs the work done so far and the guess for the length after `length`.
    /// Returns the guess.
    pub fn report_progress(&self, length: u32) -> Option<u64> {
        match self.total_iterations() {
            Ok(total) => info!(total, "candidates evaluated in earlier runs"),
            Err(e) => warn!("{}", e),
        }
        let estimate = self.estimate_iterations(length);
        match estimate {
            Some(estimate) => info!(after = length, estimate, "estimated candidates"),
            None => info!(after = length, "no estimate without two recorded lengths"),
        }
        estimate
    }

    fn render(&self) -> String {
        let counters = |map: &BTreeMap<u32, u64>| {
            map.iter()
                .map(|(l, n)| format!("{}:{}", l, n))
                .collect::<Vec<_>>()
                .join(",")
        };
        let mut text = format!("[{}]\n", self.hash);
        for axiom in &self.axioms {
            text.push_str(axiom);
            text.push('\n');
        }
        text.push_str(&format!("#iterations;{}\n", counters(&self.iterations)));
        text.push_str(&format!("#removals;{}\n", counters(&self.removals)));
        text
    }

    fn parse(path: &Path, text: &str) -> Result<Metadata, StoreError> {
        let mut lines = text.lines().enumerate();
        let hash = match lines.next() {
            Some((_, line)) if line.starts_with('[') && line.ends_with(']') => {
                line[1..line.len() - 1].to_string()
            }
            _ => return Err(StoreError::malformed(path, 1, "missing [HASH] line")),
        };
        let mut metadata = Metadata {
            hash,
            axioms: vec![],
            iterations: BTreeMap::new(),
            removals: BTreeMap::new(),
        };
        for (i, line) in lines {
            if let Some(rest) = line.strip_prefix("#iterations;") {
                metadata.iterations = parse_counters(path, i + 1, rest)?;
            } else if let Some(rest) = line.strip_prefix("#removals;") {
                metadata.removals = parse_counters(path, i + 1, rest)?;
            } else if !line.is_empty() {
                metadata.axioms.push(line.to_string());
            }
        }
        Ok(metadata)
    }
}

fn parse_counters(path: &Path, line: usize, text: &str) -> Result<BTreeMap<u32, u64>, StoreError> {
    let mut answer = BTreeMap::new();
    for part in text.split(',').filter(|p| !p.is_empty()) {
        let (length, count) = part
            .split_once(':')
            .ok_or_else(|| StoreError::malformed(path, line, format!("bad counter '{}'", part)))?;
        let length: u32 = length
            .parse()
            .map_err(|_| StoreError::malformed(path, line, format!("bad length '{}'", length)))?;
        let count: u64 = count
            .parse()
            .map_err(|_| StoreError::malformed(path, line, format!("bad count '{}'", count)))?;
        answer.insert(length, count);
    }
    Ok(answer)
}

/// The directory holding the results for one axiom set and necessitation setting.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
    fingerprint: String,
}

impl Store {
    /// Creates the directory if needed.
    pub fn open(
        dir: &Path,
        axioms: &AxiomSet,
        necessitation: NecessitationLimit,
    ) -> Result<Store, StoreError> {
        let fingerprint = axioms.fingerprint();
        let name = if necessitation.is_enabled() {
            format!("{}-N{}", fingerprint, necessitation)
        } else {
            fingerprint.clone()
        };
        let root = dir.join(name);
        std::fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        let store = Store { root, fingerprint };
        if store.load_metadata()?.is_none() {
            store.save_metadata(&Metadata::new(axioms))?;
        }
        debug!(root = %store.root.display(), "opened store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn representatives_path(&self, length: u32, unfiltered_from: Option<u32>) -> PathBuf {
        let name = match unfiltered_from {
            Some(from) => format!("dProofs{}-unfiltered{}+.txt", length, from),
            None => format!("dProofs{}.txt", length),
        };
        self.root.join(name)
    }

    /// Writes the representatives of one length, one per line.
    /// With conclusions, each line is `PROOF:CONCLUSION`.
    pub fn save_representatives(
        &self,
        length: u32,
        entries: &[(String, Formula)],
        with_conclusions: bool,
        unfiltered_from: Option<u32>,
    ) -> Result<PathBuf, StoreError> {
        let path = self.representatives_path(length, unfiltered_from);
        let mut text = String::new();
        for (proof, conclusion) in entries {
            text.push_str(proof);
            if with_conclusions {
                text.push(':');
                text.push_str(&conclusion.to_polish());
            }
            text.push('\n');
        }
        write_atomically(&path, text.as_bytes())?;
        info!(
            length,
            count = entries.len(),
            path = %path.display(),
            "saved representatives"
        );
        Ok(path)
    }

    /// Returns None if nothing was saved for this length.
    /// Any malformed line fails the whole load.
    pub fn load_representatives(
        &self,
        length: u32,
        unfiltered_from: Option<u32>,
    ) -> Result<Option<Vec<StoredProof>>, StoreError> {
        let path = self.representatives_path(length, unfiltered_from);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let mut answer = vec![];
        let mut with_conclusions = None;
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| StoreError::io(&path, e))?;
            let stored = parse_line(&path, i + 1, &line, length as usize, &mut with_conclusions)?;
            answer.push(stored);
        }
        debug!(length, count = answer.len(), "loaded representatives");
        Ok(Some(answer))
    }

    pub fn load_metadata(&self) -> Result<Option<Metadata>, StoreError> {
        let path = self.root.join(METADATA_FILE);
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let metadata = Metadata::parse(&path, &text)?;
                if metadata.hash != self.fingerprint {
                    return Err(StoreError::malformed(
                        &path,
                        1,
                        format!("expected [{}], found [{}]", self.fingerprint, metadata.hash),
                    ));
                }
                Ok(Some(metadata))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    pub fn save_metadata(&self, metadata: &Metadata) -> Result<(), StoreError> {
        let path = self.root.join(METADATA_FILE);
        write_atomically(&path, metadata.render().as_bytes())
    }
}

fn parse_line(
    path: &Path,
    line_number: usize,
    line: &str,
    length: usize,
    with_conclusions: &mut Option<bool>,
) -> Result<StoredProof, StoreError> {
    let (proof, conclusion) = match line.find(':') {
        Some(colon) => (&line[..colon], Some(&line[colon + 1..])),
        None => (line, None),
    };
    if proof.is_empty() {
        return Err(StoreError::malformed(path, line_number, "empty proof"));
    }
    if proof.len() != length {
        let reason = match conclusion {
            Some(_) => format!("colon at position {}, expected {}", proof.len(), length),
            None => format!("proof of length {}, expected {}", proof.len(), length),
        };
        return Err(StoreError::malformed(path, line_number, reason));
    }
    let expected = *with_conclusions.get_or_insert(conclusion.is_some());
    if expected != conclusion.is_some() {
        let reason = if expected {
            "missing conclusion"
        } else {
            "unexpected conclusion"
        };
        return Err(StoreError::malformed(path, line_number, reason));
    }
    let conclusion = match conclusion {
        Some(text) => Some(
            Formula::parse_polish(text)
                .map_err(|e| StoreError::malformed(path, line_number, e.to_string()))?,
        ),
        None => None,
    };
    Ok(StoredProof {
        proof: proof.to_string(),
        conclusion,
    })
}

// Writes to a temporary file next to the target, then renames it over the target.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let mut attempt = 1;
    let file = loop {
        match File::create(&temp_path) {
            Ok(file) => break file,
            Err(e) if attempt < CREATE_ATTEMPTS => {
                warn!(
                    path = %temp_path.display(),
                    attempt,
                    error = %e,
                    "could not create file, retrying"
                );
                attempt += 1;
                std::thread::sleep(CREATE_RETRY_DELAY);
            }
            Err(e) => return Err(StoreError::io(&temp_path, e)),
        }
    };

    let mut writer = BufWriter::new(file);
    writer
        .write_all(contents)
        .map_err(|e| StoreError::io(&temp_path, e))?;
    let file = writer
        .into_inner()
        .map_err(|e| StoreError::io(&temp_path, e.into_error()))?;
    file.sync_all().map_err(|e| StoreError::io(&temp_path, e))?;
    std::fs::rename(&temp_path, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}
