// The schema filter for one length, spread over a group of ranks.
// Every rank loads the same candidates and index. The candidate positions are shuffled and
// split evenly, and ranks that finish early take over ranges from ranks that haven't.
pub mod filter;
pub mod protocol;
pub mod transport;
pub mod workload;

use std::collections::BTreeSet;
use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::config::DistributedConfig;
use filter::{run_rank, FilterJob};
use transport::{LocalTransport, TransportError};

#[derive(Debug)]
pub enum DistributedError {
    /// A rank loaded different data than the coordinator.
    /// The pairs are (candidate count, length).
    Mismatch {
        rank: usize,
        expected: (u64, u32),
        found: (u64, u32),
    },

    /// The coordinator aborted the run for this reason.
    Aborted(String),

    Transport(TransportError),

    /// A message arrived that the protocol doesn't allow.
    Protocol(String),

    Cancelled,
}

impl fmt::Display for DistributedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DistributedError::Mismatch {
                rank,
                expected,
                found,
            } => write!(
                f,
                "rank {} loaded {} candidates of length {}, expected {} of length {}",
                rank, found.0, found.1, expected.0, expected.1
            ),
            DistributedError::Aborted(reason) => write!(f, "aborted: {}", reason),
            DistributedError::Transport(e) => write!(f, "transport: {}", e),
            DistributedError::Protocol(message) => write!(f, "protocol violation: {}", message),
            DistributedError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for DistributedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DistributedError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for DistributedError {
    fn from(e: TransportError) -> Self {
        DistributedError::Transport(e)
    }
}

/// Runs `ranks` ranks as threads of this process and returns the coordinator's result.
pub fn run_local(
    job: &FilterJob,
    ranks: usize,
    config: &DistributedConfig,
    cancel: &CancellationToken,
) -> Result<BTreeSet<u64>, DistributedError> {
    let group = LocalTransport::group(ranks.max(1));
    let results: Vec<Result<Option<BTreeSet<u64>>, DistributedError>> =
        std::thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|transport| s.spawn(move || run_rank(transport, job, config, cancel)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(Err(DistributedError::Cancelled)))
                .collect()
        });
    let mut answer = None;
    for result in results {
        if let Some(set) = result? {
            answer = Some(set);
        }
    }
    answer.ok_or_else(|| DistributedError::Protocol("no coordinator result".to_string()))
}
