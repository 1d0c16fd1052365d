use std::collections::BTreeSet;
use std::net::TcpListener;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::collector::{Collector, Strategy};
use crate::config::{DistributedConfig, NecessitationLimit, RedundancyFilter};
use crate::distributed::filter::{run_rank, FilterJob};
use crate::distributed::run_local;
use crate::distributed::transport::TcpTransport;
use crate::proof::parse_proof_string;
use crate::tests::common::{collect, test_config};

// Collects length seven without the schema filter, like a run that leaves it for later.
fn unfiltered_seven() -> Collector {
    let mut config = test_config(NecessitationLimit::Disabled);
    config.redundancy_filter = RedundancyFilter::DisabledFrom(7);
    collect(config, 7, Strategy::Stepwise)
}

fn serial_answer(job: &FilterJob) -> BTreeSet<u64> {
    (0..job.len()).filter(|&i| job.is_redundant(i)).collect()
}

fn busy_config() -> DistributedConfig {
    DistributedConfig {
        reserve_denominator: 4,
        min_workload: 2,
        poll_interval: Duration::from_millis(1),
    }
}

#[test]
fn test_any_number_of_ranks_agrees_with_serial() {
    let collector = unfiltered_seven();
    let job = FilterJob::for_length(&collector, 7);
    let expected = serial_answer(&job);
    assert!(!expected.is_empty());
    for (i, candidate) in job.candidates().iter().enumerate() {
        let proof = collector.table().resolve(candidate.proof).unwrap();
        assert_eq!(proof, collector.table().get(7)[i]);
    }
    for ranks in [1, 2, 4] {
        let answer = run_local(&job, ranks, &busy_config(), &CancellationToken::new()).unwrap();
        assert_eq!(answer, expected, "{} ranks", ranks);
    }
}

#[test]
fn test_filtering_later_matches_filtering_right_away() {
    let unfiltered = unfiltered_seven();
    let job = FilterJob::for_length(&unfiltered, 7);
    let redundant = run_local(&job, 3, &busy_config(), &CancellationToken::new()).unwrap();
    let survivors = job.survivors(&redundant, unfiltered.table());
    assert_eq!(survivors.len() as u64, job.len() - redundant.len() as u64);
    for (proof, conclusion) in &survivors {
        assert_eq!(proof.len(), 7);
        let derivation = parse_proof_string(proof, unfiltered.axioms()).unwrap();
        assert_eq!(derivation.key(), conclusion.key());
    }
    let kept: BTreeSet<String> = survivors.iter().map(|(_, c)| c.key()).collect();

    let filtered = collect(
        test_config(NecessitationLimit::Disabled),
        7,
        Strategy::Stepwise,
    );
    let expected: BTreeSet<String> = filtered
        .representatives(7)
        .into_iter()
        .map(|(_, conclusion)| conclusion.key())
        .collect();
    assert_eq!(kept.len(), 38);
    assert_eq!(kept, expected);
}

#[test]
fn test_tcp_ranks_agree_with_serial() {
    let collector = unfiltered_seven();
    let job = FilterJob::for_length(&collector, 7);
    let expected = serial_answer(&job);

    let listeners: Vec<TcpListener> = (0..3)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    let hosts: Vec<String> = listeners
        .iter()
        .map(|l| l.local_addr().unwrap().to_string())
        .collect();
    let config = busy_config();
    let cancel = CancellationToken::new();

    let results: Vec<Option<BTreeSet<u64>>> = std::thread::scope(|s| {
        let handles: Vec<_> = listeners
            .into_iter()
            .enumerate()
            .map(|(rank, listener)| {
                let hosts = &hosts;
                let job = &job;
                let config = &config;
                let cancel = &cancel;
                s.spawn(move || {
                    let transport = TcpTransport::establish(rank, listener, hosts).unwrap();
                    run_rank(&transport, job, config, cancel).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results[0].as_ref(), Some(&expected));
    assert!(results[1..].iter().all(|r| r.is_none()));
}
