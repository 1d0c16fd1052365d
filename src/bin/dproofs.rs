// The dproofs CLI.
// You can enumerate representative proofs up to a length, evaluate a single proof string,
// or run the schema filter for one length over several ranks.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use dproofs::axiom::AxiomSet;
use dproofs::collector::{Collector, CollectorError, Strategy};
use dproofs::config::{
    available_workers, DistributedConfig, EnumerationConfig, NecessitationLimit, RedundancyFilter,
};
use dproofs::distributed::filter::{run_rank, FilterJob};
use dproofs::distributed::run_local;
use dproofs::distributed::transport::TcpTransport;
use dproofs::proof::parse_proof_string;
use dproofs::store::Store;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[clap(
    name = "dproofs",
    about = "Enumerates minimal condensed detachment proofs",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Comma-separated axioms in prefix notation, like CpCqp,CCpCqrCCpqCpr
    #[clap(long, global = true, value_name = "LIST")]
    axioms: Option<String>,

    /// How many N may appear in a row: a number, or "unbounded"
    #[clap(long, global = true, default_value = "0", value_name = "LIMIT")]
    necessitation: NecessitationLimit,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Find representative proofs for every length up to LENGTH
    Generate {
        #[clap(long)]
        length: u32,

        /// Where the results are kept
        #[clap(long, default_value = "data", value_name = "DIR")]
        data: PathBuf,

        /// Number of evaluation threads
        #[clap(long)]
        workers: Option<usize>,

        /// Generate all missing lengths in a single round
        #[clap(long)]
        combined: bool,

        /// Skip the schema filter for this length and above
        #[clap(long, value_name = "K")]
        unfiltered_from: Option<u32>,

        /// Store each proof's conclusion next to it
        #[clap(long)]
        with_conclusions: bool,
    },

    /// Print the conclusion of a proof string
    Parse {
        #[clap(value_name = "PROOF")]
        proof: String,
    },

    /// Run the schema filter for a length that was collected unfiltered
    Filter {
        #[clap(long)]
        length: u32,

        #[clap(long, value_name = "DIR")]
        data: PathBuf,

        /// The length the unfiltered files start at
        #[clap(long, value_name = "K")]
        unfiltered_from: u32,

        /// Simulate this many ranks within this process
        #[clap(long, conflicts_with_all = ["rank", "hosts"])]
        ranks: Option<usize>,

        /// This process's rank
        #[clap(long, requires = "hosts")]
        rank: Option<usize>,

        /// Comma-separated HOST:PORT of every rank, in rank order
        #[clap(long, value_delimiter = ',', requires = "rank")]
        hosts: Vec<String>,
    },
}

fn main() {
    // Use RUST_LOG to control log levels, e.g.:
    //   RUST_LOG=dproofs::collector=debug dproofs generate --length 9
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).without_time())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();
    let axioms = match &args.axioms {
        Some(list) => match AxiomSet::parse_list(list) {
            Ok(axioms) => axioms,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        },
        None => AxiomSet::standard(),
    };

    let result = match args.command {
        Command::Generate {
            length,
            data,
            workers,
            combined,
            unfiltered_from,
            with_conclusions,
        } => {
            let config = EnumerationConfig {
                necessitation: args.necessitation,
                workers: workers.unwrap_or_else(available_workers),
                redundancy_filter: match unfiltered_from {
                    Some(k) => RedundancyFilter::DisabledFrom(k),
                    None => RedundancyFilter::Enabled,
                },
                ..EnumerationConfig::default()
            };
            let strategy = if combined {
                Strategy::Combined
            } else {
                Strategy::Stepwise
            };
            generate(axioms, config, &data, length, strategy, with_conclusions)
        }
        Command::Parse { proof } => {
            match parse_proof_string(&proof, &axioms) {
                Ok(derivation) => {
                    println!("{}", derivation.key());
                    println!("{}", derivation.conclusion);
                }
                Err(e) => {
                    println!("invalid: {}", e);
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Command::Filter {
            length,
            data,
            unfiltered_from,
            ranks,
            rank,
            hosts,
        } => filter(
            axioms,
            args.necessitation,
            &data,
            length,
            unfiltered_from,
            ranks,
            rank.map(|r| (r, hosts)),
        ),
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn generate(
    axioms: AxiomSet,
    config: EnumerationConfig,
    data: &Path,
    length: u32,
    strategy: Strategy,
    with_conclusions: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(data, &axioms, config.necessitation)?;
    let redundancy_filter = config.redundancy_filter;
    let mut collector = Collector::resume(&store, axioms, config)?;
    if collector.known_limit() >= length {
        println!(
            "already have every length up to {} in {}",
            collector.known_limit(),
            store.root().display()
        );
        return Ok(());
    }

    let mut metadata = match store.load_metadata()? {
        Some(metadata) => metadata,
        None => dproofs::store::Metadata::new(collector.axioms()),
    };
    metadata.report_progress(collector.known_limit());
    let cancel = CancellationToken::new();
    collector.collect_up_to(length, strategy, &cancel, |collector, stats| {
        for length_stats in &stats.per_length {
            let l = length_stats.length;
            store.save_representatives(
                l,
                &collector.representatives(l),
                with_conclusions,
                redundancy_filter.unfiltered_from(l),
            )?;
            metadata.record_round(l, length_stats.iterations, length_stats.removals);
            println!(
                "length {}: {} candidates, {} invalid, {} redundant, {} removed, {} representatives",
                l,
                length_stats.iterations,
                length_stats.invalid,
                length_stats.redundant,
                length_stats.removals,
                length_stats.representatives
            );
        }
        metadata.report_progress(collector.known_limit());
        store.save_metadata(&metadata).map_err(CollectorError::from)
    })?;
    println!(
        "{} representatives up to length {}",
        collector.table().total(),
        collector.known_limit()
    );
    Ok(())
}

fn filter(
    axioms: AxiomSet,
    necessitation: NecessitationLimit,
    data: &Path,
    length: u32,
    unfiltered_from: u32,
    ranks: Option<usize>,
    cluster: Option<(usize, Vec<String>)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(data, &axioms, necessitation)?;
    let config = EnumerationConfig {
        necessitation,
        redundancy_filter: RedundancyFilter::DisabledFrom(unfiltered_from),
        ..EnumerationConfig::default()
    };
    let collector = Collector::resume(&store, axioms, config)?;
    if collector.known_limit() < length {
        return Err(format!(
            "no unfiltered proofs of length {} in {}",
            length,
            store.root().display()
        )
        .into());
    }

    let job = FilterJob::for_length(&collector, length);
    info!(length, candidates = job.len(), "loaded filter job");

    let distributed = DistributedConfig::default();
    let cancel = CancellationToken::new();
    let redundant = match cluster {
        Some((rank, hosts)) => {
            let transport = TcpTransport::connect(rank, &hosts)?;
            match run_rank(&transport, &job, &distributed, &cancel)? {
                Some(redundant) => redundant,
                None => return Ok(()),
            }
        }
        None => run_local(&job, ranks.unwrap_or(1), &distributed, &cancel)?,
    };

    let kept = job.survivors(&redundant, collector.table());
    let path = store.save_representatives(length, &kept, false, None)?;
    let mut metadata = match store.load_metadata()? {
        Some(metadata) => metadata,
        None => dproofs::store::Metadata::new(collector.axioms()),
    };
    let iterations = metadata.iterations.get(&length).copied().unwrap_or(0);
    metadata.record_round(length, iterations, redundant.len() as u64);
    store.save_metadata(&metadata)?;
    println!(
        "length {}: {} removed, {} kept, written to {}",
        length,
        redundant.len(),
        kept.len(),
        path.display()
    );
    Ok(())
}
