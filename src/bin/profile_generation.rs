// A performance profiler for proof collection.
//
// Usage:
//   cargo build --bin=profile_generation --profile=fastdev
//   ./target/fastdev/profile_generation [max_length] [workers]
//
// For profiling with samply:
//   samply record target/fastdev/profile_generation 13

use std::env;
use std::time::Instant;

use dproofs::axiom::AxiomSet;
use dproofs::collector::{Collector, Strategy};
use dproofs::config::{available_workers, EnumerationConfig};
use dproofs::generator::Generator;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() {
    let args: Vec<String> = env::args().collect();
    let max_length: u32 = match args.get(1).map(|s| s.parse()) {
        None => 11,
        Some(Ok(n)) => n,
        Some(Err(_)) => {
            eprintln!("Usage: {} [max_length] [workers]", args[0]);
            std::process::exit(1);
        }
    };
    let workers = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(available_workers);

    let config = EnumerationConfig {
        workers,
        ..EnumerationConfig::default()
    };
    let mut collector = Collector::new(AxiomSet::standard(), config);
    let cancel = CancellationToken::new();

    let start = Instant::now();
    let result = collector.collect_up_to(max_length, Strategy::Stepwise, &cancel, |_, stats| {
        println!(
            "lengths {:?}: {} candidates, {} conclusions, {:.3}s elapsed",
            stats.lengths(),
            stats.iterations(),
            stats.conclusions(),
            start.elapsed().as_secs_f64()
        );
        Ok(())
    });
    if let Err(e) = result {
        eprintln!("collection failed: {}", e);
        std::process::exit(1);
    }

    // Generation alone, without evaluating anything, for the next length.
    let next = collector.known_limit() + 2;
    let generator = Generator::new(
        collector.table(),
        collector.known_limit(),
        collector.config().necessitation,
        next,
    );
    let start = Instant::now();
    let mut bytes = 0usize;
    match generator.generate(&[next], &cancel, &mut |proof: &str| bytes += proof.len()) {
        Ok(count) => println!(
            "generated {} candidates of length {} ({} bytes) in {:.3}s",
            count,
            next,
            bytes,
            start.elapsed().as_secs_f64()
        ),
        Err(e) => {
            eprintln!("generation failed: {}", e);
            std::process::exit(1);
        }
    }
}
