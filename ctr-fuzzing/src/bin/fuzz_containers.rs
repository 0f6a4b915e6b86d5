// ctr-fuzzing/src/bin/fuzz_containers.rs
//! Corpus replay driver for container-creation fuzzing

use std::path::PathBuf;
use std::process;
use std::time::Instant;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ctr_fuzzing::constants::targets;
use ctr_fuzzing::utils;
use ctr_fuzzing::{Campaign, HarnessConfig, IterationStatus};

/// Largest random input generated when no corpus is available
const MAX_RANDOM_INPUT: usize = 4096;

#[derive(Parser, Debug)]
#[command(name = "fuzz_containers", about = "Replay fuzz inputs against a supervised container daemon")]
struct Args {
    /// Tear the daemon down after every iteration
    #[arg(long)]
    teardown: bool,

    /// Corpus directory (defaults to the target's corpus directory)
    #[arg(long)]
    corpus: Option<PathBuf>,

    /// Upper bound on iterations
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Seed for generated inputs when the corpus is empty
    #[arg(long, env = "CTR_FUZZING_SEED", default_value_t = 42)]
    seed: u64,

    /// Daemon socket
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Daemon root directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Daemon state directory
    #[arg(long)]
    state: Option<PathBuf>,

    /// Daemon binary
    #[arg(long)]
    daemon: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut HarnessConfig) {
        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        if let Some(root) = &self.root {
            config.root_dir = root.clone();
        }
        if let Some(state) = &self.state {
            config.state_dir = state.clone();
        }
        if let Some(daemon) = &self.daemon {
            config.daemon_binary = daemon.clone();
        }
        config.teardown |= self.teardown;
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    ctr_fuzzing::init();

    let mut config = match HarnessConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(1);
        }
    };
    args.apply(&mut config);

    if let Err(err) = utils::prepare_environment(&config) {
        eprintln!("Environment setup failed: {err}");
        process::exit(1);
    }

    let target = if config.teardown {
        targets::CREATE_CONTAINER_WITH_TEARDOWN
    } else {
        targets::CREATE_CONTAINER_NO_TEARDOWN
    };
    println!("Starting container fuzzer ({target})");

    let corpus_dir = match &args.corpus {
        Some(dir) => Ok(dir.clone()),
        None => utils::get_corpus_dir(target),
    };
    let corpus_dir = match corpus_dir {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("Corpus directory unavailable: {err}");
            process::exit(1);
        }
    };
    let corpus = match utils::load_corpus(&corpus_dir) {
        Ok(corpus) => corpus,
        Err(err) => {
            eprintln!("Failed to load corpus from {}: {err}", corpus_dir.display());
            process::exit(1);
        }
    };

    let max_iterations = args.max_iterations.unwrap_or_else(utils::get_max_iterations);
    let iterations = if corpus.is_empty() {
        println!("Corpus at {} is empty, generating inputs (seed {})", corpus_dir.display(), args.seed);
        max_iterations
    } else {
        println!("Loaded {} corpus entries from {}", corpus.len(), corpus_dir.display());
        corpus.len().min(max_iterations)
    };

    let teardown = config.teardown;
    let mut campaign = Campaign::new(config);
    let mut rng = StdRng::seed_from_u64(args.seed);
    let start_time = Instant::now();

    for i in 0..iterations {
        if i > 0 && i % 100 == 0 {
            let stats = campaign.stats();
            let per_second = i as f64 / start_time.elapsed().as_secs_f64();
            println!("Iteration {}/{} ({:.2} iterations/sec)", i, iterations, per_second);
            println!(
                "  Completed: {}, Exhausted: {}, Connection failures: {}",
                stats.completed, stats.input_exhausted, stats.connection_failures
            );
            println!(
                "  Containers created: {}/{}",
                stats.constructions_succeeded(),
                stats.constructions_attempted()
            );
        }

        let input = match corpus.get(i) {
            Some(entry) => entry.clone(),
            None => {
                let len = rng.gen_range(0..=MAX_RANDOM_INPUT);
                (0..len).map(|_| rng.gen::<u8>()).collect()
            }
        };

        if campaign.run_iteration(&input, teardown).await == IterationStatus::ConnectionFailed {
            log::warn!("iteration {i}: could not reach the daemon");
        }
    }

    if let Err(err) = campaign.shutdown().await {
        log::warn!("final teardown failed: {err}");
    }

    println!("\nFuzzing completed in {:.2?}", start_time.elapsed());
    campaign.stats().print_summary();

    match utils::get_artifacts_dir(target).and_then(|dir| campaign.stats().save_report(&dir)) {
        Ok(path) => println!("Report saved to {}", path.display()),
        Err(err) => eprintln!("Failed to save report: {err}"),
    }

    ctr_fuzzing::finalize();
}
