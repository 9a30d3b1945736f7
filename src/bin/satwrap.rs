#![cfg_attr(feature = "skip_lint", allow(clippy::all, clippy::pedantic, warnings))]
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use satwrap::{ResultRecord, SolveRequest, Status, WrapperConfig};

#[derive(Parser, Debug)]
#[command(
    name = "satwrap",
    about = "Run a SAT solver configured by thread-indexed parameters",
    allow_negative_numbers = true
)]
struct Args {
    /// JSON wrapper configuration
    #[arg(long)]
    config: Option<PathBuf>,
    /// Resource-limiting supervisor binary (runsolver style)
    #[arg(long)]
    supervisor: Option<PathBuf>,
    /// Memory ceiling in megabytes
    #[arg(long = "mem-limit")]
    mem_limit: Option<u64>,
    /// Pass the instance to the solver unchanged
    #[arg(long = "no-normalize")]
    no_normalize: bool,
    /// Print the result as JSON
    #[arg(long)]
    json: bool,

    instance: PathBuf,
    /// Ignored
    instance_specifics: String,
    /// Cutoff in seconds; negative means none
    cutoff: f64,
    /// Ignored
    cutoff_length: String,
    seed: i64,
    /// `-@<thread>:<name> <value>` pairs
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    params: Vec<String>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let record = match run(&args) {
        Ok(record) => record,
        Err(e) => {
            log::error!("{:#}", e);
            ResultRecord::new(Status::Crashed, args.cutoff.max(0.0), args.seed)
        }
    };
    if args.json {
        match serde_json::to_string(&record) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    } else {
        println!("Result for ParamILS: {}", record);
    }
}

fn run(args: &Args) -> Result<ResultRecord> {
    let mut config = WrapperConfig::load(args.config.as_deref())?;
    if let Some(path) = &args.supervisor {
        config.supervisor.get_or_insert_with(Default::default).path = path.clone();
    }
    if let Some(mb) = args.mem_limit {
        config.memory_limit_mb = Some(mb);
    }
    if args.no_normalize {
        config.normalize_instance = false;
    }
    let request = SolveRequest {
        instance: args.instance.clone(),
        cutoff: args.cutoff,
        seed: args.seed,
        params: args.params.clone(),
    };
    satwrap::solve(&request, &config)
}
