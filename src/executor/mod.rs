use anyhow::{Context, Result, bail};
use chrono::Utc;
use log::{info, warn};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::config::WrapperConfig;
use crate::instance::{self, NormalizedInstance};
use crate::params::{self, CompiledConfig, portfolio};
use crate::result::{self, ResultRecord, Status};

pub mod run;

use run::{Limits, run_command};

/// One solver run as requested by the caller.
#[derive(Clone, Debug)]
pub struct SolveRequest {
    pub instance: PathBuf,
    /// Seconds; negative means no limit.
    pub cutoff: f64,
    pub seed: i64,
    /// Raw `-@<thread>:...` tokens, head and value alternating.
    pub params: Vec<String>,
}

/// Per-run scratch directory holding the normalized instance and the
/// portfolio file. Everything is removed on drop.
pub struct Artifacts {
    dir: TempDir,
}

impl Artifacts {
    pub fn create() -> Result<Self> {
        let ts = Utc::now().format("%Y%m%d_%H%M%S_%6f");
        let dir = tempfile::Builder::new()
            .prefix(&format!("satwrap_{}_", ts))
            .tempdir()
            .context("Failed to create run directory")?;
        Ok(Self { dir })
    }

    pub fn root_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn portfolio_file(&self) -> PathBuf {
        self.dir.path().join("portfolio.txt")
    }
}

/// Command line handed to the engine plus what classification needs.
struct Invocation {
    argv: Vec<String>,
    limits: Limits,
    instance: Option<NormalizedInstance>,
}

/// Compiles, normalizes, runs and classifies one solver invocation.
///
/// Configuration and instance-structure errors are returned before anything is
/// spawned. Everything that happens to the solver process itself ends up in
/// the returned record.
pub fn solve(request: &SolveRequest, config: &WrapperConfig) -> Result<ResultRecord> {
    let artifacts = Artifacts::create()?;
    let invocation = prepare(request, config, &artifacts)?;
    info!("running {}", invocation.argv.join(" "));

    let output = match run_command(&invocation.argv, &invocation.limits) {
        Ok(output) => output,
        Err(e) => {
            warn!("solver did not run: {:#}", e);
            return Ok(ResultRecord::new(Status::Crashed, 0.0, request.seed));
        }
    };
    let map = invocation.instance.as_ref().map(|i| &i.map);
    let record = result::classify(&output, request.cutoff, request.seed, map);
    info!("{}", record);
    Ok(record)
}

fn prepare(request: &SolveRequest, config: &WrapperConfig, artifacts: &Artifacts) -> Result<Invocation> {
    let tokens: Vec<String> = if config.decode_escapes {
        request.params.iter().map(|t| params::decode_escapes(t)).collect()
    } else {
        request.params.clone()
    };
    let compiled = params::compile(&tokens, &config.prefix, &config.separator)
        .context("Invalid solver configuration")?;
    let Some(solver) = compiled.solver() else {
        bail!("no solver binary configured (expected a -@<thread>:solver token)");
    };

    let instance = if config.normalize_instance {
        let normalized = instance::normalize(&request.instance, artifacts.root_dir())
            .with_context(|| format!("Failed to normalize {}", request.instance.display()))?;
        Some(normalized)
    } else {
        None
    };
    let instance_path = instance
        .as_ref()
        .map_or(request.instance.as_path(), |i| i.path());

    let mut solver_cmd = vec![solver.to_owned()];
    solver_cmd.extend(config.solver_args.iter().cloned());
    solver_cmd.push(instance_path.display().to_string());
    solver_cmd.extend(thread_args(&compiled, config, artifacts)?);
    solver_cmd.extend(config.seed_arg(request.seed));

    let (argv, limits) = match &config.supervisor {
        Some(supervisor) => {
            let mut argv = vec![supervisor.path.display().to_string()];
            if let Some(mb) = config.memory_limit_mb {
                argv.extend(["-M".to_owned(), mb.to_string()]);
            }
            if request.cutoff >= 0.0 {
                argv.extend(["-W".to_owned(), (request.cutoff.ceil() as i64).to_string()]);
            }
            argv.extend(solver_cmd);
            let hard = request.cutoff + supervisor.grace_secs.max(0.0);
            let limits = Limits::new(
                if request.cutoff >= 0.0 { hard } else { request.cutoff },
                config.min_cutoff(),
                None,
            );
            (argv, limits)
        }
        None => (
            solver_cmd,
            Limits::new(request.cutoff, config.min_cutoff(), config.memory_limit_mb),
        ),
    };
    Ok(Invocation {
        argv,
        limits,
        instance,
    })
}

/// Global arguments, followed by either the single member's arguments or a
/// reference to a portfolio file listing every member.
fn thread_args(compiled: &CompiledConfig, config: &WrapperConfig, artifacts: &Artifacts) -> Result<Vec<String>> {
    let mut args = compiled.global_args().to_vec();
    let members: Vec<_> = compiled.members().collect();
    match members.as_slice() {
        [] => {}
        [single] => args.extend(single.args.iter().cloned()),
        _ => {
            let path = artifacts.portfolio_file();
            let file = File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            portfolio::write_portfolio(BufWriter::new(file), members.iter().copied())
                .with_context(|| format!("Failed to write {}", path.display()))?;
            args.extend([
                config.portfolio_file_flag.clone(),
                path.display().to_string(),
                config.portfolio_threads_flag.clone(),
                members.len().to_string(),
            ]);
        }
    }
    Ok(args)
}
