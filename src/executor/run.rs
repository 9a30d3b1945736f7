use anyhow::{Context, Result};
use log::{debug, warn};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

/// How long captured pipes may keep draining after the child is gone.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Resource limits for one solver process.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Limits {
    /// Hard wall-clock limit. `None` means no limit.
    pub cutoff: Option<Duration>,
    /// Address-space ceiling applied to the child, in megabytes.
    pub memory_mb: Option<u64>,
}

impl Limits {
    /// Negative, NaN and unrepresentably large cutoffs mean "no limit";
    /// others are raised to `floor`.
    pub fn new(cutoff_secs: f64, floor: Duration, memory_mb: Option<u64>) -> Self {
        let cutoff = if cutoff_secs >= 0.0 {
            Duration::try_from_secs_f64(cutoff_secs).ok().map(|d| d.max(floor))
        } else {
            None
        };
        Self { cutoff, memory_mb }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Completed { exit_code: Option<i32> },
    TimedOut,
}

/// Fully captured result of one process run.
#[derive(Clone, Debug)]
pub struct RunOutput {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl RunOutput {
    pub fn timed_out(&self) -> bool {
        self.termination == Termination::TimedOut
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Completed { exit_code } => exit_code,
            Termination::TimedOut => None,
        }
    }
}

/// Runs `argv` to completion or kills it when the cutoff fires.
///
/// Blocks the caller; a private single-threaded runtime races the exit of the
/// child against the timer, and whichever loses is dropped.
pub fn run_command(argv: &[String], limits: &Limits) -> Result<RunOutput> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    rt.block_on(run_command_async(argv, limits))
}

pub async fn run_command_async(argv: &[String], limits: &Limits) -> Result<RunOutput> {
    let (program, args) = argv.split_first().context("empty command")?;
    debug!("spawning {:?} with {:?}", argv, limits);
    let start = Instant::now();
    let mut child = spawn(program, args, limits.memory_mb)
        .with_context(|| format!("Failed to spawn {}", program))?;

    let out_pipe = child.stdout.take().context("child missing stdout pipe")?;
    let err_pipe = child.stderr.take().context("child missing stderr pipe")?;
    let out_task = tokio::spawn(read_to_string(out_pipe));
    let err_task = tokio::spawn(read_to_string(err_pipe));

    let termination = match limits.cutoff {
        Some(cutoff) => match tokio::time::timeout(cutoff, child.wait()).await {
            Ok(status) => Termination::Completed {
                exit_code: status?.code(),
            },
            Err(_) => {
                kill_child_group(&mut child);
                child.wait().await?;
                Termination::TimedOut
            }
        },
        None => Termination::Completed {
            exit_code: child.wait().await?.code(),
        },
    };
    let elapsed = start.elapsed();

    let stdout = drain(out_task).await;
    let stderr = drain(err_task).await;
    debug!("{:?} after {:.3}s", termination, elapsed.as_secs_f64());
    Ok(RunOutput {
        termination,
        stdout,
        stderr,
        elapsed,
    })
}

fn spawn(program: &str, args: &[String], memory_mb: Option<u64>) -> std::io::Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    unsafe {
        // Own session so the whole process tree can be killed at once.
        cmd.pre_exec(move || {
            libc::setsid();
            if let Some(mb) = memory_mb {
                let bytes = mb.saturating_mul(1024 * 1024) as libc::rlim_t;
                let limit = libc::rlimit {
                    rlim_cur: bytes,
                    rlim_max: bytes,
                };
                if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
    #[cfg(not(unix))]
    let _ = memory_mb;
    cmd.spawn()
}

#[cfg(unix)]
fn kill_child_group(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn kill_child_group(child: &mut Child) {
    let _ = child.start_kill();
}

async fn read_to_string<R: AsyncRead + Unpin>(mut pipe: R) -> std::io::Result<String> {
    let mut buf = Vec::with_capacity(4096);
    pipe.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn drain(task: tokio::task::JoinHandle<std::io::Result<String>>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_GRACE, task).await {
        Ok(Ok(Ok(text))) => text,
        Ok(Ok(Err(e))) => {
            warn!("failed to read child output: {}", e);
            String::new()
        }
        Ok(Err(e)) => {
            warn!("output reader panicked: {}", e);
            String::new()
        }
        Err(_) => {
            warn!("child output still open {:?} after exit", PIPE_DRAIN_GRACE);
            String::new()
        }
    }
}
