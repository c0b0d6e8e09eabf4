//! Worker launching and process tracking.
//!
//! Workers run detached in their own process group so a controller
//! restart or kill never takes in-flight work down with it. The
//! controller keeps only the launcher shim's handle for reaping; the
//! worker's lifetime is observed through the persisted store and pid
//! liveness probes.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::process::{Child, Command};

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::graph::Step;

/// Marker file whose presence in the workflow home requests a clean exit.
pub const KILL_MARKER: &str = "kill.gantry";

/// How the worker is told to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Execute the step for real.
    Run,
    /// Go through the motions without side effects.
    Test,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Run => "run",
            RunMode::Test => "test",
        }
    }
}

/// One fully resolved worker invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub errlog: PathBuf,
}

/// Build the worker invocation for one step.
pub fn build_invocation(
    config: &AppConfig,
    workflow: &str,
    workflow_id: i64,
    step: &Step,
    step_id: i64,
    mode: RunMode,
    undo: bool,
) -> Invocation {
    let home = config.workflow_home(workflow);
    let errlog = home.join(format!("{}.err", step.name));
    let skip_marker = home.join(format!("{}.skip", step.name));

    let mut args = vec![
        "--home".to_string(),
        home.display().to_string(),
        "--workflow-id".to_string(),
        workflow_id.to_string(),
        "--step".to_string(),
        step.name.clone(),
        "--step-id".to_string(),
        step_id.to_string(),
        "--invoker".to_string(),
        step.invoker.clone().unwrap_or_default(),
        "--errlog".to_string(),
        errlog.display().to_string(),
        "--mode".to_string(),
        mode.as_str().to_string(),
        "--skip-marker".to_string(),
        skip_marker.display().to_string(),
    ];
    if undo {
        args.push("--undo".to_string());
    }
    for (name, value) in &step.params {
        args.push("--param".to_string());
        args.push(format!("{}={}", name, value));
    }

    Invocation {
        program: config.worker_command.clone(),
        args,
        errlog,
    }
}

/// Launch a worker detached in its own process group. Stdout and stderr go
/// to the step's error log.
pub fn spawn_detached(invocation: &Invocation) -> AppResult<Child> {
    let errfile = std::fs::File::create(&invocation.errlog)?;
    let outfile = errfile.try_clone()?;

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(outfile))
        .stderr(Stdio::from(errfile));

    // Detach into a fresh process group on Unix.
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    cmd.spawn().map_err(|e| {
        AppError::Controller(format!(
            "failed to launch '{}': {}",
            invocation.program, e
        ))
    })
}

/// Whether a process with the given pid is alive. Signal 0 probes without
/// delivering anything; EPERM still means the process exists.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// Tracks launcher shims for reaping and remembers which steps were
/// launched so one step is never launched twice while its row still
/// reads ON_DECK.
#[derive(Default)]
pub struct LaunchTracker {
    children: HashMap<String, Child>,
    pending: HashSet<String>,
}

impl LaunchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a launched step.
    pub fn launch(&mut self, step: &str, child: Child) {
        self.pending.insert(step.to_string());
        self.children.insert(step.to_string(), child);
    }

    /// The step was launched and its row has not moved past ON_DECK yet.
    pub fn in_flight(&self, step: &str) -> bool {
        self.pending.contains(step)
    }

    /// The store showed the step past ON_DECK; the launch guard can drop.
    pub fn settle(&mut self, step: &str) {
        self.pending.remove(step);
    }

    /// Reap launcher shims that have exited. Returns the reaped step names.
    pub fn reap(&mut self) -> Vec<String> {
        let mut reaped = Vec::new();
        for (step, child) in self.children.iter_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(step = %step, code = ?status.code(), "Launcher reaped");
                    reaped.push(step.clone());
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(step = %step, error = %err, "Launcher wait failed");
                    reaped.push(step.clone());
                }
            }
        }
        for step in &reaped {
            self.children.remove(step);
        }
        reaped
    }

    /// Number of shims still tracked.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Whether the kill marker exists in the workflow home.
pub fn kill_marker_present(home: &Path) -> bool {
    home.join(KILL_MARKER).exists()
}

/// Remove a kill marker left behind by a previous shutdown.
pub fn clear_kill_marker(home: &Path) -> AppResult<()> {
    match std::fs::remove_file(home.join(KILL_MARKER)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    fn sample_step() -> (Graph, usize) {
        let mut g = Graph::new("etl", "1");
        let id = g.add("", "extract").unwrap();
        g.step_mut(id).invoker = Some("extractor".to_string());
        g.step_mut(id)
            .params
            .insert("src".to_string(), "s3://in".to_string());
        (g, id)
    }

    #[test]
    fn test_invocation_carries_contract_flags() {
        let config = AppConfig::default();
        let (g, id) = sample_step();

        let inv = build_invocation(&config, "etl", 7, g.step(id), 42, RunMode::Run, false);

        assert_eq!(inv.program, "gantry-worker");
        let joined = inv.args.join(" ");
        assert!(joined.contains("--workflow-id 7"));
        assert!(joined.contains("--step extract"));
        assert!(joined.contains("--step-id 42"));
        assert!(joined.contains("--invoker extractor"));
        assert!(joined.contains("--mode run"));
        assert!(joined.contains("--param src=s3://in"));
        assert!(!joined.contains("--undo"));
        assert!(inv.errlog.ends_with("etl/extract.err"));
    }

    #[test]
    fn test_invocation_undo_flag() {
        let config = AppConfig::default();
        let (g, id) = sample_step();

        let inv = build_invocation(&config, "etl", 7, g.step(id), 42, RunMode::Test, true);
        assert!(inv.args.contains(&"--undo".to_string()));
        assert!(inv.args.join(" ").contains("--mode test"));
    }

    #[test]
    fn test_process_alive_self() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(0));
        assert!(!process_alive(-1));
    }

    #[test]
    fn test_kill_marker_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!kill_marker_present(dir.path()));

        std::fs::write(dir.path().join(KILL_MARKER), "").unwrap();
        assert!(kill_marker_present(dir.path()));

        clear_kill_marker(dir.path()).unwrap();
        assert!(!kill_marker_present(dir.path()));
        // clearing twice is fine
        clear_kill_marker(dir.path()).unwrap();
    }

    #[tokio::test]
    async fn test_tracker_reaps_exited_shim() {
        let mut tracker = LaunchTracker::new();
        let child = Command::new("true").spawn().unwrap();
        tracker.launch("extract", child);
        assert!(tracker.in_flight("extract"));

        let mut reaped = Vec::new();
        for _ in 0..50 {
            reaped = tracker.reap();
            if !reaped.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(reaped, vec!["extract".to_string()]);
        assert!(tracker.is_empty());

        // reaping the shim does not settle the launch guard
        assert!(tracker.in_flight("extract"));
        tracker.settle("extract");
        assert!(!tracker.in_flight("extract"));
    }
}
