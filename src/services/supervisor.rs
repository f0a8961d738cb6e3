use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use crate::{
    config::Settings,
    error::ApiError,
    models::ScanStatus,
    repositories::ScanRepository,
    services::{command::NmapCommand, events::ProgressReporter},
};

/// Running progress is capped below the parsing milestone so the lifecycle
/// percent stays meaningful: 90 and above belong to the post-scan phases.
const RUNNING_PERCENT_CAP: f64 = 89.0;

/// How a supervised scanner run ended.
#[derive(Debug)]
pub enum LaunchOutcome {
    /// Process exited cleanly and left a usable XML artifact.
    Completed,
    /// Cancellation was requested and the process was torn down.
    Cancelled,
    /// The scanner refused to run without raw-socket privileges. The caller
    /// may retry once with a degraded command profile.
    PrivilegeError { tail: String },
    /// Any other failure: nonzero exit, or a missing/undersized artifact.
    Failed { reason: String },
}

/// Tuning knobs for process teardown and output validation.
#[derive(Debug, Clone)]
pub struct SupervisorLimits {
    pub min_output_bytes: u64,
    pub output_grace_polls: u32,
    pub output_poll_interval: Duration,
    pub kill_grace: Duration,
    pub tail_lines: usize,
}

impl SupervisorLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            min_output_bytes: settings.min_output_bytes,
            output_grace_polls: settings.output_grace_polls,
            output_poll_interval: Duration::from_secs_f64(settings.output_poll_interval_seconds),
            kill_grace: Duration::from_secs(settings.process_kill_grace_seconds),
            tail_lines: settings.output_tail_lines,
        }
    }
}

/// Bounded ring of the most recent scanner output lines, kept for error
/// reporting and privilege-failure detection.
struct OutputTail {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl OutputTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn push(&self, line: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    fn snapshot(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lines.lock().unwrap().len()
    }
}

fn progress_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"About ([0-9.]+)% done").expect("progress regex is valid")
    })
}

/// Extract a completion percentage from a scanner stdout line.
fn parse_progress(line: &str) -> Option<f64> {
    progress_regex()
        .captures(line)
        .and_then(|caps| caps[1].parse::<f64>().ok())
}

const PRIVILEGE_PATTERNS: &[&str] = &[
    "requires root privileges",
    "You requested a scan type which requires root privileges",
    "Operation not permitted",
];

fn looks_like_privilege_error(tail: &str) -> bool {
    PRIVILEGE_PATTERNS.iter().any(|p| tail.contains(p))
}

/// Supervises one scanner process: spawns it, streams its output into the
/// event bus and progress reporter, honors the cancellation token, and
/// validates the artifact it leaves behind.
pub struct ProcessSupervisor {
    repo: Arc<dyn ScanRepository>,
    limits: SupervisorLimits,
}

impl ProcessSupervisor {
    pub fn new(repo: Arc<dyn ScanRepository>, limits: SupervisorLimits) -> Self {
        Self { repo, limits }
    }

    pub async fn launch(
        &self,
        command: &NmapCommand,
        reporter: &ProgressReporter,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<LaunchOutcome, ApiError> {
        let scan_id = reporter.scan_id();

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ApiError::process_failure(format!(
                    "failed to spawn {}: {}",
                    command.program, e
                ))
            })?;

        if let Some(pid) = child.id() {
            self.repo.set_process_id(&scan_id, Some(pid as i64)).await?;
            tracing::info!(scan_id = %scan_id, pid = pid, "scanner process started");
        }

        let tail = Arc::new(OutputTail::new(self.limits.tail_lines));

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ApiError::process_failure("scanner stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ApiError::process_failure("scanner stderr was not captured"))?;

        // stderr is drained concurrently so a chatty scanner cannot block on
        // a full pipe while we read stdout.
        let stderr_tail = Arc::clone(&tail);
        let stderr_bus = reporter.bus().clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                stderr_tail.push(&line);
                stderr_bus.scan_log(scan_id, &line);
            }
        });

        let mut stdout_lines = BufReader::new(stdout).lines();
        let mut cancelled = false;

        loop {
            tokio::select! {
                line = stdout_lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            tail.push(&line);
                            reporter.log_line(&line);
                            if let Some(percent) = parse_progress(&line) {
                                reporter
                                    .emit(
                                        ScanStatus::Running,
                                        percent.min(RUNNING_PERCENT_CAP),
                                        None,
                                    )
                                    .await?;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(scan_id = %scan_id, error = %e, "scanner stdout read error");
                            break;
                        }
                    }
                }
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        cancelled = true;
                        self.terminate(&mut child, scan_id).await;
                        break;
                    }
                }
            }
        }

        let exit = child.wait().await;
        let _ = stderr_task.await;
        self.repo.set_process_id(&scan_id, None).await?;

        if cancelled {
            tracing::info!(scan_id = %scan_id, "scanner process cancelled");
            return Ok(LaunchOutcome::Cancelled);
        }

        let status = exit.map_err(|e| {
            ApiError::process_failure(format!("failed to reap scanner process: {}", e))
        })?;

        if !status.success() {
            let tail_text = tail.snapshot();
            if looks_like_privilege_error(&tail_text) {
                tracing::warn!(scan_id = %scan_id, "scanner lacked raw-socket privileges");
                return Ok(LaunchOutcome::PrivilegeError { tail: tail_text });
            }
            return Ok(LaunchOutcome::Failed {
                reason: format!(
                    "scanner exited with {}; last output:\n{}",
                    status, tail_text
                ),
            });
        }

        if self.wait_for_output(&command.output_path).await {
            Ok(LaunchOutcome::Completed)
        } else {
            Ok(LaunchOutcome::Failed {
                reason: format!(
                    "scanner exited cleanly but produced no usable output at {}; last output:\n{}",
                    command.output_path.display(),
                    tail.snapshot()
                ),
            })
        }
    }

    /// Kill the child, allowing a short grace period for it to exit before
    /// the final backstop kill.
    async fn terminate(&self, child: &mut tokio::process::Child, scan_id: uuid::Uuid) {
        if let Err(e) = child.start_kill() {
            tracing::warn!(scan_id = %scan_id, error = %e, "failed to signal scanner process");
        }
        if timeout(self.limits.kill_grace, child.wait()).await.is_err() {
            tracing::warn!(scan_id = %scan_id, "scanner did not exit within grace period");
            let _ = child.kill().await;
        }
    }

    /// The XML artifact can lag the process exit on slow filesystems; poll a
    /// bounded number of times before declaring the output unusable.
    async fn wait_for_output(&self, path: &Path) -> bool {
        for attempt in 0..self.limits.output_grace_polls {
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.len() > self.limits.min_output_bytes => return true,
                _ => {
                    if attempt + 1 < self.limits.output_grace_polls {
                        sleep(self.limits.output_poll_interval).await;
                    }
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanType;
    use crate::services::events::EventBus;
    use crate::services::test_support::InMemoryScanRepository;
    use std::path::PathBuf;

    fn test_limits() -> SupervisorLimits {
        SupervisorLimits {
            min_output_bytes: 100,
            output_grace_polls: 3,
            output_poll_interval: Duration::from_millis(50),
            kill_grace: Duration::from_millis(500),
            tail_lines: 40,
        }
    }

    fn shell_command(script: &str, output_path: PathBuf) -> NmapCommand {
        NmapCommand {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            output_path,
        }
    }

    async fn setup() -> (
        Arc<InMemoryScanRepository>,
        ProcessSupervisor,
        ProgressReporter,
        watch::Receiver<bool>,
        uuid::Uuid,
    ) {
        let repo = Arc::new(InMemoryScanRepository::new());
        let scan = repo.insert(ScanType::FullTcp, "10.0.0.0/24").await;
        let bus = EventBus::new(64);
        let supervisor = ProcessSupervisor::new(repo.clone(), test_limits());
        let reporter = ProgressReporter::new(scan.id, repo.clone(), bus);
        let (_tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test
        std::mem::forget(_tx);
        (repo, supervisor, reporter, rx, scan.id)
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(
            parse_progress("SYN Stealth Scan Timing: About 45.03% done; ETC: 14:05"),
            Some(45.03)
        );
        assert_eq!(parse_progress("About 100.00% done"), Some(100.0));
        assert_eq!(parse_progress("Discovered open port 22/tcp"), None);
    }

    #[test]
    fn test_output_tail_is_bounded() {
        let tail = OutputTail::new(40);
        for i in 0..100 {
            tail.push(&format!("line {}", i));
        }
        assert_eq!(tail.len(), 40);
        let snapshot = tail.snapshot();
        assert!(!snapshot.contains("line 59"));
        assert!(snapshot.starts_with("line 60"));
        assert!(snapshot.ends_with("line 99"));
    }

    #[test]
    fn test_privilege_detection() {
        assert!(looks_like_privilege_error(
            "You requested a scan type which requires root privileges.\nQUITTING!"
        ));
        assert!(looks_like_privilege_error(
            "socket troubles: Operation not permitted"
        ));
        assert!(!looks_like_privilege_error("Host seems down"));
    }

    #[tokio::test]
    async fn test_successful_run_streams_progress_and_validates_output() {
        let dir = std::env::temp_dir().join(format!("sup-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let out = dir.join("out.xml");

        let script = format!(
            "echo 'Starting scan'; echo 'About 25.00% done'; echo 'About 75.50% done'; \
             head -c 200 /dev/zero > {}",
            out.display()
        );
        let (repo, supervisor, reporter, cancel, scan_id) = setup().await;
        let cmd = shell_command(&script, out);

        let outcome = supervisor.launch(&cmd, &reporter, cancel).await.unwrap();
        assert!(matches!(outcome, LaunchOutcome::Completed));

        let record = repo.get(&scan_id).await;
        assert_eq!(record.percent, 75.5);
        assert_eq!(record.status, "running");
        // pid is cleared after exit
        assert_eq!(record.process_id, None);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_undersized_output_fails_validation() {
        let dir = std::env::temp_dir().join(format!("sup-test-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let out = dir.join("out.xml");

        let script = format!("head -c 10 /dev/zero > {}", out.display());
        let (_repo, supervisor, reporter, cancel, _scan_id) = setup().await;
        let cmd = shell_command(&script, out);

        let outcome = supervisor.launch(&cmd, &reporter, cancel).await.unwrap();
        match outcome {
            LaunchOutcome::Failed { reason } => {
                assert!(reason.contains("no usable output"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_output_fails_validation() {
        let (_repo, supervisor, reporter, cancel, _scan_id) = setup().await;
        let cmd = shell_command("true", PathBuf::from("/nonexistent/out.xml"));

        let outcome = supervisor.launch(&cmd, &reporter, cancel).await.unwrap();
        assert!(matches!(outcome, LaunchOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_privilege_error_is_distinguished() {
        let script = "echo 'You requested a scan type which requires root privileges.' >&2; \
                      echo 'QUITTING!' >&2; exit 1";
        let (_repo, supervisor, reporter, cancel, _scan_id) = setup().await;
        let cmd = shell_command(script, PathBuf::from("/tmp/never-written.xml"));

        let outcome = supervisor.launch(&cmd, &reporter, cancel).await.unwrap();
        match outcome {
            LaunchOutcome::PrivilegeError { tail } => {
                assert!(tail.contains("requires root privileges"));
            }
            other => panic!("expected PrivilegeError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure_with_tail() {
        let script = "echo 'Failed to resolve target'; exit 1";
        let (_repo, supervisor, reporter, cancel, _scan_id) = setup().await;
        let cmd = shell_command(script, PathBuf::from("/tmp/never-written.xml"));

        let outcome = supervisor.launch(&cmd, &reporter, cancel).await.unwrap();
        match outcome {
            LaunchOutcome::Failed { reason } => {
                assert!(reason.contains("Failed to resolve target"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_tears_down_process() {
        let repo = Arc::new(InMemoryScanRepository::new());
        let scan = repo.insert(ScanType::FullTcp, "10.0.0.0/24").await;
        let bus = EventBus::new(64);
        let supervisor = ProcessSupervisor::new(repo.clone(), test_limits());
        let reporter = ProgressReporter::new(scan.id, repo.clone(), bus);
        let (tx, rx) = watch::channel(false);

        let cmd = shell_command("sleep 30", PathBuf::from("/tmp/never-written.xml"));

        let cancel_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = tx.send(true);
        });

        let started = std::time::Instant::now();
        let outcome = supervisor.launch(&cmd, &reporter, rx).await.unwrap();
        cancel_task.await.unwrap();

        assert!(matches!(outcome, LaunchOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(repo.get(&scan.id).await.process_id, None);
    }
}
