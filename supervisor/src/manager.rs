//! Process supervisor. Owns every application record and drives its
//! lifecycle.
//!
//! A single registry lock orders all state transitions. Each started run
//! gets two output collectors and one exit monitor; none of them hold the
//! registry lock while blocked on the process. Output goes straight into the
//! application's log buffer, which has its own lock.

use std::collections::{BTreeMap, HashMap};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::app::{AppSnapshot, AppState, Application, ApplicationConfig, RunScope};
use crate::audit::{self, AuditAction};
use crate::error::{Result, SupervisorError};
use crate::identity::Identity;
use crate::logbuf::{LogLine, LogSource, DEFAULT_CAPACITY};
use crate::signal::{self, Delivery, StopSignal};

/// How long a restart waits for the old process to exit.
pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the exit monitor waits for both collectors to drain after exit.
/// Grandchildren can hold the pipes open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Exit code recorded when the real status could not be determined.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Construction-time settings for a [`Manager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Lines retained per application.
    pub log_capacity: usize,
    pub restart_timeout: Duration,
    /// Parent span for every event and task the supervisor emits.
    pub span: Span,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_CAPACITY,
            restart_timeout: DEFAULT_RESTART_TIMEOUT,
            span: info_span!("supervisor"),
        }
    }
}

struct Inner {
    apps: RwLock<HashMap<String, Application>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    restart_timeout: Duration,
    span: Span,
}

/// Supervisor for a fixed set of applications. Cheap to clone; clones share
/// the same registry.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Manager {
    /// Build a registry from `configs`. Names are expected to be unique;
    /// a repeated name is skipped with a warning.
    pub fn new(configs: impl IntoIterator<Item = ApplicationConfig>, options: ManagerOptions) -> Self {
        let mut apps = HashMap::new();
        for config in configs {
            if apps.contains_key(&config.name) {
                warn!(parent: &options.span, app = %config.name, "Duplicate application name, ignoring");
                continue;
            }
            apps.insert(config.name.clone(), Application::new(config, options.log_capacity));
        }

        info!(parent: &options.span, applications = apps.len(), "Supervisor initialised");

        Self {
            inner: Arc::new(Inner {
                apps: RwLock::new(apps),
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                restart_timeout: options.restart_timeout,
                span: options.span,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Snapshots of every application, keyed by name.
    pub async fn get_apps(&self) -> BTreeMap<String, AppSnapshot> {
        let apps = self.inner.apps.read().await;
        apps.iter()
            .map(|(name, app)| (name.clone(), app.snapshot()))
            .collect()
    }

    pub async fn get_app(&self, name: &str) -> Result<AppSnapshot> {
        let apps = self.inner.apps.read().await;
        apps.get(name)
            .map(Application::snapshot)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))
    }

    /// Copy of the application's log buffer, oldest line first.
    pub async fn get_logs(&self, name: &str) -> Result<Vec<LogLine>> {
        self.get_logs_since(name, 0).await
    }

    /// Retained lines with a sequence number greater than `seq`.
    pub async fn get_logs_since(&self, name: &str, seq: u64) -> Result<Vec<LogLine>> {
        let logs = {
            let apps = self.inner.apps.read().await;
            let app = apps
                .get(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
            Arc::clone(app.logs())
        };
        Ok(logs.since(seq))
    }

    /// Wait until the application is `NotRunning` or `timeout` elapses, then
    /// return its snapshot either way.
    pub async fn wait_for_exit(&self, name: &str, timeout: Duration) -> Result<AppSnapshot> {
        let mut state = {
            let apps = self.inner.apps.read().await;
            apps.get(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?
                .subscribe()
        };
        let _ = tokio::time::timeout(timeout, state.wait_for(|s| *s == AppState::NotRunning)).await;
        self.get_app(name).await
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the application and return as soon as the process is running.
    pub async fn start_app(&self, identity: &Identity, name: &str) -> Result<()> {
        let span = &self.inner.span;
        let mut apps = self.inner.apps.write().await;
        if self.inner.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }

        let app = apps
            .get_mut(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        app.ensure_startable()?;

        let spawn_failed = |source| SupervisorError::SpawnFailed {
            name: name.to_string(),
            source,
        };

        let mut child = spawn(app.config()).map_err(spawn_failed)?;
        let (stdout, stderr, pid) = match (child.stdout.take(), child.stderr.take(), child.id()) {
            (Some(stdout), Some(stderr), Some(pid)) => (stdout, stderr, pid),
            // Dropping the child kills it (kill_on_drop) and tokio reaps it.
            _ => {
                return Err(spawn_failed(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "failed to capture process output",
                )))
            }
        };

        let scope = app.begin_run(identity.clone(), pid, self.inner.shutdown.child_token());
        audit::record(span, app.logs(), name, identity, AuditAction::Start);

        let run_span = info_span!(parent: span, "run", app = %name, pid, run = scope.id);
        let collectors = [
            self.spawn_collector(stdout, LogSource::Stdout, app, &run_span),
            self.spawn_collector(stderr, LogSource::Stderr, app, &run_span),
        ];
        self.inner.tasks.spawn(
            Arc::clone(&self.inner)
                .watch_exit(name.to_string(), child, scope, collectors)
                .instrument(run_span),
        );

        info!(parent: span, app = %name, pid, user = %identity.display_name, "Application started");
        Ok(())
    }

    fn spawn_collector<R>(&self, reader: R, source: LogSource, app: &Application, run_span: &Span) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logs = Arc::clone(app.logs());
        let shutdown = self.inner.shutdown.clone();
        self.inner.tasks.spawn(
            async move {
                tokio::select! {
                    () = collect_output(reader, source, |line| {
                        logs.push(source, line);
                    }) => {}
                    () = shutdown.cancelled() => debug!(%source, "Output collection cancelled"),
                }
            }
            .instrument(run_span.clone()),
        )
    }

    /// Begin stopping the application and return without waiting for it to
    /// exit. A forced stop kills immediately; otherwise the configured stop
    /// signal is delivered.
    pub async fn stop_app(&self, identity: &Identity, name: &str, force: bool) -> Result<()> {
        let span = &self.inner.span;
        let (target, signal) = {
            let mut apps = self.inner.apps.write().await;
            let app = apps
                .get_mut(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
            let target = app.begin_stop(identity.clone(), force)?;

            let signal = if force {
                StopSignal::Kill
            } else {
                StopSignal::resolve(app.config().stop_signal.as_deref()).unwrap_or_else(|e| {
                    warn!(parent: span, app = %name, "{e}, defaulting to SIGINT");
                    StopSignal::default()
                })
            };
            let action = if force {
                AuditAction::ForceStop
            } else {
                AuditAction::Stop(signal)
            };
            audit::record(span, app.logs(), name, identity, action);
            (target, signal)
        };
        let run = target.run;

        if force {
            info!(parent: span, app = %name, pid = ?target.pid, "Force stopping application");
            run.cancel.cancel();
            return Ok(());
        }

        let Some(pid) = target.pid else {
            debug!(parent: span, app = %name, "Process already reaped, nothing to signal");
            return Ok(());
        };
        info!(parent: span, app = %name, pid, %signal, "Stopping application");
        match signal::deliver(pid, signal) {
            Ok(Delivery::Sent) => {}
            Ok(Delivery::NoSuchProcess) => {
                debug!(parent: span, app = %name, pid, "Process already exited");
            }
            Ok(Delivery::Unsupported) => {
                debug!(parent: span, app = %name, pid, "Signals unsupported, cancelling run");
                run.cancel.cancel();
            }
            Err(e) => {
                warn!(parent: span, app = %name, pid, "Failed to signal application: {e}, cancelling run");
                run.cancel.cancel();
            }
        }
        Ok(())
    }

    pub async fn force_stop_app(&self, identity: &Identity, name: &str) -> Result<()> {
        self.stop_app(identity, name, true).await
    }

    /// Stop the application if it is running, wait for it to exit, then
    /// start it again.
    pub async fn restart_app(&self, identity: &Identity, name: &str) -> Result<()> {
        match self.stop_app(identity, name, false).await {
            Ok(()) => {}
            Err(SupervisorError::NotRunning(_)) => {
                debug!(parent: &self.inner.span, app = %name, "Application was not running during restart");
            }
            Err(e) => return Err(e),
        }

        let snapshot = self.wait_for_exit(name, self.inner.restart_timeout).await?;
        if snapshot.state != AppState::NotRunning {
            warn!(
                parent: &self.inner.span,
                app = %name,
                timeout = ?self.inner.restart_timeout,
                "Application did not exit in time for restart"
            );
        }

        self.start_app(identity, name).await
    }

    /// Refuse further starts, kill every running process and wait up to
    /// `timeout` for all supervisor tasks to finish. Returns `false` if
    /// tasks were still running when the timeout expired.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let span = &self.inner.span;
        {
            // Taken so no start is half-way through when the token flips.
            let _apps = self.inner.apps.write().await;
            self.inner.shutdown.cancel();
        }
        self.inner.tasks.close();
        info!(parent: span, tasks = self.inner.tasks.len(), "Shutting down supervisor");

        match tokio::time::timeout(timeout, self.inner.tasks.wait()).await {
            Ok(()) => {
                info!(parent: span, "Supervisor shut down cleanly");
                true
            }
            Err(_) => {
                warn!(
                    parent: span,
                    tasks = self.inner.tasks.len(),
                    "Timed out waiting for supervisor tasks"
                );
                false
            }
        }
    }
}

impl Inner {
    /// Wait for the run's process to exit and move the application back to
    /// `NotRunning`. Runs to completion even if waiting fails.
    async fn watch_exit(
        self: Arc<Self>,
        name: String,
        mut child: Child,
        scope: RunScope,
        collectors: [JoinHandle<()>; 2],
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            () = scope.cancel.cancelled() => {
                debug!("Run cancelled, killing process");
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill process: {e}");
                }
                child.wait().await
            }
        };

        let exit_code = match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!("Failed to wait for application: {e}");
                UNKNOWN_EXIT_CODE
            }
        };

        // The pid may be reused from here on.
        if let Some(app) = self.apps.write().await.get_mut(&name) {
            app.mark_reaped(scope.id);
        }

        // Output written just before exit should land before the exit line.
        let [stdout, stderr] = collectors;
        let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
            let _ = tokio::join!(stdout, stderr);
        })
        .await;
        if drained.is_err() {
            debug!("Output still open after exit");
        }

        let mut apps = self.apps.write().await;
        let Some(app) = apps.get_mut(&name) else {
            return;
        };
        match app.finish_run(scope.id, exit_code) {
            Some(actor) => {
                audit::record(&self.span, app.logs(), &name, &actor, AuditAction::Exit(exit_code));
                info!(exit_code, "Application stopped");
            }
            None => debug!("Exit of a superseded run ignored"),
        }
    }
}

fn spawn(config: &ApplicationConfig) -> std::io::Result<Child> {
    let mut cmd = Command::new(&config.path);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    cmd.spawn()
}

/// Read `reader` line by line until EOF, handing each line (without its
/// terminator) to `sink`. Invalid UTF-8 is replaced rather than dropped.
async fn collect_output<R, F>(reader: R, source: LogSource, mut sink: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                sink(line.trim_end_matches(['\n', '\r']));
            }
            Err(e) => {
                debug!(%source, "Output collection stopped: {e}");
                break;
            }
        }
    }
}

/// The process's exit code, `128 + signal` for signal deaths on Unix.
fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNKNOWN_EXIT_CODE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::{Grants, Role};

    fn manager(configs: Vec<ApplicationConfig>) -> Manager {
        Manager::new(configs, ManagerOptions::default())
    }

    fn operator() -> Identity {
        Identity::user("u1", "Olivia", Grants::wildcard(Role::Operator))
    }

    #[tokio::test]
    async fn test_new_manager_apps_are_idle() {
        let mgr = manager(vec![
            ApplicationConfig::new("app1", "/bin/echo").with_args(["hello"]),
            ApplicationConfig::new("app2", "/bin/echo").with_args(["world"]),
        ]);
        let apps = mgr.get_apps().await;
        assert_eq!(apps.len(), 2);
        for snap in apps.values() {
            assert_eq!(snap.state, AppState::NotRunning);
            assert_eq!(snap.pid, 0);
            assert_eq!(snap.last_exit_code, 0);
        }
    }

    #[tokio::test]
    async fn test_duplicate_names_keep_first() {
        let mgr = manager(vec![
            ApplicationConfig::new("dup", "/bin/first"),
            ApplicationConfig::new("dup", "/bin/second"),
        ]);
        let snap = mgr.get_app("dup").await.unwrap();
        assert_eq!(snap.config.path, std::path::PathBuf::from("/bin/first"));
    }

    #[tokio::test]
    async fn test_unknown_application() {
        let mgr = manager(vec![]);
        let who = operator();
        assert!(matches!(mgr.get_app("nope").await, Err(SupervisorError::NotFound(_))));
        assert!(matches!(mgr.get_logs("nope").await, Err(SupervisorError::NotFound(_))));
        assert!(matches!(mgr.start_app(&who, "nope").await, Err(SupervisorError::NotFound(_))));
        assert!(matches!(
            mgr.stop_app(&who, "nope", false).await,
            Err(SupervisorError::NotFound(_))
        ));
        assert!(matches!(
            mgr.restart_app(&who, "nope").await,
            Err(SupervisorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_idle_application_leaves_state() {
        let mgr = manager(vec![ApplicationConfig::new("idle", "/bin/true")]);
        let err = mgr.stop_app(&operator(), "idle", false).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning(_)));
        assert_eq!(err.to_string(), "application idle is not running");

        let snap = mgr.get_app("idle").await.unwrap();
        assert_eq!(snap.state, AppState::NotRunning);
        assert!(snap.state_changed_by.is_none());
        assert!(mgr.get_logs("idle").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_state_unchanged() {
        let mgr = manager(vec![ApplicationConfig::new("ghost", "/nonexistent/binary")]);
        let err = mgr.start_app(&operator(), "ghost").await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));

        let snap = mgr.get_app("ghost").await.unwrap();
        assert_eq!(snap.state, AppState::NotRunning);
        assert_eq!(snap.pid, 0);
        assert!(mgr.get_logs("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collect_output_splits_lines() {
        let input: &[u8] = b"first\r\nsecond\n\xffbad\nlast-without-newline";
        let mut lines = Vec::new();
        collect_output(input, LogSource::Stdout, |l| lines.push(l.to_string())).await;
        assert_eq!(lines, ["first", "second", "\u{fffd}bad", "last-without-newline"]);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_starts() {
        let mgr = manager(vec![ApplicationConfig::new("app", "/bin/true")]);
        assert!(mgr.shutdown(Duration::from_secs(1)).await);
        assert!(matches!(
            mgr.start_app(&operator(), "app").await,
            Err(SupervisorError::ShuttingDown)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_from_status() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        // Raw wait status 9 = killed by SIGKILL.
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }
}
