//! Application records: configuration, lifecycle state and attribution.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SupervisorError};
use crate::identity::Identity;
use crate::logbuf::LogBuffer;

/// Static description of one supervised program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overrides layered on top of the supervisor's own environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Signal name for graceful stops, `SIGINT` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
}

impl ApplicationConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_stop_signal(mut self, signal: impl Into<String>) -> Self {
        self.stop_signal = Some(signal.into());
        self
    }
}

/// Lifecycle state of an application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    #[default]
    NotRunning,
    Running,
    Stopping,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppState::NotRunning => write!(f, "not_running"),
            AppState::Running => write!(f, "running"),
            AppState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Point-in-time copy of an application's public fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSnapshot {
    pub config: ApplicationConfig,
    pub state: AppState,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub pid: u32,
    pub last_exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_changed_by: Option<Identity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_changed_at: Option<DateTime<Utc>>,
}

fn is_zero(pid: &u32) -> bool {
    *pid == 0
}

impl AppSnapshot {
    pub fn is_running(&self) -> bool {
        self.state == AppState::Running
    }

    /// Drop configuration that only admins may see.
    pub fn sanitize(&mut self) {
        self.config.env.clear();
    }
}

/// Handles for one started run of an application.
#[derive(Debug, Clone)]
pub(crate) struct RunScope {
    pub id: u64,
    /// Cancelling kills the run's process; the exit monitor then finalizes.
    pub cancel: CancellationToken,
}

/// What a stop request acts on.
#[derive(Debug)]
pub(crate) struct StopTarget {
    pub run: RunScope,
    /// Process to signal. `None` when a stop is already in flight or the
    /// process has been reaped and only output draining remains.
    pub pid: Option<u32>,
}

/// Mutable record for one configured application. Lives for the lifetime of
/// the supervisor and is reused across runs.
pub(crate) struct Application {
    config: ApplicationConfig,
    state: AppState,
    pid: u32,
    last_exit_code: i32,
    state_changed_by: Option<Identity>,
    state_changed_at: Option<DateTime<Utc>>,
    logs: Arc<LogBuffer>,
    run: Option<RunScope>,
    /// The current run's process has been waited on; its pid may be reused.
    reaped: bool,
    runs_started: u64,
    state_tx: watch::Sender<AppState>,
}

impl Application {
    pub fn new(config: ApplicationConfig, log_capacity: usize) -> Self {
        let (state_tx, _) = watch::channel(AppState::NotRunning);
        Self {
            config,
            state: AppState::NotRunning,
            pid: 0,
            last_exit_code: 0,
            state_changed_by: None,
            state_changed_at: None,
            logs: Arc::new(LogBuffer::new(log_capacity)),
            run: None,
            reaped: false,
            runs_started: 0,
            state_tx,
        }
    }

    pub fn config(&self) -> &ApplicationConfig {
        &self.config
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    pub fn subscribe(&self) -> watch::Receiver<AppState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> AppSnapshot {
        AppSnapshot {
            config: self.config.clone(),
            state: self.state,
            pid: self.pid,
            last_exit_code: self.last_exit_code,
            state_changed_by: self.state_changed_by.clone(),
            state_changed_at: self.state_changed_at,
        }
    }

    fn set_state(&mut self, state: AppState, actor: Identity) {
        self.state = state;
        self.state_changed_by = Some(actor);
        self.state_changed_at = Some(Utc::now());
        self.state_tx.send_replace(state);
    }

    /// Check that a new run may start.
    pub fn ensure_startable(&self) -> Result<()> {
        match self.state {
            AppState::NotRunning => Ok(()),
            AppState::Running | AppState::Stopping => {
                Err(SupervisorError::AlreadyRunning(self.config.name.clone()))
            }
        }
    }

    /// `NotRunning -> Running` for a freshly spawned process.
    pub fn begin_run(&mut self, actor: Identity, pid: u32, cancel: CancellationToken) -> RunScope {
        self.runs_started += 1;
        let scope = RunScope {
            id: self.runs_started,
            cancel,
        };
        self.pid = pid;
        self.last_exit_code = 0;
        self.run = Some(scope.clone());
        self.reaped = false;
        self.set_state(AppState::Running, actor);
        scope
    }

    /// `Running -> Stopping`. A forced stop is also accepted while already
    /// stopping so a stuck graceful stop can be escalated. The pid is
    /// cleared on leaving `Running` and handed to the caller instead.
    pub fn begin_stop(&mut self, actor: Identity, force: bool) -> Result<StopTarget> {
        let stoppable = match self.state {
            AppState::Running => true,
            AppState::Stopping => force,
            AppState::NotRunning => false,
        };
        let run = match (&self.run, stoppable) {
            (Some(run), true) => run.clone(),
            _ => return Err(SupervisorError::NotRunning(self.config.name.clone())),
        };
        let pid = match self.state {
            AppState::Running if !self.reaped => Some(self.pid),
            _ => None,
        };
        self.pid = 0;
        self.set_state(AppState::Stopping, actor);
        Ok(StopTarget { run, pid })
    }

    /// Record that run `run_id`'s process has been waited on, so no signal
    /// is sent to its pid while the exit monitor drains output.
    pub fn mark_reaped(&mut self, run_id: u64) {
        if self.run.as_ref().map(|r| r.id) == Some(run_id) {
            self.reaped = true;
        }
    }

    /// `Running | Stopping -> NotRunning` once run `run_id` has exited.
    /// Returns the actor to attribute the exit to, or `None` when `run_id`
    /// is not the current run.
    pub fn finish_run(&mut self, run_id: u64, exit_code: i32) -> Option<Identity> {
        if self.run.as_ref().map(|r| r.id) != Some(run_id) {
            return None;
        }
        let actor = self
            .state_changed_by
            .clone()
            .unwrap_or_else(|| Identity::anonymous(Default::default()));
        self.run = None;
        self.reaped = false;
        self.pid = 0;
        self.last_exit_code = exit_code;
        self.set_state(AppState::NotRunning, actor.clone());
        Some(actor)
    }
}
