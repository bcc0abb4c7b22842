//! Per-job monitoring coordinator.
//!
//! Each tracked job gets one coordinator running as its own task. It polls the
//! job slowly while idle, arms a one-shot timer for the next known run time,
//! polls quickly while a run is active and publishes a [`StatusSnapshot`]
//! after every fetch. Timer firings and host commands are handled one at a
//! time. A firing whose token is no longer the live timer for its slot is
//! dropped, so a replaced timer can never act on the new state.
//!
//! ```text
//! Idle --poll: running--------------> Active --fast poll: finished--> Idle
//! Idle --poll: future run time------> Scheduled(at)
//! Scheduled(at) --timer at+buffer---> Idle + detection retries
//! any --unrecoverable error---------> Idle (one recovery fetch)
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::progress::ProgressTracker;
use super::scheduler::{Scheduler, TimerEvent, TimerFired, TimerToken, TokioScheduler};
use super::snapshot::{JobMetrics, StatusSnapshot};
use crate::api::{ApiError, BackupApi, Reply};
use crate::config::MonitorSettings;
use crate::logging::LogThrottle;

const COMMAND_BUFFER: usize = 16;
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("status update failed: {0}")]
    UpdateFailed(#[from] ApiError),

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("backup operation timed out after {secs} seconds")]
    Timeout { secs: u64 },

    #[error("coordinator has been unloaded")]
    Unloaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringState {
    Idle,
    Scheduled { at: DateTime<Utc> },
    Active,
}

/// Point-in-time view of a coordinator for the host.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub job_id: String,
    pub state: MonitoringState,
    pub pending_timers: usize,
    pub last_update_success: bool,
    pub last_error: Option<String>,
    pub next_execution: Option<DateTime<Utc>>,
}

type SnapshotSender = watch::Sender<Option<Arc<StatusSnapshot>>>;

pub struct Coordinator {
    job_id: String,
    api: Arc<dyn BackupApi>,
    scheduler: Box<dyn Scheduler>,
    settings: MonitorSettings,
    progress: ProgressTracker,
    state: MonitoringState,
    next_execution: Option<DateTime<Utc>>,
    /// Regular-poll interval, lives from `start` until `unload`.
    poll_timer: Option<TimerToken>,
    /// The timer owned by the current state.
    state_timer: Option<TimerToken>,
    snapshots: Arc<SnapshotSender>,
    sequence: u64,
    last_error: Option<String>,
    unloaded: bool,
    throttle: LogThrottle,
}

impl Coordinator {
    pub fn new(
        job_id: impl Into<String>,
        api: Arc<dyn BackupApi>,
        scheduler: Box<dyn Scheduler>,
        settings: MonitorSettings,
        progress: ProgressTracker,
    ) -> Self {
        let (snapshots, _) = watch::channel(None);
        Self {
            job_id: job_id.into(),
            api,
            scheduler,
            settings,
            progress,
            state: MonitoringState::Idle,
            next_execution: None,
            poll_timer: None,
            state_timer: None,
            snapshots: Arc::new(snapshots),
            sequence: 0,
            last_error: None,
            unloaded: false,
            throttle: LogThrottle::new(PROGRESS_LOG_INTERVAL),
        }
    }

    /// Run a coordinator on its own task with a tokio-backed scheduler.
    pub fn spawn(
        job_id: impl Into<String>,
        api: Arc<dyn BackupApi>,
        settings: MonitorSettings,
        progress: ProgressTracker,
    ) -> CoordinatorHandle {
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let wait_timeout = settings.wait_timeout();

        let coordinator = Coordinator::new(
            job_id,
            api,
            Box::new(TokioScheduler::new(timer_tx)),
            settings,
            progress,
        );
        let handle = CoordinatorHandle {
            job_id: coordinator.job_id.clone(),
            commands: command_tx,
            snapshots: Arc::clone(&coordinator.snapshots),
            wait_timeout,
        };

        tokio::spawn(coordinator.run(timer_rx, command_rx));
        handle
    }

    pub fn state(&self) -> MonitoringState {
        self.state
    }

    pub fn pending_timers(&self) -> usize {
        self.scheduler.pending()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn latest(&self) -> Option<Arc<StatusSnapshot>> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<StatusSnapshot>>> {
        self.snapshots.subscribe()
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            job_id: self.job_id.clone(),
            state: self.state,
            pending_timers: self.pending_timers(),
            last_update_success: self.last_error.is_none(),
            last_error: self.last_error.clone(),
            next_execution: self.next_execution,
        }
    }

    /// Arm the regular poll. Idempotent.
    pub fn start(&mut self) {
        if self.unloaded || self.poll_timer.is_some() {
            return;
        }
        let interval = self.settings.scan_interval();
        debug!(job_id = %self.job_id, interval_secs = interval.as_secs(), "Starting regular polling");
        self.poll_timer = Some(
            self.scheduler
                .schedule_interval(interval, TimerEvent::RegularPoll),
        );
    }

    /// Full fetch plus running check, published as one snapshot.
    pub async fn refresh(&mut self) -> Result<Arc<StatusSnapshot>, MonitorError> {
        if self.unloaded {
            return Err(MonitorError::Unloaded);
        }
        debug!(job_id = %self.job_id, host = %self.api.host(), "Refreshing backup status");

        match self.fetch_metrics(true).await {
            Ok(metrics) => {
                let running = metrics.current_status;
                let snapshot = self.publish(metrics);
                self.last_error = None;
                self.apply_running_state(running);
                self.manage_future_monitoring();
                Ok(snapshot)
            }
            Err(error) => {
                self.recover(&error, "status refresh").await;
                Err(MonitorError::UpdateFailed(error))
            }
        }
    }

    /// Enter active monitoring without waiting for a poll to notice the run.
    pub fn start_monitoring(&mut self) {
        if self.unloaded {
            return;
        }
        self.start_active_monitoring();
    }

    pub async fn handle_timer(&mut self, fired: TimerFired) {
        if self.unloaded {
            return;
        }
        let live = match fired.event {
            TimerEvent::RegularPoll => self.poll_timer == Some(fired.token),
            _ => self.state_timer == Some(fired.token),
        };
        if !live {
            debug!(job_id = %self.job_id, event = ?fired.event, "Ignoring event from a replaced timer");
            return;
        }
        match fired.event {
            TimerEvent::RegularPoll => {
                if let Err(error) = self.refresh().await {
                    debug!(job_id = %self.job_id, %error, "Regular poll failed");
                }
            }
            TimerEvent::ScheduledRun => self.on_scheduled_time().await,
            TimerEvent::ActiveCheck => self.on_active_check().await,
            TimerEvent::DetectionRetry { attempt } => self.check_for_scheduled_backup(attempt).await,
        }
    }

    /// Cancel every timer. Safe to call more than once.
    pub fn unload(&mut self) {
        if let Some(token) = self.poll_timer.take() {
            self.scheduler.cancel(token);
        }
        self.cancel_state_timer();
        if !self.unloaded {
            info!(job_id = %self.job_id, "Coordinator unloaded");
        }
        self.state = MonitoringState::Idle;
        self.unloaded = true;
    }

    async fn run(
        mut self,
        mut timers: mpsc::UnboundedReceiver<TimerFired>,
        mut commands: mpsc::Receiver<Command>,
    ) {
        self.start();
        info!(job_id = %self.job_id, host = %self.api.host(), "Coordinator started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Unload(done)) => {
                        self.unload();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.unload();
                        break;
                    }
                },
                Some(fired) = timers.recv() => self.handle_timer(fired).await,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Refresh(reply) => {
                let result = self.refresh().await;
                let _ = reply.send(result);
            }
            Command::StartMonitoring(reply) => {
                self.start_monitoring();
                let _ = reply.send(self.sequence);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Unload(done) => {
                self.unload();
                let _ = done.send(());
            }
        }
    }

    async fn fetch_metrics(&mut self, check_running: bool) -> Result<JobMetrics, ApiError> {
        let job = self.api.get_job(&self.job_id).await?.into_result()?;
        let running = if check_running {
            self.check_running().await?
        } else {
            false
        };

        let now = Utc::now();
        self.next_execution = job.next_run_time().filter(|at| *at > now);
        Ok(JobMetrics::from_definition(&job, running, now))
    }

    /// Lightweight check: the progress report names this job in a running phase.
    async fn check_running(&self) -> Result<bool, ApiError> {
        match self.api.get_progress().await? {
            Reply::Data(progress) => {
                let running = progress.job_id == self.job_id && progress.phase.is_running();
                if running {
                    if self.throttle.should_log(&progress.phase.to_string()) {
                        info!(
                            job_id = %self.job_id,
                            phase = %progress.phase,
                            percent = (progress.overall_progress * 100.0).round(),
                            files = progress.processed_file_count,
                            "Backup in progress"
                        );
                    }
                    self.progress.update(&self.job_id, progress).await;
                }
                Ok(running)
            }
            Reply::Error(error) => {
                debug!(job_id = %self.job_id, %error, "No progress reported");
                Ok(false)
            }
        }
    }

    fn publish(&mut self, metrics: JobMetrics) -> Arc<StatusSnapshot> {
        self.sequence += 1;
        let snapshot = Arc::new(StatusSnapshot {
            job_id: self.job_id.clone(),
            sequence: self.sequence,
            published_at: Utc::now(),
            metrics,
        });
        self.snapshots.send_replace(Some(Arc::clone(&snapshot)));
        debug!(
            job_id = %self.job_id,
            sequence = snapshot.sequence,
            running = snapshot.metrics.current_status,
            "Published status"
        );
        snapshot
    }

    fn set_state(&mut self, state: MonitoringState) {
        if self.state != state {
            debug!(job_id = %self.job_id, from = ?self.state, to = ?state, "Monitoring state changed");
            self.state = state;
        }
    }

    fn cancel_state_timer(&mut self) {
        if let Some(token) = self.state_timer.take() {
            self.scheduler.cancel(token);
        }
    }

    fn apply_running_state(&mut self, running: bool) {
        match (running, self.state) {
            (true, MonitoringState::Active) | (false, MonitoringState::Idle) => {}
            (false, MonitoringState::Scheduled { .. }) => {}
            (true, _) => {
                info!(job_id = %self.job_id, "Backup running, starting active monitoring");
                self.start_active_monitoring();
            }
            (false, MonitoringState::Active) => {
                info!(job_id = %self.job_id, "Backup no longer running, stopping active monitoring");
                self.stop_active_monitoring();
            }
        }
    }

    fn manage_future_monitoring(&mut self) {
        let Some(at) = self.next_execution.filter(|at| *at > Utc::now()) else {
            return;
        };
        match self.state {
            MonitoringState::Scheduled { at: current } if current != at => {
                info!(job_id = %self.job_id, from = %current, to = %at, "Next run time changed");
                self.schedule_future_monitoring(at);
            }
            MonitoringState::Idle => self.schedule_future_monitoring(at),
            _ => {}
        }
    }

    fn start_active_monitoring(&mut self) {
        if self.state == MonitoringState::Active {
            debug!(job_id = %self.job_id, "Active monitoring already running");
            return;
        }
        self.cancel_state_timer();
        self.set_state(MonitoringState::Active);
        self.throttle.reset();

        let interval = self.settings.active_interval();
        info!(job_id = %self.job_id, interval_secs = interval.as_secs(), "Active monitoring started");
        self.state_timer = Some(
            self.scheduler
                .schedule_interval(interval, TimerEvent::ActiveCheck),
        );
    }

    fn stop_active_monitoring(&mut self) {
        if self.state != MonitoringState::Active {
            return;
        }
        self.cancel_state_timer();
        self.set_state(MonitoringState::Idle);
    }

    fn schedule_future_monitoring(&mut self, at: DateTime<Utc>) {
        self.cancel_state_timer();
        let delay = (at - Utc::now()).to_std().unwrap_or_default() + self.settings.schedule_buffer();
        info!(job_id = %self.job_id, next_run = %at, delay_secs = delay.as_secs(), "Scheduled monitoring for next run");

        self.set_state(MonitoringState::Scheduled { at });
        self.state_timer = Some(
            self.scheduler
                .schedule_once(delay, TimerEvent::ScheduledRun),
        );
    }

    async fn on_scheduled_time(&mut self) {
        if !matches!(self.state, MonitoringState::Scheduled { .. }) {
            debug!(job_id = %self.job_id, state = ?self.state, "Ignoring late scheduled-run timer");
            return;
        }
        // The one-shot has fired and unregistered itself.
        self.state_timer = None;
        self.set_state(MonitoringState::Idle);
        info!(job_id = %self.job_id, "Scheduled run time reached, checking for running backup");
        self.check_for_scheduled_backup(0).await;
    }

    async fn check_for_scheduled_backup(&mut self, attempt: u32) {
        if self.state != MonitoringState::Idle {
            debug!(job_id = %self.job_id, state = ?self.state, "Ignoring stale detection retry");
            return;
        }
        // A retry's one-shot has fired and unregistered itself.
        if attempt > 0 {
            self.state_timer = None;
        }

        match self.check_running().await {
            Ok(true) => {
                info!(job_id = %self.job_id, attempt, "Scheduled backup detected");
                let metrics = match self.latest() {
                    Some(previous) => JobMetrics {
                        current_status: true,
                        ..previous.metrics.clone()
                    },
                    None => JobMetrics {
                        current_status: true,
                        ..Default::default()
                    },
                };
                self.publish(metrics);
                self.start_active_monitoring();
            }
            Ok(false) if attempt < self.settings.detection_retries => {
                let delay = self.settings.detection_backoff(attempt);
                info!(
                    job_id = %self.job_id,
                    attempt = attempt + 1,
                    max = self.settings.detection_retries,
                    delay_secs = delay.as_secs(),
                    "No running backup yet, checking again"
                );
                self.state_timer = Some(
                    self.scheduler
                        .schedule_once(delay, TimerEvent::DetectionRetry { attempt: attempt + 1 }),
                );
            }
            Ok(false) => {
                warn!(job_id = %self.job_id, attempts = attempt, "Scheduled backup never started, giving up");
                match self.fetch_metrics(false).await {
                    Ok(metrics) => {
                        self.publish(metrics);
                        self.manage_future_monitoring();
                    }
                    Err(error) => self.recover(&error, "scheduled run detection").await,
                }
            }
            Err(error) => self.recover(&error, "scheduled run detection").await,
        }
    }

    async fn on_active_check(&mut self) {
        if self.state != MonitoringState::Active {
            debug!(job_id = %self.job_id, state = ?self.state, "Ignoring late active check");
            return;
        }

        match self.check_running().await {
            Ok(true) => {}
            Ok(false) => {
                info!(job_id = %self.job_id, "Backup finished");
                self.stop_active_monitoring();
                self.progress.remove(&self.job_id).await;

                self.scheduler.sleep(self.settings.grace_period()).await;
                if self.unloaded {
                    return;
                }

                match self.fetch_metrics(true).await {
                    Ok(metrics) => {
                        let running = metrics.current_status;
                        self.publish(metrics);
                        self.last_error = None;
                        self.apply_running_state(running);
                        self.manage_future_monitoring();
                    }
                    Err(error) => self.recover(&error, "final status fetch").await,
                }
            }
            Err(error) => self.recover(&error, "active monitoring").await,
        }
    }

    async fn recover(&mut self, error: &ApiError, context: &'static str) {
        error!(job_id = %self.job_id, context, %error, "Monitoring failed, resetting to idle");
        self.last_error = Some(error.to_string());
        self.cancel_state_timer();
        self.set_state(MonitoringState::Idle);
        self.progress.remove(&self.job_id).await;

        match self.fetch_metrics(false).await {
            Ok(metrics) => {
                self.publish(metrics);
                self.manage_future_monitoring();
            }
            Err(recovery) => {
                warn!(job_id = %self.job_id, error = %recovery, "Recovery fetch failed");
            }
        }
    }
}

enum Command {
    Refresh(oneshot::Sender<Result<Arc<StatusSnapshot>, MonitorError>>),
    /// Replies with the sequence of the last snapshot published before entering Active.
    StartMonitoring(oneshot::Sender<u64>),
    Status(oneshot::Sender<CoordinatorStatus>),
    Unload(oneshot::Sender<()>),
}

/// Cloneable handle to a running coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    job_id: String,
    commands: mpsc::Sender<Command>,
    snapshots: Arc<SnapshotSender>,
    wait_timeout: Duration,
}

impl CoordinatorHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn latest(&self) -> Option<Arc<StatusSnapshot>> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<StatusSnapshot>>> {
        self.snapshots.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.snapshots.receiver_count()
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MonitorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| MonitorError::Unloaded)?;
        response.await.map_err(|_| MonitorError::Unloaded)
    }

    pub async fn refresh(&self) -> Result<Arc<StatusSnapshot>, MonitorError> {
        self.request(Command::Refresh).await?
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, MonitorError> {
        self.request(Command::Status).await
    }

    pub async fn start_monitoring(&self) -> Result<(), MonitorError> {
        self.request(Command::StartMonitoring).await.map(|_| ())
    }

    /// Stop the coordinator and cancel its timers. No-op once stopped.
    pub async fn unload(&self) {
        if self.request(Command::Unload).await.is_err() {
            debug!(job_id = %self.job_id, "Coordinator already stopped");
        }
    }

    /// Refresh, then wait for the run to finish within the configured timeout.
    pub async fn start_and_wait(&self) -> Result<Arc<StatusSnapshot>, MonitorError> {
        self.wait_for_completion(self.wait_timeout).await
    }

    /// Refresh, then wait for a later snapshot reporting no running backup.
    /// Fails with the job's error message if that snapshot reports a failed run.
    pub async fn wait_for_completion(
        &self,
        timeout: Duration,
    ) -> Result<Arc<StatusSnapshot>, MonitorError> {
        let updates = self.subscribe();
        let baseline = self.refresh().await?.sequence;
        self.wait_until_finished(updates, baseline, timeout).await
    }

    /// Follow a run that was just triggered: enter active monitoring without
    /// an initial refresh and wait until fast polling sees it finish.
    pub async fn follow_run(&self, timeout: Duration) -> Result<Arc<StatusSnapshot>, MonitorError> {
        let updates = self.subscribe();
        let baseline = self.request(Command::StartMonitoring).await?;
        self.wait_until_finished(updates, baseline, timeout).await
    }

    /// Resolves with `None` as soon as the coordinator task stops.
    async fn wait_until_finished(
        &self,
        mut updates: watch::Receiver<Option<Arc<StatusSnapshot>>>,
        baseline: u64,
        timeout: Duration,
    ) -> Result<Arc<StatusSnapshot>, MonitorError> {
        let finished = async {
            tokio::select! {
                latest = updates.wait_for(|latest| {
                    latest
                        .as_ref()
                        .is_some_and(|s| s.sequence > baseline && !s.metrics.current_status)
                }) => latest.ok().and_then(|latest| latest.clone()),
                () = self.commands.closed() => None,
            }
        };

        let snapshot = match tokio::time::timeout(timeout, finished).await {
            Err(_) => {
                warn!(job_id = %self.job_id, timeout_secs = timeout.as_secs(), "Timed out waiting for backup");
                return Err(MonitorError::Timeout {
                    secs: timeout.as_secs(),
                });
            }
            Ok(None) => {
                info!(job_id = %self.job_id, "Coordinator stopped while waiting for backup");
                return Err(MonitorError::Unloaded);
            }
            Ok(Some(snapshot)) => snapshot,
        };

        if snapshot.metrics.last_backup_status {
            let message = snapshot
                .metrics
                .last_backup_error_message
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(MonitorError::BackupFailed(message));
        }
        Ok(snapshot)
    }
}
