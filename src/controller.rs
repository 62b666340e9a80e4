//! The backup controller: a singleton in-progress backup with
//! start/pause/stop/resume/restart, durable state, and structured events
//! for the embedding shell.
//!
//! The controller is the async shell over the synchronous engine. Exactly
//! one engine task runs at a time; pause and stop cancel it cooperatively
//! and persist state so a later resume can re-walk with the same
//! configuration. Status transitions are delivered reliably; progress and
//! log events are dropped when the consumer lags.

use crate::engine::BackupEngine;
use crate::progress::{BackupProgress, ProgressSink};
use crate::state::{BackupConfig, BackupState, BackupStatus};
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Capacity of the controller -> shell event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 1000;

/// Capacity of the engine -> controller progress queue.
const PROGRESS_QUEUE_CAPACITY: usize = 256;

/// How hard we bound destination-directory creation; a stalled network
/// volume must not hang the controller.
const DESTINATION_CREATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum interval between state-file writes driven by progress updates.
const STATE_SAVE_INTERVAL: Duration = Duration::from_secs(1);

/// Events published to the embedding shell.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ControllerEvent {
    /// Free-text log line.
    Log(String),
    /// A backup status transition.
    Status(BackupStatus),
    /// Progress payload; best-effort delivery.
    Progress(BackupProgress),
    /// Advisory emitted at startup when resumable state exists.
    Resumable(String),
}

/// Create the bounded event channel a controller publishes into.
pub fn event_channel() -> (
    mpsc::Sender<ControllerEvent>,
    mpsc::Receiver<ControllerEvent>,
) {
    mpsc::channel(EVENT_QUEUE_CAPACITY)
}

#[derive(Default)]
struct Inner {
    state: Option<BackupState>,
    cancel: Option<CancellationToken>,
}

/// Owns the singleton in-progress backup.
pub struct BackupController {
    inner: Arc<Mutex<Inner>>,
    events: mpsc::Sender<ControllerEvent>,
}

impl BackupController {
    pub fn new(events: mpsc::Sender<ControllerEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
        }
    }

    /// Probe a destination for interrupted-backup state. Publishes a
    /// `Resumable` advisory and adopts the state without auto-resuming.
    /// A state recorded as `running` belonged to a process that is gone,
    /// so it is adopted as `stopped`.
    pub async fn probe_resumable(&self, destination: &Path) -> Result<Option<BackupStatus>> {
        let loaded = match BackupState::load(destination) {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to read backup state in {}: {}", destination.display(), e);
                return Ok(None);
            }
        };

        let Some(mut state) = loaded else {
            return Ok(None);
        };
        if !matches!(state.status, BackupStatus::Running | BackupStatus::Paused) {
            return Ok(None);
        }

        if state.status == BackupStatus::Running {
            state.status = BackupStatus::Stopped;
        }
        let status = state.status;
        let progress = state.progress.clone();

        {
            let mut inner = self.lock();
            if inner.state.is_some() {
                return Ok(None);
            }
            inner.state = Some(state);
        }

        self.emit_log(format!(
            "Found interrupted backup in {}",
            destination.display()
        ));
        let _ = self
            .events
            .send(ControllerEvent::Resumable(format!(
                "Interrupted backup found in {}",
                destination.display()
            )))
            .await;
        self.emit_status(status).await;
        let _ = self.events.try_send(ControllerEvent::Progress(progress));

        Ok(Some(status))
    }

    /// Start a new backup. Rejected while a backup is running or paused.
    pub async fn start(&self, config: BackupConfig) -> Result<Uuid> {
        let (id, token) = {
            let mut inner = self.lock();
            if let Some(state) = &inner.state {
                if matches!(state.status, BackupStatus::Running | BackupStatus::Paused) {
                    return Err(Error::Precondition {
                        operation: "start",
                        reason: format!("a backup is already {}", state.status),
                    });
                }
            }

            let state = BackupState::new(config.clone());
            let id = state.id;
            let token = CancellationToken::new();
            inner.state = Some(state);
            inner.cancel = Some(token.clone());
            (id, token)
        };

        info!("Backup {} starting", id);
        self.emit_status(BackupStatus::Running).await;
        self.emit_log(format!("Backup {} started", id));

        self.spawn_run(id, config, token);
        Ok(id)
    }

    /// Pause the running backup: cancel the engine, persist state.
    pub async fn pause(&self) -> Result<()> {
        let state = self.transition(
            "pause",
            &[BackupStatus::Running],
            BackupStatus::Paused,
            true,
        )?;
        Self::persist(state).await;
        self.emit_status(BackupStatus::Paused).await;
        self.emit_log("Backup paused".to_string());
        Ok(())
    }

    /// Stop the running or paused backup: cancel the engine, persist state.
    pub async fn stop(&self) -> Result<()> {
        let state = self.transition(
            "stop",
            &[BackupStatus::Running, BackupStatus::Paused],
            BackupStatus::Stopped,
            true,
        )?;
        Self::persist(state).await;
        self.emit_status(BackupStatus::Stopped).await;
        self.emit_log("Backup stopped".to_string());
        Ok(())
    }

    /// Resume a paused or stopped backup with its recorded configuration.
    /// Change detection is content-aware, so the fresh walk deduplicates
    /// everything the interrupted run already stored.
    pub async fn resume(&self) -> Result<Uuid> {
        let (id, config, token) = {
            let mut inner = self.lock();
            let Some(state) = inner.state.as_mut() else {
                return Err(Error::Precondition {
                    operation: "resume",
                    reason: "no backup state available".to_string(),
                });
            };
            if !matches!(state.status, BackupStatus::Paused | BackupStatus::Stopped) {
                return Err(Error::Precondition {
                    operation: "resume",
                    reason: format!("backup is {}", state.status),
                });
            }

            state.status = BackupStatus::Running;
            state.last_update = Utc::now();
            let result = (state.id, state.config.clone());
            let token = CancellationToken::new();
            inner.cancel = Some(token.clone());
            (result.0, result.1, token)
        };

        info!("Backup {} resuming", id);
        self.emit_status(BackupStatus::Running).await;
        self.emit_log(format!("Backup {} resumed", id));

        self.spawn_run(id, config, token);
        Ok(id)
    }

    /// Cancel whatever is in flight, discard state, and start fresh.
    pub async fn restart(&self, config: BackupConfig) -> Result<Uuid> {
        {
            let mut inner = self.lock();
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
            inner.state = None;
        }
        self.emit_log("Backup restarting".to_string());
        self.start(config).await
    }

    /// A read-only copy of the current state.
    pub fn get_state(&self) -> Option<BackupState> {
        self.lock().state.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply a command transition under the lock and hand back a copy of
    /// the new state for persistence outside the critical section.
    fn transition(
        &self,
        operation: &'static str,
        from: &[BackupStatus],
        to: BackupStatus,
        cancel_engine: bool,
    ) -> Result<BackupState> {
        let mut inner = self.lock();
        let Some(state) = inner.state.as_mut() else {
            return Err(Error::Precondition {
                operation,
                reason: "no backup in progress".to_string(),
            });
        };
        if !from.contains(&state.status) {
            return Err(Error::Precondition {
                operation,
                reason: format!("backup is {}", state.status),
            });
        }

        state.status = to;
        state.last_update = Utc::now();
        let copy = state.clone();
        if cancel_engine {
            if let Some(cancel) = inner.cancel.take() {
                cancel.cancel();
            }
        }
        Ok(copy)
    }

    fn spawn_run(&self, id: Uuid, config: BackupConfig, token: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        let events = self.events.clone();
        tokio::spawn(async move {
            run_backup_task(inner, events, id, config, token).await;
        });
    }

    async fn emit_status(&self, status: BackupStatus) {
        let _ = self.events.send(ControllerEvent::Status(status)).await;
    }

    fn emit_log(&self, message: String) {
        let _ = self.events.try_send(ControllerEvent::Log(message));
    }

    async fn persist(state: BackupState) {
        match tokio::task::spawn_blocking(move || state.save()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to save backup state: {}", e),
            Err(e) => warn!("Backup state save task failed: {}", e),
        }
    }
}

/// Supervises one engine run to completion. All state mutations are keyed
/// by run id so a superseded run can never clobber its successor.
async fn run_backup_task(
    inner: Arc<Mutex<Inner>>,
    events: mpsc::Sender<ControllerEvent>,
    id: Uuid,
    config: BackupConfig,
    token: CancellationToken,
) {
    if let Err(e) = ensure_destination(&config).await {
        finish(&inner, &events, id, Err(e)).await;
        return;
    }

    // Persist the initial running state so an interrupted process leaves
    // discoverable evidence behind.
    let initial_state = lock_inner(&inner).state.clone();
    if let Some(state) = initial_state {
        BackupController::persist(state).await;
    }

    let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_QUEUE_CAPACITY);
    let forwarder = tokio::spawn(forward_progress(
        Arc::clone(&inner),
        events.clone(),
        id,
        progress_rx,
    ));

    let engine_config = config.clone();
    let engine_token = token.clone();
    let engine_result = tokio::task::spawn_blocking(move || {
        BackupEngine::new(&engine_config.destination).run(
            &engine_config.sources,
            &engine_config.ignore_patterns,
            &ProgressSink::new(progress_tx),
            &engine_token,
        )
    })
    .await;

    let _ = forwarder.await;

    let result = match engine_result {
        Ok(result) => result,
        Err(join_error) => Err(Error::Io(std::io::Error::other(format!(
            "backup task panicked: {}",
            join_error
        )))),
    };
    finish(&inner, &events, id, result.map(|_| ())).await;
}

async fn ensure_destination(config: &BackupConfig) -> Result<()> {
    let destination = config.destination.clone();
    let create = tokio::task::spawn_blocking(move || fs::create_dir_all(&destination));

    match tokio::time::timeout(DESTINATION_CREATE_TIMEOUT, create).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(Error::DestinationIo {
            path: config.destination.clone(),
            source: e,
        }),
        Ok(Err(join_error)) => Err(Error::Io(std::io::Error::other(join_error.to_string()))),
        Err(_) => Err(Error::Timeout {
            operation: "destination directory creation",
            seconds: DESTINATION_CREATE_TIMEOUT.as_secs(),
        }),
    }
}

/// Drains engine progress: updates shared state, persists it at a bounded
/// rate, and forwards the payload to the shell (drop-on-full).
async fn forward_progress(
    inner: Arc<Mutex<Inner>>,
    events: mpsc::Sender<ControllerEvent>,
    id: Uuid,
    mut rx: mpsc::Receiver<BackupProgress>,
) {
    let mut last_save = Instant::now();

    while let Some(progress) = rx.recv().await {
        let to_save = {
            let mut guard = lock_inner(&inner);
            match guard.state.as_mut() {
                Some(state) if state.id == id && state.status == BackupStatus::Running => {
                    state.progress = progress.clone();
                    state.last_update = Utc::now();
                    if !progress.current_file.is_empty() {
                        state.current_file = Some(progress.current_file.clone());
                        state.processed_paths.insert(progress.current_file.clone());
                    }
                    if last_save.elapsed() >= STATE_SAVE_INTERVAL {
                        last_save = Instant::now();
                        Some(state.clone())
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(state) = to_save {
            BackupController::persist(state).await;
        }

        let _ = events.try_send(ControllerEvent::Progress(progress));
    }
}

async fn finish(
    inner: &Arc<Mutex<Inner>>,
    events: &mpsc::Sender<ControllerEvent>,
    id: Uuid,
    result: Result<()>,
) {
    match result {
        Ok(()) => {
            let destination = {
                let guard = lock_inner(inner);
                match guard.state.as_ref() {
                    Some(state) if state.id == id => Some(state.config.destination.clone()),
                    _ => None,
                }
            };

            if let Some(destination) = destination {
                // Remove the state file before announcing completion so an
                // observer of the completed status never finds stale state.
                if let Err(e) = BackupState::remove(&destination) {
                    warn!("Failed to remove backup state file: {}", e);
                }
                {
                    let mut guard = lock_inner(inner);
                    if let Some(state) = guard.state.as_mut() {
                        if state.id == id {
                            state.status = BackupStatus::Completed;
                            state.last_update = Utc::now();
                            guard.cancel = None;
                        }
                    }
                }
                info!("Backup {} completed", id);
                let _ = events.send(ControllerEvent::Status(BackupStatus::Completed)).await;
                let _ = events.try_send(ControllerEvent::Log(format!(
                    "Backup {} completed successfully",
                    id
                )));
            }
        }
        Err(Error::Cancelled) => {
            // Pause/stop already recorded their status; a cancellation
            // arriving any other way leaves the run stopped.
            let dangling = {
                let mut guard = lock_inner(inner);
                match guard.state.as_mut() {
                    Some(state) if state.id == id && state.status == BackupStatus::Running => {
                        state.status = BackupStatus::Stopped;
                        state.last_update = Utc::now();
                        let copy = Some(state.clone());
                        guard.cancel = None;
                        copy
                    }
                    _ => None,
                }
            };

            if let Some(state) = dangling {
                BackupController::persist(state).await;
                let _ = events.send(ControllerEvent::Status(BackupStatus::Cancelled)).await;
            }
            let _ = events.try_send(ControllerEvent::Log(format!("Backup {} cancelled", id)));
        }
        Err(e) => {
            let failed = {
                let mut guard = lock_inner(inner);
                match guard.state.as_mut() {
                    Some(state) if state.id == id => {
                        state.status = BackupStatus::Failed;
                        state.last_update = Utc::now();
                        state.progress.error = Some(e.to_string());
                        let copy = Some(state.clone());
                        guard.cancel = None;
                        copy
                    }
                    _ => None,
                }
            };

            if let Some(state) = failed {
                BackupController::persist(state).await;
                warn!("Backup {} failed: {}", id, e);
                let _ = events.send(ControllerEvent::Status(BackupStatus::Failed)).await;
                let _ = events.try_send(ControllerEvent::Log(format!("Backup {} failed: {}", id, e)));
            }
        }
    }
}

fn lock_inner(inner: &Arc<Mutex<Inner>>) -> std::sync::MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::latest_snapshot;
    use tempfile::TempDir;

    fn test_config(temp: &TempDir) -> BackupConfig {
        let source = temp.path().join("src");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.txt"), b"hi").unwrap();
        BackupConfig {
            destination: temp.path().join("dest"),
            sources: vec![source],
            ignore_patterns: Vec::new(),
        }
    }

    async fn wait_for_status(
        controller: &BackupController,
        status: BackupStatus,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if controller.get_state().map(|s| s.status) == Some(status) {
                return true;
            }
            if Instant::now() > deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_start_runs_to_completion() -> Result<()> {
        let temp = TempDir::new()?;
        let config = test_config(&temp);
        let destination = config.destination.clone();

        let (tx, mut rx) = event_channel();
        let controller = BackupController::new(tx);
        controller.start(config).await?;

        assert!(wait_for_status(&controller, BackupStatus::Completed).await);
        assert!(latest_snapshot(&destination)?.is_some());
        // State file is removed on success.
        assert!(BackupState::load(&destination)?.is_none());

        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ControllerEvent::Status(status) = event {
                statuses.push(status);
            }
        }
        assert_eq!(statuses.first(), Some(&BackupStatus::Running));
        assert_eq!(statuses.last(), Some(&BackupStatus::Completed));
        Ok(())
    }

    #[tokio::test]
    async fn test_start_rejected_while_paused() -> Result<()> {
        let temp = TempDir::new()?;
        let config = test_config(&temp);
        fs::create_dir_all(&config.destination)?;

        // Seed interrupted state on disk and adopt it via the probe.
        let mut state = BackupState::new(config.clone());
        state.status = BackupStatus::Paused;
        state.save()?;

        let (tx, _rx) = event_channel();
        let controller = BackupController::new(tx);
        let probed = controller.probe_resumable(&config.destination).await?;
        assert_eq!(probed, Some(BackupStatus::Paused));

        let result = controller.start(config).await;
        assert!(matches!(result, Err(Error::Precondition { operation: "start", .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_pause_requires_running() {
        let (tx, _rx) = event_channel();
        let controller = BackupController::new(tx);
        let result = controller.pause().await;
        assert!(matches!(result, Err(Error::Precondition { operation: "pause", .. })));
    }

    #[tokio::test]
    async fn test_stop_from_paused_persists_state() -> Result<()> {
        let temp = TempDir::new()?;
        let config = test_config(&temp);
        fs::create_dir_all(&config.destination)?;

        let mut state = BackupState::new(config.clone());
        state.status = BackupStatus::Paused;
        state.save()?;

        let (tx, _rx) = event_channel();
        let controller = BackupController::new(tx);
        controller.probe_resumable(&config.destination).await?;
        controller.stop().await?;

        let on_disk = BackupState::load(&config.destination)?.unwrap();
        assert_eq!(on_disk.status, BackupStatus::Stopped);
        assert_eq!(
            controller.get_state().map(|s| s.status),
            Some(BackupStatus::Stopped)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_from_stopped_completes() -> Result<()> {
        let temp = TempDir::new()?;
        let config = test_config(&temp);
        let destination = config.destination.clone();
        fs::create_dir_all(&destination)?;

        let mut state = BackupState::new(config.clone());
        state.status = BackupStatus::Paused;
        state.save()?;

        let (tx, _rx) = event_channel();
        let controller = BackupController::new(tx);
        controller.probe_resumable(&destination).await?;
        controller.stop().await?;

        let id = controller.resume().await?;
        assert_eq!(id, state.id);
        assert!(wait_for_status(&controller, BackupStatus::Completed).await);
        assert!(latest_snapshot(&destination)?.is_some());
        assert!(BackupState::load(&destination)?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_resume_requires_resumable_state() {
        let (tx, _rx) = event_channel();
        let controller = BackupController::new(tx);
        let result = controller.resume().await;
        assert!(matches!(result, Err(Error::Precondition { operation: "resume", .. })));
    }

    #[tokio::test]
    async fn test_probe_adopts_crashed_running_state_as_stopped() -> Result<()> {
        let temp = TempDir::new()?;
        let config = test_config(&temp);
        fs::create_dir_all(&config.destination)?;

        let state = BackupState::new(config.clone());
        state.save()?;
        assert_eq!(state.status, BackupStatus::Running);

        let (tx, mut rx) = event_channel();
        let controller = BackupController::new(tx);
        let probed = controller.probe_resumable(&config.destination).await?;
        assert_eq!(probed, Some(BackupStatus::Stopped));

        let mut saw_resumable = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ControllerEvent::Resumable(_)) {
                saw_resumable = true;
            }
        }
        assert!(saw_resumable);

        // And the adopted state can be resumed.
        controller.resume().await?;
        assert!(wait_for_status(&controller, BackupStatus::Completed).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_probe_without_state_is_quiet() -> Result<()> {
        let temp = TempDir::new()?;
        let (tx, mut rx) = event_channel();
        let controller = BackupController::new(tx);

        assert_eq!(controller.probe_resumable(temp.path()).await?, None);
        assert!(rx.try_recv().is_err());
        assert!(controller.get_state().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_restart_discards_state_and_runs_fresh() -> Result<()> {
        let temp = TempDir::new()?;
        let config = test_config(&temp);
        let destination = config.destination.clone();
        fs::create_dir_all(&destination)?;

        let mut state = BackupState::new(config.clone());
        state.status = BackupStatus::Paused;
        state.save()?;

        let (tx, _rx) = event_channel();
        let controller = BackupController::new(tx);
        controller.probe_resumable(&destination).await?;
        let old_id = controller.get_state().unwrap().id;

        let new_id = controller.restart(config).await?;
        assert_ne!(new_id, old_id);
        assert!(wait_for_status(&controller, BackupStatus::Completed).await);
        assert!(latest_snapshot(&destination)?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_run_retains_state_file() -> Result<()> {
        let temp = TempDir::new()?;
        // A destination path that collides with an existing file fails
        // directory creation.
        let blocked = temp.path().join("blocked");
        fs::write(&blocked, b"file in the way")?;

        let source = temp.path().join("src");
        fs::create_dir_all(&source)?;
        fs::write(source.join("a.txt"), b"hi")?;

        let config = BackupConfig {
            destination: blocked.join("dest"),
            sources: vec![source],
            ignore_patterns: Vec::new(),
        };

        let (tx, _rx) = event_channel();
        let controller = BackupController::new(tx);
        controller.start(config).await?;

        assert!(wait_for_status(&controller, BackupStatus::Failed).await);
        let state = controller.get_state().unwrap();
        assert!(state.progress.error.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn test_get_state_returns_copy() -> Result<()> {
        let temp = TempDir::new()?;
        let config = test_config(&temp);

        let (tx, _rx) = event_channel();
        let controller = BackupController::new(tx);
        controller.start(config).await?;
        assert!(wait_for_status(&controller, BackupStatus::Completed).await);

        let mut copy = controller.get_state().unwrap();
        copy.status = BackupStatus::Failed;
        assert_eq!(
            controller.get_state().map(|s| s.status),
            Some(BackupStatus::Completed)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_full_progress_queue_does_not_stall_completion() -> Result<()> {
        let temp = TempDir::new()?;
        let source = temp.path().join("src");
        fs::create_dir_all(&source)?;
        for i in 0..50 {
            fs::write(source.join(format!("f{}.txt", i)), format!("content {}", i))?;
        }
        let config = BackupConfig {
            destination: temp.path().join("dest"),
            sources: vec![source],
            ignore_patterns: Vec::new(),
        };
        let destination = config.destination.clone();

        // Tiny event channel that nobody drains: progress must be dropped,
        // not block the run.
        let (tx, _rx) = mpsc::channel(1);
        let controller = BackupController::new(tx);
        controller.start(config).await?;

        assert!(wait_for_status(&controller, BackupStatus::Completed).await);
        assert_eq!(
            latest_snapshot(&destination)?.unwrap().files.len(),
            50
        );
        Ok(())
    }

    #[test]
    fn test_events_serialize_with_stable_names() {
        let event = ControllerEvent::Status(BackupStatus::Running);
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"status\""));
        assert!(json.contains("\"running\""));
    }
}
