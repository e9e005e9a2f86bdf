//! Script file monitoring.
//!
//! Each monitored script gets one background thread that polls the file's
//! modification time. Changes are not executed on the monitor thread; a
//! [`ReloadRequest`] is sent to whoever owns the receiver (the control
//! thread), which re-reads and re-executes the script.

use crate::config::ReloadSettings;
use crate::error::Result;
use crossbeam_channel::{Receiver, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

/// Shortest sleep between cancellation checks.
pub const MIN_QUANTUM: Duration = Duration::from_millis(1);

/// A monitored script changed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadRequest {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Modification time of `path`, `None` if it can't be read.
pub fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).ok().and_then(|m| m.modified().ok())
}

/// Background poller for one script file. Stops when dropped.
pub struct ScriptReloadMonitor {
    path: PathBuf,
    quit: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ScriptReloadMonitor {
    /// Start monitoring with its own channel.
    pub fn watch(path: &Path, settings: &ReloadSettings) -> Result<(Self, Receiver<ReloadRequest>)> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let monitor = Self::spawn(
            path,
            Duration::from_millis(settings.yield_ms),
            Duration::from_millis(settings.poll_ms),
            sender,
        )?;
        Ok((monitor, receiver))
    }

    /// Start monitoring `path`, sleeping `quantum` between cancellation
    /// checks and checking the file every `poll_interval`.
    ///
    /// `quantum` is at least [`MIN_QUANTUM`].
    pub fn spawn(
        path: &Path,
        quantum: Duration,
        poll_interval: Duration,
        sender: Sender<ReloadRequest>,
    ) -> Result<Self> {
        let quantum = quantum.max(MIN_QUANTUM);
        let quit = Arc::new(AtomicBool::new(false));
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "script".to_string());

        let last_modified = modified_time(path);

        let thread = std::thread::Builder::new()
            .name(format!("reload-{}", name))
            .spawn({
                let path = path.to_path_buf();
                let quit = quit.clone();
                move || poll_loop(path, last_modified, quantum, poll_interval, quit, sender)
            })?;

        log::debug!("Monitoring {} for changes", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            quit,
            thread: Some(thread),
        })
    }

    /// The monitored file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the polling thread is still alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Reload monitor for {} panicked", self.path.display());
            }
        }
    }
}

impl Drop for ScriptReloadMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    path: PathBuf,
    mut last_modified: Option<SystemTime>,
    quantum: Duration,
    poll_interval: Duration,
    quit: Arc<AtomicBool>,
    sender: Sender<ReloadRequest>,
) {
    let mut since_poll = Duration::ZERO;

    while !quit.load(Ordering::Acquire) {
        std::thread::sleep(quantum);
        since_poll += quantum;
        if since_poll < poll_interval {
            continue;
        }
        since_poll = Duration::ZERO;

        let Some(modified) = modified_time(&path) else {
            continue;
        };
        if last_modified == Some(modified) {
            continue;
        }
        last_modified = Some(modified);

        log::info!("Script changed: {}", path.display());
        let request = ReloadRequest {
            path: path.clone(),
            modified,
        };
        if sender.send(request).is_err() {
            // Receiver gone, nobody left to reload
            break;
        }
    }
}
