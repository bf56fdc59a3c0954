//! Config Watcher: watches the two configuration files for changes and
//! invokes a debounced, per-file callback on a worker thread distinct from
//! the filesystem event thread.
//!
//! Modeled on the polling+debounce shape of
//! `ricecoder-storage::markdown_config::watcher::FileWatcher`, but with an
//! independent timer per watched file (rather than one shared debounce
//! window) so a burst of writes to one file never delays a pending reload
//! of the other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, warn};

/// Default debounce window, per the design note in §4.F.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

type Callback = Arc<dyn Fn(&Path) + Send + Sync>;

struct RunningWatcher {
    // Kept alive only so dropping it unregisters the watched paths; never
    // read after construction.
    _watcher: RecommendedWatcher,
    stop: Arc<AtomicBool>,
    finished: mpsc::Receiver<()>,
    worker: JoinHandle<()>,
}

/// Watches `mcp_path` and `rules_path` for modifications and invokes the
/// matching callback, debounced independently per file.
pub struct ConfigWatcher {
    mcp_path: PathBuf,
    rules_path: PathBuf,
    debounce: Duration,
    on_mcp_changed: Callback,
    on_rules_changed: Callback,
    running: Mutex<Option<RunningWatcher>>,
}

impl ConfigWatcher {
    pub fn new(
        mcp_path: PathBuf,
        rules_path: PathBuf,
        on_mcp_changed: impl Fn(&Path) + Send + Sync + 'static,
        on_rules_changed: impl Fn(&Path) + Send + Sync + 'static,
    ) -> Self {
        Self::with_debounce(mcp_path, rules_path, DEFAULT_DEBOUNCE, on_mcp_changed, on_rules_changed)
    }

    pub fn with_debounce(
        mcp_path: PathBuf,
        rules_path: PathBuf,
        debounce: Duration,
        on_mcp_changed: impl Fn(&Path) + Send + Sync + 'static,
        on_rules_changed: impl Fn(&Path) + Send + Sync + 'static,
    ) -> Self {
        Self {
            mcp_path,
            rules_path,
            debounce,
            on_mcp_changed: Arc::new(on_mcp_changed),
            on_rules_changed: Arc::new(on_rules_changed),
            running: Mutex::new(None),
        }
    }

    /// True while a watcher is actively running.
    pub fn is_running(&self) -> bool {
        self.running.lock().unwrap().is_some()
    }

    /// Start watching. Fails if already running.
    pub fn start(&self) -> Result<(), notify::Error> {
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            return Err(notify::Error::generic("config watcher is already running"));
        }

        let (raw_tx, raw_rx) = mpsc::channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if raw_tx.send(event).is_err() {
                    debug!("config watcher debounce worker gone, dropping event");
                }
            }
            Err(e) => error!(error = %e, "config watcher backend error"),
        })?;

        for dir in watch_directories(&self.mcp_path, &self.rules_path) {
            watcher.watch(&dir, RecursiveMode::NonRecursive)?;
            debug!(dir = %dir.display(), "watching directory for config changes");
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (finished_tx, finished_rx) = mpsc::channel();

        let worker = spawn_debounce_worker(
            raw_rx,
            stop.clone(),
            finished_tx,
            self.mcp_path.clone(),
            self.rules_path.clone(),
            self.debounce,
            self.on_mcp_changed.clone(),
            self.on_rules_changed.clone(),
        );

        *running = Some(RunningWatcher {
            _watcher: watcher,
            stop,
            finished: finished_rx,
            worker,
        });

        Ok(())
    }

    /// Stop watching. Idempotent: a no-op if not running. Cancels any
    /// pending debounce timers (they do not fire) and joins the worker
    /// thread with a short timeout.
    pub fn stop(&self) {
        let mut running = self.running.lock().unwrap();
        let Some(handle) = running.take() else {
            return;
        };

        handle.stop.store(true, Ordering::SeqCst);
        drop(handle._watcher);

        if handle.finished.recv_timeout(JOIN_TIMEOUT).is_err() {
            warn!("config watcher worker did not stop within timeout");
        }
        if handle.worker.join().is_err() {
            warn!("config watcher worker thread panicked");
        }
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_directories(mcp_path: &Path, rules_path: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for path in [mcp_path, rules_path] {
        if let Some(parent) = path.parent() {
            let parent = parent.to_path_buf();
            if !dirs.contains(&parent) {
                dirs.push(parent);
            }
        }
    }
    dirs
}

/// Resolve `path` for comparison against a watched target: canonicalize
/// when possible, falling back to the literal path (e.g. the file was just
/// deleted and recreated and no longer resolves at this instant).
fn resolve(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}

#[allow(clippy::too_many_arguments)]
fn spawn_debounce_worker(
    raw_rx: mpsc::Receiver<Event>,
    stop: Arc<AtomicBool>,
    finished_tx: mpsc::Sender<()>,
    mcp_path: PathBuf,
    rules_path: PathBuf,
    debounce: Duration,
    on_mcp_changed: Callback,
    on_rules_changed: Callback,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("config-watcher-debounce".into())
        .spawn(move || {
            let mcp_resolved = resolve(&mcp_path);
            let rules_resolved = resolve(&rules_path);
            let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

            loop {
                if stop.load(Ordering::SeqCst) {
                    break;
                }

                match raw_rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(event) => {
                        if !is_relevant_event(&event) {
                            continue;
                        }
                        for event_path in &event.paths {
                            let resolved = resolve(event_path);
                            if resolved == mcp_resolved {
                                pending.insert(mcp_path.clone(), Instant::now() + debounce);
                                debug!(path = %mcp_path.display(), "scheduled debounced reload");
                            } else if resolved == rules_resolved {
                                pending.insert(rules_path.clone(), Instant::now() + debounce);
                                debug!(path = %rules_path.display(), "scheduled debounced reload");
                            }
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }

                let now = Instant::now();
                let due: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(path, _)| path.clone())
                    .collect();

                for path in due {
                    pending.remove(&path);
                    let callback = if path == mcp_path {
                        &on_mcp_changed
                    } else {
                        &on_rules_changed
                    };
                    let callback = callback.clone();
                    let fire_path = path.clone();
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        callback(&fire_path);
                    }));
                    if result.is_err() {
                        error!(path = %path.display(), "config watcher callback panicked");
                    }
                }
            }

            let _ = finished_tx.send(());
        })
        .expect("failed to spawn config watcher debounce thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    #[test]
    fn start_then_start_again_fails() {
        let dir = TempDir::new().unwrap();
        let mcp = dir.path().join("mcp-servers.json");
        let rules = dir.path().join("gateway-rules.json");
        std::fs::write(&mcp, "{}").unwrap();
        std::fs::write(&rules, "{}").unwrap();

        let watcher = ConfigWatcher::new(mcp, rules, |_| {}, |_| {});
        watcher.start().unwrap();
        assert!(watcher.start().is_err());
        watcher.stop();
    }

    #[test]
    fn stop_without_start_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let watcher = ConfigWatcher::new(
            dir.path().join("mcp-servers.json"),
            dir.path().join("gateway-rules.json"),
            |_| {},
            |_| {},
        );
        watcher.stop();
        watcher.stop();
    }

    #[test]
    fn detects_write_to_watched_file() {
        let dir = TempDir::new().unwrap();
        let mcp = dir.path().join("mcp-servers.json");
        let rules = dir.path().join("gateway-rules.json");
        std::fs::write(&mcp, "{}").unwrap();
        std::fs::write(&rules, "{}").unwrap();

        let mcp_hits = Arc::new(AtomicUsize::new(0));
        let mcp_hits_clone = mcp_hits.clone();

        let watcher = ConfigWatcher::with_debounce(
            mcp.clone(),
            rules,
            StdDuration::from_millis(20),
            move |_| {
                mcp_hits_clone.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        );
        watcher.start().unwrap();

        std::thread::sleep(StdDuration::from_millis(100));
        std::fs::write(&mcp, "{\"mcpServers\":{}}").unwrap();
        std::thread::sleep(StdDuration::from_millis(500));

        watcher.stop();
        assert!(mcp_hits.load(Ordering::SeqCst) >= 1);
    }
}
