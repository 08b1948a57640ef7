//! Coalesce, classify and ratelimit filesystem events into sync intents
//! (C7).

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::ClientConf;

/// `CHECK` means "compare with remote and sync if different"; `UPDATE`
/// means "push unconditionally".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Update,
    Delete,
    Check,
    Rename,
}

#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub name: PathBuf,
    pub kind: EventKind,
    pub name_to: Option<PathBuf>,
}

impl ClientEvent {
    fn dedup_key(&self) -> DedupKey {
        (self.name.clone(), self.kind, self.name_to.clone())
    }
}

/// Raw notification from the watcher adapter (C6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOp {
    Create,
    Write,
    Remove,
    Rename,
    Chmod,
}

/// Side effects the classifier needs on the live `notify` watcher: extend
/// the subscription into newly created directories, drop it on deletes.
pub trait WatchControl: Send + Sync {
    fn watch_dir(&self, path: &Path);
    fn unwatch_dir(&self, path: &Path);
}

/// What a drained `UPDATE`/`DELETE`/`RENAME`/`CHECK` event actually does.
/// Implemented by the client's connection-backed reconciliation driver; kept
/// as a trait so the pipeline itself is unit-testable without a socket.
#[async_trait]
pub trait SyncOps: Send + Sync + 'static {
    async fn remote_save_file(&self, abs: &Path);
    async fn remote_del(&self, abs: &Path);
    async fn remote_rename(&self, abs: &Path, abs_old: &Path);
    async fn check_or_send(&self, abs: &Path);
}

const WRITE_INLINE_THRESHOLD: u64 = 100 * 1024;
const RENAME_TTL: Duration = Duration::from_millis(500);
const DEDUP_WINDOW: Duration = Duration::from_secs(5);

struct PendingRename {
    old_abs: PathBuf,
    deadline: Instant,
}

type DedupKey = (PathBuf, EventKind, Option<PathBuf>);

pub struct EventPipeline {
    home: PathBuf,
    buffer: Mutex<Vec<ClientEvent>>,
    rename_pending: Mutex<Option<PendingRename>>,
    recent: Mutex<HashMap<DedupKey, Instant>>,
    check_parallelism: usize,
}

impl EventPipeline {
    pub fn new(home: PathBuf, check_parallelism: usize) -> Self {
        Self {
            home,
            buffer: Mutex::new(Vec::new()),
            rename_pending: Mutex::new(None),
            recent: Mutex::new(HashMap::new()),
            check_parallelism: check_parallelism.max(1),
        }
    }

    fn push(&self, ev: ClientEvent) {
        self.buffer.lock().unwrap().push(ev);
    }

    /// Lets the reconciliation layer (C8) push follow-up events back onto
    /// the pipeline, e.g. degrading a failed rename to a delete + check.
    pub fn enqueue(&self, name: PathBuf, kind: EventKind, name_to: Option<PathBuf>) {
        self.push(ClientEvent { name, kind, name_to });
    }

    /// The initial full-reconciliation walk: enqueue `CHECK` for every
    /// non-ignored path under `home`.
    pub fn seed_full_walk(&self, conf: &ClientConf) {
        for entry in walkdir::WalkDir::new(&self.home)
            .into_iter()
            .filter_entry(|e| {
                let rel = crate::pathutil::to_slash(e.path().strip_prefix(&self.home).unwrap_or(e.path()));
                !conf.is_ignore(&rel)
            })
        {
            let Ok(entry) = entry else { continue };
            self.push(ClientEvent {
                name: entry.path().to_path_buf(),
                kind: EventKind::Check,
                name_to: None,
            });
        }
    }

    /// Classify one raw watcher event while holding the rename latch. `path`
    /// is absolute. Returns the directory that should newly be watched, if
    /// any (the caller performs the actual `watcher.add` outside this lock
    /// to keep the critical section I/O-free).
    pub fn classify(&self, path: &Path, op: RawOp, conf: &ClientConf, watch: &dyn WatchControl) {
        let rel = crate::pathutil::to_slash(path.strip_prefix(&self.home).unwrap_or(path));
        if conf.is_ignore(&rel) {
            return;
        }

        match op {
            RawOp::Create => {
                let mut pending = self.rename_pending.lock().unwrap();
                if let Some(p) = pending.take() {
                    if p.deadline >= Instant::now() {
                        watch.unwatch_dir(&p.old_abs);
                        self.push(ClientEvent {
                            name: path.to_path_buf(),
                            kind: EventKind::Rename,
                            name_to: Some(p.old_abs),
                        });
                    } else {
                        // TTL expired: degrade the stale rename to a delete,
                        // then treat this CREATE independently.
                        self.push(ClientEvent {
                            name: p.old_abs.clone(),
                            kind: EventKind::Delete,
                            name_to: None,
                        });
                        watch.unwatch_dir(&p.old_abs);
                        self.push(ClientEvent {
                            name: path.to_path_buf(),
                            kind: EventKind::Update,
                            name_to: None,
                        });
                    }
                } else {
                    self.push(ClientEvent {
                        name: path.to_path_buf(),
                        kind: EventKind::Update,
                        name_to: None,
                    });
                }
                if path.is_dir() {
                    watch.watch_dir(path);
                }
            }
            RawOp::Write => {
                let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                let kind = if size > WRITE_INLINE_THRESHOLD {
                    EventKind::Check
                } else {
                    EventKind::Update
                };
                self.push(ClientEvent {
                    name: path.to_path_buf(),
                    kind,
                    name_to: None,
                });
            }
            RawOp::Remove => {
                self.push(ClientEvent {
                    name: path.to_path_buf(),
                    kind: EventKind::Delete,
                    name_to: None,
                });
                watch.unwatch_dir(path);
            }
            RawOp::Rename => {
                *self.rename_pending.lock().unwrap() = Some(PendingRename {
                    old_abs: path.to_path_buf(),
                    deadline: Instant::now() + RENAME_TTL,
                });
            }
            RawOp::Chmod => {
                self.push(ClientEvent {
                    name: path.to_path_buf(),
                    kind: EventKind::Update,
                    name_to: None,
                });
            }
        }
    }

    /// Degrade any rename latch that has outlived its TTL without a
    /// matching `CREATE`. Called by the drain tick before swapping the
    /// buffer.
    fn expire_stale_rename(&self, watch: &dyn WatchControl) {
        let mut pending = self.rename_pending.lock().unwrap();
        if let Some(p) = pending.as_ref() {
            if p.deadline < Instant::now() {
                let old = p.old_abs.clone();
                *pending = None;
                drop(pending);
                watch.unwatch_dir(&old);
                self.push(ClientEvent {
                    name: old,
                    kind: EventKind::Delete,
                    name_to: None,
                });
            }
        }
    }

    fn prune_and_check_recent(&self, key: &DedupKey) -> bool {
        let now = Instant::now();
        let mut recent = self.recent.lock().unwrap();
        recent.retain(|_, seen| now.duration_since(*seen) < DEDUP_WINDOW);
        if recent.contains_key(key) {
            true
        } else {
            recent.insert(key.clone(), now);
            false
        }
    }

    /// One ~1s drain tick: swap the buffer, dedup, then dispatch.
    /// `UPDATE`/`DELETE`/`RENAME` run serially in insertion order; `CHECK`s
    /// fan out to a bounded worker pool and are all awaited before this
    /// returns, so the next tick never overlaps the previous one's checks.
    pub async fn drain_tick(&self, ops: Arc<dyn SyncOps>, watch: &dyn WatchControl) {
        self.expire_stale_rename(watch);

        let drained = {
            let mut buf = self.buffer.lock().unwrap();
            std::mem::take(&mut *buf)
        };
        if drained.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.check_parallelism));
        let mut checks = JoinSet::new();

        for ev in drained {
            if self.prune_and_check_recent(&ev.dedup_key()) {
                tracing::debug!(name = ?ev.name, "dedup: skipping repeat event within window");
                continue;
            }
            match ev.kind {
                EventKind::Update => ops.remote_save_file(&ev.name).await,
                EventKind::Delete => ops.remote_del(&ev.name).await,
                EventKind::Rename => {
                    ops.remote_rename(&ev.name, ev.name_to.as_deref().unwrap_or(&ev.name))
                        .await
                }
                EventKind::Check => {
                    // CHECKs are network-round-trip-heavy but commutative,
                    // so they run concurrently through a bounded pool while
                    // UPDATE/DELETE/RENAME above stay strictly ordered.
                    let ops = ops.clone();
                    let permit = semaphore.clone().acquire_owned().await.expect("semaphore open");
                    let name = ev.name;
                    checks.spawn(async move {
                        ops.check_or_send(&name).await;
                        drop(permit);
                    });
                }
            }
        }
        while checks.join_next().await.is_some() {}
    }
}
