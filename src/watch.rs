//! Subscribes to filesystem notifications and recurses the watch into
//! newly created directories (C6).

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};

use crate::config::ClientConf;
use crate::event::{EventPipeline, RawOp, WatchControl};

pub struct NotifyWatchControl {
    watcher: Mutex<RecommendedWatcher>,
}

impl NotifyWatchControl {
    fn new(watcher: RecommendedWatcher) -> Self {
        Self {
            watcher: Mutex::new(watcher),
        }
    }
}

impl WatchControl for NotifyWatchControl {
    fn watch_dir(&self, path: &Path) {
        if let Err(e) = self.watcher.lock().unwrap().watch(path, RecursiveMode::NonRecursive) {
            tracing::warn!(path = %path.display(), error = %e, "failed to extend watch to new directory");
        } else {
            tracing::debug!(path = %path.display(), "watch added");
        }
    }

    fn unwatch_dir(&self, path: &Path) {
        let _ = self.watcher.lock().unwrap().unwatch(path);
    }
}

/// Walk `home` recursively adding a non-recursive watch per directory,
/// pruning any subtree whose relative path is ignored.
fn add_watch_tree(control: &NotifyWatchControl, home: &Path, dir: &Path, conf: &ClientConf) {
    let rel = crate::pathutil::to_slash(dir.strip_prefix(home).unwrap_or(dir));
    if crate::pathutil::is_ignore(&rel) || conf.is_ignore(&rel) {
        tracing::debug!(path = %rel, "ignoring watch subtree");
        return;
    }
    control.watch_dir(dir);
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            add_watch_tree(control, home, &entry.path(), conf);
        }
    }
}

/// Runs the blocking `notify` event loop on a dedicated thread, translating
/// raw notifications into classifier calls against `pipeline`. Returns the
/// `WatchControl` handle so the caller can perform the initial recursive
/// subscription and later hand the same handle to the drainer.
pub fn spawn_watcher(
    home: PathBuf,
    conf: Arc<ClientConf>,
    pipeline: Arc<EventPipeline>,
) -> notify::Result<Arc<NotifyWatchControl>> {
    let (tx, rx) = mpsc::channel();
    let watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        },
        Config::default(),
    )?;
    let control = Arc::new(NotifyWatchControl::new(watcher));
    add_watch_tree(&control, &home, &home, &conf);

    let control_for_thread = control.clone();
    std::thread::spawn(move || {
        for res in rx {
            match res {
                Ok(event) => dispatch_event(&pipeline, &home, &conf, &event, control_for_thread.as_ref()),
                Err(e) => tracing::warn!(error = %e, "watcher error"),
            }
        }
    });

    Ok(control)
}

fn dispatch_event(
    pipeline: &EventPipeline,
    home: &Path,
    conf: &ClientConf,
    event: &notify::Event,
    control: &NotifyWatchControl,
) {
    match &event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                pipeline.classify(path, RawOp::Create, conf, control);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let old = &event.paths[0];
            let new = &event.paths[1];
            pipeline.classify(old, RawOp::Rename, conf, control);
            pipeline.classify(new, RawOp::Create, conf, control);
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                pipeline.classify(path, RawOp::Rename, conf, control);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                pipeline.classify(path, RawOp::Create, conf, control);
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => {
            for path in &event.paths {
                pipeline.classify(path, RawOp::Chmod, conf, control);
            }
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                pipeline.classify(path, RawOp::Write, conf, control);
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                pipeline.classify(path, RawOp::Remove, conf, control);
            }
        }
        _ => {}
    }
    let _ = home;
}
