//! Server-side deploy fan-out: a background task drains a coalescing event
//! map once a second and copies changed paths to their configured secondary
//! destinations (C5).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::ServerConf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployKind {
    Update,
    Delete,
}

/// Coalescing map keyed by home-relative path: a path that mutates several
/// times within one tick is deployed once, with the latest kind winning.
pub struct DeployQueue {
    pending: Mutex<HashMap<String, DeployKind>>,
    copy_lock: Mutex<()>,
}

impl DeployQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            copy_lock: Mutex::new(()),
        })
    }

    pub async fn enqueue(&self, rel: impl Into<String>, kind: DeployKind) {
        self.pending.lock().await.insert(rel.into(), kind);
    }
}

/// Spawns the 1s-tick drain loop. Returns the join handle so callers can
/// keep it alive for the process lifetime.
pub fn spawn(conf: Arc<ServerConf>, queue: Arc<DeployQueue>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            if conf.deploy.is_empty() {
                continue;
            }
            let drained: Vec<(String, DeployKind)> = {
                let mut pending = queue.pending.lock().await;
                pending.drain().collect()
            };
            for (rel, kind) in drained {
                for target in conf.deploy_targets(&rel) {
                    let dest = if target.is_absolute() {
                        target
                    } else {
                        conf.conf_dir.join(target)
                    };
                    if let Err(e) = deploy_one(&conf, &queue, &rel, kind, &dest).await {
                        tracing::warn!(rel = %rel, dest = %dest.display(), error = %e, "deploy failed");
                    }
                }
            }
        }
    })
}

async fn deploy_one(
    conf: &ServerConf,
    queue: &DeployQueue,
    rel: &str,
    kind: DeployKind,
    dest: &Path,
) -> std::io::Result<()> {
    let src = conf.home.join(rel);
    match kind {
        // DELETE is a complete no-op: no copy, no deployCmd. Secondary
        // destinations are left for the operator to clean up.
        DeployKind::Delete => {
            tracing::debug!(rel = %rel, "delete event is a deploy no-op");
        }
        DeployKind::Update => {
            let _guard = queue.copy_lock.lock().await;
            copy_recursive(&src, dest)?;
            run_deploy_cmd(conf, &src, dest);
        }
    }
    Ok(())
}

fn copy_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    let meta = std::fs::symlink_metadata(src)?;
    if meta.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(src, dest)?;
    }
    Ok(())
}

/// Only ever invoked for UPDATE (DELETE is a deploy no-op), so the trailing
/// action argument is always "update", matching the original's `deploy()`.
fn run_deploy_cmd(conf: &ServerConf, src: &Path, dest: &Path) {
    if conf.deploy_cmd.is_empty() {
        return;
    }
    let mut parts = conf.deploy_cmd.split_whitespace();
    let Some(program) = parts.next() else { return };
    let mut cmd = std::process::Command::new(program);
    cmd.args(parts);
    cmd.arg(dest_display(dest));
    cmd.arg(dest_display(src));
    cmd.arg("update");
    match cmd.status() {
        Ok(status) if !status.success() => {
            tracing::warn!(program, ?status, "deploy command exited non-zero")
        }
        Err(e) => tracing::warn!(program, error = %e, "failed to spawn deploy command"),
        _ => {}
    }
}

fn dest_display(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// `-deploy`: push every path already on disk to its configured
/// destinations once, synchronously, without starting the sync server.
pub fn deploy_all(conf: &ServerConf) -> std::io::Result<()> {
    for rule in &conf.deploy {
        let src_root = conf.home.join(&rule.from);
        let dest_root = if Path::new(&rule.to).is_absolute() {
            std::path::PathBuf::from(&rule.to)
        } else {
            conf.conf_dir.join(&rule.to)
        };
        if !src_root.exists() {
            continue;
        }
        tracing::info!(from = %src_root.display(), to = %dest_root.display(), "deploying all");
        copy_recursive(&src_root, &dest_root)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfDeploy;

    fn conf(home: &Path, deploy_cmd: &str) -> ServerConf {
        ServerConf {
            addr: "127.0.0.1:0".into(),
            home: home.to_path_buf(),
            token: "t".into(),
            deploy: vec![ServerConfDeploy {
                from: "a".into(),
                to: "d".into(),
            }],
            deploy_cmd: deploy_cmd.into(),
            conf_dir: home.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn delete_is_a_complete_no_op_no_copy_no_deploy_cmd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/x.txt"), b"payload").unwrap();
        let marker = dir.path().join("marker");
        let conf = conf(
            dir.path(),
            &format!("touch {}", marker.to_string_lossy()),
        );
        let queue = DeployQueue::new();

        deploy_one(&conf, &queue, "a/x.txt", DeployKind::Delete, &dir.path().join("d/x.txt"))
            .await
            .unwrap();

        assert!(!dir.path().join("d/x.txt").exists(), "delete must not copy");
        assert!(!marker.exists(), "delete must not run deployCmd");
    }

    #[tokio::test]
    async fn update_copies_and_runs_deploy_cmd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/x.txt"), b"payload").unwrap();
        let marker = dir.path().join("marker");
        let conf = conf(
            dir.path(),
            &format!("touch {}", marker.to_string_lossy()),
        );
        let queue = DeployQueue::new();
        let dest = dir.path().join("d/x.txt");

        deploy_one(&conf, &queue, "a/x.txt", DeployKind::Update, &dest)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        assert!(marker.exists(), "update must run deployCmd");
    }
}
