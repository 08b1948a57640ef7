//! Server-side deploy fan-out: copying a changed path to its secondary
//! destination, and the one-shot `-deploy` walk.

use std::sync::Arc;
use tempfile::tempdir;

use hsync::config::{ServerConf, ServerConfDeploy};
use hsync::deploy::{self, DeployKind, DeployQueue};

fn conf(home: &std::path::Path, conf_dir: &std::path::Path) -> ServerConf {
    ServerConf {
        addr: "127.0.0.1:0".into(),
        home: home.to_path_buf(),
        token: "t".into(),
        deploy: vec![ServerConfDeploy {
            from: "a".into(),
            to: "d".into(),
        }],
        deploy_cmd: String::new(),
        conf_dir: conf_dir.to_path_buf(),
    }
}

#[tokio::test(start_paused = true)]
async fn queued_update_is_copied_to_deploy_target_on_next_tick() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("a")).unwrap();
    std::fs::write(dir.path().join("a/x.txt"), b"payload").unwrap();

    let conf = Arc::new(conf(dir.path(), dir.path()));
    let queue = DeployQueue::new();
    deploy::spawn(conf.clone(), queue.clone());

    queue.enqueue("a/x.txt", DeployKind::Update).await;
    tokio::time::advance(std::time::Duration::from_millis(1100)).await;
    tokio::task::yield_now().await;
    tokio::time::advance(std::time::Duration::from_millis(1100)).await;

    let deployed = dir.path().join("d/x.txt");
    for _ in 0..50 {
        if deployed.exists() {
            break;
        }
        tokio::time::advance(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(std::fs::read(deployed).unwrap(), b"payload");
}

#[test]
fn deploy_all_copies_every_matching_rule_synchronously() {
    let dir = tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("a/nested")).unwrap();
    std::fs::write(dir.path().join("a/x.txt"), b"one").unwrap();
    std::fs::write(dir.path().join("a/nested/y.txt"), b"two").unwrap();

    let conf = conf(dir.path(), dir.path());
    deploy::deploy_all(&conf).unwrap();

    assert_eq!(std::fs::read(dir.path().join("d/x.txt")).unwrap(), b"one");
    assert_eq!(std::fs::read(dir.path().join("d/nested/y.txt")).unwrap(), b"two");
}
