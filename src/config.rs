//! JSON configuration loading for both client and server, plus the
//! embedded demo configs surfaced by `-demo_conf`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{HsyncError, Result};
use crate::pathutil::{clean_path, ConfRegexp};

pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (hsync)");

/// Strip `#`/`//`-prefixed comment lines, then parse as JSON.
fn load_json_file<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| HsyncError::Config(format!("read {}: {e}", path.display())))?;
    let mut filtered = String::with_capacity(text.len());
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') || trimmed.starts_with("//") {
            continue;
        }
        filtered.push_str(trimmed);
    }
    serde_json::from_str(&filtered)
        .map_err(|e| HsyncError::Config(format!("parse {}: {e}", path.display())))
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfDeploy {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConf {
    pub addr: String,
    pub home: PathBuf,
    pub token: String,
    #[serde(default)]
    pub deploy: Vec<ServerConfDeploy>,
    #[serde(default, rename = "deployCmd")]
    pub deploy_cmd: String,
    #[serde(skip)]
    pub conf_dir: PathBuf,
}

impl ServerConf {
    pub fn load(name: &Path) -> Result<Self> {
        let mut conf: ServerConf = load_json_file(name)?;
        let fp = std::fs::canonicalize(name)
            .or_else(|_| std::env::current_dir().map(|d| d.join(name)))
            .map_err(|e| HsyncError::Config(e.to_string()))?;
        conf.conf_dir = fp.parent().unwrap_or(Path::new(".")).to_path_buf();
        if !conf.home.is_absolute() {
            conf.home = conf.conf_dir.join(&conf.home);
        }
        conf.home = clean_path(&conf.home);
        conf.deploy_cmd = conf
            .deploy_cmd
            .replace("{pwd}", &conf.conf_dir.to_string_lossy())
            .trim()
            .to_string();
        for d in &mut conf.deploy {
            d.from = d.from.trim_matches('/').to_string();
        }
        if conf.addr.is_empty() {
            return Err(HsyncError::Config("server listen addr is empty".into()));
        }
        Ok(conf)
    }

    /// Destination paths a given relative path should be fanned out to.
    pub fn deploy_targets(&self, rel: &str) -> Vec<PathBuf> {
        let mut out = Vec::new();
        for rule in &self.deploy {
            if rule.from != "." && !rel.starts_with(&rule.from) {
                continue;
            }
            let suffix = rel.strip_prefix(&rule.from).unwrap_or(rel).trim_start_matches('/');
            out.push(Path::new(&rule.to).join(suffix));
        }
        out
    }
}

pub const DEMO_SERVER_CONF: &str = r#"{
    "addr": ":8700",
    "home": "./",
    "token": "hsynctoken201412",
    "deploy": [
        {"from":"a/", "to":"d/"}
    ],
    "deployCmd": ""
}
"#;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerHost {
    pub host: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConf {
    pub hosts: HashMap<String, ServerHost>,
    pub home: PathBuf,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(skip)]
    pub conf_dir: PathBuf,
    #[serde(skip)]
    ignore_cr: Option<ConfRegexp>,
    #[serde(skip)]
    allow_cr: Option<ConfRegexp>,
}

impl ClientConf {
    pub fn load(name: &Path) -> Result<Self> {
        let mut conf: ClientConf = load_json_file(name)?;
        if conf.hosts.is_empty() {
            return Err(HsyncError::Config("miss server hosts".into()));
        }
        let fp = std::fs::canonicalize(name)
            .or_else(|_| std::env::current_dir().map(|d| d.join(name)))
            .map_err(|e| HsyncError::Config(e.to_string()))?;
        conf.conf_dir = fp.parent().unwrap_or(Path::new(".")).to_path_buf();
        if !conf.home.is_absolute() {
            conf.home = conf.conf_dir.join(&conf.home);
        }
        conf.home = clean_path(&conf.home);
        conf.ignore_cr = Some(ConfRegexp::new(&conf.ignore));
        if !conf.allow.is_empty() {
            conf.allow_cr = Some(ConfRegexp::new(&conf.allow));
        }
        Ok(conf)
    }

    pub fn is_ignore(&self, rel: &str) -> bool {
        if crate::pathutil::is_ignore(rel) {
            return true;
        }
        if let Some(cr) = &self.ignore_cr {
            if cr.is_match(rel) {
                return true;
            }
        }
        if let Some(cr) = &self.allow_cr {
            if !cr.is_match(rel) {
                return true;
            }
        }
        false
    }

    /// Pick a remote host: explicit name wins, else `"default"`, else any.
    pub fn select_host(&self, name: Option<&str>) -> Result<&ServerHost> {
        if let Some(name) = name {
            return self
                .hosts
                .get(name)
                .ok_or_else(|| HsyncError::Config(format!("unknown host name: {name}")));
        }
        if let Some(h) = self.hosts.get("default") {
            return Ok(h);
        }
        self.hosts
            .values()
            .next()
            .ok_or_else(|| HsyncError::Config("no remote host configured".into()))
    }
}

pub const DEMO_CLIENT_CONF: &str = r#"{
    "hosts": {
        "default": {
            "host": "127.0.0.1:8700",
            "token": "hsyncTokenDemo@20141226"
        }
    },
    "home": "./data/",
    "allow": [],
    "ignore": [
        "a_ignore/b",
        "d_ignore/*"
    ]
}
"#;

pub fn demo_conf(kind: &str) -> &'static str {
    if kind == "server" {
        DEMO_SERVER_CONF
    } else {
        DEMO_CLIENT_CONF
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn server_conf_resolves_home_and_strips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hsyncd.json");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "{{\n# a comment\n\"addr\":\":8700\",\n\"home\":\"./home\",\n\"token\":\"t\",\n\"deploy\":[{{\"from\":\"a/\",\"to\":\"d/\"}}],\n\"deployCmd\":\"\"\n}}"
        )
        .unwrap();
        let conf = ServerConf::load(&path).unwrap();
        assert_eq!(conf.home, dir.path().join("home"));
        assert_eq!(conf.deploy[0].from, "a");
        assert_eq!(conf.deploy_targets("a/x.txt"), vec![PathBuf::from("d/x.txt")]);
    }

    #[test]
    fn client_conf_requires_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hsync.json");
        std::fs::write(&path, r#"{"hosts":{},"home":"./d"}"#).unwrap();
        assert!(ClientConf::load(&path).is_err());
    }

    #[test]
    fn client_conf_select_host_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hsync.json");
        std::fs::write(
            &path,
            r#"{"hosts":{"default":{"host":"127.0.0.1:1","token":"t"}},"home":"./d"}"#,
        )
        .unwrap();
        let conf = ClientConf::load(&path).unwrap();
        assert_eq!(conf.select_host(None).unwrap().host, "127.0.0.1:1");
        assert!(conf.select_host(Some("nope")).is_err());
    }
}
