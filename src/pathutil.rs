//! Path normalization and the ignore/allow glob-as-regex compiler (C1).

use regex::Regex;
use std::path::{Component, Path, PathBuf};

use crate::error::{HsyncError, Result};

/// Lexically resolve `.`/`..` components without touching the filesystem,
/// the way Go's `filepath.Clean` does.
pub fn clean_path(p: &Path) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                _ => out.push(comp),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.into_iter().collect()
}

/// Render a path using forward slashes regardless of host OS, as the wire
/// format requires.
pub fn to_slash(p: &Path) -> String {
    let mut out = String::new();
    for comp in p.components() {
        match comp {
            Component::RootDir => out.push('/'),
            _ => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(&comp.as_os_str().to_string_lossy());
            }
        }
    }
    out
}

fn rel_to(base: &Path, target: &Path) -> Result<PathBuf> {
    let base: Vec<_> = base.components().collect();
    let target: Vec<_> = target.components().collect();
    let common = base
        .iter()
        .zip(target.iter())
        .take_while(|(a, b)| a == b)
        .count();
    if common == 0 && !base.is_empty() && !target.is_empty() {
        return Err(HsyncError::PathInvalid(format!(
            "{} is not relative to {}",
            target.iter().collect::<PathBuf>().display(),
            base.iter().collect::<PathBuf>().display()
        )));
    }
    let mut out = PathBuf::new();
    for _ in 0..(base.len() - common) {
        out.push("..");
    }
    for c in &target[common..] {
        out.push(c.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    Ok(out)
}

/// `CheckPath(name)`: resolve `name` (absolute or relative to `home`) into
/// an absolute, cleaned path and the home-relative, forward-slash path used
/// on the wire. A resolved path is rejected if it escapes `home`.
pub fn check_path(home: &Path, name: &str) -> Result<(PathBuf, String)> {
    let name_path = Path::new(name);
    let abs = if name_path.is_absolute() {
        clean_path(name_path)
    } else {
        clean_path(&home.join(name_path))
    };
    let rel = rel_to(home, &abs)?;
    if rel.components().next() == Some(Component::ParentDir) {
        return Err(HsyncError::PathInvalid(format!(
            "{} escapes home {}",
            abs.display(),
            home.display()
        )));
    }
    Ok((abs, to_slash(&rel)))
}

const DEFAULT_IGNORED_BASENAMES: [&str; 2] = ["hsync.json", "hsyncd.json"];

/// The hard-coded ignore policy applied before any user-configured pattern:
/// dotfiles, backup files (`~` suffix) and the config files themselves.
pub fn is_ignore(rel: &str) -> bool {
    if rel == "." {
        return false;
    }
    if rel.starts_with('.') {
        return true;
    }
    let basename = rel.rsplit('/').next().unwrap_or(rel);
    if basename.starts_with('.') || basename.ends_with('~') {
        return true;
    }
    DEFAULT_IGNORED_BASENAMES.contains(&basename)
}

/// Compiles a list of user glob-ish patterns (`*` -> `.*`, literal
/// otherwise, optional leading `/` anchor) into regexes.
#[derive(Debug, Clone)]
pub struct ConfRegexp {
    regexes: Vec<Regex>,
}

impl ConfRegexp {
    pub fn new(patterns: &[String]) -> Self {
        let mut regexes = Vec::with_capacity(patterns.len());
        for pat in patterns {
            let cleaned = clean_path(Path::new(pat.trim()));
            let cleaned = to_slash(&cleaned);
            if cleaned.is_empty() || cleaned == "." {
                continue;
            }
            let quoted = regex::escape(&cleaned).replace(r"\*", ".*");
            let anchored = if let Some(rest) = quoted.strip_prefix('/') {
                format!("^{rest}")
            } else {
                quoted
            };
            match Regex::new(&anchored) {
                Ok(re) => regexes.push(re),
                Err(_) => tracing::warn!(pattern = %pat, "skipping invalid ignore/allow pattern"),
            }
        }
        Self { regexes }
    }

    pub fn is_match(&self, rel: &str) -> bool {
        let candidate = rel.trim_start_matches('/');
        self.regexes.iter().any(|re| re.is_match(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_path_resolves_dotdot() {
        assert_eq!(clean_path(Path::new("a/b/../c")), PathBuf::from("a/c"));
        assert_eq!(clean_path(Path::new("./a/./b")), PathBuf::from("a/b"));
    }

    #[test]
    fn check_path_rejects_escape() {
        let home = Path::new("/home/x");
        assert!(check_path(home, "../../etc/passwd").is_err());
    }

    #[test]
    fn check_path_roundtrips_relative_name() {
        let home = Path::new("/home/x");
        let (abs, rel) = check_path(home, "a/b.txt").unwrap();
        assert_eq!(abs, Path::new("/home/x/a/b.txt"));
        assert_eq!(rel, "a/b.txt");
    }

    #[test]
    fn default_ignore_policy() {
        assert!(!is_ignore("."));
        assert!(is_ignore(".git"));
        assert!(is_ignore("a/.hidden"));
        assert!(is_ignore("a/backup~"));
        assert!(is_ignore("hsync.json"));
        assert!(!is_ignore("a/b.txt"));
        assert_eq!(is_ignore("a/b.txt"), is_ignore("a/b.txt".replace('\\', "/").as_str()));
    }

    #[test]
    fn conf_regexp_anchored_vs_unanchored() {
        let cr = ConfRegexp::new(&["/a_ignore/b".to_string(), "d_ignore/*".to_string()]);
        assert!(cr.is_match("a_ignore/b"));
        assert!(!cr.is_match("x/a_ignore/b"));
        assert!(cr.is_match("x/d_ignore/anything"));
    }
}
