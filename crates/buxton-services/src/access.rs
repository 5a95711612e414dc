//! `may_access` reference implementation — a Smack-style subject/object
//! rule table standing in for the kernel label hooks spec.md treats as an
//! external primitive (§1, §4.7 of SPEC_FULL.md).
//!
//! Rule file format: one rule per line, `subject object access`, where
//! `access` is one of `r`, `w`, `x`, or any combination (`rw`, `rwx`).
//! Blank lines and lines starting with `#` are ignored.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use buxton_core::model::AccessMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Access {
    read: bool,
    write: bool,
    execute: bool,
}

impl Access {
    fn allows(self, mode: AccessMode) -> bool {
        match mode {
            AccessMode::Read => self.read,
            AccessMode::Write => self.write,
            AccessMode::Execute => self.execute,
        }
    }

    fn parse(spec: &str) -> Access {
        Access {
            read: spec.contains('r'),
            write: spec.contains('w'),
            execute: spec.contains('x'),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    subject: String,
    object: String,
    access: Access,
}

/// Reloadable Smack-style rule table.
///
/// Rules are matched by exact `(subject, object)` pair. A label always
/// has full access to itself (the standard Smack self-rule); any other
/// pair with no matching rule is denied.
pub struct AccessRules {
    rules: RwLock<Arc<Vec<Rule>>>,
    path: Option<PathBuf>,
    allow_all: bool,
}

impl AccessRules {
    pub fn empty() -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            path: None,
            allow_all: false,
        }
    }

    /// A table that grants every access check, regardless of label —
    /// the access-control primitive a direct (in-process) caller bypasses
    /// per spec's "direct client has label `⊥`" semantics.
    pub fn allow_all() -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            path: None,
            allow_all: true,
        }
    }

    /// Load rules from `path`. Missing file is treated as empty — it is
    /// created by the access-control collaborator, not by us.
    pub fn load(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let rules = Self::parse_file(&path)?;
        Ok(Self {
            rules: RwLock::new(Arc::new(rules)),
            path: Some(path),
            allow_all: false,
        })
    }

    fn parse_file(path: &Path) -> std::io::Result<Vec<Rule>> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(Self::parse_str(&text))
    }

    fn parse_str(text: &str) -> Vec<Rule> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let mut parts = line.split_whitespace();
                let subject = parts.next()?;
                let object = parts.next()?;
                let access = parts.next()?;
                Some(Rule {
                    subject: subject.to_string(),
                    object: object.to_string(),
                    access: Access::parse(access),
                })
            })
            .collect()
    }

    /// Re-read the rule file from disk and atomically swap the table.
    /// No-op if this instance was constructed with `empty()`.
    pub fn reload(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        let rules = Self::parse_file(path)?;
        *self.rules.write().expect("rule table lock poisoned") = Arc::new(rules);
        Ok(())
    }

    /// The access-control primitive: does `subject` have `mode` access to
    /// `object`? A label always has full access to itself.
    pub fn may_access(&self, subject: &str, object: &str, mode: AccessMode) -> bool {
        if self.allow_all || subject == object {
            return true;
        }
        let rules = self.rules.read().expect("rule table lock poisoned");
        rules
            .iter()
            .any(|r| r.subject == subject && r.object == object && r.access.allows(mode))
    }
}

impl Default for AccessRules {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_access_is_always_allowed() {
        let rules = AccessRules::empty();
        assert!(rules.may_access("_", "_", AccessMode::Read));
        assert!(rules.may_access("_", "_", AccessMode::Write));
    }

    #[test]
    fn unrelated_labels_default_to_deny() {
        let rules = AccessRules::empty();
        assert!(!rules.may_access("app", "system", AccessMode::Read));
    }

    #[test]
    fn explicit_rule_grants_access() {
        let rules = AccessRules {
            rules: RwLock::new(Arc::new(AccessRules::parse_str("app system rw\n"))),
            path: None,
            allow_all: false,
        };
        assert!(rules.may_access("app", "system", AccessMode::Read));
        assert!(rules.may_access("app", "system", AccessMode::Write));
        assert!(!rules.may_access("app", "system", AccessMode::Execute));
    }

    #[test]
    fn reload_picks_up_file_changes() {
        let tmp = std::env::temp_dir().join(format!("buxton-rules-test-{}", std::process::id()));
        std::fs::write(&tmp, "app system r\n").unwrap();

        let rules = AccessRules::load(&tmp).unwrap();
        assert!(rules.may_access("app", "system", AccessMode::Read));
        assert!(!rules.may_access("app", "system", AccessMode::Write));

        std::fs::write(&tmp, "app system rw\n").unwrap();
        rules.reload().unwrap();
        assert!(rules.may_access("app", "system", AccessMode::Write));

        std::fs::remove_file(&tmp).ok();
    }

    #[test]
    fn missing_rule_file_is_empty_not_an_error() {
        let rules = AccessRules::load("/nonexistent/buxton-rules-file").unwrap();
        assert!(!rules.may_access("app", "system", AccessMode::Read));
    }

    #[test]
    fn allow_all_grants_every_pair() {
        let rules = AccessRules::allow_all();
        assert!(rules.may_access("app", "system", AccessMode::Read));
        assert!(rules.may_access("app", "system", AccessMode::Write));
    }
}
