// ABOUTME: Environment file loader producing validated name/value sets
// ABOUTME: Fails closed on any line that is not blank, a comment, or a NAME=value assignment

use crate::error::{Result, SandboxError};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, warn};

static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)=(.*)$").expect("assignment pattern")
});

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

/// Validated mapping of variable name to value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentSet {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a variable, rejecting names that are not shell identifiers
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(SandboxError::InvalidRequest(format!(
                "{:?} is not a valid variable name",
                name
            )));
        }
        self.vars.insert(name, value.into());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Variables in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy of this set with `overrides` layered on top
    pub fn merged(&self, overrides: &EnvironmentSet) -> EnvironmentSet {
        let mut vars = self.vars.clone();
        for (name, value) in overrides.iter() {
            vars.insert(name.to_string(), value.to_string());
        }
        EnvironmentSet { vars }
    }
}

/// Result of loading an environment file
#[derive(Debug, Clone)]
pub struct LoadedEnvironment {
    pub vars: EnvironmentSet,
    /// Set when the file did not exist; execution proceeds without extra variables
    pub missing_file: Option<PathBuf>,
}

pub fn is_valid_name(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Load and validate the environment file at `path`
pub fn load(path: &Path) -> Result<LoadedEnvironment> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(
                "Environment file {} not found; continuing without extra variables",
                path.display()
            );
            return Ok(LoadedEnvironment {
                vars: EnvironmentSet::new(),
                missing_file: Some(path.to_path_buf()),
            });
        }
        Err(e) => return Err(e.into()),
    };

    let vars = parse(path, &contents)?;
    debug!(
        "Loaded {} variables from {}",
        vars.len(),
        path.display()
    );

    Ok(LoadedEnvironment {
        vars,
        missing_file: None,
    })
}

/// Parse environment file contents; `path` only labels errors
pub fn parse(path: &Path, contents: &str) -> Result<EnvironmentSet> {
    let mut vars = EnvironmentSet::new();

    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let captures = ASSIGNMENT.captures(line).ok_or_else(|| {
            SandboxError::MalformedEnvironmentFile {
                path: path.to_path_buf(),
                line: index + 1,
                content: raw.to_string(),
            }
        })?;

        let name = &captures[1];
        let value = unquote(&captures[2]);
        vars.vars.insert(name.to_string(), value.to_string());
    }

    Ok(vars)
}

/// Strip one matching pair of surrounding quotes
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' || first == b'\'') && first == last {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_env(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_loads_assignments_and_skips_comments() {
        let file = write_env("FOO=bar\n# a comment\n");
        let loaded = load(file.path()).unwrap();

        assert_eq!(loaded.vars.get("FOO"), Some("bar"));
        assert_eq!(loaded.vars.len(), 1);
        assert!(loaded.missing_file.is_none());
    }

    #[test]
    fn test_rejects_non_assignment_line() {
        let file = write_env("FOO=bar\necho hi\n");
        let err = load(file.path()).unwrap_err();

        match err {
            SandboxError::MalformedEnvironmentFile { line, content, .. } => {
                assert_eq!(line, 2);
                assert_eq!(content, "echo hi");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_invalid_names() {
        for bad in ["1FOO=bar", "FOO-BAR=baz", "=value", "FOO BAR=1"] {
            let err = parse(Path::new("test.env"), bad).unwrap_err();
            assert_eq!(err.kind(), "MalformedEnvironmentFile", "line {:?}", bad);
        }
    }

    #[test]
    fn test_missing_file_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.env");
        let loaded = load(&path).unwrap();

        assert!(loaded.vars.is_empty());
        assert_eq!(loaded.missing_file, Some(path));
    }

    #[test]
    fn test_values_keep_equals_and_strip_quotes() {
        let vars = parse(
            Path::new("test.env"),
            "URL=postgres://u:p@h/db?x=1\nexport QUOTED=\"two words\"\nSINGLE='it'\nEMPTY=\nLAST=1\nLAST=2\n",
        )
        .unwrap();

        assert_eq!(vars.get("URL"), Some("postgres://u:p@h/db?x=1"));
        assert_eq!(vars.get("QUOTED"), Some("two words"));
        assert_eq!(vars.get("SINGLE"), Some("it"));
        assert_eq!(vars.get("EMPTY"), Some(""));
        assert_eq!(vars.get("LAST"), Some("2"));
    }

    #[test]
    fn test_merged_prefers_overrides() {
        let mut base = EnvironmentSet::new();
        base.insert("A", "1").unwrap();
        base.insert("B", "2").unwrap();
        let mut overrides = EnvironmentSet::new();
        overrides.insert("B", "3").unwrap();

        let merged = base.merged(&overrides);
        let pairs: Vec<_> = merged.iter().collect();
        assert_eq!(pairs, vec![("A", "1"), ("B", "3")]);
        assert!(base.insert("not valid", "x").is_err());
    }
}
