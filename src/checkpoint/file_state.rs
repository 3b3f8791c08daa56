/// Snapshot provider backed by a JSON file on disk
///
/// Used by the command-line tool: the "application state" is whatever JSON
/// document lives at the given path. Restores replace the file atomically.
use super::validation::SnapshotValidation;
use super::StateSnapshotProvider;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct JsonFileState {
    path: PathBuf,
    /// Top-level keys every snapshot must carry
    required_keys: Vec<String>,
}

impl JsonFileState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            required_keys: Vec::new(),
        }
    }

    /// Reject snapshots missing any of `keys` at the top level
    pub fn with_required_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateSnapshotProvider for JsonFileState {
    fn serialize(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).with_context(|| format!("Failed to read state file {}", self.path.display()))
    }

    fn restore(&self, snapshot: &[u8]) -> Result<()> {
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".restore");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, snapshot).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace state file {}", self.path.display()))?;

        tracing::debug!(path = %self.path.display(), bytes = snapshot.len(), "State file restored");
        Ok(())
    }

    fn validate(&self, snapshot: &[u8]) -> Result<SnapshotValidation> {
        if self.required_keys.is_empty() {
            return Ok(SnapshotValidation::valid());
        }

        let value: serde_json::Value = serde_json::from_slice(snapshot).context("State is not JSON")?;
        let missing: Vec<String> = self
            .required_keys
            .iter()
            .filter(|key| value.get(key.as_str()).is_none())
            .map(|key| format!("missing required key '{}'", key))
            .collect();

        Ok(SnapshotValidation::from_errors(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_serialize_and_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, br#"{"realm": 2}"#).unwrap();

        let state = JsonFileState::new(&path);
        let before = state.serialize().unwrap();

        fs::write(&path, br#"{"realm": 9}"#).unwrap();
        state.restore(&before).unwrap();

        assert_eq!(fs::read(&path).unwrap(), br#"{"realm": 2}"#.to_vec());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let state = JsonFileState::new("/nonexistent/state.json");
        assert!(state.serialize().is_err());
    }

    #[test]
    fn test_required_keys() {
        let state = JsonFileState::new("unused.json").with_required_keys(["realm", "qi"]);

        let ok = state.validate(br#"{"realm": 1, "qi": 5}"#).unwrap();
        assert!(ok.valid);

        let missing = state.validate(br#"{"realm": 1}"#).unwrap();
        assert!(!missing.valid);
        assert_eq!(missing.errors, vec!["missing required key 'qi'".to_string()]);
    }
}
