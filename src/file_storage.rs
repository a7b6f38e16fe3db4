//! Shared file-based storage primitives.
//!
//! Both the engine catalog (`state.json`) and the per-project workspace files
//! (`.ralph/*.json`) go through these helpers so every write is atomic and
//! every reader sees either the pre- or post-write content.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Common file operations result type
pub type FileResult<T> = Result<T, String>;

fn fs_error(what: &str, path: &Path, err: impl std::fmt::Display) -> String {
    format!("{} {}: {}", what, path.display(), err)
}

/// Sibling path a write is staged at before the rename into place.
fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "staged".to_string());
    target.with_file_name(format!(".{}.tmp", name))
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(dir: &Path) -> FileResult<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|e| fs_error("Could not create directory", dir, e))
}

/// Write data to a file atomically (staged sibling + rename)
pub fn atomic_write(path: &Path, content: &str) -> FileResult<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let staged = staging_path(path);
    let mut file =
        File::create(&staged).map_err(|e| fs_error("Could not stage write at", &staged, e))?;
    file.write_all(content.as_bytes())
        .map_err(|e| fs_error("Could not write", &staged, e))?;
    drop(file);

    fs::rename(&staged, path).map_err(|e| fs_error("Could not move staged write into", path, e))
}

/// Read a JSON file and deserialize it
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> FileResult<T> {
    let bytes = fs::read(path).map_err(|e| fs_error("Could not read", path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| fs_error("Invalid JSON in", path, e))
}

/// Read a JSON file, falling back to the type default when absent
pub fn read_json_or_default<T>(path: &Path) -> FileResult<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    read_json(path)
}

/// Write data as pretty-printed JSON atomically
pub fn write_json<T: serde::Serialize>(path: &Path, data: &T) -> FileResult<()> {
    let content = serde_json::to_string_pretty(data)
        .map_err(|e| fs_error("Could not serialize JSON for", path, e))?;
    atomic_write(path, &content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_dir() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b").join("c");

        assert!(!nested.exists());
        ensure_dir(&nested).unwrap();
        assert!(nested.exists());
        // Idempotent
        ensure_dir(&nested).unwrap();
    }

    #[test]
    fn test_atomic_write_creates_parents() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sub").join("file.json");

        atomic_write(&path, "{}").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        // No staging file left behind
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_atomic_write_replaces_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("file.json");

        atomic_write(&path, "first").unwrap();
        atomic_write(&path, "second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_staging_path_is_hidden_sibling() {
        let staged = staging_path(Path::new("/data/tasks.json"));
        assert_eq!(staged, PathBuf::from("/data/.tasks.json.tmp"));
    }

    #[test]
    fn test_read_json_or_default_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.json");

        let value: serde_json::Value = read_json_or_default(&path).unwrap();
        assert!(value.is_null());
    }

    #[test]
    fn test_read_json_reports_parse_errors() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.json");
        fs::write(&path, "{oops").unwrap();

        let err = read_json::<serde_json::Value>(&path).unwrap_err();
        assert!(err.contains("Invalid JSON"));
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.json");

        let data = serde_json::json!({"answer": 42});
        write_json(&path, &data).unwrap();

        let back: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(back, data);
    }
}
