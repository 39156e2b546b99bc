//! Per-task scratch file system.
//!
//! Each agent run owns a directory for downloads metadata, extracted
//! content, and step screenshots. The state is reversible: it can be
//! captured after every step and restored into a fresh agent.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Reversible snapshot of the agent file system
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileSystemState {
    pub base_dir: PathBuf,
    /// Text files by name, small enough to inline
    #[serde(default)]
    pub files: HashMap<String, String>,
}

/// Scratch directory for one agent task
#[derive(Debug)]
pub struct AgentFileSystem {
    base_dir: PathBuf,
}

impl AgentFileSystem {
    /// Create a fresh file system under the platform data directory (or the
    /// temp directory when unavailable)
    pub fn new(task_id: &str) -> io::Result<Self> {
        let root = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("pagepilot")
            .join("tasks");
        let base_dir = root.join(task_id);
        std::fs::create_dir_all(base_dir.join("screenshots"))?;
        debug!("Agent file system at {}", base_dir.display());
        Ok(Self { base_dir })
    }

    /// Create rooted at an explicit directory (used by tests and restores)
    pub fn at(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(base_dir.join("screenshots"))?;
        Ok(Self { base_dir })
    }

    /// Restore from a captured state: recreate the directory and its files
    pub fn from_state(state: &FileSystemState) -> io::Result<Self> {
        let fs = Self::at(&state.base_dir)?;
        for (name, content) in &state.files {
            fs.write_file(name, content)?;
        }
        Ok(fs)
    }

    /// Capture the current state (text files only)
    pub fn state(&self) -> FileSystemState {
        let mut files = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(&self.base_dir) {
            for entry in entries.filter_map(Result::ok) {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if let Ok(content) = std::fs::read_to_string(&path) {
                    files.insert(name.to_string(), content);
                }
            }
        }
        FileSystemState {
            base_dir: self.base_dir.clone(),
            files,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn write_file(&self, name: &str, content: &str) -> io::Result<PathBuf> {
        let path = self.base_dir.join(name);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn read_file(&self, name: &str) -> io::Result<String> {
        std::fs::read_to_string(self.base_dir.join(name))
    }

    pub fn list_files(&self) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(&self.base_dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.path().is_file())
                    .filter_map(|e| e.file_name().to_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Stable screenshot path for a step; only the path goes into history
    pub fn screenshot_path(&self, step_number: u32) -> PathBuf {
        self.base_dir
            .join("screenshots")
            .join(format!("step_{step_number}.png"))
    }

    /// Decode and store a step screenshot, returning its path
    pub async fn save_screenshot(&self, step_number: u32, base64_data: &str) -> io::Result<PathBuf> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(base64_data)
            .map_err(|e| io::Error::other(format!("invalid screenshot payload: {e}")))?;
        let path = self.screenshot_path(step_number);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrips_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = AgentFileSystem::at(dir.path().join("task")).expect("create");
        fs.write_file("notes.md", "remember this").expect("write");

        let state = fs.state();
        assert_eq!(
            state.files.get("notes.md").map(String::as_str),
            Some("remember this")
        );

        let restored = AgentFileSystem::from_state(&state).expect("restore");
        assert_eq!(restored.read_file("notes.md").expect("read"), "remember this");
    }

    #[tokio::test]
    async fn screenshots_land_on_stable_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = AgentFileSystem::at(dir.path().join("task")).expect("create");
        let payload = base64::engine::general_purpose::STANDARD.encode(b"png-bytes");
        let path = fs.save_screenshot(3, &payload).await.expect("save");
        assert_eq!(path, fs.screenshot_path(3));
        assert_eq!(std::fs::read(path).expect("read"), b"png-bytes");
    }
}
