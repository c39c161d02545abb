//! Filesystem tools for local file inspection
//!
//! # Tools
//!
//! - `list_files` - List entries of a directory (directories get a trailing `/`)
//! - `read_files` - Read the contents of a text file
//!
//! Access is restricted to configured allowed paths.
//!
//! # Configuration
//!
//! ```toml
//! [tools]
//! allowed_paths = ["/srv/data"]
//! max_file_size = 1048576
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{required_str, Tool, ToolDefinition, ToolError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemConfig {
    /// Paths the tools are allowed to touch
    pub allowed_paths: Vec<PathBuf>,

    /// Maximum file size to read (in bytes)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

fn default_max_file_size() -> u64 {
    1024 * 1024 // 1 MB
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            allowed_paths: vec![],
            max_file_size: default_max_file_size(),
        }
    }
}

impl FilesystemConfig {
    /// Whether a canonical path lies under one of the allowed roots
    fn is_allowed(&self, canonical: &Path) -> bool {
        self.allowed_paths.iter().any(|allowed| {
            allowed
                .canonicalize()
                .map(|allowed| canonical.starts_with(allowed))
                .unwrap_or(false)
        })
    }

    /// Allow-list first; a missing path is only reported as missing when its
    /// nearest existing ancestor is allowed
    fn check(&self, tool: &str, path: &Path) -> Result<(), ToolError> {
        let denied = || {
            failure(
                tool,
                format!("Access denied: path '{}' is not in allowed paths", path.display()),
            )
        };

        // Canonicalize to prevent directory traversal
        match path.canonicalize() {
            Ok(canonical) if self.is_allowed(&canonical) => Ok(()),
            Ok(_) => Err(denied()),
            Err(_) => {
                let inside = path
                    .ancestors()
                    .skip(1)
                    .find_map(|ancestor| ancestor.canonicalize().ok())
                    .is_some_and(|ancestor| self.is_allowed(&ancestor));
                if inside {
                    Err(failure(tool, format!("Path '{}' does not exist", path.display())))
                } else {
                    Err(denied())
                }
            }
        }
    }
}

fn failure(tool: &str, reason: String) -> ToolError {
    ToolError::Execution {
        name: tool.to_string(),
        reason,
    }
}

fn path_parameter(description: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "path": {
                "type": "string",
                "description": description
            }
        },
        "required": ["path"]
    })
}

pub struct ListFiles {
    config: FilesystemConfig,
}

impl ListFiles {
    pub const NAME: &'static str = "list_files";

    pub fn new(config: FilesystemConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Tool for ListFiles {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(Self::NAME, "List files in a given directory path.")
            .with_parameters(path_parameter("The directory path to list files from."))
    }

    async fn call(&self, arguments: Map<String, Value>) -> Result<String, ToolError> {
        let path = Path::new(required_str(Self::NAME, &arguments, "path")?);
        self.config.check(Self::NAME, path)?;

        if !path.is_dir() {
            return Err(failure(Self::NAME, format!("'{}' is not a directory", path.display())));
        }

        let io_err = |e: std::io::Error| failure(Self::NAME, e.to_string());
        let mut read_dir = fs::read_dir(path).await.map_err(io_err)?;
        let mut entries = Vec::new();

        while let Some(entry) = read_dir.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map_err(io_err)?.is_dir();
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }

        if entries.is_empty() {
            return Ok("Empty directory".to_string());
        }

        entries.sort();
        Ok(entries.join("\n"))
    }
}

pub struct ReadFiles {
    config: FilesystemConfig,
}

impl ReadFiles {
    pub const NAME: &'static str = "read_files";

    pub fn new(config: FilesystemConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Tool for ReadFiles {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(Self::NAME, "Read the contents of a file.")
            .with_parameters(path_parameter("The file path to read."))
    }

    async fn call(&self, arguments: Map<String, Value>) -> Result<String, ToolError> {
        let path = Path::new(required_str(Self::NAME, &arguments, "path")?);
        self.config.check(Self::NAME, path)?;

        if !path.is_file() {
            return Err(failure(Self::NAME, format!("'{}' is not a file", path.display())));
        }

        let io_err = |e: std::io::Error| failure(Self::NAME, format!("Error reading file: {}", e));
        let metadata = fs::metadata(path).await.map_err(io_err)?;
        if metadata.len() > self.config.max_file_size {
            return Err(failure(
                Self::NAME,
                format!(
                    "File too large: {} bytes (max: {} bytes)",
                    metadata.len(),
                    self.config.max_file_size
                ),
            ));
        }

        fs::read_to_string(path).await.map_err(io_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(path: &Path) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("path".into(), Value::String(path.to_string_lossy().to_string()));
        map
    }

    fn config_for(dir: &TempDir) -> FilesystemConfig {
        FilesystemConfig {
            allowed_paths: vec![dir.path().to_path_buf()],
            max_file_size: 64,
        }
    }

    #[tokio::test]
    async fn test_list_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let tool = ListFiles::new(config_for(&dir));
        let listing = tool.call(args(dir.path())).await.unwrap();
        assert_eq!(listing, "a.txt\nb.txt\nnested/");
    }

    #[tokio::test]
    async fn test_list_empty_directory() {
        let dir = TempDir::new().unwrap();
        let tool = ListFiles::new(config_for(&dir));
        assert_eq!(tool.call(args(dir.path())).await.unwrap(), "Empty directory");
    }

    #[tokio::test]
    async fn test_read_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("notes.txt");
        std::fs::write(&file, "Hello, Moxie!").unwrap();

        let tool = ReadFiles::new(config_for(&dir));
        assert_eq!(tool.call(args(&file)).await.unwrap(), "Hello, Moxie!");

        let err = tool.call(args(dir.path())).await.unwrap_err();
        assert!(err.to_string().contains("is not a file"));
    }

    #[tokio::test]
    async fn test_read_rejects_large_files() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("big.txt");
        std::fs::write(&file, "x".repeat(128)).unwrap();

        let tool = ReadFiles::new(config_for(&dir));
        let err = tool.call(args(&file)).await.unwrap_err();
        assert!(err.to_string().contains("File too large"));
    }

    #[tokio::test]
    async fn test_path_not_allowed() {
        let allowed = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();

        let tool = ListFiles::new(config_for(&allowed));
        let err = tool.call(args(other.path())).await.unwrap_err();
        assert!(err.to_string().contains("Access denied"));
    }

    #[tokio::test]
    async fn test_missing_path_outside_allow_list_is_denied() {
        let allowed = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let tool = ReadFiles::new(config_for(&allowed));

        let existing = other.path().join("present.txt");
        std::fs::write(&existing, "secret").unwrap();
        let missing = other.path().join("absent.txt");

        // both answers are identical, so existence outside the roots is not revealed
        let existing_err = tool.call(args(&existing)).await.unwrap_err();
        let missing_err = tool.call(args(&missing)).await.unwrap_err();
        assert!(existing_err.to_string().contains("Access denied"));
        assert!(missing_err.to_string().contains("Access denied"));

        let traversal = allowed.path().join("..").join("no-such-dir").join("x.txt");
        let err = tool.call(args(&traversal)).await.unwrap_err();
        assert!(err.to_string().contains("Access denied"));
    }

    #[tokio::test]
    async fn test_missing_path() {
        let dir = TempDir::new().unwrap();
        let tool = ListFiles::new(config_for(&dir));

        let err = tool.call(args(&dir.path().join("nope"))).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        let err = tool.call(Map::new()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}
