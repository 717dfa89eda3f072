//! 파일 저장소 (JSON 상태 + TOML 설정)

use crate::{Error, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// Directory-backed store for crun's config and state files
#[derive(Debug, Clone)]
pub struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// 글로벌 저장소 (<config_dir>/crun/)
    pub fn global() -> Result<Self> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?
            .join("crun");
        Ok(Self::new(dir))
    }

    /// 프로젝트 저장소 (.crun/)
    pub fn project(root: impl Into<PathBuf>) -> Self {
        Self::new(root.into().join(".crun"))
    }

    /// 현재 디렉토리 프로젝트 저장소
    pub fn current_project() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| Error::Config(format!("Cannot get current directory: {}", e)))?;
        Ok(Self::project(cwd))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.base_dir.join(filename)
    }

    fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            std::fs::create_dir_all(&self.base_dir)
                .map_err(|e| Error::Config(format!("Failed to create directory: {}", e)))?;
        }
        Ok(())
    }

    fn read(&self, filename: &str) -> Result<Option<String>> {
        let path = self.file_path(filename);
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))
    }

    /// JSON 로드 (파일이 없으면 None)
    pub fn load_json<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        let Some(content) = self.read(filename)? else {
            return Ok(None);
        };
        serde_json::from_str(&content).map(Some).map_err(|e| {
            Error::Config(format!(
                "Failed to parse {}: {}",
                self.file_path(filename).display(),
                e
            ))
        })
    }

    /// TOML 로드 (파일이 없으면 None)
    pub fn load_toml<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        let Some(content) = self.read(filename)? else {
            return Ok(None);
        };
        toml::from_str(&content).map(Some).map_err(|e| {
            Error::Config(format!(
                "Failed to parse {}: {}",
                self.file_path(filename).display(),
                e
            ))
        })
    }

    /// JSON 저장
    pub fn save_json<T: Serialize>(&self, filename: &str, data: &T) -> Result<()> {
        self.ensure_dir()?;
        let path = self.file_path(filename);
        let content = serde_json::to_string_pretty(data)?;
        std::fs::write(&path, content)
            .map_err(|e| Error::Config(format!("Failed to write {}: {}", path.display(), e)))
    }

    /// 파일 존재 여부
    pub fn exists(&self, filename: &str) -> bool {
        self.file_path(filename).exists()
    }

    /// 파일 삭제
    pub fn remove(&self, filename: &str) -> Result<()> {
        let path = self.file_path(filename);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                Error::Config(format!("Failed to remove {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_json_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nested"));

        assert!(store.load_json::<Sample>("state.json").unwrap().is_none());

        let sample = Sample {
            name: "crun".into(),
            count: 3,
        };
        store.save_json("state.json", &sample).unwrap();
        assert!(store.exists("state.json"));
        assert_eq!(store.load_json::<Sample>("state.json").unwrap(), Some(sample));

        store.remove("state.json").unwrap();
        assert!(!store.exists("state.json"));
    }

    #[test]
    fn test_toml_parse_error_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        std::fs::write(store.file_path("config.toml"), "name = [unterminated").unwrap();

        let err = store.load_toml::<Sample>("config.toml").unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }
}
