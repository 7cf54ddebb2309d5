use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::{Result, ViewError};

/// 视图索引与文档日志的物理后端
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// 纯内存：进程退出即丢失，测试 / 临时库
    #[default]
    Memory,
    /// 目录布局：文档 WAL + 每视图一个原子快照文件
    File,
}

impl StorageType {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageType::Memory => "memory",
            StorageType::File => "file",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerOptions {
    /// changes × views 超过该值时并行执行 map
    pub parallel_threshold: usize,
    /// 并行模式下每批处理的文档数（批之间检查中断）
    pub batch_size: usize,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            parallel_threshold: 512,
            batch_size: 256,
        }
    }
}

/// Manager 配置（可从 TOML 加载）
///
/// ```toml
/// directory = "/var/lib/docview"
/// storage_type = "file"
/// read_only = false
///
/// [indexer]
/// parallel_threshold = 512
/// batch_size = 256
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    pub directory: PathBuf,
    pub storage_type: StorageType,
    pub read_only: bool,
    pub indexer: IndexerOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            storage_type: StorageType::Memory,
            read_only: false,
            indexer: IndexerOptions::default(),
        }
    }
}

impl ManagerOptions {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file_backed(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            storage_type: StorageType::File,
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let opts: Self = toml::from_str(s)
            .map_err(|e| ViewError::InvalidConfiguration(format!("manager options: {}", e)))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.indexer.batch_size == 0 {
            return Err(ViewError::InvalidConfiguration(
                "indexer.batch_size must be > 0".into(),
            ));
        }
        if self.storage_type == StorageType::File && self.directory.as_os_str().is_empty() {
            return Err(ViewError::InvalidConfiguration(
                "file storage requires a directory".into(),
            ));
        }
        Ok(())
    }
}

fn default_directory() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("docview")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_defaults() {
        let opts = ManagerOptions::from_toml_str(
            r#"
            directory = "/tmp/dv"
            storage_type = "file"

            [indexer]
            parallel_threshold = 8
            "#,
        )
        .unwrap();
        assert_eq!(opts.directory, PathBuf::from("/tmp/dv"));
        assert_eq!(opts.storage_type, StorageType::File);
        assert!(!opts.read_only);
        assert_eq!(opts.indexer.parallel_threshold, 8);
        assert_eq!(opts.indexer.batch_size, 256);
    }

    #[test]
    fn empty_toml_is_all_defaults() {
        let opts = ManagerOptions::from_toml_str("").unwrap();
        assert_eq!(opts.storage_type, StorageType::Memory);
        assert_eq!(opts.indexer, IndexerOptions::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = ManagerOptions::from_toml_str("storage_type = \"forest\"").unwrap_err();
        assert!(matches!(err, ViewError::InvalidConfiguration(_)));

        let err = ManagerOptions::from_toml_str("[indexer]\nbatch_size = 0").unwrap_err();
        assert!(matches!(err, ViewError::InvalidConfiguration(_)));
    }
}
