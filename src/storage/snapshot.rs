use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{Collation, Result, SequenceNumber, ViewError};

/// 索引快照文件 Header
const MAGIC: u32 = 0xDDF1_0001;
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8; // magic + version + state + data_len + checksum

/// 持久化的单行：key / value 以 JSON 文本保存（bincode 不支持自描述的 serde_json::Value）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedRow {
    pub key_json: String,
    pub value_json: String,
    pub doc_id: String,
    pub emit_index: u32,
    pub sequence: SequenceNumber,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub map_version: Option<String>,
    pub collation: Collation,
    pub last_sequence_indexed: SequenceNumber,
    pub last_sequence_changed_at: SequenceNumber,
    pub rows: Vec<PersistedRow>,
    /// doc_id -> 已索引的修订号
    pub doc_revs: Vec<(String, String)>,
}

/// 原子快照存储（atomic replacement）
///
/// 落盘流程：
/// 1) `prepare`：把 header + bincode body 写入 `<path>.tmp` 并 fsync
/// 2) `publish`：rename(tmp, target) 原子替换，再 fsync(dir)
///
/// 崩溃在 1) 与 2) 之间只留下 tmp，target 仍是旧快照。
/// 加载时校验 magic + version + state + data_len + checksum，任何不一致都拒绝。
pub struct SnapshotStore {
    path: PathBuf,
}

/// 已写入 tmp、等待 rename 的快照
#[must_use]
pub struct PreparedSnapshot {
    tmp: PathBuf,
    target: PathBuf,
}

impl PreparedSnapshot {
    pub fn publish(self) -> Result<()> {
        std::fs::rename(&self.tmp, &self.target)?;
        if let Some(dir) = self.target.parent() {
            // 目录项落盘（部分平台不支持打开目录，忽略）
            if let Ok(d) = File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }

    pub fn discard(self) {
        let _ = std::fs::remove_file(&self.tmp);
    }
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn prepare(&self, index: &PersistedIndex) -> Result<PreparedSnapshot> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = bincode::serialize(index)?;
        let sum = xxhash_rust::xxh3::xxh3_64(&body);

        let tmp = tmp_path(&self.path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        let mut w = BufWriter::new(file);
        w.write_all(&MAGIC.to_le_bytes())?;
        w.write_all(&VERSION_CURRENT.to_le_bytes())?;
        w.write_all(&STATE_COMMITTED.to_le_bytes())?;
        w.write_all(&(body.len() as u64).to_le_bytes())?;
        w.write_all(&sum.to_le_bytes())?;
        w.write_all(&body)?;
        let file = w
            .into_inner()
            .map_err(|e| ViewError::storage(format!("flush snapshot: {}", e)))?;
        file.sync_all()?;

        Ok(PreparedSnapshot {
            tmp,
            target: self.path.clone(),
        })
    }

    pub fn save(&self, index: &PersistedIndex) -> Result<()> {
        self.prepare(index)?.publish()
    }

    /// 读取并校验；文件不存在返回 None，损坏返回 Err
    pub fn load_if_valid(&self) -> Result<Option<PersistedIndex>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();
        let mut r = BufReader::new(file);
        let mut hdr = [0u8; HEADER_SIZE];
        r.read_exact(&mut hdr)
            .map_err(|_| ViewError::storage("snapshot header truncated"))?;

        let u32_at = |off: usize| u32::from_le_bytes([hdr[off], hdr[off + 1], hdr[off + 2], hdr[off + 3]]);
        let u64_at = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&hdr[off..off + 8]);
            u64::from_le_bytes(b)
        };

        if u32_at(0) != MAGIC {
            return Err(ViewError::storage("snapshot magic mismatch"));
        }
        if u32_at(4) != VERSION_CURRENT {
            return Err(ViewError::storage(format!(
                "unsupported snapshot version {}",
                u32_at(4)
            )));
        }
        if u32_at(8) != STATE_COMMITTED {
            return Err(ViewError::storage("snapshot not committed"));
        }
        // 长度字段先和文件实际大小对齐，再分配
        let available = file_len.saturating_sub(HEADER_SIZE as u64);
        if u64_at(12) != available {
            return Err(ViewError::storage(format!(
                "snapshot length mismatch: header {} file body {}",
                u64_at(12),
                available
            )));
        }
        let data_len: usize = available
            .try_into()
            .map_err(|_| ViewError::storage("snapshot body too large"))?;
        let expected = u64_at(20);

        let mut body = Vec::with_capacity(data_len);
        r.read_to_end(&mut body)?;
        if body.len() != data_len {
            return Err(ViewError::storage(format!(
                "snapshot length mismatch: header {} body {}",
                data_len,
                body.len()
            )));
        }
        if xxhash_rust::xxh3::xxh3_64(&body) != expected {
            return Err(ViewError::storage("snapshot checksum mismatch"));
        }
        Ok(Some(bincode::deserialize(&body)?))
    }

    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("docview-snap-{}-{}", tag, nanos))
    }

    fn sample() -> PersistedIndex {
        PersistedIndex {
            map_version: Some("v1".into()),
            collation: Collation::Ascii,
            last_sequence_indexed: 7,
            last_sequence_changed_at: 6,
            rows: vec![PersistedRow {
                key_json: "\"x\"".into(),
                value_json: "\"a\"".into(),
                doc_id: "a".into(),
                emit_index: 0,
                sequence: 1,
            }],
            doc_revs: vec![("a".into(), "1-abc".into())],
        }
    }

    #[test]
    fn save_then_load() {
        let dir = unique_tmp_dir("basic");
        let store = SnapshotStore::new(dir.join("v.index"));
        assert!(store.load_if_valid().unwrap().is_none());
        store.save(&sample()).unwrap();
        assert_eq!(store.load_if_valid().unwrap(), Some(sample()));
    }

    #[test]
    fn discarded_prepare_leaves_old_snapshot() {
        let dir = unique_tmp_dir("discard");
        let store = SnapshotStore::new(dir.join("v.index"));
        store.save(&sample()).unwrap();

        let mut next = sample();
        next.last_sequence_indexed = 99;
        store.prepare(&next).unwrap().discard();

        let loaded = store.load_if_valid().unwrap().unwrap();
        assert_eq!(loaded.last_sequence_indexed, 7);
    }

    #[test]
    fn corrupted_body_is_rejected() {
        let dir = unique_tmp_dir("corrupt");
        let path = dir.join("v.index");
        let store = SnapshotStore::new(path.clone());
        store.save(&sample()).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(store.load_if_valid().is_err());
    }

    #[test]
    fn oversized_length_field_is_rejected() {
        let dir = unique_tmp_dir("len");
        let path = dir.join("v.index");
        let store = SnapshotStore::new(path.clone());
        store.save(&sample()).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[12..20].copy_from_slice(&u64::MAX.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(store.load_if_valid(), Err(ViewError::Storage(_))));

        // 比实际 body 短也拒绝
        let real = (bytes.len() - HEADER_SIZE) as u64;
        bytes[12..20].copy_from_slice(&(real - 1).to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(store.load_if_valid(), Err(ViewError::Storage(_))));
    }
}
