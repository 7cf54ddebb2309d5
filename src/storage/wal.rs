use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Result, SequenceNumber, ViewError};

const WAL_MAGIC: u32 = 0x314C_5644; // "DVL1"
const WAL_VERSION: u32 = 1;
const HEADER_LEN: u64 = 8;

fn checksum(data: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(data)
}

/// 文档变更日志中的一条记录（一次 put / delete）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub sequence: SequenceNumber,
    pub doc_id: String,
    pub rev: String,
    pub deleted: bool,
    #[serde(default)]
    pub body: Value,
}

#[derive(Clone, Debug)]
pub struct WalReplayResult {
    pub records: Vec<LogRecord>,
    pub truncated_tail_records: usize,
    /// 最后一条完整记录之后的偏移
    pub valid_bytes: u64,
}

/// Append-only 文档变更日志（WAL）。
///
/// 帧格式：`len:u32 | xxh3:u64 | json payload`。
/// 尾部截断 / 校验失败的记录视为未提交，回放时丢弃。
pub struct WalStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl WalStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let f = open_or_init(&path)?;
        // 截掉损坏尾部，否则后续 append 会接在垃圾后面而永远读不到
        let r = read_wal_file(&path)?;
        if r.truncated_tail_records > 0 {
            tracing::warn!(
                "WAL {:?}: dropping {} torn tail record(s), keeping {} bytes",
                path,
                r.truncated_tail_records,
                r.valid_bytes
            );
            f.set_len(r.valid_bytes)?;
        }
        Ok(Self {
            path,
            file: Mutex::new(f),
        })
    }

    /// 只读回放：不建目录、不补 header、不截断尾部；文件不存在时为空
    pub fn read_only_replay(path: &Path) -> Result<WalReplayResult> {
        let r = read_wal_file(path)?;
        if r.truncated_tail_records > 0 {
            tracing::warn!(
                "WAL {:?}: ignoring {} torn tail record(s) (read-only)",
                path,
                r.truncated_tail_records
            );
        }
        Ok(r)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, records: &[LogRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for rec in records {
            let payload = serde_json::to_vec(rec)?;
            let len: u32 = payload
                .len()
                .try_into()
                .map_err(|_| ViewError::storage("wal record larger than 4GiB"))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&checksum(&payload).to_le_bytes());
            buf.extend_from_slice(&payload);
        }
        let mut f = self.file.lock();
        f.write_all(&buf)?;
        f.sync_data()?;
        Ok(())
    }

    pub fn replay(&self) -> Result<WalReplayResult> {
        // 持锁读取，避免与 append 交错
        let _g = self.file.lock();
        read_wal_file(&self.path)
    }

    /// 用给定记录集重写日志（tmp + rename），用于丢弃被覆盖的旧修订
    pub fn compact(&self, records: &[LogRecord]) -> Result<()> {
        let mut g = self.file.lock();
        let tmp = self.path.with_extension("wal.tmp");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            write_header(&mut f)?;
            for rec in records {
                let payload = serde_json::to_vec(rec)?;
                let len = payload.len() as u32;
                f.write_all(&len.to_le_bytes())?;
                f.write_all(&checksum(&payload).to_le_bytes())?;
                f.write_all(&payload)?;
            }
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        *g = open_or_init(&self.path)?;
        tracing::debug!("WAL compacted: {} records", records.len());
        Ok(())
    }
}

fn write_header(f: &mut File) -> Result<()> {
    f.write_all(&WAL_MAGIC.to_le_bytes())?;
    f.write_all(&WAL_VERSION.to_le_bytes())?;
    f.flush()?;
    Ok(())
}

fn reinit(path: &Path) -> Result<File> {
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    write_header(&mut f)?;
    drop(f);
    Ok(OpenOptions::new().read(true).append(true).open(path)?)
}

fn open_or_init(path: &Path) -> Result<File> {
    if !path.exists() {
        return reinit(path);
    }

    let mut f = OpenOptions::new().read(true).append(true).open(path)?;
    let mut hdr = [0u8; HEADER_LEN as usize];
    f.seek(SeekFrom::Start(0))?;
    if f.read_exact(&mut hdr).is_err() {
        // 空文件/截断：重写 header
        return reinit(path);
    }
    let magic = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
    let ver = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
    if magic != WAL_MAGIC || ver != WAL_VERSION {
        tracing::warn!("WAL {:?} has foreign header, starting a new log", path);
        return reinit(path);
    }
    Ok(f)
}

fn read_wal_file(path: &Path) -> Result<WalReplayResult> {
    let mut out = WalReplayResult {
        records: Vec::new(),
        truncated_tail_records: 0,
        valid_bytes: HEADER_LEN,
    };
    if !path.exists() {
        return Ok(out);
    }
    let mut r = BufReader::new(File::open(path)?);

    let mut hdr = [0u8; HEADER_LEN as usize];
    if r.read_exact(&mut hdr).is_err() {
        return Ok(out);
    }
    let magic = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
    let ver = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
    if magic != WAL_MAGIC || ver != WAL_VERSION {
        return Ok(out);
    }

    loop {
        let mut frame = [0u8; 12];
        if r.read_exact(&mut frame).is_err() {
            break;
        }
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let mut sum = [0u8; 8];
        sum.copy_from_slice(&frame[4..12]);
        let expected = u64::from_le_bytes(sum);

        let mut buf = vec![0u8; len];
        if r.read_exact(&mut buf).is_err() {
            out.truncated_tail_records += 1;
            break;
        }
        if checksum(&buf) != expected {
            // 校验失败：视为截断/损坏，停止读取
            out.truncated_tail_records += 1;
            break;
        }
        match serde_json::from_slice::<LogRecord>(&buf) {
            Ok(rec) => {
                out.records.push(rec);
                out.valid_bytes += 12 + len as u64;
            }
            Err(e) => {
                tracing::warn!("WAL record undecodable, stopping replay: {}", e);
                out.truncated_tail_records += 1;
                break;
            }
        }
    }
    Ok(out)
}
