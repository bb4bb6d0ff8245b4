use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::core::{SnapshotId, StoreRef};
use crate::index::backend::Document;

/// Segment 文件 Header
const MAGIC: u32 = 0x5344_5801; // "SDX\x01"
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8; // magic + version + state + data_len + checksum

pub const SEGMENT_FILE: &str = "segment.db";

/// 单个 store 的可查询状态（落盘形态）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SegmentData {
    pub store: StoreRef,
    /// 该 segment 对应的最后一个 searchable 快照
    pub snapshot: SnapshotId,
    pub docs: Vec<Document>,
}

/// 原子 segment 存储（atomic replacement）
///
/// 落盘流程：
/// 1) 写 segment.db.tmp 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) `bincode::serialize_into(file)` 流式写 body，边写边算 xxh3 / data_len
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)（POSIX 原子替换）
/// 6) fsync(dir)
///
/// 加载时校验 magic + version + state + data_len + checksum，任何不一致都视为不存在。
pub struct SegmentStore {
    path: PathBuf,
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Xxh3,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u64) {
        (self.bytes, self.hasher.digest())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn encode_header(state: u32, data_len: u64, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    header[8..12].copy_from_slice(&state.to_le_bytes());
    header[12..20].copy_from_slice(&data_len.to_le_bytes());
    header[20..28].copy_from_slice(&checksum.to_le_bytes());
    header
}

impl SegmentStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `<dir>/segment.db`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SEGMENT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_if_valid(&self) -> anyhow::Result<Option<SegmentData>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = std::fs::read(&self.path)?;
        if data.len() < HEADER_SIZE {
            tracing::warn!("Segment too small, ignoring: {:?}", self.path);
            return Ok(None);
        }

        let magic = u32::from_le_bytes(data[0..4].try_into()?);
        let version = u32::from_le_bytes(data[4..8].try_into()?);
        let state = u32::from_le_bytes(data[8..12].try_into()?);
        let data_len = u64::from_le_bytes(data[12..20].try_into()?) as usize;
        let stored_checksum = u64::from_le_bytes(data[20..28].try_into()?);

        if magic != MAGIC {
            tracing::warn!("Segment magic mismatch: {:#x} != {:#x}", magic, MAGIC);
            return Ok(None);
        }
        if version != VERSION_CURRENT {
            tracing::warn!(
                "Segment version mismatch: {} != {}",
                version,
                VERSION_CURRENT
            );
            return Ok(None);
        }
        if state != STATE_COMMITTED {
            tracing::warn!("Segment state INCOMPLETE, ignoring: {:?}", self.path);
            return Ok(None);
        }

        let body = &data[HEADER_SIZE..];
        if body.len() != data_len {
            tracing::warn!("Segment data length mismatch: {:?}", self.path);
            return Ok(None);
        }

        let computed = xxhash_rust::xxh3::xxh3_64(body);
        if computed != stored_checksum {
            tracing::warn!(
                "Segment checksum mismatch: {:#x} != {:#x}",
                computed,
                stored_checksum
            );
            return Ok(None);
        }

        match bincode::deserialize::<SegmentData>(body) {
            Ok(seg) => Ok(Some(seg)),
            Err(e) => {
                tracing::warn!("Segment deserialize failed: {}", e);
                Ok(None)
            }
        }
    }

    pub fn write_atomic(&self, seg: &SegmentData) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("db.tmp");

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&encode_header(STATE_INCOMPLETE, 0, 0))?;

        let (data_len, checksum) = {
            let mut cw = ChecksumWriter::new(&mut file);
            bincode::serialize_into(&mut cw, seg)?;
            cw.finish()
        };

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&encode_header(STATE_COMMITTED, data_len, checksum))?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        tracing::debug!(
            "Segment written: store={} snapshot={} docs={} bytes={}",
            seg.store,
            seg.snapshot,
            seg.docs.len(),
            HEADER_SIZE as u64 + data_len
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NodeKind, NodeRef, Properties, QName};

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("snapdex-seg-{}-{}", tag, nanos))
    }

    fn doc(store: &StoreRef, path: &str) -> Document {
        Document {
            node: NodeRef::new(store.clone(), path),
            qname: QName::content(path.trim_start_matches('/')),
            parent: None,
            kind: NodeKind::File,
            snapshot: 3,
            properties: Properties::new(),
            content: Some("body".into()),
        }
    }

    #[test]
    fn write_then_load_roundtrip() {
        let dir = unique_tmp_dir("rt");
        let store = StoreRef::new("s");
        let seg = SegmentData {
            store: store.clone(),
            snapshot: 3,
            docs: vec![doc(&store, "/a"), doc(&store, "/b")],
        };
        let ss = SegmentStore::in_dir(&dir);
        ss.write_atomic(&seg).unwrap();

        let loaded = ss.load_if_valid().unwrap().unwrap();
        assert_eq!(loaded.snapshot, 3);
        assert_eq!(loaded.docs.len(), 2);
        assert_eq!(loaded.docs[1].node.path, "/b");
        assert!(!dir.join("segment.db.tmp").exists());
    }

    #[test]
    fn corrupted_body_is_ignored() {
        let dir = unique_tmp_dir("corrupt");
        let store = StoreRef::new("s");
        let ss = SegmentStore::in_dir(&dir);
        ss.write_atomic(&SegmentData {
            store: store.clone(),
            snapshot: 1,
            docs: vec![doc(&store, "/a")],
        })
        .unwrap();

        let mut bytes = std::fs::read(ss.path()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(ss.path(), bytes).unwrap();

        assert!(ss.load_if_valid().unwrap().is_none());
    }

    #[test]
    fn missing_file_is_none() {
        let ss = SegmentStore::in_dir(&unique_tmp_dir("missing"));
        assert!(ss.load_if_valid().unwrap().is_none());
    }
}
