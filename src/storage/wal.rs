use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core::{SnapshotId, StoreRef};

const WAL_MAGIC: u32 = 0x314C_4157; // "WAL1"
const WAL_VERSION: u32 = 2;

pub const WAL_FILE: &str = "pending.wal";
const SEAL_PREFIX: &str = "pending.wal.seal-";

fn now_seal_id() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn crc32_simple(data: &[u8]) -> u32 {
    // 轻量校验：足够发现截断/随机翻转，不是强校验。
    let mut s: u32 = 0;
    for &b in data {
        s = s.wrapping_add(b as u32);
        s = s.rotate_left(3);
    }
    s
}

/// 异步模式下登记的待应用任务
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PendingTask {
    /// createIndex：在 `snapshot` 上整树索引
    Root { store: StoreRef, snapshot: SnapshotId },
    /// index：应用 src → dst 的 delta
    Delta {
        store: StoreRef,
        src: SnapshotId,
        dst: SnapshotId,
    },
    /// deleteIndex：回放时丢弃此前登记的同 store 任务
    Drop { store: StoreRef },
}

impl PendingTask {
    pub fn store(&self) -> &StoreRef {
        match self {
            PendingTask::Root { store, .. }
            | PendingTask::Delta { store, .. }
            | PendingTask::Drop { store } => store,
        }
    }

    /// 任务完成后 store 到达的快照
    pub fn target(&self) -> SnapshotId {
        match self {
            PendingTask::Root { snapshot, .. } => *snapshot,
            PendingTask::Delta { dst, .. } => *dst,
            PendingTask::Drop { .. } => 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WalReplayResult {
    pub tasks: Vec<PendingTask>,
    pub sealed_used: usize,
    pub truncated_tail_records: usize,
}

/// Append-only 待应用任务日志（WAL）。
///
/// - current: pending.wal
/// - sealed: pending.wal.seal-<id>（checkpoint 边界切分）
///
/// 异步 `index()` 在返回前把任务写入这里，即“持久登记为 pending”；
/// 重启后 `replay_since_seal` 取回尚未 checkpoint 的任务。
pub struct WalStore {
    dir: PathBuf,
    current: PathBuf,
    file: Mutex<File>,
}

impl WalStore {
    pub fn open_in_dir(dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let current = dir.join(WAL_FILE);
        let f = open_or_init(&current)?;
        Ok(Self {
            dir,
            current,
            file: Mutex::new(f),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&self, tasks: &[PendingTask]) -> anyhow::Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut f = self.file.lock();
        for t in tasks {
            let payload = encode_task(t);
            let len: u32 = payload.len().try_into().unwrap_or(u32::MAX);
            let crc = crc32_simple(&payload);
            f.write_all(&len.to_le_bytes())?;
            f.write_all(&crc.to_le_bytes())?;
            f.write_all(&payload[..len as usize])?;
        }
        f.flush()?;
        f.sync_data()?;
        Ok(())
    }

    /// seal：把当前 WAL rename 成 sealed 文件，并创建新的空 WAL。
    pub fn seal(&self) -> anyhow::Result<u64> {
        let mut f = self.file.lock();
        f.flush()?;

        let id = now_seal_id();
        let sealed = self.dir.join(format!("{SEAL_PREFIX}{id:016x}"));

        if self.current.exists() {
            std::fs::rename(&self.current, &sealed)?;
        }
        *f = open_or_init(&self.current)?;
        Ok(id)
    }

    pub fn cleanup_sealed_up_to(&self, seal_id: u64) -> anyhow::Result<()> {
        if seal_id == 0 {
            return Ok(());
        }
        for ent in std::fs::read_dir(&self.dir)? {
            let Ok(ent) = ent else { continue };
            let p = ent.path();
            if let Some(id) = parse_seal_id(&p) {
                if id <= seal_id {
                    let _ = std::fs::remove_file(p);
                }
            }
        }
        Ok(())
    }

    /// checkpoint：所有已登记任务都已 searchable 时调用，丢弃全部历史。
    pub fn checkpoint(&self) -> anyhow::Result<()> {
        let id = self.seal()?;
        self.cleanup_sealed_up_to(id)
    }

    /// 回放：读取 seal_id > checkpoint 的 sealed WAL + 当前 WAL。
    pub fn replay_since_seal(&self, checkpoint_seal_id: u64) -> anyhow::Result<WalReplayResult> {
        let mut sealed = Vec::new();
        for ent in std::fs::read_dir(&self.dir)? {
            let Ok(ent) = ent else { continue };
            let p = ent.path();
            if let Some(id) = parse_seal_id(&p) {
                if id > checkpoint_seal_id {
                    sealed.push((id, p));
                }
            }
        }
        sealed.sort_by_key(|(id, _)| *id);

        let mut tasks = Vec::new();
        let mut truncated = 0usize;
        for (_, p) in sealed.iter() {
            let (mut ts, t) = read_wal_file(p)?;
            truncated += t;
            tasks.append(&mut ts);
        }
        let (mut cur, t) = {
            let _g = self.file.lock();
            read_wal_file(&self.current)?
        };
        truncated += t;
        tasks.append(&mut cur);

        Ok(WalReplayResult {
            tasks,
            sealed_used: sealed.len(),
            truncated_tail_records: truncated,
        })
    }
}

fn write_header(f: &mut File) -> anyhow::Result<()> {
    f.write_all(&WAL_MAGIC.to_le_bytes())?;
    f.write_all(&WAL_VERSION.to_le_bytes())?;
    f.flush()?;
    Ok(())
}

fn reopen_truncated(path: &Path) -> anyhow::Result<File> {
    let mut nf = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    write_header(&mut nf)?;
    drop(nf);
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?)
}

fn open_or_init(path: &Path) -> anyhow::Result<File> {
    let exists = path.exists();
    let mut f = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;

    if !exists {
        write_header(&mut f)?;
        return Ok(f);
    }

    // 快速校验 header；不匹配则重建（避免历史垃圾文件导致读崩）。
    let mut hdr = [0u8; 8];
    f.seek(SeekFrom::Start(0))?;
    if f.read_exact(&mut hdr).is_err() {
        return reopen_truncated(path);
    }

    let magic = u32::from_le_bytes(hdr[0..4].try_into()?);
    let ver = u32::from_le_bytes(hdr[4..8].try_into()?);
    if magic != WAL_MAGIC || ver != WAL_VERSION {
        tracing::warn!("Pending log header mismatch, truncating {:?}", path);
        return reopen_truncated(path);
    }

    Ok(f)
}

fn parse_seal_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let hex = name.strip_prefix(SEAL_PREFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

fn read_wal_file(path: &Path) -> anyhow::Result<(Vec<PendingTask>, usize)> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let mut f = File::open(path)?;

    let mut hdr = [0u8; 8];
    if f.read_exact(&mut hdr).is_err() {
        return Ok((Vec::new(), 0));
    }
    let magic = u32::from_le_bytes(hdr[0..4].try_into()?);
    let ver = u32::from_le_bytes(hdr[4..8].try_into()?);
    if magic != WAL_MAGIC || ver != WAL_VERSION {
        return Ok((Vec::new(), 0));
    }

    let mut out = Vec::new();
    let mut truncated_tail = 0usize;
    loop {
        let mut lb = [0u8; 8];
        if f.read_exact(&mut lb).is_err() {
            break;
        }
        let len = u32::from_le_bytes(lb[0..4].try_into()?) as usize;
        let crc = u32::from_le_bytes(lb[4..8].try_into()?);
        let mut buf = vec![0u8; len];
        if f.read_exact(&mut buf).is_err() {
            truncated_tail += 1;
            break;
        }
        if crc32_simple(&buf) != crc {
            // 校验失败：视为截断/损坏，停止读取（保守）。
            truncated_tail += 1;
            break;
        }
        if let Some(t) = decode_task(&buf) {
            out.push(t);
        }
    }
    Ok((out, truncated_tail))
}

fn encode_task(t: &PendingTask) -> Vec<u8> {
    let (kind, src, dst) = match t {
        PendingTask::Root { snapshot, .. } => (1u8, 0u64, *snapshot),
        PendingTask::Delta { src, dst, .. } => (2u8, *src, *dst),
        PendingTask::Drop { .. } => (3u8, 0, 0),
    };
    let store = t.store().as_str().as_bytes();
    let slen: u32 = store.len().try_into().unwrap_or(u32::MAX);

    let mut out = Vec::with_capacity(1 + 8 + 8 + 4 + store.len());
    out.push(kind);
    out.extend_from_slice(&src.to_le_bytes());
    out.extend_from_slice(&dst.to_le_bytes());
    out.extend_from_slice(&slen.to_le_bytes());
    out.extend_from_slice(&store[..slen as usize]);
    out
}

fn decode_task(buf: &[u8]) -> Option<PendingTask> {
    let kind = *buf.first()?;
    let src = u64::from_le_bytes(buf.get(1..9)?.try_into().ok()?);
    let dst = u64::from_le_bytes(buf.get(9..17)?.try_into().ok()?);
    let slen = u32::from_le_bytes(buf.get(17..21)?.try_into().ok()?) as usize;
    let store = std::str::from_utf8(buf.get(21..21 + slen)?).ok()?;
    let store = StoreRef::new(store);
    match kind {
        1 => Some(PendingTask::Root {
            store,
            snapshot: dst,
        }),
        2 => Some(PendingTask::Delta { store, src, dst }),
        3 => Some(PendingTask::Drop { store }),
        _ => None,
    }
}
