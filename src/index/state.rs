use std::collections::BTreeMap;

use crate::core::{IndexMode, SnapshotId, SnapshotState, StoreRef};
use crate::error::IndexError;

/// 单个快照的登记信息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub state: SnapshotState,
    /// 该快照触及的路径（isSnapshotIndexed 的删除判定用）
    pub touched: Vec<String>,
}

/// 单个 store 的索引状态机（纯数据结构，不做 IO）。
///
/// - 每个快照的状态只能前进：Pending → Applied → Searchable；
/// - 新快照必须紧跟 last-known：`src == last_known && dst == src + 1`；
/// - `base` 是建索引时的整树快照，更早的快照都被它吸收。
#[derive(Clone, Debug)]
pub struct StoreState {
    store: StoreRef,
    mode: IndexMode,
    /// deleteIndex 后重建会得到新的 generation；worker 用它丢弃过期任务
    generation: u64,
    base: Option<SnapshotId>,
    last_known: Option<SnapshotId>,
    snapshots: BTreeMap<SnapshotId, SnapshotRecord>,
}

impl StoreState {
    pub fn new(store: StoreRef, mode: IndexMode, generation: u64) -> Self {
        Self {
            store,
            mode,
            generation,
            base: None,
            last_known: None,
            snapshots: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &StoreRef {
        &self.store
    }

    pub fn mode(&self) -> IndexMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: IndexMode) {
        self.mode = mode;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn base(&self) -> Option<SnapshotId> {
        self.base
    }

    pub fn last_known(&self) -> Option<SnapshotId> {
        self.last_known
    }

    pub fn last_applied(&self) -> Option<SnapshotId> {
        self.snapshots
            .iter()
            .rev()
            .find(|(_, r)| r.state.is_applied())
            .map(|(id, _)| *id)
    }

    pub fn last_searchable(&self) -> Option<SnapshotId> {
        self.snapshots
            .iter()
            .rev()
            .find(|(_, r)| r.state.is_searchable())
            .map(|(id, _)| *id)
    }

    /// 同步模式看 searchable，异步模式看最后登记的快照
    pub fn last_indexed(&self) -> Option<SnapshotId> {
        match self.mode {
            IndexMode::Synchronous => self.last_searchable(),
            IndexMode::Asynchronous => self.last_known,
        }
    }

    /// base 之前的快照返回 base 的状态
    pub fn state_of(&self, snapshot: SnapshotId) -> Option<SnapshotState> {
        let base = self.base?;
        let key = snapshot.max(base);
        self.snapshots.get(&key).map(|r| r.state)
    }

    pub fn record(&self, snapshot: SnapshotId) -> Option<&SnapshotRecord> {
        self.snapshots.get(&snapshot)
    }

    pub fn records(&self) -> impl Iterator<Item = (SnapshotId, &SnapshotRecord)> {
        self.snapshots.iter().map(|(id, r)| (*id, r))
    }

    /// 尚未 searchable 的快照（升序）
    pub fn unsearchable(&self) -> Vec<SnapshotId> {
        self.snapshots
            .iter()
            .filter(|(_, r)| !r.state.is_searchable())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// 严格顺序校验；失败时不修改任何状态
    pub fn check_next(&self, src: SnapshotId, dst: SnapshotId) -> Result<(), IndexError> {
        match self.last_known {
            Some(last) if last == src && dst == src + 1 => Ok(()),
            last => Err(IndexError::OutOfOrderSnapshot {
                store: self.store.clone(),
                last_known: last.unwrap_or(0),
                src,
                dst,
            }),
        }
    }

    /// 建索引时登记整树快照
    pub fn record_base(&mut self, snapshot: SnapshotId, touched: Vec<String>) -> Result<(), IndexError> {
        if self.base.is_some() {
            return Err(self.illegal(snapshot, SnapshotState::Pending));
        }
        self.base = Some(snapshot);
        self.insert_pending(snapshot, touched);
        Ok(())
    }

    /// 登记 delta 快照为 Pending（调用方须先通过 `check_next`）
    pub fn record_pending(&mut self, snapshot: SnapshotId, touched: Vec<String>) -> Result<(), IndexError> {
        if self.base.is_none() || self.snapshots.contains_key(&snapshot) {
            return Err(self.illegal(snapshot, SnapshotState::Pending));
        }
        if self.last_known.is_some_and(|last| snapshot <= last) {
            return Err(self.illegal(snapshot, SnapshotState::Pending));
        }
        self.insert_pending(snapshot, touched);
        Ok(())
    }

    fn insert_pending(&mut self, snapshot: SnapshotId, touched: Vec<String>) {
        self.snapshots.insert(
            snapshot,
            SnapshotRecord {
                state: SnapshotState::Pending,
                touched,
            },
        );
        self.last_known = Some(snapshot);
    }

    /// 同步应用失败时撤销刚登记的 Pending 快照
    pub fn rollback_pending(&mut self, snapshot: SnapshotId) {
        let is_pending = self
            .snapshots
            .get(&snapshot)
            .is_some_and(|r| r.state == SnapshotState::Pending);
        if !is_pending || self.last_known != Some(snapshot) || self.base == Some(snapshot) {
            return;
        }
        self.snapshots.remove(&snapshot);
        self.last_known = self.snapshots.keys().next_back().copied();
    }

    /// 异步任务真正执行时才知道触及的路径
    pub fn set_touched(&mut self, snapshot: SnapshotId, touched: Vec<String>) {
        if let Some(r) = self.snapshots.get_mut(&snapshot) {
            r.touched = touched;
        }
    }

    pub fn mark_applied(&mut self, snapshot: SnapshotId) -> Result<(), IndexError> {
        self.advance(snapshot, SnapshotState::Pending, SnapshotState::Applied)
    }

    pub fn mark_searchable(&mut self, snapshot: SnapshotId) -> Result<(), IndexError> {
        self.advance(snapshot, SnapshotState::Applied, SnapshotState::Searchable)
    }

    /// 后端 publish(n) 后：所有 `<= n` 的 Applied 快照一并变为 Searchable
    pub fn mark_searchable_up_to(&mut self, snapshot: SnapshotId) {
        for (_, r) in self.snapshots.range_mut(..=snapshot) {
            if r.state == SnapshotState::Applied {
                r.state = SnapshotState::Searchable;
            }
        }
    }

    /// 从持久化的可见 segment 恢复：`snapshot` 已 searchable
    pub fn restore_searchable(&mut self, snapshot: SnapshotId) {
        if self.base.is_none() {
            self.base = Some(snapshot);
        }
        self.snapshots.insert(
            snapshot,
            SnapshotRecord {
                state: SnapshotState::Searchable,
                touched: Vec::new(),
            },
        );
        if self.last_known.map_or(true, |last| snapshot > last) {
            self.last_known = Some(snapshot);
        }
    }

    fn advance(
        &mut self,
        snapshot: SnapshotId,
        from: SnapshotState,
        to: SnapshotState,
    ) -> Result<(), IndexError> {
        let current = self.snapshots.get(&snapshot).map(|r| r.state);
        match self.snapshots.get_mut(&snapshot) {
            Some(r) if r.state == from => {
                r.state = to;
                Ok(())
            }
            _ => Err(IndexError::IllegalTransition {
                store: self.store.clone(),
                snapshot,
                from: current,
                to,
            }),
        }
    }

    fn illegal(&self, snapshot: SnapshotId, to: SnapshotState) -> IndexError {
        IndexError::IllegalTransition {
            store: self.store.clone(),
            snapshot,
            from: self.snapshots.get(&snapshot).map(|r| r.state),
            to,
        }
    }
}
