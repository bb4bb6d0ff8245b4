use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock, RwLockWriteGuard};
use serde::Serialize;

use crate::core::{
    split_path, ChangeAction, ChildAssocRef, ContentSource, IndexMode, NodeDescriptor, NodeRef,
    SnapshotId, SnapshotState, StoreRef,
};
use crate::error::IndexError;
use crate::index::backend::{DocOp, Document, IndexBackend};
use crate::index::state::StoreState;
use crate::index::verify::{self, ApplyFailure, DriftReport};
use crate::index::worker::{ApplyTask, ApplyWorker};
use crate::storage::wal::{PendingTask, WalStore};

/// tracker 启动参数
#[derive(Clone, Debug)]
pub struct TrackerOptions {
    /// 异步任务的 pending log 目录；None 表示不落盘
    pub pending_log_dir: Option<PathBuf>,
    pub worker_threads: usize,
    pub queue_capacity: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            pending_log_dir: None,
            worker_threads: num_cpus::get(),
            queue_capacity: 1024,
        }
    }
}

/// 单个 store 的对外状态摘要
#[derive(Clone, Debug, Serialize)]
pub struct StoreStatus {
    pub store: String,
    pub mode: IndexMode,
    pub last_known: Option<SnapshotId>,
    pub last_applied: Option<SnapshotId>,
    pub last_searchable: Option<SnapshotId>,
    pub tracked_snapshots: usize,
    /// 已登记但尚未 searchable 的快照数
    pub unsearchable: usize,
    pub docs: u64,
    pub last_failure: Option<ApplyFailure>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub stores: usize,
    pub replayed: usize,
    pub truncated_tail_records: usize,
}

/// 索引状态追踪器：每个 store 一个状态机，串行化单 store 的应用，跨 store 并行。
///
/// 锁顺序：commit_gate(read) → store mutex → pending。
/// backup 持有 commit_gate(write) 时不会有快照处于应用中。
pub struct IndexTracker {
    content: Arc<dyn ContentSource>,
    backend: Arc<dyn IndexBackend>,
    stores: DashMap<StoreRef, Arc<Mutex<StoreState>>>,
    generation: AtomicU64,
    commit_gate: RwLock<()>,
    /// 已登记但 worker 尚未处理完的异步任务数
    pending: Mutex<usize>,
    idle: Condvar,
    /// 每个 store 最近一次异步应用失败；成功应用后清除
    failures: DashMap<StoreRef, ApplyFailure>,
    progress: Mutex<u64>,
    progressed: Condvar,
    wal: Option<WalStore>,
    queue: Sender<ApplyTask>,
}

impl IndexTracker {
    pub fn start(
        content: Arc<dyn ContentSource>,
        backend: Arc<dyn IndexBackend>,
        opts: TrackerOptions,
    ) -> anyhow::Result<Arc<Self>> {
        let wal = match &opts.pending_log_dir {
            Some(dir) => Some(WalStore::open_in_dir(dir.clone())?),
            None => None,
        };
        let (tx, rx) = bounded(opts.queue_capacity.max(1));

        let tracker = Arc::new(Self {
            content,
            backend,
            stores: DashMap::new(),
            generation: AtomicU64::new(0),
            commit_gate: RwLock::new(()),
            pending: Mutex::new(0),
            idle: Condvar::new(),
            failures: DashMap::new(),
            progress: Mutex::new(0),
            progressed: Condvar::new(),
            wal,
            queue: tx,
        });

        ApplyWorker::spawn(Arc::downgrade(&tracker), rx, opts.worker_threads)?;
        tracing::info!(
            "Index tracker started: worker_threads={} queue_capacity={} pending_log={}",
            opts.worker_threads,
            opts.queue_capacity,
            opts.pending_log_dir.is_some()
        );
        Ok(tracker)
    }

    pub fn backend(&self) -> &Arc<dyn IndexBackend> {
        &self.backend
    }

    pub fn content(&self) -> &Arc<dyn ContentSource> {
        &self.content
    }

    fn entry(&self, store: &StoreRef) -> Option<Arc<Mutex<StoreState>>> {
        self.stores.get(store).map(|e| e.value().clone())
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ---------------------------------------------------------------------
    // 状态机操作
    // ---------------------------------------------------------------------

    /// 建索引（幂等）：在内容存储当前 head 上整树索引
    pub fn create_index(&self, store: &StoreRef, mode: IndexMode) -> Result<(), IndexError> {
        let _g = self.commit_gate.read();

        let head = self
            .content
            .head(store)
            .ok_or_else(|| IndexError::IndexCreation {
                store: store.clone(),
                reason: "content root could not be resolved".into(),
            })?;

        let generation = self.next_generation();
        let entry = match self.stores.entry(store.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!("create_index: store {} already indexed", store);
                return Ok(());
            }
            Entry::Vacant(v) => {
                let st = Arc::new(Mutex::new(StoreState::new(store.clone(), mode, generation)));
                v.insert(st.clone());
                st
            }
        };

        let dispatch = {
            let mut st = entry.lock();
            let res = self
                .backend
                .create_store(store)
                .and_then(|_| st.record_base(head, Vec::new()));
            let res = res.and_then(|_| match mode {
                IndexMode::Synchronous => self.apply_locked(&mut st, head).map(|_| None),
                IndexMode::Asynchronous => {
                    self.register_pending(&PendingTask::Root {
                        store: store.clone(),
                        snapshot: head,
                    });
                    Ok(Some(ApplyTask {
                        store: store.clone(),
                        generation,
                        target: head,
                    }))
                }
            });
            match res {
                Ok(d) => d,
                Err(e) => {
                    drop(st);
                    self.stores.remove(store);
                    let _ = self.backend.drop_store(store);
                    return Err(IndexError::IndexCreation {
                        store: store.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        };

        tracing::info!("Index created: store={} snapshot={} mode={}", store, head, mode);
        match dispatch {
            Some(t) => self.dispatch(t),
            None => self.bump_progress(),
        }
        Ok(())
    }

    /// 应用 src → dst 的 delta；要求 `src == last_known && dst == src + 1`
    pub fn index(
        &self,
        store: &StoreRef,
        src: SnapshotId,
        dst: SnapshotId,
        mode: IndexMode,
    ) -> Result<(), IndexError> {
        let entry = self
            .entry(store)
            .ok_or_else(|| IndexError::NotCreated(store.clone()))?;

        match mode {
            IndexMode::Synchronous => {
                let _g = self.commit_gate.read();
                {
                    let mut st = entry.lock();
                    st.check_next(src, dst)?;
                    st.record_pending(dst, Vec::new())?;
                    if let Err(e) = self.apply_locked(&mut st, dst) {
                        st.rollback_pending(dst);
                        return Err(e);
                    }
                    st.set_mode(mode);
                    self.failures.remove(store);
                }
                self.bump_progress();
            }
            IndexMode::Asynchronous => {
                let task = {
                    let mut st = entry.lock();
                    st.check_next(src, dst)?;
                    st.record_pending(dst, Vec::new())?;
                    st.set_mode(mode);
                    self.register_pending(&PendingTask::Delta {
                        store: store.clone(),
                        src,
                        dst,
                    });
                    ApplyTask {
                        store: store.clone(),
                        generation: st.generation(),
                        target: dst,
                    }
                };
                self.dispatch(task);
            }
        }
        tracing::debug!("index: store={} {} -> {} mode={}", store, src, dst, mode);
        Ok(())
    }

    /// 删除 store 的全部索引状态与后端数据
    pub fn delete_index(&self, store: &StoreRef, mode: IndexMode) -> Result<(), IndexError> {
        let _g = self.commit_gate.read();
        let removed = self.stores.remove(store);

        // 等待进行中的应用结束
        let _st = removed.as_ref().map(|(_, e)| e.lock());
        if removed.is_some() {
            let _p = self.pending.lock();
            if let Some(wal) = &self.wal {
                if let Err(e) = wal.append(&[PendingTask::Drop {
                    store: store.clone(),
                }]) {
                    tracing::warn!("Pending log append failed for drop of {}: {}", store, e);
                }
            }
        }
        self.failures.remove(store);
        self.backend.drop_store(store)?;
        drop(_st);

        tracing::info!("Index deleted: store={} mode={}", store, mode);
        self.bump_progress();
        Ok(())
    }

    pub fn last_indexed_snapshot(&self, store: &StoreRef) -> Option<SnapshotId> {
        self.entry(store)?.lock().last_indexed()
    }

    pub fn has_index_been_created(&self, store: &StoreRef) -> bool {
        self.stores.contains_key(store)
    }

    /// 状态 ≥ Applied，且后端条目能解释该快照（含纯删除快照）
    pub fn is_snapshot_indexed(&self, store: &StoreRef, snapshot: SnapshotId) -> bool {
        let Some(entry) = self.entry(store) else {
            return false;
        };
        let st = entry.lock();
        if !st.state_of(snapshot).is_some_and(SnapshotState::is_applied) {
            return false;
        }
        let touched = st
            .record(snapshot)
            .map(|r| r.touched.as_slice())
            .unwrap_or(&[]);
        let live_at = st.last_applied().unwrap_or(snapshot).max(snapshot);
        verify::entries_account_for(
            self.backend.as_ref(),
            self.content.as_ref(),
            store,
            snapshot,
            live_at,
            touched,
        )
    }

    pub fn is_snapshot_searchable(&self, store: &StoreRef, snapshot: SnapshotId) -> bool {
        self.entry(store)
            .and_then(|e| e.lock().state_of(snapshot))
            .is_some_and(SnapshotState::is_searchable)
    }

    pub fn indexed_doc_count(&self) -> u64 {
        self.backend.doc_count()
    }

    pub fn stores(&self) -> Vec<StoreRef> {
        let mut v: Vec<StoreRef> = self.stores.iter().map(|e| e.key().clone()).collect();
        v.sort();
        v
    }

    pub fn status(&self) -> Vec<StoreStatus> {
        self.stores()
            .into_iter()
            .filter_map(|s| {
                let entry = self.entry(&s)?;
                let st = entry.lock();
                Some(StoreStatus {
                    store: s.to_string(),
                    mode: st.mode(),
                    last_known: st.last_known(),
                    last_applied: st.last_applied(),
                    last_searchable: st.last_searchable(),
                    tracked_snapshots: st.snapshot_count(),
                    unsearchable: st.unsearchable().len(),
                    docs: self.backend.store_doc_count(&s),
                    last_failure: self.failures.get(&s).map(|f| f.value().clone()),
                })
            })
            .collect()
    }

    pub fn pending_tasks(&self) -> usize {
        *self.pending.lock()
    }

    /// 管理员漂移检查（只读）
    pub fn verify(&self, store: &StoreRef) -> Result<DriftReport, IndexError> {
        let entry = self
            .entry(store)
            .ok_or_else(|| IndexError::NotCreated(store.clone()))?;
        let st = entry.lock();
        let failure = self.failures.get(store).map(|f| f.value().clone());
        let report = verify::check_store(
            &st,
            self.backend.as_ref(),
            self.content.as_ref(),
            failure,
        );
        if !report.is_clean() {
            tracing::warn!(
                "Index drift detected: store={} missing={:?} state={:?} backend={:?}",
                store,
                report.missing_entries,
                report.state_searchable,
                report.backend_searchable
            );
        }
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // 等待
    // ---------------------------------------------------------------------

    pub fn wait_until_searchable(
        &self,
        store: &StoreRef,
        snapshot: SnapshotId,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = *self.progress.lock();
            if self.is_snapshot_searchable(store, snapshot) {
                return true;
            }
            let mut g = self.progress.lock();
            let mut timed_out = false;
            while *g == seen && !timed_out {
                timed_out = self.progressed.wait_until(&mut g, deadline).timed_out();
            }
            drop(g);
            if timed_out {
                return self.is_snapshot_searchable(store, snapshot);
            }
        }
    }

    /// 等待所有已登记的异步任务处理完（失败的任务也算处理完，见 `last_failure`）
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut p = self.pending.lock();
        while *p > 0 {
            if self.idle.wait_until(&mut p, deadline).timed_out() {
                return *p == 0;
            }
        }
        true
    }

    /// 暂停所有快照应用（返回的 guard 释放前不会有应用进行）
    pub fn pause_applications(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit_gate.write()
    }

    // ---------------------------------------------------------------------
    // 恢复
    // ---------------------------------------------------------------------

    /// 启动恢复：
    /// 1) 后端已持久化的 segment → searchable 快照
    /// 2) pending log 中比 searchable 新的任务按顺序重新登记并交给 worker
    pub fn recover(&self) -> Result<RecoveryReport, IndexError> {
        let mut report = RecoveryReport::default();

        for store in self.backend.stores() {
            let Some(snap) = self.backend.searchable_snapshot(&store) else {
                continue;
            };
            let mut st = StoreState::new(store.clone(), IndexMode::Synchronous, self.next_generation());
            st.restore_searchable(snap);
            self.stores.insert(store.clone(), Arc::new(Mutex::new(st)));
            report.stores += 1;
            tracing::info!("Recovered store {} at snapshot {}", store, snap);
        }

        let Some(wal) = &self.wal else {
            return Ok(report);
        };
        let replay = wal
            .replay_since_seal(0)
            .map_err(|e| IndexError::Backend(format!("pending log replay: {}", e)))?;
        report.truncated_tail_records = replay.truncated_tail_records;
        if replay.truncated_tail_records > 0 {
            tracing::warn!(
                "Pending log had {} torn tail record(s)",
                replay.truncated_tail_records
            );
        }

        let mut live: Vec<PendingTask> = Vec::new();
        for t in replay.tasks {
            match t {
                PendingTask::Drop { store } => live.retain(|x| x.store() != &store),
                other => live.push(other),
            }
        }
        live.sort_by(|a, b| a.store().cmp(b.store()).then(a.target().cmp(&b.target())));

        let mut dispatch = Vec::new();
        for t in live {
            match t {
                PendingTask::Root { store, snapshot } => {
                    if self.stores.contains_key(&store) {
                        continue;
                    }
                    self.backend.create_store(&store)?;
                    let generation = self.next_generation();
                    let mut st = StoreState::new(store.clone(), IndexMode::Asynchronous, generation);
                    st.record_base(snapshot, Vec::new())?;
                    self.stores.insert(store.clone(), Arc::new(Mutex::new(st)));
                    dispatch.push(ApplyTask {
                        store,
                        generation,
                        target: snapshot,
                    });
                }
                PendingTask::Delta { store, src, dst } => {
                    let Some(entry) = self.entry(&store) else {
                        continue;
                    };
                    let mut st = entry.lock();
                    // 已 searchable 或链条断开的任务直接跳过
                    if st.check_next(src, dst).is_err() {
                        continue;
                    }
                    st.record_pending(dst, Vec::new())?;
                    st.set_mode(IndexMode::Asynchronous);
                    dispatch.push(ApplyTask {
                        store,
                        generation: st.generation(),
                        target: dst,
                    });
                }
                PendingTask::Drop { .. } => {}
            }
        }

        report.replayed = dispatch.len();
        {
            let mut p = self.pending.lock();
            *p += dispatch.len();
            if *p == 0 {
                if let Err(e) = wal.checkpoint() {
                    tracing::warn!("Pending log checkpoint failed: {}", e);
                }
            }
        }
        for t in dispatch {
            self.dispatch(t);
        }
        tracing::info!(
            "Recovery complete: stores={} replayed={}",
            report.stores,
            report.replayed
        );
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // 应用
    // ---------------------------------------------------------------------

    /// 登记异步任务：计数 +1 并写 pending log（与 checkpoint 在同一把锁下）
    fn register_pending(&self, task: &PendingTask) {
        let mut p = self.pending.lock();
        *p += 1;
        if let Some(wal) = &self.wal {
            if let Err(e) = wal.append(std::slice::from_ref(task)) {
                tracing::warn!(
                    "Pending log append failed (continuing without durability): {}",
                    e
                );
            }
        }
    }

    fn dispatch(&self, task: ApplyTask) {
        if let Err(e) = self.queue.send(task) {
            let task = e.0;
            self.record_failure(&task, "apply worker unavailable".to_string());
            self.finish_tasks(1);
        }
    }

    /// worker 回调：处理完 n 个任务（无论成功与否）。
    ///
    /// pending log 只在没有失败、也没有停留在 Pending 的快照时 checkpoint，
    /// 否则失败任务的持久记录会被丢掉，重启后无法回放。
    pub(crate) fn finish_tasks(&self, n: usize) {
        // 先扫 store（锁顺序：store mutex 在 pending 之前）
        let settled = self.all_settled();
        {
            let mut p = self.pending.lock();
            *p = p.saturating_sub(n);
            if *p == 0 && settled && self.failures.is_empty() {
                if let Some(wal) = &self.wal {
                    if let Err(e) = wal.checkpoint() {
                        tracing::warn!("Pending log checkpoint failed: {}", e);
                    }
                }
                self.idle.notify_all();
            }
        }
        self.bump_progress();
    }

    /// 所有 store 的已登记快照都已 searchable
    fn all_settled(&self) -> bool {
        let entries: Vec<Arc<Mutex<StoreState>>> =
            self.stores.iter().map(|e| e.value().clone()).collect();
        entries.iter().all(|e| e.lock().unsearchable().is_empty())
    }

    /// worker 回调：记录异步应用失败（快照保持 Pending）
    pub(crate) fn record_failure(&self, task: &ApplyTask, message: String) {
        tracing::warn!(
            "Async apply failed: store={} target={}: {}",
            task.store,
            task.target,
            message
        );
        self.failures.insert(
            task.store.clone(),
            ApplyFailure {
                target: task.target,
                message,
            },
        );
    }

    /// 最近一次异步应用失败
    pub fn last_failure(&self, store: &StoreRef) -> Option<ApplyFailure> {
        self.failures.get(store).map(|f| f.value().clone())
    }

    fn bump_progress(&self) {
        let mut g = self.progress.lock();
        *g = g.wrapping_add(1);
        self.progressed.notify_all();
    }

    /// worker 回调：把 store 推进到 task.target
    pub(crate) fn apply_task(&self, task: &ApplyTask) -> Result<(), IndexError> {
        let _g = self.commit_gate.read();
        let Some(entry) = self.entry(&task.store) else {
            tracing::debug!("Dropping task for deleted store {}", task.store);
            return Ok(());
        };
        let mut st = entry.lock();
        let current = self
            .stores
            .get(&task.store)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &entry));
        if !current || st.generation() != task.generation {
            tracing::debug!(
                "Dropping stale task: store={} generation={}",
                task.store,
                task.generation
            );
            return Ok(());
        }
        self.apply_locked(&mut st, task.target)?;
        self.failures.remove(&task.store);
        Ok(())
    }

    /// 按序应用所有 `<= target` 的 Pending 快照，然后整体 publish
    fn apply_locked(&self, st: &mut StoreState, target: SnapshotId) -> Result<(), IndexError> {
        let store = st.store().clone();
        let todo: Vec<SnapshotId> = st
            .unsearchable()
            .into_iter()
            .filter(|s| *s <= target)
            .collect();
        if todo.is_empty() {
            return Ok(());
        }

        for snap in todo {
            if st.record(snap).map(|r| r.state) != Some(SnapshotState::Pending) {
                continue;
            }
            let (ops, touched) = if st.base() == Some(snap) {
                self.root_ops(&store, snap)?
            } else {
                self.delta_ops(&store, snap.saturating_sub(1), snap)?
            };
            let n = ops.len();
            self.backend.stage(&store, snap, ops)?;
            st.set_touched(snap, touched);
            st.mark_applied(snap)?;
            tracing::debug!("applied: store={} snapshot={} ops={}", store, snap, n);
        }

        self.backend.publish(&store, target)?;
        st.mark_searchable_up_to(target);
        Ok(())
    }

    /// 整树索引：根 + 全部后代
    fn root_ops(
        &self,
        store: &StoreRef,
        snapshot: SnapshotId,
    ) -> Result<(Vec<DocOp>, Vec<String>), IndexError> {
        let root = self
            .content
            .lookup(store, snapshot, "/")?
            .filter(|d| !d.deleted)
            .ok_or_else(|| IndexError::IndexCreation {
                store: store.clone(),
                reason: format!("no root node at snapshot {}", snapshot),
            })?;
        let mut ops = Vec::new();
        let mut touched = Vec::new();
        self.collect_subtree(store, snapshot, root, &mut ops, &mut touched)?;
        Ok((ops, touched))
    }

    fn delta_ops(
        &self,
        store: &StoreRef,
        src: SnapshotId,
        dst: SnapshotId,
    ) -> Result<(Vec<DocOp>, Vec<String>), IndexError> {
        let mut ops = Vec::new();
        let mut touched = Vec::new();
        for diff in self.content.compare(store, src, dst)? {
            match diff.action() {
                ChangeAction::Create { directory } => {
                    let Some(after) = diff.after else { continue };
                    if directory {
                        self.collect_subtree(store, dst, after, &mut ops, &mut touched)?;
                    } else {
                        touched.push(after.path.clone());
                        ops.push(DocOp::Upsert(to_document(store, dst, after)));
                    }
                }
                ChangeAction::Delete => {
                    touched.push(diff.path.clone());
                    ops.push(DocOp::Delete { path: diff.path });
                }
                ChangeAction::Nothing => {}
                ChangeAction::Reindex { .. } => {
                    let Some(after) = diff.after else { continue };
                    touched.push(after.path.clone());
                    ops.push(DocOp::Upsert(to_document(store, dst, after)));
                }
            }
        }
        Ok((ops, touched))
    }

    fn collect_subtree(
        &self,
        store: &StoreRef,
        snapshot: SnapshotId,
        top: NodeDescriptor,
        ops: &mut Vec<DocOp>,
        touched: &mut Vec<String>,
    ) -> Result<(), IndexError> {
        let mut queue = VecDeque::from([top]);
        while let Some(node) = queue.pop_front() {
            if node.is_directory() {
                queue.extend(self.content.children(store, snapshot, &node.path)?);
            }
            touched.push(node.path.clone());
            ops.push(DocOp::Upsert(to_document(store, snapshot, node)));
        }
        Ok(())
    }
}

fn to_document(store: &StoreRef, snapshot: SnapshotId, desc: NodeDescriptor) -> Document {
    let node = NodeRef::new(store.clone(), desc.path.clone());
    let parent = split_path(&desc.path).0.map(|p| ChildAssocRef {
        parent: NodeRef::new(store.clone(), p),
        child: node.clone(),
        qname: desc.qname.clone(),
    });
    Document {
        node,
        qname: desc.qname,
        parent,
        kind: desc.kind,
        snapshot,
        properties: desc.properties,
        content: desc.content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MemoryContentStore, Mutation};
    use crate::index::backend::FIELD_TEXT;
    use crate::index::memory::MemoryBackend;

    const WAIT: Duration = Duration::from_secs(10);

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("snapdex-tracker-{}-{}", tag, nanos))
    }

    fn setup(store: &StoreRef) -> (Arc<MemoryContentStore>, Arc<MemoryBackend>, Arc<IndexTracker>) {
        let content = Arc::new(MemoryContentStore::new());
        content.create_store(store);
        let backend = Arc::new(MemoryBackend::in_memory());
        let tracker = IndexTracker::start(
            content.clone(),
            backend.clone(),
            TrackerOptions {
                worker_threads: 2,
                ..Default::default()
            },
        )
        .unwrap();
        (content, backend, tracker)
    }

    #[test]
    fn synchronous_snapshots_become_searchable_in_order() {
        let s = StoreRef::new("site");
        let (content, backend, tracker) = setup(&s);
        tracker.create_index(&s, IndexMode::Synchronous).unwrap();
        assert_eq!(tracker.last_indexed_snapshot(&s), Some(0));

        let mut prev = 0;
        for i in 0..3 {
            let n = content
                .commit(&s, vec![Mutation::file(&format!("/doc{}.txt", i), "alpha beta")])
                .unwrap();
            tracker.index(&s, prev, n, IndexMode::Synchronous).unwrap();
            assert_eq!(tracker.last_indexed_snapshot(&s), Some(n));
            prev = n;
        }

        for n in 0..=3 {
            assert!(tracker.is_snapshot_searchable(&s, n));
            assert!(tracker.is_snapshot_indexed(&s, n));
        }
        let sr = backend.searcher(&s).unwrap();
        assert_eq!(sr.term_docs(FIELD_TEXT, "alpha").len(), 3);
    }

    #[test]
    fn asynchronous_snapshots_become_searchable_after_worker() {
        let s = StoreRef::new("site");
        let (content, _backend, tracker) = setup(&s);
        tracker.create_index(&s, IndexMode::Asynchronous).unwrap();

        let mut prev = 0;
        for i in 0..5 {
            let n = content
                .commit(&s, vec![Mutation::file(&format!("/f{}", i), "x")])
                .unwrap();
            tracker.index(&s, prev, n, IndexMode::Asynchronous).unwrap();
            prev = n;
        }
        // 异步模式下 last-indexed 是最后登记的快照
        assert_eq!(tracker.last_indexed_snapshot(&s), Some(5));

        assert!(tracker.wait_idle(WAIT));
        for n in 0..=5 {
            assert!(tracker.is_snapshot_searchable(&s, n), "snapshot {}", n);
        }
        assert_eq!(tracker.pending_tasks(), 0);
    }

    #[test]
    fn skipped_snapshot_is_rejected_and_state_unchanged() {
        let s = StoreRef::new("site");
        let (content, _backend, tracker) = setup(&s);
        tracker.create_index(&s, IndexMode::Synchronous).unwrap();
        let n1 = content.commit(&s, vec![Mutation::file("/a", "a")]).unwrap();
        tracker.index(&s, 0, n1, IndexMode::Synchronous).unwrap();
        content.commit(&s, vec![Mutation::file("/b", "b")]).unwrap();
        let n3 = content.commit(&s, vec![Mutation::file("/c", "c")]).unwrap();

        let before = tracker.status();
        let err = tracker
            .index(&s, n1, n3, IndexMode::Synchronous)
            .unwrap_err();
        assert!(matches!(
            err,
            IndexError::OutOfOrderSnapshot { last_known: 1, src: 1, dst: 3, .. }
        ));

        assert_eq!(tracker.last_indexed_snapshot(&s), Some(n1));
        assert!(!tracker.is_snapshot_indexed(&s, n3));
        let after = tracker.status();
        assert_eq!(before[0].last_known, after[0].last_known);
        assert_eq!(before[0].tracked_snapshots, after[0].tracked_snapshots);

        // 正确顺序仍可继续
        tracker.index(&s, n1, n1 + 1, IndexMode::Synchronous).unwrap();
    }

    #[test]
    fn delete_index_forgets_everything() {
        let s = StoreRef::new("site");
        let (content, backend, tracker) = setup(&s);
        tracker.create_index(&s, IndexMode::Synchronous).unwrap();
        let n1 = content.commit(&s, vec![Mutation::file("/a", "a")]).unwrap();
        tracker.index(&s, 0, n1, IndexMode::Synchronous).unwrap();

        tracker.delete_index(&s, IndexMode::Synchronous).unwrap();
        assert!(!tracker.has_index_been_created(&s));
        assert!(!tracker.is_snapshot_indexed(&s, 0));
        assert!(!tracker.is_snapshot_indexed(&s, n1));
        assert!(!tracker.is_snapshot_searchable(&s, n1));
        assert_eq!(tracker.last_indexed_snapshot(&s), None);
        assert!(!backend.has_store(&s));
        assert!(matches!(
            tracker.index(&s, n1, n1 + 1, IndexMode::Synchronous),
            Err(IndexError::NotCreated(_))
        ));
    }

    #[test]
    fn deletion_only_snapshot_counts_as_indexed() {
        let s = StoreRef::new("site");
        let (content, backend, tracker) = setup(&s);
        tracker.create_index(&s, IndexMode::Synchronous).unwrap();
        let n1 = content.commit(&s, vec![Mutation::file("/a", "a")]).unwrap();
        tracker.index(&s, 0, n1, IndexMode::Synchronous).unwrap();
        let n2 = content.commit(&s, vec![Mutation::delete("/a")]).unwrap();
        tracker.index(&s, n1, n2, IndexMode::Synchronous).unwrap();

        assert!(!backend.has_entries_for(&s, n2));
        assert!(tracker.is_snapshot_indexed(&s, n2));
        // n1 的条目后来被删除，同样视为已索引
        assert!(tracker.is_snapshot_indexed(&s, n1));
        // 从未登记的快照不算
        assert!(!tracker.is_snapshot_indexed(&s, n2 + 1));
    }

    #[test]
    fn create_index_requires_resolvable_root() {
        let s = StoreRef::new("site");
        let (_content, _backend, tracker) = setup(&s);
        let missing = StoreRef::new("nowhere");
        assert!(matches!(
            tracker.create_index(&missing, IndexMode::Synchronous),
            Err(IndexError::IndexCreation { .. })
        ));
        assert!(!tracker.has_index_been_created(&missing));

        tracker.create_index(&s, IndexMode::Synchronous).unwrap();
        // 幂等
        tracker.create_index(&s, IndexMode::Synchronous).unwrap();
        assert!(tracker.has_index_been_created(&s));
    }

    #[test]
    fn directory_creation_indexes_subtree() {
        let s = StoreRef::new("site");
        let (content, backend, tracker) = setup(&s);
        tracker.create_index(&s, IndexMode::Synchronous).unwrap();
        let n1 = content
            .commit(&s, vec![Mutation::file("/docs/specs/a.txt", "nested words")])
            .unwrap();
        tracker.index(&s, 0, n1, IndexMode::Synchronous).unwrap();
        // 根 + /docs + /docs/specs + a.txt
        assert_eq!(backend.store_doc_count(&s), 4);
    }

    #[test]
    fn drift_report_flags_entries_removed_behind_the_tracker() {
        let s = StoreRef::new("site");
        let (content, backend, tracker) = setup(&s);
        tracker.create_index(&s, IndexMode::Synchronous).unwrap();
        let n1 = content.commit(&s, vec![Mutation::file("/a", "a")]).unwrap();
        tracker.index(&s, 0, n1, IndexMode::Synchronous).unwrap();
        assert!(tracker.verify(&s).unwrap().is_clean());

        backend
            .stage(&s, n1, vec![DocOp::Delete { path: "/a".into() }])
            .unwrap();
        backend.publish(&s, n1).unwrap();

        let report = tracker.verify(&s).unwrap();
        assert_eq!(report.missing_entries, vec![n1]);
        assert!(!report.is_clean());
    }

    #[test]
    fn wait_until_searchable_times_out_for_unknown_snapshot() {
        let s = StoreRef::new("site");
        let (_content, _backend, tracker) = setup(&s);
        tracker.create_index(&s, IndexMode::Synchronous).unwrap();
        assert!(tracker.wait_until_searchable(&s, 0, Duration::from_millis(10)));
        assert!(!tracker.wait_until_searchable(&s, 9, Duration::from_millis(20)));
    }

    #[test]
    fn pending_log_replays_after_restart() {
        let root = unique_tmp_dir("replay");
        let wal_dir = root.join("pending");
        let s = StoreRef::new("site");
        let content = Arc::new(MemoryContentStore::new());
        content.create_store(&s);
        let opts = TrackerOptions {
            pending_log_dir: Some(wal_dir.clone()),
            worker_threads: 1,
            ..Default::default()
        };

        let n1 = content.commit(&s, vec![Mutation::file("/a", "first")]).unwrap();
        {
            let backend = Arc::new(MemoryBackend::open(root.clone()).unwrap());
            let tracker = IndexTracker::start(content.clone(), backend, opts.clone()).unwrap();
            tracker.create_index(&s, IndexMode::Synchronous).unwrap();
            assert_eq!(tracker.last_indexed_snapshot(&s), Some(n1));
        }

        // 模拟崩溃前已登记但尚未应用的异步任务
        let n2 = content.commit(&s, vec![Mutation::file("/b", "second")]).unwrap();
        WalStore::open_in_dir(wal_dir.clone())
            .unwrap()
            .append(&[PendingTask::Delta { store: s.clone(), src: n1, dst: n2 }])
            .unwrap();

        let backend = Arc::new(MemoryBackend::open(root.clone()).unwrap());
        let tracker = IndexTracker::start(content.clone(), backend.clone(), opts).unwrap();
        let report = tracker.recover().unwrap();
        assert_eq!(report.stores, 1);
        assert_eq!(report.replayed, 1);

        assert!(tracker.wait_until_searchable(&s, n2, WAIT));
        assert_eq!(backend.searcher(&s).unwrap().term_docs(FIELD_TEXT, "second").len(), 1);
        assert!(tracker.wait_idle(WAIT));
        // checkpoint 之后 pending log 为空
        let left = WalStore::open_in_dir(wal_dir).unwrap().replay_since_seal(0).unwrap();
        assert!(left.tasks.is_empty());
    }

    #[test]
    fn dropped_store_tasks_are_not_replayed() {
        let root = unique_tmp_dir("drop");
        let wal_dir = root.join("pending");
        let s = StoreRef::new("gone");
        let content = Arc::new(MemoryContentStore::new());
        content.create_store(&s);

        let wal = WalStore::open_in_dir(wal_dir.clone()).unwrap();
        wal.append(&[
            PendingTask::Root { store: s.clone(), snapshot: 0 },
            PendingTask::Drop { store: s.clone() },
        ])
        .unwrap();
        drop(wal);

        let backend = Arc::new(MemoryBackend::open(root).unwrap());
        let tracker = IndexTracker::start(
            content,
            backend,
            TrackerOptions {
                pending_log_dir: Some(wal_dir),
                ..Default::default()
            },
        )
        .unwrap();
        let report = tracker.recover().unwrap();
        assert_eq!(report.replayed, 0);
        assert!(!tracker.has_index_been_created(&s));
    }

    #[test]
    fn lost_entries_do_not_count_as_indexed() {
        let s = StoreRef::new("site");
        let (content, backend, tracker) = setup(&s);
        tracker.create_index(&s, IndexMode::Synchronous).unwrap();
        let n1 = content.commit(&s, vec![Mutation::file("/a", "a")]).unwrap();
        tracker.index(&s, 0, n1, IndexMode::Synchronous).unwrap();
        assert!(tracker.is_snapshot_indexed(&s, n1));

        // 条目在 tracker 之外丢失，内容里 /a 仍然存活
        backend
            .stage(&s, n1, vec![DocOp::Delete { path: "/a".into() }])
            .unwrap();
        backend.publish(&s, n1).unwrap();

        assert!(!tracker.is_snapshot_indexed(&s, n1));
        assert_eq!(tracker.verify(&s).unwrap().missing_entries, vec![n1]);
    }

    #[test]
    fn failed_async_apply_keeps_pending_log_record() {
        let root = unique_tmp_dir("failed");
        let wal_dir = root.join("pending");
        let s = StoreRef::new("site");
        let content = Arc::new(MemoryContentStore::new());
        content.create_store(&s);
        let backend = Arc::new(MemoryBackend::in_memory());
        let tracker = IndexTracker::start(
            content.clone(),
            backend,
            TrackerOptions {
                pending_log_dir: Some(wal_dir.clone()),
                worker_threads: 1,
                ..Default::default()
            },
        )
        .unwrap();
        tracker.create_index(&s, IndexMode::Synchronous).unwrap();

        // 快照 1 在内容存储中还不存在，worker 应用失败
        tracker.index(&s, 0, 1, IndexMode::Asynchronous).unwrap();
        assert!(tracker.wait_idle(WAIT));
        assert!(!tracker.is_snapshot_searchable(&s, 1));

        let failure = tracker.last_failure(&s).unwrap();
        assert_eq!(failure.target, 1);
        let status = tracker.status();
        assert_eq!(status[0].unsearchable, 1);
        assert_eq!(status[0].last_failure.as_ref().map(|f| f.target), Some(1));
        let report = tracker.verify(&s).unwrap();
        assert_eq!(report.unsearchable, vec![1]);
        assert!(!report.is_clean());

        let logged = WalStore::open_in_dir(wal_dir.clone())
            .unwrap()
            .replay_since_seal(0)
            .unwrap();
        assert!(logged
            .tasks
            .contains(&PendingTask::Delta { store: s.clone(), src: 0, dst: 1 }));

        // 内容补齐后，下一个任务连同滞留的快照一起应用
        content.commit(&s, vec![Mutation::file("/a", "late")]).unwrap();
        let n2 = content.commit(&s, vec![Mutation::file("/b", "later")]).unwrap();
        tracker.index(&s, 1, n2, IndexMode::Asynchronous).unwrap();
        assert!(tracker.wait_until_searchable(&s, n2, WAIT));
        assert!(tracker.wait_idle(WAIT));
        assert!(tracker.is_snapshot_searchable(&s, 1));
        assert_eq!(tracker.last_failure(&s), None);
        assert!(tracker.verify(&s).unwrap().is_clean());

        let left = WalStore::open_in_dir(wal_dir).unwrap().replay_since_seal(0).unwrap();
        assert!(left.tasks.is_empty());
    }
}
