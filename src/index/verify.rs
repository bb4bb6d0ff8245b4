use serde::Serialize;

use crate::core::{ContentSource, SnapshotId, StoreRef};
use crate::index::backend::IndexBackend;
use crate::index::state::StoreState;

/// 快照是否已在后端落地：
/// 有该快照写入的条目，或者它触及的每条路径都已被更新的快照覆盖，
/// 或在 `live_at` 版本的内容中确实已删除（纯删除的快照不会留下任何条目）。
/// 后端无条目但内容里仍存活的路径算丢失。
pub(crate) fn entries_account_for(
    backend: &dyn IndexBackend,
    content: &dyn ContentSource,
    store: &StoreRef,
    snapshot: SnapshotId,
    live_at: SnapshotId,
    touched: &[String],
) -> bool {
    if backend.has_entries_for(store, snapshot) {
        return true;
    }
    touched.iter().all(|p| match backend.entry_snapshot(store, p) {
        Some(s) => s > snapshot,
        None => match content.lookup(store, live_at, p) {
            Ok(None) => true,
            Ok(Some(d)) => d.deleted,
            Err(_) => false,
        },
    })
}

/// 异步应用失败：快照停留在 Pending，pending log 中的任务保留到下次成功或重启回放
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApplyFailure {
    pub target: SnapshotId,
    pub message: String,
}

/// 状态机声明与后端实际内容之间的偏差
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub store: String,
    pub state_searchable: Option<SnapshotId>,
    pub backend_searchable: Option<SnapshotId>,
    pub state_applied: Option<SnapshotId>,
    pub backend_applied: Option<SnapshotId>,
    /// 声明已 applied，但应存在的条目在后端缺失
    pub missing_entries: Vec<SnapshotId>,
    /// 已登记但尚未 searchable 的快照
    pub unsearchable: Vec<SnapshotId>,
    pub last_failure: Option<ApplyFailure>,
}

impl DriftReport {
    pub fn backend_ahead(&self) -> bool {
        match (self.backend_searchable, self.state_searchable) {
            (Some(b), Some(s)) => b > s,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn backend_behind(&self) -> bool {
        match (self.backend_searchable, self.state_searchable) {
            (Some(b), Some(s)) => b < s,
            (None, Some(_)) => true,
            _ => false,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.missing_entries.is_empty()
            && self.last_failure.is_none()
            && !self.backend_ahead()
            && !self.backend_behind()
    }
}

/// 只读核对：对每个已 applied 的快照，
/// 它触及且在最新 searchable 内容中仍然存活的路径必须在后端有条目。
pub(crate) fn check_store(
    state: &StoreState,
    backend: &dyn IndexBackend,
    content: &dyn ContentSource,
    last_failure: Option<ApplyFailure>,
) -> DriftReport {
    let store = state.store();
    let state_searchable = state.last_searchable();
    let mut missing = Vec::new();

    if let Some(head) = state_searchable {
        for (id, rec) in state.records() {
            if id > head || !rec.state.is_applied() {
                continue;
            }
            let lost = rec.touched.iter().any(|p| {
                let live = matches!(
                    content.lookup(store, head, p),
                    Ok(Some(ref d)) if !d.deleted
                );
                live && backend.entry_snapshot(store, p).is_none()
            });
            if lost {
                missing.push(id);
            }
        }
    }

    DriftReport {
        store: store.to_string(),
        state_searchable,
        backend_searchable: backend.searchable_snapshot(store),
        state_applied: state.last_applied(),
        backend_applied: backend.applied_snapshot(store),
        missing_entries: missing,
        unsearchable: state.unsearchable(),
        last_failure,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ahead_and_behind_are_exclusive() {
        let mut r = DriftReport {
            state_searchable: Some(3),
            backend_searchable: Some(3),
            ..Default::default()
        };
        assert!(r.is_clean());
        r.backend_searchable = Some(4);
        assert!(r.backend_ahead() && !r.backend_behind());
        r.backend_searchable = None;
        assert!(r.backend_behind());
        assert!(!r.is_clean());
    }

    #[test]
    fn apply_failure_is_drift() {
        let mut r = DriftReport {
            state_searchable: Some(1),
            backend_searchable: Some(1),
            unsearchable: vec![2],
            ..Default::default()
        };
        assert!(r.is_clean());
        r.last_failure = Some(ApplyFailure {
            target: 2,
            message: "unknown snapshot".into(),
        });
        assert!(!r.is_clean());
    }
}
