use std::collections::BTreeMap;
use std::sync::Weak;

use crossbeam::channel::Receiver;
use rayon::prelude::*;

use crate::core::{SnapshotId, StoreRef};
use crate::index::tracker::IndexTracker;

/// 异步应用任务：把 store 推进到 `target`（含之前所有 Pending 快照）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyTask {
    pub store: StoreRef,
    pub generation: u64,
    pub target: SnapshotId,
}

/// 同一批次内按 (store, generation) 合并，只保留最大的 target
pub(crate) fn coalesce(batch: &[ApplyTask]) -> Vec<ApplyTask> {
    let mut groups: BTreeMap<(StoreRef, u64), SnapshotId> = BTreeMap::new();
    for t in batch {
        let e = groups
            .entry((t.store.clone(), t.generation))
            .or_insert(t.target);
        if t.target > *e {
            *e = t.target;
        }
    }
    groups
        .into_iter()
        .map(|((store, generation), target)| ApplyTask {
            store,
            generation,
            target,
        })
        .collect()
}

/// 后台应用线程：
/// - 一次取空队列（背压由 bounded channel 提供）
/// - 按 store 合并后用 rayon 并行应用，不同 store 互不阻塞
/// - tracker 被释放（sender 断开）时退出
pub struct ApplyWorker;

impl ApplyWorker {
    pub(crate) fn spawn(
        tracker: Weak<IndexTracker>,
        rx: Receiver<ApplyTask>,
        threads: usize,
    ) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name("snapdex-apply".into())
            .spawn(move || {
                let pool = match rayon::ThreadPoolBuilder::new()
                    .num_threads(threads.max(1))
                    .thread_name(|i| format!("snapdex-apply-{}", i))
                    .build()
                {
                    Ok(p) => Some(p),
                    Err(e) => {
                        tracing::warn!("Apply pool init failed, using global pool: {}", e);
                        None
                    }
                };

                while let Ok(first) = rx.recv() {
                    let mut batch = vec![first];
                    batch.extend(rx.try_iter());

                    let Some(tracker) = tracker.upgrade() else {
                        break;
                    };

                    let groups = coalesce(&batch);
                    tracing::debug!(
                        "apply batch: tasks={} stores={}",
                        batch.len(),
                        groups.len()
                    );
                    let run = || {
                        groups.par_iter().for_each(|t| {
                            if let Err(e) = tracker.apply_task(t) {
                                tracker.record_failure(t, e.to_string());
                            }
                        })
                    };
                    match &pool {
                        Some(p) => p.install(run),
                        None => run(),
                    }
                    tracker.finish_tasks(batch.len());
                }
                tracing::debug!("apply worker exiting");
            })
    }
}
