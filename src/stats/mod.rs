use std::fmt;
use std::path::Path;

use crate::index::{IndexTracker, StoreStatus};

/// 索引运行状态汇总（`--report` 输出）
#[derive(Clone, Debug, Default)]
pub struct IndexReport {
    pub stores: Vec<StoreStatus>,
    /// 所有 store 的可见文档总数
    pub total_docs: u64,
    /// 尚未被 worker 处理完的异步任务
    pub pending_tasks: usize,
    /// 落盘目录总大小；纯内存索引为 None
    pub disk_bytes: Option<u64>,
    /// 进程级 RSS（从 /proc/self/statm 读取）
    pub process_rss_bytes: u64,
}

impl IndexReport {
    pub fn collect(tracker: &IndexTracker) -> Self {
        let mut stores = tracker.status();
        stores.sort_by(|a, b| a.store.cmp(&b.store));
        Self {
            stores,
            total_docs: tracker.indexed_doc_count(),
            pending_tasks: tracker.pending_tasks(),
            disk_bytes: tracker.backend().root_dir().map(|r| dir_size(&r)),
            process_rss_bytes: Self::read_process_rss(),
        }
    }

    /// 从 /proc/self/statm 读取进程 RSS
    pub fn read_process_rss() -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                // statm 格式: size resident shared text lib data dt (单位: 页)
                let parts: Vec<&str> = s.split_whitespace().collect();
                parts.get(1)?.parse::<u64>().ok()
            })
            .map(|pages| pages * 4096)
            .unwrap_or(0)
    }
}

fn dir_size(root: &Path) -> u64 {
    ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .build()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_some_and(|t| t.is_file()))
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn snap(s: Option<u64>) -> String {
    s.map_or_else(|| "-".to_string(), |n| n.to_string())
}

impl fmt::Display for IndexReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           snapdex Index Report                   ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(
            f,
            "║ Process RSS: {:>35} ║",
            human_bytes(self.process_rss_bytes)
        )?;
        writeln!(
            f,
            "║ On disk:     {:>35} ║",
            self.disk_bytes.map_or_else(|| "in memory".to_string(), human_bytes)
        )?;
        writeln!(f, "║ Documents:   {:>35} ║", self.total_docs)?;
        writeln!(f, "║ Pending:     {:>35} ║", self.pending_tasks)?;
        for s in &self.stores {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ Store {:<30} ({:>12}) ║", s.store, s.mode.to_string())?;
            writeln!(
                f,
                "║   known/applied/searchable: {:>6} {:>6} {:>6}   ║",
                snap(s.last_known),
                snap(s.last_applied),
                snap(s.last_searchable)
            )?;
            writeln!(
                f,
                "║   tracked:      {:>10}  docs: {:>10}     ║",
                s.tracked_snapshots, s.docs
            )?;
            if let Some(fail) = &s.last_failure {
                writeln!(
                    f,
                    "║   failed at {:<6} ({} unsearchable){:>17} ║",
                    fail.target, s.unsearchable, ""
                )?;
            }
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IndexMode;
    use crate::index::ApplyFailure;

    #[test]
    fn report_renders_every_store() {
        let report = IndexReport {
            stores: vec![StoreStatus {
                store: "site".into(),
                mode: IndexMode::Asynchronous,
                last_known: Some(4),
                last_applied: Some(3),
                last_searchable: None,
                tracked_snapshots: 5,
                unsearchable: 1,
                docs: 12,
                last_failure: Some(ApplyFailure {
                    target: 4,
                    message: "unknown snapshot".into(),
                }),
            }],
            total_docs: 12,
            pending_tasks: 1,
            disk_bytes: Some(2048),
            process_rss_bytes: 0,
        };
        let text = report.to_string();
        assert!(text.contains("Store site"));
        assert!(text.contains("2.00 KB"));
        assert!(text.contains("-"));
        assert!(text.contains("failed at 4"));
        assert_eq!(human_bytes(512), "512 B");
    }
}
