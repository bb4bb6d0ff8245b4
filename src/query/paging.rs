use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ResultSetError;
use crate::query::result::{check_bounds, LimitReason, ResultRow, ResultSet};

/// 任意 ResultSet 上的窗口：`len()` 是实际物化的页大小，`total()` 是逻辑总数。
pub struct PagedResultSet {
    inner: Box<dyn ResultSet>,
    start: usize,
    len: usize,
    total: usize,
    reason: LimitReason,
}

impl PagedResultSet {
    /// 窗口 `[start, start + max)`，超出 inner 的部分自动截断
    pub fn new(
        inner: Box<dyn ResultSet>,
        start: usize,
        max: Option<usize>,
        total: usize,
        reason: LimitReason,
    ) -> Self {
        let available = inner.len().saturating_sub(start);
        let len = max.map_or(available, |m| m.min(available));
        Self {
            inner,
            start,
            len,
            total: total.max(start + len),
            reason,
        }
    }

    pub fn into_inner(self) -> Box<dyn ResultSet> {
        self.inner
    }
}

impl ResultSet for PagedResultSet {
    fn len(&self) -> usize {
        self.len
    }

    fn row(&self, index: usize) -> Result<Arc<ResultRow>, ResultSetError> {
        check_bounds(index, self.len)?;
        self.inner.row(self.start + index)
    }

    fn total(&self) -> usize {
        self.total
    }

    fn start(&self) -> usize {
        self.start
    }

    fn limit_reason(&self) -> LimitReason {
        self.reason
    }

    fn query_time(&self) -> Option<Duration> {
        self.inner.query_time()
    }

    fn number_found(&self) -> Option<u64> {
        Some(self.total as u64)
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// 权限过滤预算
#[derive(Clone, Debug, Default)]
pub struct PageBudget {
    pub skip: usize,
    pub max_items: Option<usize>,
    pub max_permission_checks: Option<usize>,
    pub max_permission_check_time: Option<Duration>,
}

/// 窗口选择的结果：`accepted` 包含被跳过的前 `skip` 条
#[derive(Clone, Debug, PartialEq)]
pub struct Selection<T> {
    pub accepted: Vec<T>,
    pub checks: usize,
    pub reason: LimitReason,
}

/// 按顺序逐条做权限检查，直到凑满 skip + max 或预算耗尽。
/// 预算是软限制：耗尽时返回已有结果并记录原因。
pub fn select_window<T, F>(candidates: Vec<T>, budget: &PageBudget, mut allowed: F) -> Selection<T>
where
    F: FnMut(&T) -> bool,
{
    let started = Instant::now();
    let want = budget.max_items.map(|m| budget.skip.saturating_add(m));
    let mut accepted = Vec::new();
    let mut checks = 0usize;
    let mut reason = LimitReason::Unlimited;

    let mut it = candidates.into_iter().peekable();
    while it.peek().is_some() {
        if want.is_some_and(|w| accepted.len() >= w) {
            reason = LimitReason::MaxItems;
            break;
        }
        if budget.max_permission_checks.is_some_and(|m| checks >= m) {
            reason = LimitReason::PermissionChecks;
            break;
        }
        if budget
            .max_permission_check_time
            .is_some_and(|t| started.elapsed() >= t)
        {
            reason = LimitReason::PermissionCheckTime;
            break;
        }
        let Some(c) = it.next() else { break };
        checks += 1;
        if allowed(&c) {
            accepted.push(c);
        }
    }

    Selection {
        accepted,
        checks,
        reason,
    }
}
