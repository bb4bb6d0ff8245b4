use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::core::StoreRef;
use crate::error::QueryError;
use crate::index::backend::{Document, IndexBackend, IndexSearcher};
use crate::query::paging::{select_window, PageBudget, PagedResultSet};
use crate::query::params::{QueryOptions, SearchParameters, SortBy, SortDefinition};
use crate::query::result::{document_value, Hit, HitResultSet, ResultSet};

/// 查询语言：按名字注册，`execute` 返回惰性结果集
pub trait QueryLanguage: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, params: &SearchParameters) -> Result<Box<dyn ResultSet>, QueryError>;
}

/// 结果的权限过滤
pub trait AccessFilter: Send + Sync {
    fn allows(&self, doc: &Document) -> bool;
}

/// 默认：全部可见
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl AccessFilter for AllowAll {
    fn allows(&self, _doc: &Document) -> bool {
        true
    }
}

impl<F> AccessFilter for F
where
    F: Fn(&Document) -> bool + Send + Sync,
{
    fn allows(&self, doc: &Document) -> bool {
        self(doc)
    }
}

/// 原生 handler 共享的执行环境：后端 + 权限过滤
#[derive(Clone)]
pub struct IndexContext {
    backend: Arc<dyn IndexBackend>,
    access: Arc<dyn AccessFilter>,
}

impl IndexContext {
    pub fn new(backend: Arc<dyn IndexBackend>) -> Self {
        Self {
            backend,
            access: Arc::new(AllowAll),
        }
    }

    pub fn with_access_filter(mut self, access: Arc<dyn AccessFilter>) -> Self {
        self.access = access;
        self
    }

    pub fn backend(&self) -> &Arc<dyn IndexBackend> {
        &self.backend
    }

    /// 解析查询涉及的 searcher（每个 store 一个可见视图）
    pub fn searchers(
        &self,
        language: &str,
        stores: &[StoreRef],
    ) -> Result<Vec<Arc<dyn IndexSearcher>>, QueryError> {
        if stores.is_empty() {
            return Err(QueryError::execution(language, "no store specified"));
        }
        stores
            .iter()
            .map(|s| {
                self.backend
                    .searcher(s)
                    .ok_or_else(|| QueryError::StoreNotIndexed {
                        language: language.to_string(),
                        store: s.clone(),
                    })
            })
            .collect()
    }

    /// 排序 → 权限过滤（带预算）→ 分页
    pub fn finish(
        &self,
        searchers: Vec<Arc<dyn IndexSearcher>>,
        mut hits: Vec<Hit>,
        opts: &QueryOptions,
        columns: Option<Vec<String>>,
        started: Instant,
    ) -> Box<dyn ResultSet> {
        sort_hits(&searchers, &mut hits, &opts.sort);
        let total = hits.len();

        let budget = PageBudget {
            skip: opts.skip,
            max_items: opts.max_items,
            max_permission_checks: opts.max_permission_checks,
            max_permission_check_time: opts.max_permission_check_time,
        };
        let access = self.access.clone();
        let selection = select_window(hits, &budget, |h| {
            searchers
                .get(h.source)
                .and_then(|s| s.document(h.doc))
                .is_some_and(|d| access.allows(&d))
        });
        tracing::debug!(
            "query window: matched={} checked={} accepted={} reason={:?}",
            total,
            selection.checks,
            selection.accepted.len(),
            selection.reason
        );

        let inner = HitResultSet::new(
            searchers,
            selection.accepted,
            columns,
            Some(started.elapsed()),
        );
        Box::new(PagedResultSet::new(
            Box::new(inner),
            opts.skip,
            opts.max_items,
            total,
            selection.reason,
        ))
    }
}

/// 无排序定义时按分数降序、文档序升序
fn sort_hits(searchers: &[Arc<dyn IndexSearcher>], hits: &mut [Hit], sort: &[SortDefinition]) {
    if sort.is_empty() {
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then((a.source, a.doc).cmp(&(b.source, b.doc)))
        });
        return;
    }

    // 字段排序需要文档值：先取一次缓存
    let mut keys: HashMap<(usize, u32), Vec<Option<String>>> = HashMap::new();
    for h in hits.iter() {
        let doc = searchers.get(h.source).and_then(|s| s.document(h.doc));
        let vals = sort
            .iter()
            .map(|d| match (&d.by, &doc) {
                (SortBy::Field(f), Some(doc)) => document_value(doc, f).map(|v| match v {
                    serde_json::Value::String(s) => s.to_lowercase(),
                    other => other.to_string(),
                }),
                _ => None,
            })
            .collect();
        keys.insert((h.source, h.doc), vals);
    }

    hits.sort_by(|a, b| {
        for (i, d) in sort.iter().enumerate() {
            let ord = match &d.by {
                SortBy::Score => a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal),
                SortBy::Document => (a.source, a.doc).cmp(&(b.source, b.doc)),
                SortBy::Field(_) => {
                    let ka = keys.get(&(a.source, a.doc)).and_then(|v| v[i].as_ref());
                    let kb = keys.get(&(b.source, b.doc)).and_then(|v| v[i].as_ref());
                    compare_keys(ka, kb)
                }
            };
            let ord = if d.ascending { ord } else { ord.reverse() };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// 数值优先按数值比较；缺值排在最前
fn compare_keys(a: Option<&String>, b: Option<&String>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => match (a.parse::<f64>(), b.parse::<f64>()) {
            (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.cmp(b),
        },
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
