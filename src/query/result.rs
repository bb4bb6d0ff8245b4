use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::core::{ChildAssocRef, NodeKind, NodeRef, QName};
use crate::error::ResultSetError;
use crate::index::backend::{DocId, Document, IndexSearcher};

/// 结果被截断的原因
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    #[default]
    Unlimited,
    MaxItems,
    PermissionChecks,
    PermissionCheckTime,
}

/// 一行结果（首次访问时物化，之后不变）
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultRow {
    /// 在完整结果中的位置
    pub index: usize,
    pub node: Option<NodeRef>,
    pub score: f32,
    pub qname: Option<QName>,
    pub parent: Option<ChildAssocRef>,
    pub values: BTreeMap<String, Value>,
}

impl ResultRow {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn node_ref(&self) -> Option<&NodeRef> {
        self.node.as_ref()
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    pub fn qualified_name(&self) -> Option<&QName> {
        self.qname.as_ref()
    }

    pub fn child_assoc_ref(&self) -> Option<&ChildAssocRef> {
        self.parent.as_ref()
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// 多 selector 投影不支持
    pub fn node_ref_for_selector(&self, _selector: &str) -> Result<NodeRef, ResultSetError> {
        Err(ResultSetError::UnsupportedProjection("node reference by selector"))
    }

    pub fn node_refs(&self) -> Result<BTreeMap<String, NodeRef>, ResultSetError> {
        Err(ResultSetError::UnsupportedProjection("node references by selector"))
    }

    pub fn score_for_selector(&self, _selector: &str) -> Result<f32, ResultSetError> {
        Err(ResultSetError::UnsupportedProjection("score by selector"))
    }

    pub fn scores(&self) -> Result<BTreeMap<String, f32>, ResultSetError> {
        Err(ResultSetError::UnsupportedProjection("scores by selector"))
    }

    pub fn from_document(index: usize, doc: &Document, score: f32, columns: Option<&[String]>) -> Self {
        let values = match columns {
            Some(cols) => cols
                .iter()
                .map(|c| (c.clone(), document_value(doc, c).unwrap_or(Value::Null)))
                .collect(),
            None => default_values(doc),
        };
        Self {
            index,
            node: Some(doc.node.clone()),
            score,
            qname: Some(doc.qname.clone()),
            parent: doc.parent.clone(),
            values,
        }
    }
}

fn default_values(doc: &Document) -> BTreeMap<String, Value> {
    let mut m: BTreeMap<String, Value> = doc
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    m.insert("cm:name".into(), Value::String(doc.qname.local.clone()));
    m.insert("cmis:path".into(), Value::String(doc.node.path.clone()));
    m
}

/// 列值：cmis 内置列映射到文档元数据，其余按属性名查找
pub fn document_value(doc: &Document, column: &str) -> Option<Value> {
    match column {
        "cmis:name" | "cm:name" => Some(Value::String(doc.qname.local.clone())),
        "cmis:objectId" => Some(Value::String(doc.node.to_string())),
        "cmis:path" => Some(Value::String(doc.node.path.clone())),
        "cmis:parentId" => doc
            .parent
            .as_ref()
            .map(|p| Value::String(p.parent.to_string())),
        "cmis:objectTypeId" | "cmis:baseTypeId" => Some(Value::String(
            match doc.kind {
                NodeKind::File => "cmis:document",
                NodeKind::Directory => "cmis:folder",
            }
            .to_string(),
        )),
        "cmis:contentStreamLength" => doc
            .content
            .as_ref()
            .map(|c| Value::from(c.chars().count() as u64)),
        "cmis:changeToken" => Some(Value::from(doc.snapshot)),
        other => doc.properties.get(other).map(|v| v.to_json()),
    }
}

/// 结果集：不可变、只读、可多次从头遍历
pub trait ResultSet: Send + Sync {
    /// 已物化页的长度（可能小于 total）
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn row(&self, index: usize) -> Result<Arc<ResultRow>, ResultSetError>;

    /// 逻辑总数
    fn total(&self) -> usize {
        self.len()
    }

    fn start(&self) -> usize {
        0
    }

    fn limit_reason(&self) -> LimitReason {
        LimitReason::Unlimited
    }

    fn query_time(&self) -> Option<Duration> {
        None
    }

    fn number_found(&self) -> Option<u64> {
        None
    }

    /// 幂等
    fn close(&self);

    fn is_closed(&self) -> bool;
}

impl<'a> dyn ResultSet + 'a {
    pub fn cursor(&self) -> RowCursor<'_> {
        RowCursor::new(self)
    }

    /// 从末尾开始的游标（用于反向遍历）
    pub fn cursor_at_end(&self) -> RowCursor<'_> {
        RowCursor::at_end(self)
    }
}

pub(crate) fn check_bounds(index: usize, len: usize) -> Result<(), ResultSetError> {
    if index >= len {
        return Err(ResultSetError::IndexOutOfRange { index, len });
    }
    Ok(())
}

/// 双向游标；位置在两行之间。结果集只读，所有修改操作都直接失败。
pub struct RowCursor<'a> {
    set: &'a dyn ResultSet,
    position: usize,
}

impl<'a> RowCursor<'a> {
    pub fn new(set: &'a dyn ResultSet) -> Self {
        Self { set, position: 0 }
    }

    pub fn at_end(set: &'a dyn ResultSet) -> Self {
        Self {
            set,
            position: set.len(),
        }
    }

    pub fn has_next(&self) -> bool {
        self.position < self.set.len()
    }

    pub fn has_previous(&self) -> bool {
        self.position > 0
    }

    pub fn next_index(&self) -> usize {
        self.position
    }

    pub fn previous_index(&self) -> Option<usize> {
        self.position.checked_sub(1)
    }

    pub fn previous(&mut self) -> Option<Result<Arc<ResultRow>, ResultSetError>> {
        if !self.has_previous() {
            return None;
        }
        self.position -= 1;
        Some(self.set.row(self.position))
    }

    pub fn remove(&mut self) -> Result<(), ResultSetError> {
        Err(ResultSetError::ReadOnly("remove"))
    }

    pub fn set(&mut self, _row: ResultRow) -> Result<(), ResultSetError> {
        Err(ResultSetError::ReadOnly("set"))
    }

    pub fn insert(&mut self, _row: ResultRow) -> Result<(), ResultSetError> {
        Err(ResultSetError::ReadOnly("insert"))
    }
}

impl Iterator for RowCursor<'_> {
    type Item = Result<Arc<ResultRow>, ResultSetError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        let row = self.set.row(self.position);
        self.position += 1;
        Some(row)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.set.len().saturating_sub(self.position);
        (left, Some(left))
    }
}

/// 命中：searcher 下标 + 文档号（行只持有 key，不持有文档）
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Hit {
    pub source: usize,
    pub doc: DocId,
    pub score: f32,
}

/// 原生索引命中结果（FTS / SQL 共用，SQL 带列投影）
pub struct HitResultSet {
    searchers: Mutex<Option<Vec<Arc<dyn IndexSearcher>>>>,
    hits: Vec<Hit>,
    rows: Vec<OnceLock<Arc<ResultRow>>>,
    columns: Option<Vec<String>>,
    query_time: Option<Duration>,
}

impl HitResultSet {
    pub fn new(
        searchers: Vec<Arc<dyn IndexSearcher>>,
        hits: Vec<Hit>,
        columns: Option<Vec<String>>,
        query_time: Option<Duration>,
    ) -> Self {
        let rows = (0..hits.len()).map(|_| OnceLock::new()).collect();
        Self {
            searchers: Mutex::new(Some(searchers)),
            hits,
            rows,
            columns,
            query_time,
        }
    }

    pub fn hits(&self) -> &[Hit] {
        &self.hits
    }

    fn materialize(&self, index: usize) -> Result<Arc<ResultRow>, ResultSetError> {
        let hit = self.hits[index];
        let doc = {
            let g = self.searchers.lock();
            let searchers = g.as_ref().ok_or(ResultSetError::Closed)?;
            searchers
                .get(hit.source)
                .and_then(|s| s.document(hit.doc))
        };
        let row = match doc {
            Some(d) => ResultRow::from_document(index, &d, hit.score, self.columns.as_deref()),
            None => ResultRow {
                index,
                node: None,
                score: hit.score,
                qname: None,
                parent: None,
                values: BTreeMap::new(),
            },
        };
        Ok(Arc::new(row))
    }
}

impl ResultSet for HitResultSet {
    fn len(&self) -> usize {
        self.hits.len()
    }

    fn row(&self, index: usize) -> Result<Arc<ResultRow>, ResultSetError> {
        check_bounds(index, self.hits.len())?;
        if let Some(r) = self.rows[index].get() {
            return Ok(r.clone());
        }
        let row = self.materialize(index)?;
        // 并发物化时以先写入者为准
        Ok(self.rows[index].get_or_init(|| row).clone())
    }

    fn query_time(&self) -> Option<Duration> {
        self.query_time
    }

    fn number_found(&self) -> Option<u64> {
        Some(self.hits.len() as u64)
    }

    fn close(&self) {
        if self.searchers.lock().take().is_some() {
            tracing::trace!("hit result set closed ({} rows)", self.hits.len());
        }
    }

    fn is_closed(&self) -> bool {
        self.searchers.lock().is_none()
    }
}

impl Drop for HitResultSet {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Properties, PropertyValue, StoreRef};
    use crate::index::backend::{DocOp, IndexBackend};
    use crate::index::memory::MemoryBackend;

    fn doc(store: &StoreRef, path: &str, title: &str) -> Document {
        let mut properties = Properties::new();
        properties.insert("cm:title".into(), PropertyValue::Text(title.into()));
        Document {
            node: NodeRef::new(store.clone(), path),
            qname: QName::content(path.trim_start_matches('/')),
            parent: None,
            kind: NodeKind::File,
            snapshot: 1,
            properties,
            content: None,
        }
    }

    fn fixture(n: usize) -> (MemoryBackend, StoreRef, HitResultSet) {
        let b = MemoryBackend::in_memory();
        let s = StoreRef::new("s");
        b.create_store(&s).unwrap();
        let ops = (0..n)
            .map(|i| DocOp::Upsert(doc(&s, &format!("/d{}", i), &format!("title {}", i))))
            .collect();
        b.stage(&s, 1, ops).unwrap();
        b.publish(&s, 1).unwrap();
        let sr = b.searcher(&s).unwrap();
        let hits = sr
            .all_docs()
            .iter()
            .map(|doc| Hit { source: 0, doc, score: 1.0 })
            .collect();
        let rs = HitResultSet::new(vec![sr], hits, None, None);
        (b, s, rs)
    }

    #[test]
    fn out_of_range_row_is_an_error() {
        let (_b, _s, rs) = fixture(2);
        assert!(rs.row(1).is_ok());
        assert_eq!(
            rs.row(2).unwrap_err(),
            ResultSetError::IndexOutOfRange { index: 2, len: 2 }
        );
    }

    #[test]
    fn forward_and_backward_iteration_are_symmetric() {
        let (_b, _s, rs) = fixture(5);
        let set: &dyn ResultSet = &rs;

        let forward: Vec<usize> = set.cursor().map(|r| r.unwrap().index()).collect();
        assert_eq!(forward, vec![0, 1, 2, 3, 4]);

        let mut back = set.cursor_at_end();
        let mut backward = Vec::new();
        while back.has_previous() {
            backward.push(back.previous().unwrap().unwrap().index());
        }
        assert_eq!(backward, vec![4, 3, 2, 1, 0]);
        assert!(!back.has_previous());
        assert!(back.has_next());

        // 新游标从头开始
        assert_eq!(set.cursor().count(), 5);
    }

    #[test]
    fn cursor_mutators_fail_fast() {
        let (_b, _s, rs) = fixture(1);
        let set: &dyn ResultSet = &rs;
        let mut c = set.cursor();
        let row = c.next().unwrap().unwrap();
        assert_eq!(c.remove(), Err(ResultSetError::ReadOnly("remove")));
        assert!(c.set((*row).clone()).is_err());
        assert!(c.insert((*row).clone()).is_err());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn row_view_is_fixed_after_first_access() {
        let (b, s, rs) = fixture(1);
        let first = rs.row(0).unwrap();
        let name = first.qualified_name().cloned();

        // 修改后端：新 segment 不影响已物化的行
        b.stage(&s, 2, vec![DocOp::Delete { path: "/d0".into() }]).unwrap();
        b.publish(&s, 2).unwrap();

        let again = rs.row(0).unwrap();
        assert_eq!(again.qualified_name().cloned(), name);
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn selector_projections_are_unsupported() {
        let (_b, _s, rs) = fixture(1);
        let row = rs.row(0).unwrap();
        assert!(matches!(
            row.node_ref_for_selector("d"),
            Err(ResultSetError::UnsupportedProjection(_))
        ));
        assert!(matches!(
            row.score_for_selector("d"),
            Err(ResultSetError::UnsupportedProjection(_))
        ));
    }

    #[test]
    fn close_is_idempotent_and_keeps_cached_rows() {
        let (_b, _s, rs) = fixture(2);
        let cached = rs.row(0).unwrap();
        rs.close();
        rs.close();
        assert!(rs.is_closed());
        assert_eq!(rs.row(0).unwrap(), cached);
        assert_eq!(rs.row(1).unwrap_err(), ResultSetError::Closed);
    }

    #[test]
    fn projection_selects_columns() {
        let store = StoreRef::new("s");
        let d = doc(&store, "/a", "Hello");
        let row = ResultRow::from_document(
            0,
            &d,
            0.5,
            Some(&["cmis:name".to_string(), "cm:title".to_string(), "cm:missing".to_string()]),
        );
        assert_eq!(row.value("cmis:name"), Some(&Value::String("a".into())));
        assert_eq!(row.value("cm:title"), Some(&Value::String("Hello".into())));
        assert_eq!(row.value("cm:missing"), Some(&Value::Null));
    }
}
