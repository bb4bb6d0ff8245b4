use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;

use crate::core::{NodeRef, QName, StoreRef};
use crate::error::ResultSetError;
use crate::query::result::{check_bounds, ResultRow, ResultSet};

/// 远端 JSON 搜索响应：
/// `{"responseHeader": {"QTime": n}, "response": {"numFound": n, "docs": [...]}}`
///
/// 外部数据不可信：缺字段或格式错误都降级为空结果并记 warn，不向上传播。
pub struct JsonResultSet {
    docs: Vec<Value>,
    rows: Vec<OnceLock<Arc<ResultRow>>>,
    query_time: Option<Duration>,
    number_found: Option<u64>,
    closed: AtomicBool,
}

impl JsonResultSet {
    pub fn empty() -> Self {
        Self::from_parts(Vec::new(), None, None)
    }

    fn from_parts(docs: Vec<Value>, query_time: Option<Duration>, number_found: Option<u64>) -> Self {
        let rows = (0..docs.len()).map(|_| OnceLock::new()).collect();
        Self {
            docs,
            rows,
            query_time,
            number_found,
            closed: AtomicBool::new(false),
        }
    }

    pub fn parse(payload: &Value) -> Self {
        let Some(obj) = payload.as_object() else {
            tracing::warn!("Search response is not a JSON object, returning empty result");
            return Self::empty();
        };

        let query_time = obj
            .get("responseHeader")
            .and_then(|h| h.get("QTime"))
            .and_then(Value::as_u64)
            .map(Duration::from_millis);

        let Some(response) = obj.get("response") else {
            tracing::warn!("Search response has no 'response' section, returning empty result");
            return Self::from_parts(Vec::new(), query_time, None);
        };
        let number_found = response.get("numFound").and_then(Value::as_u64);
        let docs = match response.get("docs") {
            Some(Value::Array(a)) => a.clone(),
            Some(_) => {
                tracing::warn!("Search response 'docs' is not an array, ignoring");
                Vec::new()
            }
            None => Vec::new(),
        };
        Self::from_parts(docs, query_time, number_found)
    }

    /// 解析原始文本；解析失败时返回空结果
    pub fn parse_str(body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(v) => Self::parse(&v),
            Err(e) => {
                tracing::warn!("Failed to parse search response: {}", e);
                Self::empty()
            }
        }
    }

    fn materialize(&self, index: usize) -> ResultRow {
        let doc = &self.docs[index];
        let values: BTreeMap<String, Value> = doc
            .as_object()
            .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        let node = values
            .get("id")
            .and_then(Value::as_str)
            .and_then(parse_node_ref);
        let score = values
            .get("score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32;
        let qname = values
            .get("QNAME")
            .and_then(Value::as_str)
            .and_then(QName::parse)
            .or_else(|| {
                values
                    .get("cm:name")
                    .and_then(Value::as_str)
                    .map(QName::content)
            });

        ResultRow {
            index,
            node,
            score,
            qname,
            parent: None,
            values,
        }
    }
}

/// `store:/path`
fn parse_node_ref(s: &str) -> Option<NodeRef> {
    let i = s.find(":/")?;
    Some(NodeRef::new(StoreRef::new(&s[..i]), &s[i + 1..]))
}

impl ResultSet for JsonResultSet {
    fn len(&self) -> usize {
        self.docs.len()
    }

    fn row(&self, index: usize) -> Result<Arc<ResultRow>, ResultSetError> {
        check_bounds(index, self.docs.len())?;
        if let Some(r) = self.rows[index].get() {
            return Ok(r.clone());
        }
        if self.is_closed() {
            return Err(ResultSetError::Closed);
        }
        Ok(self.rows[index]
            .get_or_init(|| Arc::new(self.materialize(index)))
            .clone())
    }

    fn total(&self) -> usize {
        self.number_found
            .map_or(self.docs.len(), |n| (n as usize).max(self.docs.len()))
    }

    fn query_time(&self) -> Option<Duration> {
        self.query_time
    }

    fn number_found(&self) -> Option<u64> {
        self.number_found
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// 建议词结果：`suggest.<dict>.<term>.{numFound, suggestions[{term, weight}]}`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SuggesterResult {
    number_found: u64,
    suggestions: Vec<(String, i64)>,
}

impl SuggesterResult {
    pub fn number_found(&self) -> u64 {
        self.number_found
    }

    /// 按输入顺序的 (term, weight)
    pub fn suggestions(&self) -> &[(String, i64)] {
        &self.suggestions
    }

    pub fn parse(payload: &Value) -> Self {
        let Some(suggest) = payload.get("suggest").and_then(Value::as_object) else {
            tracing::debug!("Suggester response has no 'suggest' section");
            return Self::default();
        };

        let mut out = Self::default();
        for (dict, terms) in suggest {
            let Some(terms) = terms.as_object() else {
                tracing::warn!("Suggester dictionary {} is not an object, skipping", dict);
                continue;
            };
            for (term, entry) in terms {
                out.number_found += entry.get("numFound").and_then(Value::as_u64).unwrap_or(0);
                let Some(list) = entry.get("suggestions").and_then(Value::as_array) else {
                    tracing::warn!("Suggestions for {}/{} missing, skipping", dict, term);
                    continue;
                };
                for s in list {
                    match (s.get("term").and_then(Value::as_str), s.get("weight")) {
                        (Some(t), w) => out.suggestions.push((
                            t.to_string(),
                            w.and_then(Value::as_i64).unwrap_or(0),
                        )),
                        (None, _) => tracing::warn!("Suggestion without term ignored"),
                    }
                }
            }
        }
        out
    }

    pub fn parse_str(body: &str) -> Self {
        match serde_json::from_str::<Value>(body) {
            Ok(v) => Self::parse(&v),
            Err(e) => {
                tracing::warn!("Failed to parse suggester response: {}", e);
                Self::default()
            }
        }
    }
}
