use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 快照号：每个 store 单调递增，0 表示尚未提交任何事务的空 store。
pub type SnapshotId = u64;

/// 逻辑内容分区（例如一个版本化 workspace）
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreRef(String);

impl StoreRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 用作磁盘目录名：非 [A-Za-z0-9._-] 一律替换为 '_'
    pub fn dir_name(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreRef {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// 索引应用模式
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    /// `index()` 返回前 delta 已写入且可查询
    #[default]
    Synchronous,
    /// `index()` 只登记 pending，由后台 worker 应用
    Asynchronous,
}

impl fmt::Display for IndexMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexMode::Synchronous => f.write_str("synchronous"),
            IndexMode::Asynchronous => f.write_str("asynchronous"),
        }
    }
}

/// 单个快照的索引状态，只能前进：Pending → Applied → Searchable
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SnapshotState {
    Pending,
    Applied,
    Searchable,
}

impl SnapshotState {
    pub fn is_applied(self) -> bool {
        self >= SnapshotState::Applied
    }

    pub fn is_searchable(self) -> bool {
        self == SnapshotState::Searchable
    }
}

/// 限定名：`{namespace}local`，前缀形式 `cm:local`
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QName {
    pub namespace: String,
    pub local: String,
}

pub const CONTENT_MODEL_PREFIX: &str = "cm";
pub const CONTENT_MODEL_URI: &str = "http://www.alfresco.org/model/content/1.0";

impl QName {
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            local: local.into(),
        }
    }

    pub fn content(local: impl Into<String>) -> Self {
        Self::new(CONTENT_MODEL_URI, local)
    }

    /// 解析 `{ns}local` 或 `cm:local`（未知前缀按原样作为 namespace）
    pub fn parse(s: &str) -> Option<Self> {
        if let Some(rest) = s.strip_prefix('{') {
            let (ns, local) = rest.split_once('}')?;
            if local.is_empty() {
                return None;
            }
            return Some(Self::new(ns, local));
        }
        let (prefix, local) = s.split_once(':')?;
        if local.is_empty() {
            return None;
        }
        let ns = if prefix == CONTENT_MODEL_PREFIX {
            CONTENT_MODEL_URI
        } else {
            prefix
        };
        Some(Self::new(ns, local))
    }

    pub fn prefixed(&self) -> String {
        if self.namespace == CONTENT_MODEL_URI {
            format!("{}:{}", CONTENT_MODEL_PREFIX, self.local)
        } else {
            format!("{}:{}", self.namespace, self.local)
        }
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.local)
    }
}

/// 节点引用：store + store 内绝对路径
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeRef {
    pub store: StoreRef,
    pub path: String,
}

impl NodeRef {
    pub fn new(store: StoreRef, path: impl Into<String>) -> Self {
        Self {
            store,
            path: path.into(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.store, self.path)
    }
}

/// 父子关联
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildAssocRef {
    pub parent: NodeRef,
    pub child: NodeRef,
    pub qname: QName,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Directory,
}

/// 属性值（索引/查询层只关心文本化后的形式）
///
/// 外部标签形式（`{"text": "..."}`）：segment 文件走 bincode，不支持 untagged。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    pub fn as_text(&self) -> String {
        match self {
            PropertyValue::Bool(b) => b.to_string(),
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::Float(f) => f.to_string(),
            PropertyValue::Text(s) => s.clone(),
            PropertyValue::List(v) => v
                .iter()
                .map(|p| p.as_text())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// 面向客户端的朴素 JSON（不带类型标签）
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Int(i) => Value::from(*i),
            PropertyValue::Float(f) => Value::from(*f),
            PropertyValue::Text(s) => Value::String(s.clone()),
            PropertyValue::List(v) => Value::Array(v.iter().map(|p| p.to_json()).collect()),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::Text(s.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

/// 路径工具：`/a/b` 的父路径与末段名
pub fn split_path(path: &str) -> (Option<&str>, &str) {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return (None, "");
    }
    match trimmed.rfind('/') {
        Some(0) => (Some("/"), &trimmed[1..]),
        Some(i) => (Some(&trimmed[..i]), &trimmed[i + 1..]),
        None => (None, trimmed),
    }
}

/// `child` 是否位于 `ancestor` 子树内（不含自身）
pub fn is_descendant(child: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return child != "/" && child.starts_with('/');
    }
    child.len() > ancestor.len()
        && child.starts_with(ancestor)
        && child.as_bytes()[ancestor.len()] == b'/'
}
