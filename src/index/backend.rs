use std::path::PathBuf;
use std::sync::Arc;

use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::core::{ChildAssocRef, NodeKind, NodeRef, Properties, QName, SnapshotId, StoreRef};
use crate::error::IndexError;

/// 后端内部的文档编号（只在单个 searcher 视图内有效）
pub type DocId = u32;

// 字段名
pub const FIELD_TEXT: &str = "TEXT";
pub const FIELD_ID: &str = "ID";
pub const FIELD_PATH: &str = "PATH";
pub const FIELD_PARENT: &str = "PARENT";
pub const FIELD_QNAME: &str = "QNAME";
pub const FIELD_TYPE: &str = "TYPE";

/// 属性字段：`@cm:title`
pub fn property_field(name: &str) -> String {
    format!("@{}", name)
}

/// 索引单元（后端持有；结果行只通过 DocId 引用）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub node: NodeRef,
    pub qname: QName,
    pub parent: Option<ChildAssocRef>,
    pub kind: NodeKind,
    /// 写入该文档的快照
    pub snapshot: SnapshotId,
    pub properties: Properties,
    pub content: Option<String>,
}

/// 一次快照应用中的文档操作
#[derive(Clone, Debug)]
pub enum DocOp {
    Upsert(Document),
    Delete { path: String },
}

impl DocOp {
    pub fn path(&self) -> &str {
        match self {
            DocOp::Upsert(d) => &d.node.path,
            DocOp::Delete { path } => path,
        }
    }
}

/// 某个 store 在某个 searchable 快照上的只读视图
pub trait IndexSearcher: Send + Sync {
    fn store(&self) -> &StoreRef;

    /// 视图对应的 searchable 快照
    fn snapshot(&self) -> SnapshotId;

    fn num_docs(&self) -> u64;

    fn all_docs(&self) -> RoaringBitmap;

    fn term_docs(&self, field: &str, term: &str) -> RoaringBitmap;

    /// 字段下的全部词项（通配符展开用）
    fn terms(&self, field: &str) -> Vec<String>;

    /// 文档内某字段的词频（打分用）
    fn term_freq(&self, doc: DocId, field: &str, term: &str) -> u32;

    fn document(&self, doc: DocId) -> Option<Document>;
}

/// 不透明的索引后端。
///
/// ## 契约
/// - `stage` 写入的条目即为 *applied*，但对 `searcher` 不可见；
/// - `publish(store, n)` 把 `<= n` 的 staged 条目原子地变为可见（*searchable*）；
/// - 同一 store 的 `stage`/`publish` 由调用方串行化。
pub trait IndexBackend: Send + Sync {
    fn create_store(&self, store: &StoreRef) -> Result<(), IndexError>;

    fn has_store(&self, store: &StoreRef) -> bool;

    fn stage(&self, store: &StoreRef, snapshot: SnapshotId, ops: Vec<DocOp>)
        -> Result<(), IndexError>;

    fn publish(&self, store: &StoreRef, snapshot: SnapshotId) -> Result<(), IndexError>;

    fn drop_store(&self, store: &StoreRef) -> Result<(), IndexError>;

    fn searcher(&self, store: &StoreRef) -> Option<Arc<dyn IndexSearcher>>;

    /// 是否存在（staged 或可见）由 `snapshot` 写入的条目
    fn has_entries_for(&self, store: &StoreRef, snapshot: SnapshotId) -> bool;

    /// 路径当前条目的写入快照（staged 优先）；无条目返回 None
    fn entry_snapshot(&self, store: &StoreRef, path: &str) -> Option<SnapshotId>;

    /// 最后一个 staged（applied）快照
    fn applied_snapshot(&self, store: &StoreRef) -> Option<SnapshotId>;

    /// 最后一个可见（searchable）快照
    fn searchable_snapshot(&self, store: &StoreRef) -> Option<SnapshotId>;

    fn doc_count(&self) -> u64;

    fn store_doc_count(&self, store: &StoreRef) -> u64;

    fn stores(&self) -> Vec<StoreRef>;

    /// 把可见状态落盘（无落盘目录时为 no-op）
    fn flush(&self) -> Result<(), IndexError>;

    /// 落盘根目录（备份的拷贝源）
    fn root_dir(&self) -> Option<PathBuf>;
}
