use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use roaring::RoaringBitmap;

use crate::analysis::{normalize_term, tokenize, tokenize_str, MultiReader, StrSource};
use crate::core::{NodeKind, SnapshotId, StoreRef};
use crate::error::IndexError;
use crate::index::backend::*;
use crate::storage::segment::{SegmentData, SegmentStore};

pub const STORES_DIR: &str = "stores";
/// 小 segment 不做压缩
const COMPACT_MIN_SLOTS: usize = 64;

type FieldTerms = HashMap<String, HashMap<String, u32>>;

/// 分析文档：字段 → 词项 → 词频
fn analyze(doc: &Document) -> FieldTerms {
    let mut out: FieldTerms = HashMap::new();
    let mut add = |field: &str, term: String| {
        *out.entry(field.to_string())
            .or_default()
            .entry(term)
            .or_insert(0) += 1;
    };

    // TEXT = 名称 + 属性文本 + 正文；三段拼成一个字符流送入分词器
    let props_text = doc
        .properties
        .values()
        .map(|v| v.as_text())
        .collect::<Vec<_>>()
        .join(" ");
    let mut text = MultiReader::new(
        StrSource::new(&format!("{} ", doc.qname.local)),
        MultiReader::new(
            StrSource::new(&format!("{} ", props_text)),
            StrSource::new(doc.content.as_deref().unwrap_or("")),
        ),
    );
    match tokenize(&mut text) {
        Ok(terms) => {
            for t in terms {
                add(FIELD_TEXT, t);
            }
        }
        Err(e) => tracing::warn!("analyze TEXT failed for {}: {}", doc.node, e),
    }

    for (name, value) in doc.properties.iter() {
        let field = property_field(name);
        for t in tokenize_str(&value.as_text()) {
            add(&field, t);
        }
    }
    for t in tokenize_str(&doc.qname.local) {
        add(&property_field("cm:name"), t);
    }

    add(FIELD_ID, doc.node.to_string());
    add(FIELD_PATH, doc.node.path.clone());
    if let Some(parent) = &doc.parent {
        add(FIELD_PARENT, parent.parent.path.clone());
    }
    add(FIELD_QNAME, normalize_term(&doc.qname.local));
    add(
        FIELD_TYPE,
        match doc.kind {
            NodeKind::File => "file".to_string(),
            NodeKind::Directory => "directory".to_string(),
        },
    );
    out
}

/// 单个 store 的不可变可见视图；publish 时复制 + 应用 + 原子替换
#[derive(Clone, Debug)]
pub struct Segment {
    store: StoreRef,
    snapshot: Option<SnapshotId>,
    docs: Vec<Option<Document>>,
    doc_terms: Vec<Option<FieldTerms>>,
    by_path: HashMap<String, DocId>,
    postings: HashMap<String, HashMap<String, RoaringBitmap>>,
    live: RoaringBitmap,
}

impl Segment {
    fn empty(store: StoreRef) -> Self {
        Self {
            store,
            snapshot: None,
            docs: Vec::new(),
            doc_terms: Vec::new(),
            by_path: HashMap::new(),
            postings: HashMap::new(),
            live: RoaringBitmap::new(),
        }
    }

    /// 已删除（None）的槽位数
    fn tombstones(&self) -> u64 {
        self.docs.len() as u64 - self.live.len()
    }

    /// 墓碑超过半数时重排 DocId（只影响新视图，旧 searcher 持有旧 Arc）
    fn compact_if_sparse(&mut self) {
        if self.docs.len() < COMPACT_MIN_SLOTS || self.tombstones() * 2 <= self.docs.len() as u64 {
            return;
        }
        let before = self.docs.len();
        let mut next = Self::empty(self.store.clone());
        next.snapshot = self.snapshot;
        for doc in std::mem::take(&mut self.docs).into_iter().flatten() {
            next.upsert(doc);
        }
        *self = next;
        tracing::debug!(
            "compact: store={} slots {} -> {}",
            self.store,
            before,
            self.docs.len()
        );
    }

    fn from_data(data: SegmentData) -> Self {
        let mut seg = Self::empty(data.store);
        for doc in data.docs {
            seg.upsert(doc);
        }
        seg.snapshot = Some(data.snapshot);
        seg
    }

    fn to_data(&self) -> SegmentData {
        SegmentData {
            store: self.store.clone(),
            snapshot: self.snapshot.unwrap_or(0),
            docs: self.docs.iter().flatten().cloned().collect(),
        }
    }

    fn apply(&mut self, op: DocOp) {
        match op {
            DocOp::Upsert(doc) => self.upsert(doc),
            DocOp::Delete { path } => self.remove(&path),
        }
    }

    fn upsert(&mut self, doc: Document) {
        self.remove(&doc.node.path);
        let id = self.docs.len() as DocId;
        let terms = analyze(&doc);
        for (field, ts) in terms.iter() {
            let per_field = self.postings.entry(field.clone()).or_default();
            for term in ts.keys() {
                per_field.entry(term.clone()).or_default().insert(id);
            }
        }
        self.by_path.insert(doc.node.path.clone(), id);
        self.docs.push(Some(doc));
        self.doc_terms.push(Some(terms));
        self.live.insert(id);
    }

    fn remove(&mut self, path: &str) {
        let Some(id) = self.by_path.remove(path) else {
            return;
        };
        let idx = id as usize;
        if let Some(terms) = self.doc_terms.get_mut(idx).and_then(Option::take) {
            for (field, ts) in terms {
                if let Some(per_field) = self.postings.get_mut(&field) {
                    for term in ts.keys() {
                        let empty = match per_field.get_mut(term) {
                            Some(bm) => {
                                bm.remove(id);
                                bm.is_empty()
                            }
                            None => false,
                        };
                        if empty {
                            per_field.remove(term);
                        }
                    }
                }
            }
        }
        if let Some(slot) = self.docs.get_mut(idx) {
            *slot = None;
        }
        self.live.remove(id);
    }

    fn has_entries_for(&self, snapshot: SnapshotId) -> bool {
        self.docs
            .iter()
            .flatten()
            .any(|d| d.snapshot == snapshot)
    }

    fn entry_snapshot(&self, path: &str) -> Option<SnapshotId> {
        let id = *self.by_path.get(path)?;
        self.docs.get(id as usize)?.as_ref().map(|d| d.snapshot)
    }
}

impl IndexSearcher for Segment {
    fn store(&self) -> &StoreRef {
        &self.store
    }

    fn snapshot(&self) -> SnapshotId {
        self.snapshot.unwrap_or(0)
    }

    fn num_docs(&self) -> u64 {
        self.live.len()
    }

    fn all_docs(&self) -> RoaringBitmap {
        self.live.clone()
    }

    fn term_docs(&self, field: &str, term: &str) -> RoaringBitmap {
        self.postings
            .get(field)
            .and_then(|f| f.get(term))
            .cloned()
            .unwrap_or_default()
    }

    fn terms(&self, field: &str) -> Vec<String> {
        self.postings
            .get(field)
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn term_freq(&self, doc: DocId, field: &str, term: &str) -> u32 {
        self.doc_terms
            .get(doc as usize)
            .and_then(|t| t.as_ref())
            .and_then(|t| t.get(field))
            .and_then(|f| f.get(term))
            .copied()
            .unwrap_or(0)
    }

    fn document(&self, doc: DocId) -> Option<Document> {
        self.docs.get(doc as usize)?.clone()
    }
}

struct StoreIndex {
    visible: ArcSwap<Segment>,
    /// applied 但尚未 searchable 的操作（按快照排序）
    staged: Mutex<BTreeMap<SnapshotId, Vec<DocOp>>>,
}

impl StoreIndex {
    fn new(seg: Segment) -> Self {
        Self {
            visible: ArcSwap::from_pointee(seg),
            staged: Mutex::new(BTreeMap::new()),
        }
    }
}

/// 内存后端：倒排表常驻内存，publish 时把可见 segment 原子落盘
pub struct MemoryBackend {
    root: Option<PathBuf>,
    stores: DashMap<StoreRef, Arc<StoreIndex>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl MemoryBackend {
    /// 纯内存（不落盘）
    pub fn in_memory() -> Self {
        Self {
            root: None,
            stores: DashMap::new(),
        }
    }

    /// 以 `root` 为落盘目录打开；加载 `root/stores/*/segment.db` 中全部有效 segment
    pub fn open(root: PathBuf) -> anyhow::Result<Self> {
        let stores_dir = root.join(STORES_DIR);
        std::fs::create_dir_all(&stores_dir)?;
        let stores = DashMap::new();

        for ent in std::fs::read_dir(&stores_dir)? {
            let Ok(ent) = ent else { continue };
            if !ent.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            match SegmentStore::in_dir(&ent.path()).load_if_valid() {
                Ok(Some(data)) => {
                    tracing::info!(
                        "Loaded segment: store={} snapshot={} docs={}",
                        data.store,
                        data.snapshot,
                        data.docs.len()
                    );
                    let store = data.store.clone();
                    stores.insert(store, Arc::new(StoreIndex::new(Segment::from_data(data))));
                }
                Ok(None) => {
                    tracing::warn!("No valid segment in {:?}, skipping", ent.path());
                }
                Err(e) => {
                    tracing::warn!("Failed to load segment {:?}: {}", ent.path(), e);
                }
            }
        }

        Ok(Self {
            root: Some(root),
            stores,
        })
    }

    fn store_dir(&self, store: &StoreRef) -> Option<PathBuf> {
        self.root
            .as_ref()
            .map(|r| r.join(STORES_DIR).join(store.dir_name()))
    }

    fn get(&self, store: &StoreRef) -> Result<Arc<StoreIndex>, IndexError> {
        self.stores
            .get(store)
            .map(|e| e.value().clone())
            .ok_or_else(|| IndexError::Backend(format!("no index for store {}", store)))
    }

    fn persist(&self, seg: &Segment) -> Result<(), IndexError> {
        let Some(dir) = self.store_dir(&seg.store) else {
            return Ok(());
        };
        if seg.snapshot.is_none() {
            return Ok(());
        }
        SegmentStore::in_dir(&dir)
            .write_atomic(&seg.to_data())
            .map_err(|e| IndexError::Backend(format!("persist {}: {}", seg.store, e)))
    }
}

fn remove_dir_if_exists(dir: &Path) -> Result<(), IndexError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IndexError::Io(e)),
    }
}

impl IndexBackend for MemoryBackend {
    fn create_store(&self, store: &StoreRef) -> Result<(), IndexError> {
        self.stores
            .entry(store.clone())
            .or_insert_with(|| Arc::new(StoreIndex::new(Segment::empty(store.clone()))));
        Ok(())
    }

    fn has_store(&self, store: &StoreRef) -> bool {
        self.stores.contains_key(store)
    }

    fn stage(
        &self,
        store: &StoreRef,
        snapshot: SnapshotId,
        ops: Vec<DocOp>,
    ) -> Result<(), IndexError> {
        let si = self.get(store)?;
        let mut staged = si.staged.lock();
        staged.entry(snapshot).or_default().extend(ops);
        Ok(())
    }

    fn publish(&self, store: &StoreRef, snapshot: SnapshotId) -> Result<(), IndexError> {
        let si = self.get(store)?;
        let mut staged = si.staged.lock();

        let current = si.visible.load_full();
        let mut next = (*current).clone();
        let later = staged.split_off(&(snapshot + 1));
        let ready = std::mem::replace(&mut *staged, later);
        let mut applied_ops = 0usize;
        for (_, ops) in ready {
            for op in ops {
                next.apply(op);
                applied_ops += 1;
            }
        }
        next.snapshot = Some(snapshot);
        next.compact_if_sparse();

        self.persist(&next)?;
        si.visible.store(Arc::new(next));
        tracing::debug!(
            "publish: store={} snapshot={} ops={}",
            store,
            snapshot,
            applied_ops
        );
        Ok(())
    }

    fn drop_store(&self, store: &StoreRef) -> Result<(), IndexError> {
        self.stores.remove(store);
        if let Some(dir) = self.store_dir(store) {
            remove_dir_if_exists(&dir)?;
        }
        Ok(())
    }

    fn searcher(&self, store: &StoreRef) -> Option<Arc<dyn IndexSearcher>> {
        let si = self.stores.get(store)?.value().clone();
        let seg: Arc<Segment> = si.visible.load_full();
        Some(seg)
    }

    fn has_entries_for(&self, store: &StoreRef, snapshot: SnapshotId) -> bool {
        let Ok(si) = self.get(store) else {
            return false;
        };
        let staged_hit = si
            .staged
            .lock()
            .get(&snapshot)
            .is_some_and(|ops| ops.iter().any(|op| matches!(op, DocOp::Upsert(_))));
        staged_hit || si.visible.load().has_entries_for(snapshot)
    }

    fn entry_snapshot(&self, store: &StoreRef, path: &str) -> Option<SnapshotId> {
        let si = self.get(store).ok()?;
        {
            let staged = si.staged.lock();
            for (snap, ops) in staged.iter().rev() {
                if let Some(op) = ops.iter().rev().find(|op| op.path() == path) {
                    return match op {
                        DocOp::Upsert(_) => Some(*snap),
                        DocOp::Delete { .. } => None,
                    };
                }
            }
        }
        si.visible.load().entry_snapshot(path)
    }

    fn applied_snapshot(&self, store: &StoreRef) -> Option<SnapshotId> {
        let si = self.get(store).ok()?;
        let staged_last = si.staged.lock().keys().next_back().copied();
        staged_last.or(si.visible.load().snapshot)
    }

    fn searchable_snapshot(&self, store: &StoreRef) -> Option<SnapshotId> {
        let si = self.get(store).ok()?;
        let snap = si.visible.load().snapshot;
        snap
    }

    fn doc_count(&self) -> u64 {
        self.stores
            .iter()
            .map(|e| e.value().visible.load().num_docs())
            .sum()
    }

    fn store_doc_count(&self, store: &StoreRef) -> u64 {
        self.get(store)
            .map(|si| si.visible.load().num_docs())
            .unwrap_or(0)
    }

    fn stores(&self) -> Vec<StoreRef> {
        let mut v: Vec<StoreRef> = self.stores.iter().map(|e| e.key().clone()).collect();
        v.sort();
        v
    }

    fn flush(&self) -> Result<(), IndexError> {
        for e in self.stores.iter() {
            let seg = e.value().visible.load_full();
            self.persist(&seg)?;
        }
        Ok(())
    }

    fn root_dir(&self) -> Option<PathBuf> {
        self.root.clone()
    }
}
