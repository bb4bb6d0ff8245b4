use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::change::{Difference, NodeDescriptor};
use crate::core::types::{split_path, NodeKind, Properties, QName, SnapshotId, StoreRef};
use crate::error::ContentError;

/// 版本化内容存储的只读视图（索引器唯一依赖的内容侧接口）
pub trait ContentSource: Send + Sync {
    /// store 的最新快照号；store 不存在时返回 None
    fn head(&self, store: &StoreRef) -> Option<SnapshotId>;

    /// 查找某版本下的节点（包括已删除的墓碑）
    fn lookup(
        &self,
        store: &StoreRef,
        version: SnapshotId,
        path: &str,
    ) -> Result<Option<NodeDescriptor>, ContentError>;

    /// 某版本下目录的直接子节点（不含墓碑）
    fn children(
        &self,
        store: &StoreRef,
        version: SnapshotId,
        path: &str,
    ) -> Result<Vec<NodeDescriptor>, ContentError>;

    /// src → dst 之间发生变化的路径（按路径排序，不含未变化项）
    fn compare(
        &self,
        store: &StoreRef,
        src: SnapshotId,
        dst: SnapshotId,
    ) -> Result<Vec<Difference>, ContentError>;
}

/// 一次事务中的单个修改
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    Put {
        path: String,
        #[serde(default = "default_kind")]
        kind: NodeKind,
        #[serde(default)]
        qname: Option<QName>,
        #[serde(default)]
        properties: Properties,
        #[serde(default)]
        content: Option<String>,
    },
    Delete {
        path: String,
    },
}

fn default_kind() -> NodeKind {
    NodeKind::File
}

impl Mutation {
    pub fn file(path: &str, content: &str) -> Self {
        Mutation::Put {
            path: path.to_string(),
            kind: NodeKind::File,
            qname: None,
            properties: Properties::new(),
            content: Some(content.to_string()),
        }
    }

    pub fn dir(path: &str) -> Self {
        Mutation::Put {
            path: path.to_string(),
            kind: NodeKind::Directory,
            qname: None,
            properties: Properties::new(),
            content: None,
        }
    }

    pub fn delete(path: &str) -> Self {
        Mutation::Delete {
            path: path.to_string(),
        }
    }

    pub fn with_property(mut self, name: &str, value: impl Into<crate::core::PropertyValue>) -> Self {
        if let Mutation::Put { properties, .. } = &mut self {
            properties.insert(name.to_string(), value.into());
        }
        self
    }
}

#[derive(Debug, Default)]
struct VersionedStore {
    head: SnapshotId,
    /// path → 按版本递增的历史（每个版本的完整描述，删除为墓碑）
    history: BTreeMap<String, Vec<NodeDescriptor>>,
}

impl VersionedStore {
    fn at(&self, version: SnapshotId, path: &str) -> Option<&NodeDescriptor> {
        self.history
            .get(path)?
            .iter()
            .rev()
            .find(|d| d.version <= version)
    }

    fn is_live(&self, version: SnapshotId, path: &str) -> bool {
        self.at(version, path).is_some_and(|d| !d.deleted)
    }
}

/// 内存版本化内容存储：每次 `commit` 产生一个新的快照号
#[derive(Default)]
pub struct MemoryContentStore {
    stores: RwLock<HashMap<StoreRef, VersionedStore>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建立 store：快照 0 只包含根目录。已存在时保持不变。
    pub fn create_store(&self, store: &StoreRef) -> SnapshotId {
        let mut g = self.stores.write();
        let vs = g.entry(store.clone()).or_insert_with(|| {
            let mut vs = VersionedStore::default();
            vs.history.insert(
                "/".to_string(),
                vec![NodeDescriptor {
                    path: "/".to_string(),
                    version: 0,
                    kind: NodeKind::Directory,
                    qname: QName::content(store.as_str()),
                    properties: Properties::new(),
                    content: None,
                    deleted: false,
                }],
            );
            vs
        });
        vs.head
    }

    /// 原子提交一组修改，返回新的快照号
    pub fn commit(
        &self,
        store: &StoreRef,
        mutations: Vec<Mutation>,
    ) -> Result<SnapshotId, ContentError> {
        let mut g = self.stores.write();
        let vs = g
            .get_mut(store)
            .ok_or_else(|| ContentError::UnknownStore(store.clone()))?;
        let version = vs.head + 1;

        for m in mutations {
            match m {
                Mutation::Put {
                    path,
                    kind,
                    qname,
                    properties,
                    content,
                } => {
                    let path = normalize(&path)?;
                    ensure_parents(vs, version, &path);
                    let (_, name) = split_path(&path);
                    let desc = NodeDescriptor {
                        path: path.clone(),
                        version,
                        kind,
                        qname: qname.unwrap_or_else(|| QName::content(name)),
                        properties,
                        content,
                        deleted: false,
                    };
                    push_version(vs, desc);
                }
                Mutation::Delete { path } => {
                    let path = normalize(&path)?;
                    if path == "/" {
                        return Err(ContentError::InvalidPath(path));
                    }
                    // 删除目录时连同子树一起写墓碑
                    let doomed: Vec<String> = vs
                        .history
                        .keys()
                        .filter(|p| {
                            (p.as_str() == path || crate::core::is_descendant(p, &path))
                                && vs.is_live(version, p)
                        })
                        .cloned()
                        .collect();
                    for p in doomed {
                        if let Some(prev) = vs.at(version, &p).cloned() {
                            push_version(
                                vs,
                                NodeDescriptor {
                                    version,
                                    deleted: true,
                                    ..prev
                                },
                            );
                        }
                    }
                }
            }
        }

        vs.head = version;
        tracing::debug!("content commit: store={} snapshot={}", store, version);
        Ok(version)
    }
}

fn normalize(path: &str) -> Result<String, ContentError> {
    if !path.starts_with('/') {
        return Err(ContentError::InvalidPath(path.to_string()));
    }
    let trimmed = path.trim_end_matches('/');
    Ok(if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    })
}

fn push_version(vs: &mut VersionedStore, desc: NodeDescriptor) {
    let hist = vs.history.entry(desc.path.clone()).or_default();
    // 同一事务内多次修改同一路径：以最后一次为准
    if hist.last().is_some_and(|d| d.version == desc.version) {
        hist.pop();
    }
    hist.push(desc);
}

fn ensure_parents(vs: &mut VersionedStore, version: SnapshotId, path: &str) {
    let mut missing = Vec::new();
    let mut cur = split_path(path).0;
    while let Some(p) = cur {
        if vs.is_live(version, p) {
            break;
        }
        missing.push(p.to_string());
        cur = split_path(p).0;
    }
    for p in missing.into_iter().rev() {
        let (_, name) = split_path(&p);
        push_version(
            vs,
            NodeDescriptor {
                path: p.clone(),
                version,
                kind: NodeKind::Directory,
                qname: QName::content(name),
                properties: Properties::new(),
                content: None,
                deleted: false,
            },
        );
    }
}

impl ContentSource for MemoryContentStore {
    fn head(&self, store: &StoreRef) -> Option<SnapshotId> {
        self.stores.read().get(store).map(|vs| vs.head)
    }

    fn lookup(
        &self,
        store: &StoreRef,
        version: SnapshotId,
        path: &str,
    ) -> Result<Option<NodeDescriptor>, ContentError> {
        let g = self.stores.read();
        let vs = g
            .get(store)
            .ok_or_else(|| ContentError::UnknownStore(store.clone()))?;
        check_version(store, vs, version)?;
        Ok(vs.at(version, path).cloned())
    }

    fn children(
        &self,
        store: &StoreRef,
        version: SnapshotId,
        path: &str,
    ) -> Result<Vec<NodeDescriptor>, ContentError> {
        let g = self.stores.read();
        let vs = g
            .get(store)
            .ok_or_else(|| ContentError::UnknownStore(store.clone()))?;
        check_version(store, vs, version)?;
        Ok(vs
            .history
            .keys()
            .filter(|p| split_path(p).0 == Some(path) && p.as_str() != "/")
            .filter_map(|p| vs.at(version, p))
            .filter(|d| !d.deleted)
            .cloned()
            .collect())
    }

    fn compare(
        &self,
        store: &StoreRef,
        src: SnapshotId,
        dst: SnapshotId,
    ) -> Result<Vec<Difference>, ContentError> {
        let g = self.stores.read();
        let vs = g
            .get(store)
            .ok_or_else(|| ContentError::UnknownStore(store.clone()))?;
        check_version(store, vs, src)?;
        check_version(store, vs, dst)?;
        let (lo, hi) = if src <= dst { (src, dst) } else { (dst, src) };

        let mut out = Vec::new();
        for (path, hist) in vs.history.iter() {
            if !hist.iter().any(|d| d.version > lo && d.version <= hi) {
                continue;
            }
            let before = vs.at(src, path).cloned();
            let after = vs.at(dst, path).cloned();
            if before.is_none() && after.as_ref().map_or(true, |d| d.deleted) {
                // 区间内创建又删除：两端都看不到
                continue;
            }
            out.push(Difference {
                path: path.clone(),
                before,
                after,
            });
        }
        Ok(out)
    }
}

fn check_version(
    store: &StoreRef,
    vs: &VersionedStore,
    version: SnapshotId,
) -> Result<(), ContentError> {
    if version > vs.head {
        return Err(ContentError::UnknownSnapshot {
            store: store.clone(),
            snapshot: version,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_assigns_increasing_snapshots_and_creates_parents() {
        let cs = MemoryContentStore::new();
        let s = StoreRef::new("site");
        assert_eq!(cs.create_store(&s), 0);

        let v1 = cs.commit(&s, vec![Mutation::file("/docs/a.txt", "alpha")]).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(cs.head(&s), Some(1));

        let docs = cs.lookup(&s, 1, "/docs").unwrap().unwrap();
        assert!(docs.is_directory());
        assert!(cs.lookup(&s, 0, "/docs").unwrap().is_none());

        let kids = cs.children(&s, 1, "/docs").unwrap();
        assert_eq!(kids.len(), 1);
        assert_eq!(kids[0].path, "/docs/a.txt");
    }

    #[test]
    fn compare_reports_created_and_deleted_paths() {
        let cs = MemoryContentStore::new();
        let s = StoreRef::new("site");
        cs.create_store(&s);
        cs.commit(&s, vec![Mutation::file("/a.txt", "a")]).unwrap();
        cs.commit(&s, vec![Mutation::delete("/a.txt"), Mutation::file("/b.txt", "b")])
            .unwrap();

        let diff = cs.compare(&s, 1, 2).unwrap();
        let paths: Vec<_> = diff.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["/a.txt", "/b.txt"]);
        assert!(diff[0].after.as_ref().unwrap().deleted);
        assert!(diff[1].before.is_none());
    }

    #[test]
    fn deleting_directory_tombstones_subtree() {
        let cs = MemoryContentStore::new();
        let s = StoreRef::new("site");
        cs.create_store(&s);
        cs.commit(&s, vec![Mutation::file("/d/x.txt", "x")]).unwrap();
        cs.commit(&s, vec![Mutation::delete("/d")]).unwrap();

        assert!(cs.lookup(&s, 2, "/d/x.txt").unwrap().unwrap().deleted);
        assert!(cs.children(&s, 2, "/").unwrap().is_empty());
    }

    #[test]
    fn unknown_store_and_snapshot_are_errors() {
        let cs = MemoryContentStore::new();
        let s = StoreRef::new("nope");
        assert!(cs.head(&s).is_none());
        assert!(matches!(
            cs.compare(&s, 0, 1),
            Err(ContentError::UnknownStore(_))
        ));
        cs.create_store(&s);
        assert!(matches!(
            cs.lookup(&s, 7, "/"),
            Err(ContentError::UnknownSnapshot { .. })
        ));
    }
}
