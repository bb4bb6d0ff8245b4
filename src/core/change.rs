use serde::{Deserialize, Serialize};

use crate::core::types::{NodeKind, Properties, QName, SnapshotId};

/// 内容存储在某个版本下对节点的描述
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub path: String,
    pub version: SnapshotId,
    pub kind: NodeKind,
    pub qname: QName,
    #[serde(default)]
    pub properties: Properties,
    /// 正文（已抽取的纯文本）
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub deleted: bool,
}

impl NodeDescriptor {
    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// 两个快照之间某路径的差异
#[derive(Clone, Debug, PartialEq)]
pub struct Difference {
    pub path: String,
    pub before: Option<NodeDescriptor>,
    pub after: Option<NodeDescriptor>,
}

/// 差异 → 索引动作
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangeAction {
    /// 新节点：索引自身，目录还需递归索引子树
    Create { directory: bool },
    /// 本次快照删除
    Delete,
    /// 两侧都是已删除状态，无需处理
    Nothing,
    /// 其余情况一律重建
    Reindex { directory: bool },
}

impl Difference {
    pub fn action(&self) -> ChangeAction {
        let before = self.before.as_ref();
        let after = self.after.as_ref();
        match (before, after) {
            (None, Some(dst)) if !dst.deleted => ChangeAction::Create {
                directory: dst.is_directory(),
            },
            (None, _) => ChangeAction::Nothing,
            (Some(src), dst) if !src.deleted && dst.map_or(true, |d| d.deleted) => {
                ChangeAction::Delete
            }
            (Some(src), Some(dst)) if src.deleted && dst.deleted => ChangeAction::Nothing,
            (Some(_), Some(dst)) => ChangeAction::Reindex {
                directory: dst.is_directory(),
            },
            (Some(_), None) => ChangeAction::Nothing,
        }
    }

    pub fn is_deletion(&self) -> bool {
        matches!(self.action(), ChangeAction::Delete | ChangeAction::Nothing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::NodeKind;

    fn desc(path: &str, kind: NodeKind, deleted: bool) -> NodeDescriptor {
        NodeDescriptor {
            path: path.to_string(),
            version: 1,
            kind,
            qname: QName::content(path.trim_start_matches('/')),
            properties: Properties::new(),
            content: None,
            deleted,
        }
    }

    #[test]
    fn classify_differences() {
        let created = Difference {
            path: "/d".into(),
            before: None,
            after: Some(desc("/d", NodeKind::Directory, false)),
        };
        assert_eq!(created.action(), ChangeAction::Create { directory: true });

        let deleted = Difference {
            path: "/f".into(),
            before: Some(desc("/f", NodeKind::File, false)),
            after: None,
        };
        assert_eq!(deleted.action(), ChangeAction::Delete);
        assert!(deleted.is_deletion());

        let tombstoned = Difference {
            path: "/f".into(),
            before: Some(desc("/f", NodeKind::File, false)),
            after: Some(desc("/f", NodeKind::File, true)),
        };
        assert_eq!(tombstoned.action(), ChangeAction::Delete);

        let both_deleted = Difference {
            path: "/f".into(),
            before: Some(desc("/f", NodeKind::File, true)),
            after: Some(desc("/f", NodeKind::File, true)),
        };
        assert_eq!(both_deleted.action(), ChangeAction::Nothing);

        let modified = Difference {
            path: "/f".into(),
            before: Some(desc("/f", NodeKind::File, false)),
            after: Some(desc("/f", NodeKind::File, false)),
        };
        assert_eq!(modified.action(), ChangeAction::Reindex { directory: false });
        assert!(!modified.is_deletion());
    }
}
