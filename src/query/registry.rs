use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::error::QueryError;
use crate::query::fts::FtsLanguage;
use crate::query::language::{IndexContext, QueryLanguage};
use crate::query::params::SearchParameters;
use crate::query::result::ResultSet;
use crate::query::sql::SqlLanguage;

pub type LanguageMap = HashMap<String, Arc<dyn QueryLanguage>>;

/// 查询语言注册表（copy-on-write）：
/// - 读路径 `load()` 无锁
/// - 写路径复制整表后原子替换，写者之间用 Mutex 串行
/// - key 为小写名字，后注册者覆盖先注册者
pub struct QueryRegistry {
    languages: ArcSwap<LanguageMap>,
    write: Mutex<()>,
}

impl Default for QueryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self {
            languages: ArcSwap::from_pointee(HashMap::new()),
            write: Mutex::new(()),
        }
    }

    /// 注册内置语言：fts-alfresco / lucene / cmis-strict / cmis-alfresco
    pub fn with_builtin(ctx: IndexContext) -> Self {
        let reg = Self::new();
        reg.register(Arc::new(FtsLanguage::new(ctx.clone())));
        reg.register(Arc::new(FtsLanguage::named("lucene", ctx.clone())));
        reg.register(Arc::new(SqlLanguage::strict(ctx.clone())));
        reg.register(Arc::new(SqlLanguage::extended(ctx)));
        reg
    }

    pub fn register(&self, language: Arc<dyn QueryLanguage>) {
        let key = language.name().to_lowercase();
        let _g = self.write.lock();
        let mut next = (**self.languages.load()).clone();
        if next.insert(key.clone(), language).is_some() {
            tracing::info!("Query language re-registered: {}", key);
        } else {
            tracing::debug!("Query language registered: {}", key);
        }
        self.languages.store(Arc::new(next));
    }

    /// 当前注册表的快照（无序）
    pub fn languages(&self) -> Arc<LanguageMap> {
        self.languages.load_full()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn QueryLanguage>> {
        self.languages.load().get(&name.to_lowercase()).cloned()
    }

    /// 大小写不敏感地分发；未知语言直接报错，不触碰任何后端
    pub fn execute(
        &self,
        language: &str,
        params: &SearchParameters,
    ) -> Result<Box<dyn ResultSet>, QueryError> {
        let handler = self
            .get(language)
            .ok_or_else(|| QueryError::UnknownLanguage(language.to_string()))?;
        handler.execute(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::json::JsonResultSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    impl QueryLanguage for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn execute(&self, _params: &SearchParameters) -> Result<Box<dyn ResultSet>, QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(JsonResultSet::empty()))
        }
    }

    fn probe(name: &'static str) -> (Arc<Probe>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Probe {
                name,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    #[test]
    fn names_differing_in_case_collapse_to_last_registration() {
        let reg = QueryRegistry::new();
        let (upper, upper_calls) = probe("FTS");
        let (lower, lower_calls) = probe("fts");
        reg.register(upper);
        reg.register(lower);

        assert_eq!(reg.languages().len(), 1);
        reg.execute("Fts", &SearchParameters::default()).unwrap();
        assert_eq!(upper_calls.load(Ordering::SeqCst), 0);
        assert_eq!(lower_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_language_touches_no_handler() {
        let reg = QueryRegistry::new();
        let (p, calls) = probe("fts");
        reg.register(p);

        let err = match reg.execute("nonexistent", &SearchParameters::default()) {
            Err(e) => e,
            Ok(_) => panic!("expected unknown language"),
        };
        assert!(matches!(err, QueryError::UnknownLanguage(ref n) if n == "nonexistent"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn earlier_snapshots_are_unaffected_by_later_registration() {
        let reg = QueryRegistry::new();
        let (a, _) = probe("a");
        reg.register(a);
        let snap = reg.languages();
        let (b, _) = probe("b");
        reg.register(b);
        assert_eq!(snap.len(), 1);
        assert_eq!(reg.languages().len(), 2);
    }
}
