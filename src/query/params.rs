use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::StoreRef;
use crate::index::backend::FIELD_TEXT;

pub const DEFAULT_LIMIT: usize = 500;

/// 默认连接词
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Connective {
    #[default]
    Or,
    And,
}

/// `limit` 的解释方式
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitBy {
    #[default]
    Unlimited,
    /// limit 限制最终结果条数
    FinalSize,
    /// limit 限制权限检查次数
    NumberOfPermissionEvaluations,
}

/// 多语言分析模式（只透传给 handler）
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MlAnalysisMode {
    LocaleOnly,
    LocaleAndAllContainedLocales,
    AllOnly,
    ExactLanguage,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortBy {
    /// 按字段值（列名同 SQL 投影，如 `cm:name`）
    Field(String),
    Score,
    Document,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortDefinition {
    pub by: SortBy,
    pub ascending: bool,
}

impl SortDefinition {
    pub fn field(name: &str, ascending: bool) -> Self {
        Self {
            by: SortBy::Field(name.to_string()),
            ascending,
        }
    }

    pub fn score_descending() -> Self {
        Self {
            by: SortBy::Score,
            ascending: false,
        }
    }
}

/// 调用方提交的查询参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParameters {
    pub language: String,
    pub query: String,
    pub stores: Vec<StoreRef>,
    pub default_fts_operator: Connective,
    pub default_fts_field_operator: Connective,
    pub skip_count: usize,
    /// None = 不限
    pub max_items: Option<usize>,
    pub limit: usize,
    pub limit_by: LimitBy,
    pub max_permission_checks: Option<usize>,
    pub max_permission_check_time_millis: Option<u64>,
    pub locales: Vec<String>,
    pub ml_analysis_mode: Option<MlAnalysisMode>,
    pub exclude_data_in_current_transaction: bool,
    pub bulk_fetch_batch_size: usize,
    pub sort: Vec<SortDefinition>,
    pub default_field_name: String,
}

impl Default for SearchParameters {
    fn default() -> Self {
        Self {
            language: String::new(),
            query: String::new(),
            stores: Vec::new(),
            default_fts_operator: Connective::Or,
            default_fts_field_operator: Connective::Or,
            skip_count: 0,
            max_items: None,
            limit: DEFAULT_LIMIT,
            limit_by: LimitBy::Unlimited,
            max_permission_checks: None,
            max_permission_check_time_millis: None,
            locales: Vec::new(),
            ml_analysis_mode: None,
            exclude_data_in_current_transaction: false,
            bulk_fetch_batch_size: 1000,
            sort: Vec::new(),
            default_field_name: FIELD_TEXT.to_string(),
        }
    }
}

impl SearchParameters {
    pub fn new(language: &str, query: &str, store: StoreRef) -> Self {
        Self {
            language: language.to_string(),
            query: query.to_string(),
            stores: vec![store],
            ..Default::default()
        }
    }
}

/// handler 内部使用的规范化选项
#[derive(Clone, Debug, PartialEq)]
pub struct QueryOptions {
    pub query: String,
    pub stores: Vec<StoreRef>,
    pub default_connective: Connective,
    pub default_field_connective: Connective,
    pub default_field: String,
    pub skip: usize,
    pub max_items: Option<usize>,
    pub max_permission_checks: Option<usize>,
    pub max_permission_check_time: Option<Duration>,
    pub locales: Vec<String>,
    pub ml_analysis_mode: Option<MlAnalysisMode>,
    pub exclude_transaction_data: bool,
    pub batch_size: usize,
    pub sort: Vec<SortDefinition>,
}

impl QueryOptions {
    pub fn from_params(params: &SearchParameters) -> Self {
        let mut max_items = params.max_items;
        let mut max_permission_checks = params.max_permission_checks;
        match params.limit_by {
            LimitBy::Unlimited => {}
            LimitBy::FinalSize => {
                max_items = Some(max_items.map_or(params.limit, |m| m.min(params.limit)));
            }
            LimitBy::NumberOfPermissionEvaluations => {
                max_permission_checks = Some(
                    max_permission_checks.map_or(params.limit, |m| m.min(params.limit)),
                );
            }
        }

        let default_field = if params.default_field_name.trim().is_empty() {
            FIELD_TEXT.to_string()
        } else {
            params.default_field_name.clone()
        };

        Self {
            query: params.query.clone(),
            stores: params.stores.clone(),
            default_connective: params.default_fts_operator,
            default_field_connective: params.default_fts_field_operator,
            default_field,
            skip: params.skip_count,
            max_items,
            max_permission_checks,
            max_permission_check_time: params
                .max_permission_check_time_millis
                .map(Duration::from_millis),
            locales: params.locales.clone(),
            ml_analysis_mode: params.ml_analysis_mode,
            exclude_transaction_data: params.exclude_data_in_current_transaction,
            batch_size: params.bulk_fetch_batch_size.max(1),
            sort: params.sort.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_search_parameter_contract() {
        let p = SearchParameters::default();
        assert_eq!(p.limit, 500);
        assert_eq!(p.max_items, None);
        assert_eq!(p.skip_count, 0);
        assert_eq!(p.default_fts_operator, Connective::Or);
        assert_eq!(p.default_field_name, "TEXT");
        assert_eq!(p.limit_by, LimitBy::Unlimited);
    }

    #[test]
    fn limit_by_final_size_caps_max_items() {
        let mut p = SearchParameters::new("fts-alfresco", "x", StoreRef::new("s"));
        p.limit = 10;
        p.limit_by = LimitBy::FinalSize;
        assert_eq!(QueryOptions::from_params(&p).max_items, Some(10));

        p.max_items = Some(3);
        assert_eq!(QueryOptions::from_params(&p).max_items, Some(3));
    }

    #[test]
    fn limit_by_permission_evaluations_caps_checks() {
        let mut p = SearchParameters::default();
        p.limit = 7;
        p.limit_by = LimitBy::NumberOfPermissionEvaluations;
        let o = QueryOptions::from_params(&p);
        assert_eq!(o.max_permission_checks, Some(7));
        assert_eq!(o.max_items, None);
    }
}
