//! CMIS 风格的 SQL：
//!
//! ```text
//! SELECT * | col [, col]* FROM type [alias]
//!   [WHERE predicate]
//!   [ORDER BY col [ASC|DESC] [, ...]]
//! ```
//!
//! 谓词支持比较、LIKE、IN、IS [NOT] NULL、CONTAINS、IN_FOLDER、IN_TREE，
//! 以及 AND / OR / NOT 与括号。
//!
//! - `cmis-strict`：只允许 `cmis:` 列与 `cmis:document`/`cmis:folder`，最多一个 CONTAINS
//! - `cmis-alfresco`：额外允许属性列（`cm:title`）与 `cm:content`/`cm:folder`

use std::cmp::Ordering;
use std::collections::HashMap;
use std::time::Instant;

use regex::Regex;
use roaring::RoaringBitmap;
use serde_json::Value;

use crate::core::is_descendant;
use crate::error::QueryError;
use crate::index::backend::{IndexSearcher, FIELD_PARENT, FIELD_TYPE};
use crate::query::fts::FtsQuery;
use crate::query::language::{IndexContext, QueryLanguage};
use crate::query::params::{QueryOptions, SearchParameters, SortBy, SortDefinition};
use crate::query::result::{document_value, Hit, ResultSet};

pub const CMIS_STRICT: &str = "cmis-strict";
pub const CMIS_ALFRESCO: &str = "cmis-alfresco";

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SqlToken {
    kind: SqlTokenKind,
    position: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum SqlTokenKind {
    Ident(String),
    Str(String),
    Number(f64),
    Comma,
    LParen,
    RParen,
    Star,
    Op(CompareOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | ':' | '.')
}

fn tokenize_sql(input: &str) -> Result<Vec<SqlToken>, QueryError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        let next = chars.get(i + 1).map(|x| x.1);
        let (kind, width) = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            ',' => (SqlTokenKind::Comma, 1),
            '(' => (SqlTokenKind::LParen, 1),
            ')' => (SqlTokenKind::RParen, 1),
            '*' => (SqlTokenKind::Star, 1),
            '=' => (SqlTokenKind::Op(CompareOp::Eq), 1),
            '<' if next == Some('>') => (SqlTokenKind::Op(CompareOp::Ne), 2),
            '<' if next == Some('=') => (SqlTokenKind::Op(CompareOp::Le), 2),
            '<' => (SqlTokenKind::Op(CompareOp::Lt), 1),
            '>' if next == Some('=') => (SqlTokenKind::Op(CompareOp::Ge), 2),
            '>' => (SqlTokenKind::Op(CompareOp::Gt), 1),
            '!' if next == Some('=') => (SqlTokenKind::Op(CompareOp::Ne), 2),
            '\'' => {
                // '' 与 \' 都是转义的单引号
                let mut text = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let ch = chars[j].1;
                    let after = chars.get(j + 1).map(|x| x.1);
                    if ch == '\\' && after == Some('\'') {
                        text.push('\'');
                        j += 2;
                    } else if ch == '\'' && after == Some('\'') {
                        text.push('\'');
                        j += 2;
                    } else if ch == '\'' {
                        closed = true;
                        j += 1;
                        break;
                    } else {
                        text.push(ch);
                        j += 1;
                    }
                }
                if !closed {
                    return Err(QueryError::parse(input, Some(pos), "unterminated string literal"));
                }
                tokens.push(SqlToken {
                    kind: SqlTokenKind::Str(text),
                    position: pos,
                });
                i = j;
                continue;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let mut j = i + 1;
                while j < chars.len() && (chars[j].1.is_ascii_digit() || chars[j].1 == '.') {
                    j += 1;
                }
                let end = chars.get(j).map_or(input.len(), |x| x.0);
                let n = input[pos..end]
                    .parse::<f64>()
                    .map_err(|_| QueryError::parse(input, Some(pos), "invalid number"))?;
                tokens.push(SqlToken {
                    kind: SqlTokenKind::Number(n),
                    position: pos,
                });
                i = j;
                continue;
            }
            c if is_ident_char(c) => {
                let mut j = i;
                while j < chars.len() && is_ident_char(chars[j].1) {
                    j += 1;
                }
                let end = chars.get(j).map_or(input.len(), |x| x.0);
                tokens.push(SqlToken {
                    kind: SqlTokenKind::Ident(input[pos..end].to_string()),
                    position: pos,
                });
                i = j;
                continue;
            }
            other => {
                return Err(QueryError::parse(
                    input,
                    Some(pos),
                    format!("unexpected character '{}'", other),
                ))
            }
        };
        tokens.push(SqlToken {
            kind,
            position: pos,
        });
        i += width;
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Text(String),
    Number(f64),
    Bool(bool),
}

#[derive(Debug, Clone)]
pub enum Predicate {
    Compare {
        column: String,
        op: CompareOp,
        value: Literal,
    },
    Like {
        column: String,
        pattern: Regex,
        negated: bool,
    },
    In {
        column: String,
        values: Vec<Literal>,
        negated: bool,
    },
    IsNull {
        column: String,
        negated: bool,
    },
    Contains(FtsQuery),
    InFolder(String),
    InTree(String),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    fn contains_count(&self) -> usize {
        match self {
            Predicate::Contains(_) => 1,
            Predicate::And(a, b) | Predicate::Or(a, b) => a.contains_count() + b.contains_count(),
            Predicate::Not(p) => p.contains_count(),
            _ => 0,
        }
    }

    fn collect_contains<'a>(&'a self, out: &mut Vec<&'a FtsQuery>) {
        match self {
            Predicate::Contains(q) => out.push(q),
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.collect_contains(out);
                b.collect_contains(out);
            }
            // NOT CONTAINS 不参与打分
            _ => {}
        }
    }
}

/// 查询的对象类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Document,
    Folder,
}

impl ObjectType {
    fn type_term(self) -> &'static str {
        match self {
            ObjectType::Document => "file",
            ObjectType::Folder => "directory",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlQuery {
    /// None = `SELECT *`
    pub columns: Option<Vec<String>>,
    pub object_type: ObjectType,
    pub predicate: Option<Predicate>,
    pub order: Vec<SortDefinition>,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Strict,
    Extended,
}

struct SqlParser<'a> {
    input: &'a str,
    tokens: Vec<SqlToken>,
    index: usize,
    dialect: Dialect,
    alias: Option<String>,
    opts: &'a QueryOptions,
}

impl<'a> SqlParser<'a> {
    fn peek(&self) -> Option<&SqlTokenKind> {
        self.tokens.get(self.index).map(|t| &t.kind)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.index)
            .map_or(self.input.len(), |t| t.position)
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        QueryError::parse(self.input, Some(self.position()), message)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(SqlTokenKind::Ident(s)) if s.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), QueryError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}", keyword)))
        }
    }

    fn expect(&mut self, kind: SqlTokenKind, what: &str) -> Result<(), QueryError> {
        if self.peek() == Some(&kind) {
            self.index += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn ident(&mut self) -> Result<String, QueryError> {
        match self.peek() {
            Some(SqlTokenKind::Ident(s)) if !is_reserved(s) => {
                let s = s.clone();
                self.index += 1;
                Ok(s)
            }
            _ => Err(self.error("expected identifier")),
        }
    }

    fn string(&mut self) -> Result<String, QueryError> {
        match self.peek() {
            Some(SqlTokenKind::Str(s)) => {
                let s = s.clone();
                self.index += 1;
                Ok(s)
            }
            _ => Err(self.error("expected string literal")),
        }
    }

    /// 去掉 `alias.` 前缀，并按方言校验列名
    fn column(&mut self) -> Result<String, QueryError> {
        let position = self.position();
        let raw = self.ident()?;
        let name = match raw.split_once('.') {
            Some((qualifier, rest)) if self.alias.as_deref().map_or(true, |a| a == qualifier) => {
                rest.to_string()
            }
            _ => raw.clone(),
        };
        if self.dialect == Dialect::Strict && !name.starts_with("cmis:") {
            return Err(QueryError::parse(
                self.input,
                Some(position),
                format!("column {} is not a cmis property", name),
            ));
        }
        Ok(name)
    }

    fn parse_query(&mut self) -> Result<SqlQuery, QueryError> {
        self.expect_keyword("SELECT")?;

        // 先跳过投影，等 FROM 读到别名后再回来解析列
        let select_start = self.index;
        while self.peek().is_some() && !self.peek_keyword("FROM") {
            self.index += 1;
        }
        self.expect_keyword("FROM")?;
        let type_position = self.position();
        let type_name = self.ident()?;
        let object_type = match (type_name.as_str(), self.dialect) {
            ("cmis:document", _) | ("cm:content", Dialect::Extended) => ObjectType::Document,
            ("cmis:folder", _) | ("cm:folder", Dialect::Extended) => ObjectType::Folder,
            _ => {
                return Err(QueryError::parse(
                    self.input,
                    Some(type_position),
                    format!("unknown object type {}", type_name),
                ))
            }
        };
        self.eat_keyword("AS");
        if let Some(SqlTokenKind::Ident(s)) = self.peek() {
            if !is_reserved(s) {
                self.alias = Some(s.clone());
                self.index += 1;
            }
        }
        let after_from = self.index;

        self.index = select_start;
        let columns = if self.peek() == Some(&SqlTokenKind::Star) {
            self.index += 1;
            None
        } else {
            let mut cols = vec![self.column()?];
            while self.peek() == Some(&SqlTokenKind::Comma) {
                self.index += 1;
                cols.push(self.column()?);
            }
            Some(cols)
        };
        if !self.peek_keyword("FROM") {
            return Err(self.error("expected FROM"));
        }
        self.index = after_from;

        let predicate = if self.eat_keyword("WHERE") {
            Some(self.parse_or()?)
        } else {
            None
        };

        let mut order = Vec::new();
        if self.eat_keyword("ORDER") {
            self.expect_keyword("BY")?;
            loop {
                let by = if self.eat_keyword("SEARCH_SCORE") {
                    SortBy::Score
                } else {
                    SortBy::Field(self.column()?)
                };
                let ascending = if self.eat_keyword("DESC") {
                    false
                } else {
                    self.eat_keyword("ASC");
                    true
                };
                order.push(SortDefinition { by, ascending });
                if self.peek() != Some(&SqlTokenKind::Comma) {
                    break;
                }
                self.index += 1;
            }
        }

        if self.peek().is_some() {
            return Err(self.error("unexpected token"));
        }

        if self.dialect == Dialect::Strict
            && predicate.as_ref().map_or(0, |p| p.contains_count()) > 1
        {
            return Err(QueryError::parse(
                self.input,
                None,
                "at most one CONTAINS is allowed",
            ));
        }

        Ok(SqlQuery {
            columns,
            object_type,
            predicate,
            order,
        })
    }

    fn parse_or(&mut self) -> Result<Predicate, QueryError> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("OR") {
            let right = self.parse_and()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate, QueryError> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("AND") {
            let right = self.parse_not()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Predicate, QueryError> {
        if self.eat_keyword("NOT") {
            return Ok(Predicate::Not(Box::new(self.parse_not()?)));
        }
        self.parse_primary()
    }

    /// `FN([alias,] 'arg')`
    fn function_argument(&mut self) -> Result<String, QueryError> {
        self.expect(SqlTokenKind::LParen, "(")?;
        if let Some(SqlTokenKind::Ident(_)) = self.peek() {
            self.index += 1;
            self.expect(SqlTokenKind::Comma, ",")?;
        }
        let arg = self.string()?;
        self.expect(SqlTokenKind::RParen, ")")?;
        Ok(arg)
    }

    fn parse_primary(&mut self) -> Result<Predicate, QueryError> {
        if self.peek() == Some(&SqlTokenKind::LParen) {
            self.index += 1;
            let p = self.parse_or()?;
            self.expect(SqlTokenKind::RParen, ")")?;
            return Ok(p);
        }
        if self.eat_keyword("CONTAINS") {
            let position = self.position();
            let text = self.function_argument()?;
            let q = FtsQuery::parse(
                &text,
                &self.opts.default_field,
                self.opts.default_connective,
                self.opts.default_field_connective,
            )
            .map_err(|e| match e {
                QueryError::Parse { message, .. } => QueryError::parse(
                    self.input,
                    Some(position),
                    format!("in CONTAINS: {}", message),
                ),
                other => other,
            })?;
            return Ok(Predicate::Contains(q));
        }
        if self.eat_keyword("IN_FOLDER") {
            return Ok(Predicate::InFolder(folder_path(&self.function_argument()?)));
        }
        if self.eat_keyword("IN_TREE") {
            return Ok(Predicate::InTree(folder_path(&self.function_argument()?)));
        }

        let column = self.column()?;
        if let Some(SqlTokenKind::Op(op)) = self.peek() {
            let op = *op;
            self.index += 1;
            let value = self.literal()?;
            return Ok(Predicate::Compare { column, op, value });
        }

        let negated = self.eat_keyword("NOT");
        if self.eat_keyword("LIKE") {
            let position = self.position();
            let raw = self.string()?;
            let pattern = like_regex(&raw).map_err(|e| {
                QueryError::parse(self.input, Some(position), format!("invalid LIKE pattern: {}", e))
            })?;
            return Ok(Predicate::Like {
                column,
                pattern,
                negated,
            });
        }
        if self.eat_keyword("IN") {
            self.expect(SqlTokenKind::LParen, "(")?;
            let mut values = vec![self.literal()?];
            while self.peek() == Some(&SqlTokenKind::Comma) {
                self.index += 1;
                values.push(self.literal()?);
            }
            self.expect(SqlTokenKind::RParen, ")")?;
            return Ok(Predicate::In {
                column,
                values,
                negated,
            });
        }
        if !negated && self.eat_keyword("IS") {
            let negated = self.eat_keyword("NOT");
            self.expect_keyword("NULL")?;
            return Ok(Predicate::IsNull { column, negated });
        }
        Err(self.error("expected comparison"))
    }

    fn literal(&mut self) -> Result<Literal, QueryError> {
        match self.peek().cloned() {
            Some(SqlTokenKind::Str(s)) => {
                self.index += 1;
                Ok(Literal::Text(s))
            }
            Some(SqlTokenKind::Number(n)) => {
                self.index += 1;
                Ok(Literal::Number(n))
            }
            Some(SqlTokenKind::Ident(s)) if s.eq_ignore_ascii_case("TRUE") => {
                self.index += 1;
                Ok(Literal::Bool(true))
            }
            Some(SqlTokenKind::Ident(s)) if s.eq_ignore_ascii_case("FALSE") => {
                self.index += 1;
                Ok(Literal::Bool(false))
            }
            _ => Err(self.error("expected literal")),
        }
    }
}

const RESERVED: &[&str] = &[
    "SELECT", "FROM", "WHERE", "ORDER", "BY", "ASC", "DESC", "AND", "OR", "NOT", "LIKE", "IN",
    "IS", "NULL", "AS", "TRUE", "FALSE", "CONTAINS", "IN_FOLDER", "IN_TREE",
];

fn is_reserved(s: &str) -> bool {
    RESERVED.iter().any(|k| k.eq_ignore_ascii_case(s))
}

/// 参数可以是 objectId（`store:/path`）或路径
fn folder_path(arg: &str) -> String {
    match arg.find(":/") {
        Some(i) => arg[i + 1..].to_string(),
        None => arg.to_string(),
    }
}

/// `%` → 任意串，`_` → 单字符，`\` 转义
fn like_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::from("^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            '\\' => {
                if let Some(n) = chars.next() {
                    re.push_str(&regex::escape(&n.to_string()));
                }
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

impl SqlQuery {
    pub fn parse(input: &str, dialect: Dialect, opts: &QueryOptions) -> Result<Self, QueryError> {
        let tokens = tokenize_sql(input)?;
        if tokens.is_empty() {
            return Err(QueryError::parse(input, None, "empty query"));
        }
        SqlParser {
            input,
            tokens,
            index: 0,
            dialect,
            alias: None,
            opts,
        }
        .parse_query()
    }

    /// 对一个 searcher 求值：类型过滤后逐谓词收窄
    pub fn hits(&self, source: usize, s: &dyn IndexSearcher) -> Vec<Hit> {
        let base = s.term_docs(FIELD_TYPE, self.object_type.type_term());
        let docs = match &self.predicate {
            Some(p) => eval(p, s, &base),
            None => base,
        };

        let mut contains = Vec::new();
        if let Some(p) = &self.predicate {
            p.collect_contains(&mut contains);
        }
        let mut scores: HashMap<u32, f32> = HashMap::new();
        for q in contains {
            for h in q.hits(source, s) {
                *scores.entry(h.doc).or_insert(0.0) += h.score;
            }
        }

        docs.iter()
            .map(|doc| Hit {
                source,
                doc,
                score: scores.get(&doc).copied().unwrap_or(1.0),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(p: &Predicate, s: &dyn IndexSearcher, candidates: &RoaringBitmap) -> RoaringBitmap {
    match p {
        Predicate::And(a, b) => {
            let left = eval(a, s, candidates);
            eval(b, s, &left)
        }
        Predicate::Or(a, b) => eval(a, s, candidates) | eval(b, s, candidates),
        Predicate::Not(inner) => candidates - eval(inner, s, candidates),
        Predicate::Contains(q) => candidates & q.matches(s),
        Predicate::InFolder(path) => candidates & s.term_docs(FIELD_PARENT, path),
        Predicate::InTree(path) => filter_docs(s, candidates, |d| is_descendant(&d.node.path, path)),
        Predicate::Compare { column, op, value } => filter_docs(s, candidates, |d| {
            document_value(d, column).is_some_and(|v| any_value(&v, |x| compare(x, *op, value)))
        }),
        Predicate::Like {
            column,
            pattern,
            negated,
        } => filter_docs(s, candidates, |d| {
            let hit = document_value(d, column)
                .is_some_and(|v| any_value(&v, |x| x.as_str().is_some_and(|t| pattern.is_match(t))));
            hit != *negated
        }),
        Predicate::In {
            column,
            values,
            negated,
        } => filter_docs(s, candidates, |d| {
            let hit = document_value(d, column).is_some_and(|v| {
                any_value(&v, |x| values.iter().any(|l| compare(x, CompareOp::Eq, l)))
            });
            hit != *negated
        }),
        Predicate::IsNull { column, negated } => filter_docs(s, candidates, |d| {
            let null = matches!(document_value(d, column), None | Some(Value::Null));
            null != *negated
        }),
    }
}

fn filter_docs<F>(s: &dyn IndexSearcher, candidates: &RoaringBitmap, keep: F) -> RoaringBitmap
where
    F: Fn(&crate::index::backend::Document) -> bool,
{
    candidates
        .iter()
        .filter(|id| s.document(*id).is_some_and(|d| keep(&d)))
        .collect()
}

/// 多值属性：任一元素满足即可
fn any_value<F: Fn(&Value) -> bool>(v: &Value, f: F) -> bool {
    match v {
        Value::Array(items) => items.iter().any(&f),
        other => f(other),
    }
}

fn compare(v: &Value, op: CompareOp, lit: &Literal) -> bool {
    let ord = match (v, lit) {
        (Value::Number(n), Literal::Number(l)) => n.as_f64().and_then(|x| x.partial_cmp(l)),
        (Value::String(s), Literal::Number(l)) => s.parse::<f64>().ok().and_then(|x| x.partial_cmp(l)),
        (Value::String(s), Literal::Text(l)) => Some(s.as_str().cmp(l.as_str())),
        (Value::Number(n), Literal::Text(l)) => {
            let x = n.as_f64();
            l.parse::<f64>().ok().zip(x).and_then(|(l, x)| x.partial_cmp(&l))
        }
        (Value::Bool(b), Literal::Bool(l)) => Some(b.cmp(l)),
        _ => None,
    };
    let Some(ord) = ord else {
        return false;
    };
    match op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
    }
}

// ---------------------------------------------------------------------------
// Language handler
// ---------------------------------------------------------------------------

pub struct SqlLanguage {
    name: &'static str,
    dialect: Dialect,
    ctx: IndexContext,
}

impl SqlLanguage {
    pub fn strict(ctx: IndexContext) -> Self {
        Self {
            name: CMIS_STRICT,
            dialect: Dialect::Strict,
            ctx,
        }
    }

    pub fn extended(ctx: IndexContext) -> Self {
        Self {
            name: CMIS_ALFRESCO,
            dialect: Dialect::Extended,
            ctx,
        }
    }
}

impl QueryLanguage for SqlLanguage {
    fn name(&self) -> &str {
        self.name
    }

    fn execute(&self, params: &SearchParameters) -> Result<Box<dyn ResultSet>, QueryError> {
        let started = Instant::now();
        let mut opts = QueryOptions::from_params(params);
        let query = SqlQuery::parse(&opts.query, self.dialect, &opts)?;
        if opts.sort.is_empty() {
            opts.sort = query.order.clone();
        }
        let searchers = self.ctx.searchers(self.name, &opts.stores)?;

        let hits: Vec<Hit> = searchers
            .iter()
            .enumerate()
            .flat_map(|(i, s)| query.hits(i, s.as_ref()))
            .collect();
        tracing::debug!("{}: {:?} matched {} docs", self.name, opts.query, hits.len());
        Ok(self
            .ctx
            .finish(searchers, hits, &opts, query.columns.clone(), started))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChildAssocRef, NodeKind, NodeRef, Properties, PropertyValue, QName, StoreRef};
    use crate::index::backend::{DocOp, Document, IndexBackend};
    use crate::index::memory::MemoryBackend;
    use std::sync::Arc;

    fn node(s: &StoreRef, path: &str, kind: NodeKind, title: &str, content: Option<&str>) -> Document {
        let (parent, name) = crate::core::split_path(path);
        let mut properties = Properties::new();
        properties.insert("cm:title".into(), PropertyValue::Text(title.into()));
        properties.insert("cm:rating".into(), PropertyValue::Int(title.len() as i64));
        Document {
            node: NodeRef::new(s.clone(), path),
            qname: QName::content(name),
            parent: parent.map(|p| ChildAssocRef {
                parent: NodeRef::new(s.clone(), p),
                child: NodeRef::new(s.clone(), path),
                qname: QName::content(name),
            }),
            kind,
            snapshot: 1,
            properties,
            content: content.map(str::to_string),
        }
    }

    fn fixture() -> (Arc<MemoryBackend>, StoreRef) {
        let b = Arc::new(MemoryBackend::in_memory());
        let s = StoreRef::new("site");
        b.create_store(&s).unwrap();
        b.stage(
            &s,
            1,
            vec![
                DocOp::Upsert(node(&s, "/reports", NodeKind::Directory, "Reports", None)),
                DocOp::Upsert(node(&s, "/reports/2024", NodeKind::Directory, "Year", None)),
                DocOp::Upsert(node(&s, "/reports/q1.txt", NodeKind::File, "Quarterly", Some("revenue grew"))),
                DocOp::Upsert(node(&s, "/reports/2024/q2.txt", NodeKind::File, "Quarter", Some("revenue fell"))),
                DocOp::Upsert(node(&s, "/todo.txt", NodeKind::File, "Todo", Some("buy milk"))),
            ],
        )
        .unwrap();
        b.publish(&s, 1).unwrap();
        (b, s)
    }

    fn names(b: &Arc<MemoryBackend>, s: &StoreRef, lang: &str, q: &str) -> Vec<String> {
        let ctx = IndexContext::new(b.clone());
        let handler = if lang == CMIS_STRICT {
            SqlLanguage::strict(ctx)
        } else {
            SqlLanguage::extended(ctx)
        };
        let rs = handler
            .execute(&SearchParameters::new(lang, q, s.clone()))
            .unwrap();
        let set: &dyn ResultSet = rs.as_ref();
        set.cursor()
            .map(|r| r.unwrap().qualified_name().unwrap().local.clone())
            .collect()
    }

    fn parse_err(dialect: Dialect, q: &str) -> QueryError {
        let opts = QueryOptions::from_params(&SearchParameters::default());
        SqlQuery::parse(q, dialect, &opts).unwrap_err()
    }

    #[test]
    fn type_filter_and_order_by() {
        let (b, s) = fixture();
        assert_eq!(
            names(&b, &s, CMIS_STRICT, "SELECT * FROM cmis:document ORDER BY cmis:name DESC"),
            vec!["todo.txt", "q2.txt", "q1.txt"]
        );
        assert_eq!(
            names(&b, &s, CMIS_STRICT, "SELECT cmis:name FROM cmis:folder ORDER BY cmis:name"),
            vec!["2024", "reports"]
        );
    }

    #[test]
    fn folder_and_tree_predicates() {
        let (b, s) = fixture();
        assert_eq!(
            names(&b, &s, CMIS_STRICT, "SELECT * FROM cmis:document WHERE IN_FOLDER('/reports')"),
            vec!["q1.txt"]
        );
        assert_eq!(
            names(
                &b,
                &s,
                CMIS_STRICT,
                "SELECT * FROM cmis:document d WHERE IN_TREE(d, 'site:/reports') ORDER BY d.cmis:name"
            ),
            vec!["q1.txt", "q2.txt"]
        );
    }

    #[test]
    fn contains_like_and_comparisons() {
        let (b, s) = fixture();
        assert_eq!(
            names(
                &b,
                &s,
                CMIS_STRICT,
                "SELECT * FROM cmis:document WHERE CONTAINS('revenue') AND cmis:name LIKE 'q_.%' ORDER BY cmis:name"
            ),
            vec!["q1.txt", "q2.txt"]
        );
        assert_eq!(
            names(
                &b,
                &s,
                CMIS_ALFRESCO,
                "SELECT cm:title FROM cm:content WHERE cm:title = 'Todo' OR cm:rating > 8"
            )
            .len(),
            2
        );
        assert_eq!(
            names(
                &b,
                &s,
                CMIS_ALFRESCO,
                "SELECT * FROM cmis:document WHERE NOT cm:title IN ('Todo', 'Quarter')"
            ),
            vec!["q1.txt"]
        );
        assert_eq!(
            names(&b, &s, CMIS_ALFRESCO, "SELECT * FROM cmis:folder WHERE cm:missing IS NULL").len(),
            2
        );
    }

    #[test]
    fn projection_limits_row_values() {
        let (b, s) = fixture();
        let lang = SqlLanguage::strict(IndexContext::new(b.clone()));
        let rs = lang
            .execute(&SearchParameters::new(
                CMIS_STRICT,
                "SELECT cmis:name, cmis:path FROM cmis:document WHERE cmis:name = 'todo.txt'",
                s.clone(),
            ))
            .unwrap();
        assert_eq!(rs.len(), 1);
        let row = rs.row(0).unwrap();
        assert_eq!(row.values().len(), 2);
        assert_eq!(row.value("cmis:path"), Some(&Value::String("/todo.txt".into())));
    }

    #[test]
    fn strict_dialect_rejects_extensions() {
        assert!(matches!(
            parse_err(Dialect::Strict, "SELECT cm:title FROM cmis:document"),
            QueryError::Parse { position: Some(7), .. }
        ));
        assert!(matches!(
            parse_err(Dialect::Strict, "SELECT * FROM cm:content"),
            QueryError::Parse { .. }
        ));
        assert!(matches!(
            parse_err(
                Dialect::Strict,
                "SELECT * FROM cmis:document WHERE CONTAINS('a') AND CONTAINS('b')"
            ),
            QueryError::Parse { .. }
        ));
        let opts = QueryOptions::from_params(&SearchParameters::default());
        assert!(SqlQuery::parse(
            "SELECT * FROM cmis:document WHERE CONTAINS('a') AND CONTAINS('b')",
            Dialect::Extended,
            &opts
        )
        .is_ok());
    }

    #[test]
    fn malformed_statements_report_position() {
        assert!(matches!(
            parse_err(Dialect::Extended, "SELECT * FROM cmis:document WHERE cmis:name = 'x"),
            QueryError::Parse { position: Some(46), .. }
        ));
        assert!(matches!(
            parse_err(Dialect::Extended, "SELECT * cmis:document"),
            QueryError::Parse { .. }
        ));
        assert!(matches!(
            parse_err(Dialect::Extended, "SELECT * FROM cmis:document WHERE"),
            QueryError::Parse { .. }
        ));
        assert!(matches!(
            parse_err(Dialect::Extended, "SELECT * FROM cmis:document WHERE CONTAINS('(a')"),
            QueryError::Parse { .. }
        ));
    }
}
