//! 原生全文检索语法：
//!
//! ```text
//! query   := or ( OR or )*           OR 也可写作 ||
//! or      := group ( AND group )*    AND 也可写作 &&
//! group   := clause+                 相邻子句按默认连接词组合
//! clause  := ( '+' | '-' | NOT | '!' )? primary
//! primary := '(' query ')' | field ':' primary | word | "phrase"
//! ```
//!
//! word 中的 `*`/`?` 是通配符；单独的 `*` 匹配全部文档。

use std::collections::HashSet;
use std::time::Instant;

use roaring::RoaringBitmap;
use wildmatch::WildMatch;

use crate::analysis::{normalize_term, tokenize_str};
use crate::core::QName;
use crate::error::QueryError;
use crate::index::backend::*;
use crate::query::language::{IndexContext, QueryLanguage};
use crate::query::params::{Connective, QueryOptions, SearchParameters};
use crate::query::result::{Hit, ResultSet};

pub const FTS_LANGUAGE: &str = "fts-alfresco";

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FtsToken {
    kind: FtsTokenKind,
    position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FtsTokenKind {
    Word(String),
    Phrase(String),
    Field(String),
    LParen,
    RParen,
    Plus,
    Minus,
    And,
    Or,
    Not,
}

fn tokenize_query(input: &str) -> Result<Vec<FtsToken>, QueryError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let push = |tokens: &mut Vec<FtsToken>, kind, position| tokens.push(FtsToken { kind, position });

    while i < chars.len() {
        let (pos, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                push(&mut tokens, FtsTokenKind::LParen, pos);
                i += 1;
            }
            ')' => {
                push(&mut tokens, FtsTokenKind::RParen, pos);
                i += 1;
            }
            '+' => {
                push(&mut tokens, FtsTokenKind::Plus, pos);
                i += 1;
            }
            '-' => {
                push(&mut tokens, FtsTokenKind::Minus, pos);
                i += 1;
            }
            '!' => {
                push(&mut tokens, FtsTokenKind::Not, pos);
                i += 1;
            }
            '&' if chars.get(i + 1).map(|x| x.1) == Some('&') => {
                push(&mut tokens, FtsTokenKind::And, pos);
                i += 2;
            }
            '|' if chars.get(i + 1).map(|x| x.1) == Some('|') => {
                push(&mut tokens, FtsTokenKind::Or, pos);
                i += 2;
            }
            '"' => {
                let mut text = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    match chars[j].1 {
                        '\\' if j + 1 < chars.len() => {
                            text.push(chars[j + 1].1);
                            j += 2;
                        }
                        '"' => {
                            closed = true;
                            j += 1;
                            break;
                        }
                        ch => {
                            text.push(ch);
                            j += 1;
                        }
                    }
                }
                if !closed {
                    return Err(QueryError::parse(input, Some(pos), "unterminated phrase"));
                }
                push(&mut tokens, FtsTokenKind::Phrase(text), pos);
                i = j;
            }
            _ => {
                let mut j = i;
                let mut word = String::new();
                while j < chars.len() {
                    let ch = chars[j].1;
                    if ch.is_whitespace() || matches!(ch, '(' | ')' | '"') {
                        break;
                    }
                    word.push(ch);
                    j += 1;
                }
                i = j;

                match word.as_str() {
                    "AND" => push(&mut tokens, FtsTokenKind::And, pos),
                    "OR" => push(&mut tokens, FtsTokenKind::Or, pos),
                    "NOT" => push(&mut tokens, FtsTokenKind::Not, pos),
                    _ => match split_field(&word) {
                        Some((field, rest)) => {
                            push(&mut tokens, FtsTokenKind::Field(field.to_string()), pos);
                            if !rest.is_empty() {
                                push(
                                    &mut tokens,
                                    FtsTokenKind::Word(rest.to_string()),
                                    pos + field.len() + 1,
                                );
                            }
                        }
                        None => push(&mut tokens, FtsTokenKind::Word(word), pos),
                    },
                }
            }
        }
    }
    Ok(tokens)
}

/// `cm:title:x` → (`cm:title`, `x`)；`ID:site:/a` → (`ID`, `site:/a`)
fn split_field(word: &str) -> Option<(&str, &str)> {
    let last = word.rfind(':')?;
    let (field, rest) = (&word[..last], &word[last + 1..]);
    if rest.starts_with('/') {
        let first = word.find(':')?;
        if first == 0 {
            return None;
        }
        return Some((&word[..first], &word[first + 1..]));
    }
    if field.is_empty() {
        return None;
    }
    Some((field, rest))
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FtsQuery {
    Term { field: String, term: String },
    Wildcard { field: String, pattern: String },
    Phrase { field: String, terms: Vec<String> },
    MatchAll,
    And(Vec<FtsQuery>),
    Or(Vec<FtsQuery>),
    Bool {
        must: Vec<FtsQuery>,
        should: Vec<FtsQuery>,
        must_not: Vec<FtsQuery>,
    },
}

/// 字段名 → 索引字段
pub fn resolve_field(name: &str) -> String {
    match name.to_ascii_uppercase().as_str() {
        "TEXT" | "ALL" => return FIELD_TEXT.to_string(),
        "ID" => return FIELD_ID.to_string(),
        "PATH" => return FIELD_PATH.to_string(),
        "PARENT" => return FIELD_PARENT.to_string(),
        "QNAME" => return FIELD_QNAME.to_string(),
        "TYPE" => return FIELD_TYPE.to_string(),
        _ => {}
    }
    if name.starts_with('@') {
        return name.to_string();
    }
    if name.starts_with('{') {
        if let Some(q) = QName::parse(name) {
            return property_field(&q.prefixed());
        }
    }
    if name.contains(':') {
        return property_field(name);
    }
    property_field(&format!("cm:{}", name))
}

/// 精确匹配字段：不分词
fn is_exact_field(field: &str) -> bool {
    matches!(field, FIELD_ID | FIELD_PATH | FIELD_PARENT)
}

fn term_query(field: &str, word: &str) -> FtsQuery {
    if word == "*" {
        return FtsQuery::MatchAll;
    }
    let exact = is_exact_field(field);
    if word.contains('*') || word.contains('?') {
        let pattern = if exact {
            word.to_string()
        } else {
            normalize_term(word)
        };
        return FtsQuery::Wildcard {
            field: field.to_string(),
            pattern,
        };
    }
    if exact {
        return FtsQuery::Term {
            field: field.to_string(),
            term: word.to_string(),
        };
    }
    if field == FIELD_TYPE || field == FIELD_QNAME {
        return FtsQuery::Term {
            field: field.to_string(),
            term: normalize_term(word),
        };
    }
    let mut terms = tokenize_str(word);
    match terms.len() {
        0 => FtsQuery::Or(Vec::new()),
        1 => FtsQuery::Term {
            field: field.to_string(),
            term: terms.remove(0),
        },
        _ => FtsQuery::Phrase {
            field: field.to_string(),
            terms,
        },
    }
}

fn phrase_query(field: &str, text: &str) -> FtsQuery {
    if is_exact_field(field) {
        return FtsQuery::Term {
            field: field.to_string(),
            term: text.to_string(),
        };
    }
    term_query(field, text)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct FtsParser<'a> {
    input: &'a str,
    tokens: Vec<FtsToken>,
    index: usize,
    default_connective: Connective,
    field_connective: Connective,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Occur {
    Plain,
    Must,
    MustNot,
}

impl<'a> FtsParser<'a> {
    fn peek(&self) -> Option<&FtsTokenKind> {
        self.tokens.get(self.index).map(|t| &t.kind)
    }

    fn position(&self) -> Option<usize> {
        self.tokens
            .get(self.index)
            .map(|t| t.position)
            .or(Some(self.input.len()))
    }

    fn bump(&mut self) -> Option<FtsToken> {
        let t = self.tokens.get(self.index).cloned();
        if t.is_some() {
            self.index += 1;
        }
        t
    }

    fn error(&self, message: &str) -> QueryError {
        QueryError::parse(self.input, self.position(), message)
    }

    fn parse_or(&mut self, field: &str, connective: Connective) -> Result<FtsQuery, QueryError> {
        let mut parts = vec![self.parse_and(field, connective)?];
        while self.peek() == Some(&FtsTokenKind::Or) {
            self.bump();
            parts.push(self.parse_and(field, connective)?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            FtsQuery::Or(parts)
        })
    }

    fn parse_and(&mut self, field: &str, connective: Connective) -> Result<FtsQuery, QueryError> {
        let mut parts = vec![self.parse_group(field, connective)?];
        while self.peek() == Some(&FtsTokenKind::And) {
            self.bump();
            parts.push(self.parse_group(field, connective)?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            FtsQuery::And(parts)
        })
    }

    fn parse_group(&mut self, field: &str, connective: Connective) -> Result<FtsQuery, QueryError> {
        let mut clauses: Vec<(Occur, FtsQuery)> = Vec::new();
        loop {
            match self.peek() {
                None | Some(FtsTokenKind::Or) | Some(FtsTokenKind::And) | Some(FtsTokenKind::RParen) => {
                    break
                }
                _ => {}
            }
            let occur = match self.peek() {
                Some(FtsTokenKind::Plus) => {
                    self.bump();
                    Occur::Must
                }
                Some(FtsTokenKind::Minus) | Some(FtsTokenKind::Not) => {
                    self.bump();
                    Occur::MustNot
                }
                _ => Occur::Plain,
            };
            clauses.push((occur, self.parse_primary(field)?));
        }

        if clauses.is_empty() {
            return Err(self.error("expected a term"));
        }
        if clauses.len() == 1 && clauses[0].0 == Occur::Plain {
            return Ok(clauses.remove(0).1);
        }

        let (mut must, mut should, mut must_not) = (Vec::new(), Vec::new(), Vec::new());
        for (occur, q) in clauses {
            match occur {
                Occur::Must => must.push(q),
                Occur::MustNot => must_not.push(q),
                Occur::Plain => match connective {
                    Connective::And => must.push(q),
                    Connective::Or => should.push(q),
                },
            }
        }
        Ok(FtsQuery::Bool {
            must,
            should,
            must_not,
        })
    }

    fn parse_primary(&mut self, field: &str) -> Result<FtsQuery, QueryError> {
        let Some(tok) = self.bump() else {
            return Err(self.error("unexpected end of query"));
        };
        match tok.kind {
            FtsTokenKind::LParen => {
                let q = self.parse_or(field, self.default_connective)?;
                match self.bump() {
                    Some(FtsToken {
                        kind: FtsTokenKind::RParen,
                        ..
                    }) => Ok(q),
                    _ => Err(QueryError::parse(self.input, Some(tok.position), "unbalanced parenthesis")),
                }
            }
            FtsTokenKind::Field(name) => {
                let resolved = resolve_field(&name);
                if self.peek() == Some(&FtsTokenKind::LParen) {
                    self.bump();
                    let q = self.parse_or(&resolved, self.field_connective)?;
                    return match self.bump() {
                        Some(FtsToken {
                            kind: FtsTokenKind::RParen,
                            ..
                        }) => Ok(q),
                        _ => Err(QueryError::parse(self.input, Some(tok.position), "unbalanced parenthesis")),
                    };
                }
                self.parse_primary(&resolved)
            }
            FtsTokenKind::Word(w) => Ok(term_query(field, &w)),
            FtsTokenKind::Phrase(p) => Ok(phrase_query(field, &p)),
            _ => Err(QueryError::parse(self.input, Some(tok.position), "unexpected operator")),
        }
    }
}

impl FtsQuery {
    pub fn parse(
        input: &str,
        default_field: &str,
        default_connective: Connective,
        field_connective: Connective,
    ) -> Result<Self, QueryError> {
        let tokens = tokenize_query(input)?;
        if tokens.is_empty() {
            return Err(QueryError::parse(input, None, "empty query"));
        }
        let mut parser = FtsParser {
            input,
            tokens,
            index: 0,
            default_connective,
            field_connective,
        };
        let field = resolve_field(default_field);
        let q = parser.parse_or(&field, default_connective)?;
        if parser.peek().is_some() {
            return Err(parser.error("unexpected token"));
        }
        Ok(q)
    }

    /// 匹配的文档集合
    pub fn matches(&self, s: &dyn IndexSearcher) -> RoaringBitmap {
        match self {
            FtsQuery::Term { field, term } => s.term_docs(field, term),
            FtsQuery::Wildcard { field, pattern } => {
                let wm = WildMatch::new(pattern);
                let mut out = RoaringBitmap::new();
                for t in s.terms(field) {
                    if wm.matches(&t) {
                        out |= s.term_docs(field, &t);
                    }
                }
                out
            }
            FtsQuery::Phrase { field, terms } => {
                let mut candidates = s.all_docs();
                for t in terms {
                    candidates &= s.term_docs(field, t);
                }
                candidates
                    .iter()
                    .filter(|d| {
                        s.document(*d)
                            .is_some_and(|doc| contains_sequence(&field_terms(&doc, field), terms))
                    })
                    .collect()
            }
            FtsQuery::MatchAll => s.all_docs(),
            FtsQuery::And(parts) => {
                let mut out = s.all_docs();
                for p in parts {
                    out &= p.matches(s);
                }
                out
            }
            FtsQuery::Or(parts) => {
                let mut out = RoaringBitmap::new();
                for p in parts {
                    out |= p.matches(s);
                }
                out
            }
            FtsQuery::Bool {
                must,
                should,
                must_not,
            } => {
                let mut out = if !must.is_empty() {
                    let mut m = s.all_docs();
                    for p in must {
                        m &= p.matches(s);
                    }
                    m
                } else if !should.is_empty() {
                    let mut m = RoaringBitmap::new();
                    for p in should {
                        m |= p.matches(s);
                    }
                    m
                } else {
                    s.all_docs()
                };
                for p in must_not {
                    out -= p.matches(s);
                }
                out
            }
        }
    }

    /// 参与打分的 (field, term)：否定子句不计分
    fn scoring_terms(&self, s: &dyn IndexSearcher, out: &mut HashSet<(String, String)>) {
        match self {
            FtsQuery::Term { field, term } => {
                out.insert((field.clone(), term.clone()));
            }
            FtsQuery::Wildcard { field, pattern } => {
                let wm = WildMatch::new(pattern);
                for t in s.terms(field) {
                    if wm.matches(&t) {
                        out.insert((field.clone(), t));
                    }
                }
            }
            FtsQuery::Phrase { field, terms } => {
                for t in terms {
                    out.insert((field.clone(), t.clone()));
                }
            }
            FtsQuery::MatchAll => {}
            FtsQuery::And(parts) | FtsQuery::Or(parts) => {
                for p in parts {
                    p.scoring_terms(s, out);
                }
            }
            FtsQuery::Bool { must, should, .. } => {
                for p in must.iter().chain(should.iter()) {
                    p.scoring_terms(s, out);
                }
            }
        }
    }

    /// 对一个 searcher 求值并打分（tf·idf）
    pub fn hits(&self, source: usize, s: &dyn IndexSearcher) -> Vec<Hit> {
        let docs = self.matches(s);
        let mut terms = HashSet::new();
        self.scoring_terms(s, &mut terms);

        let n = s.num_docs().max(1) as f32;
        let weighted: Vec<(String, String, f32)> = terms
            .into_iter()
            .map(|(f, t)| {
                let df = s.term_docs(&f, &t).len() as f32;
                let idf = 1.0 + (n / (df + 1.0)).ln();
                (f, t, idf)
            })
            .collect();

        docs.iter()
            .map(|doc| {
                let score = if weighted.is_empty() {
                    1.0
                } else {
                    weighted
                        .iter()
                        .map(|(f, t, idf)| s.term_freq(doc, f, t) as f32 * idf)
                        .sum::<f32>()
                };
                Hit { source, doc, score }
            })
            .collect()
    }
}

/// 与索引时一致的字段分词结果（短语校验用）
fn field_terms(doc: &Document, field: &str) -> Vec<String> {
    if field == FIELD_TEXT {
        let props: Vec<String> = doc.properties.values().map(|v| v.as_text()).collect();
        let text = format!(
            "{} {} {}",
            doc.qname.local,
            props.join(" "),
            doc.content.as_deref().unwrap_or("")
        );
        return tokenize_str(&text);
    }
    let Some(name) = field.strip_prefix('@') else {
        return Vec::new();
    };
    if name == "cm:name" {
        return tokenize_str(&doc.qname.local);
    }
    doc.properties
        .get(name)
        .map(|v| tokenize_str(&v.as_text()))
        .unwrap_or_default()
}

fn contains_sequence(haystack: &[String], needle: &[String]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

// ---------------------------------------------------------------------------
// Language handler
// ---------------------------------------------------------------------------

pub struct FtsLanguage {
    name: String,
    ctx: IndexContext,
}

impl FtsLanguage {
    pub fn new(ctx: IndexContext) -> Self {
        Self::named(FTS_LANGUAGE, ctx)
    }

    pub fn named(name: &str, ctx: IndexContext) -> Self {
        Self {
            name: name.to_string(),
            ctx,
        }
    }
}

impl QueryLanguage for FtsLanguage {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, params: &SearchParameters) -> Result<Box<dyn ResultSet>, QueryError> {
        let started = Instant::now();
        let opts = QueryOptions::from_params(params);
        let query = FtsQuery::parse(
            &opts.query,
            &opts.default_field,
            opts.default_connective,
            opts.default_field_connective,
        )?;
        let searchers = self.ctx.searchers(&self.name, &opts.stores)?;

        let hits: Vec<Hit> = searchers
            .iter()
            .enumerate()
            .flat_map(|(i, s)| query.hits(i, s.as_ref()))
            .collect();
        tracing::debug!("{}: {:?} matched {} docs", self.name, opts.query, hits.len());
        Ok(self.ctx.finish(searchers, hits, &opts, None, started))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{NodeKind, NodeRef, Properties, PropertyValue, StoreRef};
    use crate::index::memory::MemoryBackend;
    use crate::query::language::AccessFilter;
    use crate::query::result::LimitReason;
    use std::sync::Arc;

    fn parse(q: &str) -> FtsQuery {
        FtsQuery::parse(q, "TEXT", Connective::Or, Connective::Or).unwrap()
    }

    fn doc(store: &StoreRef, path: &str, title: &str, content: &str) -> Document {
        let mut properties = Properties::new();
        properties.insert("cm:title".into(), PropertyValue::Text(title.into()));
        Document {
            node: NodeRef::new(store.clone(), path),
            qname: QName::content(path.rsplit('/').next().unwrap_or("")),
            parent: None,
            kind: NodeKind::File,
            snapshot: 1,
            properties,
            content: Some(content.into()),
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
                DocOp::Upsert(doc(&s, "/reports/q1.txt", "Quarterly Report", "revenue grew in the north region")),
                DocOp::Upsert(doc(&s, "/reports/q2.txt", "Quarterly Report", "revenue fell sharply")),
                DocOp::Upsert(doc(&s, "/notes/todo.txt", "Todo", "buy milk and eggs")),
                DocOp::Upsert(doc(&s, "/notes/draft.txt", "Draft", "north star revenue idea")),
            ],
        )
        .unwrap();
        b.publish(&s, 1).unwrap();
        (b, s)
    }

    fn run(b: &Arc<MemoryBackend>, s: &StoreRef, q: &str) -> Vec<String> {
        let lang = FtsLanguage::new(IndexContext::new(b.clone()));
        let rs = lang
            .execute(&SearchParameters::new(FTS_LANGUAGE, q, s.clone()))
            .unwrap();
        let set: &dyn ResultSet = rs.as_ref();
        let mut paths: Vec<String> = set
            .cursor()
            .map(|r| r.unwrap().node_ref().unwrap().path.clone())
            .collect();
        paths.sort();
        paths
    }

    #[test]
    fn parses_fields_connectives_and_prefixes() {
        assert_eq!(
            parse("cm:title:report"),
            FtsQuery::Term {
                field: "@cm:title".into(),
                term: "report".into()
            }
        );
        assert_eq!(
            parse("PATH:\"/a/b\""),
            FtsQuery::Term {
                field: FIELD_PATH.into(),
                term: "/a/b".into()
            }
        );
        assert!(matches!(parse("a AND b"), FtsQuery::And(ref v) if v.len() == 2));
        assert!(matches!(parse("a OR b"), FtsQuery::Or(ref v) if v.len() == 2));
        match parse("+a b -c") {
            FtsQuery::Bool { must, should, must_not } => {
                assert_eq!((must.len(), should.len(), must_not.len()), (1, 1, 1));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parse("*"), FtsQuery::MatchAll);
    }

    #[test]
    fn parse_errors_carry_position() {
        let err = FtsQuery::parse("(a OR b", "TEXT", Connective::Or, Connective::Or).unwrap_err();
        assert!(matches!(err, QueryError::Parse { position: Some(0), .. }));
        let err = FtsQuery::parse("a \"open", "TEXT", Connective::Or, Connective::Or).unwrap_err();
        assert!(matches!(err, QueryError::Parse { position: Some(2), .. }));
        assert!(FtsQuery::parse("a AND", "TEXT", Connective::Or, Connective::Or).is_err());
        assert!(FtsQuery::parse("   ", "TEXT", Connective::Or, Connective::Or).is_err());
    }

    #[test]
    fn evaluates_terms_phrases_and_wildcards() {
        let (b, s) = fixture();
        assert_eq!(
            run(&b, &s, "revenue"),
            vec!["/notes/draft.txt", "/reports/q1.txt", "/reports/q2.txt"]
        );
        assert_eq!(run(&b, &s, "\"north region\""), vec!["/reports/q1.txt"]);
        assert_eq!(run(&b, &s, "rev*e AND fell"), vec!["/reports/q2.txt"]);
        assert_eq!(run(&b, &s, "revenue -north"), vec!["/reports/q2.txt"]);
        assert_eq!(run(&b, &s, "cm:title:todo"), vec!["/notes/todo.txt"]);
        assert_eq!(run(&b, &s, "PATH:/notes/*"), vec!["/notes/draft.txt", "/notes/todo.txt"]);
        assert_eq!(run(&b, &s, "NOT revenue").len(), 1);
    }

    #[test]
    fn default_connective_controls_adjacent_terms() {
        let (b, s) = fixture();
        let lang = FtsLanguage::new(IndexContext::new(b.clone()));
        let mut p = SearchParameters::new(FTS_LANGUAGE, "revenue north", s.clone());
        assert_eq!(lang.execute(&p).unwrap().len(), 3);
        p.default_fts_operator = Connective::And;
        assert_eq!(lang.execute(&p).unwrap().len(), 2);
    }

    #[test]
    fn higher_term_frequency_ranks_first() {
        let (b, s) = fixture();
        let lang = FtsLanguage::new(IndexContext::new(b.clone()));
        let rs = lang
            .execute(&SearchParameters::new(FTS_LANGUAGE, "north OR quarterly", s.clone()))
            .unwrap();
        let first = rs.row(0).unwrap();
        let last = rs.row(rs.len() - 1).unwrap();
        assert!(first.score() >= last.score());
    }

    #[test]
    fn permission_budget_truncates_page() {
        let (b, s) = fixture();
        let deny_notes = |d: &Document| !d.node.path.starts_with("/notes");
        let filter: Arc<dyn AccessFilter> = Arc::new(deny_notes);
        let lang = FtsLanguage::new(IndexContext::new(b.clone()).with_access_filter(filter));

        let mut p = SearchParameters::new(FTS_LANGUAGE, "*", s.clone());
        p.sort = vec![crate::query::params::SortDefinition::field("cmis:path", true)];
        p.max_permission_checks = Some(2);
        let rs = lang.execute(&p).unwrap();
        // 排序后前两条都在 /notes 下，被拒绝
        assert_eq!(rs.len(), 0);
        assert_eq!(rs.total(), 4);
        assert_eq!(rs.limit_reason(), LimitReason::PermissionChecks);

        p.max_permission_checks = None;
        let rs = lang.execute(&p).unwrap();
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.limit_reason(), LimitReason::Unlimited);
    }

    #[test]
    fn skip_and_max_items_window_the_results() {
        let (b, s) = fixture();
        let lang = FtsLanguage::new(IndexContext::new(b.clone()));
        let mut p = SearchParameters::new(FTS_LANGUAGE, "*", s.clone());
        p.sort = vec![crate::query::params::SortDefinition::field("cmis:path", true)];
        p.skip_count = 1;
        p.max_items = Some(2);
        let rs = lang.execute(&p).unwrap();
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.total(), 4);
        assert_eq!(rs.limit_reason(), LimitReason::MaxItems);
        assert_eq!(rs.row(0).unwrap().node_ref().unwrap().path, "/notes/todo.txt");
    }

    #[test]
    fn missing_store_is_reported_by_name() {
        let (b, _s) = fixture();
        let lang = FtsLanguage::new(IndexContext::new(b));
        let err = match lang.execute(&SearchParameters::new(FTS_LANGUAGE, "x", StoreRef::new("nope"))) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, QueryError::StoreNotIndexed { ref store, .. } if store.as_str() == "nope"));
        assert!(err.to_string().contains("no index for store nope"));
    }
}
