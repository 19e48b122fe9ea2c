//! Command surface: thin argv → request translators.
//!
//! These functions turn `FT.CREATE` / `FT.SEARCH` / `FT.INFO` /
//! `FT.INTERNAL_UPDATE` argument vectors into the engine's typed requests
//! and shape replies back into RESP-style values. No engine state lives
//! here; everything interesting happens behind [`crate::engine`].
//!
//! Supported query grammar (a practical subset):
//!
//! ```text
//! *                                 every document
//! @price:[10 20]                    numeric range, `(` for exclusive bounds
//! @color:{red|blue}                 tag alternatives
//! @title:word                       text term
//! @title:wor*                       prefix   (@t:*fix suffix, @t:*mid* contains)
//! @title:w?rd*                      wildcard
//! @title:%word%                     fuzzy, one % per edit of distance
//! @title:"exact phrase"             positional phrase
//! -@color:{red}                     negation
//! expr expr                         conjunction; `|` for disjunction
//! *=>[KNN 10 @vec $BLOB]            KNN with a PARAMS-supplied vector
//! ```

use std::collections::HashMap;

use crate::engine::InfoReply;
use crate::error::{EngineError, Result};
use crate::host::RecordKind;
use crate::index::{
    DistanceMetric, FilterPredicate, IndexDefinition, NumericRange, TagMatch, TagOptions,
    TextMatch, TextOptions, VectorAlgorithm, VectorParams,
};
use crate::query::{QueryExpr, SearchOptions};
use crate::schema::{AttributeProto, SchemaProto, MAX_ATTRIBUTES};

const MAX_DIM: u64 = 32_768;
const MAX_M: u64 = 512;
const MAX_EF: u64 = 4_096;
const MAX_BLOCK_SIZE: u64 = 1_048_576;

/// Minimal RESP-shaped reply value.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    Simple(String),
    Bulk(Vec<u8>),
    Int(i64),
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple(s: impl AsRef<str>) -> Self {
        RespValue::Simple(s.as_ref().to_string())
    }
}

fn arity_error(command: &str) -> EngineError {
    EngineError::invalid_argument(format!("wrong number of arguments for {command}"))
}

fn parse_u64(token: &str, what: &str) -> Result<u64> {
    token
        .parse::<u64>()
        .map_err(|_| EngineError::invalid_argument(format!("{what} must be a positive integer")))
}

fn bounded(value: u64, what: &str, min: u64, max: u64) -> Result<u64> {
    if value < min || value > max {
        return Err(EngineError::out_of_range(format!(
            "{what} must be in [{min}, {max}]"
        )));
    }
    Ok(value)
}

// ── FT.CREATE ───────────────────────────────────────────────────────────

struct ArgCursor<'a> {
    args: &'a [String],
    pos: usize,
}

impl<'a> ArgCursor<'a> {
    fn new(args: &'a [String]) -> Self {
        Self { args, pos: 0 }
    }

    fn next(&mut self, command: &str) -> Result<&'a str> {
        let token = self.args.get(self.pos).ok_or_else(|| arity_error(command))?;
        self.pos += 1;
        Ok(token)
    }

    fn peek(&self) -> Option<&'a str> {
        self.args.get(self.pos).map(String::as_str)
    }

    fn done(&self) -> bool {
        self.pos >= self.args.len()
    }
}

/// Parse `FT.CREATE` arguments (the command name itself excluded).
pub fn parse_ft_create(db_num: u32, args: &[String]) -> Result<SchemaProto> {
    let mut cursor = ArgCursor::new(args);
    let name = cursor.next("FT.CREATE")?.to_string();
    if name.contains('{') || name.contains('}') {
        return Err(EngineError::invalid_argument(
            "index name must not contain a hash tag",
        ));
    }

    let mut data_type = RecordKind::Hash;
    let mut key_prefixes: Vec<String> = Vec::new();
    loop {
        match cursor.peek().map(str::to_ascii_uppercase).as_deref() {
            Some("ON") => {
                cursor.next("FT.CREATE")?;
                let kind = cursor.next("FT.CREATE")?;
                data_type = match kind.to_ascii_uppercase().as_str() {
                    "HASH" => RecordKind::Hash,
                    "JSON" => RecordKind::Json,
                    other => {
                        return Err(EngineError::invalid_argument(format!(
                            "unsupported data type {other}"
                        )))
                    }
                };
            }
            Some("PREFIX") => {
                cursor.next("FT.CREATE")?;
                let count = parse_u64(cursor.next("FT.CREATE")?, "PREFIX count")?;
                for _ in 0..count {
                    let prefix = cursor.next("FT.CREATE")?;
                    if prefix.contains('{') || prefix.contains('}') {
                        return Err(EngineError::invalid_argument(
                            "key prefix must not contain a hash tag",
                        ));
                    }
                    key_prefixes.push(prefix.to_string());
                }
            }
            Some("LANGUAGE") => {
                cursor.next("FT.CREATE")?;
                cursor.next("FT.CREATE")?; // recorded nowhere: english only
            }
            Some("SCORE") => {
                cursor.next("FT.CREATE")?;
                let score = cursor.next("FT.CREATE")?;
                if score != "1.0" && score != "1" {
                    return Err(EngineError::invalid_argument(
                        "only a default score of 1.0 is supported",
                    ));
                }
            }
            Some("SCHEMA") => {
                cursor.next("FT.CREATE")?;
                break;
            }
            Some(other) => {
                return Err(EngineError::invalid_argument(format!(
                    "unknown FT.CREATE argument {other}"
                )))
            }
            None => return Err(arity_error("FT.CREATE")),
        }
    }

    let mut attributes = Vec::new();
    while !cursor.done() {
        let identifier = cursor.next("FT.CREATE")?.to_string();
        let mut alias = identifier.clone();
        if cursor
            .peek()
            .is_some_and(|t| t.eq_ignore_ascii_case("AS"))
        {
            cursor.next("FT.CREATE")?;
            alias = cursor.next("FT.CREATE")?.to_string();
        }
        if attributes
            .iter()
            .any(|attr: &AttributeProto| attr.alias == alias)
        {
            return Err(EngineError::invalid_argument(format!(
                "duplicate field {alias}"
            )));
        }
        let definition = parse_attribute_definition(&mut cursor)?;
        attributes.push(AttributeProto {
            alias,
            identifier,
            definition,
        });
        if attributes.len() > MAX_ATTRIBUTES {
            return Err(EngineError::invalid_argument(format!(
                "too many attributes (maximum {MAX_ATTRIBUTES})"
            )));
        }
    }
    if attributes.is_empty() {
        return Err(arity_error("FT.CREATE"));
    }

    Ok(SchemaProto {
        name,
        db_num,
        data_type,
        key_prefixes,
        attributes,
        documents_count: 0,
    })
}

fn parse_attribute_definition(cursor: &mut ArgCursor<'_>) -> Result<IndexDefinition> {
    let kind = cursor.next("FT.CREATE")?.to_ascii_uppercase();
    match kind.as_str() {
        "NUMERIC" => Ok(IndexDefinition::Numeric),
        "TAG" => {
            let mut options = TagOptions::default();
            loop {
                match cursor.peek().map(str::to_ascii_uppercase).as_deref() {
                    Some("SEPARATOR") => {
                        cursor.next("FT.CREATE")?;
                        let sep = cursor.next("FT.CREATE")?;
                        let mut chars = sep.chars();
                        match (chars.next(), chars.next()) {
                            (Some(c), None) => options.separator = c,
                            _ => {
                                return Err(EngineError::invalid_argument(
                                    "SEPARATOR must be a single character",
                                ))
                            }
                        }
                    }
                    Some("CASESENSITIVE") => {
                        cursor.next("FT.CREATE")?;
                        options.case_sensitive = true;
                    }
                    _ => break,
                }
            }
            Ok(IndexDefinition::Tag(options))
        }
        "TEXT" => {
            let mut options = TextOptions::default();
            loop {
                match cursor.peek().map(str::to_ascii_uppercase).as_deref() {
                    Some("WITHSUFFIXTRIE") => {
                        cursor.next("FT.CREATE")?;
                        options.with_suffix_trie = true;
                    }
                    Some("NOSUFFIXTRIE") => {
                        cursor.next("FT.CREATE")?;
                        options.with_suffix_trie = false;
                    }
                    Some("NOSTEM") => {
                        cursor.next("FT.CREATE")?;
                        options.stemming = false;
                    }
                    Some("MINSTEMSIZE") => {
                        cursor.next("FT.CREATE")?;
                        let size = parse_u64(cursor.next("FT.CREATE")?, "MINSTEMSIZE")?;
                        options.min_stem_size = bounded(size, "MINSTEMSIZE", 1, 64)? as u32;
                    }
                    _ => break,
                }
            }
            Ok(IndexDefinition::Text(options))
        }
        "VECTOR" => parse_vector_definition(cursor),
        other => Err(EngineError::invalid_argument(format!(
            "unknown index type {other}"
        ))),
    }
}

fn parse_vector_definition(cursor: &mut ArgCursor<'_>) -> Result<IndexDefinition> {
    let algorithm_name = cursor.next("FT.CREATE")?.to_ascii_uppercase();
    let arg_count = parse_u64(cursor.next("FT.CREATE")?, "VECTOR argument count")?;
    if arg_count % 2 != 0 {
        return Err(EngineError::invalid_argument(
            "VECTOR parameters must be name/value pairs",
        ));
    }
    let mut dim: Option<u64> = None;
    let mut metric: Option<DistanceMetric> = None;
    let mut m: u64 = 16;
    let mut ef_construction: u64 = 200;
    let mut ef_runtime: u64 = 10;
    let mut initial_cap: u64 = 1024;
    let mut block_size: u64 = 1024;
    for _ in 0..arg_count / 2 {
        let key = cursor.next("FT.CREATE")?.to_ascii_uppercase();
        let value = cursor.next("FT.CREATE")?;
        match key.as_str() {
            "TYPE" => {
                if !value.eq_ignore_ascii_case("FLOAT32") {
                    return Err(EngineError::invalid_argument(
                        "only FLOAT32 vectors are supported",
                    ));
                }
            }
            "DIM" => dim = Some(bounded(parse_u64(value, "DIM")?, "DIM", 1, MAX_DIM)?),
            "DISTANCE_METRIC" => {
                metric = Some(match value.to_ascii_uppercase().as_str() {
                    "L2" => DistanceMetric::L2,
                    "IP" => DistanceMetric::Ip,
                    "COSINE" => DistanceMetric::Cosine,
                    other => {
                        return Err(EngineError::invalid_argument(format!(
                            "unknown distance metric {other}"
                        )))
                    }
                })
            }
            "M" => m = bounded(parse_u64(value, "M")?, "M", 1, MAX_M)?,
            "EF_CONSTRUCTION" => {
                ef_construction =
                    bounded(parse_u64(value, "EF_CONSTRUCTION")?, "EF_CONSTRUCTION", 1, MAX_EF)?
            }
            "EF_RUNTIME" => {
                ef_runtime = bounded(parse_u64(value, "EF_RUNTIME")?, "EF_RUNTIME", 1, MAX_EF)?
            }
            "INITIAL_CAP" => initial_cap = parse_u64(value, "INITIAL_CAP")?,
            "BLOCK_SIZE" => {
                block_size = bounded(parse_u64(value, "BLOCK_SIZE")?, "BLOCK_SIZE", 1, MAX_BLOCK_SIZE)?
            }
            other => {
                return Err(EngineError::invalid_argument(format!(
                    "unknown VECTOR parameter {other}"
                )))
            }
        }
    }
    let dim = dim.ok_or_else(|| EngineError::invalid_argument("VECTOR requires DIM"))? as u32;
    let metric =
        metric.ok_or_else(|| EngineError::invalid_argument("VECTOR requires DISTANCE_METRIC"))?;
    let algorithm = match algorithm_name.as_str() {
        "HNSW" => VectorAlgorithm::Hnsw {
            m: m as usize,
            ef_construction: ef_construction as usize,
            ef_runtime: ef_runtime as usize,
        },
        "FLAT" => VectorAlgorithm::Flat {
            block_size: block_size as usize,
        },
        other => {
            return Err(EngineError::invalid_argument(format!(
                "unknown vector algorithm {other}"
            )))
        }
    };
    Ok(IndexDefinition::Vector(VectorParams {
        dim,
        metric,
        algorithm,
        json_encoded: false, // derived from the schema data type at create
        initial_cap: initial_cap as usize,
    }))
}

// ── FT.SEARCH ───────────────────────────────────────────────────────────

/// Parsed FT.SEARCH command.
#[derive(Debug, Clone)]
pub struct SearchCommand {
    pub index_name: String,
    pub expr: QueryExpr,
    pub options: SearchOptions,
}

/// Parse `FT.SEARCH` arguments. `params` carries `PARAMS` bindings (vector
/// blobs arrive as raw bytes).
pub fn parse_ft_search(
    args: &[String],
    params: &HashMap<String, Vec<u8>>,
) -> Result<SearchCommand> {
    let mut cursor = ArgCursor::new(args);
    let index_name = cursor.next("FT.SEARCH")?.to_string();
    let query_text = cursor.next("FT.SEARCH")?;
    let expr = parse_query(query_text, params)?;

    let mut options = SearchOptions::default();
    while !cursor.done() {
        match cursor.next("FT.SEARCH")?.to_ascii_uppercase().as_str() {
            "NOCONTENT" => options.no_content = true,
            "TIMEOUT" => {
                let ms = parse_u64(cursor.next("FT.SEARCH")?, "TIMEOUT")?;
                options.timeout = std::time::Duration::from_millis(ms);
            }
            "LIMIT" => {
                options.limit_offset = parse_u64(cursor.next("FT.SEARCH")?, "LIMIT offset")? as usize;
                options.limit_num = parse_u64(cursor.next("FT.SEARCH")?, "LIMIT num")? as usize;
            }
            other => {
                return Err(EngineError::invalid_argument(format!(
                    "unknown FT.SEARCH argument {other}"
                )))
            }
        }
    }
    Ok(SearchCommand {
        index_name,
        expr,
        options,
    })
}

/// Parse the query grammar into a [`QueryExpr`].
pub fn parse_query(text: &str, params: &HashMap<String, Vec<u8>>) -> Result<QueryExpr> {
    let trimmed = text.trim();
    // KNN form: `<filter>=>[KNN k @attr $param]`
    if let Some((filter_part, knn_part)) = trimmed.split_once("=>") {
        let knn_part = knn_part.trim();
        let inner = knn_part
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| EngineError::invalid_argument("malformed KNN clause"))?;
        let tokens: Vec<&str> = inner.split_whitespace().collect();
        let [kw, k, attr, param] = tokens.as_slice() else {
            return Err(EngineError::invalid_argument(
                "KNN clause takes: KNN <k> @<attribute> $<param>",
            ));
        };
        if !kw.eq_ignore_ascii_case("KNN") {
            return Err(EngineError::invalid_argument("expected KNN clause"));
        }
        let k = parse_u64(k, "KNN k")? as u32;
        let attribute = attr
            .strip_prefix('@')
            .ok_or_else(|| EngineError::invalid_argument("KNN attribute must start with @"))?
            .to_string();
        let param_name = param
            .strip_prefix('$')
            .ok_or_else(|| EngineError::invalid_argument("KNN vector must be a $param"))?;
        let blob = params.get(param_name).ok_or_else(|| {
            EngineError::invalid_argument(format!("missing PARAMS binding ${param_name}"))
        })?;
        if blob.len() % 4 != 0 {
            return Err(EngineError::invalid_argument(
                "vector blob length must be a multiple of 4",
            ));
        }
        let vector: Vec<f32> = blob
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let filter_part = filter_part.trim();
        let filter = if filter_part == "*" || filter_part.is_empty() {
            None
        } else {
            Some(Box::new(parse_boolean(filter_part)?))
        };
        return Ok(QueryExpr::Knn {
            attribute,
            k,
            vector,
            filter,
        });
    }
    parse_boolean(trimmed)
}

fn parse_boolean(text: &str) -> Result<QueryExpr> {
    let alternatives: Vec<&str> = split_top_level(text, '|');
    let mut or_parts = Vec::new();
    for alternative in alternatives {
        let terms = tokenize_clauses(alternative)?;
        let mut and_parts = Vec::new();
        for term in terms {
            and_parts.push(parse_clause(&term)?);
        }
        match and_parts.len() {
            0 => continue,
            1 => or_parts.push(and_parts.pop().expect("single element")),
            _ => or_parts.push(QueryExpr::And(and_parts)),
        }
    }
    match or_parts.len() {
        0 => Err(EngineError::invalid_argument("empty query")),
        1 => Ok(or_parts.pop().expect("single element")),
        _ => Ok(QueryExpr::Or(or_parts)),
    }
}

/// Split on `separator` outside brackets/braces/quotes.
fn split_top_level(text: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, c) in text.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '[' | '{' | '(' if !in_quotes => depth += 1,
            ']' | '}' | ')' if !in_quotes => depth -= 1,
            c if c == separator && depth == 0 && !in_quotes => {
                parts.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Split a conjunction into clauses, keeping brackets and quotes intact.
fn tokenize_clauses(text: &str) -> Result<Vec<String>> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    for c in text.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            '[' | '{' | '(' if !in_quotes => {
                depth += 1;
                current.push(c);
            }
            ']' | '}' | ')' if !in_quotes => {
                depth -= 1;
                current.push(c);
            }
            c if c.is_whitespace() && depth == 0 && !in_quotes => {
                if !current.is_empty() {
                    clauses.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if depth != 0 || in_quotes {
        return Err(EngineError::invalid_argument("unbalanced query syntax"));
    }
    if !current.is_empty() {
        clauses.push(current);
    }
    Ok(clauses)
}

fn parse_clause(clause: &str) -> Result<QueryExpr> {
    if clause == "*" {
        return Ok(QueryExpr::All);
    }
    if let Some(negated) = clause.strip_prefix('-') {
        return Ok(QueryExpr::Not(Box::new(parse_clause(negated)?)));
    }
    let body = clause
        .strip_prefix('@')
        .ok_or_else(|| EngineError::invalid_argument(format!("cannot parse clause {clause}")))?;
    let (attribute, predicate_text) = body.split_once(':').ok_or_else(|| {
        EngineError::invalid_argument(format!("missing ':' in clause @{body}"))
    })?;
    let predicate = parse_predicate(predicate_text)?;
    Ok(QueryExpr::Filter {
        attribute: attribute.to_string(),
        predicate,
    })
}

fn parse_bound(token: &str) -> Result<(f64, bool)> {
    let (token, inclusive) = match token.strip_prefix('(') {
        Some(rest) => (rest, false),
        None => (token, true),
    };
    let value = match token.to_ascii_lowercase().as_str() {
        "inf" | "+inf" => f64::INFINITY,
        "-inf" => f64::NEG_INFINITY,
        other => other
            .parse::<f64>()
            .map_err(|_| EngineError::invalid_argument(format!("bad numeric bound {other}")))?,
    };
    Ok((value, inclusive))
}

fn parse_predicate(text: &str) -> Result<FilterPredicate> {
    if let Some(range) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
        let bounds: Vec<&str> = range.split_whitespace().collect();
        let [min, max] = bounds.as_slice() else {
            return Err(EngineError::invalid_argument(
                "numeric range takes exactly two bounds",
            ));
        };
        let (min, min_inclusive) = parse_bound(min)?;
        let (max, max_inclusive) = parse_bound(max)?;
        return Ok(FilterPredicate::Numeric(NumericRange {
            min,
            max,
            min_inclusive,
            max_inclusive,
        }));
    }
    if let Some(tags) = text.strip_prefix('{').and_then(|t| t.strip_suffix('}')) {
        let tags: Vec<String> = tags
            .split('|')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        if tags.is_empty() {
            return Err(EngineError::invalid_argument("empty tag set"));
        }
        return Ok(FilterPredicate::Tag(TagMatch { tags }));
    }
    // Text forms.
    let inner = text
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .unwrap_or(text);
    if let Some(phrase) = inner.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        let words: Vec<String> = phrase.split_whitespace().map(str::to_string).collect();
        if words.is_empty() {
            return Err(EngineError::invalid_argument("empty phrase"));
        }
        return Ok(FilterPredicate::Text(TextMatch::Phrase(words)));
    }
    if inner.starts_with('%') && inner.ends_with('%') && inner.len() > 2 {
        let distance = inner.chars().take_while(|c| *c == '%').count() as u32;
        let term = inner.trim_matches('%');
        if term.is_empty() {
            return Err(EngineError::invalid_argument("empty fuzzy term"));
        }
        return Ok(FilterPredicate::Text(TextMatch::Fuzzy {
            term: term.to_string(),
            max_distance: distance,
        }));
    }
    let stars = inner.matches('*').count();
    let questions = inner.matches('?').count();
    let matcher = if stars == 0 && questions == 0 {
        TextMatch::Term(inner.to_string())
    } else if questions == 0 && stars == 1 && inner.ends_with('*') {
        TextMatch::Prefix(inner.trim_end_matches('*').to_string())
    } else if questions == 0 && stars == 1 && inner.starts_with('*') {
        TextMatch::Suffix(inner.trim_start_matches('*').to_string())
    } else if questions == 0 && stars == 2 && inner.starts_with('*') && inner.ends_with('*') {
        TextMatch::Contains(inner.trim_matches('*').to_string())
    } else {
        TextMatch::Wildcard(inner.to_string())
    };
    Ok(FilterPredicate::Text(matcher))
}

// ── FT.INFO ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoScope {
    Local,
    Global,
}

pub fn parse_ft_info(args: &[String]) -> Result<(String, InfoScope)> {
    match args {
        [name] => Ok((name.clone(), InfoScope::Local)),
        [name, scope] => match scope.to_ascii_uppercase().as_str() {
            "LOCAL" => Ok((name.clone(), InfoScope::Local)),
            "GLOBAL" => Ok((name.clone(), InfoScope::Global)),
            other => Err(EngineError::invalid_argument(format!(
                "unknown FT.INFO scope {other}"
            ))),
        },
        _ => Err(arity_error("FT.INFO")),
    }
}

/// `FT.INTERNAL_UPDATE <encoded_id> <entry> <header>` — raw byte arguments.
pub fn parse_ft_internal_update(args: &[Vec<u8>]) -> Result<(String, Vec<u8>, Vec<u8>)> {
    let [id, entry, header] = args else {
        return Err(arity_error("FT.INTERNAL_UPDATE"));
    };
    let id = String::from_utf8(id.clone())
        .map_err(|_| EngineError::invalid_argument("encoded id must be UTF-8"))?;
    Ok((id, entry.clone(), header.clone()))
}

/// Render an [`InfoReply`] in the fixed FT.INFO array shape.
pub fn format_info_reply(reply: &InfoReply) -> RespValue {
    match reply {
        InfoReply::Local {
            schema_proto,
            data,
            default_score,
            attribute_memory,
        } => {
            let mut out = Vec::with_capacity(22);
            out.push(RespValue::simple("index_name"));
            out.push(RespValue::simple(&schema_proto.name));

            out.push(RespValue::simple("index_definition"));
            out.push(RespValue::Array(vec![
                RespValue::simple("key_type"),
                RespValue::simple(schema_proto.data_type.to_string()),
                RespValue::simple("prefixes"),
                RespValue::Array(
                    schema_proto
                        .key_prefixes
                        .iter()
                        .map(RespValue::simple)
                        .collect(),
                ),
                RespValue::simple("default_score"),
                RespValue::simple(format!("{default_score:.0}")),
            ]));

            out.push(RespValue::simple("attributes"));
            out.push(RespValue::Array(
                schema_proto
                    .attributes
                    .iter()
                    .map(|attr| {
                        let memory = attribute_memory
                            .iter()
                            .find(|(alias, _)| *alias == attr.alias)
                            .map(|(_, bytes)| *bytes)
                            .unwrap_or(0);
                        RespValue::Array(vec![
                            RespValue::simple("identifier"),
                            RespValue::simple(&attr.identifier),
                            RespValue::simple("attribute"),
                            RespValue::simple(&attr.alias),
                            RespValue::simple("type"),
                            RespValue::simple(attr.definition.kind().as_str()),
                            RespValue::simple("user_indexed_memory"),
                            RespValue::Int(memory as i64),
                        ])
                    })
                    .collect(),
            ));

            out.push(RespValue::simple("num_docs"));
            out.push(RespValue::Int(data.num_docs as i64));
            out.push(RespValue::simple("num_records"));
            out.push(RespValue::Int(data.num_records as i64));
            out.push(RespValue::simple("hash_indexing_failures"));
            out.push(RespValue::Int(data.hash_indexing_failures as i64));
            out.push(RespValue::simple("backfill_in_progress"));
            out.push(RespValue::Int(i64::from(data.backfill_in_progress)));
            out.push(RespValue::simple("backfill_complete_percent"));
            out.push(RespValue::simple(format!(
                "{:.6}",
                data.backfill_complete_percent
            )));
            out.push(RespValue::simple("mutation_queue_size"));
            out.push(RespValue::Int(data.mutation_queue_size as i64));
            out.push(RespValue::simple("recent_mutations_queue_delay"));
            out.push(RespValue::simple(format!(
                "{} sec",
                data.recent_mutations_queue_delay_secs
            )));
            out.push(RespValue::simple("state"));
            out.push(RespValue::simple(&data.state));
            RespValue::Array(out)
        }
        InfoReply::Global {
            index_name,
            num_docs,
            num_records,
            hash_indexing_failures,
        } => RespValue::Array(vec![
            RespValue::simple("mode"),
            RespValue::simple("primary"),
            RespValue::simple("index_name"),
            RespValue::simple(index_name),
            RespValue::simple("num_docs"),
            RespValue::Int(*num_docs as i64),
            RespValue::simple("num_records"),
            RespValue::Int(*num_records as i64),
            RespValue::simple("hash_indexing_failures"),
            RespValue::Int(*hash_indexing_failures as i64),
        ]),
    }
}
