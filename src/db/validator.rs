//! SQL safety gate.
//!
//! Validation never errors: every outcome is a [`ValidationResult`] so a
//! rejected statement flows back to the caller as data and never reaches the
//! database.
//!
//! Read-only mode runs three layers: statement-type allow-list, forbidden
//! keyword scan, dangerous pattern scan. Write mode runs only the (wider)
//! allow-list, so DDL bodies containing otherwise forbidden tokens are accepted.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use super::value::json_param_type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Select,
    With,
    Show,
    Explain,
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Drop,
    Truncate,
    Begin,
    Commit,
    Rollback,
    Comment,
    Unknown,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Select => "SELECT",
            QueryType::With => "WITH",
            QueryType::Show => "SHOW",
            QueryType::Explain => "EXPLAIN",
            QueryType::Insert => "INSERT",
            QueryType::Update => "UPDATE",
            QueryType::Delete => "DELETE",
            QueryType::Create => "CREATE",
            QueryType::Alter => "ALTER",
            QueryType::Drop => "DROP",
            QueryType::Truncate => "TRUNCATE",
            QueryType::Begin => "BEGIN",
            QueryType::Commit => "COMMIT",
            QueryType::Rollback => "ROLLBACK",
            QueryType::Comment => "COMMENT",
            QueryType::Unknown => "UNKNOWN",
        }
    }

    fn from_keyword(word: &str) -> Self {
        match word {
            "SELECT" => QueryType::Select,
            "WITH" => QueryType::With,
            "SHOW" => QueryType::Show,
            "EXPLAIN" => QueryType::Explain,
            "INSERT" => QueryType::Insert,
            "UPDATE" => QueryType::Update,
            "DELETE" => QueryType::Delete,
            "CREATE" => QueryType::Create,
            "ALTER" => QueryType::Alter,
            "DROP" => QueryType::Drop,
            "TRUNCATE" => QueryType::Truncate,
            "BEGIN" => QueryType::Begin,
            "COMMIT" => QueryType::Commit,
            "ROLLBACK" => QueryType::Rollback,
            "COMMENT" => QueryType::Comment,
            _ => QueryType::Unknown,
        }
    }
}

const READ_ONLY_TYPES: &[QueryType] = &[QueryType::Select, QueryType::With, QueryType::Show, QueryType::Explain];

const WRITE_TYPES: &[QueryType] = &[
    QueryType::Select,
    QueryType::With,
    QueryType::Show,
    QueryType::Explain,
    QueryType::Insert,
    QueryType::Update,
    QueryType::Delete,
    QueryType::Create,
    QueryType::Alter,
    QueryType::Drop,
    QueryType::Truncate,
    QueryType::Begin,
    QueryType::Commit,
    QueryType::Rollback,
    QueryType::Comment,
];

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "GRANT", "REVOKE",
    "VACUUM", "REINDEX", "CLUSTER", "COPY", "LISTEN", "NOTIFY", "UNLISTEN", "LOCK", "CALL",
    "MERGE", "REFRESH", "SECURITY", "DISCARD", "CHECKPOINT",
];

static LINE_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"--[^\n]*").unwrap());
static BLOCK_COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
static STRING_LITERAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").unwrap());
static LEADING_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\(*\s*([A-Za-z]+)").unwrap());

static FORBIDDEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\b({})\b", FORBIDDEN_KEYWORDS.join("|"))).unwrap()
});

/// (pattern, human description)
static DANGEROUS_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r";\s*\S", "multiple statements"),
        (r"(?i)\bEXEC(UTE)?\b", "EXEC/EXECUTE"),
        (r"(?i)\b(pg_read_file|pg_read_binary_file|pg_ls_dir|pg_stat_file|lo_import|lo_export)\s*\(", "file access function"),
        (r"(?i)\bINTO\s+(OUTFILE|DUMPFILE)\b", "file output"),
        (r"(?i)\b(xp_|sp_)\w+", "vendor stored procedure"),
        (r"(?i)\bdblink\w*\s*\(", "remote database link"),
        (r"(?i)\bpg_sleep\s*\(", "pg_sleep"),
    ]
    .into_iter()
    .map(|(re, label)| (Regex::new(re).unwrap(), label))
    .collect()
});

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    #[serde(rename = "queryType")]
    pub query_type: QueryType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "paramCount")]
    pub param_count: usize,
    #[serde(rename = "hasParameters")]
    pub has_parameters: bool,
}

impl ValidationResult {
    fn reject(query_type: QueryType, params: &[Value], error: String) -> Self {
        Self {
            valid: false,
            query_type,
            error: Some(error),
            param_count: params.len(),
            has_parameters: !params.is_empty(),
        }
    }
}

/// Stateless apart from its mode; cheap to clone and share.
#[derive(Debug, Clone, Copy)]
pub struct QueryValidator {
    allow_write: bool,
}

impl QueryValidator {
    pub fn new(allow_write: bool) -> Self {
        Self { allow_write }
    }

    pub fn allows_write(&self) -> bool {
        self.allow_write
    }

    pub fn validate(&self, sql: &str, params: &[Value]) -> ValidationResult {
        let cleaned = strip_comments(sql);
        let cleaned = cleaned.trim();

        if cleaned.is_empty() {
            return ValidationResult::reject(QueryType::Unknown, params, "Query is empty".to_string());
        }

        let leading = leading_keyword(cleaned);
        let query_type = QueryType::from_keyword(&leading);
        let allowed = if self.allow_write { WRITE_TYPES } else { READ_ONLY_TYPES };

        if !allowed.contains(&query_type) {
            let mode = if self.allow_write { "write-enabled" } else { "read-only" };
            let shown = if leading.is_empty() { "UNKNOWN" } else { leading.as_str() };
            return ValidationResult::reject(
                query_type,
                params,
                format!(
                    "Query type '{}' is not allowed in {} mode. Allowed: {}",
                    shown,
                    mode,
                    allowed.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
                ),
            );
        }

        if !self.allow_write {
            let scanned = STRING_LITERAL.replace_all(cleaned, "''");

            if let Some(m) = FORBIDDEN_RE.find(&scanned) {
                return ValidationResult::reject(
                    query_type,
                    params,
                    format!("Forbidden keyword '{}' is not allowed in read-only mode", m.as_str().to_uppercase()),
                );
            }

            for (pattern, label) in DANGEROUS_PATTERNS.iter() {
                if pattern.is_match(&scanned) {
                    return ValidationResult::reject(
                        query_type,
                        params,
                        format!("Dangerous pattern detected ({}) - query not allowed", label),
                    );
                }
            }
        }

        if let Some(error) = check_params(params) {
            return ValidationResult::reject(query_type, params, error);
        }

        ValidationResult {
            valid: true,
            query_type,
            error: None,
            param_count: params.len(),
            has_parameters: !params.is_empty(),
        }
    }
}

fn strip_comments(sql: &str) -> String {
    let without_blocks = BLOCK_COMMENT.replace_all(sql, " ");
    LINE_COMMENT.replace_all(&without_blocks, " ").into_owned()
}

fn leading_keyword(cleaned: &str) -> String {
    LEADING_WORD
        .captures(cleaned)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_ascii_uppercase())
        .unwrap_or_default()
}

fn check_params(params: &[Value]) -> Option<String> {
    params.iter().enumerate().find_map(|(i, p)| {
        let observed = json_param_type(p);
        match observed {
            "string" | "number" | "boolean" | "null" | "date" | "binary" => None,
            other => Some(format!(
                "Parameter at index {} has unsupported type '{}'. Allowed: string, number, boolean, null, date, binary",
                i, other
            )),
        }
    })
}
