//! SQL canonicalization and the read/write classifier.
//!
//! A handful of regex rules decide whether a statement modifies data and
//! which tables it touches. This is deliberately not a SQL parser: the
//! rules match the common statement shapes and the cache stays advisory.

use once_cell::sync::Lazy;
use regex::Regex;

/// Keywords that mark a statement as side-effecting, matched as a whole
/// word at the start of the statement or after whitespace. `pg_*()` calls
/// count too (administrative functions).
static MODIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:^|\s)(?i:INSERT|DELETE|UPDATE|LOCK|VACUUM|TRANSACTION|COMMIT|ROLLBACK|REINDEX|TRUNCATE|CREATE|ALTER|DROP|SET)\b",
    )
    .expect("modifier pattern compiles")
});

static ADMIN_FN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)pg_[a-z0-9_]*\(").expect("admin fn pattern compiles"));

/// Captures the lowercase table identifier a write statement targets.
static AFFECTED_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:^|\s)(?i:UPDATE|INSERT\s+INTO|DELETE\s+FROM|TRUNCATE|ALTER\s+TABLE|DROP\s+TABLE)\s+([a-z_][a-z0-9_]*)",
    )
    .expect("affected table pattern compiles")
});

/// Captures the lowercase table identifiers a read statement scans.
static READ_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?i:FROM|JOIN)\s+([a-z_][a-z0-9_]*)").expect("read table pattern compiles")
});

/// `NOW()` as its own token, any case — function names are
/// case-insensitive in PostgreSQL.
static NOW_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)(?i:NOW)\(\)").expect("now pattern compiles"));

/// Collapse whitespace runs to single spaces and trim both ends.
pub fn canonicalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical form of a statement supplied as fragments: the fragments are
/// joined with single spaces before normalization.
pub fn canonicalize_fragments(fragments: &[&str]) -> String {
    canonicalize(&fragments.join(" "))
}

/// Whether the canonical statement modifies data (or has side effects the
/// cache must treat as a write).
pub fn is_modifier(sql: &str) -> bool {
    MODIFIER.is_match(sql) || ADMIN_FN.is_match(sql)
}

/// Whether the first token is `SELECT`, case-insensitively. This is the
/// retry decorator's notion of "read-only", narrower than `!is_modifier`.
pub fn is_read_only(sql: &str) -> bool {
    sql.split_whitespace()
        .next()
        .map(|tok| tok.eq_ignore_ascii_case("SELECT"))
        .unwrap_or(false)
}

/// Tables a write statement affects. DDL like `CREATE` yields none;
/// `LOCK` is a modifier but never names a table here.
pub fn affected_tables(sql: &str) -> Vec<String> {
    let mut tables = Vec::new();
    for cap in AFFECTED_TABLE.captures_iter(sql) {
        let name = cap[1].to_string();
        if !tables.contains(&name) {
            tables.push(name);
        }
    }
    tables
}

/// Tables a read statement scans (`FROM` and `JOIN` targets).
pub fn read_tables(sql: &str) -> Vec<String> {
    let mut tables = Vec::new();
    for cap in READ_TABLE.captures_iter(sql) {
        let name = cap[1].to_string();
        if !tables.contains(&name) {
            tables.push(name);
        }
    }
    tables
}

/// Whether the statement contains a `NOW()` token. Such results are
/// time-dependent and must never be cached.
pub fn mentions_now(sql: &str) -> bool {
    NOW_TOKEN.is_match(sql)
}
