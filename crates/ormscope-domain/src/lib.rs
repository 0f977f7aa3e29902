#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct InstanceId(pub Ulid);

impl InstanceId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one captured call. Strictly increasing in allocation order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Shared source of [`CallId`]s.
///
/// Ids start at 1 and never repeat for the lifetime of the sequence, regardless
/// of how fast calls are issued.
#[derive(Debug, Default)]
pub struct CallIdSequence {
    last: AtomicU64,
}

impl CallIdSequence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> CallId {
        CallId(self.last.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The id the next call to [`CallIdSequence::next_id`] will hand out.
    #[must_use]
    pub fn peek(&self) -> CallId {
        CallId(self.last.load(Ordering::SeqCst) + 1)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum StatementKind {
    #[serde(rename = "DDL")]
    Ddl,
    #[serde(rename = "DML")]
    Dml,
}

/// Classify a statement by its leading keyword.
///
/// Leading whitespace and `--` line comments are skipped. `CREATE`, `ALTER`
/// and `DROP` are DDL; everything else, including empty input, is DML.
#[must_use]
pub fn classify_statement(statement: &str) -> StatementKind {
    let mut rest = statement.trim_start();
    while let Some(comment) = rest.strip_prefix("--") {
        rest = comment
            .split_once('\n')
            .map_or("", |(_, tail)| tail)
            .trim_start();
    }

    let keyword: String = rest
        .chars()
        .take_while(char::is_ascii_alphabetic)
        .collect::<String>()
        .to_ascii_uppercase();
    match keyword.as_str() {
        "CREATE" | "ALTER" | "DROP" => StatementKind::Ddl,
        _ => StatementKind::Dml,
    }
}

/// Phase of execution a call was issued from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CallTag {
    Script,
    Provisioning,
    EntryProcedure,
    Interactive,
    Introspection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceAttribution {
    pub line: Option<usize>,
    pub context: Option<String>,
}

impl SourceAttribution {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.line.is_none()
    }
}

/// One intercepted data-access operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapturedCall {
    pub id: CallId,
    pub instance_id: InstanceId,
    pub statement: String,
    /// Bound parameters. For an execute-many call every element is itself an
    /// array holding one parameter set.
    pub parameters: Vec<Value>,
    pub many: bool,
    pub execution_time_micros: u64,
    pub kind: StatementKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<CallTag>,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: DateTimeUtc,
}

/// Content fingerprint of a runtime configuration, as lowercase hex SHA-256.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(hash_bytes(bytes))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::{classify_statement, CallIdSequence, StatementKind};

    #[test]
    fn ddl_keywords_are_classified_case_insensitively() {
        assert_eq!(classify_statement("CREATE TABLE t (id INTEGER)"), StatementKind::Ddl);
        assert_eq!(classify_statement("  alter table t add c"), StatementKind::Ddl);
        assert_eq!(classify_statement("drop table t"), StatementKind::Ddl);
        assert_eq!(
            classify_statement("-- provisioning\nCREATE TABLE t (id INTEGER)"),
            StatementKind::Ddl
        );
    }

    #[test]
    fn everything_else_is_dml() {
        assert_eq!(classify_statement("SELECT 1"), StatementKind::Dml);
        assert_eq!(classify_statement("INSERT INTO t VALUES (1)"), StatementKind::Dml);
        assert_eq!(classify_statement("PRAGMA table_info(t)"), StatementKind::Dml);
        assert_eq!(classify_statement("CREATED"), StatementKind::Dml);
        assert_eq!(classify_statement(""), StatementKind::Dml);
    }

    #[test]
    fn call_ids_are_strictly_increasing() {
        let sequence = CallIdSequence::new();
        assert_eq!(sequence.peek().0, 1);
        let first = sequence.next_id();
        let second = sequence.next_id();
        assert!(second > first);
        assert_eq!(sequence.peek().0, 3);
    }
}
