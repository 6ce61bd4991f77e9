//! Persistence-conflict taxonomy and classification.
//!
//! The taxonomy and the contract — a raw backend error matching one of the
//! known shapes never escapes unclassified — are vendor-neutral. The
//! *parsing* is vendor-specific: [`ConflictParser`] is the pluggable half a
//! driver supplies, and [`StandardConflictParser`] covers SQLSTATE codes and
//! the common PostgreSQL / MySQL / SQLite message shapes.
//!
//! Optimistic-concurrency losses are a special case: they are not backend
//! errors at all but purpose-built guard failures. A mutation on a
//! row-versioned entity embeds an affected-row-count check whose failure
//! message is the preformatted tag produced by [`concurrency_tag`]; the
//! classifier parses that tag back into [`ConflictKind::ConcurrentUpdate`].

use crate::error::DriverError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Tag prefix embedded in row-count guard failure messages.
pub const CONCURRENCY_TAG: &str = "RowVersionConflict";

/// Format the guard-failure message for a mutation on a row-versioned
/// entity: `RowVersionConflict/<operation>/<table>/<primaryKey>`.
#[must_use]
pub fn concurrency_tag(operation: &str, table: &str, primary_key: &str) -> String {
    format!("{CONCURRENCY_TAG}/{operation}/{table}/{primary_key}")
}

/// The classified kind of a persistence conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictKind {
    /// A unique index/constraint was violated.
    UniqueIndexViolation {
        /// Name of the violated index or constraint, when parseable.
        index: Option<String>,
        /// Column names involved, when the vendor message carries them.
        columns: Vec<String>,
    },
    /// The backend chose this transaction as a deadlock victim.
    Deadlock,
    /// A foreign-key constraint blocked the operation (typically a delete).
    IntegrityViolation {
        /// Name of the violated constraint, when parseable.
        constraint: Option<String>,
    },
    /// A row-version guard found zero affected rows: someone else changed or
    /// deleted the row since it was loaded.
    ConcurrentUpdate {
        /// The mutation that lost the race (Update or Delete).
        operation: String,
        /// Table of the stale row.
        table: String,
        /// Display form of the stale row's primary key.
        primary_key: String,
    },
}

impl ConflictKind {
    /// Deadlocks are transient; retrying the unit of work may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, ConflictKind::Deadlock)
    }
}

/// A classified persistence conflict, carrying the original vendor message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// The classification.
    pub kind: ConflictKind,
    /// The raw vendor message the classification was parsed from.
    pub message: String,
}

impl fmt::Display for ConflictInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConflictKind::UniqueIndexViolation { index, .. } => match index {
                Some(ix) => write!(f, "unique index violation on '{ix}'"),
                None => write!(f, "unique index violation"),
            },
            ConflictKind::Deadlock => write!(f, "deadlock victim"),
            ConflictKind::IntegrityViolation { constraint } => match constraint {
                Some(c) => write!(f, "integrity violation on '{c}'"),
                None => write!(f, "integrity violation"),
            },
            ConflictKind::ConcurrentUpdate {
                operation,
                table,
                primary_key,
            } => write!(
                f,
                "concurrent update lost: {operation} on {table} ({primary_key})"
            ),
        }
    }
}

/// The vendor-specific half of conflict classification.
///
/// Drivers implement this for their backend's message formats. Returning
/// `None` means "not a recognized conflict shape"; the raw error is then
/// surfaced as-is.
pub trait ConflictParser: Send + Sync {
    /// Attempt to classify a raw driver error.
    fn classify(&self, raw: &DriverError) -> Option<ConflictInfo>;
}

/// Classifier for the common vendor message shapes.
///
/// Recognizes SQLSTATE codes (23505 unique, 23503 foreign key, 40P01/40001
/// deadlock), MySQL vendor codes (1062, 1451/1452, 1213), PostgreSQL /
/// MySQL / SQLite message texts, and the [`concurrency_tag`] format.
#[derive(Debug, Default)]
pub struct StandardConflictParser;

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(r"{CONCURRENCY_TAG}/(\w+)/([^/\s]+)/(\S*)"))
            .expect("concurrency tag regex")
    })
}

fn pg_unique_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"violates unique constraint "([^"]+)""#).expect("pg unique regex")
    })
}

fn pg_unique_detail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Key \(([^)]+)\)=").expect("pg unique detail regex"))
}

fn mysql_unique_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Duplicate entry '.*' for key '([^']+)'").expect("mysql unique regex")
    })
}

fn sqlite_unique_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"UNIQUE constraint failed: (\S+)").expect("sqlite unique regex")
    })
}

fn fk_constraint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"violates foreign key constraint "([^"]+)""#).expect("fk regex")
    })
}

impl StandardConflictParser {
    fn classify_unique(&self, raw: &DriverError) -> Option<ConflictInfo> {
        let msg = &raw.message;

        if let Some(caps) = pg_unique_re().captures(msg) {
            let columns = pg_unique_detail_re()
                .captures(msg)
                .map(|c| {
                    c[1].split(',')
                        .map(|s| s.trim().to_string())
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            return Some(ConflictInfo {
                kind: ConflictKind::UniqueIndexViolation {
                    index: Some(caps[1].to_string()),
                    columns,
                },
                message: msg.clone(),
            });
        }
        if let Some(caps) = mysql_unique_re().captures(msg) {
            return Some(ConflictInfo {
                kind: ConflictKind::UniqueIndexViolation {
                    index: Some(caps[1].to_string()),
                    columns: Vec::new(),
                },
                message: msg.clone(),
            });
        }
        if let Some(caps) = sqlite_unique_re().captures(msg) {
            let columns: Vec<String> = caps[1]
                .split(',')
                .map(|s| s.trim().to_string())
                .collect();
            return Some(ConflictInfo {
                kind: ConflictKind::UniqueIndexViolation {
                    index: None,
                    columns,
                },
                message: msg.clone(),
            });
        }
        if raw.sqlstate.as_deref() == Some("23505") || raw.vendor_code == Some(1062) {
            return Some(ConflictInfo {
                kind: ConflictKind::UniqueIndexViolation {
                    index: None,
                    columns: Vec::new(),
                },
                message: msg.clone(),
            });
        }
        None
    }

    fn classify_integrity(&self, raw: &DriverError) -> Option<ConflictInfo> {
        let msg = &raw.message;

        if let Some(caps) = fk_constraint_re().captures(msg) {
            return Some(ConflictInfo {
                kind: ConflictKind::IntegrityViolation {
                    constraint: Some(caps[1].to_string()),
                },
                message: msg.clone(),
            });
        }
        let state_match = raw.sqlstate.as_deref() == Some("23503");
        let vendor_match = matches!(raw.vendor_code, Some(1451 | 1452));
        if state_match || vendor_match || msg.contains("FOREIGN KEY constraint failed") {
            return Some(ConflictInfo {
                kind: ConflictKind::IntegrityViolation { constraint: None },
                message: msg.clone(),
            });
        }
        None
    }

    fn classify_deadlock(&self, raw: &DriverError) -> Option<ConflictInfo> {
        let state_match = matches!(raw.sqlstate.as_deref(), Some("40P01" | "40001"));
        let vendor_match = raw.vendor_code == Some(1213);
        if state_match || vendor_match || raw.message.to_lowercase().contains("deadlock") {
            return Some(ConflictInfo {
                kind: ConflictKind::Deadlock,
                message: raw.message.clone(),
            });
        }
        None
    }

    fn classify_concurrent(&self, raw: &DriverError) -> Option<ConflictInfo> {
        let caps = tag_re().captures(&raw.message)?;
        Some(ConflictInfo {
            kind: ConflictKind::ConcurrentUpdate {
                operation: caps[1].to_string(),
                table: caps[2].to_string(),
                primary_key: caps[3].to_string(),
            },
            message: raw.message.clone(),
        })
    }
}

impl ConflictParser for StandardConflictParser {
    fn classify(&self, raw: &DriverError) -> Option<ConflictInfo> {
        // Tag check first: the guard message is ours and unambiguous.
        let info = self
            .classify_concurrent(raw)
            .or_else(|| self.classify_unique(raw))
            .or_else(|| self.classify_deadlock(raw))
            .or_else(|| self.classify_integrity(raw));
        if let Some(info) = &info {
            tracing::debug!(conflict = %info, "backend error classified");
        }
        info
    }
}
