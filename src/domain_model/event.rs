use serde::{Deserialize, Serialize};
use std::fmt;

pub const MESSAGES_TABLE: &str = "messages";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Untyped row-level change as pushed by the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "eventType")]
    pub kind: ChangeKind,
    pub table: String,
    #[serde(rename = "new")]
    pub row: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, table: &str, row: serde_json::Value) -> Self {
        Self {
            kind,
            table: table.to_owned(),
            row,
        }
    }
}
