//! Audit trail of key-store mutations and reads. Entries go to the `hks::audit` tracing target
//! with the middle of the alias masked.

use std::path::Path;

use serde::Serialize;
use tracing::info;

/// Characters masked before the suffix.
const ANONYMOUS_LEN: usize = 4;
/// Characters kept verbatim at the end.
const SUFFIX_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyOperation {
    Save,
    Get,
    Delete,
}

impl KeyOperation {
    pub fn describe(self) -> &'static str {
        match self {
            KeyOperation::Save => "generate key or certchain",
            KeyOperation::Get => "use key",
            KeyOperation::Delete => "delete key or certchain",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyAuditRecord {
    pub operation: KeyOperation,
    pub storage_path: String,
    pub alias: String,
}

/// Mask the `ANONYMOUS_LEN` characters that precede the last `SUFFIX_LEN` ones. Shorter
/// aliases lose everything but their suffix.
pub fn anonymize_alias(alias: &str) -> String {
    let len = alias.chars().count();
    alias
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if len < i + 1 + ANONYMOUS_LEN + SUFFIX_LEN && i + 1 + SUFFIX_LEN <= len {
                '*'
            } else {
                c
            }
        })
        .collect()
}

/// Emit one audit entry for an operation on the encoded file `alias` under `storage_path`.
pub fn record_key_operation(
    operation: KeyOperation,
    storage_path: &Path,
    alias: &str,
) -> KeyAuditRecord {
    let record = KeyAuditRecord {
        operation,
        storage_path: storage_path.display().to_string(),
        alias: anonymize_alias(alias),
    };
    info!(
        target: "hks::audit",
        operation = ?record.operation,
        storage_path = %record.storage_path,
        key_alias = %record.alias,
        "{}",
        operation.describe()
    );
    record
}
