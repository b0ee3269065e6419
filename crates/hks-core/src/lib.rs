//! Keystore storage engine. Persists opaque key blobs, certificate chains and root-key
//! material either as one file per alias (with a mirrored backup tree) or inside a single
//! HMAC-protected image, behind one `KeyStorage` interface.

pub mod audit;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod file_lock;
pub mod file_operator;
pub mod fs_utils;
pub mod models;
pub mod name_codec;
pub mod packed;
pub mod param_set;
pub mod path_resolver;
pub mod per_file;
pub mod storage;
pub mod upgrade;

pub use audit::{KeyAuditRecord, KeyOperation, anonymize_alias, record_key_operation};
pub use config::{StorageConfig, StorageMode};
pub use crypto::{CryptoEngine, SoftCryptoEngine};
pub use error::{HksError, HksResult};
pub use file_lock::FileLockRegistry;
pub use file_operator::{DirEntries, FileOperator, LocalFileOperator, MemoryFileOperator};
pub use models::{KeyInfo, ProcessInfo, Replica, StoreFileInfo, StorePath, StorageType};
pub use name_codec::{decode_name, encode_name};
pub use packed::{KeyRecord, KeyRecordBuilder, PackedHeader, PackedKeystore};
pub use param_set::{Param, ParamSet, ParamValue};
pub use path_resolver::PathResolver;
pub use per_file::{BackupWrite, DestroyReport, DestroyStep, PerFileKeystore, StoreOutcome};
pub use storage::{KeyStorage, StorageBackend};
pub use upgrade::{CleanupStep, RollbackAction, UpgradeDriver, UpgradeReport, UpgradeState};
