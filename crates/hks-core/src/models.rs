use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::param_set::ParamSet;

/// Longest directory or file path the engine will compose.
pub const MAX_FILE_NAME_LEN: usize = 512;
/// Longest encoded `user[/process]` segment.
pub const PROCESS_INFO_LEN: usize = 128;
pub const DEFAULT_MAX_ALIAS_SIZE: usize = 64;
pub const DEFAULT_MAX_STORAGE_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_MAX_KEY_COUNT: usize = 256;
pub const DEFAULT_MAX_KEY_BLOB_SIZE: usize = 8 * 1024;

/// User id of the platform's root/system user. Its keys live one level higher in the tree.
pub const ROOT_USER_ID: &[u8] = b"0";
pub const BACKUP_SUFFIX: &str = ".bak";

pub const KEY_DIR: &str = "key";
pub const CERTCHAIN_DIR: &str = "certchain";
pub const ROOT_KEY_DIR: &str = "info";

/// Caller identity the service layer resolved for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessInfo {
    pub user_id: Vec<u8>,
    pub process_name: Vec<u8>,
}

impl ProcessInfo {
    pub fn new(user_id: impl Into<Vec<u8>>, process_name: impl Into<Vec<u8>>) -> Self {
        Self {
            user_id: user_id.into(),
            process_name: process_name.into(),
        }
    }

    pub fn is_root_user(&self) -> bool {
        self.user_id == ROOT_USER_ID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Key,
    CertChain,
    RootKey,
}

impl StorageType {
    pub fn dir_name(self) -> &'static str {
        match self {
            StorageType::Key => KEY_DIR,
            StorageType::CertChain => CERTCHAIN_DIR,
            StorageType::RootKey => ROOT_KEY_DIR,
        }
    }

    pub const ALL: [StorageType; 3] = [
        StorageType::RootKey,
        StorageType::Key,
        StorageType::CertChain,
    ];
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One resolved location: the process directory, the type directory below it and the file.
/// `size` is the file length observed when the location was inspected, 0 when not yet looked at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePath {
    pub process_path: PathBuf,
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
}

impl StorePath {
    pub fn full_path(&self) -> PathBuf {
        self.path.join(&self.file_name)
    }
}

/// Main and (optional) backup location of one logical blob. Built per call, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFileInfo {
    pub main: StorePath,
    pub backup: Option<StorePath>,
}

/// One enumeration result. Per-file storage only knows the alias; the packed image also
/// reconstructs the key's parameters from its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub alias: Vec<u8>,
    pub param_set: Option<ParamSet>,
}

impl KeyInfo {
    pub fn alias_lossy(&self) -> String {
        String::from_utf8_lossy(&self.alias).into_owned()
    }
}

/// Which physical copy an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replica {
    Main,
    Backup,
}
