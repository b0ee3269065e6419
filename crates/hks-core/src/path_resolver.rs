//! Maps `(process, alias, storage type)` onto the per-file directory tree.
//!
//! ```text
//! <main>/[<user>/]<process>/<type>/<alias>
//! <bak>/[<user>/]<process>.bak/<type>.bak/<alias>.bak
//! ```
//!
//! The user level is omitted for the root user `"0"`.

use std::path::{Path, PathBuf};

use crate::{
    config::StorageConfig,
    error::{HksError, HksResult},
    file_operator::FileOperator,
    models::{
        BACKUP_SUFFIX, MAX_FILE_NAME_LEN, PROCESS_INFO_LEN, ProcessInfo, StoreFileInfo, StorePath,
        StorageType,
    },
    name_codec::encode_name,
};

/// Encoded directory names for one caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSegment {
    pub user: Option<String>,
    pub process: String,
}

impl ProcessSegment {
    pub fn encode(process: &ProcessInfo) -> HksResult<Self> {
        if process.user_id.is_empty() {
            return Err(HksError::invalid("user id must not be empty"));
        }
        if process.process_name.is_empty() {
            return Err(HksError::invalid("process name must not be empty"));
        }
        let encoded_process = encode_name(&process.process_name, MAX_FILE_NAME_LEN)?;
        let user = if process.is_root_user() {
            None
        } else {
            Some(encode_name(&process.user_id, PROCESS_INFO_LEN)?)
        };
        let segment_len = user.as_ref().map_or(0, |u| u.len() + 1) + encoded_process.len();
        if segment_len >= PROCESS_INFO_LEN {
            return Err(HksError::internal(format!(
                "user/process segment of {segment_len} bytes exceeds {PROCESS_INFO_LEN}"
            )));
        }
        Ok(Self {
            user,
            process: encoded_process,
        })
    }
}

/// Main and backup directories for one storage type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDirs {
    pub main: PathBuf,
    pub backup: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PathResolver {
    main_root: PathBuf,
    backup_root: Option<PathBuf>,
}

impl PathResolver {
    pub fn new(main_root: impl Into<PathBuf>, backup_root: Option<PathBuf>) -> Self {
        Self {
            main_root: main_root.into(),
            backup_root,
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        let backup_root = config.backup_enabled.then(|| config.backup_root.clone());
        Self::new(config.main_root.clone(), backup_root)
    }

    pub fn main_root(&self) -> &Path {
        &self.main_root
    }

    pub fn backup_root(&self) -> Option<&Path> {
        self.backup_root.as_deref()
    }

    /// Resolve both copies of one blob, creating the root and user directories on the way.
    /// Process and type directories are left to the writer.
    pub fn resolve_file(
        &self,
        ops: &dyn FileOperator,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<StoreFileInfo> {
        if alias.is_empty() {
            return Err(HksError::invalid("key alias must not be empty"));
        }
        let segment = ProcessSegment::encode(process)?;
        let file_name = encode_name(alias, MAX_FILE_NAME_LEN)?;

        let main_base = prepare_base(ops, &self.main_root, &segment)?;
        let main = store_path(&main_base, &segment, storage_type, &file_name, false)?;

        let backup = match &self.backup_root {
            Some(root) => {
                let base = prepare_base(ops, root, &segment)?;
                Some(store_path(&base, &segment, storage_type, &file_name, true)?)
            }
            None => None,
        };
        Ok(StoreFileInfo { main, backup })
    }

    /// Type directories for enumeration, with the same directory preparation as
    /// [`PathResolver::resolve_file`].
    pub fn resolve_type_dirs(
        &self,
        ops: &dyn FileOperator,
        process: &ProcessInfo,
        storage_type: StorageType,
    ) -> HksResult<TypeDirs> {
        let segment = ProcessSegment::encode(process)?;
        let main_base = prepare_base(ops, &self.main_root, &segment)?;
        let main = store_path(&main_base, &segment, storage_type, "", false)?.path;
        let backup = match &self.backup_root {
            Some(root) => {
                let base = prepare_base(ops, root, &segment)?;
                Some(store_path(&base, &segment, storage_type, "", true)?.path)
            }
            None => None,
        };
        Ok(TypeDirs { main, backup })
    }

    /// Process directories in both roots, without touching the file system.
    pub fn process_dirs(&self, process: &ProcessInfo) -> HksResult<TypeDirs> {
        let segment = ProcessSegment::encode(process)?;
        let locate = |root: &Path, backup: bool| -> HksResult<PathBuf> {
            let base = match &segment.user {
                Some(user) => join_checked(root, user, false)?,
                None => root.to_path_buf(),
            };
            join_checked(&base, &segment.process, backup)
        };
        let main = locate(&self.main_root, false)?;
        let backup = match &self.backup_root {
            Some(root) => Some(locate(root, true)?),
            None => None,
        };
        Ok(TypeDirs { main, backup })
    }

    /// Directories holding everything stored for `user_id`.
    pub fn user_dirs(&self, user_id: &[u8]) -> HksResult<TypeDirs> {
        if user_id.is_empty() {
            return Err(HksError::invalid("user id must not be empty"));
        }
        let user = encode_name(user_id, PROCESS_INFO_LEN)?;
        let main = join_checked(&self.main_root, &user, false)?;
        let backup = match &self.backup_root {
            Some(root) => Some(join_checked(root, &user, false)?),
            None => None,
        };
        Ok(TypeDirs { main, backup })
    }
}

fn prepare_base(
    ops: &dyn FileOperator,
    root: &Path,
    segment: &ProcessSegment,
) -> HksResult<PathBuf> {
    ops.make_dir(root)?;
    match &segment.user {
        Some(user) => {
            let user_dir = join_checked(root, user, false)?;
            ops.make_dir(&user_dir)?;
            Ok(user_dir)
        }
        None => Ok(root.to_path_buf()),
    }
}

fn store_path(
    base: &Path,
    segment: &ProcessSegment,
    storage_type: StorageType,
    file_name: &str,
    backup: bool,
) -> HksResult<StorePath> {
    let process_path = join_checked(base, &segment.process, backup)?;
    let path = join_checked(&process_path, storage_type.dir_name(), backup)?;
    let file_name = if file_name.is_empty() {
        String::new()
    } else {
        let name = if backup {
            format!("{file_name}{BACKUP_SUFFIX}")
        } else {
            file_name.to_string()
        };
        if name.len() >= MAX_FILE_NAME_LEN {
            return Err(HksError::internal(format!(
                "file name of {} bytes exceeds {MAX_FILE_NAME_LEN}",
                name.len()
            )));
        }
        name
    };
    Ok(StorePath {
        process_path,
        path,
        file_name,
        size: 0,
    })
}

fn join_checked(base: &Path, name: &str, backup: bool) -> HksResult<PathBuf> {
    let joined = if backup {
        base.join(format!("{name}{BACKUP_SUFFIX}"))
    } else {
        base.join(name)
    };
    if joined.as_os_str().len() >= MAX_FILE_NAME_LEN {
        return Err(HksError::internal(format!(
            "path {} exceeds {MAX_FILE_NAME_LEN} bytes",
            joined.display()
        )));
    }
    Ok(joined)
}
