//! One file per key blob, mirrored to a backup tree and repaired on read.

use std::{path::PathBuf, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
    audit::{KeyOperation, record_key_operation},
    config::StorageConfig,
    error::{HksError, HksResult},
    file_lock::FileLockRegistry,
    file_operator::FileOperator,
    models::{
        BACKUP_SUFFIX, KeyInfo, MAX_FILE_NAME_LEN, ProcessInfo, Replica, StoreFileInfo, StorePath,
        StorageType,
    },
    name_codec::decode_name,
    path_resolver::PathResolver,
};

/// What happened to the backup copy during a store. The main copy always succeeded.
#[derive(Debug)]
pub enum BackupWrite {
    Disabled,
    Written,
    Failed(HksError),
}

#[derive(Debug)]
pub struct StoreOutcome {
    pub backup: BackupWrite,
}

impl StoreOutcome {
    pub fn fully_replicated(&self) -> bool {
        !matches!(self.backup, BackupWrite::Failed(_))
    }
}

/// One sub-directory removal attempted by `destroy`.
#[derive(Debug)]
pub struct DestroyStep {
    pub replica: Replica,
    pub storage_type: StorageType,
    pub path: PathBuf,
    pub result: HksResult<()>,
}

/// Per-step results of a best-effort teardown.
#[derive(Debug, Default)]
pub struct DestroyReport {
    pub steps: Vec<DestroyStep>,
}

impl DestroyReport {
    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|step| step.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &DestroyStep> {
        self.steps.iter().filter(|step| step.result.is_err())
    }
}

#[derive(Debug, Clone, Copy)]
struct Presence {
    main: bool,
    backup: bool,
}

pub struct PerFileKeystore {
    resolver: PathResolver,
    ops: Arc<dyn FileOperator>,
    locks: FileLockRegistry,
    max_key_blob_size: usize,
    max_alias_size: usize,
}

impl PerFileKeystore {
    pub fn new(config: &StorageConfig, ops: Arc<dyn FileOperator>) -> Self {
        Self {
            resolver: PathResolver::from_config(config),
            ops,
            locks: FileLockRegistry::new(),
            max_key_blob_size: config.max_key_blob_size,
            max_alias_size: config.max_alias_size,
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    fn check_alias(&self, alias: &[u8]) -> HksResult<()> {
        if alias.is_empty() || alias.len() > self.max_alias_size {
            return Err(HksError::invalid(format!(
                "alias length {} outside 1..={}",
                alias.len(),
                self.max_alias_size
            )));
        }
        Ok(())
    }

    pub fn store_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
        blob: &[u8],
    ) -> HksResult<StoreOutcome> {
        self.check_alias(alias)?;
        if blob.is_empty() || blob.len() > self.max_key_blob_size {
            return Err(HksError::invalid(format!(
                "key blob of {} bytes outside 1..={}",
                blob.len(),
                self.max_key_blob_size
            )));
        }
        let info = self
            .resolver
            .resolve_file(self.ops.as_ref(), process, alias, storage_type)?;
        record_key_operation(KeyOperation::Save, &info.main.path, &info.main.file_name);

        self.save(&info.main, blob)?;

        let backup = match &info.backup {
            None => BackupWrite::Disabled,
            Some(location) => match self.save(location, blob) {
                Ok(()) => BackupWrite::Written,
                Err(err) => {
                    warn!(
                        path = %location.full_path().display(),
                        error = %err,
                        "backup copy not written"
                    );
                    BackupWrite::Failed(err)
                }
            },
        };
        Ok(StoreOutcome { backup })
    }

    pub fn delete_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<()> {
        self.check_alias(alias)?;
        let info = self
            .resolver
            .resolve_file(self.ops.as_ref(), process, alias, storage_type)?;
        record_key_operation(KeyOperation::Delete, &info.main.path, &info.main.file_name);

        let presence = self.presence(&info)?;
        if !presence.main && !presence.backup {
            return Err(HksError::NotExist(info.main.file_name.clone()));
        }
        if presence.main {
            self.remove(&info.main)?;
        }
        if presence.backup
            && let Some(backup) = &info.backup
        {
            self.remove(backup)?;
        }
        Ok(())
    }

    pub fn is_key_blob_exist(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<bool> {
        self.check_alias(alias)?;
        let info = self
            .resolver
            .resolve_file(self.ops.as_ref(), process, alias, storage_type)?;
        let presence = self.presence(&info)?;
        if !presence.main && !presence.backup {
            return Ok(false);
        }
        self.repair_logged(&info, presence);
        Ok(true)
    }

    /// Copy the stored blob into `buf` and return its length.
    pub fn get_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
        buf: &mut [u8],
    ) -> HksResult<usize> {
        self.check_alias(alias)?;
        let info = self
            .resolver
            .resolve_file(self.ops.as_ref(), process, alias, storage_type)?;
        record_key_operation(KeyOperation::Get, &info.main.path, &info.main.file_name);

        let presence = self.presence(&info)?;
        let source = Self::source(&info, presence)?;
        let result = self.read_copy(source, buf);
        self.repair_logged(&info, presence);
        result
    }

    /// Read the stored blob into a freshly allocated buffer.
    pub fn read_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<Vec<u8>> {
        self.check_alias(alias)?;
        let info = self
            .resolver
            .resolve_file(self.ops.as_ref(), process, alias, storage_type)?;
        record_key_operation(KeyOperation::Get, &info.main.path, &info.main.file_name);

        let presence = self.presence(&info)?;
        let source = Self::source(&info, presence)?;
        let result = self.read_to_vec(source);
        self.repair_logged(&info, presence);
        result
    }

    pub fn get_key_blob_size(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<usize> {
        self.check_alias(alias)?;
        let info = self
            .resolver
            .resolve_file(self.ops.as_ref(), process, alias, storage_type)?;
        let presence = self.presence(&info)?;
        let source = Self::source(&info, presence)?;
        let size = {
            let _guard = self.locks.acquire_read(&source.full_path());
            self.ops.size(&source.path, &source.file_name)?
        };
        if size == 0 {
            return Err(HksError::FileSizeFail(source.full_path().display().to_string()));
        }
        self.repair_logged(&info, presence);
        usize::try_from(size)
            .map_err(|_| HksError::FileSizeFail(source.full_path().display().to_string()))
    }

    /// Number of files in the caller's key directory; a missing directory counts as 0.
    pub fn get_key_count_by_process_name(&self, process: &ProcessInfo) -> HksResult<usize> {
        let dirs = self
            .resolver
            .resolve_type_dirs(self.ops.as_ref(), process, StorageType::Key)?;
        Ok(self.ops.list_dir(&dirs.main).count())
    }

    /// Decoded aliases of every key the process owns. `capacity` is the caller's list size;
    /// when more keys exist than fit, nothing is returned and the error carries the count.
    pub fn get_key_alias_by_process_name(
        &self,
        process: &ProcessInfo,
        capacity: usize,
    ) -> HksResult<Vec<KeyInfo>> {
        let dirs = self
            .resolver
            .resolve_type_dirs(self.ops.as_ref(), process, StorageType::Key)?;
        let count = self.ops.list_dir(&dirs.main).count();
        if count > capacity {
            return Err(HksError::BufferTooSmall {
                required: count,
                available: capacity,
            });
        }

        let mut aliases = Vec::with_capacity(count);
        for name in self.ops.list_dir(&dirs.main) {
            // the directory may have grown since it was counted
            if aliases.len() == capacity {
                return Err(HksError::BufferTooSmall {
                    required: capacity + 1,
                    available: capacity,
                });
            }
            let alias = decode_name(&name, MAX_FILE_NAME_LEN)?;
            aliases.push(KeyInfo {
                alias,
                param_set: None,
            });
        }
        Ok(aliases)
    }

    /// Remove the process's root-key, key and certchain directories in both trees. Every
    /// step is attempted; individual failures are only reported.
    pub fn destroy(&self, process: &ProcessInfo) -> HksResult<DestroyReport> {
        let dirs = self.resolver.process_dirs(process)?;
        let mut report = DestroyReport::default();
        let mut targets = vec![(Replica::Main, dirs.main, false)];
        if let Some(backup) = dirs.backup {
            targets.push((Replica::Backup, backup, true));
        }
        for (replica, process_dir, backup) in targets {
            for storage_type in StorageType::ALL {
                let dir_name = if backup {
                    format!("{}{BACKUP_SUFFIX}", storage_type.dir_name())
                } else {
                    storage_type.dir_name().to_string()
                };
                let path = process_dir.join(dir_name);
                if !self.ops.dir_exists(&path) {
                    continue;
                }
                let result = self.ops.remove_dir_all(&path);
                if let Err(err) = &result {
                    warn!(path = %path.display(), error = %err, "destroy step failed, continuing");
                }
                report.steps.push(DestroyStep {
                    replica,
                    storage_type,
                    path,
                    result,
                });
            }
        }
        info!(steps = report.steps.len(), clean = report.is_clean(), "process storage destroyed");
        Ok(report)
    }

    /// Resolved locations with the current file sizes filled in.
    pub fn get_file_info(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<StoreFileInfo> {
        self.check_alias(alias)?;
        let mut info = self
            .resolver
            .resolve_file(self.ops.as_ref(), process, alias, storage_type)?;
        info.main.size = self.ops.size(&info.main.path, &info.main.file_name)?;
        if let Some(backup) = info.backup.as_mut() {
            backup.size = self.ops.size(&backup.path, &backup.file_name)?;
        }
        Ok(info)
    }

    /// Drop every directory stored for `user_id` (account removal).
    pub fn delete_user_storage(&self, user_id: &[u8]) -> HksResult<()> {
        let dirs = self.resolver.user_dirs(user_id)?;
        info!(path = %dirs.main.display(), "deleting user storage");
        self.remove_trees(dirs.main, dirs.backup)
    }

    /// Drop everything one process of one user stored (application removal).
    pub fn delete_process_storage(&self, process: &ProcessInfo) -> HksResult<()> {
        let dirs = self.resolver.process_dirs(process)?;
        info!(path = %dirs.main.display(), "deleting process storage");
        self.remove_trees(dirs.main, dirs.backup)
    }

    fn remove_trees(&self, main: PathBuf, backup: Option<PathBuf>) -> HksResult<()> {
        let main_result = self.ops.remove_dir_all(&main);
        if let Some(backup) = backup
            && let Err(err) = self.ops.remove_dir_all(&backup)
        {
            warn!(path = %backup.display(), error = %err, "backup tree not removed");
            main_result?;
            return Err(err);
        }
        main_result
    }

    fn presence(&self, info: &StoreFileInfo) -> HksResult<Presence> {
        let main = self.ops.exists(&info.main.path, &info.main.file_name)?;
        let backup = match &info.backup {
            Some(backup) => self.ops.exists(&backup.path, &backup.file_name)?,
            None => false,
        };
        Ok(Presence { main, backup })
    }

    fn source(info: &StoreFileInfo, presence: Presence) -> HksResult<&StorePath> {
        if presence.main {
            return Ok(&info.main);
        }
        match (&info.backup, presence.backup) {
            (Some(backup), true) => Ok(backup),
            _ => Err(HksError::NotExist(info.main.file_name.clone())),
        }
    }

    fn save(&self, location: &StorePath, blob: &[u8]) -> HksResult<()> {
        self.ops.make_dir(&location.process_path)?;
        self.ops.make_dir(&location.path)?;
        let _guard = self.locks.acquire_write(&location.full_path());
        self.ops.write(&location.path, &location.file_name, 0, blob)
    }

    fn remove(&self, location: &StorePath) -> HksResult<()> {
        let _guard = self.locks.acquire_write(&location.full_path());
        self.ops.remove(&location.path, &location.file_name)
    }

    fn read_copy(&self, location: &StorePath, buf: &mut [u8]) -> HksResult<usize> {
        let _guard = self.locks.acquire_read(&location.full_path());
        let size = self.ops.size(&location.path, &location.file_name)?;
        let size = usize::try_from(size)
            .map_err(|_| HksError::FileSizeFail(location.full_path().display().to_string()))?;
        if size == 0 {
            return Err(HksError::FileSizeFail(
                location.full_path().display().to_string(),
            ));
        }
        if buf.len() < size {
            return Err(HksError::InsufficientData {
                required: size,
                available: buf.len(),
            });
        }
        let read = self
            .ops
            .read(&location.path, &location.file_name, 0, &mut buf[..size])?;
        if read == 0 {
            return Err(HksError::read_file(&location.full_path(), "no bytes read"));
        }
        Ok(read)
    }

    fn read_to_vec(&self, location: &StorePath) -> HksResult<Vec<u8>> {
        let _guard = self.locks.acquire_read(&location.full_path());
        let data = self.ops.read_to_vec(&location.path, &location.file_name)?;
        if data.is_empty() {
            return Err(HksError::FileSizeFail(
                location.full_path().display().to_string(),
            ));
        }
        Ok(data)
    }

    fn repair_logged(&self, info: &StoreFileInfo, presence: Presence) {
        match self.repair(info, presence) {
            Ok(Some(replica)) => {
                info!(file = %info.main.file_name, restored = ?replica, "missing copy restored");
            }
            Ok(None) => {}
            Err(err) => {
                warn!(file = %info.main.file_name, error = %err, "copy repair failed");
            }
        }
    }

    /// Restore whichever copy is missing from the one that exists.
    fn repair(&self, info: &StoreFileInfo, presence: Presence) -> HksResult<Option<Replica>> {
        let Some(backup) = &info.backup else {
            return Ok(None);
        };
        match (presence.main, presence.backup) {
            (false, true) => {
                self.copy_blob(backup, &info.main)?;
                Ok(Some(Replica::Main))
            }
            (true, false) => {
                self.copy_blob(&info.main, backup)?;
                Ok(Some(Replica::Backup))
            }
            _ => Ok(None),
        }
    }

    fn copy_blob(&self, source: &StorePath, dest: &StorePath) -> HksResult<()> {
        debug!(
            from = %source.full_path().display(),
            to = %dest.full_path().display(),
            "copying key blob between replicas"
        );
        let data = self.read_to_vec(source)?;
        self.save(dest, &data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_operator::MemoryFileOperator;
    use std::path::Path;

    fn keystore() -> (PerFileKeystore, Arc<MemoryFileOperator>) {
        let ops = Arc::new(MemoryFileOperator::new());
        let config = StorageConfig::per_file_under("/hks");
        (PerFileKeystore::new(&config, ops.clone()), ops)
    }

    fn proc_a() -> ProcessInfo {
        ProcessInfo::new("0", "proc-A")
    }

    #[test]
    fn store_writes_both_copies() {
        let (store, ops) = keystore();
        let outcome = store
            .store_key_blob(&proc_a(), b"k1", StorageType::Key, b"secret")
            .expect("store");
        assert!(matches!(outcome.backup, BackupWrite::Written));
        assert_eq!(
            ops.raw(Path::new("/hks/maindata/proc-A/key/k1")).expect("main"),
            b"secret"
        );
        assert_eq!(
            ops.raw(Path::new("/hks/bakdata/proc-A.bak/key.bak/k1.bak"))
                .expect("backup"),
            b"secret"
        );
    }

    #[test]
    fn backup_failure_does_not_fail_store() {
        let (store, ops) = keystore();
        ops.fail_writes_under("/hks/bakdata/proc-A.bak");
        let outcome = store
            .store_key_blob(&proc_a(), b"k1", StorageType::Key, b"secret")
            .expect("main write succeeds");
        assert!(matches!(outcome.backup, BackupWrite::Failed(_)));
        assert!(!outcome.fully_replicated());
        assert_eq!(
            store
                .read_key_blob(&proc_a(), b"k1", StorageType::Key)
                .expect("read"),
            b"secret"
        );
    }

    #[test]
    fn main_failure_fails_store() {
        let (store, ops) = keystore();
        ops.fail_writes_under("/hks/maindata/proc-A");
        assert!(
            store
                .store_key_blob(&proc_a(), b"k1", StorageType::Key, b"secret")
                .is_err()
        );
    }

    #[test]
    fn missing_backup_is_restored_from_main() {
        let (store, ops) = keystore();
        store
            .store_key_blob(&proc_a(), b"k1", StorageType::Key, b"secret")
            .expect("store");
        ops.remove(Path::new("/hks/bakdata/proc-A.bak/key.bak"), "k1.bak")
            .expect("drop backup");
        assert!(
            store
                .is_key_blob_exist(&proc_a(), b"k1", StorageType::Key)
                .expect("exists")
        );
        assert_eq!(
            ops.raw(Path::new("/hks/bakdata/proc-A.bak/key.bak/k1.bak"))
                .expect("restored"),
            b"secret"
        );
    }

    #[test]
    fn repair_failure_is_not_reported() {
        let (store, ops) = keystore();
        store
            .store_key_blob(&proc_a(), b"k1", StorageType::Key, b"secret")
            .expect("store");
        ops.remove(Path::new("/hks/maindata/proc-A/key"), "k1")
            .expect("drop main");
        ops.fail_writes_under("/hks/maindata/proc-A");
        let mut buf = [0u8; 16];
        let len = store
            .get_key_blob(&proc_a(), b"k1", StorageType::Key, &mut buf)
            .expect("served from backup");
        assert_eq!(&buf[..len], b"secret");
        assert!(ops.raw(Path::new("/hks/maindata/proc-A/key/k1")).is_none());
    }

    #[test]
    fn delete_removes_both_copies() {
        let (store, ops) = keystore();
        store
            .store_key_blob(&proc_a(), b"k1", StorageType::CertChain, b"chain")
            .expect("store");
        store
            .delete_key_blob(&proc_a(), b"k1", StorageType::CertChain)
            .expect("delete");
        assert_eq!(ops.file_count(), 0);
        assert!(
            store
                .delete_key_blob(&proc_a(), b"k1", StorageType::CertChain)
                .expect_err("second delete")
                .is_not_exist()
        );
    }

    #[test]
    fn delete_succeeds_with_only_backup_present() {
        let (store, ops) = keystore();
        store
            .store_key_blob(&proc_a(), b"k1", StorageType::Key, b"x")
            .expect("store");
        ops.remove(Path::new("/hks/maindata/proc-A/key"), "k1")
            .expect("drop main");
        store
            .delete_key_blob(&proc_a(), b"k1", StorageType::Key)
            .expect("delete backup only");
        assert_eq!(ops.file_count(), 0);
    }

    #[test]
    fn empty_file_reports_size_failure() {
        let (store, ops) = keystore();
        store
            .store_key_blob(&proc_a(), b"k1", StorageType::Key, b"x")
            .expect("store");
        ops.write(Path::new("/hks/maindata/proc-A/key"), "k1", 0, b"")
            .expect("truncate");
        assert!(matches!(
            store.get_key_blob_size(&proc_a(), b"k1", StorageType::Key),
            Err(HksError::FileSizeFail(_))
        ));
    }

    #[test]
    fn rejects_oversized_input() {
        let (store, _) = keystore();
        let alias = vec![b'a'; 65];
        assert!(matches!(
            store.store_key_blob(&proc_a(), &alias, StorageType::Key, b"x"),
            Err(HksError::InvalidArgument(_))
        ));
        let blob = vec![0u8; 8 * 1024 + 1];
        assert!(matches!(
            store.store_key_blob(&proc_a(), b"k", StorageType::Key, &blob),
            Err(HksError::InvalidArgument(_))
        ));
    }

    #[test]
    fn destroy_reports_each_step() {
        let (store, ops) = keystore();
        store
            .store_key_blob(&proc_a(), b"k1", StorageType::Key, b"x")
            .expect("store key");
        store
            .store_key_blob(&proc_a(), b"c1", StorageType::CertChain, b"y")
            .expect("store chain");
        let report = store.destroy(&proc_a()).expect("destroy");
        assert!(report.is_clean());
        // key + certchain in both trees; the empty root-key slot is skipped
        assert_eq!(report.steps.len(), 4);
        assert_eq!(ops.file_count(), 0);
    }
}
