//! One-shot migration from the fixed-slot keystore format to the current storage backend.
//!
//! ```text
//! NotStarted -> RootKeyMigrated -> EngineReinitialized -> RecordsMigrated -> OldFilesRemoved
//!                      \________________ any failure ________________/
//!                                         RolledBack
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{info, warn};
use zeroize::{Zeroize, Zeroizing};

use crate::{
    codec::{ByteReader, ByteWriter, to_u8, to_u16},
    crypto::CryptoEngine,
    error::{HksError, HksResult},
    file_operator::FileOperator,
    models::{BACKUP_SUFFIX, ProcessInfo, StorageType},
    storage::{KeyStorage, StorageBackend},
};

pub const OLD_KEYSTORE_FILE: &str = "hks_keystore_old";
pub const OLD_ROOT_KEY_FILE: &str = "hks_rootkey_old";
pub const OLD_ROOT_KEY_BACKUP_FILE: &str = "hks_rootkey_old.bak";
/// Alias the root key is stored under after migration.
pub const ROOT_KEY_ALIAS: &[u8] = b"hks_root_key";

pub const OLD_HEADER_LEN: usize = 16;
pub const OLD_ALIAS_LEN: usize = 64;
/// `alias_size u8 | alias [64] | key_size u16`
pub const OLD_SLOT_PREFIX_LEN: usize = 1 + OLD_ALIAS_LEN + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    NotStarted,
    RootKeyMigrated,
    EngineReinitialized,
    RecordsMigrated,
    OldFilesRemoved,
    RolledBack,
    /// Root-key migration failed; old files were left alone.
    Aborted,
}

/// One occupied slot of an old keystore.
pub struct OldSlot {
    pub alias: Vec<u8>,
    pub key: Vec<u8>,
}

impl Drop for OldSlot {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for OldSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OldSlot")
            .field("alias", &String::from_utf8_lossy(&self.alias))
            .field("key_len", &self.key.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct OldKeystore {
    pub slots: Vec<OldSlot>,
    /// All-zero slots passed over.
    pub empty_slots: usize,
}

/// Parse an old keystore image: a 16-byte header followed by `slot_count` fixed-size slots.
pub fn parse_old_keystore(bytes: &[u8]) -> HksResult<OldKeystore> {
    let mut reader = ByteReader::new(bytes);
    let _version = reader.read_u16()?;
    let key_count = reader.read_u16()?;
    let slot_count = usize::from(reader.read_u16()?);
    let slot_size = usize::from(reader.read_u16()?);
    reader.skip(8)?;

    if slot_size <= OLD_SLOT_PREFIX_LEN {
        return Err(HksError::corrupt(format!(
            "old keystore slot size {slot_size} leaves no room for key material"
        )));
    }
    if reader.remaining() < slot_count * slot_size {
        return Err(HksError::corrupt(format!(
            "old keystore declares {slot_count} slots of {slot_size} bytes, {} bytes present",
            reader.remaining()
        )));
    }

    let mut slots = Vec::new();
    let mut empty_slots = 0;
    for index in 0..slot_count {
        let raw = reader.take(slot_size)?;
        if raw.iter().all(|&b| b == 0) {
            empty_slots += 1;
            continue;
        }
        let mut slot = ByteReader::new(raw);
        let alias_size = usize::from(slot.read_u8()?);
        let alias_field = slot.take(OLD_ALIAS_LEN)?;
        let key_size = usize::from(slot.read_u16()?);
        if alias_size == 0
            || alias_size > OLD_ALIAS_LEN
            || key_size == 0
            || key_size > slot.remaining()
        {
            return Err(HksError::corrupt(format!(
                "old keystore slot {index} has alias size {alias_size} and key size {key_size}"
            )));
        }
        slots.push(OldSlot {
            alias: alias_field[..alias_size].to_vec(),
            key: slot.take(key_size)?.to_vec(),
        });
    }
    if slots.len() != usize::from(key_count) {
        warn!(
            declared = key_count,
            found = slots.len(),
            "old keystore key count disagrees with occupied slots"
        );
    }
    Ok(OldKeystore { slots, empty_slots })
}

/// Build an old-format keystore image. Used to stage migrations.
pub fn encode_old_keystore(slot_size: usize, slots: &[OldSlot]) -> HksResult<Vec<u8>> {
    if slot_size <= OLD_SLOT_PREFIX_LEN {
        return Err(HksError::invalid("slot size leaves no room for key material"));
    }
    let mut writer = ByteWriter::with_capacity(OLD_HEADER_LEN + slot_size * slots.len());
    writer
        .put_u16(1)
        .put_u16(to_u16(slots.len(), "key count")?)
        .put_u16(to_u16(slots.len(), "slot count")?)
        .put_u16(to_u16(slot_size, "slot size")?)
        .put_bytes(&[0u8; 8]);
    for OldSlot { alias, key } in slots {
        if alias.len() > OLD_ALIAS_LEN || key.len() > slot_size - OLD_SLOT_PREFIX_LEN {
            return Err(HksError::invalid("entry does not fit in an old keystore slot"));
        }
        let mut alias_field = [0u8; OLD_ALIAS_LEN];
        alias_field[..alias.len()].copy_from_slice(alias);
        writer
            .put_u8(to_u8(alias.len(), "alias size")?)
            .put_bytes(&alias_field)
            .put_u16(to_u16(key.len(), "key size")?)
            .put_bytes(key)
            .put_bytes(&vec![0u8; slot_size - OLD_SLOT_PREFIX_LEN - key.len()]);
    }
    Ok(writer.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackAction {
    /// The alias was new to the store and has been removed.
    Deleted,
    /// The alias held a blob before the migration; that blob was written back.
    Restored,
}

#[derive(Debug)]
pub struct RollbackStep {
    pub alias: Vec<u8>,
    pub storage_type: StorageType,
    pub action: RollbackAction,
    pub result: HksResult<()>,
}

/// A file or directory the migration created and the rollback removed.
#[derive(Debug)]
pub struct CleanupStep {
    pub path: PathBuf,
    pub result: HksResult<()>,
}

#[derive(Debug)]
pub struct UpgradeReport {
    pub final_state: UpgradeState,
    /// Aliases written to the current store, in slot order.
    pub migrated: Vec<Vec<u8>>,
    pub skipped: usize,
    pub rollback: Vec<RollbackStep>,
    pub cleanup: Vec<CleanupStep>,
    /// The failure that ended the run early, if any.
    pub failure: Option<HksError>,
}

impl UpgradeReport {
    fn new(final_state: UpgradeState) -> Self {
        Self {
            final_state,
            migrated: Vec::new(),
            skipped: 0,
            rollback: Vec::new(),
            cleanup: Vec::new(),
            failure: None,
        }
    }
}

pub struct UpgradeDriver<'a> {
    storage: &'a StorageBackend,
    ops: Arc<dyn FileOperator>,
    crypto: Arc<dyn CryptoEngine>,
    old_dir: PathBuf,
    process: ProcessInfo,
}

impl<'a> UpgradeDriver<'a> {
    /// `process` is the identity migrated keys are stored under in per-file mode.
    pub fn new(
        storage: &'a StorageBackend,
        ops: Arc<dyn FileOperator>,
        crypto: Arc<dyn CryptoEngine>,
        old_dir: impl Into<PathBuf>,
        process: ProcessInfo,
    ) -> Self {
        Self {
            storage,
            ops,
            crypto,
            old_dir: old_dir.into(),
            process,
        }
    }

    pub fn old_dir(&self) -> &Path {
        &self.old_dir
    }

    /// Run the migration. `Err` is only returned when the old files could not be inspected
    /// or removed; rollbacks and aborts are reported through `UpgradeReport`.
    pub fn run(&self) -> HksResult<UpgradeReport> {
        if !self.ops.exists(&self.old_dir, OLD_KEYSTORE_FILE)? {
            return Ok(UpgradeReport::new(UpgradeState::NotStarted));
        }
        info!(dir = %self.old_dir.display(), "old keystore found, migrating");
        let footprint = self.footprint()?;

        match self.migrate_root_key() {
            Ok(RootKeyStep::AlreadyMigrated) => {
                info!("root key already in current format, removing old files");
                self.remove_old_files()?;
                return Ok(UpgradeReport::new(UpgradeState::OldFilesRemoved));
            }
            Ok(RootKeyStep::Migrated) => {}
            Err(err) => {
                warn!(error = %err, "root key migration failed, leaving old files in place");
                let mut report = UpgradeReport::new(UpgradeState::Aborted);
                report.failure = Some(err);
                return Ok(report);
            }
        }

        let mut report = UpgradeReport::new(UpgradeState::RootKeyMigrated);
        let mut journal = Vec::new();
        if let Err(err) = self.reinitialize() {
            return Ok(self.roll_back(report, journal, &footprint, err));
        }
        report.final_state = UpgradeState::EngineReinitialized;

        if let Err(err) = self.migrate_records(&mut report, &mut journal) {
            return Ok(self.roll_back(report, journal, &footprint, err));
        }
        report.final_state = UpgradeState::RecordsMigrated;

        self.remove_old_files()?;
        report.final_state = UpgradeState::OldFilesRemoved;
        info!(
            migrated = report.migrated.len(),
            skipped = report.skipped,
            "keystore migration complete"
        );
        Ok(report)
    }

    /// Note which directories and image file are missing before anything is written.
    fn footprint(&self) -> HksResult<Footprint> {
        let mut fresh_dirs = Vec::new();
        let fresh_image = match self.storage {
            StorageBackend::Packed(packed) => {
                fresh_dirs.extend(self.first_missing(packed.dir(), packed.dir()));
                !packed.image_exists()?
            }
            StorageBackend::PerFile(store) => {
                let resolver = store.resolver();
                let dirs = resolver.process_dirs(&self.process)?;
                for storage_type in [StorageType::RootKey, StorageType::Key] {
                    let name = storage_type.dir_name();
                    let mut chains = vec![(resolver.main_root(), dirs.main.join(name))];
                    if let (Some(root), Some(backup)) = (resolver.backup_root(), &dirs.backup) {
                        chains.push((root, backup.join(format!("{name}{BACKUP_SUFFIX}"))));
                    }
                    for (root, leaf) in chains {
                        if let Some(dir) = self.first_missing(root, &leaf)
                            && !fresh_dirs.contains(&dir)
                        {
                            fresh_dirs.push(dir);
                        }
                    }
                }
                false
            }
        };
        Ok(Footprint {
            fresh_dirs,
            fresh_image,
        })
    }

    /// Shallowest directory between `root` and `leaf`, both included, that does not exist.
    fn first_missing(&self, root: &Path, leaf: &Path) -> Option<PathBuf> {
        let mut chain: Vec<&Path> = leaf
            .ancestors()
            .take_while(|dir| dir.starts_with(root))
            .collect();
        chain.reverse();
        chain
            .into_iter()
            .find(|dir| !self.ops.dir_exists(dir))
            .map(Path::to_path_buf)
    }

    fn migrate_root_key(&self) -> HksResult<RootKeyStep> {
        if self
            .storage
            .is_key_blob_exist(&self.process, ROOT_KEY_ALIAS, StorageType::RootKey)?
        {
            return Ok(RootKeyStep::AlreadyMigrated);
        }
        let source = if self.ops.exists(&self.old_dir, OLD_ROOT_KEY_FILE)? {
            OLD_ROOT_KEY_FILE
        } else if self.ops.exists(&self.old_dir, OLD_ROOT_KEY_BACKUP_FILE)? {
            OLD_ROOT_KEY_BACKUP_FILE
        } else {
            return Err(HksError::NotExist(OLD_ROOT_KEY_FILE.to_string()));
        };
        let mut material = self.ops.read_to_vec(&self.old_dir, source)?;
        if material.is_empty() {
            return Err(HksError::FileSizeFail(
                self.old_dir.join(source).display().to_string(),
            ));
        }
        let stored = self.storage.store_key_blob(
            &self.process,
            ROOT_KEY_ALIAS,
            StorageType::RootKey,
            &material,
        );
        material.zeroize();
        stored?;
        Ok(RootKeyStep::Migrated)
    }

    fn reinitialize(&self) -> HksResult<()> {
        self.crypto.init()?;
        self.storage.refresh()
    }

    fn migrate_records(
        &self,
        report: &mut UpgradeReport,
        journal: &mut Vec<JournalEntry>,
    ) -> HksResult<()> {
        let bytes = self.ops.read_to_vec(&self.old_dir, OLD_KEYSTORE_FILE)?;
        let old = parse_old_keystore(&bytes)?;
        report.skipped = old.empty_slots;
        for slot in &old.slots {
            let record = Zeroizing::new(self.crypto.upgrade_key_info(&slot.alias, &slot.key)?);
            let prior = match self
                .storage
                .read_key_blob(&self.process, &slot.alias, StorageType::Key)
            {
                Ok(blob) => Some(Zeroizing::new(blob)),
                Err(err) if err.is_not_exist() => None,
                Err(err) => return Err(err),
            };
            // journaled before the write so a half-written alias is undone too
            journal.push(JournalEntry {
                alias: slot.alias.clone(),
                prior,
            });
            self.storage
                .store_key_blob(&self.process, &slot.alias, StorageType::Key, &record)?;
            report.migrated.push(slot.alias.clone());
        }
        Ok(())
    }

    /// Undo every write made so far, newest first: records, then the root key, then any
    /// directory or image file the run created.
    fn roll_back(
        &self,
        mut report: UpgradeReport,
        journal: Vec<JournalEntry>,
        footprint: &Footprint,
        err: HksError,
    ) -> UpgradeReport {
        warn!(error = %err, state = ?report.final_state, "migration failed, rolling back");
        for JournalEntry { alias, prior } in journal.into_iter().rev() {
            let (action, result) = match &prior {
                Some(blob) => (
                    RollbackAction::Restored,
                    self.storage
                        .store_key_blob(&self.process, &alias, StorageType::Key, blob)
                        .map(|_| ()),
                ),
                None => (RollbackAction::Deleted, self.forget(&alias, StorageType::Key)),
            };
            report.rollback.push(rollback_step(alias, StorageType::Key, action, result));
        }
        let result = self.forget(ROOT_KEY_ALIAS, StorageType::RootKey);
        report.rollback.push(rollback_step(
            ROOT_KEY_ALIAS.to_vec(),
            StorageType::RootKey,
            RollbackAction::Deleted,
            result,
        ));

        if footprint.fresh_image
            && let Some(packed) = self.storage.as_packed()
        {
            for step in packed.destroy().steps {
                report.cleanup.push(CleanupStep {
                    path: step.path,
                    result: step.result,
                });
            }
        }
        for dir in &footprint.fresh_dirs {
            let result = self.ops.remove_dir_all(dir);
            if let Err(err) = &result {
                warn!(
                    path = %dir.display(),
                    error = %err,
                    "directory created by migration left behind"
                );
            }
            report.cleanup.push(CleanupStep {
                path: dir.clone(),
                result,
            });
        }

        report.migrated.clear();
        report.final_state = UpgradeState::RolledBack;
        report.failure = Some(err);
        report
    }

    /// Delete `alias`; already gone counts as done.
    fn forget(&self, alias: &[u8], storage_type: StorageType) -> HksResult<()> {
        match self.storage.delete_key_blob(&self.process, alias, storage_type) {
            Err(err) if err.is_not_exist() => Ok(()),
            other => other,
        }
    }

    fn remove_old_files(&self) -> HksResult<()> {
        for name in [OLD_ROOT_KEY_FILE, OLD_ROOT_KEY_BACKUP_FILE, OLD_KEYSTORE_FILE] {
            self.ops.remove(&self.old_dir, name)?;
        }
        Ok(())
    }
}

enum RootKeyStep {
    Migrated,
    AlreadyMigrated,
}

/// A record about to be written, with whatever the store held under that alias before.
struct JournalEntry {
    alias: Vec<u8>,
    prior: Option<Zeroizing<Vec<u8>>>,
}

/// What did not exist on disk before the run started.
struct Footprint {
    /// Shallowest missing directory on the way to each type directory the run writes.
    fresh_dirs: Vec<PathBuf>,
    fresh_image: bool,
}

fn rollback_step(
    alias: Vec<u8>,
    storage_type: StorageType,
    action: RollbackAction,
    result: HksResult<()>,
) -> RollbackStep {
    if let Err(err) = &result {
        warn!(
            alias = %String::from_utf8_lossy(&alias),
            ?action,
            error = %err,
            "rollback step failed"
        );
    }
    RollbackStep {
        alias,
        storage_type,
        action,
        result,
    }
}
