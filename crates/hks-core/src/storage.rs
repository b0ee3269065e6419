//! Backend-independent keystore interface and the configured backend behind it.

use std::sync::Arc;

use tracing::info;

use crate::{
    config::{StorageConfig, StorageMode},
    crypto::{CryptoEngine, SoftCryptoEngine},
    error::HksResult,
    file_operator::{FileOperator, LocalFileOperator},
    models::{KeyInfo, ProcessInfo, StoreFileInfo, StorageType},
    packed::PackedKeystore,
    per_file::{BackupWrite, DestroyReport, PerFileKeystore, StoreOutcome},
};

/// Operations every backend offers. Backends without per-process directories ignore the
/// parts of `ProcessInfo` they cannot use.
pub trait KeyStorage: Send + Sync {
    fn store_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
        blob: &[u8],
    ) -> HksResult<StoreOutcome>;
    fn delete_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<()>;
    fn is_key_blob_exist(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<bool>;
    fn get_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
        buf: &mut [u8],
    ) -> HksResult<usize>;
    fn read_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<Vec<u8>>;
    fn get_key_blob_size(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<usize>;
    fn get_key_count_by_process_name(&self, process: &ProcessInfo) -> HksResult<usize>;
    fn get_key_alias_by_process_name(
        &self,
        process: &ProcessInfo,
        capacity: usize,
    ) -> HksResult<Vec<KeyInfo>>;
    fn destroy(&self, process: &ProcessInfo) -> HksResult<DestroyReport>;
    fn get_file_info(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<StoreFileInfo>;
}

impl KeyStorage for PerFileKeystore {
    fn store_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
        blob: &[u8],
    ) -> HksResult<StoreOutcome> {
        PerFileKeystore::store_key_blob(self, process, alias, storage_type, blob)
    }

    fn delete_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<()> {
        PerFileKeystore::delete_key_blob(self, process, alias, storage_type)
    }

    fn is_key_blob_exist(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<bool> {
        PerFileKeystore::is_key_blob_exist(self, process, alias, storage_type)
    }

    fn get_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
        buf: &mut [u8],
    ) -> HksResult<usize> {
        PerFileKeystore::get_key_blob(self, process, alias, storage_type, buf)
    }

    fn read_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<Vec<u8>> {
        PerFileKeystore::read_key_blob(self, process, alias, storage_type)
    }

    fn get_key_blob_size(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<usize> {
        PerFileKeystore::get_key_blob_size(self, process, alias, storage_type)
    }

    fn get_key_count_by_process_name(&self, process: &ProcessInfo) -> HksResult<usize> {
        PerFileKeystore::get_key_count_by_process_name(self, process)
    }

    fn get_key_alias_by_process_name(
        &self,
        process: &ProcessInfo,
        capacity: usize,
    ) -> HksResult<Vec<KeyInfo>> {
        PerFileKeystore::get_key_alias_by_process_name(self, process, capacity)
    }

    fn destroy(&self, process: &ProcessInfo) -> HksResult<DestroyReport> {
        PerFileKeystore::destroy(self, process)
    }

    fn get_file_info(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<StoreFileInfo> {
        PerFileKeystore::get_file_info(self, process, alias, storage_type)
    }
}

impl KeyStorage for PackedKeystore {
    fn store_key_blob(
        &self,
        _process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
        blob: &[u8],
    ) -> HksResult<StoreOutcome> {
        PackedKeystore::store_key_blob(self, alias, storage_type, blob)?;
        Ok(StoreOutcome {
            backup: BackupWrite::Disabled,
        })
    }

    fn delete_key_blob(
        &self,
        _process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<()> {
        PackedKeystore::delete_key_blob(self, alias, storage_type)
    }

    fn is_key_blob_exist(
        &self,
        _process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<bool> {
        PackedKeystore::is_key_blob_exist(self, alias, storage_type)
    }

    fn get_key_blob(
        &self,
        _process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
        buf: &mut [u8],
    ) -> HksResult<usize> {
        PackedKeystore::get_key_blob(self, alias, storage_type, buf)
    }

    fn read_key_blob(
        &self,
        _process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<Vec<u8>> {
        PackedKeystore::read_key_blob(self, alias, storage_type)
    }

    fn get_key_blob_size(
        &self,
        _process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<usize> {
        PackedKeystore::get_key_blob_size(self, alias, storage_type)
    }

    /// The image is shared by every process, so this is the image's record count.
    fn get_key_count_by_process_name(&self, _process: &ProcessInfo) -> HksResult<usize> {
        self.key_count()
    }

    fn get_key_alias_by_process_name(
        &self,
        _process: &ProcessInfo,
        capacity: usize,
    ) -> HksResult<Vec<KeyInfo>> {
        self.get_key_info_list(capacity)
    }

    fn destroy(&self, _process: &ProcessInfo) -> HksResult<DestroyReport> {
        Ok(PackedKeystore::destroy(self))
    }

    fn get_file_info(
        &self,
        _process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<StoreFileInfo> {
        PackedKeystore::get_file_info(self, alias, storage_type)
    }
}

/// The backend selected by `StorageConfig::mode`.
pub enum StorageBackend {
    PerFile(PerFileKeystore),
    Packed(PackedKeystore),
}

impl StorageBackend {
    pub fn from_config(
        config: &StorageConfig,
        ops: Arc<dyn FileOperator>,
        crypto: Arc<dyn CryptoEngine>,
    ) -> HksResult<Self> {
        config.validate()?;
        crypto.init()?;
        let backend = match config.mode {
            StorageMode::PerFile => Self::PerFile(PerFileKeystore::new(config, ops)),
            StorageMode::Packed => Self::Packed(PackedKeystore::new(config, ops, crypto)),
        };
        info!(mode = ?config.mode, "keystore backend ready");
        Ok(backend)
    }

    /// Backend over the local filesystem with the software crypto engine.
    pub fn open_local(config: &StorageConfig) -> HksResult<Self> {
        Self::from_config(
            config,
            Arc::new(LocalFileOperator::new()),
            Arc::new(SoftCryptoEngine::new()),
        )
    }

    pub fn mode(&self) -> StorageMode {
        match self {
            Self::PerFile(_) => StorageMode::PerFile,
            Self::Packed(_) => StorageMode::Packed,
        }
    }

    pub fn as_packed(&self) -> Option<&PackedKeystore> {
        match self {
            Self::Packed(store) => Some(store),
            Self::PerFile(_) => None,
        }
    }

    pub fn as_per_file(&self) -> Option<&PerFileKeystore> {
        match self {
            Self::PerFile(store) => Some(store),
            Self::Packed(_) => None,
        }
    }

    /// Reload cached state from disk. Only the packed image caches anything.
    pub fn refresh(&self) -> HksResult<()> {
        match self {
            Self::PerFile(_) => Ok(()),
            Self::Packed(store) => store.refresh(),
        }
    }

    fn inner(&self) -> &dyn KeyStorage {
        match self {
            Self::PerFile(store) => store,
            Self::Packed(store) => store,
        }
    }
}

impl KeyStorage for StorageBackend {
    fn store_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
        blob: &[u8],
    ) -> HksResult<StoreOutcome> {
        self.inner().store_key_blob(process, alias, storage_type, blob)
    }

    fn delete_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<()> {
        self.inner().delete_key_blob(process, alias, storage_type)
    }

    fn is_key_blob_exist(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<bool> {
        self.inner().is_key_blob_exist(process, alias, storage_type)
    }

    fn get_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
        buf: &mut [u8],
    ) -> HksResult<usize> {
        self.inner().get_key_blob(process, alias, storage_type, buf)
    }

    fn read_key_blob(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<Vec<u8>> {
        self.inner().read_key_blob(process, alias, storage_type)
    }

    fn get_key_blob_size(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<usize> {
        self.inner().get_key_blob_size(process, alias, storage_type)
    }

    fn get_key_count_by_process_name(&self, process: &ProcessInfo) -> HksResult<usize> {
        self.inner().get_key_count_by_process_name(process)
    }

    fn get_key_alias_by_process_name(
        &self,
        process: &ProcessInfo,
        capacity: usize,
    ) -> HksResult<Vec<KeyInfo>> {
        self.inner().get_key_alias_by_process_name(process, capacity)
    }

    fn destroy(&self, process: &ProcessInfo) -> HksResult<DestroyReport> {
        self.inner().destroy(process)
    }

    fn get_file_info(
        &self,
        process: &ProcessInfo,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<StoreFileInfo> {
        self.inner().get_file_info(process, alias, storage_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HksError;
    use crate::file_operator::MemoryFileOperator;
    use crate::packed::KeyRecordBuilder;

    fn backend(config: StorageConfig) -> StorageBackend {
        StorageBackend::from_config(
            &config,
            Arc::new(MemoryFileOperator::new()),
            Arc::new(SoftCryptoEngine::new()),
        )
        .expect("backend")
    }

    #[test]
    fn mode_follows_config() {
        assert_eq!(
            backend(StorageConfig::per_file_under("/hks")).mode(),
            StorageMode::PerFile
        );
        let packed = backend(StorageConfig::packed_under("/hks"));
        assert_eq!(packed.mode(), StorageMode::Packed);
        assert!(packed.as_packed().is_some());
        assert!(packed.as_per_file().is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = StorageConfig::per_file_under("/hks");
        config.max_key_count = 0;
        let result = StorageBackend::from_config(
            &config,
            Arc::new(MemoryFileOperator::new()),
            Arc::new(SoftCryptoEngine::new()),
        );
        assert!(matches!(result, Err(HksError::InvalidArgument(_))));
    }

    #[test]
    fn both_backends_round_trip_through_the_trait() {
        let process = ProcessInfo::new("0", "proc-A");
        for config in [
            StorageConfig::per_file_under("/hks"),
            StorageConfig::packed_under("/hks"),
        ] {
            let storage = backend(config);
            let blob = KeyRecordBuilder::new(b"k1", &[0xAB; 32])
                .build()
                .expect("record");
            storage
                .store_key_blob(&process, b"k1", StorageType::Key, &blob)
                .expect("store");
            assert_eq!(
                storage
                    .read_key_blob(&process, b"k1", StorageType::Key)
                    .expect("read"),
                blob
            );
            assert_eq!(storage.get_key_count_by_process_name(&process).expect("count"), 1);
            storage
                .delete_key_blob(&process, b"k1", StorageType::Key)
                .expect("delete");
            assert!(
                !storage
                    .is_key_blob_exist(&process, b"k1", StorageType::Key)
                    .expect("exists")
            );
        }
    }
}
