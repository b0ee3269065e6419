use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    error::{HksError, HksResult},
    models::{
        DEFAULT_MAX_ALIAS_SIZE, DEFAULT_MAX_KEY_BLOB_SIZE, DEFAULT_MAX_KEY_COUNT,
        DEFAULT_MAX_STORAGE_SIZE, MAX_FILE_NAME_LEN,
    },
    packed::HEADER_LEN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// One file per key blob under `<root>/<user>/<process>/<type>/`.
    #[default]
    PerFile,
    /// A single integrity-protected image file holding every key record.
    Packed,
}

impl std::str::FromStr for StorageMode {
    type Err = HksError;

    fn from_str(value: &str) -> HksResult<Self> {
        match value {
            "per_file" | "per-file" | "file" => Ok(StorageMode::PerFile),
            "packed" | "lite" => Ok(StorageMode::Packed),
            other => Err(HksError::invalid(format!("unknown storage mode {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: StorageMode,
    pub main_root: PathBuf,
    pub backup_root: PathBuf,
    pub backup_enabled: bool,
    pub packed_dir: PathBuf,
    pub packed_file_name: String,
    pub max_storage_size: usize,
    pub max_key_count: usize,
    pub max_key_blob_size: usize,
    pub max_alias_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::PerFile,
            main_root: PathBuf::from("/storage/data/service/el1/public/huks_service/maindata"),
            backup_root: PathBuf::from("/storage/data/service/el1/public/huks_service/bakdata"),
            backup_enabled: true,
            packed_dir: PathBuf::from("/storage/maindata"),
            packed_file_name: "hks_keystore".to_string(),
            max_storage_size: DEFAULT_MAX_STORAGE_SIZE,
            max_key_count: DEFAULT_MAX_KEY_COUNT,
            max_key_blob_size: DEFAULT_MAX_KEY_BLOB_SIZE,
            max_alias_size: DEFAULT_MAX_ALIAS_SIZE,
        }
    }
}

impl StorageConfig {
    /// Per-file layout rooted under `dir`, for embedding and tests.
    pub fn per_file_under(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            mode: StorageMode::PerFile,
            main_root: dir.join("maindata"),
            backup_root: dir.join("bakdata"),
            packed_dir: dir.join("maindata"),
            ..Self::default()
        }
    }

    /// Packed layout rooted under `dir`.
    pub fn packed_under(dir: impl AsRef<Path>) -> Self {
        Self {
            mode: StorageMode::Packed,
            ..Self::per_file_under(dir)
        }
    }

    /// Load TOML, or JSON when the file ends in `.json`. Missing fields take defaults.
    pub fn from_path<P: AsRef<Path>>(path: P) -> HksResult<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| HksError::read_file(path, e))?;
        let config: StorageConfig = if path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false)
        {
            serde_json::from_str(&contents).map_err(HksError::invalid)?
        } else {
            toml::from_str(&contents).map_err(HksError::invalid)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HksResult<()> {
        if self.max_storage_size < HEADER_LEN {
            return Err(HksError::invalid(format!(
                "max_storage_size {} is smaller than the {HEADER_LEN}-byte image header",
                self.max_storage_size
            )));
        }
        if u32::try_from(self.max_storage_size).is_err() {
            return Err(HksError::invalid("max_storage_size exceeds u32"));
        }
        if self.max_key_count == 0 || u16::try_from(self.max_key_count).is_err() {
            return Err(HksError::invalid(format!(
                "max_key_count must be within 1..=65535, got {}",
                self.max_key_count
            )));
        }
        if self.max_key_blob_size == 0 {
            return Err(HksError::invalid("max_key_blob_size must be positive"));
        }
        if self.max_alias_size == 0 || self.max_alias_size > usize::from(u8::MAX) {
            return Err(HksError::invalid(format!(
                "max_alias_size must be within 1..=255, got {}",
                self.max_alias_size
            )));
        }
        if self.packed_file_name.is_empty()
            || self.packed_file_name.contains('/')
            || self.packed_file_name.len() >= MAX_FILE_NAME_LEN
        {
            return Err(HksError::invalid(format!(
                "illegal packed_file_name {:?}",
                self.packed_file_name
            )));
        }
        for (name, root) in [
            ("main_root", &self.main_root),
            ("backup_root", &self.backup_root),
            ("packed_dir", &self.packed_dir),
        ] {
            if root.as_os_str().is_empty() {
                return Err(HksError::invalid(format!("{name} must not be empty")));
            }
        }
        if self.backup_enabled && self.main_root == self.backup_root {
            return Err(HksError::invalid(
                "backup_root must differ from main_root when backups are enabled",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let config = StorageConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.max_storage_size, 2 * 1024 * 1024);
        assert_eq!(config.max_key_count, 256);
        assert_eq!(config.mode, StorageMode::PerFile);
    }

    #[test]
    fn loads_partial_toml() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("storage.toml");
        std::fs::write(
            &path,
            "mode = \"packed\"\npacked_dir = \"/tmp/hks\"\nmax_key_count = 16\n",
        )
        .expect("write");
        let config = StorageConfig::from_path(&path).expect("load");
        assert_eq!(config.mode, StorageMode::Packed);
        assert_eq!(config.packed_dir, PathBuf::from("/tmp/hks"));
        assert_eq!(config.max_key_count, 16);
        assert_eq!(config.packed_file_name, "hks_keystore");
    }

    #[test]
    fn loads_json_by_extension() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("storage.json");
        std::fs::write(&path, r#"{"backup_enabled": false, "max_alias_size": 32}"#)
            .expect("write");
        let config = StorageConfig::from_path(&path).expect("load");
        assert!(!config.backup_enabled);
        assert_eq!(config.max_alias_size, 32);
    }

    #[test]
    fn rejects_impossible_limits() {
        let mut config = StorageConfig::default();
        config.max_storage_size = 10;
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default();
        config.max_key_count = 70_000;
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default();
        config.backup_root = config.main_root.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_mode_names() {
        assert_eq!("packed".parse::<StorageMode>().expect("mode"), StorageMode::Packed);
        assert_eq!("per_file".parse::<StorageMode>().expect("mode"), StorageMode::PerFile);
        assert!("sqlite".parse::<StorageMode>().is_err());
    }
}
