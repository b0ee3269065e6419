use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{Table, presets::UTF8_FULL};
use hks_core::{
    HksError, KeyStorage, LocalFileOperator, PackedKeystore, ProcessInfo, SoftCryptoEngine,
    StorageBackend, StorageConfig, StorageMode, StorageType, UpgradeDriver, UpgradeState,
    param_set::{ParamValue, TAG_ALGORITHM, TAG_KEY_SIZE, TAG_PURPOSE},
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Keystore storage operator tool",
    propagate_version = true
)]
struct Cli {
    /// Storage configuration file (TOML, or JSON by extension).
    #[arg(long, env = "HKS_CONFIG")]
    config: Option<PathBuf>,

    /// Override the storage mode from the configuration.
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    #[arg(long)]
    main_root: Option<PathBuf>,

    #[arg(long)]
    backup_root: Option<PathBuf>,

    /// Do not read or write backup copies.
    #[arg(long)]
    no_backup: bool,

    #[arg(long)]
    packed_dir: Option<PathBuf>,

    /// Owning user id. "0" is the system user.
    #[arg(long, default_value = "0")]
    user: String,

    /// Owning process name.
    #[arg(long, default_value = "hks_service")]
    process: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the aliases the process owns.
    List {
        #[arg(long, default_value_t = 256)]
        capacity: usize,
    },
    /// Count the keys the process owns.
    Count,
    /// Print the stored size of one blob.
    Size {
        /// Alias as UTF-8, or `hex:<bytes>`.
        alias: String,
        #[arg(long = "type", value_enum, default_value_t = TypeArg::Key)]
        storage_type: TypeArg,
    },
    /// Print one blob as hex.
    Get {
        alias: String,
        #[arg(long = "type", value_enum, default_value_t = TypeArg::Key)]
        storage_type: TypeArg,
    },
    /// Show where both copies of one blob live.
    Locate {
        alias: String,
        #[arg(long = "type", value_enum, default_value_t = TypeArg::Key)]
        storage_type: TypeArg,
    },
    /// Delete one blob and its backup.
    Delete {
        alias: String,
        #[arg(long = "type", value_enum, default_value_t = TypeArg::Key)]
        storage_type: TypeArg,
    },
    /// Remove everything the process stored.
    Destroy,
    /// Dump the packed image header and records.
    InspectImage {
        #[arg(long)]
        json: bool,
    },
    /// Migrate an old fixed-slot keystore into the configured backend.
    Upgrade {
        /// Directory holding the old keystore and root-key files.
        #[arg(long)]
        old_dir: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    PerFile,
    Packed,
}

impl From<ModeArg> for StorageMode {
    fn from(value: ModeArg) -> StorageMode {
        match value {
            ModeArg::PerFile => StorageMode::PerFile,
            ModeArg::Packed => StorageMode::Packed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum TypeArg {
    Key,
    CertChain,
    RootKey,
}

impl From<TypeArg> for StorageType {
    fn from(value: TypeArg) -> StorageType {
        match value {
            TypeArg::Key => StorageType::Key,
            TypeArg::CertChain => StorageType::CertChain,
            TypeArg::RootKey => StorageType::RootKey,
        }
    }
}

#[derive(Serialize)]
struct ImageSummary {
    path: String,
    version: u16,
    key_count: u16,
    total_len: u32,
    sealing_alg: u32,
    salt: String,
    records: Vec<RecordSummary>,
}

#[derive(Serialize)]
struct RecordSummary {
    alias: String,
    algorithm: Option<u32>,
    key_size: Option<u32>,
    purpose: Option<u32>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let ops = Arc::new(LocalFileOperator::new());
    let crypto = Arc::new(SoftCryptoEngine::new());
    let storage = StorageBackend::from_config(&config, ops.clone(), crypto.clone())
        .context("failed to open keystore")?;
    let process = ProcessInfo::new(cli.user.as_bytes(), cli.process.as_bytes());

    match &cli.command {
        Commands::List { capacity } => list_aliases(&storage, &process, *capacity)?,
        Commands::Count => {
            println!("{}", storage.get_key_count_by_process_name(&process)?);
        }
        Commands::Size {
            alias,
            storage_type,
        } => {
            let alias = parse_alias(alias)?;
            println!(
                "{}",
                storage.get_key_blob_size(&process, &alias, (*storage_type).into())?
            );
        }
        Commands::Get {
            alias,
            storage_type,
        } => {
            let alias = parse_alias(alias)?;
            let blob = storage.read_key_blob(&process, &alias, (*storage_type).into())?;
            println!("{}", hex::encode(blob));
        }
        Commands::Locate {
            alias,
            storage_type,
        } => {
            let alias = parse_alias(alias)?;
            let info = storage.get_file_info(&process, &alias, (*storage_type).into())?;
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Copy", "Path", "Size"]);
            table.add_row(vec![
                "main".to_string(),
                info.main.full_path().display().to_string(),
                info.main.size.to_string(),
            ]);
            if let Some(backup) = info.backup {
                table.add_row(vec![
                    "backup".to_string(),
                    backup.full_path().display().to_string(),
                    backup.size.to_string(),
                ]);
            }
            println!("{table}");
        }
        Commands::Delete {
            alias,
            storage_type,
        } => {
            let alias = parse_alias(alias)?;
            storage.delete_key_blob(&process, &alias, (*storage_type).into())?;
            println!("deleted");
        }
        Commands::Destroy => {
            let report = storage.destroy(&process)?;
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Copy", "Type", "Path", "Result"]);
            for step in &report.steps {
                table.add_row(vec![
                    format!("{:?}", step.replica),
                    step.storage_type.to_string(),
                    step.path.display().to_string(),
                    match &step.result {
                        Ok(()) => "removed".to_string(),
                        Err(err) => err.to_string(),
                    },
                ]);
            }
            println!("{table}");
            if !report.is_clean() {
                bail!("{} destroy step(s) failed", report.failures().count());
            }
        }
        Commands::InspectImage { json } => {
            let Some(packed) = storage.as_packed() else {
                bail!("inspect-image needs --mode packed");
            };
            print_image(packed, *json)?;
        }
        Commands::Upgrade { old_dir } => {
            let driver = UpgradeDriver::new(&storage, ops, crypto, old_dir.clone(), process);
            let report = driver.run().context("migration failed")?;
            info!(
                state = ?report.final_state,
                migrated = report.migrated.len(),
                "upgrade finished"
            );
            println!(
                "{:?}: {} migrated, {} empty slots skipped",
                report.final_state,
                report.migrated.len(),
                report.skipped
            );
            for step in report.rollback.iter().filter(|step| step.result.is_err()) {
                eprintln!(
                    "rollback of {} ({:?}) left behind",
                    String::from_utf8_lossy(&step.alias),
                    step.action
                );
            }
            for step in report.cleanup.iter().filter(|step| step.result.is_err()) {
                eprintln!("{} created by the migration left behind", step.path.display());
            }
            if report.final_state == UpgradeState::RolledBack
                && let Some(err) = report.failure
            {
                bail!("migration rolled back: {err}");
            }
        }
    }
    Ok(())
}

fn build_config(cli: &Cli) -> anyhow::Result<StorageConfig> {
    let mut config = match &cli.config {
        Some(path) => StorageConfig::from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => StorageConfig::default(),
    };
    if let Some(mode) = cli.mode {
        config.mode = mode.into();
    }
    if let Some(root) = &cli.main_root {
        config.main_root = root.clone();
    }
    if let Some(root) = &cli.backup_root {
        config.backup_root = root.clone();
    }
    if cli.no_backup {
        config.backup_enabled = false;
    }
    if let Some(dir) = &cli.packed_dir {
        config.packed_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn parse_alias(raw: &str) -> anyhow::Result<Vec<u8>> {
    match raw.strip_prefix("hex:") {
        Some(encoded) => hex::decode(encoded).context("alias is not valid hex"),
        None if raw.is_empty() => bail!("alias must not be empty"),
        None => Ok(raw.as_bytes().to_vec()),
    }
}

fn list_aliases(
    storage: &StorageBackend,
    process: &ProcessInfo,
    capacity: usize,
) -> anyhow::Result<()> {
    let infos = match storage.get_key_alias_by_process_name(process, capacity) {
        Ok(infos) => infos,
        Err(HksError::BufferTooSmall { required, .. }) => {
            bail!("{required} keys stored, rerun with --capacity {required}")
        }
        Err(err) => return Err(err.into()),
    };
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Alias", "Hex", "Parameters"]);
    for info in &infos {
        let params = info
            .param_set
            .as_ref()
            .map(|set| {
                set.params()
                    .iter()
                    .filter_map(|param| match &param.value {
                        ParamValue::Uint(value) => Some(format!("{:#010x}={value}", param.tag)),
                        ParamValue::Bool(value) => Some(format!("{:#010x}={value}", param.tag)),
                        ParamValue::Bytes(_) => None,
                    })
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        table.add_row(vec![info.alias_lossy(), hex::encode(&info.alias), params]);
    }
    println!("{table}");
    println!("{} key(s)", infos.len());
    Ok(())
}

fn print_image(packed: &PackedKeystore, json: bool) -> anyhow::Result<()> {
    let header = packed.header()?;
    let infos = packed.get_key_info_list(usize::from(header.key_count))?;
    let records = infos
        .iter()
        .map(|info| {
            let uint = |tag| info.param_set.as_ref().and_then(|set| set.get_uint(tag).ok());
            RecordSummary {
                alias: info.alias_lossy(),
                algorithm: uint(TAG_ALGORITHM),
                key_size: uint(TAG_KEY_SIZE),
                purpose: uint(TAG_PURPOSE),
            }
        })
        .collect();
    let summary = ImageSummary {
        path: packed.image_path().display().to_string(),
        version: header.version,
        key_count: header.key_count,
        total_len: header.total_len,
        sealing_alg: header.sealing_alg,
        salt: hex::encode(header.salt),
        records,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!(
        "{}: version {}, {} key(s), {} bytes, sealing alg {:#x}, salt {}",
        summary.path,
        summary.version,
        summary.key_count,
        summary.total_len,
        summary.sealing_alg,
        summary.salt
    );
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Alias", "Algorithm", "Key size", "Purpose"]);
    let show = |value: Option<u32>| value.map(|v| v.to_string()).unwrap_or_default();
    for record in &summary.records {
        table.add_row(vec![
            record.alias.clone(),
            show(record.algorithm),
            show(record.key_size),
            show(record.purpose),
        ]);
    }
    println!("{table}");
    Ok(())
}
