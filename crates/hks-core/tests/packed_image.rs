use std::{fs, sync::Arc, thread};

use hks_core::{
    HksError, KeyRecordBuilder, KeyStorage, LocalFileOperator, PackedKeystore, ProcessInfo,
    SoftCryptoEngine, StorageBackend, StorageConfig, StorageType,
    packed::{HEADER_LEN, HEADER_MAC_INPUT_LEN},
    param_set::{TAG_ALGORITHM, TAG_KEY_ALIAS, TAG_KEY_SIZE, TAG_PURPOSE},
};
use tempfile::TempDir;

fn keystore(config: &StorageConfig) -> PackedKeystore {
    PackedKeystore::new(
        config,
        Arc::new(LocalFileOperator::new()),
        Arc::new(SoftCryptoEngine::new()),
    )
}

fn record(alias: &str, fill: u8, len: usize) -> Vec<u8> {
    KeyRecordBuilder::new(alias.as_bytes(), &vec![fill; len])
        .alg(20)
        .key_len(u16::try_from(len * 8).expect("bits"))
        .purpose(3)
        .build()
        .expect("record")
}

fn store(keystore: &PackedKeystore, alias: &str, blob: &[u8]) {
    keystore
        .store_key_blob(alias.as_bytes(), StorageType::Key, blob)
        .expect("store");
}

#[test]
fn records_survive_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let config = StorageConfig::packed_under(dir.path());
    let a = record("alpha", 1, 16);
    let b = record("beta", 2, 32);
    {
        let first = keystore(&config);
        store(&first, "alpha", &a);
        store(&first, "beta", &b);
    }

    let reopened = keystore(&config);
    assert_eq!(reopened.key_count().expect("count"), 2);
    assert_eq!(reopened.read_key_blob(b"alpha", StorageType::Key).expect("alpha"), a);
    assert_eq!(reopened.read_key_blob(b"beta", StorageType::Key).expect("beta"), b);

    let on_disk = fs::read(reopened.image_path()).expect("image file");
    assert_eq!(on_disk.len(), HEADER_LEN + a.len() + b.len());
    let header = reopened.header().expect("header");
    assert_eq!(header.total_len as usize, on_disk.len());
}

#[test]
fn k1_record_round_trips_through_the_facade() {
    let dir = TempDir::new().expect("tempdir");
    let storage = StorageBackend::open_local(&StorageConfig::packed_under(dir.path()))
        .expect("packed backend");
    let process = ProcessInfo::new("0", "proc-A");
    let blob = record("k1", 0xAB, 32);

    storage
        .store_key_blob(&process, b"k1", StorageType::Key, &blob)
        .expect("store");
    assert_eq!(
        storage
            .get_key_blob_size(&process, b"k1", StorageType::Key)
            .expect("size"),
        blob.len()
    );
    let mut exact = vec![0u8; blob.len()];
    storage
        .get_key_blob(&process, b"k1", StorageType::Key, &mut exact)
        .expect("get");
    assert_eq!(exact, blob);
    let mut short = [0u8; 16];
    assert!(matches!(
        storage.get_key_blob(&process, b"k1", StorageType::Key, &mut short),
        Err(HksError::InsufficientData { .. })
    ));

    storage
        .delete_key_blob(&process, b"k1", StorageType::Key)
        .expect("delete");
    assert!(
        storage
            .get_key_blob(&process, b"k1", StorageType::Key, &mut exact)
            .expect_err("deleted")
            .is_not_exist()
    );
    assert!(
        !storage
            .is_key_blob_exist(&process, b"k1", StorageType::Key)
            .expect("exists")
    );
}

#[test]
fn quota_overflow_leaves_image_untouched() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = StorageConfig::packed_under(dir.path());
    config.max_storage_size = HEADER_LEN + 100;
    let keystore = keystore(&config);
    store(&keystore, "first", &record("first", 1, 30));

    let before_disk = fs::read(keystore.image_path()).expect("image");
    let before_memory = keystore.snapshot().expect("snapshot");

    let err = keystore
        .store_key_blob(b"second", StorageType::Key, &record("second", 2, 30))
        .expect_err("over quota");
    assert!(matches!(err, HksError::StorageFailure(_)));

    assert_eq!(fs::read(keystore.image_path()).expect("image"), before_disk);
    assert_eq!(keystore.snapshot().expect("snapshot"), before_memory);
    assert_eq!(keystore.key_count().expect("count"), 1);
}

#[test]
fn any_flipped_header_bit_is_detected() {
    let dir = TempDir::new().expect("tempdir");
    let config = StorageConfig::packed_under(dir.path());
    let writer = keystore(&config);
    store(&writer, "k1", &record("k1", 7, 16));
    let path = writer.image_path();
    let pristine = fs::read(&path).expect("image");

    let covered = (0..HEADER_MAC_INPUT_LEN).chain([HEADER_MAC_INPUT_LEN, HEADER_LEN - 1]);
    for byte in covered {
        for bit in 0..8 {
            let mut tampered = pristine.clone();
            tampered[byte] ^= 1 << bit;
            fs::write(&path, &tampered).expect("tamper");
            let err = keystore(&config)
                .key_count()
                .expect_err("tampered header must not load");
            assert!(
                matches!(err, HksError::InvalidKeyFile(_)),
                "byte {byte} bit {bit}: {err}"
            );
        }
    }

    fs::write(&path, &pristine).expect("restore");
    assert_eq!(keystore(&config).key_count().expect("pristine loads"), 1);
}

#[test]
fn truncated_image_is_invalid() {
    let dir = TempDir::new().expect("tempdir");
    let config = StorageConfig::packed_under(dir.path());
    let writer = keystore(&config);
    store(&writer, "k1", &record("k1", 7, 16));
    let path = writer.image_path();
    let bytes = fs::read(&path).expect("image");

    fs::write(&path, &bytes[..bytes.len() - 1]).expect("cut record");
    assert!(matches!(
        keystore(&config).key_count(),
        Err(HksError::InvalidKeyFile(_))
    ));

    fs::write(&path, &bytes[..HEADER_LEN - 1]).expect("cut header");
    assert!(matches!(
        keystore(&config).key_count(),
        Err(HksError::InvalidKeyFile(_))
    ));
}

#[test]
fn deleting_the_middle_record_compacts() {
    let dir = TempDir::new().expect("tempdir");
    let a = record("A", 0xA, 12);
    let b = record("B", 0xB, 40);
    let c = record("C", 0xC, 24);

    let three = keystore(&StorageConfig::packed_under(dir.path().join("three")));
    store(&three, "A", &a);
    store(&three, "B", &b);
    store(&three, "C", &c);
    three.delete_key_blob(b"B", StorageType::Key).expect("delete B");

    let two = keystore(&StorageConfig::packed_under(dir.path().join("two")));
    store(&two, "A", &a);
    store(&two, "C", &c);

    let compacted = three.snapshot().expect("compacted");
    let reference = two.snapshot().expect("reference");
    assert_eq!(compacted[HEADER_LEN..], reference[HEADER_LEN..]);
    assert_eq!(three.header().expect("header").key_count, 2);
    assert_eq!(
        fs::read(three.image_path()).expect("flushed"),
        compacted,
        "disk matches memory"
    );

    let order: Vec<Vec<u8>> = three
        .get_key_info_list(8)
        .expect("list")
        .into_iter()
        .map(|info| info.alias)
        .collect();
    assert_eq!(order, vec![b"A".to_vec(), b"C".to_vec()]);
}

#[test]
fn key_info_list_carries_record_parameters() {
    let dir = TempDir::new().expect("tempdir");
    let keystore = keystore(&StorageConfig::packed_under(dir.path()));
    store(&keystore, "signer", &record("signer", 5, 32));

    let infos = keystore.get_key_info_list(1).expect("list");
    assert_eq!(infos.len(), 1);
    let params = infos[0].param_set.as_ref().expect("param set");
    assert_eq!(params.get_uint(TAG_ALGORITHM).expect("alg"), 20);
    assert_eq!(params.get_uint(TAG_KEY_SIZE).expect("size"), 256);
    assert_eq!(params.get_uint(TAG_PURPOSE).expect("purpose"), 3);
    assert_eq!(params.get_bytes(TAG_KEY_ALIAS).expect("alias"), b"signer");
}

#[test]
fn key_info_list_reports_buffer_too_small() {
    let dir = TempDir::new().expect("tempdir");
    let keystore = keystore(&StorageConfig::packed_under(dir.path()));
    for alias in ["a", "b", "c"] {
        store(&keystore, alias, &record(alias, 1, 8));
    }
    assert!(matches!(
        keystore.get_key_info_list(2),
        Err(HksError::BufferTooSmall {
            required: 3,
            available: 2
        })
    ));
    assert_eq!(keystore.get_key_info_list(3).expect("fits").len(), 3);
}

#[test]
fn concurrent_writers_all_land() {
    let dir = TempDir::new().expect("tempdir");
    let storage = Arc::new(
        StorageBackend::open_local(&StorageConfig::packed_under(dir.path())).expect("backend"),
    );
    let process = ProcessInfo::new("0", "svc");

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let storage = Arc::clone(&storage);
            let process = process.clone();
            thread::spawn(move || {
                for n in 0..4 {
                    let alias = format!("w{worker}-k{n}");
                    let blob = record(&alias, worker, 16);
                    storage
                        .store_key_blob(&process, alias.as_bytes(), StorageType::Key, &blob)
                        .expect("store");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker");
    }

    assert_eq!(storage.get_key_count_by_process_name(&process).expect("count"), 32);
    let packed = storage.as_packed().expect("packed");
    packed.refresh().expect("reload from disk");
    assert_eq!(packed.key_count().expect("count after reload"), 32);
}
