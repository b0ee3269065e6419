//! Single-file keystore: a header protected by a salted HMAC followed by variable-length key
//! records. The in-memory image is authoritative; every mutation is flushed whole.
//!
//! ```text
//! header  version u16 | key_count u16 | total_len u32 | sealing_alg u32 | salt[16] | hmac[64]
//! record  key_info_len u16 | key_size u16 | flag u8 | alg u8 | mode u8 | digest u8 |
//!         padding u8 | rsv u8 | key_len u16 | purpose u32 | role u32 | domain u16 |
//!         alias_size u8 | auth_id_size u8 | alias | auth_id | key material
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::{
    audit::{KeyOperation, record_key_operation},
    codec::{ByteReader, ByteWriter, to_u8, to_u16},
    config::StorageConfig,
    crypto::{CryptoEngine, HEADER_MAC_LEN, mac_matches},
    error::{HksError, HksResult},
    file_lock::FileLockRegistry,
    file_operator::{FileOperator, check_path},
    models::{BACKUP_SUFFIX, KeyInfo, Replica, StoreFileInfo, StorePath, StorageType},
    param_set::{
        ParamSet, TAG_ALGORITHM, TAG_BLOCK_MODE, TAG_DIGEST, TAG_KEY_ALIAS, TAG_KEY_FLAG,
        TAG_KEY_SIZE, TAG_PADDING, TAG_PURPOSE,
    },
    per_file::{DestroyReport, DestroyStep},
};

pub const HEADER_LEN: usize = 92;
pub const SALT_LEN: usize = 16;
/// Bytes of the header covered by the HMAC.
pub const HEADER_MAC_INPUT_LEN: usize = HEADER_LEN - HEADER_MAC_LEN;
pub const IMAGE_VERSION: u16 = 1;
/// AES-GCM, the algorithm sealing the key material inside each record.
pub const SEALING_ALG_AES_GCM: u32 = 0x0000_0014;
pub const RECORD_FIXED_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedHeader {
    pub version: u16,
    pub key_count: u16,
    pub total_len: u32,
    pub sealing_alg: u32,
    pub salt: [u8; SALT_LEN],
    pub hmac: [u8; HEADER_MAC_LEN],
}

impl PackedHeader {
    fn fresh(salt: [u8; SALT_LEN]) -> Self {
        Self {
            version: IMAGE_VERSION,
            key_count: 0,
            total_len: HEADER_LEN as u32,
            sealing_alg: SEALING_ALG_AES_GCM,
            salt,
            hmac: [0u8; HEADER_MAC_LEN],
        }
    }

    pub fn parse(bytes: &[u8]) -> HksResult<Self> {
        let mut reader = ByteReader::new(bytes);
        Ok(Self {
            version: reader.read_u16()?,
            key_count: reader.read_u16()?,
            total_len: reader.read_u32()?,
            sealing_alg: reader.read_u32()?,
            salt: reader.read_array()?,
            hmac: reader.read_array()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(HEADER_LEN);
        writer.put_bytes(&self.mac_input()).put_bytes(&self.hmac);
        writer.into_inner()
    }

    /// The header bytes the HMAC covers.
    pub fn mac_input(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(HEADER_MAC_INPUT_LEN);
        writer
            .put_u16(self.version)
            .put_u16(self.key_count)
            .put_u32(self.total_len)
            .put_u32(self.sealing_alg)
            .put_bytes(&self.salt);
        writer.into_inner()
    }

    fn seal(&mut self, crypto: &dyn CryptoEngine) -> HksResult<()> {
        let mac = crypto.calc_header_mac(&self.salt, &self.mac_input())?;
        if mac.len() != HEADER_MAC_LEN {
            return Err(HksError::crypto(format!(
                "header mac of {} bytes, expected {HEADER_MAC_LEN}",
                mac.len()
            )));
        }
        self.hmac.copy_from_slice(&mac);
        Ok(())
    }

    fn verify(&self, crypto: &dyn CryptoEngine) -> HksResult<()> {
        let mac = crypto.calc_header_mac(&self.salt, &self.mac_input())?;
        if !mac_matches(&self.hmac, &mac) {
            return Err(HksError::corrupt("packed image header hmac mismatch"));
        }
        Ok(())
    }
}

/// Parsed view of one key record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub key_info_len: u16,
    pub flag: u8,
    pub alg: u8,
    pub mode: u8,
    pub digest: u8,
    pub padding: u8,
    pub key_len: u16,
    pub purpose: u32,
    pub role: u32,
    pub domain: u16,
    pub alias: Vec<u8>,
    pub auth_id: Vec<u8>,
    pub key_material: Vec<u8>,
}

impl KeyRecord {
    /// Parse a record that must span `bytes` exactly.
    pub fn parse(bytes: &[u8]) -> HksResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let key_info_len = reader.read_u16()?;
        let key_size = reader.read_u16()?;
        let flag = reader.read_u8()?;
        let alg = reader.read_u8()?;
        let mode = reader.read_u8()?;
        let digest = reader.read_u8()?;
        let padding = reader.read_u8()?;
        reader.skip(1)?;
        let key_len = reader.read_u16()?;
        let purpose = reader.read_u32()?;
        let role = reader.read_u32()?;
        let domain = reader.read_u16()?;
        let alias_size = reader.read_u8()?;
        let auth_id_size = reader.read_u8()?;

        let expected = RECORD_FIXED_LEN
            + usize::from(alias_size)
            + usize::from(auth_id_size)
            + usize::from(key_size);
        if usize::from(key_info_len) != expected || bytes.len() != expected {
            return Err(HksError::corrupt(format!(
                "record declares {key_info_len} bytes, fields need {expected}, buffer holds {}",
                bytes.len()
            )));
        }
        Ok(Self {
            key_info_len,
            flag,
            alg,
            mode,
            digest,
            padding,
            key_len,
            purpose,
            role,
            domain,
            alias: reader.take(usize::from(alias_size))?.to_vec(),
            auth_id: reader.take(usize::from(auth_id_size))?.to_vec(),
            key_material: reader.take(usize::from(key_size))?.to_vec(),
        })
    }

    pub fn to_param_set(&self) -> HksResult<ParamSet> {
        let mut params = ParamSet::new();
        params
            .push_uint(TAG_ALGORITHM, u32::from(self.alg))?
            .push_uint(TAG_KEY_SIZE, u32::from(self.key_len))?
            .push_uint(TAG_PURPOSE, self.purpose)?
            .push_uint(TAG_DIGEST, u32::from(self.digest))?
            .push_uint(TAG_PADDING, u32::from(self.padding))?
            .push_uint(TAG_BLOCK_MODE, u32::from(self.mode))?
            .push_uint(TAG_KEY_FLAG, u32::from(self.flag))?
            .push_bytes(TAG_KEY_ALIAS, &self.alias)?;
        Ok(params)
    }
}

impl Drop for KeyRecord {
    fn drop(&mut self) {
        self.key_material.zeroize();
    }
}

/// Builds the record bytes the packed store expects as its key blob.
#[derive(Debug, Clone)]
pub struct KeyRecordBuilder {
    alias: Vec<u8>,
    auth_id: Vec<u8>,
    material: Vec<u8>,
    flag: u8,
    alg: u8,
    mode: u8,
    digest: u8,
    padding: u8,
    key_len: u16,
    purpose: u32,
    role: u32,
    domain: u16,
}

impl KeyRecordBuilder {
    pub fn new(alias: &[u8], material: &[u8]) -> Self {
        Self {
            alias: alias.to_vec(),
            auth_id: Vec::new(),
            material: material.to_vec(),
            flag: 0,
            alg: 0,
            mode: 0,
            digest: 0,
            padding: 0,
            key_len: 0,
            purpose: 0,
            role: 0,
            domain: 0,
        }
    }

    pub fn auth_id(mut self, auth_id: &[u8]) -> Self {
        self.auth_id = auth_id.to_vec();
        self
    }

    pub fn flag(mut self, flag: u8) -> Self {
        self.flag = flag;
        self
    }

    pub fn alg(mut self, alg: u8) -> Self {
        self.alg = alg;
        self
    }

    pub fn mode(mut self, mode: u8) -> Self {
        self.mode = mode;
        self
    }

    pub fn digest(mut self, digest: u8) -> Self {
        self.digest = digest;
        self
    }

    pub fn padding(mut self, padding: u8) -> Self {
        self.padding = padding;
        self
    }

    pub fn key_len(mut self, bits: u16) -> Self {
        self.key_len = bits;
        self
    }

    pub fn purpose(mut self, purpose: u32) -> Self {
        self.purpose = purpose;
        self
    }

    pub fn role(mut self, role: u32) -> Self {
        self.role = role;
        self
    }

    pub fn domain(mut self, domain: u16) -> Self {
        self.domain = domain;
        self
    }

    pub fn build(&self) -> HksResult<Vec<u8>> {
        let total = RECORD_FIXED_LEN + self.alias.len() + self.auth_id.len() + self.material.len();
        let mut writer = ByteWriter::with_capacity(total);
        writer
            .put_u16(to_u16(total, "record length")?)
            .put_u16(to_u16(self.material.len(), "key size")?)
            .put_u8(self.flag)
            .put_u8(self.alg)
            .put_u8(self.mode)
            .put_u8(self.digest)
            .put_u8(self.padding)
            .put_u8(0)
            .put_u16(self.key_len)
            .put_u32(self.purpose)
            .put_u32(self.role)
            .put_u16(self.domain)
            .put_u8(to_u8(self.alias.len(), "alias size")?)
            .put_u8(to_u8(self.auth_id.len(), "auth id size")?)
            .put_bytes(&self.alias)
            .put_bytes(&self.auth_id)
            .put_bytes(&self.material);
        Ok(writer.into_inner())
    }
}

impl Drop for KeyRecordBuilder {
    fn drop(&mut self) {
        self.material.zeroize();
    }
}

/// Header plus records, exactly `total_len` bytes.
struct PackedImage {
    header: PackedHeader,
    buf: Vec<u8>,
}

impl Drop for PackedImage {
    fn drop(&mut self) {
        self.buf.zeroize();
    }
}

impl PackedImage {
    fn total_len(&self) -> usize {
        self.header.total_len as usize
    }

    /// Offset and length of every record, validating the bookkeeping on the way.
    fn record_spans(&self) -> HksResult<Vec<(usize, usize)>> {
        let total = self.total_len();
        let mut spans = Vec::with_capacity(usize::from(self.header.key_count));
        let mut offset = HEADER_LEN;
        while offset < total && spans.len() < usize::from(self.header.key_count) {
            let len = record_len_at(&self.buf, offset, total)?;
            spans.push((offset, len));
            offset += len;
        }
        if spans.len() != usize::from(self.header.key_count) || offset != total {
            return Err(HksError::corrupt(format!(
                "header claims {} records in {total} bytes, found {} ending at {offset}",
                self.header.key_count,
                spans.len()
            )));
        }
        Ok(spans)
    }

    fn find(&self, alias: &[u8]) -> HksResult<Option<(usize, usize)>> {
        if self.header.key_count == 0 {
            return Ok(None);
        }
        let total = self.total_len();
        let mut offset = HEADER_LEN;
        while offset < total {
            let len = record_len_at(&self.buf, offset, total)?;
            if record_alias(&self.buf[offset..offset + len])? == alias {
                return Ok(Some((offset, len)));
            }
            offset += len;
        }
        Ok(None)
    }

    fn record(&self, alias: &[u8]) -> HksResult<&[u8]> {
        match self.find(alias)? {
            Some((offset, len)) => Ok(&self.buf[offset..offset + len]),
            None => Err(HksError::NotExist(String::from_utf8_lossy(alias).into_owned())),
        }
    }

    /// Close the gap left by `[start, start + len)` and scrub the vacated tail.
    fn remove_range(&mut self, start: usize, len: usize) {
        let end = start + len;
        self.buf.copy_within(end.., start);
        let new_len = self.buf.len() - len;
        self.buf[new_len..].zeroize();
        self.buf.truncate(new_len);
    }

    /// Make room for `additional` bytes, moving to a larger allocation when needed so no
    /// stale copy is left behind.
    fn reserve(&mut self, additional: usize) -> HksResult<()> {
        if self.buf.capacity() - self.buf.len() >= additional {
            return Ok(());
        }
        let wanted = self.buf.len() + additional;
        let mut next = Vec::new();
        next.try_reserve_exact(wanted)
            .map_err(|_| HksError::MallocFail(wanted))?;
        next.extend_from_slice(&self.buf);
        self.buf.zeroize();
        self.buf = next;
        Ok(())
    }

    fn commit(&mut self, header: PackedHeader) {
        self.buf[..HEADER_LEN].copy_from_slice(&header.encode());
        self.header = header;
    }
}

fn record_len_at(buf: &[u8], offset: usize, total: usize) -> HksResult<usize> {
    let mut reader = ByteReader::new(&buf[offset..total]);
    let len = usize::from(reader.read_u16()?);
    if len < RECORD_FIXED_LEN || offset + len > total {
        return Err(HksError::corrupt(format!(
            "record at offset {offset} claims {len} bytes within {total}"
        )));
    }
    Ok(len)
}

fn record_alias(record: &[u8]) -> HksResult<&[u8]> {
    let alias_size = usize::from(record[RECORD_FIXED_LEN - 2]);
    record
        .get(RECORD_FIXED_LEN..RECORD_FIXED_LEN + alias_size)
        .ok_or_else(|| HksError::corrupt("record alias runs past record end"))
}

pub struct PackedKeystore {
    dir: PathBuf,
    file_name: String,
    ops: Arc<dyn FileOperator>,
    crypto: Arc<dyn CryptoEngine>,
    locks: FileLockRegistry,
    image: Mutex<Option<PackedImage>>,
    max_storage_size: usize,
    max_key_count: usize,
    max_key_blob_size: usize,
    max_alias_size: usize,
}

impl PackedKeystore {
    pub fn new(
        config: &StorageConfig,
        ops: Arc<dyn FileOperator>,
        crypto: Arc<dyn CryptoEngine>,
    ) -> Self {
        Self {
            dir: config.packed_dir.clone(),
            file_name: config.packed_file_name.clone(),
            ops,
            crypto,
            locks: FileLockRegistry::new(),
            image: Mutex::new(None),
            max_storage_size: config.max_storage_size,
            max_key_count: config.max_key_count,
            max_key_blob_size: config.max_key_blob_size,
            max_alias_size: config.max_alias_size,
        }
    }

    pub fn image_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Whether the image has ever been flushed to disk.
    pub fn image_exists(&self) -> HksResult<bool> {
        self.ops.exists(&self.dir, &self.file_name)
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

    fn load(&self) -> HksResult<PackedImage> {
        let mut head = [0u8; HEADER_LEN];
        let read = self.ops.read(&self.dir, &self.file_name, 0, &mut head)?;
        if read == 0 {
            let mut salt = [0u8; SALT_LEN];
            self.crypto.generate_random(&mut salt)?;
            let mut header = PackedHeader::fresh(salt);
            header.seal(self.crypto.as_ref())?;
            debug!(path = %self.image_path().display(), "starting empty packed image");
            let buf = header.encode();
            return Ok(PackedImage { header, buf });
        }
        if read < HEADER_LEN {
            return Err(HksError::corrupt(format!(
                "packed image header truncated to {read} bytes"
            )));
        }
        let header = PackedHeader::parse(&head)?;
        header.verify(self.crypto.as_ref())?;
        if header.version != IMAGE_VERSION {
            return Err(HksError::corrupt(format!(
                "unsupported packed image version {}",
                header.version
            )));
        }
        let total = header.total_len as usize;
        if total < HEADER_LEN || total > self.max_storage_size {
            return Err(HksError::corrupt(format!(
                "packed image total length {total} out of range"
            )));
        }
        let file_len = self.ops.size(&self.dir, &self.file_name)?;
        if file_len < total as u64 {
            return Err(HksError::corrupt(format!(
                "packed image file holds {file_len} bytes, header claims {total}"
            )));
        }

        let mut buf = Vec::new();
        buf.try_reserve_exact(total)
            .map_err(|_| HksError::MallocFail(total))?;
        buf.resize(total, 0);
        let read = self.ops.read(&self.dir, &self.file_name, 0, &mut buf)?;
        if read != total {
            buf.zeroize();
            return Err(HksError::corrupt(format!(
                "read {read} of {total} packed image bytes"
            )));
        }
        let image = PackedImage { header, buf };
        image.record_spans()?;
        info!(
            path = %self.image_path().display(),
            keys = image.header.key_count,
            bytes = total,
            "packed image loaded"
        );
        Ok(image)
    }

    fn with_image<T>(&self, f: impl FnOnce(&mut PackedImage) -> HksResult<T>) -> HksResult<T> {
        let mut guard = self.image.lock();
        if guard.is_none() {
            *guard = Some(self.load()?);
        }
        match guard.as_mut() {
            Some(image) => f(image),
            None => Err(HksError::BadState("packed image not loaded".into())),
        }
    }

    /// Run a mutation and flush. A failed flush drops the cache so the next call reloads
    /// the last durable image.
    fn mutate(
        &self,
        f: impl FnOnce(&mut PackedImage) -> HksResult<()>,
    ) -> HksResult<()> {
        let mut guard = self.image.lock();
        if guard.is_none() {
            *guard = Some(self.load()?);
        }
        let Some(image) = guard.as_mut() else {
            return Err(HksError::BadState("packed image not loaded".into()));
        };
        f(image)?;
        if let Err(err) = self.flush(image) {
            warn!(error = %err, "packed image flush failed, dropping cached image");
            *guard = None;
            return Err(err);
        }
        Ok(())
    }

    fn flush(&self, image: &PackedImage) -> HksResult<()> {
        self.ops.make_dir(&self.dir)?;
        let _guard = self.locks.acquire_write(&self.image_path());
        self.ops.write(&self.dir, &self.file_name, 0, &image.buf)
    }

    fn sealed_header(
        &self,
        current: &PackedHeader,
        key_count: usize,
        total_len: usize,
    ) -> HksResult<PackedHeader> {
        if total_len > self.max_storage_size {
            return Err(HksError::storage(format!(
                "packed image would grow to {total_len} bytes, limit {}",
                self.max_storage_size
            )));
        }
        if key_count > self.max_key_count {
            return Err(HksError::storage(format!(
                "packed image would hold {key_count} keys, limit {}",
                self.max_key_count
            )));
        }
        let mut header = PackedHeader {
            key_count: u16::try_from(key_count)
                .map_err(|_| HksError::storage("key count exceeds u16"))?,
            total_len: u32::try_from(total_len)
                .map_err(|_| HksError::storage("image length exceeds u32"))?,
            ..current.clone()
        };
        header.seal(self.crypto.as_ref())?;
        Ok(header)
    }

    pub fn store_key_blob(
        &self,
        alias: &[u8],
        storage_type: StorageType,
        blob: &[u8],
    ) -> HksResult<()> {
        if storage_type == StorageType::RootKey {
            return self.store_root_key(alias, blob);
        }
        self.check_alias(alias)?;
        if blob.len() > self.max_key_blob_size {
            return Err(HksError::invalid(format!(
                "key blob of {} bytes exceeds {}",
                blob.len(),
                self.max_key_blob_size
            )));
        }
        let record = KeyRecord::parse(blob)
            .map_err(|err| HksError::invalid(format!("key blob is not a key record: {err}")))?;
        if record.alias != alias {
            return Err(HksError::invalid("key record alias does not match requested alias"));
        }
        record_key_operation(KeyOperation::Save, &self.dir, &String::from_utf8_lossy(alias));

        self.mutate(|image| {
            let existing = image.find(alias)?;
            let (count, removed) = match existing {
                Some((_, len)) => (usize::from(image.header.key_count), len),
                None => (usize::from(image.header.key_count) + 1, 0),
            };
            let total = (image.total_len() - removed)
                .checked_add(blob.len())
                .ok_or_else(|| HksError::storage("packed image length overflow"))?;
            let header = self.sealed_header(&image.header, count, total)?;

            image.reserve(blob.len())?;
            if let Some((offset, len)) = existing {
                image.remove_range(offset, len);
            }
            image.buf.extend_from_slice(blob);
            image.commit(header);
            Ok(())
        })
    }

    pub fn delete_key_blob(&self, alias: &[u8], storage_type: StorageType) -> HksResult<()> {
        if storage_type == StorageType::RootKey {
            return self.delete_root_key(alias);
        }
        self.check_alias(alias)?;
        record_key_operation(KeyOperation::Delete, &self.dir, &String::from_utf8_lossy(alias));
        self.mutate(|image| {
            let Some((offset, len)) = image.find(alias)? else {
                return Err(HksError::NotExist(String::from_utf8_lossy(alias).into_owned()));
            };
            let count = usize::from(image.header.key_count)
                .checked_sub(1)
                .ok_or_else(|| HksError::BadState("record found in empty image".into()))?;
            let header = self.sealed_header(&image.header, count, image.total_len() - len)?;
            image.remove_range(offset, len);
            image.commit(header);
            Ok(())
        })
    }

    pub fn is_key_blob_exist(&self, alias: &[u8], storage_type: StorageType) -> HksResult<bool> {
        if storage_type == StorageType::RootKey {
            return Ok(self.root_key_presence(alias)?.is_some());
        }
        self.check_alias(alias)?;
        self.with_image(|image| Ok(image.find(alias)?.is_some()))
    }

    pub fn get_key_blob(
        &self,
        alias: &[u8],
        storage_type: StorageType,
        buf: &mut [u8],
    ) -> HksResult<usize> {
        if storage_type == StorageType::RootKey {
            let data = self.read_root_key(alias)?;
            return copy_out(&data, buf);
        }
        self.check_alias(alias)?;
        record_key_operation(KeyOperation::Get, &self.dir, &String::from_utf8_lossy(alias));
        self.with_image(|image| copy_out(image.record(alias)?, buf))
    }

    pub fn read_key_blob(&self, alias: &[u8], storage_type: StorageType) -> HksResult<Vec<u8>> {
        if storage_type == StorageType::RootKey {
            return self.read_root_key(alias);
        }
        self.check_alias(alias)?;
        record_key_operation(KeyOperation::Get, &self.dir, &String::from_utf8_lossy(alias));
        self.with_image(|image| Ok(image.record(alias)?.to_vec()))
    }

    pub fn get_key_blob_size(&self, alias: &[u8], storage_type: StorageType) -> HksResult<usize> {
        if storage_type == StorageType::RootKey {
            return Ok(self.read_root_key(alias)?.len());
        }
        self.check_alias(alias)?;
        self.with_image(|image| Ok(image.record(alias)?.len()))
    }

    pub fn key_count(&self) -> HksResult<usize> {
        self.with_image(|image| Ok(usize::from(image.header.key_count)))
    }

    /// Every record in image order with its parameters. Fails without output when more
    /// records exist than `capacity`.
    pub fn get_key_info_list(&self, capacity: usize) -> HksResult<Vec<KeyInfo>> {
        self.with_image(|image| {
            let count = usize::from(image.header.key_count);
            if count > capacity {
                return Err(HksError::BufferTooSmall {
                    required: count,
                    available: capacity,
                });
            }
            image
                .record_spans()?
                .into_iter()
                .map(|(offset, len)| {
                    let record = KeyRecord::parse(&image.buf[offset..offset + len])?;
                    Ok(KeyInfo {
                        param_set: Some(record.to_param_set()?),
                        alias: record.alias.clone(),
                    })
                })
                .collect()
        })
    }

    pub fn header(&self) -> HksResult<PackedHeader> {
        self.with_image(|image| Ok(image.header.clone()))
    }

    /// Raw image bytes as currently cached.
    pub fn snapshot(&self) -> HksResult<Vec<u8>> {
        self.with_image(|image| Ok(image.buf.clone()))
    }

    /// Drop the cached image and load it again from disk.
    pub fn refresh(&self) -> HksResult<()> {
        let mut guard = self.image.lock();
        *guard = None;
        *guard = Some(self.load()?);
        Ok(())
    }

    /// Scrub and release the cached image. The next call loads it again.
    pub fn shutdown(&self) {
        let mut guard = self.image.lock();
        if guard.take().is_some() {
            debug!("packed image released");
        }
    }

    /// Remove the image file and start over empty. Root-key files are kept.
    pub fn destroy(&self) -> DestroyReport {
        let mut guard = self.image.lock();
        *guard = None;
        let path = self.image_path();
        let result = {
            let _lock = self.locks.acquire_write(&path);
            self.ops.remove(&self.dir, &self.file_name)
        };
        if let Err(err) = &result {
            warn!(path = %path.display(), error = %err, "packed image not removed");
        }
        DestroyReport {
            steps: vec![DestroyStep {
                replica: Replica::Main,
                storage_type: StorageType::Key,
                path,
                result,
            }],
        }
    }

    pub fn get_file_info(
        &self,
        alias: &[u8],
        storage_type: StorageType,
    ) -> HksResult<StoreFileInfo> {
        if storage_type == StorageType::RootKey {
            let name = self.root_key_name(alias)?;
            let backup_name = format!("{name}{BACKUP_SUFFIX}");
            return Ok(StoreFileInfo {
                main: StorePath {
                    process_path: self.dir.clone(),
                    path: self.dir.clone(),
                    size: self.ops.size(&self.dir, &name)?,
                    file_name: name,
                },
                backup: Some(StorePath {
                    process_path: self.dir.clone(),
                    path: self.dir.clone(),
                    size: self.ops.size(&self.dir, &backup_name)?,
                    file_name: backup_name,
                }),
            });
        }
        self.check_alias(alias)?;
        Ok(StoreFileInfo {
            main: StorePath {
                process_path: self.dir.clone(),
                path: self.dir.clone(),
                file_name: self.file_name.clone(),
                size: self.ops.size(&self.dir, &self.file_name)?,
            },
            backup: None,
        })
    }

    fn root_key_name(&self, alias: &[u8]) -> HksResult<String> {
        let name = std::str::from_utf8(alias)
            .map_err(|_| HksError::invalid("root key alias must be UTF-8"))?;
        check_path(&self.dir, name)?;
        if name == self.file_name {
            return Err(HksError::invalid("root key alias collides with the image file"));
        }
        Ok(name.to_string())
    }

    /// Root-key material bypasses the record format: `<dir>/<alias>` plus a `.bak` mirror.
    fn store_root_key(&self, alias: &[u8], blob: &[u8]) -> HksResult<()> {
        let name = self.root_key_name(alias)?;
        if blob.is_empty() {
            return Err(HksError::invalid("root key material is empty"));
        }
        self.ops.make_dir(&self.dir)?;
        {
            let _guard = self.locks.acquire_write(&self.dir.join(&name));
            self.ops.write(&self.dir, &name, 0, blob)?;
        }
        let backup = format!("{name}{BACKUP_SUFFIX}");
        let _guard = self.locks.acquire_write(&self.dir.join(&backup));
        if let Err(err) = self.ops.write(&self.dir, &backup, 0, blob) {
            warn!(file = %backup, error = %err, "root key backup not written");
        }
        Ok(())
    }

    fn root_key_presence(&self, alias: &[u8]) -> HksResult<Option<String>> {
        let name = self.root_key_name(alias)?;
        if self.ops.exists(&self.dir, &name)? {
            return Ok(Some(name));
        }
        let backup = format!("{name}{BACKUP_SUFFIX}");
        if self.ops.exists(&self.dir, &backup)? {
            return Ok(Some(backup));
        }
        Ok(None)
    }

    fn read_root_key(&self, alias: &[u8]) -> HksResult<Vec<u8>> {
        let Some(file) = self.root_key_presence(alias)? else {
            return Err(HksError::NotExist(String::from_utf8_lossy(alias).into_owned()));
        };
        let _guard = self.locks.acquire_read(&self.dir.join(&file));
        let data = self.ops.read_to_vec(&self.dir, &file)?;
        if data.is_empty() {
            return Err(HksError::FileSizeFail(self.dir.join(&file).display().to_string()));
        }
        Ok(data)
    }

    fn delete_root_key(&self, alias: &[u8]) -> HksResult<()> {
        let name = self.root_key_name(alias)?;
        let backup = format!("{name}{BACKUP_SUFFIX}");
        let main_exists = self.ops.exists(&self.dir, &name)?;
        let backup_exists = self.ops.exists(&self.dir, &backup)?;
        if !main_exists && !backup_exists {
            return Err(HksError::NotExist(name));
        }
        for file in [name, backup] {
            let _guard = self.locks.acquire_write(&self.dir.join(&file));
            self.ops.remove(&self.dir, &file)?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn copy_out(data: &[u8], buf: &mut [u8]) -> HksResult<usize> {
    if buf.len() < data.len() {
        return Err(HksError::InsufficientData {
            required: data.len(),
            available: buf.len(),
        });
    }
    buf[..data.len()].copy_from_slice(data);
    Ok(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftCryptoEngine;
    use crate::file_operator::MemoryFileOperator;

    fn keystore_with(config: StorageConfig) -> (PackedKeystore, Arc<MemoryFileOperator>) {
        let ops = Arc::new(MemoryFileOperator::new());
        let store = PackedKeystore::new(&config, ops.clone(), Arc::new(SoftCryptoEngine::new()));
        (store, ops)
    }

    fn keystore() -> (PackedKeystore, Arc<MemoryFileOperator>) {
        keystore_with(StorageConfig::packed_under("/hks"))
    }

    fn record(alias: &str, fill: u8, len: usize) -> Vec<u8> {
        KeyRecordBuilder::new(alias.as_bytes(), &vec![fill; len])
            .alg(20)
            .key_len(256)
            .build()
            .expect("record")
    }

    #[test]
    fn header_layout_is_92_bytes() {
        let header = PackedHeader::fresh([9u8; SALT_LEN]);
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[0..2], &1u16.to_le_bytes());
        assert_eq!(&bytes[4..8], &92u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0x14u32.to_le_bytes());
        assert_eq!(&bytes[12..28], &[9u8; SALT_LEN]);
        assert_eq!(PackedHeader::parse(&bytes).expect("parse"), header);
    }

    #[test]
    fn record_builder_and_parser_agree() {
        let bytes = KeyRecordBuilder::new(b"alias", b"material")
            .auth_id(b"uid")
            .alg(3)
            .digest(12)
            .purpose(4)
            .build()
            .expect("build");
        assert_eq!(bytes.len(), RECORD_FIXED_LEN + 5 + 3 + 8);
        let parsed = KeyRecord::parse(&bytes).expect("parse");
        assert_eq!(usize::from(parsed.key_info_len), bytes.len());
        assert_eq!(parsed.alias, b"alias");
        assert_eq!(parsed.auth_id, b"uid");
        assert_eq!(parsed.key_material, b"material");
        let params = parsed.to_param_set().expect("params");
        assert_eq!(params.get_uint(TAG_DIGEST).expect("digest"), 12);
        assert_eq!(params.get_bytes(TAG_KEY_ALIAS).expect("alias"), b"alias");
    }

    #[test]
    fn record_with_wrong_length_is_rejected() {
        let mut bytes = record("a", 1, 4);
        bytes.push(0);
        assert!(matches!(KeyRecord::parse(&bytes), Err(HksError::InvalidKeyFile(_))));
    }

    #[test]
    fn empty_store_has_fresh_header_and_no_file() {
        let (store, ops) = keystore();
        let header = store.header().expect("header");
        assert_eq!(header.key_count, 0);
        assert_eq!(header.total_len as usize, HEADER_LEN);
        assert_eq!(ops.file_count(), 0);
    }

    #[test]
    fn store_then_read_back() {
        let (store, ops) = keystore();
        let blob = record("k1", 0xAB, 32);
        store.store_key_blob(b"k1", StorageType::Key, &blob).expect("store");
        assert_eq!(store.get_key_blob_size(b"k1", StorageType::Key).expect("size"), blob.len());
        assert_eq!(store.read_key_blob(b"k1", StorageType::Key).expect("read"), blob);
        let on_disk = ops.raw(&store.image_path()).expect("flushed");
        assert_eq!(on_disk.len(), HEADER_LEN + blob.len());
    }

    #[test]
    fn overwrite_replaces_record() {
        let (store, _) = keystore();
        store
            .store_key_blob(b"k1", StorageType::Key, &record("k1", 1, 16))
            .expect("first");
        let replacement = record("k1", 2, 48);
        store
            .store_key_blob(b"k1", StorageType::Key, &replacement)
            .expect("second");
        assert_eq!(store.key_count().expect("count"), 1);
        assert_eq!(store.read_key_blob(b"k1", StorageType::Key).expect("read"), replacement);
    }

    #[test]
    fn rejects_blob_that_is_not_the_named_record() {
        let (store, _) = keystore();
        assert!(matches!(
            store.store_key_blob(b"k1", StorageType::Key, &record("k2", 1, 8)),
            Err(HksError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.store_key_blob(b"k1", StorageType::Key, b"junk"),
            Err(HksError::InvalidArgument(_))
        ));
    }

    #[test]
    fn key_count_limit_is_enforced() {
        let mut config = StorageConfig::packed_under("/hks");
        config.max_key_count = 2;
        let (store, _) = keystore_with(config);
        store.store_key_blob(b"a", StorageType::Key, &record("a", 1, 8)).expect("a");
        store.store_key_blob(b"b", StorageType::Key, &record("b", 1, 8)).expect("b");
        assert!(matches!(
            store.store_key_blob(b"c", StorageType::Key, &record("c", 1, 8)),
            Err(HksError::StorageFailure(_))
        ));
        // overwriting an existing alias does not add a record
        store.store_key_blob(b"a", StorageType::Key, &record("a", 2, 8)).expect("overwrite");
    }

    #[test]
    fn failed_flush_reloads_durable_state() {
        let (store, ops) = keystore();
        let first = record("k1", 1, 8);
        store.store_key_blob(b"k1", StorageType::Key, &first).expect("store");
        ops.fail_writes_under("/hks/maindata/hks_keystore");
        assert!(
            store
                .store_key_blob(b"k2", StorageType::Key, &record("k2", 2, 8))
                .is_err()
        );
        ops.clear_failures();
        assert!(!store.is_key_blob_exist(b"k2", StorageType::Key).expect("exists"));
        assert_eq!(store.read_key_blob(b"k1", StorageType::Key).expect("read"), first);
    }

    #[test]
    fn get_into_small_buffer_is_insufficient() {
        let (store, _) = keystore();
        let blob = record("k1", 1, 8);
        store.store_key_blob(b"k1", StorageType::Key, &blob).expect("store");
        let mut small = vec![0u8; blob.len() - 1];
        assert!(matches!(
            store.get_key_blob(b"k1", StorageType::Key, &mut small),
            Err(HksError::InsufficientData { .. })
        ));
    }

    #[test]
    fn corrupt_record_length_is_detected() {
        let (store, ops) = keystore();
        store
            .store_key_blob(b"k1", StorageType::Key, &record("k1", 1, 8))
            .expect("store");
        let mut bytes = ops.raw(&store.image_path()).expect("image");
        // record length lives outside the header mac
        bytes[HEADER_LEN] = 0xFF;
        ops.write(store.dir(), "hks_keystore", 0, &bytes).expect("tamper");
        assert!(matches!(store.refresh(), Err(HksError::InvalidKeyFile(_))));
    }

    #[test]
    fn root_key_bypasses_the_image() {
        let (store, ops) = keystore();
        store
            .store_key_blob(b"hks_root_key", StorageType::RootKey, b"rk-material")
            .expect("store root key");
        assert_eq!(store.key_count().expect("count"), 0);
        assert_eq!(
            ops.raw(Path::new("/hks/maindata/hks_root_key")).expect("main"),
            b"rk-material"
        );
        assert_eq!(
            ops.raw(Path::new("/hks/maindata/hks_root_key.bak")).expect("backup"),
            b"rk-material"
        );
        ops.remove(Path::new("/hks/maindata"), "hks_root_key").expect("drop main");
        assert_eq!(
            store
                .read_key_blob(b"hks_root_key", StorageType::RootKey)
                .expect("from backup"),
            b"rk-material"
        );
        store
            .delete_key_blob(b"hks_root_key", StorageType::RootKey)
            .expect("delete");
        assert!(
            !store
                .is_key_blob_exist(b"hks_root_key", StorageType::RootKey)
                .expect("exists")
        );
    }

    #[test]
    fn root_key_alias_must_be_a_plain_name() {
        let (store, _) = keystore();
        assert!(matches!(
            store.store_key_blob(b"../escape", StorageType::RootKey, b"x"),
            Err(HksError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.store_key_blob(&[0xff, 0xfe], StorageType::RootKey, b"x"),
            Err(HksError::InvalidArgument(_))
        ));
    }

    #[test]
    fn shutdown_then_reuse_reloads() {
        let (store, _) = keystore();
        let blob = record("k1", 7, 8);
        store.store_key_blob(b"k1", StorageType::Key, &blob).expect("store");
        store.shutdown();
        assert_eq!(store.read_key_blob(b"k1", StorageType::Key).expect("read"), blob);
    }

    #[test]
    fn destroy_removes_image() {
        let (store, ops) = keystore();
        store
            .store_key_blob(b"k1", StorageType::Key, &record("k1", 1, 8))
            .expect("store");
        let report = store.destroy();
        assert!(report.is_clean());
        assert!(ops.raw(&store.image_path()).is_none());
        assert_eq!(store.key_count().expect("count"), 0);
    }
}
