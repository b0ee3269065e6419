//! The slice of the crypto engine the storage layer consumes, plus a software implementation.

use std::sync::atomic::{AtomicBool, Ordering};

use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use sha2::Sha512;
use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    error::{HksError, HksResult},
    packed::KeyRecordBuilder,
};

type HmacSha512 = Hmac<Sha512>;

pub const HEADER_MAC_LEN: usize = 64;

/// Algorithm tag written into migrated records when the old slot carries none.
pub const ALG_AES: u8 = 20;
pub const PURPOSE_ENCRYPT_DECRYPT: u32 = 0x1 | 0x2;

pub trait CryptoEngine: Send + Sync {
    /// Bring the engine up. Called again after root-key material changes.
    fn init(&self) -> HksResult<()>;

    /// Keyed MAC over a packed image header. Always `HEADER_MAC_LEN` bytes.
    fn calc_header_mac(&self, salt: &[u8], data: &[u8]) -> HksResult<Vec<u8>>;

    fn generate_random(&self, out: &mut [u8]) -> HksResult<()>;

    /// Rewrite old-format key material as a current packed record for `alias`.
    fn upgrade_key_info(&self, alias: &[u8], old_material: &[u8]) -> HksResult<Vec<u8>>;
}

/// Constant-time comparison of a stored MAC with a recomputed one.
pub fn mac_matches(expected: &[u8], actual: &[u8]) -> bool {
    expected.len() == actual.len() && bool::from(expected.ct_eq(actual))
}

/// Software engine: HMAC-SHA512 from `hmac`/`sha2`, randomness from the OS.
pub struct SoftCryptoEngine {
    device_secret: Option<Zeroizing<Vec<u8>>>,
    initialized: AtomicBool,
}

impl Default for SoftCryptoEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftCryptoEngine {
    /// Header MACs keyed by the image's own salt.
    pub fn new() -> Self {
        Self {
            device_secret: None,
            initialized: AtomicBool::new(false),
        }
    }

    /// Header MACs keyed by `HMAC-SHA512(secret, salt)`, binding images to one device.
    pub fn with_device_secret(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            device_secret: Some(Zeroizing::new(secret.into())),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn mac_key(&self, salt: &[u8]) -> HksResult<Zeroizing<Vec<u8>>> {
        match &self.device_secret {
            None => Ok(Zeroizing::new(salt.to_vec())),
            Some(secret) => {
                let mut mac = <HmacSha512 as Mac>::new_from_slice(secret.as_slice())
                    .map_err(HksError::crypto)?;
                mac.update(salt);
                Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
            }
        }
    }
}

impl CryptoEngine for SoftCryptoEngine {
    fn init(&self) -> HksResult<()> {
        self.initialized.store(true, Ordering::Release);
        debug!("software crypto engine initialised");
        Ok(())
    }

    fn calc_header_mac(&self, salt: &[u8], data: &[u8]) -> HksResult<Vec<u8>> {
        if salt.is_empty() {
            return Err(HksError::invalid("header salt must not be empty"));
        }
        let key = self.mac_key(salt)?;
        let mut mac =
            <HmacSha512 as Mac>::new_from_slice(key.as_slice()).map_err(HksError::crypto)?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn generate_random(&self, out: &mut [u8]) -> HksResult<()> {
        OsRng.try_fill_bytes(out).map_err(HksError::crypto)
    }

    fn upgrade_key_info(&self, alias: &[u8], old_material: &[u8]) -> HksResult<Vec<u8>> {
        if old_material.is_empty() {
            return Err(HksError::invalid("old key material is empty"));
        }
        let bits = old_material
            .len()
            .checked_mul(8)
            .and_then(|bits| u16::try_from(bits).ok())
            .ok_or_else(|| HksError::invalid("old key material too large"))?;
        KeyRecordBuilder::new(alias, old_material)
            .alg(ALG_AES)
            .key_len(bits)
            .purpose(PURPOSE_ENCRYPT_DECRYPT)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packed::KeyRecord;

    #[test]
    fn header_mac_is_sha512_sized_and_salt_dependent() {
        let engine = SoftCryptoEngine::new();
        let a = engine.calc_header_mac(&[1u8; 16], b"header").expect("mac");
        let b = engine.calc_header_mac(&[2u8; 16], b"header").expect("mac");
        assert_eq!(a.len(), HEADER_MAC_LEN);
        assert_ne!(a, b);
        assert!(mac_matches(&a, &a.clone()));
        assert!(!mac_matches(&a, &b));
        assert!(!mac_matches(&a, &a[..32]));
    }

    #[test]
    fn device_secret_changes_the_mac() {
        let plain = SoftCryptoEngine::new();
        let bound = SoftCryptoEngine::with_device_secret(b"device-root".to_vec());
        let salt = [7u8; 16];
        assert_ne!(
            plain.calc_header_mac(&salt, b"x").expect("mac"),
            bound.calc_header_mac(&salt, b"x").expect("mac")
        );
    }

    #[test]
    fn random_fills_buffer() {
        let engine = SoftCryptoEngine::new();
        let mut buf = [0u8; 32];
        engine.generate_random(&mut buf).expect("random");
        assert_ne!(buf, [0u8; 32]);
    }

    #[test]
    fn init_marks_engine_ready() {
        let engine = SoftCryptoEngine::new();
        assert!(!engine.is_initialized());
        engine.init().expect("init");
        assert!(engine.is_initialized());
    }

    #[test]
    fn upgrade_produces_a_parseable_record() {
        let engine = SoftCryptoEngine::new();
        let bytes = engine
            .upgrade_key_info(b"legacy", &[0x5A; 32])
            .expect("upgrade");
        let record = KeyRecord::parse(&bytes).expect("parse");
        assert_eq!(record.alias, b"legacy");
        assert_eq!(record.key_material, vec![0x5A; 32]);
        assert_eq!(record.key_len, 256);
    }
}
