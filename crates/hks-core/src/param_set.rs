//! Tagged key/value property bag exchanged with the upper layers as a size-prefixed blob.
//!
//! Layout: `param_set_size u32 | param_count u32 | params[]`, each param `tag u32 | value`.
//! The top four bits of a tag select the value encoding.

use crate::codec::{ByteReader, ByteWriter, to_u32};
use crate::error::{HksError, HksResult};

const TAG_TYPE_SHIFT: u32 = 28;
const TAG_TYPE_MASK: u32 = 0xF << TAG_TYPE_SHIFT;

pub const TAG_TYPE_UINT: u32 = 2 << TAG_TYPE_SHIFT;
pub const TAG_TYPE_BOOL: u32 = 4 << TAG_TYPE_SHIFT;
pub const TAG_TYPE_BYTES: u32 = 5 << TAG_TYPE_SHIFT;

pub const TAG_ALGORITHM: u32 = TAG_TYPE_UINT | 1;
pub const TAG_PURPOSE: u32 = TAG_TYPE_UINT | 2;
pub const TAG_KEY_SIZE: u32 = TAG_TYPE_UINT | 3;
pub const TAG_DIGEST: u32 = TAG_TYPE_UINT | 4;
pub const TAG_PADDING: u32 = TAG_TYPE_UINT | 5;
pub const TAG_BLOCK_MODE: u32 = TAG_TYPE_UINT | 6;
pub const TAG_KEY_ALIAS: u32 = TAG_TYPE_BYTES | 23;
pub const TAG_KEY_FLAG: u32 = TAG_TYPE_UINT | 10004;

const PARAM_SET_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Uint(u32),
    Bool(bool),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub tag: u32,
    pub value: ParamValue,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamSet {
    params: Vec<Param>,
}

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_uint(&mut self, tag: u32, value: u32) -> HksResult<&mut Self> {
        self.push(tag, ParamValue::Uint(value))
    }

    pub fn push_bool(&mut self, tag: u32, value: bool) -> HksResult<&mut Self> {
        self.push(tag, ParamValue::Bool(value))
    }

    pub fn push_bytes(&mut self, tag: u32, value: &[u8]) -> HksResult<&mut Self> {
        self.push(tag, ParamValue::Bytes(value.to_vec()))
    }

    fn push(&mut self, tag: u32, value: ParamValue) -> HksResult<&mut Self> {
        let expected = match value {
            ParamValue::Uint(_) => TAG_TYPE_UINT,
            ParamValue::Bool(_) => TAG_TYPE_BOOL,
            ParamValue::Bytes(_) => TAG_TYPE_BYTES,
        };
        if tag & TAG_TYPE_MASK != expected {
            return Err(HksError::invalid(format!(
                "tag {tag:#010x} does not carry a {value:?}-typed value"
            )));
        }
        self.params.push(Param { tag, value });
        Ok(self)
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn find(&self, tag: u32) -> HksResult<&Param> {
        self.params
            .iter()
            .find(|p| p.tag == tag)
            .ok_or_else(|| HksError::NotExist(format!("param tag {tag:#010x}")))
    }

    pub fn get_uint(&self, tag: u32) -> HksResult<u32> {
        match self.find(tag)?.value {
            ParamValue::Uint(v) => Ok(v),
            _ => Err(HksError::invalid(format!("tag {tag:#010x} is not a uint"))),
        }
    }

    pub fn get_bytes(&self, tag: u32) -> HksResult<&[u8]> {
        match &self.find(tag)?.value {
            ParamValue::Bytes(v) => Ok(v),
            _ => Err(HksError::invalid(format!("tag {tag:#010x} is not a byte string"))),
        }
    }

    pub fn serialized_len(&self) -> usize {
        PARAM_SET_HEADER_LEN
            + self
                .params
                .iter()
                .map(|p| match &p.value {
                    ParamValue::Uint(_) | ParamValue::Bool(_) => 8,
                    ParamValue::Bytes(b) => 8 + b.len(),
                })
                .sum::<usize>()
    }

    pub fn to_bytes(&self) -> HksResult<Vec<u8>> {
        let total = self.serialized_len();
        let mut writer = ByteWriter::with_capacity(total);
        writer
            .put_u32(to_u32(total, "param set size")?)
            .put_u32(to_u32(self.params.len(), "param count")?);
        for param in &self.params {
            writer.put_u32(param.tag);
            match &param.value {
                ParamValue::Uint(v) => {
                    writer.put_u32(*v);
                }
                ParamValue::Bool(v) => {
                    writer.put_u32(u32::from(*v));
                }
                ParamValue::Bytes(b) => {
                    writer.put_u32(to_u32(b.len(), "param length")?).put_bytes(b);
                }
            }
        }
        Ok(writer.into_inner())
    }

    pub fn from_bytes(bytes: &[u8]) -> HksResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let declared = reader.read_u32()? as usize;
        if declared != bytes.len() {
            return Err(HksError::corrupt(format!(
                "param set declares {declared} bytes but blob holds {}",
                bytes.len()
            )));
        }
        let count = reader.read_u32()? as usize;
        // each param needs at least 8 bytes, so a larger count cannot be honest
        if count > reader.remaining() / 8 {
            return Err(HksError::corrupt(format!("param count {count} too large")));
        }
        let mut params = Vec::with_capacity(count);
        for _ in 0..count {
            let tag = reader.read_u32()?;
            let value = match tag & TAG_TYPE_MASK {
                TAG_TYPE_UINT => ParamValue::Uint(reader.read_u32()?),
                TAG_TYPE_BOOL => ParamValue::Bool(reader.read_u32()? != 0),
                TAG_TYPE_BYTES => {
                    let len = reader.read_u32()? as usize;
                    ParamValue::Bytes(reader.take(len)?.to_vec())
                }
                other => {
                    return Err(HksError::corrupt(format!(
                        "unsupported tag type {:#x}",
                        other >> TAG_TYPE_SHIFT
                    )));
                }
            };
            params.push(Param { tag, value });
        }
        if reader.remaining() != 0 {
            return Err(HksError::corrupt("trailing bytes after param set"));
        }
        Ok(Self { params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParamSet {
        let mut set = ParamSet::new();
        set.push_uint(TAG_ALGORITHM, 20)
            .and_then(|s| s.push_uint(TAG_KEY_SIZE, 256))
            .and_then(|s| s.push_bool(TAG_TYPE_BOOL | 1, true))
            .and_then(|s| s.push_bytes(TAG_KEY_ALIAS, b"alias"))
            .expect("build");
        set
    }

    #[test]
    fn serialised_form_is_size_prefixed() {
        let set = sample();
        let bytes = set.to_bytes().expect("serialise");
        assert_eq!(bytes.len(), set.serialized_len());
        assert_eq!(&bytes[..4], &(bytes.len() as u32).to_le_bytes());
        assert_eq!(&bytes[4..8], &4u32.to_le_bytes());
        assert_eq!(ParamSet::from_bytes(&bytes).expect("parse"), set);
    }

    #[test]
    fn find_locates_tags() {
        let set = sample();
        assert_eq!(set.get_uint(TAG_KEY_SIZE).expect("size"), 256);
        assert_eq!(set.get_bytes(TAG_KEY_ALIAS).expect("alias"), b"alias");
        assert!(set.find(TAG_DIGEST).expect_err("absent").is_not_exist());
    }

    #[test]
    fn rejects_mistyped_push() {
        let mut set = ParamSet::new();
        assert!(set.push_bytes(TAG_ALGORITHM, b"x").is_err());
    }

    #[test]
    fn rejects_truncated_blob() {
        let bytes = sample().to_bytes().expect("serialise");
        let cut = &bytes[..bytes.len() - 2];
        assert!(matches!(
            ParamSet::from_bytes(cut),
            Err(HksError::InvalidKeyFile(_))
        ));
    }
}
