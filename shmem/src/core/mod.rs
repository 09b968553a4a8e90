use std::fmt;

use serde_derive::{Deserialize, Serialize};

use crate::errors::{Result, ShmemLibError};

pub const MAX_PATH_LEN: usize = 256;
pub const MAX_SHMNAME_LEN: usize = 32;
pub const MAX_MSG_NUM: usize = 10;
pub const MAX_MSG_SIZE: usize = 1024;

pub static DEFAULT_CHANNEL_NAME: &str = "/shmcache-requests";
pub static DEFAULT_SEGMENT_PREFIX: &str = "/shmcache-seg-";

/// Result of resolving a path, as announced in a segment header.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 1,
    NotFound = 2,
    Error = 3,
}

impl Status {
    pub fn from_raw(raw: u32) -> Option<Status> {
        match raw {
            1 => Some(Status::Ok),
            2 => Some(Status::NotFound),
            3 => Some(Status::Error),
            _ => None,
        }
    }
}

/// Text that fits a NUL-terminated field of `N` bytes.
///
/// Construction fails instead of truncating, so a path or name that would not
/// survive the trip through shared memory is rejected up front.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FixedStr<const N: usize> {
    value: String,
}

impl<const N: usize> FixedStr<N> {
    pub fn new(field: &'static str, value: &str) -> Result<Self> {
        if value.len() > N - 1 {
            return Err(ShmemLibError::TooLong {
                field,
                len: value.len(),
                max: N - 1,
            });
        }
        if value.as_bytes().contains(&0) {
            return Err(ShmemLibError::protocol(format!("{} contains a NUL byte", field)));
        }
        Ok(FixedStr {
            value: value.to_owned(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Writes the value NUL padded into `dest`, which must be `N` bytes.
    pub fn write_to(&self, dest: &mut [u8]) {
        debug_assert_eq!(dest.len(), N);
        let bytes = self.value.as_bytes();
        dest[..bytes.len()].copy_from_slice(bytes);
        for b in dest[bytes.len()..].iter_mut() {
            *b = 0;
        }
    }

    pub fn read_from(field: &'static str, src: &[u8]) -> Result<Self> {
        let src = &src[..src.len().min(N)];
        let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
        let value = std::str::from_utf8(&src[..end])
            .map_err(|_| ShmemLibError::protocol(format!("{} is not valid UTF-8", field)))?;
        FixedStr::new(field, value)
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.value, f)
    }
}

pub type ResourcePath = FixedStr<MAX_PATH_LEN>;
pub type SegmentName = FixedStr<MAX_SHMNAME_LEN>;

/// Names shared by both processes. They must agree for the back-end to find
/// the front-end's channel and segments.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub channel_name: String,
    pub segment_prefix: String,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            segment_prefix: DEFAULT_SEGMENT_PREFIX.to_string(),
        }
    }
}

impl ShmemConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.channel_name.starts_with('/') || self.channel_name[1..].contains('/') {
            return Err(ShmemLibError::Config(format!(
                "channel name {:?} must be a single '/'-prefixed component",
                self.channel_name
            )));
        }
        if self.segment_prefix.is_empty() || self.segment_prefix.contains('\0') {
            return Err(ShmemLibError::Config("segment prefix must not be empty".into()));
        }
        Ok(())
    }
}

#[inline]
pub fn segment_name(prefix: &str, index: usize) -> Result<SegmentName> {
    SegmentName::new("segment name", &format!("{}{}", prefix, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_str_rejects_overflow() {
        let long = "x".repeat(MAX_SHMNAME_LEN);
        match SegmentName::new("segment name", &long) {
            Err(ShmemLibError::TooLong { len, max, .. }) => {
                assert_eq!(len, MAX_SHMNAME_LEN);
                assert_eq!(max, MAX_SHMNAME_LEN - 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(SegmentName::new("segment name", &long[1..]).is_ok());
    }

    #[test]
    fn fixed_str_reads_up_to_nul() {
        let mut buf = [0xffu8; MAX_SHMNAME_LEN];
        SegmentName::new("segment name", "/seg-3").unwrap().write_to(&mut buf);
        assert_eq!(&buf[..6], b"/seg-3");
        assert!(buf[6..].iter().all(|&b| b == 0));
        let back = SegmentName::read_from("segment name", &buf).unwrap();
        assert_eq!(back.as_str(), "/seg-3");
    }

    #[test]
    fn segment_names_follow_prefix() {
        assert_eq!(segment_name("/seg-", 12).unwrap().as_str(), "/seg-12");
        assert!(segment_name(&"p".repeat(30), 100).is_err());
    }

    #[test]
    fn status_raw_values() {
        assert_eq!(Status::from_raw(Status::NotFound as u32), Some(Status::NotFound));
        assert_eq!(Status::from_raw(0), None);
    }

    #[test]
    fn config_rejects_nested_channel_name() {
        let cfg = ShmemConfig {
            channel_name: "/a/b".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
        assert!(ShmemConfig::default().validate().is_ok());
    }
}
