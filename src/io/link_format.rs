//! CoRE link-format (RFC 6690) payloads of Register and Discover
//!
//! ```text
//! Register:  </1>;ver=1.1,</1/0>,</3/0>
//! Discover:  </3>;ver=1.0,</3/0>,</3/0/1>,</3/0/7>;dim=2,</3/0/7/0>,</3/0/7/1>
//! ```

use std::fmt::Write as _;

use crate::coap_types::ContentFormat;
use crate::error::{Error, Result};
use crate::io::Progress;
use crate::io::staging::Staging;
use crate::uri::UriPath;

/// Whether `version` has the `major.minor` shape LwM2M requires
pub fn is_valid_version(version: &str) -> bool {
    let Some((major, minor)) = version.split_once('.') else {
        return false;
    };
    let digits = |s: &str| !s.is_empty() && s.len() <= 3 && s.bytes().all(|b| b.is_ascii_digit());
    digits(major) && digits(minor)
}

/// Attributes attached to one link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkAttrs<'a> {
    /// Object version (`ver`), objects only
    pub version: Option<&'a str>,
    /// Number of instances of a multiple resource (`dim`)
    pub dim: Option<u16>,
}

/// Streaming link-format writer; links are separated by commas
#[derive(Debug, Default)]
pub struct LinkFormatEncoder {
    staging: Staging,
    links: usize,
}

impl LinkFormatEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_format(&self) -> ContentFormat {
        ContentFormat::LinkFormat
    }

    /// Append one link; the previous one must be fully drained
    pub fn new_link(&mut self, path: UriPath, attrs: LinkAttrs<'_>) -> Result<()> {
        if let Some(version) = attrs.version {
            if path.len() != 1 || !is_valid_version(version) {
                return Err(Error::Logic("version belongs to an object link"));
            }
        }
        self.staging.begin_entry()?;
        let mut link = String::new();
        if self.links > 0 {
            link.push(',');
        }
        self.links += 1;
        let _ = write!(link, "<{}>", path);
        if let Some(version) = attrs.version {
            let _ = write!(link, ";ver={}", version);
        }
        if let Some(dim) = attrs.dim {
            let _ = write!(link, ";dim={}", dim);
        }
        self.staging.out().extend_from_slice(link.as_bytes());
        Ok(())
    }

    pub fn get_payload(&mut self, buf: &mut [u8]) -> Result<Progress> {
        self.staging.drain(buf)
    }
}
