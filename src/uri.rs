//! LwM2M data model addressing
//!
//! A [`UriPath`] names a node of the object tree at one of five levels. The
//! reserved identifier [`ID_INVALID`] is never a valid ID at any level.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Reserved identifier meaning "absent"
pub const ID_INVALID: u16 = 0xFFFF;

/// Object / instance / resource / resource-instance path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UriPath {
    /// The data model root
    #[default]
    Root,
    /// `/oid`
    Object(u16),
    /// `/oid/iid`
    Instance(u16, u16),
    /// `/oid/iid/rid`
    Resource(u16, u16, u16),
    /// `/oid/iid/rid/riid`
    ResourceInstance(u16, u16, u16, u16),
}

impl UriPath {
    /// Build a path from up to four IDs
    pub fn from_ids(ids: &[u16]) -> Result<Self> {
        if ids.contains(&ID_INVALID) {
            return Err(Error::Format("reserved ID in path"));
        }
        match *ids {
            [] => Ok(Self::Root),
            [oid] => Ok(Self::Object(oid)),
            [oid, iid] => Ok(Self::Instance(oid, iid)),
            [oid, iid, rid] => Ok(Self::Resource(oid, iid, rid)),
            [oid, iid, rid, riid] => Ok(Self::ResourceInstance(oid, iid, rid, riid)),
            _ => Err(Error::Format("path deeper than four levels")),
        }
    }

    /// Number of IDs in the path (0 for the root)
    pub fn len(&self) -> usize {
        match self {
            Self::Root => 0,
            Self::Object(..) => 1,
            Self::Instance(..) => 2,
            Self::Resource(..) => 3,
            Self::ResourceInstance(..) => 4,
        }
    }

    /// Whether this is the root path
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Root)
    }

    /// The IDs as a fixed array, unused levels set to [`ID_INVALID`]
    pub fn ids(&self) -> [u16; 4] {
        match *self {
            Self::Root => [ID_INVALID; 4],
            Self::Object(oid) => [oid, ID_INVALID, ID_INVALID, ID_INVALID],
            Self::Instance(oid, iid) => [oid, iid, ID_INVALID, ID_INVALID],
            Self::Resource(oid, iid, rid) => [oid, iid, rid, ID_INVALID],
            Self::ResourceInstance(oid, iid, rid, riid) => [oid, iid, rid, riid],
        }
    }

    /// ID at the given level (0 = object), if present
    pub fn id(&self, level: usize) -> Option<u16> {
        if level < self.len() {
            Some(self.ids()[level])
        } else {
            None
        }
    }

    /// Object ID, if present
    pub fn oid(&self) -> Option<u16> {
        self.id(0)
    }

    /// Instance ID, if present
    pub fn iid(&self) -> Option<u16> {
        self.id(1)
    }

    /// Resource ID, if present
    pub fn rid(&self) -> Option<u16> {
        self.id(2)
    }

    /// Resource instance ID, if present
    pub fn riid(&self) -> Option<u16> {
        self.id(3)
    }

    /// Path one level deeper
    pub fn child(&self, id: u16) -> Result<Self> {
        let ids = self.ids();
        let len = self.len();
        if len == 4 {
            return Err(Error::Logic("resource instance path has no children"));
        }
        let mut out = [0u16; 4];
        out[..len].copy_from_slice(&ids[..len]);
        out[len] = id;
        Self::from_ids(&out[..=len])
    }

    /// Path truncated to `len` levels
    pub fn truncated(&self, len: usize) -> Self {
        let ids = self.ids();
        match len.min(self.len()) {
            0 => Self::Root,
            1 => Self::Object(ids[0]),
            2 => Self::Instance(ids[0], ids[1]),
            3 => Self::Resource(ids[0], ids[1], ids[2]),
            _ => *self,
        }
    }

    /// Whether `self` is equal to or an ancestor of `other`
    pub fn is_prefix_of(&self, other: &UriPath) -> bool {
        self.len() <= other.len() && other.truncated(self.len()) == *self
    }

    /// Number of leading IDs two paths have in common
    pub fn common_prefix_len(&self, other: &UriPath) -> usize {
        let (a, b) = (self.ids(), other.ids());
        let max = self.len().min(other.len());
        (0..max).take_while(|&i| a[i] == b[i]).count()
    }
}

impl fmt::Display for UriPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("/");
        }
        for id in &self.ids()[..self.len()] {
            write!(f, "/{}", id)?;
        }
        Ok(())
    }
}

impl FromStr for UriPath {
    type Err = Error;

    /// Parse `/oid/iid/rid/riid` style paths; `""` and `"/"` are the root
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.strip_prefix('/').unwrap_or(s);
        if trimmed.is_empty() {
            return Ok(Self::Root);
        }
        let mut ids = heapless::Vec::<u16, 4>::new();
        for segment in trimmed.split('/') {
            let id = parse_id(segment)?;
            ids.push(id)
                .map_err(|_| Error::Format("path deeper than four levels"))?;
        }
        Self::from_ids(&ids)
    }
}

fn parse_id(segment: &str) -> Result<u16> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Format("path segment is not a number"));
    }
    segment
        .parse::<u16>()
        .map_err(|_| Error::Format("path segment out of range"))
}

/// Object link value (`oid:iid`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjLink {
    /// Target object ID
    pub oid: u16,
    /// Target instance ID
    pub iid: u16,
}

impl ObjLink {
    /// Create a new object link
    pub fn new(oid: u16, iid: u16) -> Self {
        Self { oid, iid }
    }
}

impl fmt::Display for ObjLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.oid, self.iid)
    }
}

impl FromStr for ObjLink {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (oid, iid) = s
            .split_once(':')
            .ok_or(Error::Format("object link without ':'"))?;
        Ok(Self {
            oid: parse_id(oid)?,
            iid: parse_id(iid)?,
        })
    }
}
