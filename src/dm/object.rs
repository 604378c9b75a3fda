//! The seam object implementations plug into

use crate::error::{DmError, DmResult};
use crate::io::{DataType, InValue, Value};
use crate::uri::UriPath;

/// Operations a resource supports, as in the LwM2M object definitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Single-instance, readable
    R,
    /// Single-instance, writable
    W,
    /// Single-instance, readable and writable
    RW,
    /// Multiple-instance, readable
    RM,
    /// Multiple-instance, writable
    WM,
    /// Multiple-instance, readable and writable
    RWM,
    /// Executable
    E,
}

impl ResourceKind {
    pub fn is_readable(self) -> bool {
        matches!(self, Self::R | Self::RW | Self::RM | Self::RWM)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Self::W | Self::RW | Self::WM | Self::RWM)
    }

    pub fn is_multiple(self) -> bool {
        matches!(self, Self::RM | Self::WM | Self::RWM)
    }

    pub fn is_executable(self) -> bool {
        self == Self::E
    }
}

/// Static definition of one resource of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDef {
    /// Resource ID
    pub rid: u16,
    /// Supported operations
    pub kind: ResourceKind,
    /// Value type; `DataType::NONE` for executable resources
    pub data_type: DataType,
}

impl ResourceDef {
    pub const fn new(rid: u16, kind: ResourceKind, data_type: DataType) -> Self {
        Self {
            rid,
            kind,
            data_type,
        }
    }
}

/// An LwM2M object: its definition, its instances and its handlers
///
/// Listing methods must return IDs in strictly ascending order; encoders rely
/// on it and nothing re-sorts them. Handlers not overridden answer
/// `MethodNotAllowed`.
///
/// Writes of strings and opaque data arrive in chunks: `value` is then an
/// [`InValue::String`] or [`InValue::Bytes`] whose `offset` grows from 0 and
/// whose last chunk carries the full length.
pub trait Object {
    /// Object ID
    fn oid(&self) -> u16;

    /// Object version as `major.minor`, when not 1.0
    fn version(&self) -> Option<&str> {
        None
    }

    /// Resource definitions, ordered by ID
    fn resources(&self) -> &[ResourceDef];

    /// Existing instance IDs
    fn list_instances(&self) -> Vec<u16>;

    /// Whether an optional resource currently exists in an instance
    fn is_present(&self, _iid: u16, _rid: u16) -> bool {
        true
    }

    /// Instance IDs of a multiple resource
    fn list_resource_instances(&self, _iid: u16, _rid: u16) -> DmResult<Vec<u16>> {
        Err(DmError::MethodNotAllowed)
    }

    /// Value of a single resource or of one resource instance
    fn read(&mut self, _path: &UriPath) -> DmResult<Value> {
        Err(DmError::MethodNotAllowed)
    }

    /// Store a value, or a chunk of one, into a resource or resource instance
    fn write(&mut self, _path: &UriPath, _value: &InValue<'_>) -> DmResult<()> {
        Err(DmError::MethodNotAllowed)
    }

    fn execute(&mut self, _iid: u16, _rid: u16, _args: &[u8]) -> DmResult<()> {
        Err(DmError::MethodNotAllowed)
    }

    fn instance_create(&mut self, _iid: u16) -> DmResult<()> {
        Err(DmError::MethodNotAllowed)
    }

    fn instance_remove(&mut self, _iid: u16) -> DmResult<()> {
        Err(DmError::MethodNotAllowed)
    }

    /// Clear an instance before a Replace write
    fn instance_reset(&mut self, _iid: u16) -> DmResult<()> {
        Err(DmError::MethodNotAllowed)
    }

    /// Remove every instance of a multiple resource before a Replace write
    fn resource_reset(&mut self, _iid: u16, _rid: u16) -> DmResult<()> {
        Err(DmError::MethodNotAllowed)
    }

    fn transaction_begin(&mut self) -> DmResult<()> {
        Ok(())
    }

    fn transaction_validate(&mut self) -> DmResult<()> {
        Ok(())
    }

    /// Commit on `Ok`, roll back otherwise
    fn transaction_end(&mut self, _result: DmResult<()>) -> DmResult<()> {
        Ok(())
    }
}

impl dyn Object + '_ {
    /// Definition of `rid`, if the object has such a resource
    pub fn resource_def(&self, rid: u16) -> Option<ResourceDef> {
        self.resources()
            .binary_search_by_key(&rid, |def| def.rid)
            .ok()
            .map(|idx| self.resources()[idx])
    }

    pub fn has_instance(&self, iid: u16) -> bool {
        self.list_instances().binary_search(&iid).is_ok()
    }

    /// Lowest instance ID not in use
    pub fn free_instance_id(&self) -> Option<u16> {
        let instances = self.list_instances();
        (0..crate::uri::ID_INVALID).find(|iid| instances.binary_search(iid).is_err())
    }
}
