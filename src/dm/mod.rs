//! LwM2M data model
//!
//! The [`DataModel`] owns the registered objects and turns LwM2M operations
//! into walks over them. Reads and writes are explicit operation contexts
//! ([`ReadOperation`], [`WriteOperation`]) that the caller keeps across
//! block-wise exchanges and drives with one buffer at a time.
//!
//! # Example
//!
//! ```ignore
//! let mut dm = DataModel::new();
//! dm.register(Box::new(my_object))?;
//!
//! let mut read = dm.read(UriPath::Object(3), None)?;
//! let mut buf = [0u8; 512];
//! loop {
//!     let progress = read.get_payload(&mut dm, &mut buf)?;
//!     send(&buf[..progress.written]);
//!     if !progress.more {
//!         break;
//!     }
//! }
//! ```

use log::{debug, warn};

use crate::coap_types::Operation;
use crate::config::Config;
use crate::error::{DmError, DmResult, Error, Result};
use crate::io::link_format::is_valid_version;
use crate::uri::{ID_INVALID, UriPath};

pub mod discover;
pub mod object;
pub mod overlay;
pub mod read;
pub mod write;

pub use discover::LinkOperation;
pub use object::{Object, ResourceDef, ResourceKind};
pub use overlay::{Layered, Overlay};
pub use read::ReadOperation;
pub use write::{WriteKind, WriteOperation};

/// Registry of objects, ordered by object ID
pub struct DataModel {
    objects: Vec<Box<dyn Object>>,
    config: Config,
}

impl Default for DataModel {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DataModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let oids: Vec<u16> = self.objects.iter().map(|o| o.oid()).collect();
        f.debug_struct("DataModel")
            .field("objects", &oids)
            .field("config", &self.config)
            .finish()
    }
}

impl DataModel {
    /// Data model with the default configuration
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            objects: Vec::with_capacity(config.max_objects),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Add an object; its ID must be unused
    pub fn register(&mut self, object: Box<dyn Object>) -> Result<()> {
        let oid = object.oid();
        if oid == ID_INVALID {
            return Err(Error::Logic("reserved object ID"));
        }
        if object.version().is_some_and(|v| !is_valid_version(v)) {
            return Err(Error::Logic("object version is not major.minor"));
        }
        let Err(idx) = self.objects.binary_search_by_key(&oid, |o| o.oid()) else {
            warn!("object {} is already registered", oid);
            return Err(Error::Logic("object already registered"));
        };
        if self.objects.len() >= self.config.max_objects {
            warn!("object registry full, cannot add {}", oid);
            return Err(Error::OutOfMemory);
        }
        self.objects.insert(idx, object);
        debug!("registered object {}", oid);
        Ok(())
    }

    /// Remove an object and hand it back
    pub fn unregister(&mut self, oid: u16) -> Result<Box<dyn Object>> {
        let idx = self
            .objects
            .binary_search_by_key(&oid, |o| o.oid())
            .map_err(|_| Error::Missing)?;
        debug!("unregistered object {}", oid);
        Ok(self.objects.remove(idx))
    }

    /// Registered object IDs, ascending
    pub fn object_ids(&self) -> Vec<u16> {
        self.objects.iter().map(|o| o.oid()).collect()
    }

    pub fn object(&self, oid: u16) -> Option<&dyn Object> {
        self.find(oid).map(|idx| &*self.objects[idx])
    }

    pub(crate) fn object_mut(&mut self, oid: u16) -> DmResult<&mut dyn Object> {
        let idx = self.find(oid).ok_or(DmError::NotFound)?;
        Ok(&mut *self.objects[idx])
    }

    pub(crate) fn objects(&self) -> impl Iterator<Item = &dyn Object> {
        self.objects.iter().map(|o| &**o)
    }

    fn find(&self, oid: u16) -> Option<usize> {
        self.objects.binary_search_by_key(&oid, |o| o.oid()).ok()
    }

    /// Start a Read; `format` defaults to the configured read format
    pub fn read(&mut self, uri: UriPath, format: Option<u16>) -> DmResult<ReadOperation> {
        ReadOperation::new(self, uri, format)
    }

    /// Start a Read-Composite of several paths
    pub fn read_composite(
        &mut self,
        paths: &[UriPath],
        format: Option<u16>,
    ) -> DmResult<ReadOperation> {
        ReadOperation::composite(self, paths, format)
    }

    /// Start a Write (Replace or Partial Update) or Write-Composite
    pub fn write(&mut self, uri: UriPath, format: u16, kind: WriteKind) -> DmResult<WriteOperation> {
        WriteOperation::new(self, uri, format, kind)
    }

    /// Start a Create on an object path
    pub fn create(&mut self, uri: UriPath, format: u16) -> DmResult<WriteOperation> {
        WriteOperation::new(self, uri, format, WriteKind::Create)
    }

    /// Execute a resource
    pub fn execute(&mut self, uri: UriPath, args: &[u8]) -> DmResult<()> {
        let UriPath::Resource(oid, iid, rid) = uri else {
            return Err(DmError::MethodNotAllowed);
        };
        debug!("{} on {}", Operation::Execute, uri);
        let object = self.object_mut(oid)?;
        if !object.has_instance(iid) || !object.is_present(iid, rid) {
            return Err(DmError::NotFound);
        }
        let def = object.resource_def(rid).ok_or(DmError::NotFound)?;
        if !def.kind.is_executable() {
            return Err(DmError::MethodNotAllowed);
        }
        object.execute(iid, rid, args)
    }

    /// Delete an object instance
    pub fn delete(&mut self, uri: UriPath) -> DmResult<()> {
        let UriPath::Instance(oid, iid) = uri else {
            return Err(DmError::MethodNotAllowed);
        };
        debug!("{} on {}", Operation::Delete, uri);
        let object = self.object_mut(oid)?;
        if !object.has_instance(iid) {
            return Err(DmError::NotFound);
        }
        object.instance_remove(iid)
    }

    /// Links announced in a Register or Update message
    pub fn register_prepare(&self) -> DmResult<LinkOperation> {
        discover::register(self)
    }

    /// Links answering a Discover; `depth` defaults per path level
    pub fn discover(&self, uri: UriPath, depth: Option<u8>) -> DmResult<LinkOperation> {
        discover::discover(self, uri, depth)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::{DataType, InValue, Value};

    const DEFS: &[ResourceDef] = &[
        ResourceDef::new(0, ResourceKind::RW, DataType::INT),
        ResourceDef::new(1, ResourceKind::E, DataType::NONE),
    ];

    /// Minimal object with integer resource 0 and executable resource 1
    #[derive(Debug, Default)]
    pub(crate) struct Simple {
        pub(crate) oid: u16,
        pub(crate) instances: Vec<(u16, i64)>,
        pub(crate) executed: usize,
    }

    impl Simple {
        pub(crate) fn new(oid: u16, instances: &[u16]) -> Self {
            Self {
                oid,
                instances: instances.iter().map(|&iid| (iid, 0)).collect(),
                executed: 0,
            }
        }

        fn slot(&mut self, iid: u16) -> DmResult<&mut i64> {
            self.instances
                .iter_mut()
                .find(|(id, _)| *id == iid)
                .map(|(_, v)| v)
                .ok_or(DmError::NotFound)
        }
    }

    impl Object for Simple {
        fn oid(&self) -> u16 {
            self.oid
        }

        fn resources(&self) -> &[ResourceDef] {
            DEFS
        }

        fn list_instances(&self) -> Vec<u16> {
            self.instances.iter().map(|(iid, _)| *iid).collect()
        }

        fn read(&mut self, path: &UriPath) -> DmResult<Value> {
            let iid = path.iid().ok_or(DmError::NotFound)?;
            Ok(Value::Int(*self.slot(iid)?))
        }

        fn write(&mut self, path: &UriPath, value: &InValue<'_>) -> DmResult<()> {
            let iid = path.iid().ok_or(DmError::NotFound)?;
            let InValue::Int(v) = *value else {
                return Err(DmError::BadRequest);
            };
            *self.slot(iid)? = v;
            Ok(())
        }

        fn execute(&mut self, _iid: u16, _rid: u16, _args: &[u8]) -> DmResult<()> {
            self.executed += 1;
            Ok(())
        }

        fn instance_create(&mut self, iid: u16) -> DmResult<()> {
            let idx = self.instances.partition_point(|(id, _)| *id < iid);
            self.instances.insert(idx, (iid, 0));
            Ok(())
        }

        fn instance_remove(&mut self, iid: u16) -> DmResult<()> {
            self.instances.retain(|(id, _)| *id != iid);
            Ok(())
        }

        fn instance_reset(&mut self, iid: u16) -> DmResult<()> {
            *self.slot(iid)? = 0;
            Ok(())
        }
    }

    #[test]
    fn test_registry_keeps_objects_sorted() {
        let mut dm = DataModel::new();
        dm.register(Box::new(Simple::new(5, &[0]))).unwrap();
        dm.register(Box::new(Simple::new(3, &[0]))).unwrap();
        assert_eq!(dm.object_ids(), vec![3, 5]);
        assert!(matches!(
            dm.register(Box::new(Simple::new(3, &[]))),
            Err(Error::Logic(_))
        ));
        assert_eq!(dm.unregister(3).unwrap().oid(), 3);
        assert!(matches!(dm.unregister(3), Err(Error::Missing)));
    }

    #[test]
    fn test_registry_capacity_from_config() {
        let config = Config {
            max_objects: 1,
            ..Config::default()
        };
        let mut dm = DataModel::with_config(config);
        dm.register(Box::new(Simple::new(1, &[]))).unwrap();
        assert!(matches!(
            dm.register(Box::new(Simple::new(2, &[]))),
            Err(Error::OutOfMemory)
        ));
    }

    #[test]
    fn test_execute_checks_path_and_kind() {
        let mut dm = DataModel::new();
        dm.register(Box::new(Simple::new(7, &[0]))).unwrap();
        dm.execute(UriPath::Resource(7, 0, 1), b"").unwrap();
        assert_eq!(
            dm.execute(UriPath::Resource(7, 0, 0), b""),
            Err(DmError::MethodNotAllowed)
        );
        assert_eq!(
            dm.execute(UriPath::Resource(7, 1, 1), b""),
            Err(DmError::NotFound)
        );
        assert_eq!(
            dm.execute(UriPath::Instance(7, 0), b""),
            Err(DmError::MethodNotAllowed)
        );
        assert_eq!(dm.execute(UriPath::Resource(8, 0, 1), b""), Err(DmError::NotFound));
    }

    #[test]
    fn test_delete_instance() {
        let mut dm = DataModel::new();
        dm.register(Box::new(Simple::new(7, &[0, 1]))).unwrap();
        dm.delete(UriPath::Instance(7, 0)).unwrap();
        assert_eq!(dm.object(7).unwrap().list_instances(), vec![1]);
        assert_eq!(dm.delete(UriPath::Instance(7, 0)), Err(DmError::NotFound));
        assert_eq!(dm.delete(UriPath::Object(7)), Err(DmError::MethodNotAllowed));
    }
}
