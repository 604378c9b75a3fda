//! Handler layering for objects
//!
//! A [`Layered`] object runs every read, write and execute through an ordered
//! list of [`Overlay`]s before it reaches the wrapped object. Each overlay gets
//! a [`Next`] handle and decides whether, and how, to pass the call on.

use crate::dm::object::{Object, ResourceDef};
use crate::error::DmResult;
use crate::io::{InValue, Value};
use crate::uri::UriPath;

/// Remaining layers of a call, ending at the wrapped object
pub struct Next<'a> {
    layers: &'a mut [Box<dyn Overlay>],
    inner: &'a mut dyn Object,
}

impl Next<'_> {
    pub fn read(self, path: &UriPath) -> DmResult<Value> {
        match self.layers.split_first_mut() {
            Some((layer, rest)) => layer.read(
                path,
                Next {
                    layers: rest,
                    inner: self.inner,
                },
            ),
            None => self.inner.read(path),
        }
    }

    pub fn write(self, path: &UriPath, value: &InValue<'_>) -> DmResult<()> {
        match self.layers.split_first_mut() {
            Some((layer, rest)) => layer.write(
                path,
                value,
                Next {
                    layers: rest,
                    inner: self.inner,
                },
            ),
            None => self.inner.write(path, value),
        }
    }

    pub fn execute(self, iid: u16, rid: u16, args: &[u8]) -> DmResult<()> {
        match self.layers.split_first_mut() {
            Some((layer, rest)) => layer.execute(
                iid,
                rid,
                args,
                Next {
                    layers: rest,
                    inner: self.inner,
                },
            ),
            None => self.inner.execute(iid, rid, args),
        }
    }
}

/// One layer; the defaults pass everything through
pub trait Overlay {
    fn read(&mut self, path: &UriPath, next: Next<'_>) -> DmResult<Value> {
        next.read(path)
    }

    fn write(&mut self, path: &UriPath, value: &InValue<'_>, next: Next<'_>) -> DmResult<()> {
        next.write(path, value)
    }

    fn execute(&mut self, iid: u16, rid: u16, args: &[u8], next: Next<'_>) -> DmResult<()> {
        next.execute(iid, rid, args)
    }
}

/// An object wrapped in overlays; the first pushed layer runs first
pub struct Layered<O> {
    inner: O,
    layers: Vec<Box<dyn Overlay>>,
}

impl<O: Object> Layered<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            layers: Vec::new(),
        }
    }

    /// Add a layer below the existing ones
    pub fn with(mut self, layer: impl Overlay + 'static) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    fn chain(&mut self) -> Next<'_> {
        Next {
            layers: &mut self.layers,
            inner: &mut self.inner,
        }
    }
}

impl<O: Object> Object for Layered<O> {
    fn oid(&self) -> u16 {
        self.inner.oid()
    }

    fn version(&self) -> Option<&str> {
        self.inner.version()
    }

    fn resources(&self) -> &[ResourceDef] {
        self.inner.resources()
    }

    fn list_instances(&self) -> Vec<u16> {
        self.inner.list_instances()
    }

    fn is_present(&self, iid: u16, rid: u16) -> bool {
        self.inner.is_present(iid, rid)
    }

    fn list_resource_instances(&self, iid: u16, rid: u16) -> DmResult<Vec<u16>> {
        self.inner.list_resource_instances(iid, rid)
    }

    fn read(&mut self, path: &UriPath) -> DmResult<Value> {
        self.chain().read(path)
    }

    fn write(&mut self, path: &UriPath, value: &InValue<'_>) -> DmResult<()> {
        self.chain().write(path, value)
    }

    fn execute(&mut self, iid: u16, rid: u16, args: &[u8]) -> DmResult<()> {
        self.chain().execute(iid, rid, args)
    }

    fn instance_create(&mut self, iid: u16) -> DmResult<()> {
        self.inner.instance_create(iid)
    }

    fn instance_remove(&mut self, iid: u16) -> DmResult<()> {
        self.inner.instance_remove(iid)
    }

    fn instance_reset(&mut self, iid: u16) -> DmResult<()> {
        self.inner.instance_reset(iid)
    }

    fn resource_reset(&mut self, iid: u16, rid: u16) -> DmResult<()> {
        self.inner.resource_reset(iid, rid)
    }

    fn transaction_begin(&mut self) -> DmResult<()> {
        self.inner.transaction_begin()
    }

    fn transaction_validate(&mut self) -> DmResult<()> {
        self.inner.transaction_validate()
    }

    fn transaction_end(&mut self, result: DmResult<()>) -> DmResult<()> {
        self.inner.transaction_end(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dm::object::ResourceKind;
    use crate::error::DmError;
    use crate::io::DataType;
    use std::cell::RefCell;
    use std::rc::Rc;

    const DEFS: &[ResourceDef] = &[ResourceDef::new(0, ResourceKind::RW, DataType::INT)];

    #[derive(Default)]
    struct Counter {
        value: i64,
    }

    impl Object for Counter {
        fn oid(&self) -> u16 {
            1000
        }

        fn resources(&self) -> &[ResourceDef] {
            DEFS
        }

        fn list_instances(&self) -> Vec<u16> {
            vec![0]
        }

        fn read(&mut self, _path: &UriPath) -> DmResult<Value> {
            Ok(Value::Int(self.value))
        }

        fn write(&mut self, _path: &UriPath, value: &InValue<'_>) -> DmResult<()> {
            match value {
                InValue::Int(v) => {
                    self.value = *v;
                    Ok(())
                }
                _ => Err(DmError::BadRequest),
            }
        }
    }

    struct Trace(&'static str, Rc<RefCell<Vec<&'static str>>>);

    impl Overlay for Trace {
        fn read(&mut self, path: &UriPath, next: Next<'_>) -> DmResult<Value> {
            self.1.borrow_mut().push(self.0);
            next.read(path)
        }
    }

    struct ReadOnly;

    impl Overlay for ReadOnly {
        fn write(&mut self, _: &UriPath, _: &InValue<'_>, _: Next<'_>) -> DmResult<()> {
            Err(DmError::Unauthorized)
        }
    }

    #[test]
    fn test_layers_run_in_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut object = Layered::new(Counter { value: 7 })
            .with(Trace("outer", log.clone()))
            .with(Trace("inner", log.clone()));
        let path = UriPath::Resource(1000, 0, 0);
        assert!(matches!(object.read(&path), Ok(Value::Int(7))));
        assert_eq!(*log.borrow(), ["outer", "inner"]);
    }

    #[test]
    fn test_layer_can_short_circuit() {
        let mut object = Layered::new(Counter::default()).with(ReadOnly);
        let path = UriPath::Resource(1000, 0, 0);
        assert_eq!(object.write(&path, &InValue::Int(3)), Err(DmError::Unauthorized));
        assert_eq!(object.inner().value, 0);
    }

    #[test]
    fn test_passthrough_reaches_object() {
        let mut object = Layered::new(Counter::default()).with(Trace("t", Rc::default()));
        let path = UriPath::Resource(1000, 0, 0);
        object.write(&path, &InValue::Int(5)).unwrap();
        assert!(matches!(object.read(&path), Ok(Value::Int(5))));
    }
}
