//! Register payloads and Discover responses
//!
//! Both are CoRE link-format lists built from the registered objects. The
//! list is collected up front; [`LinkOperation::get_payload`] then streams it
//! into buffers of any size.

use log::debug;

use crate::dm::DataModel;
use crate::dm::object::Object;
use crate::error::{DmError, DmResult, Result};
use crate::io::Progress;
use crate::io::link_format::{LinkAttrs, LinkFormatEncoder};
use crate::uri::UriPath;

/// Deepest Discover depth, down to resource instances
const MAX_DEPTH: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Link {
    path: UriPath,
    version: Option<String>,
    dim: Option<u16>,
}

impl Link {
    fn plain(path: UriPath) -> Self {
        Self {
            path,
            version: None,
            dim: None,
        }
    }
}

/// A link-format response in progress
#[derive(Debug)]
pub struct LinkOperation {
    links: Vec<Link>,
    next: usize,
    encoder: LinkFormatEncoder,
    draining: bool,
}

impl LinkOperation {
    fn new(links: Vec<Link>) -> Self {
        Self {
            links,
            next: 0,
            encoder: LinkFormatEncoder::new(),
            draining: false,
        }
    }

    /// Paths listed, in output order
    pub fn paths(&self) -> Vec<UriPath> {
        self.links.iter().map(|l| l.path).collect()
    }

    pub fn get_payload(&mut self, buf: &mut [u8]) -> Result<Progress> {
        let mut written = 0;
        loop {
            if self.draining {
                let progress = self.encoder.get_payload(&mut buf[written..])?;
                written += progress.written;
                if progress.more {
                    return Ok(Progress {
                        written,
                        more: true,
                    });
                }
                self.draining = false;
            }
            if self.next == self.links.len() {
                return Ok(Progress {
                    written,
                    more: false,
                });
            }
            if written == buf.len() {
                return Ok(Progress {
                    written,
                    more: true,
                });
            }
            let link = &self.links[self.next];
            let attrs = LinkAttrs {
                version: link.version.as_deref(),
                dim: link.dim,
            };
            self.encoder.new_link(link.path, attrs)?;
            self.next += 1;
            self.draining = true;
        }
    }

    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 128];
        loop {
            let progress = self.get_payload(&mut buf)?;
            out.extend_from_slice(&buf[..progress.written]);
            if !progress.more {
                return Ok(out);
            }
        }
    }
}

fn object_link(object: &dyn Object) -> Link {
    Link {
        path: UriPath::Object(object.oid()),
        version: object.version().map(str::to_owned),
        dim: None,
    }
}

/// Links of the Register and Update messages
///
/// The Security object is never announced. Objects without instances, or
/// with a version, get a link of their own.
pub(crate) fn register(dm: &DataModel) -> DmResult<LinkOperation> {
    let mut links = Vec::new();
    for object in dm.objects().filter(|o| o.oid() != 0) {
        let instances = object.list_instances();
        if object.version().is_some() || instances.is_empty() {
            links.push(object_link(object));
        }
        links.extend(
            instances
                .into_iter()
                .map(|iid| Link::plain(UriPath::Instance(object.oid(), iid))),
        );
    }
    debug!("register payload with {} links", links.len());
    Ok(LinkOperation::new(links))
}

fn resource_links(
    object: &dyn Object,
    iid: u16,
    rid: u16,
    with_instances: bool,
    links: &mut Vec<Link>,
) -> DmResult<()> {
    let oid = object.oid();
    let def = object.resource_def(rid).ok_or(DmError::NotFound)?;
    if !def.kind.is_multiple() {
        links.push(Link::plain(UriPath::Resource(oid, iid, rid)));
        return Ok(());
    }
    let riids = object.list_resource_instances(iid, rid)?;
    links.push(Link {
        path: UriPath::Resource(oid, iid, rid),
        version: None,
        dim: Some(u16::try_from(riids.len()).map_err(|_| DmError::InternalServerError)?),
    });
    if with_instances {
        links.extend(
            riids
                .into_iter()
                .map(|riid| Link::plain(UriPath::ResourceInstance(oid, iid, rid, riid))),
        );
    }
    Ok(())
}

fn instance_links(object: &dyn Object, iid: u16, depth: u8, links: &mut Vec<Link>) -> DmResult<()> {
    links.push(Link::plain(UriPath::Instance(object.oid(), iid)));
    if depth == 0 {
        return Ok(());
    }
    for def in object.resources() {
        if object.is_present(iid, def.rid) {
            resource_links(object, iid, def.rid, depth > 1, links)?;
        }
    }
    Ok(())
}

/// Links answering a Discover on `uri`
///
/// Without an explicit depth, an object lists its instances and resources,
/// an instance its resources and a resource its instances.
pub(crate) fn discover(dm: &DataModel, uri: UriPath, depth: Option<u8>) -> DmResult<LinkOperation> {
    if matches!(uri, UriPath::Root | UriPath::ResourceInstance(..)) {
        return Err(DmError::MethodNotAllowed);
    }
    if depth.is_some_and(|d| d > MAX_DEPTH) {
        return Err(DmError::BadRequest);
    }
    let oid = uri.oid().ok_or(DmError::MethodNotAllowed)?;
    let object = dm.object(oid).ok_or(DmError::NotFound)?;
    let mut links = Vec::new();
    match uri {
        UriPath::Object(_) => {
            let depth = depth.unwrap_or(2);
            links.push(object_link(object));
            if depth > 0 {
                for iid in object.list_instances() {
                    instance_links(object, iid, depth - 1, &mut links)?;
                }
            }
        }
        UriPath::Instance(_, iid) => {
            if !object.has_instance(iid) {
                return Err(DmError::NotFound);
            }
            instance_links(object, iid, depth.unwrap_or(1), &mut links)?;
        }
        UriPath::Resource(_, iid, rid) => {
            if !object.has_instance(iid) || !object.is_present(iid, rid) {
                return Err(DmError::NotFound);
            }
            resource_links(object, iid, rid, depth.unwrap_or(1) > 0, &mut links)?;
        }
        UriPath::Root | UriPath::ResourceInstance(..) => return Err(DmError::MethodNotAllowed),
    }
    debug!("discover {}: {} links", uri, links.len());
    Ok(LinkOperation::new(links))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dm::object::{ResourceDef, ResourceKind};
    use crate::dm::tests::Simple;
    use crate::io::DataType;

    const DEFS: &[ResourceDef] = &[
        ResourceDef::new(0, ResourceKind::R, DataType::DOUBLE),
        ResourceDef::new(1, ResourceKind::RM, DataType::INT),
        ResourceDef::new(2, ResourceKind::E, DataType::NONE),
    ];

    /// Two instances; resource 1 of instance 0 has five instances
    struct Location;

    impl Object for Location {
        fn oid(&self) -> u16 {
            6
        }

        fn version(&self) -> Option<&str> {
            Some("1.1")
        }

        fn resources(&self) -> &[ResourceDef] {
            DEFS
        }

        fn list_instances(&self) -> Vec<u16> {
            vec![0, 1]
        }

        fn list_resource_instances(&self, iid: u16, _rid: u16) -> DmResult<Vec<u16>> {
            Ok(if iid == 0 { (0..5).collect() } else { Vec::new() })
        }
    }

    fn model() -> DataModel {
        let mut dm = DataModel::new();
        dm.register(Box::new(Simple::new(0, &[0]))).unwrap();
        dm.register(Box::new(Simple::new(3, &[0]))).unwrap();
        dm.register(Box::new(Location)).unwrap();
        dm.register(Box::new(Simple::new(9, &[]))).unwrap();
        dm
    }

    fn text(op: &mut LinkOperation) -> String {
        String::from_utf8(op.read_to_end().unwrap()).unwrap()
    }

    #[test]
    fn test_register_links() {
        let dm = model();
        let mut op = dm.register_prepare().unwrap();
        assert_eq!(text(&mut op), "</3/0>,</6>;ver=1.1,</6/0>,</6/1>,</9>");
    }

    #[test]
    fn test_object_depths() {
        let dm = model();
        let discover = |depth| text(&mut dm.discover(UriPath::Object(6), depth).unwrap());
        assert_eq!(discover(Some(0)), "</6>;ver=1.1");
        assert_eq!(discover(Some(1)), "</6>;ver=1.1,</6/0>,</6/1>");
        let two = "</6>;ver=1.1,</6/0>,</6/0/0>,</6/0/1>;dim=5,</6/0/2>,\
                   </6/1>,</6/1/0>,</6/1/1>;dim=0,</6/1/2>";
        assert_eq!(discover(Some(2)), two);
        assert_eq!(discover(None), two);
        assert_eq!(
            discover(Some(3)),
            "</6>;ver=1.1,</6/0>,</6/0/0>,</6/0/1>;dim=5,\
             </6/0/1/0>,</6/0/1/1>,</6/0/1/2>,</6/0/1/3>,</6/0/1/4>,</6/0/2>,\
             </6/1>,</6/1/0>,</6/1/1>;dim=0,</6/1/2>"
        );
    }

    #[test]
    fn test_instance_and_resource_depths() {
        let dm = model();
        let mut op = dm.discover(UriPath::Instance(6, 1), None).unwrap();
        assert_eq!(text(&mut op), "</6/1>,</6/1/0>,</6/1/1>;dim=0,</6/1/2>");
        let mut op = dm.discover(UriPath::Instance(6, 1), Some(0)).unwrap();
        assert_eq!(text(&mut op), "</6/1>");
        let op = dm.discover(UriPath::Resource(6, 0, 1), None).unwrap();
        assert_eq!(op.paths().len(), 6);
        let mut op = dm.discover(UriPath::Resource(6, 0, 1), Some(0)).unwrap();
        assert_eq!(text(&mut op), "</6/0/1>;dim=5");
    }

    #[test]
    fn test_discover_rejections() {
        let dm = model();
        assert_eq!(dm.discover(UriPath::Root, None).unwrap_err(), DmError::MethodNotAllowed);
        assert_eq!(
            dm.discover(UriPath::ResourceInstance(6, 0, 1, 0), None).unwrap_err(),
            DmError::MethodNotAllowed
        );
        assert_eq!(dm.discover(UriPath::Object(6), Some(4)).unwrap_err(), DmError::BadRequest);
        assert_eq!(dm.discover(UriPath::Object(5), None).unwrap_err(), DmError::NotFound);
        assert_eq!(dm.discover(UriPath::Instance(6, 7), None).unwrap_err(), DmError::NotFound);
    }

    #[test]
    fn test_output_independent_of_buffer_size() {
        let dm = model();
        let whole = text(&mut dm.discover(UriPath::Object(6), Some(3)).unwrap());
        let mut op = dm.discover(UriPath::Object(6), Some(3)).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 5];
        loop {
            let progress = op.get_payload(&mut buf).unwrap();
            out.extend_from_slice(&buf[..progress.written]);
            if !progress.more {
                break;
            }
        }
        assert_eq!(String::from_utf8(out).unwrap(), whole);
    }
}
