//! Read and Read-Composite

use log::debug;

use crate::coap_types::ContentFormat;
use crate::dm::DataModel;
use crate::dm::object::{Object, ResourceDef};
use crate::error::{DmError, DmResult};
use crate::io::{self, DataType, Next, OutEntry, PayloadEncoder, Progress};
use crate::uri::UriPath;

fn push_resource(
    object: &dyn Object,
    iid: u16,
    def: &ResourceDef,
    out: &mut Vec<UriPath>,
) -> DmResult<()> {
    let oid = object.oid();
    if def.kind.is_multiple() {
        for riid in object.list_resource_instances(iid, def.rid)? {
            out.push(UriPath::ResourceInstance(oid, iid, def.rid, riid));
        }
    } else {
        out.push(UriPath::Resource(oid, iid, def.rid));
    }
    Ok(())
}

fn push_instance(object: &dyn Object, iid: u16, out: &mut Vec<UriPath>) -> DmResult<()> {
    for def in object.resources() {
        if def.kind.is_readable() && object.is_present(iid, def.rid) {
            push_resource(object, iid, def, out)?;
        }
    }
    Ok(())
}

/// Readable leaves at or below `uri`, in path order
pub(crate) fn readable_leaves(object: &dyn Object, uri: &UriPath, out: &mut Vec<UriPath>) -> DmResult<()> {
    let iid = match uri.iid() {
        Some(iid) => iid,
        None => {
            for iid in object.list_instances() {
                push_instance(object, iid, out)?;
            }
            return Ok(());
        }
    };
    if !object.has_instance(iid) {
        return Err(DmError::NotFound);
    }
    let Some(rid) = uri.rid() else {
        return push_instance(object, iid, out);
    };
    let def = object.resource_def(rid).ok_or(DmError::NotFound)?;
    if !object.is_present(iid, rid) {
        return Err(DmError::NotFound);
    }
    if !def.kind.is_readable() {
        return Err(DmError::MethodNotAllowed);
    }
    match uri.riid() {
        None => push_resource(object, iid, &def, out),
        Some(riid) => {
            if !def.kind.is_multiple() || !object.list_resource_instances(iid, rid)?.contains(&riid) {
                return Err(DmError::NotFound);
            }
            out.push(*uri);
            Ok(())
        }
    }
}

/// Paths named by a Read-Composite or Observe-Composite request payload
pub fn requested_paths(format: u16, payload: &[u8]) -> DmResult<Vec<UriPath>> {
    let mut decoder = io::in_ctx(format, UriPath::Root)?;
    decoder.feed_payload(payload, true)?;
    let mut paths = Vec::new();
    loop {
        match decoder.get_entry(DataType::NULL)? {
            Next::Entry(entry) => paths.push(entry.path),
            Next::Eof => return Ok(paths),
            Next::WantNextPayload | Next::WantTypeDisambiguation(_) => {
                return Err(DmError::BadRequest);
            }
        }
    }
}

/// A Read in progress
///
/// The set of leaves is fixed when the operation starts; values are read
/// from the objects one at a time, as the output buffer drains.
pub struct ReadOperation {
    leaves: Vec<UriPath>,
    next: usize,
    encoder: Box<dyn PayloadEncoder>,
    draining: bool,
}

impl std::fmt::Debug for ReadOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOperation")
            .field("leaves", &self.leaves)
            .field("next", &self.next)
            .field("format", &self.encoder.content_format())
            .finish()
    }
}

impl ReadOperation {
    pub(crate) fn new(dm: &mut DataModel, uri: UriPath, format: Option<u16>) -> DmResult<Self> {
        let oid = uri.oid().ok_or(DmError::MethodNotAllowed)?;
        let object = dm.object(oid).ok_or(DmError::NotFound)?;
        let mut leaves = Vec::new();
        readable_leaves(object, &uri, &mut leaves)?;
        let format = format.unwrap_or(dm.config().default_read_format);
        debug!("read {}: {} values, format {}", uri, leaves.len(), format);
        let encoder = io::out_ctx(format, uri, leaves.len())?;
        Ok(Self::start(leaves, encoder))
    }

    pub(crate) fn composite(
        dm: &mut DataModel,
        paths: &[UriPath],
        format: Option<u16>,
    ) -> DmResult<Self> {
        let format = format.unwrap_or(dm.config().default_read_format);
        if !matches!(
            ContentFormat::from_u16(format),
            Some(ContentFormat::SenmlCbor | ContentFormat::SenmlEtchCbor | ContentFormat::Lwm2mCbor)
        ) {
            return Err(DmError::UnsupportedContentFormat);
        }
        let mut leaves = Vec::new();
        for path in paths {
            let Some(oid) = path.oid() else {
                return Err(DmError::MethodNotAllowed);
            };
            // absent paths are left out of a composite response
            let Some(object) = dm.object(oid) else {
                continue;
            };
            match readable_leaves(object, path, &mut leaves) {
                Ok(()) | Err(DmError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        debug!("read-composite of {} paths: {} values", paths.len(), leaves.len());
        let encoder = io::out_ctx(format, UriPath::Root, leaves.len())?;
        Ok(Self::start(leaves, encoder))
    }

    fn start(leaves: Vec<UriPath>, encoder: Box<dyn PayloadEncoder>) -> Self {
        Self {
            leaves,
            next: 0,
            encoder,
            draining: true,
        }
    }

    pub fn content_format(&self) -> ContentFormat {
        self.encoder.content_format()
    }

    /// Paths whose values the response carries
    pub fn leaves(&self) -> &[UriPath] {
        &self.leaves
    }

    /// Fill `buf` with the next part of the response
    ///
    /// Buffers may have any size, and each call may use a different one.
    pub fn get_payload(&mut self, dm: &mut DataModel, buf: &mut [u8]) -> DmResult<Progress> {
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
            if self.next == self.leaves.len() {
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
            let path = self.leaves[self.next];
            let oid = path.oid().ok_or(DmError::InternalServerError)?;
            let value = dm.object_mut(oid)?.read(&path)?;
            self.next += 1;
            self.encoder.new_entry(OutEntry::new(path, value))?;
            self.draining = true;
        }
    }

    /// Drain the whole response into a vector
    pub fn read_to_end(&mut self, dm: &mut DataModel) -> DmResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let progress = self.get_payload(dm, &mut buf)?;
            out.extend_from_slice(&buf[..progress.written]);
            if !progress.more {
                return Ok(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dm::tests::Simple;

    fn model() -> DataModel {
        let mut dm = DataModel::new();
        dm.register(Box::new(Simple::new(3, &[0, 2]))).unwrap();
        dm
    }

    #[test]
    fn test_walk_granularities() {
        let dm = model();
        let object = dm.object(3).unwrap();
        let mut leaves = Vec::new();
        readable_leaves(object, &UriPath::Object(3), &mut leaves).unwrap();
        assert_eq!(leaves, vec![UriPath::Resource(3, 0, 0), UriPath::Resource(3, 2, 0)]);

        leaves.clear();
        readable_leaves(object, &UriPath::Instance(3, 2), &mut leaves).unwrap();
        assert_eq!(leaves, vec![UriPath::Resource(3, 2, 0)]);

        assert_eq!(
            readable_leaves(object, &UriPath::Instance(3, 1), &mut leaves),
            Err(DmError::NotFound)
        );
        assert_eq!(
            readable_leaves(object, &UriPath::Resource(3, 0, 1), &mut leaves),
            Err(DmError::MethodNotAllowed)
        );
        assert_eq!(
            readable_leaves(object, &UriPath::Resource(3, 0, 9), &mut leaves),
            Err(DmError::NotFound)
        );
    }

    #[test]
    fn test_plain_text_read_of_one_resource() {
        let mut dm = model();
        let mut read = dm
            .read(UriPath::Resource(3, 2, 0), Some(ContentFormat::PlainText.as_u16()))
            .unwrap();
        assert_eq!(read.read_to_end(&mut dm).unwrap(), b"0");
    }

    #[test]
    fn test_single_value_format_rejects_instance_read() {
        let mut dm = model();
        assert_eq!(
            dm.read(UriPath::Object(3), Some(ContentFormat::PlainText.as_u16()))
                .unwrap_err(),
            DmError::UnsupportedContentFormat
        );
        assert_eq!(dm.read(UriPath::Root, None).unwrap_err(), DmError::MethodNotAllowed);
        assert_eq!(dm.read(UriPath::Object(4), None).unwrap_err(), DmError::NotFound);
    }

    #[test]
    fn test_output_independent_of_buffer_size() {
        let mut dm = model();
        let whole = dm.read(UriPath::Object(3), None).unwrap().read_to_end(&mut dm).unwrap();
        for size in 1..8 {
            let mut read = dm.read(UriPath::Object(3), None).unwrap();
            let mut out = Vec::new();
            let mut buf = vec![0u8; size];
            loop {
                let progress = read.get_payload(&mut dm, &mut buf).unwrap();
                out.extend_from_slice(&buf[..progress.written]);
                if !progress.more {
                    break;
                }
            }
            assert_eq!(out, whole, "buffer size {}", size);
        }
    }

    #[test]
    fn test_composite_skips_absent_paths() {
        let mut dm = model();
        let read = dm
            .read_composite(
                &[UriPath::Resource(3, 0, 0), UriPath::Object(9), UriPath::Instance(3, 5)],
                Some(ContentFormat::SenmlCbor.as_u16()),
            )
            .unwrap();
        assert_eq!(read.leaves(), &[UriPath::Resource(3, 0, 0)]);
        assert_eq!(
            dm.read_composite(&[UriPath::Object(3)], Some(ContentFormat::OmaTlv.as_u16()))
                .unwrap_err(),
            DmError::UnsupportedContentFormat
        );
    }

    #[test]
    fn test_requested_paths_from_senml() {
        // [{0: "/3/0/0"}, {0: "/5"}]
        let payload = hex::decode("82a100662f332f302f30a100622f35").unwrap();
        let paths = requested_paths(ContentFormat::SenmlCbor.as_u16(), &payload).unwrap();
        assert_eq!(paths, vec![UriPath::Resource(3, 0, 0), UriPath::Object(5)]);
    }
}
