//! Write, Write-Composite and Create
//!
//! A [`WriteOperation`] is fed the request payload chunk by chunk (one chunk
//! per BLOCK1 exchange). Every object touched by the write has a transaction
//! open; the transactions are validated and committed once the whole payload
//! is applied, and rolled back as soon as anything fails.

use log::{debug, warn};

use crate::coap_types::{ContentFormat, Operation};
use crate::dm::DataModel;
use crate::dm::object::ResourceDef;
use crate::error::{DmError, DmResult};
use crate::io::{self, DataType, Entry, InValue, Next, PayloadDecoder};
use crate::uri::{ObjLink, UriPath};

/// What kind of write a [`WriteOperation`] performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// CoAP PUT: the target instance or multiple resource is cleared first
    Replace,
    /// CoAP POST on an instance or resource: only the given values change
    PartialUpdate,
    /// CoAP POST on an object: a new instance receives the values
    Create,
    /// CoAP iPATCH on the root: values anywhere in the tree
    Composite,
}

impl WriteKind {
    pub fn operation(self) -> Operation {
        match self {
            WriteKind::Replace => Operation::WriteReplace,
            WriteKind::PartialUpdate => Operation::WritePartialUpdate,
            WriteKind::Create => Operation::Create,
            WriteKind::Composite => Operation::WriteComposite,
        }
    }
}

/// Convert a decoded value into the resource's type when no precision is lost
fn coerce<'a>(value: InValue<'a>, ty: DataType) -> Option<InValue<'a>> {
    if ty.contains(value.data_type()) {
        return Some(value);
    }
    let int_to = |v: i64| -> Option<InValue<'a>> {
        if ty.contains(DataType::INT) {
            Some(InValue::Int(v))
        } else if ty.contains(DataType::UINT) {
            u64::try_from(v).ok().map(InValue::UInt)
        } else if ty.contains(DataType::TIME) {
            Some(InValue::Time(v))
        } else if ty.contains(DataType::DOUBLE) {
            Some(InValue::Double(v as f64))
        } else {
            None
        }
    };
    match value {
        InValue::Int(v) | InValue::Time(v) => int_to(v),
        InValue::UInt(v) => match i64::try_from(v) {
            Ok(v) => int_to(v),
            Err(_) if ty.contains(DataType::DOUBLE) => Some(InValue::Double(v as f64)),
            Err(_) => None,
        },
        InValue::Double(v) => {
            if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
                int_to(v as i64).filter(|c| !matches!(c, InValue::Double(_)))
            } else {
                None
            }
        }
        InValue::String(chunk) if ty.contains(DataType::OBJLINK) => {
            if chunk.offset != 0 || !chunk.is_last() {
                return None;
            }
            std::str::from_utf8(chunk.data)
                .ok()
                .and_then(|s| s.parse::<ObjLink>().ok())
                .map(InValue::ObjLink)
        }
        _ => None,
    }
}

/// Everything but the decoder, so entries borrowed from the decoder can be
/// applied while it stays borrowed
#[derive(Debug)]
struct WriteState {
    uri: UriPath,
    kind: WriteKind,
    /// Objects with an open transaction
    transactions: Vec<u16>,
    /// Resource receiving a chunked value, and the next expected offset
    stream: Option<(UriPath, usize)>,
    created: Option<u16>,
}

impl WriteState {
    fn begin(&mut self, dm: &mut DataModel, oid: u16) -> DmResult<()> {
        if !self.transactions.contains(&oid) {
            dm.object_mut(oid)?.transaction_begin()?;
            self.transactions.push(oid);
        }
        Ok(())
    }

    /// Resource definition of a path written to
    fn resource(&self, dm: &mut DataModel, path: &UriPath) -> DmResult<ResourceDef> {
        let (Some(oid), Some(rid)) = (path.oid(), path.rid()) else {
            return Err(DmError::BadRequest);
        };
        let def = dm
            .object_mut(oid)?
            .resource_def(rid)
            .ok_or(DmError::NotFound)?;
        if def.kind.is_executable() {
            return Err(DmError::MethodNotAllowed);
        }
        Ok(def)
    }

    fn create_instance(&mut self, dm: &mut DataModel, oid: u16, iid: Option<u16>) -> DmResult<()> {
        let object = dm.object_mut(oid)?;
        let iid = match iid {
            Some(iid) if object.has_instance(iid) => return Err(DmError::BadRequest),
            Some(iid) => iid,
            None => object.free_instance_id().ok_or(DmError::InternalServerError)?,
        };
        self.begin(dm, oid)?;
        dm.object_mut(oid)?.instance_create(iid)?;
        debug!("created instance /{}/{}", oid, iid);
        self.created = Some(iid);
        Ok(())
    }

    fn apply(&mut self, dm: &mut DataModel, entry: &Entry<'_>) -> DmResult<()> {
        let path = entry.path;
        if !self.uri.is_prefix_of(&path) {
            return Err(DmError::BadRequest);
        }
        let (Some(oid), Some(iid)) = (path.oid(), path.iid()) else {
            return Err(DmError::BadRequest);
        };
        if self.kind == WriteKind::Create {
            match self.created {
                None => self.create_instance(dm, oid, Some(iid))?,
                Some(created) if created != iid => return Err(DmError::BadRequest),
                Some(_) => {}
            }
        }
        let def = self.resource(dm, &path)?;
        let allowed = def.kind.is_writable() || self.kind == WriteKind::Create;
        if !allowed {
            return Err(DmError::MethodNotAllowed);
        }
        if def.kind.is_multiple() != (path.len() == 4) {
            return Err(DmError::BadRequest);
        }
        self.begin(dm, oid)?;
        let object = dm.object_mut(oid)?;
        if !object.has_instance(iid) {
            return Err(DmError::NotFound);
        }

        let value = coerce(entry.value, def.data_type).ok_or(DmError::BadRequest)?;
        match value {
            InValue::String(chunk) | InValue::Bytes(chunk) => {
                let expected = match self.stream {
                    Some((streamed, next)) if streamed == path => next,
                    Some(_) => return Err(DmError::BadRequest),
                    None => 0,
                };
                if chunk.offset != expected {
                    warn!(
                        "chunk of {} at offset {}, expected {}",
                        path, chunk.offset, expected
                    );
                    return Err(DmError::BadRequest);
                }
                self.stream = if chunk.is_last() {
                    None
                } else {
                    Some((path, chunk.offset + chunk.data.len()))
                };
            }
            _ => {
                if self.stream.is_some() {
                    return Err(DmError::BadRequest);
                }
            }
        }
        object.write(&path, &value)
    }

    /// Validate and commit every open transaction
    fn commit(&mut self, dm: &mut DataModel) -> DmResult<()> {
        let mut result = Ok(());
        for &oid in &self.transactions {
            result = dm.object_mut(oid).and_then(|o| o.transaction_validate());
            if result.is_err() {
                break;
            }
        }
        for oid in std::mem::take(&mut self.transactions) {
            let end = dm.object_mut(oid).and_then(|o| o.transaction_end(result));
            if result.is_ok() {
                result = end;
            }
        }
        result
    }

    fn rollback(&mut self, dm: &mut DataModel, err: DmError) {
        for oid in std::mem::take(&mut self.transactions) {
            if let Ok(object) = dm.object_mut(oid) {
                let _ = object.transaction_end(Err(err));
            }
        }
    }
}

/// A Write, Write-Composite or Create in progress
pub struct WriteOperation {
    decoder: Box<dyn PayloadDecoder>,
    hint: DataType,
    state: WriteState,
    finished: bool,
}

impl std::fmt::Debug for WriteOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteOperation")
            .field("format", &self.decoder.content_format())
            .field("state", &self.state)
            .field("finished", &self.finished)
            .finish()
    }
}

impl WriteOperation {
    pub(crate) fn new(
        dm: &mut DataModel,
        uri: UriPath,
        format: u16,
        kind: WriteKind,
    ) -> DmResult<Self> {
        match kind {
            WriteKind::Replace | WriteKind::PartialUpdate => {
                let (Some(oid), Some(iid)) = (uri.oid(), uri.iid()) else {
                    return Err(DmError::MethodNotAllowed);
                };
                let object = dm.object_mut(oid)?;
                if !object.has_instance(iid) {
                    return Err(DmError::NotFound);
                }
                if let Some(rid) = uri.rid() {
                    let def = object.resource_def(rid).ok_or(DmError::NotFound)?;
                    if !def.kind.is_writable() {
                        return Err(DmError::MethodNotAllowed);
                    }
                }
            }
            WriteKind::Create => {
                let UriPath::Object(oid) = uri else {
                    return Err(DmError::MethodNotAllowed);
                };
                dm.object_mut(oid)?;
            }
            WriteKind::Composite => {
                if uri != UriPath::Root {
                    return Err(DmError::MethodNotAllowed);
                }
                if !matches!(
                    ContentFormat::from_u16(format),
                    Some(
                        ContentFormat::SenmlCbor
                            | ContentFormat::SenmlEtchCbor
                            | ContentFormat::Lwm2mCbor
                    )
                ) {
                    return Err(DmError::UnsupportedContentFormat);
                }
            }
        }
        let decoder = io::in_ctx(format, uri)?;
        debug!("{} on {}, format {}", kind.operation(), uri, format);

        let mut state = WriteState {
            uri,
            kind,
            transactions: Vec::new(),
            stream: None,
            created: None,
        };
        if kind == WriteKind::Replace {
            if let Err(e) = Self::reset_target(dm, &mut state) {
                state.rollback(dm, e);
                return Err(e);
            }
        }
        Ok(Self {
            decoder,
            hint: DataType::ANY,
            state,
            finished: false,
        })
    }

    /// Clear what a Replace overwrites
    fn reset_target(dm: &mut DataModel, state: &mut WriteState) -> DmResult<()> {
        match state.uri {
            UriPath::Instance(oid, iid) => {
                state.begin(dm, oid)?;
                dm.object_mut(oid)?.instance_reset(iid)
            }
            UriPath::Resource(oid, iid, rid) => {
                let def = state.resource(dm, &state.uri)?;
                if def.kind.is_multiple() {
                    state.begin(dm, oid)?;
                    dm.object_mut(oid)?.resource_reset(iid, rid)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Instance created by a Create, once known
    pub fn created_instance(&self) -> Option<u16> {
        self.state.created
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Apply the next payload chunk
    ///
    /// Returns `true` once the last chunk was applied and committed. Any
    /// error rolls back every object touched so far.
    pub fn feed(&mut self, dm: &mut DataModel, payload: &[u8], last: bool) -> DmResult<bool> {
        if self.finished {
            return Err(DmError::InternalServerError);
        }
        let result = self.process(dm, payload, last).and_then(|done| {
            if done {
                self.finish(dm)?;
            }
            Ok(done)
        });
        match result {
            Ok(done) => Ok(done),
            Err(e) => {
                warn!("{} on {} failed: {}", self.state.kind.operation(), self.state.uri, e);
                self.state.rollback(dm, e);
                self.finished = true;
                Err(e)
            }
        }
    }

    fn process(&mut self, dm: &mut DataModel, payload: &[u8], last: bool) -> DmResult<bool> {
        self.decoder.feed_payload(payload, last)?;
        loop {
            match self.decoder.get_entry(self.hint)? {
                Next::Entry(entry) => {
                    self.hint = DataType::ANY;
                    self.state.apply(dm, &entry)?;
                }
                Next::WantTypeDisambiguation(path) => {
                    let ty = self.state.resource(dm, &path)?.data_type;
                    if ty == self.hint || !ty.is_single() {
                        return Err(DmError::BadRequest);
                    }
                    self.hint = ty;
                }
                Next::WantNextPayload if last => return Err(DmError::BadRequest),
                Next::WantNextPayload => return Ok(false),
                Next::Eof => return Ok(true),
            }
        }
    }

    fn finish(&mut self, dm: &mut DataModel) -> DmResult<()> {
        if self.state.stream.is_some() {
            return Err(DmError::BadRequest);
        }
        if self.state.kind == WriteKind::Create && self.state.created.is_none() {
            let oid = self.state.uri.oid().ok_or(DmError::InternalServerError)?;
            self.state.create_instance(dm, oid, None)?;
        }
        let result = self.state.commit(dm);
        self.finished = true;
        result
    }
}
