//! rust-lwm2m - LwM2M client data model and CoAP payload serialization
//!
//! This library turns the objects an LwM2M client exposes into CoAP payloads
//! and back: SenML-CBOR, LwM2M-CBOR, plain CBOR, OMA-TLV, plain text, opaque
//! and CoRE link-format. Payloads are produced and consumed in pieces, so a
//! response larger than one message travels block-wise without ever being
//! held whole in memory.
//!
//! # Example
//!
//! ```no_run
//! use rust_lwm2m::coap_types::ContentFormat;
//! use rust_lwm2m::{DataModel, UriPath};
//! # fn device() -> Box<dyn rust_lwm2m::dm::Object> { unimplemented!() }
//!
//! let mut dm = DataModel::new();
//! dm.register(device()).unwrap();
//!
//! // Read the whole Device object as SenML-CBOR
//! let mut read = dm
//!     .read(UriPath::Object(3), Some(ContentFormat::SenmlCbor.as_u16()))
//!     .unwrap();
//! let payload = read.read_to_end(&mut dm).unwrap();
//!
//! // Announce the objects in a Register message
//! let links = dm.register_prepare().unwrap().read_to_end().unwrap();
//! ```

pub mod coap;
pub mod coap_types;
pub mod config;
pub mod dm;
mod error;
pub mod io;
pub mod uri;

pub use coap_types::{ContentFormat, Operation, ResponseCode};
pub use config::Config;
pub use dm::{DataModel, LinkOperation, ReadOperation, WriteKind, WriteOperation};
pub use error::{DmError, DmResult, Error, Result};
pub use uri::{ObjLink, UriPath};
