//! CoAP message pieces the serialization engine needs: options and blocks

pub mod block;
pub mod options;

pub use block::{Block1Assembler, Block2Planner, BlockKind, BlockOption};
pub use options::{ETag, OptionIter, Options};
