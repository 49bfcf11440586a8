//! Foundation types for the skein workflow engine: output references,
//! the canonical value encoding, output documents and the composite
//! job-output store with field-routed auxiliary stores.

pub mod codec;
pub mod document;
pub mod error;
pub mod file;
pub mod memory;
pub mod reference;
pub mod store;

pub use codec::{Codec, CodecError, Encodable, CLASS_KEY};
pub use document::OutputDocument;
pub use error::{ResolveError, StoreError};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use reference::{
    find_references, rename_references, resolve_tree, ItemKey, OnMissing, OutputReference,
    Selector,
};
pub use store::{DocumentStore, JobStore, Order, Query, ResolveCache, BLOBS, OUTPUTS};
