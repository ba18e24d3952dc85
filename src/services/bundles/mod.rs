//! Bundle sources: where message files live and how they are read.
//!
//! The message source never touches storage directly. It asks a
//! [`SourceLoader`] to locate a locale-qualified filename, to report a
//! modification marker for it and to load its key/value pairs.

pub mod filesystem;
pub mod memory;
pub mod parser;

pub use filesystem::FsSourceLoader;
pub use memory::MemorySourceLoader;
pub use parser::Encoding;

use crate::error::MimirError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;

pub const PROPERTIES_SUFFIX: &str = ".properties";
pub const XML_SUFFIX: &str = ".xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Properties,
    Xml,
}

impl SourceKind {
    /// Lookup order for a filename: plain properties win over XML.
    pub const LOOKUP_ORDER: [SourceKind; 2] = [SourceKind::Properties, SourceKind::Xml];

    pub fn suffix(&self) -> &'static str {
        match self {
            SourceKind::Properties => PROPERTIES_SUFFIX,
            SourceKind::Xml => XML_SUFFIX,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Properties => "properties",
            SourceKind::Xml => "xml",
        }
    }
}

/// A located source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceHandle {
    pub location: String,
    pub kind: SourceKind,
}

impl SourceHandle {
    pub fn new(location: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            location: location.into(),
            kind,
        }
    }
}

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location)
    }
}

/// Opaque, comparable "has this source changed" value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModificationMarker(pub u64);

#[async_trait]
pub trait SourceLoader: Send + Sync + fmt::Debug {
    /// Find `<filename>.properties`, else `<filename>.xml`. Absent is `Ok(None)`.
    async fn locate(&self, filename: &str) -> Result<Option<SourceHandle>, MimirError>;

    /// Current marker; `None` when the source cannot report one.
    /// [`MimirError::MissingSource`] when the handle no longer exists.
    async fn last_modified(&self, handle: &SourceHandle) -> Result<Option<ModificationMarker>, MimirError>;

    /// Raw bytes of the source. [`MimirError::MissingSource`] when the
    /// handle no longer exists.
    async fn read(&self, handle: &SourceHandle) -> Result<Vec<u8>, MimirError>;

    /// Read and parse into key/value pairs.
    async fn load(
        &self,
        handle: &SourceHandle,
        encoding: Encoding,
    ) -> Result<HashMap<String, String>, MimirError> {
        let bytes = self.read(handle).await?;
        parser::parse(handle.kind, &bytes, encoding, &handle.location)
    }
}
