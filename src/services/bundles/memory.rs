use crate::error::MimirError;
use crate::services::bundles::{ModificationMarker, SourceHandle, SourceKind, SourceLoader};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
struct MemorySource {
    bytes: Vec<u8>,
    revision: u64,
}

/// In-memory bundle sources keyed by full location (`messages_en.properties`).
///
/// Every write bumps a revision counter that serves as the modification
/// marker. Reads are counted per location and a failure can be queued for
/// the next read or modification check of a location.
#[derive(Debug, Default)]
pub struct MemorySourceLoader {
    sources: DashMap<String, MemorySource>,
    revision: AtomicU64,
    reads: DashMap<String, usize>,
    total_reads: AtomicUsize,
    failures: DashMap<String, String>,
    marker_failures: DashMap<String, String>,
}

impl MemorySourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a source.
    pub fn insert(&self, location: &str, content: &str) {
        self.insert_bytes(location, content.as_bytes().to_vec());
    }

    pub fn insert_bytes(&self, location: &str, bytes: Vec<u8>) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        self.sources
            .insert(location.to_string(), MemorySource { bytes, revision });
    }

    pub fn remove(&self, location: &str) {
        self.sources.remove(location);
    }

    /// Make the next read of `location` fail with an I/O error.
    pub fn fail_next_load(&self, location: &str, message: &str) {
        self.failures
            .insert(location.to_string(), message.to_string());
    }

    /// Make the next modification check of `location` fail with an I/O error.
    pub fn fail_next_marker(&self, location: &str, message: &str) {
        self.marker_failures
            .insert(location.to_string(), message.to_string());
    }

    pub fn load_count(&self, location: &str) -> usize {
        self.reads.get(location).map(|count| *count).unwrap_or(0)
    }

    pub fn total_loads(&self) -> usize {
        self.total_reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceLoader for MemorySourceLoader {
    async fn locate(&self, filename: &str) -> Result<Option<SourceHandle>, MimirError> {
        Ok(SourceKind::LOOKUP_ORDER.iter().find_map(|kind| {
            let location = format!("{}{}", filename, kind.suffix());
            self.sources
                .contains_key(&location)
                .then(|| SourceHandle::new(location, *kind))
        }))
    }

    async fn last_modified(&self, handle: &SourceHandle) -> Result<Option<ModificationMarker>, MimirError> {
        if let Some((_, message)) = self.marker_failures.remove(&handle.location) {
            return Err(MimirError::Io(format!("{}: {}", handle.location, message)));
        }

        match self.sources.get(&handle.location) {
            Some(source) => Ok(Some(ModificationMarker(source.revision))),
            None => Err(MimirError::MissingSource(handle.location.clone())),
        }
    }

    async fn read(&self, handle: &SourceHandle) -> Result<Vec<u8>, MimirError> {
        *self.reads.entry(handle.location.clone()).or_insert(0) += 1;
        self.total_reads.fetch_add(1, Ordering::SeqCst);

        if let Some((_, message)) = self.failures.remove(&handle.location) {
            return Err(MimirError::Io(format!("{}: {}", handle.location, message)));
        }

        self.sources
            .get(&handle.location)
            .map(|source| source.bytes.clone())
            .ok_or_else(|| MimirError::MissingSource(handle.location.clone()))
    }
}
