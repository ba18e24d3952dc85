use crate::error::MimirError;
use crate::services::bundles::{
    ModificationMarker, SourceHandle, SourceKind, SourceLoader, PROPERTIES_SUFFIX,
};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Bundle files under an ordered list of root directories.
///
/// Roots are searched in order; within a root `.properties` is preferred
/// over `.xml`.
#[derive(Debug, Clone)]
pub struct FsSourceLoader {
    roots: Vec<PathBuf>,
}

impl FsSourceLoader {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Basenames of every `.properties` file directly under the roots: the
    /// file stem up to its first `_`, deduplicated, in root order and then
    /// file name order. Missing roots are skipped.
    pub async fn discover_basenames(&self) -> Result<Vec<String>, MimirError> {
        let mut basenames: Vec<String> = Vec::new();
        for root in &self.roots {
            let mut entries = match tokio::fs::read_dir(root).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!(root = %root.display(), "Bundle root does not exist, skipping discovery");
                    continue;
                }
                Err(e) => return Err(MimirError::Io(format!("{}: {}", root.display(), e))),
            };

            let mut names = Vec::new();
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_type().await?.is_file() {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            names.sort();

            for name in &names {
                if let Some(basename) = basename_of(name) {
                    if !basenames.iter().any(|known| known == basename) {
                        basenames.push(basename.to_string());
                    }
                }
            }
        }
        Ok(basenames)
    }

    fn io_error(handle: &SourceHandle, err: std::io::Error) -> MimirError {
        match err.kind() {
            ErrorKind::NotFound => MimirError::MissingSource(handle.location.clone()),
            _ => MimirError::Io(format!("{}: {}", handle.location, err)),
        }
    }

    async fn is_file(path: &Path) -> bool {
        tokio::fs::metadata(path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }
}

/// `messages_de_AT.properties` -> `messages`
fn basename_of(filename: &str) -> Option<&str> {
    let stem = filename.strip_suffix(PROPERTIES_SUFFIX)?;
    let basename = stem.split('_').next().unwrap_or(stem);
    (!basename.is_empty()).then_some(basename)
}

#[async_trait]
impl SourceLoader for FsSourceLoader {
    async fn locate(&self, filename: &str) -> Result<Option<SourceHandle>, MimirError> {
        for root in &self.roots {
            for kind in SourceKind::LOOKUP_ORDER {
                let path = root.join(format!("{}{}", filename, kind.suffix()));
                if Self::is_file(&path).await {
                    debug!(filename = %filename, path = %path.display(), "Located bundle source");
                    return Ok(Some(SourceHandle::new(path.to_string_lossy(), kind)));
                }
            }
        }
        Ok(None)
    }

    async fn last_modified(&self, handle: &SourceHandle) -> Result<Option<ModificationMarker>, MimirError> {
        let meta = tokio::fs::metadata(&handle.location)
            .await
            .map_err(|e| Self::io_error(handle, e))?;
        let marker = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|since| ModificationMarker(since.as_millis() as u64));
        Ok(marker)
    }

    async fn read(&self, handle: &SourceHandle) -> Result<Vec<u8>, MimirError> {
        tokio::fs::read(&handle.location)
            .await
            .map_err(|e| Self::io_error(handle, e))
    }
}
