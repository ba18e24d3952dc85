use crate::cache::SelfRefreshing;
use crate::error::MimirError;
use crate::messages::content::BundleContent;
use crate::messages::loader::BundleLoader;
use crate::services::bundles::{ModificationMarker, SourceHandle};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

struct HolderState {
    content: Arc<BundleContent>,
    handle: Option<SourceHandle>,
    marker: Option<ModificationMarker>,
}

/// Parsed content of one locale-qualified bundle file.
///
/// Revalidation is cheap: the source is re-located (when locations are not
/// cached forever) and its modification marker compared with the one seen at
/// the last parse. Only a different handle or marker causes a reparse. A
/// source that disappeared leaves the holder empty.
pub struct PropertiesHolder {
    filename: String,
    bundles: Arc<BundleLoader>,
    state: ArcSwap<HolderState>,
}

impl PropertiesHolder {
    /// Build and populate a holder. `handle` is where the candidate list
    /// found the file.
    pub async fn load(
        filename: String,
        handle: Option<SourceHandle>,
        bundles: Arc<BundleLoader>,
    ) -> Result<Self, MimirError> {
        let state = HolderState {
            content: Arc::new(BundleContent::empty(bundles.metrics().clone())),
            handle,
            marker: None,
        };
        let holder = Self {
            filename,
            bundles,
            state: ArcSwap::from_pointee(state),
        };
        holder.update(true).await?;
        Ok(holder)
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The content as of the last successful refresh.
    pub fn content(&self) -> Arc<BundleContent> {
        self.state.load().content.clone()
    }

    pub fn handle(&self) -> Option<SourceHandle> {
        self.state.load().handle.clone()
    }

    pub fn marker(&self) -> Option<ModificationMarker> {
        self.state.load().marker
    }

    async fn update(&self, initial: bool) -> Result<bool, MimirError> {
        let current = self.state.load_full();

        let handle = if !initial && !self.bundles.cache_ttl().is_forever() {
            self.bundles.locate(&self.filename).await?
        } else {
            current.handle.clone()
        };

        match self.reload(&current, handle, initial).await {
            Err(MimirError::MissingSource(location)) => {
                // The cached location is stale; ask the loader directly
                debug!(filename = %self.filename, location = %location, "Bundle source vanished, locating again");
                let handle = self.bundles.relocate(&self.filename).await?;
                match self.reload(&current, handle, initial).await {
                    Err(MimirError::MissingSource(_)) => Ok(self.clear(&current)),
                    other => other,
                }
            }
            other => other,
        }
    }

    async fn reload(
        &self,
        current: &HolderState,
        handle: Option<SourceHandle>,
        initial: bool,
    ) -> Result<bool, MimirError> {
        let Some(handle) = handle else {
            return Ok(self.clear(current));
        };

        let marker = self.bundles.last_modified(&handle).await?;
        if !initial
            && !self.bundles.file_cache_ttl().is_forever()
            && current.handle.as_ref() == Some(&handle)
            && current.marker == marker
        {
            return Ok(false);
        }

        let properties = self.bundles.load(&self.filename, &handle).await?;
        self.state.store(Arc::new(HolderState {
            content: Arc::new(BundleContent::new(properties, self.bundles.metrics().clone())),
            handle: Some(handle),
            marker,
        }));
        Ok(true)
    }

    /// Switch to the empty state. Returns whether anything was dropped.
    fn clear(&self, current: &HolderState) -> bool {
        if current.handle.is_none() {
            return false;
        }
        debug!(filename = %self.filename, "No bundle source found, holding empty content");
        self.state.store(Arc::new(HolderState {
            content: Arc::new(BundleContent::empty(self.bundles.metrics().clone())),
            handle: None,
            marker: None,
        }));
        true
    }
}

#[async_trait]
impl SelfRefreshing for PropertiesHolder {
    async fn refresh(&self) -> Result<bool, MimirError> {
        self.update(false).await
    }
}

impl std::fmt::Debug for PropertiesHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load();
        f.debug_struct("PropertiesHolder")
            .field("filename", &self.filename)
            .field("handle", &state.handle)
            .field("marker", &state.marker)
            .field("entries", &state.content.len())
            .finish()
    }
}
