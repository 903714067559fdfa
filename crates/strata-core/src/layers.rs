//! Layer chain resolution.
//!
//! An image's storage directory holds a `layerchain.json` descriptor: a flat
//! JSON array of layer paths ordered leaf first, root last. The resolver
//! turns that descriptor into a [`LayerChain`] of freshly minted
//! [`LayerRef`]s.

use crate::config::LayerSelection;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strata_host::LayerRef;

/// File name of the layer chain descriptor inside an image storage directory.
pub const LAYER_CHAIN_FILE: &str = "layerchain.json";

/// A non-empty, ordered list of layers: leaf first, root last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerChain(Vec<LayerRef>);

impl LayerChain {
    /// Create a chain from already minted layers.
    ///
    /// # Errors
    /// Returns [`CoreError::Resolution`] if `layers` is empty.
    pub fn new(layers: Vec<LayerRef>) -> Result<Self> {
        if layers.is_empty() {
            return Err(CoreError::Resolution("no usable layer".into()));
        }
        Ok(Self(layers))
    }

    /// Mint a fresh [`LayerRef`] for each path, keeping order.
    pub fn from_paths<I, P>(paths: I) -> Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self::new(paths.into_iter().map(LayerRef::new).collect())
    }

    /// Number of layers (always at least one).
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The top-most layer, the one the sandbox writes over.
    pub fn leaf(&self) -> &LayerRef {
        &self.0[0]
    }

    /// The bottom-most layer every other layer builds on.
    pub fn root(&self) -> &LayerRef {
        &self.0[self.0.len() - 1]
    }

    /// Layers in chain order, leaf first.
    pub fn iter(&self) -> std::slice::Iter<'_, LayerRef> {
        self.0.iter()
    }

    /// Layers in the order they must be applied to build a filesystem.
    pub fn root_to_leaf(&self) -> impl Iterator<Item = &LayerRef> {
        self.0.iter().rev()
    }

    /// Narrow the chain according to `selection`.
    pub fn select(&self, selection: LayerSelection) -> LayerChain {
        match selection {
            LayerSelection::Full => self.clone(),
            LayerSelection::Base => Self(vec![self.root().clone()]),
        }
    }

    /// Borrow the layers as a slice.
    pub fn as_slice(&self) -> &[LayerRef] {
        &self.0
    }

    /// Consume the chain into its layers.
    pub fn into_vec(self) -> Vec<LayerRef> {
        self.0
    }
}

impl<'a> IntoIterator for &'a LayerChain {
    type Item = &'a LayerRef;
    type IntoIter = std::slice::Iter<'a, LayerRef>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Metadata returned by an image inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Directory holding the image's layer chain descriptor.
    pub storage_dir: PathBuf,
}

/// Source of image metadata.
#[async_trait]
pub trait ImageInspector: Send + Sync {
    /// Look up an image by identifier.
    ///
    /// # Errors
    /// Returns [`CoreError::Resolution`] if the image is unknown.
    async fn inspect(&self, image: &str) -> Result<ImageInfo>;
}

/// Images laid out on disk as `<root>/<sanitized image identifier>/`.
#[derive(Debug, Clone)]
pub struct DirectoryImageStore {
    root: PathBuf,
}

impl DirectoryImageStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory an image would live in.
    pub fn image_dir(&self, image: &str) -> Result<PathBuf> {
        Ok(self.root.join(sanitize_image_name(image)?))
    }
}

#[async_trait]
impl ImageInspector for DirectoryImageStore {
    async fn inspect(&self, image: &str) -> Result<ImageInfo> {
        let storage_dir = self.image_dir(image)?;
        tracing::debug!(%image, dir = %storage_dir.display(), "Inspecting image");

        let is_dir = tokio::fs::metadata(&storage_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(CoreError::Resolution(format!("unknown image: {image}")));
        }

        Ok(ImageInfo { storage_dir })
    }
}

/// Map an image identifier such as `registry/app:1.0` to a directory name.
///
/// # Errors
/// Returns [`CoreError::Resolution`] for identifiers that cannot name a
/// directory (empty, `.` or `..`).
pub fn sanitize_image_name(image: &str) -> Result<String> {
    let name: String = image
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '@' => '_',
            c => c,
        })
        .collect();

    if name.is_empty() || name == "." || name == ".." {
        return Err(CoreError::Resolution(format!(
            "invalid image identifier: {image:?}"
        )));
    }
    Ok(name)
}

/// Parse a layer chain descriptor. The only accepted shape is a flat array
/// of non-empty strings.
pub fn parse_layer_chain(text: &str) -> Result<Vec<String>> {
    let paths: Vec<String> = serde_json::from_str(text)
        .map_err(|e| CoreError::Resolution(format!("malformed layer chain: {e}")))?;

    if let Some(index) = paths.iter().position(|p| p.trim().is_empty()) {
        return Err(CoreError::Resolution(format!(
            "malformed layer chain: empty path at index {index}"
        )));
    }
    Ok(paths)
}

/// Resolves image identifiers into layer chains.
#[derive(Clone)]
pub struct LayerResolver {
    inspector: Arc<dyn ImageInspector>,
}

impl LayerResolver {
    /// Create a resolver backed by `inspector`.
    pub fn new(inspector: Arc<dyn ImageInspector>) -> Self {
        Self { inspector }
    }

    /// Resolve an image into its layer chain.
    ///
    /// Relative descriptor entries are taken relative to the image storage
    /// directory; absolute entries are used as-is.
    pub async fn resolve(&self, image: &str) -> Result<LayerChain> {
        let info = self.inspector.inspect(image).await?;
        let descriptor = info.storage_dir.join(LAYER_CHAIN_FILE);
        tracing::debug!(%image, descriptor = %descriptor.display(), "Reading layer chain");

        let text = tokio::fs::read_to_string(&descriptor).await.map_err(|e| {
            CoreError::Resolution(format!("cannot read {}: {e}", descriptor.display()))
        })?;

        let paths = parse_layer_chain(&text)?;
        let chain = LayerChain::from_paths(paths.iter().map(|p| info.storage_dir.join(p)))?;

        tracing::info!(
            %image,
            layers = chain.len(),
            root = %chain.root().path.display(),
            "Layer chain resolved"
        );
        Ok(chain)
    }
}
