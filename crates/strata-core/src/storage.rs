//! Sandbox storage - writable filesystems over read-only layer chains.

use crate::error::{CoreError, Result};
use crate::layers::{LayerChain, LAYER_CHAIN_FILE};
use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use strata_host::ROOTFS_DIR;

/// Directory inside a sandbox that receives the container's writes.
pub const UPPER_DIR: &str = "upper";

/// A writable filesystem overlaying a layer chain.
///
/// A sandbox is owned by exactly one run and destroyed exactly once.
#[derive(Debug, Clone)]
pub struct Sandbox {
    path: PathBuf,
    layers: LayerChain,
}

impl Sandbox {
    /// Sandbox directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Layers the sandbox overlays, leaf first.
    pub fn layers(&self) -> &LayerChain {
        &self.layers
    }

    /// Merged root filesystem the guest sees.
    pub fn rootfs(&self) -> PathBuf {
        self.path.join(ROOTFS_DIR)
    }
}

/// Creates and destroys sandboxes.
#[async_trait]
pub trait SandboxStorage: Send + Sync {
    /// Create a sandbox at `path` over `layers`.
    ///
    /// Either fully succeeds or leaves nothing behind at `path`.
    ///
    /// # Errors
    /// Returns [`CoreError::Conflict`] if `path` already exists.
    async fn create_sandbox(&self, path: &Path, layers: &LayerChain) -> Result<Sandbox>;

    /// Remove the sandbox at `path`.
    ///
    /// Safe to call on a partially created or already removed sandbox.
    /// Failures are reported as [`CoreError::Teardown`].
    async fn destroy_sandbox(&self, path: &Path) -> Result<()>;
}

/// Sandbox storage using plain directories.
///
/// Layers are materialized by copying them root to leaf into `rootfs/`, so
/// later (leafward) layers shadow earlier ones. No privileges are needed and
/// layer content is never modified.
///
/// ```text
/// <sandbox>/
///   layerchain.json   # the chain this sandbox overlays, leaf first
///   upper/            # writable layer
///   rootfs/           # merged view the guest runs in
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectorySandboxStorage;

impl DirectorySandboxStorage {
    /// Create a new directory-backed storage.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SandboxStorage for DirectorySandboxStorage {
    async fn create_sandbox(&self, path: &Path, layers: &LayerChain) -> Result<Sandbox> {
        let start = std::time::Instant::now();
        tracing::debug!(path = %path.display(), layers = layers.len(), "Creating sandbox");

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Exclusive claim: an existing path is a conflict.
        match tokio::fs::create_dir(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(CoreError::Conflict(path.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }

        let sandbox_path = path.to_path_buf();
        let chain = layers.clone();
        let populated = tokio::task::spawn_blocking(move || populate(&sandbox_path, &chain))
            .await
            .map_err(|e| CoreError::Allocation(format!("sandbox task failed: {e}")))
            .and_then(|r| r);

        if let Err(e) = populated {
            tracing::error!(path = %path.display(), error = %e, "Sandbox creation failed");
            if let Err(cleanup) = tokio::fs::remove_dir_all(path).await {
                tracing::warn!(path = %path.display(), error = %cleanup, "Failed to remove partial sandbox");
            }
            return Err(e);
        }

        tracing::info!(
            path = %path.display(),
            layers = layers.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Sandbox created"
        );

        Ok(Sandbox {
            path: path.to_path_buf(),
            layers: layers.clone(),
        })
    }

    async fn destroy_sandbox(&self, path: &Path) -> Result<()> {
        tracing::debug!(path = %path.display(), "Destroying sandbox");
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Sandbox destroyed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::trace!(path = %path.display(), "Sandbox already gone");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to destroy sandbox");
                Err(CoreError::Teardown(format!(
                    "cannot remove sandbox {}: {e}",
                    path.display()
                )))
            }
        }
    }
}

/// Lay out a freshly claimed sandbox directory.
fn populate(path: &Path, layers: &LayerChain) -> Result<()> {
    fs::create_dir(path.join(UPPER_DIR))?;
    let rootfs = path.join(ROOTFS_DIR);
    fs::create_dir(&rootfs)?;

    let manifest: Vec<String> = layers
        .iter()
        .map(|l| l.path.to_string_lossy().into_owned())
        .collect();
    fs::write(
        path.join(LAYER_CHAIN_FILE),
        serde_json::to_vec_pretty(&manifest)?,
    )?;

    for layer in layers.root_to_leaf() {
        if !layer.path.is_dir() {
            return Err(CoreError::Allocation(format!(
                "layer {} is not a directory",
                layer.path.display()
            )));
        }
        tracing::trace!(layer_id = %layer.id, path = %layer.path.display(), "Applying layer");
        copy_recursive(&layer.path, &rootfs).map_err(|e| {
            CoreError::Allocation(format!("failed to apply layer {}: {e}", layer.path.display()))
        })?;
    }
    Ok(())
}

/// Copy `src` into `dst`, replacing whatever a lower layer put at the
/// same path. Symlinks in `dst` are replaced, never followed.
fn copy_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let ty = entry.file_type()?;
        let target = dst.join(entry.file_name());
        let path = entry.path();
        if ty.is_dir() {
            if !make_room(&target, true)? {
                fs::create_dir(&target)?;
            }
            copy_recursive(&path, &target)?;
        } else if ty.is_file() {
            make_room(&target, false)?;
            fs::copy(&path, &target)?;
        } else if ty.is_symlink() {
            #[cfg(unix)]
            {
                let link_target = fs::read_link(&path)?;
                make_room(&target, false)?;
                std::os::unix::fs::symlink(&link_target, &target)?;
            }
        }
    }
    Ok(())
}

/// Remove whatever sits at `target` unless it is a real directory and
/// `keep_dir` is set. Returns whether a directory was kept.
fn make_room(target: &Path, keep_dir: bool) -> io::Result<bool> {
    let meta = match target.symlink_metadata() {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        if keep_dir {
            return Ok(true);
        }
        fs::remove_dir_all(target)?;
    } else {
        // Files and symlinks alike; a symlink is removed, not its target
        fs::remove_file(target)?;
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(root: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = root.join(name);
        for (file, content) in files {
            let path = dir.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_create_then_destroy_leaves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let base = layer(tmp.path(), "base", &[("etc/os-release", "strata")]);
        let chain = LayerChain::from_paths([base]).unwrap();
        let path = tmp.path().join("sandboxes").join("run-1");

        let storage = DirectorySandboxStorage::new();
        let sandbox = storage.create_sandbox(&path, &chain).await.unwrap();
        assert!(sandbox.rootfs().join("etc/os-release").is_file());
        assert!(path.join(UPPER_DIR).is_dir());

        storage.destroy_sandbox(&path).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_leaf_layer_shadows_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = layer(tmp.path(), "root", &[("app.conf", "root"), ("only-root", "r")]);
        let leaf = layer(tmp.path(), "leaf", &[("app.conf", "leaf")]);
        let chain = LayerChain::from_paths([leaf, root]).unwrap();
        let path = tmp.path().join("sb");

        let sandbox = DirectorySandboxStorage
            .create_sandbox(&path, &chain)
            .await
            .unwrap();
        let conf = fs::read_to_string(sandbox.rootfs().join("app.conf")).unwrap();
        assert_eq!(conf, "leaf");
        assert!(sandbox.rootfs().join("only-root").is_file());
    }

    #[tokio::test]
    async fn test_manifest_records_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let a = layer(tmp.path(), "a", &[]);
        let b = layer(tmp.path(), "b", &[]);
        let chain = LayerChain::from_paths([a.clone(), b.clone()]).unwrap();
        let path = tmp.path().join("sb");

        DirectorySandboxStorage
            .create_sandbox(&path, &chain)
            .await
            .unwrap();
        let text = fs::read_to_string(path.join(LAYER_CHAIN_FILE)).unwrap();
        let recorded: Vec<PathBuf> = serde_json::from_str(&text).unwrap();
        assert_eq!(recorded, vec![a, b]);
    }

    #[tokio::test]
    async fn test_existing_path_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let base = layer(tmp.path(), "base", &[]);
        let chain = LayerChain::from_paths([base]).unwrap();
        let path = tmp.path().join("taken");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), "x").unwrap();

        let result = DirectorySandboxStorage.create_sandbox(&path, &chain).await;
        assert!(matches!(result, Err(CoreError::Conflict(p)) if p == path));
        // The pre-existing directory is left alone
        assert!(path.join("keep").is_file());
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_residue() {
        let tmp = tempfile::tempdir().unwrap();
        let chain = LayerChain::from_paths([tmp.path().join("missing-layer")]).unwrap();
        let path = tmp.path().join("sb");

        let result = DirectorySandboxStorage.create_sandbox(&path, &chain).await;
        assert!(matches!(result, Err(CoreError::Allocation(_))));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("never-created");
        DirectorySandboxStorage.destroy_sandbox(&path).await.unwrap();
        DirectorySandboxStorage.destroy_sandbox(&path).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_leaf_file_replaces_root_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tmp.path().join("host-file");
        fs::write(&outside, "original").unwrap();

        let root = layer(tmp.path(), "root", &[]);
        std::os::unix::fs::symlink(&outside, root.join("conf")).unwrap();
        let leaf = layer(tmp.path(), "leaf", &[("conf", "from leaf")]);
        let chain = LayerChain::from_paths([leaf, root]).unwrap();
        let path = tmp.path().join("sb");

        let sandbox = DirectorySandboxStorage
            .create_sandbox(&path, &chain)
            .await
            .unwrap();
        assert_eq!(fs::read_to_string(&outside).unwrap(), "original");
        let conf = sandbox.rootfs().join("conf");
        assert!(!conf.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(fs::read_to_string(conf).unwrap(), "from leaf");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_leaf_dir_replaces_root_symlink_to_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tmp.path().join("host-dir");
        fs::create_dir(&outside).unwrap();

        let root = layer(tmp.path(), "root", &[]);
        std::os::unix::fs::symlink(&outside, root.join("etc")).unwrap();
        let leaf = layer(tmp.path(), "leaf", &[("etc/passwd", "guest")]);
        let chain = LayerChain::from_paths([leaf, root]).unwrap();
        let path = tmp.path().join("sb");

        let sandbox = DirectorySandboxStorage
            .create_sandbox(&path, &chain)
            .await
            .unwrap();
        assert!(!outside.join("passwd").exists());
        assert_eq!(
            fs::read_to_string(sandbox.rootfs().join("etc/passwd")).unwrap(),
            "guest"
        );
    }

    #[tokio::test]
    async fn test_leaf_dir_replaces_root_file() {
        let tmp = tempfile::tempdir().unwrap();
        let root = layer(tmp.path(), "root", &[("data", "a file")]);
        let leaf = layer(tmp.path(), "leaf", &[("data/inner", "nested")]);
        let chain = LayerChain::from_paths([leaf, root]).unwrap();
        let path = tmp.path().join("sb");

        let sandbox = DirectorySandboxStorage
            .create_sandbox(&path, &chain)
            .await
            .unwrap();
        assert!(sandbox.rootfs().join("data").is_dir());
        assert_eq!(
            fs::read_to_string(sandbox.rootfs().join("data/inner")).unwrap(),
            "nested"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks_are_preserved() {
        let tmp = tempfile::tempdir().unwrap();
        let base = layer(tmp.path(), "base", &[("bin/busybox", "#!")]);
        std::os::unix::fs::symlink("busybox", base.join("bin/sh")).unwrap();
        let chain = LayerChain::from_paths([base]).unwrap();
        let path = tmp.path().join("sb");

        let sandbox = DirectorySandboxStorage
            .create_sandbox(&path, &chain)
            .await
            .unwrap();
        let link = fs::read_link(sandbox.rootfs().join("bin/sh")).unwrap();
        assert_eq!(link, PathBuf::from("busybox"));
    }
}
