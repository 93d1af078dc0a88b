//! The on-disk OCI image layout store.
//!
//! ```text
//! <root>/oci-layout            layout marker
//! <root>/index.json            tagged content
//! <root>/blobs/<algo>/<hex>    verified content
//! <root>/staging/<algo>/<hex>  in-progress writes
//! ```

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{fs, io::AsyncReadExt, sync::RwLock};
use typed_builder::TypedBuilder;

use crate::{
    descriptor::PlatformFilter,
    digest::DigestAlgorithm,
    manifest::{media_types, LayoutMarker},
    transfer::TransferCoordinator,
    Descriptor, Digest, Index, KociError, KociResult, Manifest, Reference,
};

mod gc;
mod push;
mod remove;

use remove::RemovalMap;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The marker file identifying a directory as an OCI image layout.
pub const OCI_LAYOUT_MARKER: &str = "oci-layout";

/// The index file recording tagged content.
pub const INDEX_JSON: &str = "index.json";

const BLOBS_SUBDIR: &str = "blobs";
const STAGING_SUBDIR: &str = "staging";

const ALGORITHMS: [DigestAlgorithm; 2] = [DigestAlgorithm::Sha256, DigestAlgorithm::Sha512];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where an image layout lives and how strictly it verifies content.
#[derive(Debug, Clone, TypedBuilder)]
pub struct OciLayoutConfig {
    /// The layout root, holding the marker and the index.
    #[builder(setter(into))]
    root: PathBuf,

    /// Where finalized blobs live. Defaults to `<root>/blobs`.
    #[builder(default, setter(strip_option, into))]
    blobs_path: Option<PathBuf>,

    /// Where in-progress writes live. Defaults to `<root>/staging`. May sit on
    /// a different filesystem than the blobs.
    #[builder(default, setter(strip_option, into))]
    staging_path: Option<PathBuf>,

    /// Re-hash blobs on every existence check instead of trusting their size.
    #[builder(default)]
    strict: bool,
}

/// A content-addressable store in the OCI image layout format.
///
/// Cloning is cheap; clones share the in-memory index, the transfer
/// coordinator and the removal locks.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
    blobs_dir: PathBuf,
    staging_dir: PathBuf,
    index_path: PathBuf,
    strict: bool,
    index: Arc<RwLock<Index>>,
    coordinator: TransferCoordinator,
    removals: Arc<RemovalMap>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OciLayout {
    /// Opens the layout at the configured root, creating any missing pieces:
    /// the root directory, the `oci-layout` marker, an empty `index.json` and
    /// the blob and staging directories.
    pub async fn create(config: OciLayoutConfig) -> KociResult<Self> {
        let root = config.root;
        if fs::try_exists(&root).await? && !fs::metadata(&root).await?.is_dir() {
            return Err(KociError::InvalidLayout(format!(
                "{} exists and is not a directory",
                root.display()
            )));
        }
        fs::create_dir_all(&root).await?;

        let marker_path = root.join(OCI_LAYOUT_MARKER);
        if fs::try_exists(&marker_path).await? {
            let bytes = fs::read(&marker_path).await?;
            serde_json::from_slice::<LayoutMarker>(&bytes).map_err(|e| {
                KociError::InvalidLayout(format!("unreadable {}: {}", OCI_LAYOUT_MARKER, e))
            })?;
        } else {
            fs::write(&marker_path, serde_json::to_string(&LayoutMarker::default())?).await?;
        }

        let index_path = root.join(INDEX_JSON);
        let index = if fs::try_exists(&index_path).await? {
            let bytes = fs::read(&index_path).await?;
            serde_json::from_slice::<Index>(&bytes).map_err(|e| {
                KociError::InvalidLayout(format!("unreadable {}: {}", INDEX_JSON, e))
            })?
        } else {
            let index = Index::default();
            fs::write(&index_path, serde_json::to_string_pretty(&index)?).await?;
            index
        };

        let blobs_dir = config.blobs_path.unwrap_or_else(|| root.join(BLOBS_SUBDIR));
        let staging_dir = config
            .staging_path
            .unwrap_or_else(|| root.join(STAGING_SUBDIR));
        for algorithm in ALGORITHMS {
            fs::create_dir_all(blobs_dir.join(algorithm.as_str())).await?;
            fs::create_dir_all(staging_dir.join(algorithm.as_str())).await?;
        }

        Ok(Self {
            root,
            blobs_dir,
            staging_dir,
            index_path,
            strict: config.strict,
            index: Arc::new(RwLock::new(index)),
            coordinator: TransferCoordinator::new(),
            removals: RemovalMap::new(),
        })
    }

    /// The layout root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The transfer coordinator all writes to this store go through.
    pub fn coordinator(&self) -> &TransferCoordinator {
        &self.coordinator
    }

    /// The finalized path for a digest.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    /// The in-progress path for a digest.
    pub fn staging_path(&self, digest: &Digest) -> PathBuf {
        self.staging_dir
            .join(digest.algorithm().as_str())
            .join(digest.hex())
    }

    /// Returns whether the store holds the described blob.
    ///
    /// A present file whose size disagrees with the descriptor is an error, as
    /// is a hash mismatch when the store is in strict mode.
    pub async fn exists(&self, descriptor: &Descriptor) -> KociResult<bool> {
        let path = self.blob_path(descriptor.digest());
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if metadata.len() != *descriptor.size() {
            return Err(KociError::SizeMismatch {
                expected: *descriptor.size(),
                actual: metadata.len(),
            });
        }

        if self.strict {
            let actual = hash_file(&path, descriptor.digest().algorithm()).await?;
            if actual != *descriptor.digest() {
                return Err(KociError::DigestMismatch {
                    expected: descriptor.digest().to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        Ok(true)
    }

    /// Returns how many bytes of the described blob are already staged, which
    /// is the offset a resumed transfer should continue from.
    pub async fn resume_offset(&self, descriptor: &Descriptor) -> KociResult<u64> {
        match fs::metadata(self.staging_path(descriptor.digest())).await {
            Ok(metadata) => Ok(metadata.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops any staged bytes for the described blob.
    pub async fn discard_staging(&self, descriptor: &Descriptor) -> KociResult<()> {
        match fs::remove_file(self.staging_path(descriptor.digest())).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The descriptors currently registered in the index.
    pub async fn catalog(&self) -> Vec<Descriptor> {
        self.index.read().await.manifests().clone()
    }

    /// Registers `descriptor` in the index under `reference`, untagging any
    /// prior holder of the same reference and platform. Repeated calls with
    /// the same arguments leave a single entry.
    pub async fn tag(&self, descriptor: &Descriptor, reference: &Reference) -> KociResult<Descriptor> {
        let media_type = descriptor.media_type().as_str();
        if media_type != media_types::MANIFEST && media_type != media_types::INDEX {
            return Err(KociError::UnsupportedManifest {
                media_type: media_type.to_string(),
                context: "tag".to_string(),
            });
        }
        if *descriptor.size() == 0 {
            return Err(KociError::custom(anyhow::anyhow!(
                "refusing to tag a zero-sized descriptor"
            )));
        }

        let name = reference.to_string();
        let tagged = descriptor.with_ref_name(&name);

        let mut index = self.index.write().await;
        let mut manifests = Vec::with_capacity(index.manifests().len() + 1);
        for entry in index.manifests() {
            let holds_reference =
                entry.ref_name() == Some(name.as_str()) && entry.platform() == descriptor.platform();
            if holds_reference {
                if entry.digest() == descriptor.digest() {
                    // Replaced wholesale below; dropping it is what makes
                    // repeated tagging idempotent.
                    continue;
                }
                manifests.push(entry.without_ref_name());
            } else {
                manifests.push(entry.clone());
            }
        }
        index.set_manifests(manifests);
        index.push_manifest(tagged.clone());
        self.sync_index(&index).await?;

        tracing::debug!(reference = %name, digest = %descriptor.digest(), "tagged");
        Ok(tagged)
    }

    /// Finds the index entry tagged with `reference`. When the entry carries a
    /// platform and a filter is supplied, the platform must satisfy it.
    pub async fn resolve(
        &self,
        reference: &Reference,
        platform_filter: Option<&PlatformFilter>,
    ) -> KociResult<Descriptor> {
        let name = reference.to_string();
        self.resolve_where(|entry| {
            entry.ref_name() == Some(name.as_str())
                && match (entry.platform().as_ref(), platform_filter) {
                    (Some(platform), Some(filter)) => filter(platform),
                    _ => true,
                }
        })
        .await
        .ok_or(KociError::DescriptorNotFound(name))
    }

    /// Finds the first index entry satisfying `predicate`.
    pub async fn resolve_where(&self, predicate: impl Fn(&Descriptor) -> bool) -> Option<Descriptor> {
        self.index
            .read()
            .await
            .manifests()
            .iter()
            .find(|entry| predicate(entry))
            .cloned()
    }

    /// Reads a stored manifest document back out of the blob store.
    pub async fn load_manifest(&self, descriptor: &Descriptor) -> KociResult<Manifest> {
        let bytes = self.read_blob(descriptor).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Reads a stored index document back out of the blob store.
    pub async fn load_index(&self, descriptor: &Descriptor) -> KociResult<Index> {
        let bytes = self.read_blob(descriptor).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn read_blob(&self, descriptor: &Descriptor) -> KociResult<Vec<u8>> {
        match fs::read(self.blob_path(descriptor.digest())).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(KociError::BlobNotFound(descriptor.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the index to disk. Callers hold the index write lock.
    pub(crate) async fn sync_index(&self, index: &Index) -> KociResult<()> {
        fs::write(&self.index_path, serde_json::to_string_pretty(index)?).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Streams a file through a hasher for the given algorithm.
pub(crate) async fn hash_file(path: &Path, algorithm: DigestAlgorithm) -> KociResult<Digest> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = algorithm.hasher();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn scratch_layout() -> (tempfile::TempDir, OciLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(OciLayoutConfig::builder().root(dir.path()).build())
            .await
            .unwrap();
        (dir, layout)
    }

    #[tokio::test]
    async fn test_layout_create_bootstraps_directories() {
        let (dir, _layout) = scratch_layout().await;

        let marker = std::fs::read_to_string(dir.path().join(OCI_LAYOUT_MARKER)).unwrap();
        assert_eq!(marker, r#"{"imageLayoutVersion":"1.0.0"}"#);
        assert!(dir.path().join(INDEX_JSON).exists());
        assert!(dir.path().join("blobs/sha256").is_dir());
        assert!(dir.path().join("blobs/sha512").is_dir());
        assert!(dir.path().join("staging/sha256").is_dir());
    }

    #[tokio::test]
    async fn test_layout_create_rejects_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();

        let err = OciLayout::create(OciLayoutConfig::builder().root(file).build())
            .await
            .unwrap_err();
        assert!(matches!(err, KociError::InvalidLayout(_)));
    }

    #[tokio::test]
    async fn test_layout_create_reloads_existing_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = OciLayoutConfig::builder().root(dir.path()).build();
        let layout = OciLayout::create(config.clone()).await.unwrap();

        let descriptor = Descriptor::from_bytes(media_types::MANIFEST, b"{}");
        let reference = "ghcr.io/a/b:v1".parse::<Reference>().unwrap();
        layout.tag(&descriptor, &reference).await.unwrap();

        let reopened = OciLayout::create(config).await.unwrap();
        assert_eq!(reopened.catalog().await.len(), 1);
    }

    #[tokio::test]
    async fn test_layout_exists_checks_size() {
        let (_dir, layout) = scratch_layout().await;
        let descriptor = Descriptor::from_bytes("application/octet-stream", b"content");

        assert!(!layout.exists(&descriptor).await.unwrap());

        let path = layout.blob_path(descriptor.digest());
        tokio::fs::write(&path, b"content").await.unwrap();
        assert!(layout.exists(&descriptor).await.unwrap());

        tokio::fs::write(&path, b"content, but longer").await.unwrap();
        let err = layout.exists(&descriptor).await.unwrap_err();
        assert!(matches!(err, KociError::SizeMismatch { .. }));
    }

    #[tokio::test]
    async fn test_layout_strict_exists_checks_hash() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OciLayout::create(
            OciLayoutConfig::builder().root(dir.path()).strict(true).build(),
        )
        .await
        .unwrap();

        let descriptor = Descriptor::from_bytes("application/octet-stream", b"content");
        let path = layout.blob_path(descriptor.digest());
        // Same length, different bytes.
        tokio::fs::write(&path, b"tnetnoc").await.unwrap();

        let err = layout.exists(&descriptor).await.unwrap_err();
        assert!(matches!(err, KociError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn test_layout_tag_untags_prior_holder() {
        let (_dir, layout) = scratch_layout().await;
        let reference = "ghcr.io/a/b:v1".parse::<Reference>().unwrap();

        let old = Descriptor::from_bytes(media_types::MANIFEST, b"{\"old\":1}");
        let new = Descriptor::from_bytes(media_types::MANIFEST, b"{\"new\":1}");

        layout.tag(&old, &reference).await.unwrap();
        layout.tag(&new, &reference).await.unwrap();

        let catalog = layout.catalog().await;
        assert_eq!(catalog.len(), 2);
        let holders: Vec<_> = catalog.iter().filter(|d| d.ref_name().is_some()).collect();
        assert_eq!(holders.len(), 1);
        assert_eq!(holders[0].digest(), new.digest());
    }

    #[tokio::test]
    async fn test_layout_tag_is_idempotent() {
        let (_dir, layout) = scratch_layout().await;
        let reference = "ghcr.io/a/b:v1".parse::<Reference>().unwrap();
        let descriptor = Descriptor::from_bytes(media_types::MANIFEST, b"{}");

        layout.tag(&descriptor, &reference).await.unwrap();
        layout.tag(&descriptor, &reference).await.unwrap();

        assert_eq!(layout.catalog().await.len(), 1);
    }

    #[tokio::test]
    async fn test_layout_tag_rejects_blobs() {
        let (_dir, layout) = scratch_layout().await;
        let reference = "ghcr.io/a/b:v1".parse::<Reference>().unwrap();
        let descriptor = Descriptor::from_bytes("application/octet-stream", b"blob");

        let err = layout.tag(&descriptor, &reference).await.unwrap_err();
        assert!(matches!(err, KociError::UnsupportedManifest { .. }));
    }

    fn for_platform(descriptor: Descriptor, architecture: &str) -> Descriptor {
        use crate::Platform;

        Descriptor::builder()
            .media_type(descriptor.media_type().clone())
            .digest(descriptor.digest().clone())
            .size(*descriptor.size())
            .platform(
                Platform::builder()
                    .architecture(architecture)
                    .os("linux")
                    .build(),
            )
            .build()
    }

    #[tokio::test]
    async fn test_layout_resolve_honors_platform_filter() {
        let (_dir, layout) = scratch_layout().await;
        let reference = "ghcr.io/a/b:v1".parse::<Reference>().unwrap();

        let amd = for_platform(
            Descriptor::from_bytes(media_types::MANIFEST, b"{\"p\":\"amd\"}"),
            "amd64",
        );
        let arm = for_platform(
            Descriptor::from_bytes(media_types::MANIFEST, b"{\"p\":\"arm\"}"),
            "arm64",
        );

        layout.tag(&amd, &reference).await.unwrap();
        layout.tag(&arm, &reference).await.unwrap();

        let wants_arm: Box<PlatformFilter> = Box::new(|p| p.architecture() == "arm64");
        let resolved = layout
            .resolve(&reference, Some(wants_arm.as_ref()))
            .await
            .unwrap();
        assert_eq!(resolved.digest(), arm.digest());

        let missing = "ghcr.io/a/b:v2".parse::<Reference>().unwrap();
        let err = layout.resolve(&missing, None).await.unwrap_err();
        assert!(matches!(err, KociError::DescriptorNotFound(_)));
    }
}
