//! `koci` is an async client for OCI-compliant registries paired with a local
//! store in the OCI image layout format.
//!
//! # Overview
//!
//! The crate is built from three cooperating subsystems:
//!
//! - **Layout store** ([`OciLayout`]): a content-addressable directory of
//!   verified blobs with atomic finalization, resumable writes, tagging and
//!   reference-graph garbage collection.
//! - **Transfer coordinator** ([`TransferCoordinator`]): single-flight
//!   deduplication of concurrent transfers of the same content.
//! - **Protocol engine** ([`Registry`] / [`Repository`]): manifest and blob
//!   retrieval, recursive multi-platform pulls with bounded parallelism,
//!   resumable chunked uploads, cross-repository mounts, and token-based
//!   authentication with scope accumulation.
//!
//! # Usage Example
//!
//! ```no_run
//! use koci::{OciLayout, OciLayoutConfig, Registry, RegistryConfig};
//! use futures::StreamExt;
//!
//! # async fn run() -> koci::KociResult<()> {
//! let registry = Registry::connect(
//!     RegistryConfig::builder().registry("ghcr.io").build(),
//! )?;
//! let store = OciLayout::create(
//!     OciLayoutConfig::builder().root("/var/lib/koci").build(),
//! )
//! .await?;
//!
//! let repo = registry.repo("defenseunicorns/koci")?;
//! let mut progress = repo.pull("v1.0.0", &store, None);
//! while let Some(update) = progress.next().await {
//!     println!("{}%", update?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`auth`] - Challenge parsing, token acquisition and the 401 middleware
//! - [`layout`] - The on-disk OCI image layout store
//! - [`repository`] - The per-repository protocol engine
//! - [`registry`] - The registry facade: ping, catalog, repository handles
//! - [`scope`] - Authorization scope construction and normalization

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod auth;
pub mod descriptor;
pub mod digest;
pub mod layout;
pub mod manifest;
pub mod progress;
pub mod reference;
pub mod registry;
pub mod repository;
pub mod router;
pub mod scope;
pub mod transfer;

pub use descriptor::{Descriptor, Platform, PlatformFilter, ANNOTATION_REF_NAME};
pub use digest::{Digest, DigestAlgorithm, DigestHasher};
pub use error::*;
pub use layout::{OciLayout, OciLayoutConfig};
pub use manifest::{media_types, Index, LayoutMarker, Manifest, ManifestContent, TagList};
pub use progress::{ByteStream, ProgressStream};
pub use reference::Reference;
pub use registry::{Registry, RegistryConfig};
pub use repository::{Repository, UploadStatus};
pub use router::Router;
pub use transfer::{TransferCoordinator, TransferDirection};
