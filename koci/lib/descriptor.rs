//! Content descriptors and platform selectors.

use std::collections::HashMap;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{digest::DigestAlgorithm, Digest, KociResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The reserved annotation key carrying the local tag of an index entry.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// A predicate over platforms, used to select among the entries of an index.
pub type PlatformFilter = dyn Fn(&Platform) -> bool + Send + Sync;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A typed, sized, content-addressed reference to a blob. The unit of reference
/// throughout the store and the registry client.
///
/// Equality is structural on all fields, so annotating a descriptor (tagging)
/// produces a distinct value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The media type of the referenced content.
    #[builder(setter(into))]
    media_type: String,

    /// The content hash of the referenced blob.
    digest: Digest,

    /// The size of the referenced blob in bytes.
    size: u64,

    /// Alternative fetch locations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    urls: Option<Vec<String>>,

    /// Arbitrary string metadata attached to this reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    annotations: Option<HashMap<String, String>>,

    /// An inline copy of the referenced content, base64-encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    data: Option<String>,

    /// The platform the referenced manifest targets, for index entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    platform: Option<Platform>,
}

/// The platform a manifest targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// The CPU architecture, using GOARCH-style names.
    #[builder(setter(into))]
    architecture: String,

    /// The operating system, using GOOS-style names.
    #[builder(setter(into))]
    os: String,

    /// The operating system version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    os_version: Option<String>,

    /// Required operating system features.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    os_features: Option<Vec<String>>,

    /// The architecture variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    variant: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Descriptor {
    /// Creates a descriptor from its three required components.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: None,
            data: None,
            platform: None,
        }
    }

    /// Computes a descriptor over in-memory content using SHA-256.
    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        let mut hasher = DigestAlgorithm::Sha256.hasher();
        hasher.update(bytes);
        Self::new(media_type, hasher.finalize(), bytes.len() as u64)
    }

    /// Computes a descriptor over streamed content using SHA-256, hashing and
    /// counting chunks without buffering the whole body.
    pub async fn from_byte_stream(
        media_type: impl Into<String>,
        mut stream: impl Stream<Item = KociResult<Bytes>> + Unpin,
    ) -> KociResult<Self> {
        let mut hasher = DigestAlgorithm::Sha256.hasher();
        let mut size = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
        }
        Ok(Self::new(media_type, hasher.finalize(), size))
    }

    /// Returns the local tag recorded on this descriptor, if any.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_REF_NAME))
            .map(String::as_str)
    }

    /// Returns a copy of this descriptor carrying `name` as its local tag.
    pub fn with_ref_name(&self, name: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.annotations
            .get_or_insert_with(HashMap::new)
            .insert(ANNOTATION_REF_NAME.to_string(), name.into());
        copy
    }

    /// Returns a copy of this descriptor with its local tag stripped.
    pub fn without_ref_name(&self) -> Self {
        let mut copy = self.clone();
        if let Some(annotations) = copy.annotations.as_mut() {
            annotations.remove(ANNOTATION_REF_NAME);
            if annotations.is_empty() {
                copy.annotations = None;
            }
        }
        copy
    }
}

impl Platform {
    /// Describes the platform of the current process, using OCI names.
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        let os = match std::env::consts::OS {
            "macos" => "darwin",
            other => other,
        };
        Self::builder().architecture(architecture).os(os).build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
