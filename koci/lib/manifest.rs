//! The OCI content data model: manifests, indexes and layout metadata.

use std::collections::HashMap;

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{Descriptor, KociResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Media types defined by the OCI image specification.
pub mod media_types {
    /// An image manifest.
    pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

    /// A multi-platform image index.
    pub const INDEX: &str = "application/vnd.oci.image.index.v1+json";

    /// An image configuration blob.
    pub const CONFIG: &str = "application/vnd.oci.image.config.v1+json";

    /// A gzip-compressed layer blob.
    pub const LAYER: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
}

/// The layout marker version written by this implementation.
pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An image manifest: a config blob plus an ordered sequence of layer blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// The manifest schema version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default = Some(2), setter(strip_option))]
    schema_version: Option<u32>,

    /// The media type of this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default = Some(media_types::MANIFEST.to_string()), setter(strip_option, into))]
    media_type: Option<String>,

    /// The configuration blob for this image.
    config: Descriptor,

    /// The ordered layer blobs for this image.
    #[builder(default)]
    layers: Vec<Descriptor>,

    /// Arbitrary string metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    annotations: Option<HashMap<String, String>>,
}

/// A multi-platform index: an ordered sequence of manifest descriptors, each
/// optionally carrying the platform it targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, TypedBuilder)]
#[getset(get = "pub")]
#[serde(rename_all = "camelCase")]
pub struct Index {
    /// The index schema version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default = Some(2), setter(strip_option))]
    schema_version: Option<u32>,

    /// The media type of this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default = Some(media_types::INDEX.to_string()), setter(strip_option, into))]
    media_type: Option<String>,

    /// The manifests this index lists.
    #[builder(default)]
    manifests: Vec<Descriptor>,

    /// Arbitrary string metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    annotations: Option<HashMap<String, String>>,
}

/// The tag listing returned by `/v2/<repository>/tags/list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub")]
pub struct TagList {
    /// The repository the tags belong to.
    name: String,

    /// The tags, in registry order.
    tags: Vec<String>,
}

/// The marker file persisted as `oci-layout` at the root of an image layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub")]
pub struct LayoutMarker {
    /// The image layout version the directory conforms to.
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// Serialized manifest content that can be tagged and pushed to a registry.
pub trait ManifestContent {
    /// The media type recorded in the document, if any.
    fn content_media_type(&self) -> Option<&str>;

    /// The media type to fall back to when the document does not record one.
    fn default_media_type() -> &'static str;

    /// The serialized JSON body.
    fn to_json_bytes(&self) -> KociResult<Vec<u8>>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Index {
    /// Replaces the manifests listed by this index.
    pub(crate) fn set_manifests(&mut self, manifests: Vec<Descriptor>) {
        self.manifests = manifests;
    }

    /// Appends a manifest descriptor to this index.
    pub(crate) fn push_manifest(&mut self, descriptor: Descriptor) {
        self.manifests.push(descriptor);
    }
}

impl TagList {
    /// Creates a tag listing.
    pub fn new(name: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            name: name.into(),
            tags,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for Index {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for LayoutMarker {
    fn default() -> Self {
        Self {
            image_layout_version: IMAGE_LAYOUT_VERSION.to_string(),
        }
    }
}

impl ManifestContent for Manifest {
    fn content_media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    fn default_media_type() -> &'static str {
        media_types::MANIFEST
    }

    fn to_json_bytes(&self) -> KociResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl ManifestContent for Index {
    fn content_media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    fn default_media_type() -> &'static str {
        media_types::INDEX
    }

    fn to_json_bytes(&self) -> KociResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
