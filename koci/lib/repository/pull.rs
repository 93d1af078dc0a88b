use std::sync::Arc;

use async_stream::try_stream;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::{header, Method};

use crate::{
    descriptor::PlatformFilter,
    error::error_from_response,
    manifest::media_types,
    progress::{percent, ProgressStream},
    scope,
    transfer::{TransferClaim, TransferDirection},
    Descriptor, KociError, KociResult, OciLayout, Reference,
};

use super::Repository;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How many layers of one manifest may be in flight at once.
const MAX_CONCURRENT_LAYER_PULLS: usize = 3;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Repository {
    /// Pulls the content a tag names into `store` and records the tag there.
    ///
    /// The returned stream emits monotonically non-decreasing whole percents
    /// and ends with `100` on success; failures arrive in-band as the
    /// terminal item.
    pub fn pull(
        &self,
        tag: &str,
        store: &OciLayout,
        platform_filter: Option<Arc<PlatformFilter>>,
    ) -> ProgressStream {
        let this = self.clone();
        let store = store.clone();
        let tag = tag.to_string();
        Box::pin(try_stream! {
            let descriptor = this.resolve(&tag, platform_filter.as_deref()).await?;

            let mut last = 0;
            let mut inner = this.pull_descriptor(&descriptor, &store);
            while let Some(progress) = inner.next().await {
                let progress = progress?;
                last = progress;
                yield progress;
            }

            let reference =
                Reference::new(this.router.registry().clone(), this.name.clone(), &tag)?;
            store.tag(&descriptor, &reference).await?;
            tracing::info!(reference = %reference, digest = %descriptor.digest(), "pulled");

            if last != 100 {
                yield 100;
            }
        })
    }

    /// Pulls the described content into `store`, recursing through indexes
    /// and manifests. Already-stored content completes immediately at `100`.
    pub fn pull_descriptor(&self, descriptor: &Descriptor, store: &OciLayout) -> ProgressStream {
        let this = self.clone();
        let descriptor = descriptor.clone();
        let store = store.clone();
        Box::pin(try_stream! {
            if matches!(store.exists(&descriptor).await, Ok(true)) {
                yield 100;
            } else {
                let mut inner = match descriptor.media_type().as_str() {
                    media_types::INDEX => this.pull_index_content(&descriptor, &store),
                    media_types::MANIFEST => this.pull_manifest_content(&descriptor, &store),
                    _ => this.download(&descriptor, &store),
                };
                while let Some(progress) = inner.next().await {
                    yield progress?;
                }
            }
        })
    }

    /// Pulls an index: each child in order, then the index body itself.
    fn pull_index_content(&self, descriptor: &Descriptor, store: &OciLayout) -> ProgressStream {
        let this = self.clone();
        let descriptor = descriptor.clone();
        let store = store.clone();
        Box::pin(try_stream! {
            let index = this.index(&descriptor).await?;
            let children = index.manifests().clone();

            let total = children.iter().map(|child| *child.size()).sum::<u64>()
                + *descriptor.size();
            let mut done = 0u64;
            let mut last = 0u64;

            for child in &children {
                let mut inner = this.pull_descriptor(child, &store);
                while let Some(progress) = inner.next().await {
                    let progress = progress?;
                    let bytes = progress.saturating_mul(*child.size()) / 100;
                    let overall = percent(done + bytes, total);
                    if overall > last {
                        last = overall;
                        yield overall;
                    }
                }
                done += *child.size();
            }

            let mut inner = this.download(&descriptor, &store);
            while let Some(progress) = inner.next().await {
                progress?;
            }

            if last != 100 {
                yield 100;
            }
        })
    }

    /// Pulls a manifest: its layers and config with bounded parallelism and
    /// merged progress, then the manifest body once every leaf has landed.
    fn pull_manifest_content(&self, descriptor: &Descriptor, store: &OciLayout) -> ProgressStream {
        let this = self.clone();
        let descriptor = descriptor.clone();
        let store = store.clone();
        Box::pin(try_stream! {
            let manifest = this.manifest(&descriptor).await?;
            let mut leaves = manifest.layers().clone();
            leaves.push(manifest.config().clone());

            let leaf_total = leaves.iter().map(|leaf| *leaf.size()).sum::<u64>();
            let total = leaf_total + *descriptor.size();
            let mut leaf_bytes = vec![0u64; leaves.len()];
            let mut last = 0u64;

            let downloads: Vec<_> = leaves
                .iter()
                .enumerate()
                .map(|(position, leaf)| {
                    let size = *leaf.size();
                    this.download(leaf, &store)
                        .map_ok(move |progress| (position, progress.saturating_mul(size) / 100))
                        .boxed()
                })
                .collect();
            let mut merged =
                stream::iter(downloads).flatten_unordered(MAX_CONCURRENT_LAYER_PULLS);

            while let Some(update) = merged.next().await {
                let (position, bytes) = update?;
                leaf_bytes[position] = bytes;
                let overall = percent(leaf_bytes.iter().sum::<u64>(), total);
                if overall > last {
                    last = overall;
                    yield overall;
                }
            }
            drop(merged);

            let mut inner = this.download(&descriptor, &store);
            while let Some(progress) = inner.next().await {
                let progress = progress?;
                let bytes = progress.saturating_mul(*descriptor.size()) / 100;
                let overall = percent(leaf_total + bytes, total);
                if overall > last {
                    last = overall;
                    yield overall;
                }
            }

            if last != 100 {
                yield 100;
            }
        })
    }

    /// Downloads one blob into the store, deduplicated through the store's
    /// transfer coordinator and resumed via a `Range` request when staged
    /// bytes exist and the registry serves ranges.
    pub(crate) fn download(&self, descriptor: &Descriptor, store: &OciLayout) -> ProgressStream {
        let this = self.clone();
        let descriptor = descriptor.clone();
        let store = store.clone();
        Box::pin(try_stream! {
            match store.coordinator().claim(&descriptor, TransferDirection::Download) {
                TransferClaim::Waiter(handle) => {
                    handle.wait().await?;
                    yield 100;
                }
                TransferClaim::Performer(handle) => {
                    if matches!(store.exists(&descriptor).await, Ok(true)) {
                        handle.succeed();
                        yield 100;
                    } else {
                        let staged = store.resume_offset(&descriptor).await?;
                        let offset = if staged > 0 {
                            if this.supports_range(descriptor.digest()).await {
                                staged
                            } else {
                                store.discard_staging(&descriptor).await?;
                                0
                            }
                        } else {
                            0
                        };

                        if offset > 0 {
                            yield percent(offset, *descriptor.size());
                        }

                        // Manifest and index bodies live on the manifests
                        // endpoint; everything else is a blob.
                        let media_type = descriptor.media_type().as_str();
                        let url = if media_type == media_types::MANIFEST
                            || media_type == media_types::INDEX
                        {
                            this.router
                                .manifest_url(&this.name, &descriptor.digest().to_string())
                        } else {
                            this.router.blob_url(&this.name, descriptor.digest())
                        };
                        let mut request = this
                            .request(Method::GET, &url, &[scope::pull(&this.name)])
                            .header(header::ACCEPT, descriptor.media_type().as_str());
                        if offset > 0 {
                            tracing::debug!(digest = %descriptor.digest(), offset, "resuming download");
                            request = request.header(
                                header::RANGE,
                                format!("bytes={}-{}", offset, descriptor.size() - 1),
                            );
                        }

                        let response = request.send().await?;
                        if !response.status().is_success() {
                            let failed: KociResult<()> = Err(error_from_response(response).await);
                            failed?;
                            unreachable!();
                        }

                        let body = response
                            .bytes_stream()
                            .map(|chunk| chunk.map_err(KociError::from))
                            .boxed();

                        let mut last = 0;
                        let mut write = store.write_blob(&descriptor, body, offset);
                        while let Some(progress) = write.next().await {
                            let progress = progress?;
                            last = progress;
                            yield progress;
                        }
                        drop(write);

                        handle.succeed();
                        if last != 100 {
                            yield 100;
                        }
                    }
                }
            }
        })
    }
}
