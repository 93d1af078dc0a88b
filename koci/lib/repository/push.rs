use async_stream::try_stream;
use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{header, Method, StatusCode};

use crate::{
    error::error_from_response,
    manifest::{media_types, ManifestContent},
    progress::{percent, ByteStream, ProgressStream},
    reference::validate_tag,
    scope,
    transfer::{TransferClaim, TransferDirection},
    Descriptor, Digest, KociError, KociResult,
};

use super::{Repository, UploadStatus};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The chunk size used when the server does not advertise
/// `OCI-Chunk-Min-Length`.
const DEFAULT_MIN_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

const CHUNK_MIN_LENGTH_HEADER: &str = "OCI-Chunk-Min-Length";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Reassembles an incoming byte stream into chunks of a requested size.
struct ChunkAssembler {
    stream: ByteStream,
    buffer: BytesMut,
    exhausted: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Repository {
    /// Uploads the described blob, resuming a known session when the server
    /// still has it and restarting when it does not.
    ///
    /// Small remainders go up in a single `PUT`; anything larger is sent as
    /// sequential `PATCH` chunks of at least the server's minimum size,
    /// finished by a digest-bearing `PUT`. All requests carry the combined
    /// pull+push scope.
    pub fn push(&self, stream: ByteStream, expected: &Descriptor) -> ProgressStream {
        let this = self.clone();
        let expected = expected.clone();
        Box::pin(try_stream! {
            if this.exists(&expected).await? {
                yield 100;
            } else {
                match this.coordinator.claim(&expected, TransferDirection::Upload) {
                    TransferClaim::Waiter(handle) => {
                        handle.wait().await?;
                        yield 100;
                    }
                    TransferClaim::Performer(handle) => {
                        let mut upload = this.upload_blob(stream, &expected);
                        while let Some(progress) = upload.next().await {
                            yield progress?;
                        }
                        drop(upload);
                        handle.succeed();
                    }
                }
            }
        })
    }

    /// The session-driving upload behind [`Repository::push`].
    fn upload_blob(&self, stream: ByteStream, expected: &Descriptor) -> ProgressStream {
        let this = self.clone();
        let expected = expected.clone();
        Box::pin(try_stream! {
            let size = *expected.size();
            let digest = expected.digest().clone();
            let mut status = this.start_or_resume_session(&digest).await?;
            let mut last = 0;
            if status.offset > 0 {
                last = percent(status.offset, size);
                yield last;
            }

            let mut chunks = ChunkAssembler::new(stream);
            chunks.skip(status.offset).await?;

            let bytes_left = size.saturating_sub(status.offset);
            if bytes_left >= 1 && bytes_left <= status.min_chunk_size {
                // Small remainder, single shot.
                let body = chunks
                    .next_chunk(bytes_left as usize)
                    .await?
                    .unwrap_or_default();
                let url = append_digest(&status.location, &digest);
                let response = this
                    .request(Method::PUT, &url, &scope_set(&this.name))
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .header(header::CONTENT_LENGTH, body.len())
                    .body(body)
                    .send()
                    .await?;
                expect_status(response, StatusCode::CREATED).await?;
            } else {
                while let Some(chunk) = chunks.next_chunk(status.min_chunk_size as usize).await? {
                    let end_range = status.offset + chunk.len() as u64 - 1;
                    let response = this
                        .request(Method::PATCH, &status.location, &scope_set(&this.name))
                        .header(header::CONTENT_TYPE, "application/octet-stream")
                        .header(header::CONTENT_LENGTH, chunk.len())
                        .header(
                            header::CONTENT_RANGE,
                            format!("{}-{}", status.offset, end_range),
                        )
                        .body(chunk)
                        .send()
                        .await?;
                    let confirmed = expect_status(response, StatusCode::ACCEPTED).await?;

                    if let Some(location) = header_value(&confirmed, header::LOCATION) {
                        status.location = this.router.parse_upload_location(&location)?;
                    }
                    status.offset = range_end(&confirmed).unwrap_or(end_range + 1);
                    this.uploads
                        .lock()
                        .await
                        .insert(digest.clone(), status.clone());

                    let progress = percent(status.offset, size);
                    if progress > last {
                        last = progress;
                        yield progress;
                    }
                }

                let url = append_digest(&status.location, &digest);
                let response = this
                    .request(Method::PUT, &url, &scope_set(&this.name))
                    .header(header::CONTENT_LENGTH, 0u64)
                    .send()
                    .await?;
                expect_status(response, StatusCode::CREATED).await?;
            }

            this.uploads.lock().await.remove(&digest);
            tracing::debug!(%digest, size, "blob uploaded");
            if last != 100 {
                yield 100;
            }
        })
    }

    /// Reuses a known upload session after confirming the server still has
    /// it, or opens a fresh one.
    async fn start_or_resume_session(&self, digest: &Digest) -> KociResult<UploadStatus> {
        let known = self.uploads.lock().await.get(digest).cloned();
        if let Some(mut status) = known {
            if status.offset == 0 {
                return Ok(status);
            }
            let response = self
                .request(Method::GET, &status.location, &scope_set(&self.name))
                .send()
                .await?;
            match response.status() {
                StatusCode::NOT_FOUND => {
                    // The server forgot the session; start over.
                    self.uploads.lock().await.remove(digest);
                }
                StatusCode::NO_CONTENT => {
                    if let Some(confirmed) = range_end(&response) {
                        status.offset = confirmed;
                    }
                    return Ok(status);
                }
                other => {
                    return Err(KociError::UnexpectedStatus {
                        expected: StatusCode::NO_CONTENT.as_u16(),
                        got: other.as_u16(),
                    });
                }
            }
        }

        let url = self.router.uploads_url(&self.name);
        let response = self
            .request(Method::POST, &url, &scope_set(&self.name))
            .header(header::CONTENT_LENGTH, 0u64)
            .send()
            .await?;
        let response = expect_status(response, StatusCode::ACCEPTED).await?;

        let location = header_value(&response, header::LOCATION).ok_or_else(|| {
            KociError::HttpError {
                status: response.status().as_u16(),
                message: "upload session started without a location".to_string(),
            }
        })?;
        let location = self.router.parse_upload_location(&location)?;
        let offset = range_end(&response).unwrap_or(0);
        let min_chunk_size = response
            .headers()
            .get(CHUNK_MIN_LENGTH_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_MIN_CHUNK_SIZE);

        let status = UploadStatus::new(location, offset, min_chunk_size);
        self.uploads
            .lock()
            .await
            .insert(digest.clone(), status.clone());
        Ok(status)
    }

    /// Mounts a blob from another repository on the same registry.
    ///
    /// Returns `true` when the registry mounted it (or it is already
    /// present), `false` when the registry fell back to a regular upload
    /// session, which is registered for a following [`Repository::push`].
    pub async fn mount(&self, descriptor: &Descriptor, from: &str) -> KociResult<bool> {
        let media_type = descriptor.media_type().as_str();
        if media_type == media_types::MANIFEST || media_type == media_types::INDEX {
            return Err(KociError::UnsupportedManifest {
                media_type: media_type.to_string(),
                context: "mount".to_string(),
            });
        }

        if self.uploads.lock().await.contains_key(descriptor.digest()) {
            return Ok(false);
        }
        if self.exists(descriptor).await? {
            return Ok(true);
        }

        let url = self.router.mount_url(&self.name, descriptor.digest(), from);
        let mut scopes = scope_set(&self.name);
        scopes.push(scope::pull(from));
        let response = self
            .request(Method::POST, &url, &scopes)
            .header(header::CONTENT_LENGTH, 0u64)
            .send()
            .await?;

        match response.status() {
            StatusCode::CREATED => {
                header_value(&response, header::LOCATION).ok_or_else(|| KociError::HttpError {
                    status: StatusCode::CREATED.as_u16(),
                    message: "mount succeeded without a location".to_string(),
                })?;
                tracing::debug!(digest = %descriptor.digest(), from, "blob mounted");
                Ok(true)
            }
            StatusCode::ACCEPTED => {
                // The registry opted for a regular upload instead.
                let location = header_value(&response, header::LOCATION).ok_or_else(|| {
                    KociError::HttpError {
                        status: StatusCode::ACCEPTED.as_u16(),
                        message: "mount fallback without a location".to_string(),
                    }
                })?;
                let location = self.router.parse_upload_location(&location)?;
                let offset = range_end(&response).unwrap_or(0);
                let min_chunk_size = response
                    .headers()
                    .get(CHUNK_MIN_LENGTH_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(DEFAULT_MIN_CHUNK_SIZE);
                self.uploads.lock().await.insert(
                    descriptor.digest().clone(),
                    UploadStatus::new(location, offset, min_chunk_size),
                );
                Ok(false)
            }
            _ => Err(error_from_response(response).await),
        }
    }

    /// Publishes serialized manifest content under a tag.
    pub async fn tag<C: ManifestContent>(
        &self,
        content: &C,
        reference: &str,
    ) -> KociResult<Descriptor> {
        validate_tag(reference)?;

        let content_type = match content.content_media_type() {
            Some(media_type) => media_type,
            None => C::default_media_type(),
        }
        .to_string();
        let body = content.to_json_bytes()?;

        let url = self.router.manifest_url(&self.name, reference);
        let response = self
            .request(Method::PUT, &url, &scope_set(&self.name))
            .header(header::CONTENT_TYPE, &content_type)
            .body(body.clone())
            .send()
            .await?;
        let response = expect_status(response, StatusCode::CREATED).await?;

        // The location names the manifest by digest when the registry
        // computed one; fall back to hashing what we sent.
        let described = Descriptor::from_bytes(&content_type, &body);
        let descriptor = header_value(&response, header::LOCATION)
            .and_then(|location| {
                let (_, digest) = location.rsplit_once('/')?;
                let digest: Digest = digest.parse().ok()?;
                Some(Descriptor::new(&content_type, digest, body.len() as u64))
            })
            .unwrap_or(described);

        tracing::info!(name = %self.name, reference, digest = %descriptor.digest(), "tagged");
        Ok(descriptor)
    }
}

impl ChunkAssembler {
    fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            exhausted: false,
        }
    }

    /// Drops the first `count` bytes of the stream.
    async fn skip(&mut self, mut count: u64) -> KociResult<()> {
        while count > 0 {
            if !self.buffer.is_empty() {
                let discard = count.min(self.buffer.len() as u64) as usize;
                self.buffer.advance(discard);
                count -= discard as u64;
                continue;
            }
            match self.stream.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => {
                    self.exhausted = true;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Returns the next chunk of up to `size` bytes, or `None` at the end of
    /// the stream. Only the final chunk may be shorter than `size`.
    async fn next_chunk(&mut self, size: usize) -> KociResult<Option<Bytes>> {
        while self.buffer.len() < size && !self.exhausted {
            match self.stream.next().await {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.exhausted = true,
            }
        }

        if self.buffer.is_empty() {
            return Ok(None);
        }
        let take = size.min(self.buffer.len());
        Ok(Some(self.buffer.split_to(take).freeze()))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The combined pull+push scope every upload request carries.
fn scope_set(name: &str) -> Vec<String> {
    vec![scope::pull_push(name)]
}

/// Appends the `digest` query parameter to an upload location, which may
/// already carry session parameters.
fn append_digest(location: &str, digest: &Digest) -> String {
    let separator = if location.contains('?') { '&' } else { '?' };
    format!("{}{}digest={}", location, separator, digest)
}

/// Reads the end of a `Range: <start>-<end>` header as a byte count.
fn range_end(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.rsplit_once('-'))
        .and_then(|(_, end)| end.trim().parse::<u64>().ok())
}

fn header_value(response: &reqwest::Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(String::from)
}

/// Enforces a protocol-mandated status, translating everything else through
/// the failure-body parser.
async fn expect_status(
    response: reqwest::Response,
    expected: StatusCode,
) -> KociResult<reqwest::Response> {
    let status = response.status();
    if status == expected {
        return Ok(response);
    }
    if !status.is_success() {
        return Err(error_from_response(response).await);
    }
    Err(KociError::UnexpectedStatus {
        expected: expected.as_u16(),
        got: status.as_u16(),
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
