use std::path::{Path, PathBuf};

use async_stream::try_stream;
use futures::StreamExt;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::{
    digest::DigestHasher,
    progress::{percent, ByteStream, ProgressStream},
    transfer::{TransferClaim, TransferDirection},
    Descriptor, Digest, KociError, KociResult,
};

use super::OciLayout;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OciLayout {
    /// Writes the described blob into the store, verifying its size and digest
    /// and finalizing it atomically.
    ///
    /// The write is single-flighted through the transfer coordinator: a second
    /// concurrent push of the same digest waits for the first and emits no
    /// progress of its own. Staged bytes from an earlier interrupted push are
    /// adopted, and the matching prefix of the incoming stream is skipped.
    ///
    /// The returned stream is lazy and emits whole percents; dropping it
    /// mid-write leaves the staging file in place for a later resume.
    pub fn push(&self, descriptor: &Descriptor, stream: ByteStream) -> ProgressStream {
        let this = self.clone();
        let descriptor = descriptor.clone();
        Box::pin(try_stream! {
            match this.coordinator.claim(&descriptor, TransferDirection::Download) {
                TransferClaim::Waiter(handle) => {
                    handle.wait().await?;
                }
                TransferClaim::Performer(handle) => {
                    if matches!(this.exists(&descriptor).await, Ok(true)) {
                        handle.succeed();
                    } else {
                        let mut write = this.write_blob(&descriptor, stream, 0);
                        while let Some(progress) = write.next().await {
                            yield progress?;
                        }
                        handle.succeed();
                    }
                }
            }
        })
    }

    /// The uncoordinated write path behind [`OciLayout::push`], also entered
    /// by download flows that already hold the coordinator claim for this
    /// digest.
    ///
    /// `stream_offset` names the blob offset of the stream's first byte: 0 for
    /// a full-content push, the staged size for a range-resumed download.
    pub(crate) fn write_blob(
        &self,
        descriptor: &Descriptor,
        stream: ByteStream,
        stream_offset: u64,
    ) -> ProgressStream {
        let this = self.clone();
        let descriptor = descriptor.clone();
        Box::pin(try_stream! {
            let size = *descriptor.size();
            let digest = descriptor.digest().clone();
            let staging_path = this.staging_path(&digest);
            let final_path = this.blob_path(&digest);

            let (staged, mut hasher) =
                prepare_staging(&staging_path, &digest, size, stream_offset).await?;
            let mut skip = staged - stream_offset;
            let mut read_total = staged;
            let mut last_percent = None;

            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&staging_path)
                .await?;

            let mut stream = stream;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                let mut data = &chunk[..];
                if skip > 0 {
                    let skipped = skip.min(data.len() as u64) as usize;
                    data = &data[skipped..];
                    skip -= skipped as u64;
                }
                if data.is_empty() {
                    continue;
                }

                file.write_all(data).await?;
                hasher.update(data);
                read_total += data.len() as u64;

                let progress = percent(read_total, size);
                if last_percent != Some(progress) {
                    last_percent = Some(progress);
                    yield progress;
                }
            }
            file.flush().await?;
            drop(file);

            verify_staged(&staging_path, &digest, size, read_total, hasher).await?;
            finalize_blob(&staging_path, &final_path).await?;

            match this.exists(&descriptor).await {
                Ok(true) => {}
                Ok(false) => {
                    let missing: KociResult<()> = Err(KociError::BlobNotFound(descriptor.clone()));
                    missing?;
                }
                Err(e) => {
                    let failed: KociResult<()> = Err(e);
                    failed?;
                }
            }

            tracing::debug!(%digest, size, "blob finalized");
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Sizes up the staging file and replays its contents into a fresh hasher.
/// Oversized or gapped partials are unusable and are dropped.
async fn prepare_staging(
    staging_path: &Path,
    digest: &Digest,
    size: u64,
    stream_offset: u64,
) -> KociResult<(u64, DigestHasher)> {
    let mut staged = match fs::metadata(staging_path).await {
        Ok(metadata) => metadata.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };

    if staged > size {
        fs::remove_file(staging_path).await?;
        staged = 0;
    }
    if staged < stream_offset {
        return Err(KociError::InvalidLayout(format!(
            "only {} bytes staged for {}, cannot resume from offset {}",
            staged, digest, stream_offset
        )));
    }

    let mut hasher = digest.algorithm().hasher();
    if staged > 0 {
        let mut file = fs::File::open(staging_path).await?;
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
    }

    Ok((staged, hasher))
}

/// Verifies the completed staging file against the descriptor, deleting it on
/// any mismatch.
async fn verify_staged(
    staging_path: &Path,
    digest: &Digest,
    size: u64,
    read_total: u64,
    hasher: DigestHasher,
) -> KociResult<()> {
    if read_total != size {
        fs::remove_file(staging_path).await.ok();
        return Err(KociError::SizeMismatch {
            expected: size,
            actual: read_total,
        });
    }

    let actual = hasher.finalize();
    if actual != *digest {
        fs::remove_file(staging_path).await.ok();
        return Err(KociError::DigestMismatch {
            expected: digest.to_string(),
            actual: actual.to_string(),
        });
    }

    Ok(())
}

/// Moves the verified staging file into the blob tree, falling back to
/// copy-then-delete when staging and blobs live on different filesystems.
async fn finalize_blob(staging_path: &Path, final_path: &PathBuf) -> KociResult<()> {
    if let Some(parent) = final_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    match fs::rename(staging_path, final_path).await {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            fs::copy(staging_path, final_path).await?;
            fs::remove_file(staging_path).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
