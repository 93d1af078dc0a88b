use bytes::Bytes;
use futures::{stream, StreamExt};
use koci::{
    layout::{OciLayout, OciLayoutConfig},
    media_types, ByteStream, Descriptor, Index, KociError, KociResult, Manifest, Platform,
    Reference, Registry, RegistryConfig, Repository,
};
use tempfile::tempdir;
use wiremock::{
    matchers::{header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const REPO: &str = "demo/app";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn registry_for(server: &MockServer) -> Registry {
    let host = server
        .uri()
        .strip_prefix("http://")
        .expect("mock server uri should be plain http")
        .to_string();
    Registry::connect(
        RegistryConfig::builder()
            .registry(host)
            .plain_http(true)
            .build(),
    )
    .unwrap()
}

fn repo_for(server: &MockServer) -> Repository {
    registry_for(server).repo(REPO).unwrap()
}

fn chunked(content: &[u8], chunk_size: usize) -> ByteStream {
    let chunks: Vec<KociResult<Bytes>> = content
        .chunks(chunk_size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    Box::pin(stream::iter(chunks))
}

async fn drain(mut progress: koci::ProgressStream) -> KociResult<Vec<u64>> {
    let mut seen = Vec::new();
    while let Some(item) = progress.next().await {
        seen.push(item?);
    }
    Ok(seen)
}

async fn scratch_layout() -> (tempfile::TempDir, OciLayout) {
    let dir = tempdir().unwrap();
    let layout = OciLayout::create(OciLayoutConfig::builder().root(dir.path()).build())
        .await
        .unwrap();
    (dir, layout)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_repository_exists_uses_the_right_endpoint() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let repo = repo_for(&server);

    let blob = Descriptor::from_bytes(media_types::LAYER, b"some layer");
    let manifest = Descriptor::from_bytes(media_types::MANIFEST, b"{}");

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, blob.digest())))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/manifests/{}", REPO, manifest.digest())))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    assert!(repo.exists(&blob).await?);
    assert!(!repo.exists(&manifest).await?);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_repository_resolve_index_without_filter() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let repo = repo_for(&server);

    let index = Index::builder()
        .manifests(vec![Descriptor::from_bytes(media_types::MANIFEST, b"{}")])
        .build();
    let body = serde_json::to_vec(&index)?;

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/manifests/v1", REPO)))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Content-Type", media_types::INDEX),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/v1", REPO)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", media_types::INDEX)
                .set_body_bytes(body.clone()),
        )
        .mount(&server)
        .await;

    let resolved = repo.resolve("v1", None).await?;

    let expected = Descriptor::from_bytes(media_types::INDEX, &body);
    assert_eq!(resolved, expected, "descriptor is computed over the body");

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_repository_resolve_index_with_platform_filter() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let repo = repo_for(&server);

    let platform_child = |architecture: &str, seed: &str| {
        Descriptor::builder()
            .media_type(media_types::MANIFEST)
            .digest(
                Descriptor::from_bytes(media_types::MANIFEST, seed.as_bytes())
                    .digest()
                    .clone(),
            )
            .size(seed.len() as u64)
            .platform(
                Platform::builder()
                    .architecture(architecture)
                    .os("linux")
                    .build(),
            )
            .build()
    };
    let amd = platform_child("amd64", "amd manifest");
    let arm = platform_child("arm64", "arm manifest");

    let index = Index::builder()
        .manifests(vec![amd.clone(), arm.clone()])
        .build();
    let body = serde_json::to_vec(&index)?;

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/manifests/multi", REPO)))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Content-Type", media_types::INDEX),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/multi", REPO)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", media_types::INDEX)
                .set_body_bytes(body),
        )
        .mount(&server)
        .await;

    let resolved = repo
        .resolve("multi", Some(&|p: &Platform| p.architecture() == "arm64"))
        .await?;
    assert_eq!(resolved, arm);

    let err = repo
        .resolve("multi", Some(&|p: &Platform| p.architecture() == "s390x"))
        .await
        .unwrap_err();
    assert!(matches!(err, KociError::PlatformNotFound(_)));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_repository_resolve_rejects_unknown_content_type() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let repo = repo_for(&server);

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/manifests/v1", REPO)))
        .respond_with(ResponseTemplate::new(200).insert_header("Content-Type", "text/html"))
        .mount(&server)
        .await;

    let err = repo.resolve("v1", None).await.unwrap_err();
    assert!(matches!(err, KociError::UnsupportedManifest { .. }));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_repository_tags_listing() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let repo = repo_for(&server);

    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/tags/list", REPO)))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            format!(r#"{{"name":"{}","tags":["v1","v2","latest"]}}"#, REPO),
            "application/json",
        ))
        .mount(&server)
        .await;

    let tags = repo.tags().await?;
    assert_eq!(tags.name(), REPO);
    assert_eq!(tags.tags().len(), 3);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_repository_pull_manifest_into_store() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let registry = registry_for(&server);
    let repo = registry.repo(REPO)?;
    let (_dir, store) = scratch_layout().await;

    let config_bytes = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
    let layer_one = vec![1u8; 2048];
    let layer_two = vec![2u8; 4096];

    let config = Descriptor::from_bytes(media_types::CONFIG, &config_bytes);
    let layers = vec![
        Descriptor::from_bytes(media_types::LAYER, &layer_one),
        Descriptor::from_bytes(media_types::LAYER, &layer_two),
    ];
    let manifest = Manifest::builder()
        .config(config.clone())
        .layers(layers.clone())
        .build();
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let manifest_desc = Descriptor::from_bytes(media_types::MANIFEST, &manifest_bytes);

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/manifests/v1", REPO)))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Content-Type", media_types::MANIFEST),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/v1", REPO)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", media_types::MANIFEST)
                .set_body_bytes(manifest_bytes.clone()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!(
            "/v2/{}/manifests/{}",
            REPO,
            manifest_desc.digest()
        )))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", media_types::MANIFEST)
                .set_body_bytes(manifest_bytes.clone()),
        )
        .mount(&server)
        .await;
    for (descriptor, content) in [
        (&config, config_bytes.clone()),
        (&layers[0], layer_one.clone()),
        (&layers[1], layer_two.clone()),
    ] {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", REPO, descriptor.digest())))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(content))
            .expect(1)
            .mount(&server)
            .await;
    }

    let seen = drain(repo.pull("v1", &store, None)).await?;

    assert_eq!(seen.last(), Some(&100), "pull should finish at 100 percent");
    assert!(
        seen.windows(2).all(|w| w[0] <= w[1]),
        "merged progress should stay monotonic"
    );

    assert!(store.exists(&manifest_desc).await?);
    assert!(store.exists(&config).await?);
    for layer in &layers {
        assert!(store.exists(layer).await?);
    }

    let reference = Reference::new(registry.router().registry().clone(), REPO, "v1")?;
    let resolved = store.resolve(&reference, None).await?;
    assert_eq!(resolved.digest(), manifest_desc.digest());

    // A second pull is satisfied locally; the mocks above stay untouched.
    let again = drain(repo.pull("v1", &store, None)).await?;
    assert_eq!(again.last(), Some(&100));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_repository_pull_multi_platform_index() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let registry = registry_for(&server);
    let repo = registry.repo(REPO)?;
    let (_dir, store) = scratch_layout().await;

    // One single-layer image per architecture.
    let mut children = Vec::new();
    let mut bodies: Vec<(Descriptor, Vec<u8>)> = Vec::new();
    for architecture in ["amd64", "arm64"] {
        let config_bytes = format!(r#"{{"architecture":"{}"}}"#, architecture).into_bytes();
        let layer_bytes = format!("layer for {}", architecture).into_bytes();
        let config = Descriptor::from_bytes(media_types::CONFIG, &config_bytes);
        let layer = Descriptor::from_bytes(media_types::LAYER, &layer_bytes);

        let manifest = Manifest::builder()
            .config(config.clone())
            .layers(vec![layer.clone()])
            .build();
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_desc = Descriptor::from_bytes(media_types::MANIFEST, &manifest_bytes);

        children.push(
            Descriptor::builder()
                .media_type(media_types::MANIFEST)
                .digest(manifest_desc.digest().clone())
                .size(*manifest_desc.size())
                .platform(
                    Platform::builder()
                        .architecture(architecture)
                        .os("linux")
                        .build(),
                )
                .build(),
        );
        bodies.push((manifest_desc, manifest_bytes));
        bodies.push((config, config_bytes));
        bodies.push((layer, layer_bytes));
    }

    let index = Index::builder().manifests(children).build();
    let index_bytes = serde_json::to_vec(&index)?;
    let index_desc = Descriptor::from_bytes(media_types::INDEX, &index_bytes);

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/manifests/multi", REPO)))
        .respond_with(
            ResponseTemplate::new(200).insert_header("Content-Type", media_types::INDEX),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/multi", REPO)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", media_types::INDEX)
                .set_body_bytes(index_bytes.clone()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/manifests/{}", REPO, index_desc.digest())))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", media_types::INDEX)
                .set_body_bytes(index_bytes.clone()),
        )
        .mount(&server)
        .await;
    for (descriptor, content) in &bodies {
        let endpoint = if descriptor.media_type() == media_types::MANIFEST {
            format!("/v2/{}/manifests/{}", REPO, descriptor.digest())
        } else {
            format!("/v2/{}/blobs/{}", REPO, descriptor.digest())
        };
        Mock::given(method("GET"))
            .and(path(endpoint))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", descriptor.media_type().as_str())
                    .set_body_bytes(content.clone()),
            )
            .mount(&server)
            .await;
    }

    let seen = drain(repo.pull("multi", &store, None)).await?;

    assert_eq!(seen.last(), Some(&100));
    assert!(
        seen.windows(2).all(|w| w[0] <= w[1]),
        "index progress should be monotonic across children"
    );

    assert!(store.exists(&index_desc).await?);
    for (descriptor, _) in &bodies {
        assert!(
            store.exists(descriptor).await?,
            "every child of the index should land in the store"
        );
    }

    // The whole graph is referenced, so nothing is collectable.
    assert!(store.gc().await?.is_empty());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_repository_download_resumes_with_range() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let repo = repo_for(&server);
    let (_dir, store) = scratch_layout().await;

    let content: Vec<u8> = (0..=255u8).cycle().take(8192).collect();
    let descriptor = Descriptor::from_bytes(media_types::LAYER, &content);

    // Seed a partial from an earlier interrupted download.
    tokio::fs::write(store.staging_path(descriptor.digest()), &content[..3000]).await?;

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, descriptor.digest())))
        .respond_with(ResponseTemplate::new(200).insert_header("Accept-Ranges", "bytes"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, descriptor.digest())))
        .and(header("Range", "bytes=3000-8191"))
        .respond_with(ResponseTemplate::new(206).set_body_bytes(content[3000..].to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let seen = drain(repo.pull_descriptor(&descriptor, &store)).await?;

    assert_eq!(
        seen.first().copied(),
        Some(36),
        "the preamble reflects the staged bytes"
    );
    assert_eq!(seen.last(), Some(&100));
    assert!(store.exists(&descriptor).await?);
    let on_disk = tokio::fs::read(store.blob_path(descriptor.digest())).await?;
    assert_eq!(on_disk, content, "resumed bytes must match a full download");

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_repository_push_small_blob_single_put() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let repo = repo_for(&server);

    let content = b"tiny blob".to_vec();
    let descriptor = Descriptor::from_bytes(media_types::LAYER, &content);

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, descriptor.digest())))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/v2/{}/blobs/uploads/", REPO)))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", format!("/v2/{}/blobs/uploads/uuid1", REPO).as_str())
                .insert_header("Range", "0-0"),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/v2/{}/blobs/uploads/uuid1", REPO)))
        .and(query_param("digest", descriptor.digest().to_string()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let seen = drain(repo.push(chunked(&content, 4), &descriptor)).await?;
    assert_eq!(seen.last(), Some(&100));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_repository_push_chunked_upload() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let repo = repo_for(&server);

    let content = b"0123456789".to_vec();
    let descriptor = Descriptor::from_bytes(media_types::LAYER, &content);

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, descriptor.digest())))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/v2/{}/blobs/uploads/", REPO)))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", format!("/v2/{}/blobs/uploads/uuid1", REPO).as_str())
                .insert_header("Range", "0-0")
                .insert_header("OCI-Chunk-Min-Length", "4"),
        )
        .expect(1)
        .mount(&server)
        .await;
    for (content_range, confirmed) in [("0-3", "0-4"), ("4-7", "0-8"), ("8-9", "0-10")] {
        Mock::given(method("PATCH"))
            .and(path(format!("/v2/{}/blobs/uploads/uuid1", REPO)))
            .and(header("Content-Range", content_range))
            .respond_with(ResponseTemplate::new(202).insert_header("Range", confirmed))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("PUT"))
        .and(path(format!("/v2/{}/blobs/uploads/uuid1", REPO)))
        .and(query_param("digest", descriptor.digest().to_string()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let seen = drain(repo.push(chunked(&content, 3), &descriptor)).await?;
    assert_eq!(seen.last(), Some(&100));
    assert!(
        seen.windows(2).all(|w| w[0] <= w[1]),
        "upload progress should be monotonic"
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_repository_push_restarts_forgotten_session() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let repo = repo_for(&server);

    let content = b"0123456789".to_vec();
    let descriptor = Descriptor::from_bytes(media_types::LAYER, &content);

    Mock::given(method("HEAD"))
        .and(path(format!("/v2/{}/blobs/{}", REPO, descriptor.digest())))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    // First POST opens uuid1, the second (after the restart) opens uuid2.
    Mock::given(method("POST"))
        .and(path(format!("/v2/{}/blobs/uploads/", REPO)))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", format!("/v2/{}/blobs/uploads/uuid1", REPO).as_str())
                .insert_header("OCI-Chunk-Min-Length", "4"),
        )
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/v2/{}/blobs/uploads/", REPO)))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", format!("/v2/{}/blobs/uploads/uuid2", REPO).as_str())
                .insert_header("OCI-Chunk-Min-Length", "4"),
        )
        .expect(1)
        .mount(&server)
        .await;

    // The first attempt lands one chunk and then dies.
    Mock::given(method("PATCH"))
        .and(path(format!("/v2/{}/blobs/uploads/uuid1", REPO)))
        .and(header("Content-Range", "0-3"))
        .respond_with(ResponseTemplate::new(202).insert_header("Range", "0-4"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("/v2/{}/blobs/uploads/uuid1", REPO)))
        .and(header("Content-Range", "4-7"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    // The resume probe learns the server forgot the session.
    Mock::given(method("GET"))
        .and(path(format!("/v2/{}/blobs/uploads/uuid1", REPO)))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    for content_range in ["0-3", "4-7", "8-9"] {
        Mock::given(method("PATCH"))
            .and(path(format!("/v2/{}/blobs/uploads/uuid2", REPO)))
            .and(header("Content-Range", content_range))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("PUT"))
        .and(path(format!("/v2/{}/blobs/uploads/uuid2", REPO)))
        .and(query_param("digest", descriptor.digest().to_string()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let first = drain(repo.push(chunked(&content, 3), &descriptor)).await;
    assert!(first.is_err(), "the interrupted upload should surface");

    let second = drain(repo.push(chunked(&content, 3), &descriptor)).await?;
    assert_eq!(second.last(), Some(&100));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_repository_mount_outcomes() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let repo = repo_for(&server);

    let mounted = Descriptor::from_bytes(media_types::LAYER, b"mountable");
    let fallback = Descriptor::from_bytes(media_types::LAYER, b"not mountable");

    for descriptor in [&mounted, &fallback] {
        Mock::given(method("HEAD"))
            .and(path(format!("/v2/{}/blobs/{}", REPO, descriptor.digest())))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
    }

    Mock::given(method("POST"))
        .and(path(format!("/v2/{}/blobs/uploads/", REPO)))
        .and(query_param("mount", mounted.digest().to_string()))
        .and(query_param("from", "demo/src"))
        .respond_with(
            ResponseTemplate::new(201)
                .insert_header("Location", format!("/v2/{}/blobs/{}", REPO, mounted.digest()).as_str()),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/v2/{}/blobs/uploads/", REPO)))
        .and(query_param("mount", fallback.digest().to_string()))
        .and(query_param("from", "demo/src"))
        .respond_with(
            ResponseTemplate::new(202)
                .insert_header("Location", format!("/v2/{}/blobs/uploads/uuid9", REPO).as_str()),
        )
        .expect(1)
        .mount(&server)
        .await;

    assert!(repo.mount(&mounted, "demo/src").await?);
    assert!(!repo.mount(&fallback, "demo/src").await?);

    // The fallback registered an upload session; the push drives it without
    // opening another one.
    Mock::given(method("PUT"))
        .and(path(format!("/v2/{}/blobs/uploads/uuid9", REPO)))
        .and(query_param("digest", fallback.digest().to_string()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let seen = drain(repo.push(chunked(b"not mountable", 4), &fallback)).await?;
    assert_eq!(seen.last(), Some(&100));

    // Manifests cannot be mounted.
    let manifest = Descriptor::from_bytes(media_types::MANIFEST, b"{}");
    let err = repo.mount(&manifest, "demo/src").await.unwrap_err();
    assert!(matches!(err, KociError::UnsupportedManifest { .. }));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_repository_tag_publishes_manifest() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    let repo = repo_for(&server);

    let config = Descriptor::from_bytes(media_types::CONFIG, b"{}");
    let manifest = Manifest::builder().config(config).build();
    let body = serde_json::to_vec(&manifest)?;
    let expected = Descriptor::from_bytes(media_types::MANIFEST, &body);

    Mock::given(method("PUT"))
        .and(path(format!("/v2/{}/manifests/v2", REPO)))
        .and(header("Content-Type", media_types::MANIFEST))
        .respond_with(
            ResponseTemplate::new(201).insert_header(
                "Location",
                format!("/v2/{}/manifests/{}", REPO, expected.digest()).as_str(),
            ),
        )
        .expect(1)
        .mount(&server)
        .await;

    let descriptor = repo.tag(&manifest, "v2").await?;
    assert_eq!(descriptor.digest(), expected.digest());
    assert_eq!(*descriptor.size(), body.len() as u64);

    let err = repo.tag(&manifest, "not a tag!").await.unwrap_err();
    assert!(matches!(err, KociError::InvalidTag(_)));

    Ok(())
}
