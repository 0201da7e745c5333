use http_body_util::BodyExt;
use hyper::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::instrument;
use uuid::Uuid;

use super::request_ext::{IntoAsyncRead, RequestExt};
use super::response::{self, Body, DOCKER_CONTENT_DIGEST, DOCKER_UPLOAD_UUID};
use crate::oci::{Digest, Reference};
use crate::registry::{Error, GetBlobResponse, Registry, StartUploadOutcome};

type HandlerResult = Result<Response<Body>, Error>;

pub fn api_version() -> HandlerResult {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::fixed(b"{}".to_vec()))?)
}

pub fn healthz() -> HandlerResult {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(Body::empty())?)
}

#[instrument(skip(registry))]
pub async fn list_catalog(
    registry: &Registry,
    n: Option<usize>,
    last: Option<String>,
) -> HandlerResult {
    #[derive(Serialize)]
    struct CatalogResponse {
        repositories: Vec<String>,
    }

    let (repositories, next) = registry.list_catalog(n, last).await?;
    let body = serde_json::to_vec(&CatalogResponse { repositories })?;

    response::paginated(body, "/v2/_catalog", n, next.as_deref())
}

#[instrument(skip(registry))]
pub async fn list_tags(
    registry: &Registry,
    namespace: &str,
    n: Option<usize>,
    last: Option<String>,
) -> HandlerResult {
    #[derive(Serialize)]
    struct TagsResponse {
        name: String,
        tags: Vec<String>,
    }

    let repository = registry.repository(namespace)?;
    let (tags, next) = registry.list_tags(&repository, n, last).await?;
    let body = serde_json::to_vec(&TagsResponse {
        name: namespace.to_string(),
        tags,
    })?;

    response::paginated(
        body,
        &format!("/v2/{namespace}/tags/list"),
        n,
        next.as_deref(),
    )
}

#[instrument(skip(registry, accepted_media_types))]
pub async fn get_manifest(
    registry: &Registry,
    namespace: &str,
    reference: Reference,
    accepted_media_types: &[String],
) -> HandlerResult {
    let repository = registry.repository(namespace)?;
    let manifest = registry
        .get_manifest(&repository, &reference, accepted_media_types)
        .await?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(DOCKER_CONTENT_DIGEST, manifest.digest.to_string())
        .header(CONTENT_LENGTH, manifest.content.len());
    if let Some(media_type) = &manifest.media_type {
        builder = builder.header(CONTENT_TYPE, media_type);
    }

    Ok(builder.body(Body::fixed(manifest.content))?)
}

#[instrument(skip(registry, accepted_media_types))]
pub async fn head_manifest(
    registry: &Registry,
    namespace: &str,
    reference: Reference,
    accepted_media_types: &[String],
) -> HandlerResult {
    let repository = registry.repository(namespace)?;
    let manifest = registry
        .head_manifest(&repository, &reference, accepted_media_types)
        .await?;

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(DOCKER_CONTENT_DIGEST, manifest.digest.to_string())
        .header(CONTENT_LENGTH, manifest.size);
    if let Some(media_type) = &manifest.media_type {
        builder = builder.header(CONTENT_TYPE, media_type);
    }

    Ok(builder.body(Body::empty())?)
}

#[instrument(skip(registry, request))]
pub async fn put_manifest<B>(
    registry: &Registry,
    request: Request<B>,
    namespace: &str,
    reference: Reference,
) -> HandlerResult
where
    B: hyper::body::Body,
{
    let repository = registry.repository(namespace)?;
    let content_type = request.get_header(CONTENT_TYPE);

    let body = request
        .into_body()
        .collect()
        .await
        .map_err(|_| Error::ManifestInvalid(Some("unable to read manifest body".to_string())))?
        .to_bytes();

    let result = registry
        .put_manifest(&repository, reference.clone(), content_type.as_deref(), &body)
        .await?;

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(LOCATION, format!("/v2/{namespace}/manifests/{reference}"))
        .header(DOCKER_CONTENT_DIGEST, result.digest.to_string())
        .body(Body::empty())?)
}

#[instrument(skip(registry))]
pub async fn delete_manifest(
    registry: &Registry,
    namespace: &str,
    reference: Reference,
) -> HandlerResult {
    let repository = registry.repository(namespace)?;
    registry.delete_manifest(&repository, reference).await?;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(Body::empty())?)
}

#[instrument(skip(registry, range))]
pub async fn get_blob(
    registry: &Registry,
    namespace: &str,
    digest: Digest,
    range: Option<(u64, u64)>,
) -> HandlerResult {
    let repository = registry.repository(namespace)?;

    let res = match registry.get_blob(&repository, &digest, range).await? {
        GetBlobResponse::Reader(reader, total) => Response::builder()
            .status(StatusCode::OK)
            .header(DOCKER_CONTENT_DIGEST, digest.to_string())
            .header("Accept-Ranges", "bytes")
            .header(CONTENT_LENGTH, total)
            .body(Body::streaming(reader))?,
        GetBlobResponse::RangedReader(reader, (start, end), total) => {
            let length = end - start + 1;
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(DOCKER_CONTENT_DIGEST, digest.to_string())
                .header("Accept-Ranges", "bytes")
                .header(CONTENT_LENGTH, length)
                .header(CONTENT_RANGE, format!("bytes {start}-{end}/{total}"))
                .body(Body::streaming(reader.take(length)))?
        }
        GetBlobResponse::Redirect(url) => Response::builder()
            .status(StatusCode::TEMPORARY_REDIRECT)
            .header(LOCATION, url)
            .header(DOCKER_CONTENT_DIGEST, digest.to_string())
            .body(Body::empty())?,
    };

    Ok(res)
}

#[instrument(skip(registry))]
pub async fn head_blob(registry: &Registry, namespace: &str, digest: Digest) -> HandlerResult {
    let repository = registry.repository(namespace)?;
    let descriptor = registry.head_blob(&repository, &digest).await?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(DOCKER_CONTENT_DIGEST, descriptor.digest.to_string())
        .header(CONTENT_LENGTH, descriptor.size)
        .body(Body::empty())?)
}

#[instrument(skip(registry))]
pub async fn delete_blob(registry: &Registry, namespace: &str, digest: Digest) -> HandlerResult {
    let repository = registry.repository(namespace)?;
    registry.delete_blob(&repository, &digest).await?;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(Body::empty())?)
}

#[instrument(skip(registry))]
pub async fn start_upload(
    registry: &Registry,
    namespace: &str,
    digest: Option<Digest>,
    mount: Option<Digest>,
    from: Option<String>,
) -> HandlerResult {
    let repository = registry.repository(namespace)?;
    let mount = match (mount, from) {
        (Some(digest), Some(from)) => Some((digest, from)),
        _ => None,
    };

    let res = match registry.start_upload(&repository, mount, digest).await? {
        StartUploadOutcome::Created(descriptor) => Response::builder()
            .status(StatusCode::CREATED)
            .header(LOCATION, format!("/v2/{namespace}/blobs/{}", descriptor.digest))
            .header(DOCKER_CONTENT_DIGEST, descriptor.digest.to_string())
            .body(Body::empty())?,
        StartUploadOutcome::Session { uuid, offset } => Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(LOCATION, format!("/v2/{namespace}/blobs/uploads/{uuid}"))
            .header(RANGE, format!("0-{}", offset.saturating_sub(1)))
            .header(DOCKER_UPLOAD_UUID, uuid)
            .body(Body::empty())?,
    };

    Ok(res)
}

#[instrument(skip(registry))]
pub async fn get_upload(registry: &Registry, namespace: &str, uuid: Uuid) -> HandlerResult {
    let repository = registry.repository(namespace)?;
    let offset = registry.upload_status(&repository, uuid).await?;

    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(LOCATION, format!("/v2/{namespace}/blobs/uploads/{uuid}"))
        .header(RANGE, format!("0-{}", offset.saturating_sub(1)))
        .header(DOCKER_UPLOAD_UUID, uuid.to_string())
        .body(Body::empty())?)
}

#[instrument(skip(registry, request))]
pub async fn patch_upload<B>(
    registry: &Registry,
    request: Request<B>,
    namespace: &str,
    uuid: Uuid,
) -> HandlerResult
where
    B: hyper::body::Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Sync + Send + std::error::Error + 'static,
{
    let repository = registry.repository(namespace)?;
    let start_offset = request.byte_range(CONTENT_RANGE)?.map(|(start, _)| start);

    let offset = registry
        .patch_upload(&repository, uuid, start_offset, request.into_async_read())
        .await?;

    Ok(Response::builder()
        .status(StatusCode::ACCEPTED)
        .header(LOCATION, format!("/v2/{namespace}/blobs/uploads/{uuid}"))
        .header(RANGE, format!("0-{}", offset.saturating_sub(1)))
        .header(CONTENT_LENGTH, 0)
        .header(DOCKER_UPLOAD_UUID, uuid.to_string())
        .body(Body::empty())?)
}

#[instrument(skip(registry, request))]
pub async fn put_upload<B>(
    registry: &Registry,
    request: Request<B>,
    namespace: &str,
    uuid: Uuid,
    digest: Digest,
) -> HandlerResult
where
    B: hyper::body::Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Sync + Send + std::error::Error + 'static,
{
    let repository = registry.repository(namespace)?;
    registry
        .complete_upload(&repository, uuid, &digest, request.into_async_read())
        .await?;

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(LOCATION, format!("/v2/{namespace}/blobs/{digest}"))
        .header(DOCKER_CONTENT_DIGEST, digest.to_string())
        .body(Body::empty())?)
}

#[instrument(skip(registry))]
pub async fn delete_upload(registry: &Registry, namespace: &str, uuid: Uuid) -> HandlerResult {
    let repository = registry.repository(namespace)?;
    registry.cancel_upload(&repository, uuid).await?;

    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())?)
}
