pub mod auth;
mod handlers;
mod request_ext;
mod response;
mod route;
mod router;

use hyper::header::{HeaderValue, RANGE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, instrument};

pub use auth::{build_access_controller, AccessController};
pub use response::Body;

use crate::configuration::ServerConfig;
use crate::registry::{Error, Registry};
use auth::AuthError;
use request_ext::RequestExt;
use response::{API_VERSION, API_VERSION_HEADER};
use route::Route;

pub struct ServerState {
    pub registry: Arc<Registry>,
    pub access: Arc<dyn AccessController>,
}

pub async fn serve(config: &ServerConfig, state: Arc<ServerState>) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
    info!("Listening on {}:{}", config.bind_address, config.port);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let service =
                service_fn(move |request| handle_request(state.clone(), request));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Connection error: {e}");
            }
        });
    }
}

pub async fn handle_request<B>(
    state: Arc<ServerState>,
    request: Request<B>,
) -> Result<Response<Body>, Infallible>
where
    B: hyper::body::Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Sync + Send + std::error::Error + 'static,
{
    let start = std::time::Instant::now();
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let mut response = match dispatch(&state, request).await {
        Ok(response) => response,
        Err(e) => response::error_response(&e),
    };

    response
        .headers_mut()
        .insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));

    let status = response.status();
    let elapsed = start.elapsed();
    if status.is_server_error() {
        error!("{status} {elapsed:?} {method} {path}");
    } else {
        info!("{status} {elapsed:?} {method} {path}");
    }

    Ok(response)
}

#[instrument(skip(state, request))]
async fn dispatch<B>(
    state: &ServerState,
    request: Request<B>,
) -> Result<Response<Body>, Error>
where
    B: hyper::body::Body + Send + Unpin + 'static,
    B::Data: Send,
    B::Error: Sync + Send + std::error::Error + 'static,
{
    let uri = request.uri().clone();
    let method = request.method().clone();
    let route = router::parse(&method, &uri);

    if let Route::Healthz = route {
        return handlers::healthz();
    }

    let credentials = request.basic_credentials();
    let access = auth::required_access(&route);
    match state.access.authorize(credentials, &access).await {
        Ok(_grant) => {}
        Err(AuthError::Challenge(header)) => return Ok(response::challenge_response(&header)),
        Err(AuthError::Denied) => return Err(Error::Denied),
        Err(AuthError::Configuration) => return Err(Error::AuthControllerFailure),
    }

    let registry = &state.registry;
    match route {
        Route::Healthz => unreachable!(),
        Route::ApiVersion => handlers::api_version(),
        Route::ListCatalog { n, last } => handlers::list_catalog(registry, n, last).await,
        Route::ListTags { namespace, n, last } => {
            handlers::list_tags(registry, namespace, n, last).await
        }
        Route::GetManifest {
            namespace,
            reference,
        } => {
            let accept = request.accepted_media_types();
            handlers::get_manifest(registry, namespace, reference, &accept).await
        }
        Route::HeadManifest {
            namespace,
            reference,
        } => {
            let accept = request.accepted_media_types();
            handlers::head_manifest(registry, namespace, reference, &accept).await
        }
        Route::PutManifest {
            namespace,
            reference,
        } => handlers::put_manifest(registry, request, namespace, reference).await,
        Route::DeleteManifest {
            namespace,
            reference,
        } => handlers::delete_manifest(registry, namespace, reference).await,
        Route::GetBlob { namespace, digest } => {
            let range = request.byte_range(RANGE)?;
            handlers::get_blob(registry, namespace, digest, range).await
        }
        Route::HeadBlob { namespace, digest } => {
            handlers::head_blob(registry, namespace, digest).await
        }
        Route::DeleteBlob { namespace, digest } => {
            handlers::delete_blob(registry, namespace, digest).await
        }
        Route::StartUpload {
            namespace,
            digest,
            mount,
            from,
        } => handlers::start_upload(registry, namespace, digest, mount, from).await,
        Route::GetUpload { namespace, uuid } => {
            handlers::get_upload(registry, namespace, uuid).await
        }
        Route::PatchUpload { namespace, uuid } => {
            handlers::patch_upload(registry, request, namespace, uuid).await
        }
        Route::PutUpload {
            namespace,
            uuid,
            digest,
        } => handlers::put_upload(registry, request, namespace, uuid, digest).await,
        Route::DeleteUpload { namespace, uuid } => {
            handlers::delete_upload(registry, namespace, uuid).await
        }
        Route::Unknown => Err(Error::NotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::Configuration;
    use crate::oci::media_types;
    use crate::registry::tests::{test_registry, test_registry_with};
    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::{Method, StatusCode};
    use serde_json::Value;

    const EMPTY_DIGEST: &str =
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn state(registry: Registry) -> Arc<ServerState> {
        Arc::new(ServerState {
            registry: Arc::new(registry),
            access: Arc::new(auth::AllowAll),
        })
    }

    fn request(method: Method, uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn request_with_body(method: Method, uri: &str, body: Vec<u8>) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(Bytes::from(body)))
            .unwrap()
    }

    async fn send(
        state: &Arc<ServerState>,
        request: Request<Full<Bytes>>,
    ) -> Response<Body> {
        handle_request(state.clone(), request).await.unwrap()
    }

    async fn body_bytes(response: Response<Body>) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    fn header(response: &Response<Body>, name: &str) -> String {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    #[tokio::test]
    async fn test_api_version_endpoint() {
        let state = state(test_registry());
        let response = send(&state, request(Method::GET, "/v2/")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            header(&response, API_VERSION_HEADER),
            "registry/2.0"
        );
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let state = state(test_registry());
        let response = send(&state, request(Method::GET, "/v3/whatever")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(header(&response, API_VERSION_HEADER), "registry/2.0");
    }

    #[tokio::test]
    async fn test_single_chunk_blob_upload() {
        let state = state(test_registry());

        // POST a new session
        let response = send(
            &state,
            request(Method::POST, "/v2/alice/app/blobs/uploads/"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let uuid = header(&response, "Docker-Upload-UUID");
        assert!(!uuid.is_empty());
        let location = header(&response, "Location");
        assert_eq!(location, format!("/v2/alice/app/blobs/uploads/{uuid}"));

        // PUT the (empty) body with the digest
        let response = send(
            &state,
            request(
                Method::PUT,
                &format!("/v2/alice/app/blobs/uploads/{uuid}?digest={EMPTY_DIGEST}"),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            header(&response, "Location"),
            format!("/v2/alice/app/blobs/{EMPTY_DIGEST}")
        );
        assert_eq!(header(&response, "Docker-Content-Digest"), EMPTY_DIGEST);

        // HEAD the published blob
        let response = send(
            &state,
            request(
                Method::HEAD,
                &format!("/v2/alice/app/blobs/{EMPTY_DIGEST}"),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "Content-Length"), "0");
    }

    #[tokio::test]
    async fn test_cross_repo_mount() {
        let state = state(test_registry());

        // publish the empty blob in alice/app
        let response = send(
            &state,
            request(Method::POST, "/v2/alice/app/blobs/uploads/"),
        )
        .await;
        let uuid = header(&response, "Docker-Upload-UUID");
        send(
            &state,
            request(
                Method::PUT,
                &format!("/v2/alice/app/blobs/uploads/{uuid}?digest={EMPTY_DIGEST}"),
            ),
        )
        .await;

        // mount into bob/app
        let response = send(
            &state,
            request(
                Method::POST,
                &format!("/v2/bob/app/blobs/uploads/?mount={EMPTY_DIGEST}&from=alice/app"),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            header(&response, "Location"),
            format!("/v2/bob/app/blobs/{EMPTY_DIGEST}")
        );

        let response = send(
            &state,
            request(Method::GET, &format!("/v2/bob/app/blobs/{EMPTY_DIGEST}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_manifest_put_with_missing_layer() {
        let state = state(test_registry());

        let manifest = crate::oci::manifest::tests::image_manifest_json();
        let mut request = request_with_body(
            Method::PUT,
            "/v2/alice/app/manifests/latest",
            manifest,
        );
        request.headers_mut().insert(
            "Content-Type",
            HeaderValue::from_static(media_types::DOCKER_MANIFEST),
        );

        let response = send(&state, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(value["errors"][0]["code"], "MANIFEST_BLOB_UNKNOWN");
        assert_eq!(
            value["errors"][0]["detail"]["digest"],
            crate::oci::manifest::tests::CONFIG_DIGEST
        );
    }

    #[tokio::test]
    async fn test_bad_upload_range() {
        let state = state(test_registry());

        let response = send(
            &state,
            request(Method::POST, "/v2/alice/app/blobs/uploads/"),
        )
        .await;
        let uuid = header(&response, "Docker-Upload-UUID");

        // 100 bytes at offset 0
        let mut patch = request_with_body(
            Method::PATCH,
            &format!("/v2/alice/app/blobs/uploads/{uuid}"),
            vec![0u8; 100],
        );
        patch
            .headers_mut()
            .insert("Content-Range", HeaderValue::from_static("0-99"));
        let response = send(&state, patch).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(header(&response, "Range"), "0-99");

        // wrong offset
        let mut patch = request_with_body(
            Method::PATCH,
            &format!("/v2/alice/app/blobs/uploads/{uuid}"),
            vec![0u8; 100],
        );
        patch
            .headers_mut()
            .insert("Content-Range", HeaderValue::from_static("50-149"));
        let response = send(&state, patch).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);

        let value: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(value["errors"][0]["code"], "BLOB_UPLOAD_INVALID");

        // session offset unchanged
        let response = send(
            &state,
            request(
                Method::GET,
                &format!("/v2/alice/app/blobs/uploads/{uuid}"),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&response, "Range"), "0-99");
    }

    #[tokio::test]
    async fn test_read_only_mode() {
        let mut config = Configuration::default();
        config.storage.readonly.enabled = true;
        let state = state(test_registry_with(config));

        let response = send(
            &state,
            request(Method::POST, "/v2/alice/app/blobs/uploads/"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let value: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(value["errors"][0]["code"], "UNSUPPORTED");

        // reads still work
        let response = send(&state, request(Method::GET, "/v2/")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_catalog_and_tags_listing() {
        let state = state(test_registry());

        // publish the empty blob and a manifest-free listing baseline
        let response = send(
            &state,
            request(Method::POST, "/v2/alice/app/blobs/uploads/"),
        )
        .await;
        let uuid = header(&response, "Docker-Upload-UUID");
        send(
            &state,
            request(
                Method::PUT,
                &format!("/v2/alice/app/blobs/uploads/{uuid}?digest={EMPTY_DIGEST}"),
            ),
        )
        .await;

        let response = send(&state, request(Method::GET, "/v2/_catalog")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(value["repositories"][0], "alice/app");

        let response = send(
            &state,
            request(Method::GET, "/v2/alice/app/tags/list"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(value["name"], "alice/app");
        assert_eq!(value["tags"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_invalid_repository_name() {
        let state = state(test_registry());
        let response = send(
            &state,
            request(Method::GET, "/v2/UPPER/tags/list"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(value["errors"][0]["code"], "NAME_INVALID");
    }

    #[tokio::test]
    async fn test_basic_auth_gate() {
        use argon2::password_hash::{rand_core::OsRng, SaltString};
        use argon2::{Argon2, PasswordHasher};
        use base64::prelude::BASE64_STANDARD;
        use base64::Engine;

        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(b"hunter2", &salt)
            .unwrap()
            .to_string();

        let mut config = Configuration::default();
        config.auth.identity.insert(
            "admin".to_string(),
            crate::configuration::IdentityConfig {
                username: "admin".to_string(),
                password_hash: hash,
            },
        );

        let access = build_access_controller(&config.auth);
        let state = Arc::new(ServerState {
            registry: Arc::new(test_registry_with(config)),
            access,
        });

        // anonymous is challenged
        let response = send(&state, request(Method::GET, "/v2/")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(header(&response, "WWW-Authenticate").starts_with("Basic "));

        // valid credentials pass
        let credentials = BASE64_STANDARD.encode("admin:hunter2");
        let mut authed = request(Method::GET, "/v2/");
        authed.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Basic {credentials}")).unwrap(),
        );
        let response = send(&state, authed).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_blob_range_request() {
        let state = state(test_registry());

        // upload a 10-byte blob
        let content = b"0123456789".to_vec();
        let digest = crate::registry::hashing_reader::sha256_digest(&content);
        let response = send(
            &state,
            request(Method::POST, "/v2/alice/app/blobs/uploads/"),
        )
        .await;
        let uuid = header(&response, "Docker-Upload-UUID");
        let response = send(
            &state,
            request_with_body(
                Method::PUT,
                &format!("/v2/alice/app/blobs/uploads/{uuid}?digest={digest}"),
                content,
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let mut ranged = request(
            Method::GET,
            &format!("/v2/alice/app/blobs/{digest}"),
        );
        ranged
            .headers_mut()
            .insert("Range", HeaderValue::from_static("bytes=2-5"));
        let response = send(&state, ranged).await;

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&response, "Content-Range"), "bytes 2-5/10");
        assert_eq!(body_bytes(response).await, b"2345");
    }

    #[tokio::test]
    async fn test_redirect_when_driver_offers_signed_urls() {
        use crate::cache::memory::MemoryCache;
        use crate::driver::MemoryDriver;
        use crate::notify::Broadcaster;

        let driver = Arc::new(MemoryDriver::with_redirect_base("https://cdn.example.com"));
        let cache = Arc::new(MemoryCache::new(100));
        let registry = Registry::new(
            &Configuration::default(),
            driver,
            cache,
            None,
            Broadcaster::disabled(),
        )
        .unwrap();
        let state = state(registry);

        let content = b"redirected".to_vec();
        let digest = crate::registry::hashing_reader::sha256_digest(&content);
        let response = send(
            &state,
            request(Method::POST, "/v2/alice/app/blobs/uploads/"),
        )
        .await;
        let uuid = header(&response, "Docker-Upload-UUID");
        send(
            &state,
            request_with_body(
                Method::PUT,
                &format!("/v2/alice/app/blobs/uploads/{uuid}?digest={digest}"),
                content,
            ),
        )
        .await;

        let response = send(
            &state,
            request(Method::GET, &format!("/v2/alice/app/blobs/{digest}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert!(header(&response, "Location").starts_with("https://cdn.example.com/"));
    }

    #[tokio::test]
    async fn test_healthz_skips_auth() {
        let mut config = Configuration::default();
        config.auth.identity.insert(
            "admin".to_string(),
            crate::configuration::IdentityConfig {
                username: "admin".to_string(),
                password_hash: "$argon2id$v=19$m=19456,t=2,p=1$bm90YXNhbHQ$notahash".to_string(),
            },
        );
        let access = build_access_controller(&config.auth);
        let state = Arc::new(ServerState {
            registry: Arc::new(test_registry_with(config)),
            access,
        });

        let response = send(&state, request(Method::GET, "/healthz")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}
