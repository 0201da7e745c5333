use std::str::FromStr;

use hyper::{Method, Uri};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

use super::route::Route;
use crate::oci::{Digest, Reference};

fn parse_query<T: DeserializeOwned + Default>(params: &str) -> T {
    serde_urlencoded::from_str(params).unwrap_or_default()
}

#[derive(Deserialize, Default)]
struct UploadQuery {
    digest: Option<String>,
    mount: Option<String>,
    from: Option<String>,
}

#[derive(Deserialize, Default)]
struct PaginationQuery {
    n: Option<usize>,
    last: Option<String>,
}

pub fn parse<'a>(method: &Method, uri: &'a Uri) -> Route<'a> {
    let path = uri.path();
    let params = uri.query();

    match path {
        "/healthz" if method == Method::GET => return Route::Healthz,
        "/v2" | "/v2/" if method == Method::GET || method == Method::HEAD => {
            return Route::ApiVersion;
        }
        "/v2/_catalog" if method == Method::GET => {
            let query = params.map(parse_query::<PaginationQuery>).unwrap_or_default();
            return Route::ListCatalog {
                n: query.n,
                last: query.last,
            };
        }
        _ => {}
    }

    let Some(path) = path.strip_prefix("/v2/") else {
        return Route::Unknown;
    };

    if let Some(route) = try_parse_uploads(method, path, params) {
        return route;
    }
    if let Some(route) = try_parse_upload(method, path, params) {
        return route;
    }
    if let Some(route) = try_parse_blobs(method, path) {
        return route;
    }
    if let Some(route) = try_parse_manifests(method, path) {
        return route;
    }
    if let Some(route) = try_parse_tags(method, path, params) {
        return route;
    }

    Route::Unknown
}

fn try_parse_uploads<'a>(
    method: &Method,
    path: &'a str,
    params: Option<&'a str>,
) -> Option<Route<'a>> {
    for suffix in ["/blobs/uploads", "/blobs/uploads/"] {
        if let Some(namespace) = path.strip_suffix(suffix) {
            if method == Method::POST {
                let query = params.map(parse_query::<UploadQuery>).unwrap_or_default();
                return Some(Route::StartUpload {
                    namespace,
                    digest: query.digest.as_deref().and_then(|d| d.parse().ok()),
                    mount: query.mount.as_deref().and_then(|d| d.parse().ok()),
                    from: query.from,
                });
            }
        }
    }

    None
}

fn try_parse_upload<'a>(
    method: &Method,
    path: &'a str,
    params: Option<&'a str>,
) -> Option<Route<'a>> {
    let upload_position = path.rfind("/blobs/uploads/")?;
    let namespace = &path[..upload_position];
    let uuid = &path[upload_position + "/blobs/uploads/".len()..];
    let uuid = Uuid::from_str(uuid).ok()?;

    match *method {
        Method::GET => Some(Route::GetUpload { namespace, uuid }),
        Method::PATCH => Some(Route::PatchUpload { namespace, uuid }),
        Method::PUT => {
            let digest = params
                .map(parse_query::<UploadQuery>)
                .and_then(|query| query.digest)
                .and_then(|digest| digest.parse().ok())?;
            Some(Route::PutUpload {
                namespace,
                uuid,
                digest,
            })
        }
        Method::DELETE => Some(Route::DeleteUpload { namespace, uuid }),
        _ => None,
    }
}

fn try_parse_blobs<'a>(method: &Method, path: &'a str) -> Option<Route<'a>> {
    let blob_position = path.rfind("/blobs/")?;
    let namespace = &path[..blob_position];
    let digest = Digest::try_from(&path[blob_position + "/blobs/".len()..]).ok()?;

    match *method {
        Method::GET => Some(Route::GetBlob { namespace, digest }),
        Method::HEAD => Some(Route::HeadBlob { namespace, digest }),
        Method::DELETE => Some(Route::DeleteBlob { namespace, digest }),
        _ => None,
    }
}

fn try_parse_manifests<'a>(method: &Method, path: &'a str) -> Option<Route<'a>> {
    let manifest_position = path.rfind("/manifests/")?;
    let namespace = &path[..manifest_position];
    let reference = Reference::try_from(&path[manifest_position + "/manifests/".len()..]).ok()?;

    match *method {
        Method::GET => Some(Route::GetManifest {
            namespace,
            reference,
        }),
        Method::HEAD => Some(Route::HeadManifest {
            namespace,
            reference,
        }),
        Method::PUT => Some(Route::PutManifest {
            namespace,
            reference,
        }),
        Method::DELETE => Some(Route::DeleteManifest {
            namespace,
            reference,
        }),
        _ => None,
    }
}

fn try_parse_tags<'a>(method: &Method, path: &'a str, params: Option<&'a str>) -> Option<Route<'a>> {
    let namespace = path.strip_suffix("/tags/list")?;
    if method != Method::GET {
        return None;
    }

    let query = params.map(parse_query::<PaginationQuery>).unwrap_or_default();
    Some(Route::ListTags {
        namespace,
        n: query.n,
        last: query.last,
    })
}
