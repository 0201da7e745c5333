use crate::oci::Digest;

use super::links::LinkKind;

// The on-disk layout is fixed for compatibility with existing
// deployments; every function here must stay bit-exact.

pub const ROOT: &str = "/docker/registry/v2";

pub fn blobs_root_dir() -> String {
    format!("{ROOT}/blobs")
}

pub fn blob_container_dir(digest: &Digest) -> String {
    format!(
        "{}/{}/{}/{}",
        blobs_root_dir(),
        digest.algorithm(),
        digest.hash_prefix(),
        digest.hash()
    )
}

pub fn blob_data_path(digest: &Digest) -> String {
    format!("{}/data", blob_container_dir(digest))
}

pub fn repositories_root_dir() -> String {
    format!("{ROOT}/repositories")
}

pub fn repository_dir(name: &str) -> String {
    format!("{}/{name}", repositories_root_dir())
}

pub fn layer_link_path(name: &str, digest: &Digest) -> String {
    format!(
        "{}/_layers/{}/{}/link",
        repository_dir(name),
        digest.algorithm(),
        digest.hash()
    )
}

pub fn manifests_root_dir(name: &str) -> String {
    format!("{}/_manifests", repository_dir(name))
}

pub fn manifest_revision_link_path(name: &str, digest: &Digest) -> String {
    format!(
        "{}/revisions/{}/{}/link",
        manifests_root_dir(name),
        digest.algorithm(),
        digest.hash()
    )
}

pub fn tags_dir(name: &str) -> String {
    format!("{}/tags", manifests_root_dir(name))
}

pub fn tag_dir(name: &str, tag: &str) -> String {
    format!("{}/{tag}", tags_dir(name))
}

pub fn tag_current_link_path(name: &str, tag: &str) -> String {
    format!("{}/current/link", tag_dir(name, tag))
}

pub fn tag_index_link_path(name: &str, tag: &str, digest: &Digest) -> String {
    format!(
        "{}/index/{}/{}/link",
        tag_dir(name, tag),
        digest.algorithm(),
        digest.hash()
    )
}

pub fn uploads_root_dir(name: &str) -> String {
    format!("{}/_uploads", repository_dir(name))
}

pub fn upload_container_dir(name: &str, uuid: &str) -> String {
    format!("{}/{uuid}", uploads_root_dir(name))
}

pub fn upload_data_path(name: &str, uuid: &str) -> String {
    format!("{}/data", upload_container_dir(name, uuid))
}

pub fn upload_startedat_path(name: &str, uuid: &str) -> String {
    format!("{}/startedat", upload_container_dir(name, uuid))
}

pub fn upload_uuid_path(name: &str, uuid: &str) -> String {
    format!("{}/uuid", upload_container_dir(name, uuid))
}

pub fn upload_hashstate_path(name: &str, uuid: &str, algorithm: &str, offset: u64) -> String {
    format!(
        "{}/hashstates/{algorithm}/{offset}",
        upload_container_dir(name, uuid)
    )
}

pub fn link_path(name: &str, link: &LinkKind) -> String {
    match link {
        LinkKind::Layer(digest) => layer_link_path(name, digest),
        LinkKind::Revision(digest) => manifest_revision_link_path(name, digest),
        LinkKind::Tag(tag) => tag_current_link_path(name, tag),
        LinkKind::TagIndex(tag, digest) => tag_index_link_path(name, tag, digest),
    }
}
