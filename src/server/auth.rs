use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::route::Route;
use crate::configuration::AuthConfig;

/// What a route needs: a named resource and an action on it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Access {
    pub resource: Resource,
    pub action: Action,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Resource {
    Repository(String),
    Catalog,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    Pull,
    Push,
    Delete,
    All,
}

impl Access {
    fn repository(name: &str, action: Action) -> Self {
        Access {
            resource: Resource::Repository(name.to_string()),
            action,
        }
    }
}

/// Access records required for a parsed route: reads need `pull`,
/// writes `pull`+`push`, deletes `delete`; a cross-repository mount
/// additionally needs `pull` on the source; the catalog needs the
/// registry-wide wildcard.
pub fn required_access(route: &Route) -> Vec<Access> {
    match route {
        Route::ApiVersion | Route::Healthz | Route::Unknown => Vec::new(),

        Route::ListCatalog { .. } => vec![Access {
            resource: Resource::Catalog,
            action: Action::All,
        }],

        Route::ListTags { namespace, .. }
        | Route::GetManifest { namespace, .. }
        | Route::HeadManifest { namespace, .. }
        | Route::GetBlob { namespace, .. }
        | Route::HeadBlob { namespace, .. }
        | Route::GetUpload { namespace, .. } => {
            vec![Access::repository(namespace, Action::Pull)]
        }

        Route::PutManifest { namespace, .. }
        | Route::PatchUpload { namespace, .. }
        | Route::PutUpload { namespace, .. } => vec![
            Access::repository(namespace, Action::Pull),
            Access::repository(namespace, Action::Push),
        ],

        Route::StartUpload {
            namespace, from, ..
        } => {
            let mut access = vec![
                Access::repository(namespace, Action::Pull),
                Access::repository(namespace, Action::Push),
            ];
            if let Some(from) = from {
                access.push(Access::repository(from, Action::Pull));
            }
            access
        }

        Route::DeleteManifest { namespace, .. }
        | Route::DeleteBlob { namespace, .. }
        | Route::DeleteUpload { namespace, .. } => {
            vec![Access::repository(namespace, Action::Delete)]
        }
    }
}

pub struct Grant {
    pub subject: Option<String>,
}

pub enum AuthError {
    /// The client must authenticate; carries the `WWW-Authenticate`
    /// header value to emit with the 401.
    Challenge(String),
    /// Authenticated but not allowed.
    Denied,
    /// Controller misconfiguration; surfaces as a bare 400 so nothing
    /// about the configuration leaks.
    Configuration,
}

/// The authorization gate consulted before every dispatched operation.
#[async_trait]
pub trait AccessController: Send + Sync {
    async fn authorize(
        &self,
        credentials: Option<(String, String)>,
        access: &[Access],
    ) -> Result<Grant, AuthError>;
}

/// Grants everything to everyone; the controller used when no
/// identities are configured.
pub struct AllowAll;

#[async_trait]
impl AccessController for AllowAll {
    async fn authorize(
        &self,
        credentials: Option<(String, String)>,
        _access: &[Access],
    ) -> Result<Grant, AuthError> {
        Ok(Grant {
            subject: credentials.map(|(username, _)| username),
        })
    }
}

/// HTTP Basic access controller over the configured identity table.
/// Passwords are stored as argon2 PHC strings; a valid identity is
/// granted every action.
pub struct BasicAccessController {
    realm: String,
    // username -> (identity id, password hash)
    identities: HashMap<String, (String, String)>,
}

impl BasicAccessController {
    pub fn new(config: &AuthConfig) -> Self {
        let identities = config
            .identity
            .iter()
            .map(|(id, identity)| {
                (
                    identity.username.clone(),
                    (id.clone(), identity.password_hash.clone()),
                )
            })
            .collect();

        BasicAccessController {
            realm: config.realm.clone(),
            identities,
        }
    }

    fn challenge(&self) -> AuthError {
        AuthError::Challenge(format!("Basic realm=\"{}\", charset=\"UTF-8\"", self.realm))
    }
}

#[async_trait]
impl AccessController for BasicAccessController {
    async fn authorize(
        &self,
        credentials: Option<(String, String)>,
        _access: &[Access],
    ) -> Result<Grant, AuthError> {
        let Some((username, password)) = credentials else {
            return Err(self.challenge());
        };

        let Some((identity_id, password_hash)) = self.identities.get(&username) else {
            debug!("Unknown user {username}");
            return Err(self.challenge());
        };

        let parsed_hash = PasswordHash::new(password_hash).map_err(|e| {
            warn!("Unparseable password hash for {username}: {e}");
            AuthError::Configuration
        })?;

        if Argon2::default()
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_err()
        {
            debug!("Password verification failed for {username}");
            return Err(self.challenge());
        }

        Ok(Grant {
            subject: Some(identity_id.clone()),
        })
    }
}

pub fn build_access_controller(config: &AuthConfig) -> Arc<dyn AccessController> {
    if config.identity.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(BasicAccessController::new(config))
    }
}
