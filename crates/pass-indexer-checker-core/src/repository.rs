//! PASS resource repository access.
//!
//! Writes go to Fedora over its LDP REST API. Lookups go through the
//! Elasticsearch index, which is exactly the propagation path the round-trip
//! check exercises.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{FedoraConfig, HttpConfig};
use crate::error::{RepositoryError, Result};
use crate::index::{IndexClient, endpoint, http_client, parse_base_url};

/// JSON-LD context attached to every PASS resource.
pub const PASS_CONTEXT: &str =
    "https://oa-pass.github.io/pass-data-model/src/main/resources/context-3.4.jsonld";

const LD_JSON: &str = "application/ld+json";

/// Future returned by [`Repository`] methods.
pub type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Repository-assigned resource URI.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource types the checker touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    User,
}

impl ResourceKind {
    /// Value of the `@type` field in the index.
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::User => "User",
        }
    }

    /// Fedora container holding resources of this kind.
    #[must_use]
    pub const fn container(self) -> &'static str {
        match self {
            Self::User => "users",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Submitter,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Submitter => "submitter",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PASS `User` as sent to the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Empty until the repository assigns one.
    #[serde(rename = "@id", default)]
    pub id: String,

    #[serde(rename = "@type")]
    pub kind: String,

    #[serde(rename = "@context")]
    pub context: String,

    pub first_name: String,

    pub last_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locator_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<Role>,
}

impl User {
    #[must_use]
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind: ResourceKind::User.type_name().to_string(),
            context: PASS_CONTEXT.to_string(),
            first_name: first_name.into(),
            last_name: last_name.into(),
            locator_ids: Vec::new(),
            roles: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_locator_id(mut self, locator_id: impl Into<String>) -> Self {
        self.locator_ids.push(locator_id.into());
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }
}

/// Resource store with index-backed lookups.
pub trait Repository: Send + Sync {
    /// Create `user`, returning the assigned id if the repository reported one.
    fn create<'a>(&'a self, user: &'a User) -> RepoFuture<'a, Option<ResourceId>>;

    fn delete<'a>(&'a self, id: &'a ResourceId) -> RepoFuture<'a, ()>;

    /// The single resource of `kind` whose `attribute` equals `value`.
    ///
    /// More than one match is an error.
    fn find_by_attribute<'a>(
        &'a self,
        kind: ResourceKind,
        attribute: &'a str,
        value: &'a str,
    ) -> RepoFuture<'a, Option<ResourceId>>;

    /// Every resource of `kind` whose `attribute` equals `value`.
    fn find_all_by_attribute<'a>(
        &'a self,
        kind: ResourceKind,
        attribute: &'a str,
        value: &'a str,
    ) -> RepoFuture<'a, BTreeSet<ResourceId>>;
}

/// Fedora-backed repository searched through Elasticsearch.
pub struct PassRepository {
    http: reqwest::Client,
    base: Url,
    user: String,
    password: String,
    index: IndexClient,
}

impl fmt::Debug for PassRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassRepository")
            .field("base", &self.base.as_str())
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("index", &self.index)
            .finish()
    }
}

impl PassRepository {
    pub fn new(fedora: &FedoraConfig, http: &HttpConfig, index: IndexClient) -> Result<Self> {
        Ok(Self {
            http: http_client(http)?,
            base: parse_base_url("pass.fedora.baseurl", &fedora.baseurl)?,
            user: fedora.user.clone(),
            password: fedora.password.clone(),
            index,
        })
    }

    #[must_use]
    pub fn container_url(&self, kind: ResourceKind) -> Url {
        endpoint(&self.base, &[kind.container()])
    }

    async fn send(&self, method: Method, url: &Url, body: Option<Vec<u8>>) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method, url.clone())
            .basic_auth(&self.user, Some(&self.password));
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, LD_JSON)
                .header("Prefer", "handling=lenient; received=\"minimal\"")
                .body(body);
        }
        request.send().await.map_err(|source| {
            RepositoryError::Request {
                url: url.to_string(),
                source,
            }
            .into()
        })
    }

    async fn create_user(&self, user: &User) -> Result<Option<ResourceId>> {
        let url = self.container_url(ResourceKind::User);
        let body = serde_json::to_vec(user)?;
        let response = self.send(Method::POST, &url, Some(body)).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error("POST", &url, status));
        }

        let Some(location) = response.headers().get(LOCATION) else {
            debug!(url = %url, "Create succeeded without a Location header");
            return Ok(None);
        };
        let location = location
            .to_str()
            .map_err(|_| RepositoryError::InvalidId(format!("{location:?}")))?;
        let id = url
            .join(location)
            .map_err(|_| RepositoryError::InvalidId(location.to_string()))?;
        info!(id = %id, "Created resource");
        Ok(Some(ResourceId::new(id)))
    }

    async fn delete_resource(&self, id: &ResourceId) -> Result<()> {
        let url = Url::parse(id.as_str())
            .map_err(|_| RepositoryError::InvalidId(id.to_string()))?;
        if url.cannot_be_a_base() {
            return Err(RepositoryError::InvalidId(id.to_string()).into());
        }

        let status = self.send(Method::DELETE, &url, None).await?.status();
        if is_gone(status) {
            debug!(id = %id, status = status.as_u16(), "Resource already deleted");
        } else if !status.is_success() {
            return Err(status_error("DELETE", &url, status));
        }

        // The tombstone keeps the path reserved until it is removed as well.
        let tombstone = endpoint(&url, &["fcr:tombstone"]);
        let status = self.send(Method::DELETE, &tombstone, None).await?.status();
        if !status.is_success() && !is_gone(status) {
            return Err(status_error("DELETE", &tombstone, status));
        }
        info!(id = %id, "Deleted resource");
        Ok(())
    }

    async fn find_one(
        &self,
        kind: ResourceKind,
        attribute: &str,
        value: &str,
    ) -> Result<Option<ResourceId>> {
        let size = self.index.limit().max(2);
        let ids = self
            .index
            .search_ids(kind.type_name(), attribute, value, 0, size)
            .await?;
        match ids.as_slice() {
            [] => Ok(None),
            [id] => Ok(Some(ResourceId::new(id.clone()))),
            _ => Err(RepositoryError::AmbiguousMatch {
                kind: kind.to_string(),
                attribute: attribute.to_string(),
                value: value.to_string(),
                count: ids.len(),
            }
            .into()),
        }
    }

    async fn find_all(
        &self,
        kind: ResourceKind,
        attribute: &str,
        value: &str,
    ) -> Result<BTreeSet<ResourceId>> {
        let limit = self.index.limit().max(1);
        let mut found = BTreeSet::new();
        let mut from = 0;
        loop {
            let page = self
                .index
                .search_ids(kind.type_name(), attribute, value, from, limit)
                .await?;
            let page_len = page.len();
            found.extend(page.into_iter().map(ResourceId::new));
            if page_len < limit {
                break;
            }
            from += limit;
        }
        debug!(%kind, attribute, value, count = found.len(), "Collected matches");
        Ok(found)
    }
}

impl Repository for PassRepository {
    fn create<'a>(&'a self, user: &'a User) -> RepoFuture<'a, Option<ResourceId>> {
        Box::pin(self.create_user(user))
    }

    fn delete<'a>(&'a self, id: &'a ResourceId) -> RepoFuture<'a, ()> {
        Box::pin(self.delete_resource(id))
    }

    fn find_by_attribute<'a>(
        &'a self,
        kind: ResourceKind,
        attribute: &'a str,
        value: &'a str,
    ) -> RepoFuture<'a, Option<ResourceId>> {
        Box::pin(self.find_one(kind, attribute, value))
    }

    fn find_all_by_attribute<'a>(
        &'a self,
        kind: ResourceKind,
        attribute: &'a str,
        value: &'a str,
    ) -> RepoFuture<'a, BTreeSet<ResourceId>> {
        Box::pin(self.find_all(kind, attribute, value))
    }
}

fn is_gone(status: StatusCode) -> bool {
    matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE)
}

fn status_error(method: &str, url: &Url, status: StatusCode) -> crate::error::Error {
    RepositoryError::Status {
        method: method.to_string(),
        url: url.to_string(),
        status: status.as_u16(),
    }
    .into()
}
