//! Elasticsearch read access.
//!
//! [`IndexClient`] reads the index mapping and runs the attribute searches the
//! repository uses for its lookups. The base URL is validated when the
//! client is built, so a bad `pass.elasticsearch.url` fails before any
//! network traffic.

use std::future::Future;
use std::pin::Pin;

use reqwest::{Method, Url};
use serde_json::{Value, json};
use tracing::{debug, trace};

use crate::config::{ElasticsearchConfig, HttpConfig};
use crate::error::{CheckError, ConfigError, IndexError, Result};

/// Future returned by [`MappingSource`] methods.
pub type IndexFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Anything that can serve the index mapping document.
pub trait MappingSource: Send + Sync {
    /// Name of the index whose mapping is served.
    fn index_name(&self) -> &str;

    /// Fetch the raw mapping document.
    fn fetch_mapping(&self) -> IndexFuture<'_, Value>;
}

/// Parse and validate a service base URL taken from configuration key `key`.
pub fn parse_base_url(key: &str, raw: &str) -> Result<Url> {
    let invalid = |reason: &str| ConfigError::InvalidUrl {
        key: key.to_string(),
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty").into());
    }
    let url = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https").into());
    }
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(invalid("not a base URL").into());
    }
    Ok(url)
}

/// Append path segments to `base`, ignoring any trailing slash on it.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Build the HTTP client shared by the index and repository adapters.
pub(crate) fn http_client(config: &HttpConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout())
        .user_agent(concat!("pass-indexer-checker/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| IndexError::Client(e.to_string()).into())
}

/// Count the properties of `<index>.mappings._doc.properties` in a mapping document.
pub fn mapping_property_count(
    doc: &Value,
    index: &str,
) -> std::result::Result<usize, CheckError> {
    let mut node = doc;
    let mut path = String::new();
    for segment in [index, "mappings", "_doc", "properties"] {
        if !path.is_empty() {
            path.push('.');
        }
        path.push_str(segment);
        node = node
            .get(segment)
            .ok_or_else(|| CheckError::MappingPathMissing { path: path.clone() })?;
    }
    node.as_object()
        .map(serde_json::Map::len)
        .ok_or(CheckError::MappingPathMissing { path })
}

/// Elasticsearch client bound to one index.
#[derive(Debug, Clone)]
pub struct IndexClient {
    http: reqwest::Client,
    base: Url,
    index: String,
    limit: usize,
}

impl IndexClient {
    pub fn new(es: &ElasticsearchConfig, http: &HttpConfig) -> Result<Self> {
        let base = parse_base_url("pass.elasticsearch.url", &es.url)?;
        Ok(Self {
            http: http_client(http)?,
            base,
            index: es.index.clone(),
            limit: es.limit,
        })
    }

    /// Page size for multi-result searches.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn mapping_url(&self) -> Url {
        endpoint(&self.base, &[&self.index])
    }

    #[must_use]
    pub fn search_url(&self) -> Url {
        endpoint(&self.base, &[&self.index, "_search"])
    }

    /// `GET <url>/<index>` and parse the body as JSON.
    pub async fn get_mapping(&self) -> Result<Value> {
        let url = self.mapping_url();
        debug!(url = %url, "Fetching index mapping");
        self.send_json(Method::GET, url, None).await
    }

    /// Return the ids of `kind` documents whose `attribute` equals `value`.
    ///
    /// Ids come from `_source.@id`, falling back to the document `_id`.
    pub async fn search_ids(
        &self,
        kind: &str,
        attribute: &str,
        value: &str,
        from: usize,
        size: usize,
    ) -> Result<Vec<String>> {
        let url = self.search_url();
        let body = search_body(kind, attribute, value, from, size);
        trace!(url = %url, %body, "Searching index");
        let response = self.send_json(Method::POST, url.clone(), Some(body)).await?;
        let ids = ids_from_hits(url.as_str(), &response)?;
        debug!(kind, attribute, value, from, hits = ids.len(), "Search complete");
        Ok(ids)
    }

    async fn send_json(&self, method: Method, url: Url, body: Option<Value>) -> Result<Value> {
        let mut request = self.http.request(method, url.clone());
        if let Some(body) = &body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|source| IndexError::Request {
            url: url.to_string(),
            source,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(IndexError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }
            .into());
        }
        let bytes = response.bytes().await.map_err(|source| IndexError::Request {
            url: url.to_string(),
            source,
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl MappingSource for IndexClient {
    fn index_name(&self) -> &str {
        &self.index
    }

    fn fetch_mapping(&self) -> IndexFuture<'_, Value> {
        Box::pin(self.get_mapping())
    }
}

fn search_body(kind: &str, attribute: &str, value: &str, from: usize, size: usize) -> Value {
    json!({
        "from": from,
        "size": size,
        "_source": ["@id"],
        "query": {
            "bool": {
                "filter": [
                    { "term": { "@type": kind } },
                    { "term": { attribute: value } }
                ]
            }
        }
    })
}

fn ids_from_hits(url: &str, response: &Value) -> Result<Vec<String>> {
    let hits = response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| IndexError::MalformedResponse {
            url: url.to_string(),
            detail: "missing hits.hits array".to_string(),
        })?;

    hits.iter()
        .map(|hit| {
            hit.pointer("/_source/@id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .or_else(|| hit.get("_id").and_then(Value::as_str))
                .map(str::to_string)
                .ok_or_else(|| {
                    IndexError::MalformedResponse {
                        url: url.to_string(),
                        detail: "hit without @id or _id".to_string(),
                    }
                    .into()
                })
        })
        .collect()
}
