//! HTTP client for a Consul-compatible catalog agent.

use std::time::Duration;

use reqwest::StatusCode;
use reqwest::Url;
use serde_json::Value;

use super::Error;
use super::Result;
use super::catalog::AgentServiceRegistration;
use super::catalog::CatalogClient;
use super::catalog::QueryOptions;
use super::catalog::ServiceEntry;
use crate::config::CatalogConfig;

const TOKEN_HEADER: &str = "X-Consul-Token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ConsulClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl ConsulClient {
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(backend)?;
        let base = Url::parse(&format!("{}://{}", config.scheme, config.address)).map_err(|e| {
            Error::Backend(format!("invalid catalog address {:?}: {e}", config.address))
        })?;
        if base.cannot_be_a_base() {
            return Err(Error::Backend(format!("invalid catalog address {:?}", config.address)));
        }
        Ok(Self {
            http,
            base,
            token: config.token.clone(),
        })
    }

    /// The agent URL for `segments`, each one percent-encoded as a single
    /// path segment.
    pub fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.header(TOKEN_HEADER, token),
            None => builder,
        }
    }

    /// Checks that the agent is reachable and answering.
    pub async fn agent_self(&self) -> Result<Value> {
        let response = self
            .request(reqwest::Method::GET, self.endpoint(&["v1", "agent", "self"]))
            .send()
            .await
            .map_err(backend)?;
        let response = check(response).await?;
        response.json().await.map_err(backend)
    }
}

#[async_trait::async_trait]
impl CatalogClient for ConsulClient {
    async fn healthy_service(&self, service: &str, options: &QueryOptions) -> Result<Vec<ServiceEntry>> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if options.passing_only {
            query.push(("passing", "1"));
        }
        if let Some(tag) = &options.tag {
            query.push(("tag", tag.as_str()));
        }
        if let Some(dc) = &options.datacenter {
            query.push(("dc", dc.as_str()));
        }
        let mut url = self.endpoint(&["v1", "health", "service", service]);
        // `cached` is a bare flag on the agent API.
        if options.use_cache {
            url.set_query(Some("cached"));
        }

        let response = self
            .request(reqwest::Method::GET, url)
            .query(&query)
            .send()
            .await
            .map_err(backend)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = check(response).await?;
        response.json().await.map_err(backend)
    }

    async fn register_service(&self, registration: &AgentServiceRegistration) -> Result<()> {
        let url = self.endpoint(&["v1", "agent", "service", "register"]);
        let response = self
            .request(reqwest::Method::PUT, url)
            .json(registration)
            .send()
            .await
            .map_err(backend)?;
        check(response).await.map(drop)
    }

    async fn deregister_service(&self, service_id: &str) -> Result<()> {
        let url = self.endpoint(&["v1", "agent", "service", "deregister", service_id]);
        let response = self
            .request(reqwest::Method::PUT, url)
            .send()
            .await
            .map_err(backend)?;
        check(response).await.map(drop)
    }

    async fn ping(&self) -> Result<()> {
        self.agent_self().await.map(drop)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Backend(format!("catalog agent answered {status}: {}", body.trim())))
}

fn backend(e: reqwest::Error) -> Error {
    Error::Backend(e.to_string())
}
