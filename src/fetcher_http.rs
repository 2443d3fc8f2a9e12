//! Plain HTTP transports using reqwest.
//!
//! [`HttpTransport::blocking`] serves one request at a time, like a worker
//! thread would. [`HttpTransport::concurrent`] lets the async scheduler
//! keep many requests in flight over the same client.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION, USER_AGENT};
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::engine::SearchEngine;
use crate::fetcher::{FetchOutcome, FetchSettings, RawResponse, ScrapeMethod, Transport};
use crate::job::Job;
use crate::proxy::{client_builder, Proxy};
use crate::user_agents::random_user_agent;
use crate::Result;

/// Headers every request carries besides the user agent. `Accept-Encoding`
/// is added by reqwest, which also decodes the body.
fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers
}

struct Bound {
    client: Client,
    proxy: Option<Proxy>,
}

/// GET-based transport bound to one proxy (or the local IP).
pub struct HttpTransport {
    method: ScrapeMethod,
    settings: FetchSettings,
    bound: RwLock<Bound>,
    /// Present in blocking mode; serializes requests.
    turn: Option<Mutex<()>>,
}

impl HttpTransport {
    /// One request at a time.
    pub fn blocking(proxy: Option<Proxy>, settings: FetchSettings) -> Result<Self> {
        Self::build(ScrapeMethod::Http, proxy, settings, Some(Mutex::new(())))
    }

    /// Any number of requests in flight.
    pub fn concurrent(proxy: Option<Proxy>, settings: FetchSettings) -> Result<Self> {
        Self::build(ScrapeMethod::HttpAsync, proxy, settings, None)
    }

    fn build(
        method: ScrapeMethod,
        proxy: Option<Proxy>,
        settings: FetchSettings,
        turn: Option<Mutex<()>>,
    ) -> Result<Self> {
        let client = build_client(proxy.as_ref(), &settings)?;
        Ok(Self {
            method,
            settings,
            bound: RwLock::new(Bound { client, proxy }),
            turn,
        })
    }

    fn client(&self) -> Client {
        self.bound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .client
            .clone()
    }

    /// Requests `url` and classifies the answer against `engine`'s block markers.
    pub async fn fetch_url(&self, engine: SearchEngine, url: &str) -> FetchOutcome {
        let _turn = match &self.turn {
            Some(turn) => Some(turn.lock().await),
            None => None,
        };

        let user_agent = random_user_agent();
        debug!("GET {} ({})", url, self.method);

        let response = match self
            .client()
            .get(url)
            .headers(default_headers())
            .header(USER_AGENT, user_agent)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return classify_error(e),
        };

        let status = response.status();
        let final_url = response.url().to_string();
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return classify_error(e),
        };

        if !status.is_success() {
            warn!("{} answered {} for {}", engine, status, url);
            return FetchOutcome::Denied {
                status: Some(status.as_u16()),
                reason: format!("HTTP {}", status),
            };
        }

        let profile = engine.profile();
        let text = String::from_utf8_lossy(&body);
        if profile
            .denial
            .is_some_and(|needles| needles.matches(&final_url, &text))
        {
            warn!("{} served a blocking page for {}", engine, url);
            return FetchOutcome::Denied {
                status: Some(status.as_u16()),
                reason: "blocking page".to_string(),
            };
        }

        let exhausted = profile
            .exhausted_marker
            .is_some_and(|marker| text.contains(marker));
        let mut raw = RawResponse::new(body.to_vec(), final_url, self.method);
        raw.status = status.as_u16();
        raw.exhausted = exhausted;
        FetchOutcome::Ok(raw)
    }
}

fn build_client(proxy: Option<&Proxy>, settings: &FetchSettings) -> Result<Client> {
    Ok(client_builder(proxy, settings.request_timeout)?.build()?)
}

fn classify_error(e: reqwest::Error) -> FetchOutcome {
    if e.is_builder() {
        FetchOutcome::StopScraping(format!("Invalid request: {}", e))
    } else {
        FetchOutcome::NetworkError(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn method(&self) -> ScrapeMethod {
        self.method
    }

    fn proxy(&self) -> Option<Proxy> {
        self.bound
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .proxy
            .clone()
    }

    async fn fetch(&self, job: &Job) -> FetchOutcome {
        let url = job.engine.profile().search_url_for(
            &job.query,
            job.page,
            self.settings.num_results_per_page,
            self.settings.search_type,
        );
        self.fetch_url(job.engine, &url).await
    }

    async fn switch_proxy(&self, proxy: Option<Proxy>) -> Result<()> {
        let client = build_client(proxy.as_ref(), &self.settings)?;
        let mut bound = self.bound.write().unwrap_or_else(PoisonError::into_inner);
        debug!(
            "Switching proxy {} -> {}",
            bound.proxy.as_ref().map_or("local".to_string(), |p| p.to_string()),
            proxy.as_ref().map_or("local".to_string(), |p| p.to_string())
        );
        *bound = Bound { client, proxy };
        Ok(())
    }
}
