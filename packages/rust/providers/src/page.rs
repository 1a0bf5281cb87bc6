//! Direct homepage fetch used by domain classification.
//!
//! Fetches `https://{domain}/`, records response headers, and collects
//! same-host links as sample URLs. Private and loopback targets are refused.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use cartograph_shared::{CartographError, Result};

use crate::USER_AGENT;
use crate::error::ProviderError;
use crate::model::{PagePayload, PollStatus, ProviderRequest, ProviderTicket};
use crate::provider::{Provider, poll_ready_ticket};

/// Upper bound on sample URLs kept per page.
const MAX_SAMPLE_URLS: usize = 50;

pub struct PageFetchProvider {
    id: String,
    client: Client,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_localhost: bool,
    /// Fetch this origin instead of `https://{domain}` (tests only).
    origin: Option<Url>,
}

impl PageFetchProvider {
    pub fn new(id: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| CartographError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            id: id.into(),
            client,
            allow_localhost: false,
            origin: None,
        })
    }

    /// Allow fetching localhost/private IPs (for integration tests).
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    /// Serve every domain from `origin` (for integration tests).
    #[cfg(test)]
    pub fn with_origin(mut self, origin: Url) -> Self {
        self.origin = Some(origin);
        self
    }

    fn homepage(&self, domain: &str) -> std::result::Result<Url, ProviderError> {
        if let Some(origin) = &self.origin {
            return Ok(origin.clone());
        }
        Url::parse(&format!("https://{domain}/")).map_err(|e| ProviderError::Rejected {
            status: 0,
            message: format!("invalid domain {domain}: {e}"),
        })
    }

    async fn fetch(&self, domain: &str) -> std::result::Result<PagePayload, ProviderError> {
        let url = self.homepage(domain)?;

        if !self.allow_localhost && is_ssrf_target(&url) {
            warn!(%url, "SSRF protection: blocked");
            return Err(ProviderError::Rejected {
                status: 0,
                message: format!("refusing to fetch private target {url}"),
            });
        }

        debug!(%url, "fetching homepage");
        let response = self.client.get(url.as_str()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), ""));
        }

        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let final_url = response.url().clone();
        let html = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(format!("{url}: body read failed: {e}")))?;

        let doc = Html::parse_document(&html);
        let sample_urls = extract_links(&doc, &final_url)
            .into_iter()
            .filter(|link| same_host(link, &final_url))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .take(MAX_SAMPLE_URLS)
            .collect();

        Ok(PagePayload {
            domain: domain.to_string(),
            html,
            headers,
            sample_urls,
        })
    }
}

#[async_trait]
impl Provider for PageFetchProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn submit(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderTicket, ProviderError> {
        let ProviderRequest::PageFetch { domain } = request else {
            return Err(ProviderError::Rejected {
                status: 0,
                message: format!("page fetch cannot serve {}", request.kind()),
            });
        };
        let page = self.fetch(domain).await?;
        let payload =
            serde_json::to_value(&page).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(ProviderTicket::ready(
            &self.id,
            Uuid::now_v7().to_string(),
            payload,
        ))
    }

    async fn poll(&self, ticket: &ProviderTicket) -> std::result::Result<PollStatus, ProviderError> {
        Ok(poll_ready_ticket(ticket))
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    // Block non-HTTP schemes
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

// ---------------------------------------------------------------------------
// Link extraction
// ---------------------------------------------------------------------------

/// Extract all links from a document, resolved against the base URL.
fn extract_links(doc: &Html, base_url: &Url) -> Vec<String> {
    let Ok(link_sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let mut links = Vec::new();

    for el in doc.select(&link_sel) {
        if let Some(href) = el.value().attr("href") {
            // Skip anchors, javascript:, mailto:
            if href.starts_with('#')
                || href.starts_with("javascript:")
                || href.starts_with("mailto:")
            {
                continue;
            }

            if let Ok(mut resolved) = base_url.join(href) {
                resolved.set_fragment(None);
                links.push(resolved.to_string());
            }
        }
    }

    links
}

/// Same host, ignoring a leading `www.`.
fn same_host(link: &str, base: &Url) -> bool {
    let strip = |h: &str| h.trim_start_matches("www.").to_string();
    match (Url::parse(link), base.host_str()) {
        (Ok(url), Some(base_host)) => url.host_str().map(strip) == Some(strip(base_host)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn ssrf_blocks_private_and_local_targets() {
        for raw in [
            "file:///etc/passwd",
            "http://192.168.1.1/admin",
            "http://10.0.0.1/",
            "http://127.0.0.1:8080/",
            "http://localhost:3000/api",
            "http://[::1]/",
            "http://printer.local/",
        ] {
            assert!(is_ssrf_target(&Url::parse(raw).unwrap()), "{raw}");
        }
        assert!(!is_ssrf_target(&Url::parse("https://example.co.uk/").unwrap()));
    }

    #[test]
    fn extracts_same_host_links_only() {
        let html = r##"<html><body>
            <a href="/cart">Basket</a>
            <a href="https://www.example.co.uk/checkout">Checkout</a>
            <a href="https://external.com/">External</a>
            <a href="#top">Top</a>
            <a href="mailto:shop@example.co.uk">Mail</a>
        </body></html>"##;
        let doc = Html::parse_document(html);
        let base = Url::parse("https://example.co.uk/").unwrap();

        let links: Vec<String> = extract_links(&doc, &base)
            .into_iter()
            .filter(|l| same_host(l, &base))
            .collect();
        assert_eq!(
            links,
            vec![
                "https://example.co.uk/cart".to_string(),
                "https://www.example.co.uk/checkout".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn fetches_homepage_with_headers_and_links() {
        let server = MockServer::start().await;
        let page = r#"<html><body>
            <script src="https://cdn.shopify.com/s/app.js"></script>
            <a href="/collections/all">Shop</a>
            <a href="/cart">Cart</a>
        </body></html>"#;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Powered-By", "Shopify")
                    .set_body_string(page),
            )
            .mount(&server)
            .await;

        let provider = PageFetchProvider::new("page_fetch", 5)
            .unwrap()
            .allow_localhost()
            .with_origin(Url::parse(&server.uri()).unwrap());

        let ticket = provider
            .submit(&ProviderRequest::PageFetch {
                domain: "example.co.uk".into(),
            })
            .await
            .unwrap();
        let PollStatus::Ready(value) = provider.poll(&ticket).await.unwrap() else {
            panic!("page fetch should be ready immediately");
        };
        let payload: PagePayload = serde_json::from_value(value).unwrap();

        assert_eq!(payload.domain, "example.co.uk");
        assert!(payload.html.contains("cdn.shopify.com"));
        assert_eq!(payload.headers.get("x-powered-by").map(String::as_str), Some("Shopify"));
        assert_eq!(payload.sample_urls.len(), 2);
        assert!(payload.sample_urls.iter().any(|u| u.ends_with("/cart")));
    }

    #[tokio::test]
    async fn blocked_target_is_rejected_without_request() {
        let provider = PageFetchProvider::new("page_fetch", 5)
            .unwrap()
            .with_origin(Url::parse("http://127.0.0.1:9/").unwrap());
        let err = provider
            .submit(&ProviderRequest::PageFetch {
                domain: "example.co.uk".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn wrong_request_kind_is_rejected() {
        let provider = PageFetchProvider::new("page_fetch", 5).unwrap();
        let err = provider
            .submit(&ProviderRequest::BacklinkMetrics {
                domain: "example.co.uk".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { .. }));
    }
}
