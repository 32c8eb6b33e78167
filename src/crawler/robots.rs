//! robots.txt fetching, parsing and per-origin caching.
//!
//! A missing or unreachable robots.txt never blocks a crawl: the origin is
//! cached with an allow-all policy and the reason is kept on the entry.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::Client;
use robotstxt::DefaultMatcher;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

use crate::cli::config::CrawlerSettings;

/// Host used to turn a bare path into the URL the matcher expects
const MATCH_BASE: &str = "http://robots.invalid";

/// A robots.txt body evaluated for one crawler identity
#[derive(Debug, Clone, Default)]
pub struct RobotsPolicy {
    body: String,
    agent: String,
}

impl RobotsPolicy {
    /// A policy without rules, allowing every path
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Keep a robots.txt body for `agent`. The group naming the agent wins,
    /// otherwise the `*` group applies.
    pub fn parse(body: &str, agent: &str) -> Self {
        Self {
            body: body.trim_start_matches('\u{feff}').to_string(),
            agent: agent.to_string(),
        }
    }

    /// Longest matching rule decides; Allow wins a tie; no match means allowed.
    /// `path` may carry a query and may be raw or percent-encoded.
    pub fn is_allowed(&self, path: &str) -> bool {
        if self.is_empty() {
            return true;
        }

        DefaultMatcher::default().one_agent_allowed_by_robots(
            &self.body,
            &self.agent,
            &match_url(path),
        )
    }

    /// Whether the body holds nothing to evaluate
    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }
}

/// Percent-encode `path` the way request URLs are, so raw and encoded
/// forms match the same rules
fn match_url(path: &str) -> String {
    let raw = match path {
        "" => format!("{}/", MATCH_BASE),
        p if p.starts_with('/') => format!("{}{}", MATCH_BASE, p),
        p => format!("{}/{}", MATCH_BASE, p),
    };

    Url::parse(&raw).map(String::from).unwrap_or(raw)
}

/// How a cached policy was obtained
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    Fetched,

    /// robots.txt could not be retrieved; everything is allowed
    FailOpen { reason: String },
}

/// A policy held in the cache for one origin
#[derive(Debug, Clone)]
pub struct CachedPolicy {
    pub policy: RobotsPolicy,
    pub source: PolicySource,
    pub captured_at: DateTime<Utc>,
    fetched: Instant,
}

impl CachedPolicy {
    fn is_fresh(&self, ttl: Option<Duration>) -> bool {
        ttl.map_or(true, |ttl| self.fetched.elapsed() < ttl)
    }
}

/// Process-wide robots.txt cache keyed by origin
pub struct RobotsPolicyCache {
    client: Client,
    agent: String,
    ttl: Option<Duration>,
    entries: RwLock<HashMap<String, CachedPolicy>>,
}

impl RobotsPolicyCache {
    /// Create a cache that requests robots.txt with the crawler identity
    pub fn new(settings: &CrawlerSettings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&settings.user_agent).context("Invalid user agent")?,
        );

        let client = Client::builder()
            .timeout(settings.robots_timeout())
            .default_headers(headers)
            .build()
            .context("Failed to create robots.txt HTTP client")?;

        Ok(Self::with_client(client, &settings.robots_agent, settings.robots_ttl()))
    }

    pub fn with_client(client: Client, agent: &str, ttl: Option<Duration>) -> Self {
        Self {
            client,
            agent: agent.to_string(),
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Whether `path` may be crawled on `origin`. Never fails: fetch
    /// problems degrade to an allow-all policy.
    pub async fn is_allowed(&self, origin: &str, path: &str) -> bool {
        self.policy(origin).await.policy.is_allowed(path)
    }

    /// Check a full URL against its origin's policy
    pub async fn check_url(&self, url: &Url) -> bool {
        self.is_allowed(&origin_of(url), &request_path(url)).await
    }

    /// The cached policy for `origin`, fetching it on a miss or after expiry
    pub async fn policy(&self, origin: &str) -> CachedPolicy {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(origin) {
                if entry.is_fresh(self.ttl) {
                    return entry.clone();
                }
            }
        }

        // Concurrent misses for the same origin may both fetch; last write wins
        let entry = self.fetch_policy(origin).await;
        self.entries
            .write()
            .await
            .insert(origin.to_string(), entry.clone());
        entry
    }

    /// Drop the cached policy for `origin`, returning whether one was present
    pub async fn invalidate(&self, origin: &str) -> bool {
        self.entries.write().await.remove(origin).is_some()
    }

    async fn fetch_policy(&self, origin: &str) -> CachedPolicy {
        let robots_url = format!("{}/robots.txt", origin.trim_end_matches('/'));
        debug!("Fetching robots.txt: {}", robots_url);

        let (policy, source) = match self.fetch_body(&robots_url).await {
            Ok(body) => (RobotsPolicy::parse(&body, &self.agent), PolicySource::Fetched),
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!("Failed to fetch robots.txt for {}: {}", origin, reason);
                (RobotsPolicy::allow_all(), PolicySource::FailOpen { reason })
            }
        };

        CachedPolicy {
            policy,
            source,
            captured_at: Utc::now(),
            fetched: Instant::now(),
        }
    }

    async fn fetch_body(&self, robots_url: &str) -> Result<String> {
        let response = self
            .client
            .get(robots_url)
            .send()
            .await
            .context("request failed")?
            .error_for_status()
            .context("unexpected status")?;

        response.text().await.context("failed to read body")
    }
}

/// scheme://host[:port] of a URL, the unit robots policy is cached by
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Path plus query, as matched against robots.txt rules
pub fn request_path(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_cache(timeout: Duration, ttl: Option<Duration>) -> RobotsPolicyCache {
        let client = Client::builder().timeout(timeout).build().unwrap();
        RobotsPolicyCache::with_client(client, "FashionBot", ttl)
    }

    #[test]
    fn test_disallow_prefix_for_all_agents() {
        let policy = RobotsPolicy::parse("User-agent: *\nDisallow: /secret", "FashionBot");
        assert!(!policy.is_allowed("/secret/x"));
        assert!(!policy.is_allowed("/secret"));
        assert!(policy.is_allowed("/public"));
        assert!(policy.is_allowed(""));
    }

    #[test]
    fn test_specific_agent_group_wins_over_star() {
        let body = "\
User-agent: *
Disallow: /

# our crawler gets more room
User-agent: fashionbot
Disallow: /checkout
";
        let policy = RobotsPolicy::parse(body, "FashionBot");
        assert!(policy.is_allowed("/list"));
        assert!(!policy.is_allowed("/checkout/cart"));

        let other = RobotsPolicy::parse(body, "OtherBot");
        assert!(!other.is_allowed("/list"));
    }

    #[test]
    fn test_grouped_user_agents_share_rules() {
        let body = "User-agent: Googlebot\nUser-agent: FashionBot/1.0\nDisallow: /private\n";
        let policy = RobotsPolicy::parse(body, "FashionBot");
        assert!(!policy.is_allowed("/private/a"));
    }

    #[test]
    fn test_longest_match_and_allow_tie_break() {
        let body = "User-agent: *\nDisallow: /shop\nAllow: /shop/list\nAllow: /a\nDisallow: /a\n";
        let policy = RobotsPolicy::parse(body, "FashionBot");
        assert!(!policy.is_allowed("/shop/cart"));
        assert!(policy.is_allowed("/shop/list?page=2"));
        assert!(policy.is_allowed("/a/b"));
    }

    #[test]
    fn test_wildcards_and_end_anchor() {
        let body = "User-agent: *\nDisallow: /*.json$\nDisallow: /*?sort=\n";
        let policy = RobotsPolicy::parse(body, "FashionBot");
        assert!(!policy.is_allowed("/api/items.json"));
        assert!(policy.is_allowed("/api/items.json?x=1"));
        assert!(!policy.is_allowed("/list?sort=price"));
        assert!(policy.is_allowed("/list?page=2"));
    }

    #[test]
    fn test_empty_disallow_allows_everything() {
        let policy = RobotsPolicy::parse("User-agent: *\nDisallow:\n", "FashionBot");
        assert!(policy.is_allowed("/anything"));
        assert!(RobotsPolicy::allow_all().is_empty());
        assert!(RobotsPolicy::allow_all().is_allowed("/secret"));
    }

    #[test]
    fn test_leading_byte_order_mark_is_ignored() {
        let policy = RobotsPolicy::parse("\u{feff}User-agent: *\nDisallow: /secret", "FashionBot");
        assert!(!policy.is_allowed("/secret/x"));
        assert!(policy.is_allowed("/public"));
    }

    #[test]
    fn test_non_ascii_rules_match_encoded_paths() {
        let policy = RobotsPolicy::parse("User-agent: *\nDisallow: /产品\n", "FashionBot");
        let url = Url::parse("https://shop.example/产品/list").unwrap();

        assert_eq!(request_path(&url), "/%E4%BA%A7%E5%93%81/list");
        assert!(!policy.is_allowed(&request_path(&url)));
        assert!(!policy.is_allowed("/产品/list"));
        assert!(policy.is_allowed("/women/list"));
    }

    #[test]
    fn test_origin_and_request_path() {
        let url = Url::parse("https://shop.example/list?page=2#top").unwrap();
        assert_eq!(origin_of(&url), "https://shop.example");
        assert_eq!(request_path(&url), "/list?page=2");

        let url = Url::parse("http://localhost:8080/a").unwrap();
        assert_eq!(origin_of(&url), "http://localhost:8080");
    }

    #[tokio::test]
    async fn test_disallowed_path_from_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /secret"))
            .mount(&server)
            .await;

        let cache = test_cache(Duration::from_secs(5), None);
        assert!(!cache.is_allowed(&server.uri(), "/secret/x").await);
        assert!(cache.is_allowed(&server.uri(), "/public").await);
        assert_eq!(cache.policy(&server.uri()).await.source, PolicySource::Fetched);
    }

    #[tokio::test]
    async fn test_non_ascii_url_blocked_through_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string("\u{feff}User-agent: *\nDisallow: /产品"),
            )
            .mount(&server)
            .await;

        let cache = test_cache(Duration::from_secs(5), None);
        let blocked = Url::parse(&format!("{}/产品/list", server.uri())).unwrap();
        let open = Url::parse(&format!("{}/women/list", server.uri())).unwrap();
        assert!(!cache.check_url(&blocked).await);
        assert!(cache.check_url(&open).await);
    }

    #[tokio::test]
    async fn test_missing_robots_fails_open() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let cache = test_cache(Duration::from_secs(5), None);
        assert!(cache.is_allowed(&server.uri(), "/anything").await);
        assert!(matches!(
            cache.policy(&server.uri()).await.source,
            PolicySource::FailOpen { .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_fails_open() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("User-agent: *\nDisallow: /")
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let cache = test_cache(Duration::from_millis(100), None);
        assert!(cache.is_allowed(&server.uri(), "/list").await);
    }

    #[tokio::test]
    async fn test_unreachable_origin_fails_open() {
        let cache = test_cache(Duration::from_millis(500), None);
        assert!(cache.is_allowed("http://127.0.0.1:9", "/list").await);
    }

    #[tokio::test]
    async fn test_policy_is_cached_per_origin() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /x"))
            .expect(1)
            .mount(&server)
            .await;

        let cache = test_cache(Duration::from_secs(5), None);
        for _ in 0..3 {
            assert!(!cache.is_allowed(&server.uri(), "/x").await);
        }
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /x"))
            .expect(2)
            .mount(&server)
            .await;

        let cache = test_cache(Duration::from_secs(5), None);
        assert!(!cache.is_allowed(&server.uri(), "/x").await);
        assert!(cache.invalidate(&server.uri()).await);
        assert!(!cache.invalidate(&server.uri()).await);
        assert!(!cache.is_allowed(&server.uri(), "/x").await);
    }

    #[tokio::test]
    async fn test_expired_entries_are_refetched() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nAllow: /"))
            .expect(2)
            .mount(&server)
            .await;

        let cache = test_cache(Duration::from_secs(5), Some(Duration::ZERO));
        assert!(cache.is_allowed(&server.uri(), "/").await);
        assert!(cache.is_allowed(&server.uri(), "/").await);
    }

    #[tokio::test]
    async fn test_sends_crawler_identity() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/robots.txt"))
            .and(header("user-agent", "Mozilla/5.0 (compatible; FashionBot/1.0)"))
            .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /x"))
            .expect(1)
            .mount(&server)
            .await;

        let cache = RobotsPolicyCache::new(&CrawlerSettings::default()).unwrap();
        assert!(!cache.is_allowed(&server.uri(), "/x").await);
    }
}
