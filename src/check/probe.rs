use super::{CheckMode, ProbeReport, ProxyProbe};
use crate::config::ValidatorConfig;
use crate::proxy::ProxyCandidate;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::Client;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use std::time::{Duration, Instant};

const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// 通过真实 HTTP 请求检测代理
#[derive(Debug, Clone)]
pub struct HttpProbe {
    timeout: Duration,
    quick_timeout: Duration,
    connectivity_url: String,
    health_check_url: String,
    content_url: String,
    content_keywords: Vec<String>,
    min_keyword_hits: usize,
    user_agents: Vec<String>,
}

impl HttpProbe {
    pub fn new(config: &ValidatorConfig) -> Self {
        Self {
            timeout: config.timeout(),
            quick_timeout: config.quick_timeout(),
            connectivity_url: config.connectivity_url.clone(),
            health_check_url: config.health_check_url.clone(),
            content_url: config.content_url.clone(),
            content_keywords: config
                .content_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            min_keyword_hits: config.min_keyword_hits,
            user_agents: config.user_agents.clone(),
        }
    }

    fn pick_user_agent(&self) -> &str {
        self.user_agents
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or(FALLBACK_USER_AGENT)
    }

    fn create_http_client(&self, candidate: &ProxyCandidate, timeout: Duration) -> Result<Client> {
        let proxy = reqwest::Proxy::all(candidate.to_proxy_url())
            .map_err(|e| anyhow!("创建代理失败: {}", e))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let client = Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            .user_agent(self.pick_user_agent())
            .default_headers(headers)
            .build()?;

        Ok(client)
    }

    async fn check_health(&self, client: &Client) -> bool {
        matches!(
            client.get(&self.health_check_url).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    /// 返回 (页面可访问, 内容校验通过)
    async fn check_content(&self, client: &Client) -> (bool, bool) {
        let response = match client.get(&self.content_url).send().await {
            Ok(resp) if resp.status().is_success() => resp,
            _ => return (false, false),
        };

        match response.text().await {
            Ok(body) => {
                let hits = count_keyword_hits(&body, &self.content_keywords);
                (true, hits >= self.min_keyword_hits)
            }
            Err(_) => (true, false),
        }
    }
}

#[async_trait]
impl ProxyProbe for HttpProbe {
    async fn check(&self, candidate: &str, mode: CheckMode) -> Result<ProbeReport> {
        let parsed: ProxyCandidate = candidate.parse()?;
        let timeout = match mode {
            CheckMode::Quick => self.quick_timeout,
            CheckMode::Full => self.timeout,
        };
        let client = self.create_http_client(&parsed, timeout)?;
        let mut report = ProbeReport::default();

        // 连通性失败直接返回错误，由调用方计 0 分
        let start = Instant::now();
        let response = client.get(&self.connectivity_url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("连通性检测返回 HTTP {}", response.status()));
        }
        report.basic_connectivity = true;
        report.origin_ip = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("origin").and_then(|o| o.as_str()).map(str::to_string));

        if mode == CheckMode::Full {
            report.health_check = self.check_health(&client).await;
            let (page, content) = self.check_content(&client).await;
            report.target_page = page;
            report.content_validation = content;
        }

        report.response_time_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
        Ok(report)
    }
}

/// 统计页面中出现的关键词个数（不区分大小写）
pub fn count_keyword_hits(body: &str, keywords: &[String]) -> usize {
    let body = body.to_lowercase();
    keywords
        .iter()
        .filter(|k| !k.is_empty() && body.contains(&k.to_lowercase()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_keyword_hits() {
        let keywords: Vec<String> = ["example", "domain", "missing"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let body = "<h1>Example Domain</h1><p>This domain is for use in examples.</p>";
        assert_eq!(count_keyword_hits(body, &keywords), 2);
        assert_eq!(count_keyword_hits("", &keywords), 0);
    }

    #[test]
    fn test_client_creation_per_protocol() {
        let probe = HttpProbe::new(&ValidatorConfig::default());
        for raw in ["1.2.3.4:8080", "socks4://1.2.3.4:1080", "socks5://1.2.3.4:1080"] {
            let candidate: ProxyCandidate = raw.parse().unwrap();
            assert!(
                probe
                    .create_http_client(&candidate, Duration::from_secs(1))
                    .is_ok()
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_candidate_is_error() {
        let probe = HttpProbe::new(&ValidatorConfig::default());
        assert!(probe.check("not-a-proxy", CheckMode::Quick).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_error() {
        let config = ValidatorConfig {
            quick_timeout_ms: 500,
            ..ValidatorConfig::default()
        };
        let probe = HttpProbe::new(&config);
        assert!(probe.check("127.0.0.1:9", CheckMode::Quick).await.is_err());
    }
}
