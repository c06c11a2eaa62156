use crate::error::{PoolError, PoolResult};
use crate::source::{HttpMethod, ProxySource};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// 代理使用模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    /// 使用全部代理来源
    #[default]
    Enterprise,
    /// 仅使用手动代理文件
    ManualOnly,
    /// 不使用代理
    Direct,
}

/// 会话级代理开关
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub auto_proxy_rotation: bool,
    pub proxy_mode: ProxyMode,
    pub fallback_to_direct: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_proxy_rotation: true,
            proxy_mode: ProxyMode::Enterprise,
            fallback_to_direct: true,
        }
    }
}

impl SessionConfig {
    pub fn proxies_enabled(&self) -> bool {
        self.auto_proxy_rotation && self.proxy_mode != ProxyMode::Direct
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidatorConfig {
    // 超时（毫秒）
    pub timeout_ms: u64,
    pub quick_timeout_ms: u64,

    // 并发
    pub max_workers: usize,
    pub quick_workers: usize,

    // 检测目标
    pub connectivity_url: String,
    pub health_check_url: String,
    pub content_url: String,
    pub content_keywords: Vec<String>,
    pub min_keyword_hits: usize,

    // 评分阈值
    pub working_score: u8,
    pub partial_score: u8,
    pub early_exit_target: usize,

    pub user_agents: Vec<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 8000,
            quick_timeout_ms: 8000,
            max_workers: 10,
            quick_workers: 5,
            connectivity_url: "http://httpbin.org/ip".to_string(),
            health_check_url: "http://www.gstatic.com/generate_204".to_string(),
            content_url: "https://example.com/".to_string(),
            content_keywords: vec![
                "example".to_string(),
                "domain".to_string(),
                "illustrative".to_string(),
                "documents".to_string(),
                "permission".to_string(),
            ],
            min_keyword_hits: 3,
            working_score: 60,
            partial_score: 25,
            early_exit_target: 5,
            user_agents: vec![
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0".to_string(),
            ],
        }
    }
}

impl ValidatorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn quick_timeout(&self) -> Duration {
        Duration::from_millis(self.quick_timeout_ms)
    }
}

/// 代理存储的评分与淘汰参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolPolicy {
    pub failure_rate_threshold: f64,
    pub min_attempts: u64,
    pub amnesty_hours: i64,
    pub recent_failure_limit: usize,
    pub unknown_priority: f64,
    pub recency_decay_hours: f64,
    pub recency_floor: f64,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.7,
            min_attempts: 3,
            amnesty_hours: 24,
            recent_failure_limit: 5,
            unknown_priority: 0.5,
            recency_decay_hours: 24.0,
            recency_floor: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    pub stored_sample_size: usize,
    pub min_stored_working: usize,
    pub low_water_mark: usize,
    pub batch_limit: usize,
    pub sufficient_candidates: usize,
    pub source_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            stored_sample_size: 10,
            min_stored_working: 1,
            low_water_mark: 2,
            batch_limit: 50,
            sufficient_candidates: 100,
            source_timeout_ms: 15000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterConfig {
    /// CDN/边缘节点网段（CIDR）
    pub cdn_denylist: Vec<String>,
}

const DEFAULT_CDN_DENYLIST: &[&str] = &[
    "104.0.0.0/8",
    "172.64.0.0/16",
    "172.67.0.0/16",
    "188.114.0.0/16",
    "141.101.0.0/16",
    "162.158.0.0/16",
    "141.193.0.0/16",
    "188.42.0.0/16",
    "185.18.0.0/16",
    "185.193.0.0/16",
    "185.162.0.0/16",
    "23.227.0.0/16",
    "199.34.0.0/16",
    "198.41.0.0/16",
    "173.245.0.0/16",
    "45.131.0.0/16",
    "45.159.0.0/16",
    "45.85.0.0/16",
    "45.80.0.0/16",
    "45.67.0.0/16",
    "216.24.0.0/16",
    "216.205.0.0/16",
    "209.46.0.0/16",
    "154.194.0.0/16",
    "154.197.0.0/16",
    "160.153.0.0/16",
    "195.85.0.0/16",
    "31.43.0.0/16",
    "5.10.0.0/16",
    "5.182.0.0/16",
    "89.116.0.0/16",
    "91.193.0.0/16",
    "159.112.0.0/16",
    "160.123.0.0/16",
    "185.199.0.0/16",
    "140.82.0.0/16",
    "192.30.0.0/16",
];

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            cdn_denylist: DEFAULT_CDN_DENYLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl FilterConfig {
    pub fn denylist_networks(&self) -> PoolResult<Vec<Ipv4Network>> {
        self.cdn_denylist
            .iter()
            .map(|cidr| {
                cidr.trim().parse::<Ipv4Network>().map_err(|e| {
                    PoolError::InvalidConfig(format!("CIDR 无效 {}: {}", cidr, e))
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub session: SessionConfig,

    // 文件路径
    pub storage_file: String,
    pub manual_proxy_file: String,
    pub use_manual_proxies: bool,

    // 输出
    pub print_progress: bool,
    pub log_level: String,

    pub validator: ValidatorConfig,
    pub pool: PoolPolicy,
    pub manager: ManagerConfig,
    pub filter: FilterConfig,

    // 代理来源，按顺序获取
    pub sources: Vec<ProxySource>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            storage_file: "config/working_proxies.json".to_string(),
            manual_proxy_file: "config/manual_proxies.txt".to_string(),
            use_manual_proxies: true,
            print_progress: true,
            log_level: "info".to_string(),
            validator: ValidatorConfig::default(),
            pool: PoolPolicy::default(),
            manager: ManagerConfig::default(),
            filter: FilterConfig::default(),
            sources: default_sources(),
        }
    }
}

fn default_sources() -> Vec<ProxySource> {
    let proxyscrape_query = |protocol: &str| {
        let mut query = BTreeMap::new();
        query.insert("request".to_string(), "display_proxies".to_string());
        query.insert("proxy_format".to_string(), "protocolipport".to_string());
        query.insert("format".to_string(), "text".to_string());
        query.insert("protocol".to_string(), protocol.to_string());
        query.insert("timeout".to_string(), "10000".to_string());
        query
    };

    vec![
        ProxySource::TextApi {
            name: "proxyscrape_http".to_string(),
            url: "https://api.proxyscrape.com/v4/free-proxy-list/get".to_string(),
            query: proxyscrape_query("http"),
            headers: BTreeMap::new(),
            api_key: None,
        },
        ProxySource::TextApi {
            name: "proxyscrape_socks4".to_string(),
            url: "https://api.proxyscrape.com/v4/free-proxy-list/get".to_string(),
            query: proxyscrape_query("socks4"),
            headers: BTreeMap::new(),
            api_key: None,
        },
        ProxySource::HtmlScrape {
            name: "free_proxy_list".to_string(),
            urls: vec!["https://free-proxy-list.net/".to_string()],
        },
        ProxySource::JsonApi {
            name: "getproxylist".to_string(),
            url: "https://api.getproxylist.com/proxy".to_string(),
            method: HttpMethod::Get,
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
            api_key: None,
        },
    ]
}

impl Config {
    /// 读取 YAML 配置，未知字段直接报错
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> PoolResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> PoolResult<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> PoolResult<()> {
        let invalid = |msg: String| Err(PoolError::InvalidConfig(msg));

        self.filter.denylist_networks()?;

        let v = &self.validator;
        for url in [&v.connectivity_url, &v.health_check_url, &v.content_url] {
            check_url(url)?;
        }
        if v.max_workers == 0 || v.quick_workers == 0 {
            return invalid("并发数必须大于 0".to_string());
        }
        if v.working_score > 100 || v.partial_score > v.working_score {
            return invalid(format!(
                "评分阈值无效: working={} partial={}",
                v.working_score, v.partial_score
            ));
        }

        let p = &self.pool;
        if !(0.0..=1.0).contains(&p.failure_rate_threshold) {
            return invalid(format!("失败率阈值无效: {}", p.failure_rate_threshold));
        }
        if p.amnesty_hours < 0 {
            return invalid(format!("重试窗口无效: {}", p.amnesty_hours));
        }
        if p.recency_decay_hours <= 0.0 {
            return invalid(format!("衰减窗口无效: {}", p.recency_decay_hours));
        }
        if !(0.0..=1.0).contains(&p.recency_floor) || !(0.0..=1.0).contains(&p.unknown_priority) {
            return invalid("排序因子必须位于 0 到 1 之间".to_string());
        }

        for source in &self.sources {
            for url in source.urls() {
                check_url(url)?;
            }
        }

        Ok(())
    }

    /// 按会话模式返回本周期使用的代理来源
    pub fn active_sources(&self) -> Vec<ProxySource> {
        let manual = ProxySource::ManualFile {
            path: self.manual_proxy_file.clone(),
        };

        match self.session.proxy_mode {
            ProxyMode::Direct => vec![],
            ProxyMode::ManualOnly => vec![manual],
            ProxyMode::Enterprise => {
                let mut sources = Vec::with_capacity(self.sources.len() + 1);
                if self.use_manual_proxies {
                    sources.push(manual);
                }
                sources.extend(self.sources.iter().cloned());
                sources
            }
        }
    }
}

fn check_url(raw: &str) -> PoolResult<()> {
    Url::parse(raw)
        .map(|_| ())
        .map_err(|e| PoolError::InvalidConfig(format!("URL 无效 {}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pool.min_attempts, 3);
        assert_eq!(config.pool.amnesty_hours, 24);
        assert!(config.session.proxies_enabled());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let yaml = "storage_file: a.json\nnot_a_real_key: 1\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());

        let nested = "validator:\n  timeout_ms: 100\n  bogus: true\n";
        assert!(serde_yaml::from_str::<Config>(nested).is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
session:
  proxy_mode: manual_only
  fallback_to_direct: false
manager:
  low_water_mark: 4
sources:
  - kind: text_api
    name: plain
    url: http://lists.example.org/proxies.txt
  - kind: manual_file
    path: extra.txt
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.session.proxy_mode, ProxyMode::ManualOnly);
        assert!(config.session.auto_proxy_rotation);
        assert!(!config.session.fallback_to_direct);
        assert_eq!(config.manager.low_water_mark, 4);
        assert_eq!(config.manager.batch_limit, 50);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].name(), "plain");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.filter.cdn_denylist.push("300.1.0.0/16".to_string());
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig(_))
        ));

        let mut config = Config::default();
        config.validator.partial_score = 90;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.validator.content_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_active_sources_follow_mode() {
        let mut config = Config::default();
        let enterprise = config.active_sources();
        assert_eq!(enterprise.len(), config.sources.len() + 1);
        assert!(matches!(enterprise[0], ProxySource::ManualFile { .. }));

        config.session.proxy_mode = ProxyMode::ManualOnly;
        assert_eq!(config.active_sources().len(), 1);

        config.session.proxy_mode = ProxyMode::Direct;
        assert!(config.active_sources().is_empty());
        assert!(!config.session.proxies_enabled());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config = Config::default();
        config.manager.batch_limit = 7;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.manager.batch_limit, 7);
        assert_eq!(loaded.sources.len(), config.sources.len());
    }
}
