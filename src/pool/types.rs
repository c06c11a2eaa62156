//! 代理存储文件的数据结构

use crate::proxy::Protocol;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

pub const STORAGE_VERSION: &str = "1.0";

/// 解析时间戳：RFC 3339，或不带时区的 ISO 8601（按 UTC 处理）
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).ok_or_else(|| de::Error::custom(format!("时间格式无效: {}", raw)))
}

fn deserialize_optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("时间格式无效: {}", raw))),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub time: DateTime<Utc>,
    pub reason: String,
}

/// 单个代理的累计统计，以 `ip:port` 为键保存在 `proxy_stats` 中
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub fail_count: u64,
    /// 成功检测的平均响应时间（毫秒）
    #[serde(rename = "avg_response_time", default)]
    pub avg_response_time_ms: f64,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_timestamp")]
    pub first_seen: DateTime<Utc>,
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(rename = "last_fail", default, deserialize_with = "deserialize_optional_timestamp")]
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(default)]
    pub best_score: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_failures: Vec<FailureEntry>,
}

impl ProxyRecord {
    pub fn new(protocol: Protocol, now: DateTime<Utc>) -> Self {
        Self {
            protocol,
            success_count: 0,
            fail_count: 0,
            avg_response_time_ms: 0.0,
            first_seen: now,
            last_success: None,
            last_failure: None,
            best_score: 0,
            recent_failures: Vec::new(),
        }
    }

    pub fn total_attempts(&self) -> u64 {
        self.success_count + self.fail_count
    }

    pub fn failure_rate(&self) -> f64 {
        match self.total_attempts() {
            0 => 0.0,
            total => self.fail_count as f64 / total as f64,
        }
    }

    pub fn success_rate(&self) -> f64 {
        match self.total_attempts() {
            0 => 0.0,
            total => self.success_count as f64 / total as f64,
        }
    }

    pub(crate) fn record_success(
        &mut self,
        now: DateTime<Utc>,
        response_time_ms: Option<f64>,
        score: Option<u8>,
    ) {
        self.success_count += 1;
        self.last_success = Some(now);

        if let Some(ms) = response_time_ms {
            let n = self.success_count as f64;
            self.avg_response_time_ms = (self.avg_response_time_ms * (n - 1.0) + ms) / n;
        }
        if let Some(score) = score {
            self.best_score = self.best_score.max(score.min(100));
        }
    }

    pub(crate) fn record_failure(&mut self, now: DateTime<Utc>, reason: &str, log_limit: usize) {
        self.fail_count += 1;
        self.last_failure = Some(now);

        if !reason.is_empty() {
            self.recent_failures.push(FailureEntry {
                time: now,
                reason: reason.to_string(),
            });
            if self.recent_failures.len() > log_limit {
                let excess = self.recent_failures.len() - log_limit;
                self.recent_failures.drain(..excess);
            }
        }
    }
}

/// `working_proxies.json` 的完整内容
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreFile {
    pub working_proxies: Vec<String>,
    pub failed_proxies: Vec<String>,
    pub proxy_stats: BTreeMap<String, ProxyRecord>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub last_updated: DateTime<Utc>,
    pub storage_version: String,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            working_proxies: Vec::new(),
            failed_proxies: Vec::new(),
            proxy_stats: BTreeMap::new(),
            last_updated: Utc::now(),
            storage_version: STORAGE_VERSION.to_string(),
        }
    }
}

impl StoreFile {
    /// 去重、保证两个列表不相交、补齐缺失的统计记录
    pub fn repair(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.working_proxies.len() + self.failed_proxies.len();

        let mut seen = HashSet::new();
        self.working_proxies
            .retain(|p| !p.is_empty() && seen.insert(p.clone()));
        let working: HashSet<String> = seen;

        let mut seen = HashSet::new();
        self.failed_proxies
            .retain(|p| !p.is_empty() && !working.contains(p) && seen.insert(p.clone()));

        for address in self.working_proxies.iter().chain(self.failed_proxies.iter()) {
            self.proxy_stats
                .entry(address.clone())
                .or_insert_with(|| ProxyRecord::new(Protocol::Http, now));
        }

        before - (self.working_proxies.len() + self.failed_proxies.len())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub working_proxies: usize,
    pub failed_proxies: usize,
    pub total_tracked: usize,
    pub average_success_rate: f64,
    pub last_updated: DateTime<Utc>,
    pub storage_file: PathBuf,
}
