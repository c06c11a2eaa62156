//! 代理持久化存储
//! 每次修改后整体重写 JSON 文件

use super::types::{ProxyRecord, STORAGE_VERSION, StorageStats, StoreFile};
use crate::config::PoolPolicy;
use crate::error::PoolResult;
use crate::proxy::{Protocol, split_scheme};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::cmp::Ordering;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ProxyStore {
    path: PathBuf,
    policy: PoolPolicy,
    data: StoreFile,
}

/// 存储主键统一为 `ip:port`
fn key_of(address: &str) -> (Protocol, String) {
    let (protocol, rest) = split_scheme(address);
    (protocol, rest.trim_end_matches('/').to_string())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn display_address(key: &str, record: Option<&ProxyRecord>) -> String {
    match record.map(|r| r.protocol).unwrap_or_default() {
        Protocol::Http => key.to_string(),
        other => format!("{}://{}", other.scheme(), key),
    }
}

impl ProxyStore {
    /// 打开存储文件；文件不存在或损坏时从空存储开始
    pub fn open<P: AsRef<Path>>(path: P, policy: PoolPolicy) -> Self {
        let path = path.as_ref().to_path_buf();
        let data = Self::load(&path);
        Self { path, policy, data }
    }

    fn load(path: &Path) -> StoreFile {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return StoreFile::default(),
            Err(e) => {
                warn!("⚠️ 读取代理存储失败 {}: {}", path.display(), e);
                Self::set_aside(path);
                return StoreFile::default();
            }
        };

        match serde_json::from_str::<StoreFile>(&content) {
            Ok(mut data) => {
                let repaired = data.repair(Utc::now());
                if repaired > 0 {
                    warn!("⚠️ 代理存储中有 {} 个重复或冲突条目，已修复", repaired);
                }
                if data.storage_version != STORAGE_VERSION {
                    debug!("存储版本 {} 将升级为 {}", data.storage_version, STORAGE_VERSION);
                    data.storage_version = STORAGE_VERSION.to_string();
                }
                info!("📂 从存储加载了 {} 个可用代理", data.working_proxies.len());
                data
            }
            Err(e) => {
                warn!("⚠️ 代理存储文件损坏 {}: {}", path.display(), e);
                Self::set_aside(path);
                StoreFile::default()
            }
        }
    }

    /// 无法解析的文件改名为 `<file>.corrupt`，避免下次保存时覆盖
    fn set_aside(path: &Path) {
        let backup = with_suffix(path, ".corrupt");
        match fs::rename(path, &backup) {
            Ok(()) => warn!("📦 原存储文件已另存为 {}", backup.display()),
            Err(e) => warn!("⚠️ 备份存储文件失败 {}: {}", backup.display(), e),
        }
    }

    /// 先写临时文件再改名覆盖
    fn save(&mut self) -> PoolResult<()> {
        self.data.last_updated = Utc::now();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(&self.data)?;
        let tmp = with_suffix(&self.path, ".tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;

        debug!(
            "💾 已保存 {} 个可用代理到 {}",
            self.data.working_proxies.len(),
            self.path.display()
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub fn record(&self, address: &str) -> Option<&ProxyRecord> {
        let (_, key) = key_of(address);
        self.data.proxy_stats.get(&key)
    }

    pub fn is_working(&self, address: &str) -> bool {
        let (_, key) = key_of(address);
        self.data.working_proxies.contains(&key)
    }

    pub fn is_failed(&self, address: &str) -> bool {
        let (_, key) = key_of(address);
        self.data.failed_proxies.contains(&key)
    }

    pub fn working_count(&self) -> usize {
        self.data.working_proxies.len()
    }

    pub fn failed_proxies(&self) -> Vec<String> {
        self.data
            .failed_proxies
            .iter()
            .map(|key| display_address(key, self.data.proxy_stats.get(key)))
            .collect()
    }

    fn rank(&self, record: Option<&ProxyRecord>, now: DateTime<Utc>) -> f64 {
        let record = match record {
            Some(r) if r.total_attempts() > 0 => r,
            _ => return self.policy.unknown_priority,
        };

        let mut score = record.success_rate();
        if let Some(last_success) = record.last_success {
            let hours = (now - last_success).num_seconds().max(0) as f64 / 3600.0;
            let recency = (1.0 - hours / self.policy.recency_decay_hours).max(self.policy.recency_floor);
            score *= recency;
        }
        score
    }

    pub fn get_working_proxies(&self) -> Vec<String> {
        self.get_working_proxies_at(Utc::now())
    }

    /// 按成功率乘以时间衰减因子降序排列，从未检测过的代理取中等优先级
    pub fn get_working_proxies_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut ranked: Vec<(f64, String)> = self
            .data
            .working_proxies
            .iter()
            .map(|key| {
                let record = self.data.proxy_stats.get(key);
                (self.rank(record, now), display_address(key, record))
            })
            .collect();

        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
        ranked.into_iter().map(|(_, address)| address).collect()
    }

    pub fn add_working_proxy(
        &mut self,
        address: &str,
        response_time_ms: Option<f64>,
        score: Option<u8>,
    ) -> PoolResult<()> {
        self.add_working_proxy_at(address, response_time_ms, score, Utc::now())
    }

    pub fn add_working_proxy_at(
        &mut self,
        address: &str,
        response_time_ms: Option<f64>,
        score: Option<u8>,
        now: DateTime<Utc>,
    ) -> PoolResult<()> {
        let (protocol, key) = key_of(address);

        if let Some(pos) = self.data.failed_proxies.iter().position(|p| *p == key) {
            self.data.failed_proxies.remove(pos);
            info!("♻️ 代理 {} 从失败列表移回可用列表", key);
        }
        if !self.data.working_proxies.contains(&key) {
            self.data.working_proxies.push(key.clone());
            info!("✅ 新增可用代理: {}", key);
        }

        let record = self
            .data
            .proxy_stats
            .entry(key)
            .or_insert_with(|| ProxyRecord::new(protocol, now));
        record.protocol = protocol;
        record.record_success(now, response_time_ms, score);

        self.save()
    }

    /// 返回本次是否将代理移入失败列表
    pub fn mark_proxy_failed(&mut self, address: &str, reason: &str) -> PoolResult<bool> {
        self.mark_proxy_failed_at(address, reason, Utc::now())
    }

    pub fn mark_proxy_failed_at(
        &mut self,
        address: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> PoolResult<bool> {
        let (protocol, key) = key_of(address);
        let limit = self.policy.recent_failure_limit;

        let record = self
            .data
            .proxy_stats
            .entry(key.clone())
            .or_insert_with(|| ProxyRecord::new(protocol, now));
        record.record_failure(now, reason, limit);

        let attempts = record.total_attempts();
        let failure_rate = record.failure_rate();
        let mut demoted = false;

        if attempts >= self.policy.min_attempts && failure_rate > self.policy.failure_rate_threshold {
            if let Some(pos) = self.data.working_proxies.iter().position(|p| *p == key) {
                self.data.working_proxies.remove(pos);
                info!(
                    "🗑️ 移除不稳定代理: {} (失败率 {:.1}%)",
                    key,
                    failure_rate * 100.0
                );
            }
            if !self.data.failed_proxies.contains(&key) {
                self.data.failed_proxies.push(key);
                demoted = true;
            }
        }

        self.save()?;
        Ok(demoted)
    }

    pub fn cleanup_old_failures(&mut self, hours: i64) -> PoolResult<Vec<String>> {
        self.cleanup_old_failures_at(hours, Utc::now())
    }

    /// 失败时间早于窗口的代理移出失败列表，统计保留，等待重新检测
    pub fn cleanup_old_failures_at(
        &mut self,
        hours: i64,
        now: DateTime<Utc>,
    ) -> PoolResult<Vec<String>> {
        let cutoff = now - Duration::hours(hours);
        let stats = &self.data.proxy_stats;

        let (expired, kept): (Vec<String>, Vec<String>) =
            self.data.failed_proxies.drain(..).partition(|key| {
                stats
                    .get(key)
                    .and_then(|r| r.last_failure)
                    .is_some_and(|last| last < cutoff)
            });
        self.data.failed_proxies = kept;

        if expired.is_empty() {
            return Ok(expired);
        }

        info!("♻️ {} 个过期失败代理获得重试机会", expired.len());
        let retried = expired
            .iter()
            .map(|key| display_address(key, self.data.proxy_stats.get(key)))
            .collect();
        self.save()?;
        Ok(retried)
    }

    pub fn get_storage_stats(&self) -> StorageStats {
        let (success, attempts) = self
            .data
            .proxy_stats
            .values()
            .fold((0u64, 0u64), |(s, t), r| (s + r.success_count, t + r.total_attempts()));

        let average_success_rate = if attempts > 0 {
            (success as f64 / attempts as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };

        StorageStats {
            working_proxies: self.data.working_proxies.len(),
            failed_proxies: self.data.failed_proxies.len(),
            total_tracked: self.data.proxy_stats.len(),
            average_success_rate,
            last_updated: self.data.last_updated,
            storage_file: self.path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, ProxyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProxyStore::open(dir.path().join("config/working_proxies.json"), PoolPolicy::default());
        (dir, store)
    }

    #[test]
    fn test_added_proxy_is_working() {
        let (_dir, mut store) = open_temp();
        store.add_working_proxy("1.2.3.4:8080", Some(150.0), Some(75)).unwrap();

        assert_eq!(store.get_working_proxies(), vec!["1.2.3.4:8080"]);
        assert!(!store.is_failed("1.2.3.4:8080"));
        let record = store.record("1.2.3.4:8080").unwrap();
        assert_eq!(record.success_count, 1);
        assert_eq!(record.best_score, 75);
        assert!(store.path().exists());
    }

    #[test]
    fn test_three_failures_demote_proxy() {
        let (_dir, mut store) = open_temp();
        store.add_working_proxy("1.2.3.4:8080", None, None).unwrap();

        assert!(!store.mark_proxy_failed("1.2.3.4:8080", "timeout").unwrap());
        assert!(!store.mark_proxy_failed("1.2.3.4:8080", "timeout").unwrap());
        assert!(store.mark_proxy_failed("1.2.3.4:8080", "timeout").unwrap());

        assert!(store.get_working_proxies().is_empty());
        assert!(store.is_failed("1.2.3.4:8080"));
        assert_eq!(store.failed_proxies(), vec!["1.2.3.4:8080"]);
        let record = store.record("1.2.3.4:8080").unwrap();
        assert_eq!(record.total_attempts(), 4);
        assert_eq!(record.recent_failures.len(), 3);
    }

    #[test]
    fn test_failures_below_min_attempts_keep_proxy() {
        let (_dir, mut store) = open_temp();
        store.mark_proxy_failed("5.5.5.5:80", "refused").unwrap();
        store.mark_proxy_failed("5.5.5.5:80", "refused").unwrap();
        assert!(!store.is_failed("5.5.5.5:80"));
        assert!(store.mark_proxy_failed("5.5.5.5:80", "refused").unwrap());
        assert!(store.is_failed("5.5.5.5:80"));
    }

    #[test]
    fn test_success_moves_proxy_out_of_failed_set() {
        let (_dir, mut store) = open_temp();
        for _ in 0..3 {
            store.mark_proxy_failed("6.6.6.6:80", "refused").unwrap();
        }
        assert!(store.is_failed("6.6.6.6:80"));

        store.add_working_proxy("6.6.6.6:80", None, None).unwrap();
        assert!(store.is_working("6.6.6.6:80"));
        assert!(!store.is_failed("6.6.6.6:80"));
    }

    #[test]
    fn test_ranking_prefers_recent_success() {
        let (_dir, mut store) = open_temp();
        let now = Utc::now();
        let stale = now - Duration::hours(20);

        store.add_working_proxy_at("1.1.1.1:80", None, None, stale).unwrap();
        store.add_working_proxy_at("2.2.2.2:80", None, None, now).unwrap();
        store.add_working_proxy_at("3.3.3.3:80", None, None, now).unwrap();
        store.mark_proxy_failed_at("3.3.3.3:80", "slow", now).unwrap();

        // 1.1.1.1: 1.0 * (1 - 20/24) ≈ 0.17，2.2.2.2: 1.0，3.3.3.3: 0.5
        assert_eq!(
            store.get_working_proxies_at(now),
            vec!["2.2.2.2:80", "3.3.3.3:80", "1.1.1.1:80"]
        );
    }

    #[test]
    fn test_socks_protocol_is_kept() {
        let (_dir, mut store) = open_temp();
        store.add_working_proxy("socks5://7.7.7.7:1080", None, None).unwrap();

        assert_eq!(store.get_working_proxies(), vec!["socks5://7.7.7.7:1080"]);
        assert!(store.is_working("7.7.7.7:1080"));
        assert_eq!(store.record("7.7.7.7:1080").unwrap().protocol, Protocol::Socks5);
    }

    #[test]
    fn test_cleanup_old_failures_is_idempotent() {
        let (_dir, mut store) = open_temp();
        let now = Utc::now();
        let old = now - Duration::hours(30);
        for _ in 0..3 {
            store.mark_proxy_failed_at("8.8.8.8:80", "refused", old).unwrap();
            store.mark_proxy_failed_at("9.9.9.9:80", "refused", now).unwrap();
        }

        let first = store.cleanup_old_failures_at(24, now).unwrap();
        assert_eq!(first, vec!["8.8.8.8:80"]);
        assert!(!store.is_failed("8.8.8.8:80"));
        assert!(!store.is_working("8.8.8.8:80"));
        assert!(store.is_failed("9.9.9.9:80"));
        assert_eq!(store.record("8.8.8.8:80").unwrap().fail_count, 3);

        let before = store.get_storage_stats();
        let second = store.cleanup_old_failures_at(24, now).unwrap();
        assert!(second.is_empty());
        let after = store.get_storage_stats();
        assert_eq!(before.working_proxies, after.working_proxies);
        assert_eq!(before.failed_proxies, after.failed_proxies);
        assert_eq!(before.last_updated, after.last_updated);
    }

    #[test]
    fn test_reload_preserves_partition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let mut store = ProxyStore::open(&path, PoolPolicy::default());
        store.add_working_proxy("1.1.1.1:80", Some(10.0), Some(100)).unwrap();
        store.add_working_proxy("socks4://2.2.2.2:1080", None, None).unwrap();
        for _ in 0..3 {
            store.mark_proxy_failed("3.3.3.3:80", "refused").unwrap();
        }

        let reloaded = ProxyStore::open(&path, PoolPolicy::default());

        let working: HashSet<String> = store.get_working_proxies().into_iter().collect();
        let reloaded_working: HashSet<String> = reloaded.get_working_proxies().into_iter().collect();
        assert_eq!(working, reloaded_working);
        assert_eq!(store.failed_proxies(), reloaded.failed_proxies());
        assert_eq!(
            store.record("1.1.1.1:80"),
            reloaded.record("1.1.1.1:80")
        );
    }

    #[test]
    fn test_store_with_naive_timestamps_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("working_proxies.json");
        fs::write(
            &path,
            r#"{
  "working_proxies": ["50.1.1.1:80"],
  "failed_proxies": ["50.2.2.2:3128"],
  "proxy_stats": {
    "50.1.1.1:80": {
      "success_count": 4,
      "fail_count": 1,
      "avg_response_time": 812.5,
      "first_seen": "2024-04-28T07:12:45.001122",
      "last_success": "2024-05-01T10:00:00.123456",
      "last_fail": "2024-04-30T22:10:03.5",
      "best_score": 100
    },
    "50.2.2.2:3128": {
      "success_count": 0,
      "fail_count": 3,
      "avg_response_time": 0,
      "first_seen": "2024-04-29T01:00:00",
      "last_success": null,
      "last_fail": "2024-04-29T01:05:00.000001",
      "best_score": 0,
      "recent_failures": [{"time": "2024-04-29T01:05:00.000001", "reason": "timeout"}]
    }
  },
  "last_updated": "2024-05-01T10:00:00.123456"
}"#,
        )
        .unwrap();

        let mut store = ProxyStore::open(&path, PoolPolicy::default());
        assert_eq!(store.working_count(), 1);
        assert!(store.is_failed("50.2.2.2:3128"));
        assert_eq!(store.record("50.1.1.1:80").unwrap().success_count, 4);

        store.add_working_proxy("50.3.3.3:80", None, None).unwrap();
        let reloaded = ProxyStore::open(&path, PoolPolicy::default());
        assert!(reloaded.is_working("50.1.1.1:80"));
        assert!(reloaded.is_working("50.3.3.3:80"));
        assert_eq!(reloaded.record("50.1.1.1:80").unwrap().avg_response_time_ms, 812.5);
    }

    #[test]
    fn test_corrupt_file_is_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let corrupt = dir.path().join("corrupt.json");
        fs::write(&corrupt, "{not json").unwrap();

        let mut store = ProxyStore::open(&corrupt, PoolPolicy::default());
        assert_eq!(store.working_count(), 0);
        store.add_working_proxy("1.1.1.1:80", None, None).unwrap();

        let backup = dir.path().join("corrupt.json.corrupt");
        assert_eq!(fs::read_to_string(backup).unwrap(), "{not json");
        assert!(ProxyStore::open(&corrupt, PoolPolicy::default()).is_working("1.1.1.1:80"));
    }

    #[test]
    fn test_overlapping_lists_are_repaired() {
        let dir = tempfile::tempdir().unwrap();

        let overlapping = dir.path().join("overlap.json");
        fs::write(
            &overlapping,
            r#"{"working_proxies": ["1.1.1.1:80"], "failed_proxies": ["1.1.1.1:80", "2.2.2.2:80"]}"#,
        )
        .unwrap();
        let store = ProxyStore::open(&overlapping, PoolPolicy::default());
        assert!(store.is_working("1.1.1.1:80"));
        assert!(!store.is_failed("1.1.1.1:80"));
        assert!(store.is_failed("2.2.2.2:80"));
        assert!(store.record("2.2.2.2:80").is_some());
    }

    #[test]
    fn test_storage_stats() {
        let (_dir, mut store) = open_temp();
        store.add_working_proxy("1.1.1.1:80", None, None).unwrap();
        store.add_working_proxy("1.1.1.1:80", None, None).unwrap();
        store.mark_proxy_failed("2.2.2.2:80", "refused").unwrap();

        let stats = store.get_storage_stats();
        assert_eq!(stats.working_proxies, 1);
        assert_eq!(stats.failed_proxies, 0);
        assert_eq!(stats.total_tracked, 2);
        assert_eq!(stats.average_success_rate, 66.7);
    }
}
