//! 代理池管理器
//! 负责完整的获取周期，并对外提供最佳代理选择与失败反馈

use super::storage::ProxyStore;
use crate::check::{HttpProbe, ProxyProbe, ProxyValidator, Verdict};
use crate::config::Config;
use crate::error::{PoolError, PoolResult};
use crate::proxy::{CandidateFilter, ProxyCandidate};
use crate::ui::progress::{ProgressStats, ProgressTracker};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// 获取周期的阶段，仅用于日志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CyclePhase {
    CheckStored,
    FetchCandidates,
    Filter,
    Validate,
    Persist,
    Done,
}

/// 本次代理池的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolOrigin {
    /// 已存储代理快速检测通过
    Stored,
    /// 新获取的候选检测通过
    Fresh,
    /// 没有可用代理
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionReport {
    pub origin: PoolOrigin,
    pub tested: usize,
    pub working: usize,
}

impl AcquisitionReport {
    fn empty() -> Self {
        Self {
            origin: PoolOrigin::Empty,
            tested: 0,
            working: 0,
        }
    }
}

/// 调用方建立连接时的选择
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPlan {
    Proxy(String),
    Direct,
}

pub struct ProxyManager<P = HttpProbe> {
    config: Config,
    store: ProxyStore,
    validator: ProxyValidator<P>,
    filter: CandidateFilter,
    client: Client,
    live_pool: Vec<String>,
    failure_counts: HashMap<String, u32>,
    last_refresh: Option<DateTime<Utc>>,
    progress: ProgressTracker,
}

impl ProxyManager<HttpProbe> {
    pub fn new(config: Config) -> PoolResult<Self> {
        let probe = HttpProbe::new(&config.validator);
        Self::with_probe(config, probe)
    }
}

impl<P: ProxyProbe + 'static> ProxyManager<P> {
    pub fn with_probe(config: Config, probe: P) -> PoolResult<Self> {
        config.validate()?;

        let filter = CandidateFilter::from_config(&config.filter)?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.manager.source_timeout_ms))
            .build()
            .map_err(|e| PoolError::InvalidConfig(format!("创建 HTTP 客户端失败: {}", e)))?;
        let store = ProxyStore::open(&config.storage_file, config.pool.clone());
        let validator = ProxyValidator::new(probe, &config.validator);
        let progress = ProgressTracker::new(config.print_progress);

        Ok(Self {
            config,
            store,
            validator,
            filter,
            client,
            live_pool: Vec::new(),
            failure_counts: HashMap::new(),
            last_refresh: None,
            progress,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ProxyStore {
        &self.store
    }

    /// 当前内存中的代理池，按优先级排列
    pub fn pool_snapshot(&self) -> &[String] {
        &self.live_pool
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }

    pub fn progress_stats(&self) -> ProgressStats {
        self.progress.get_stats()
    }

    fn enter(&self, phase: CyclePhase) {
        debug!("获取周期阶段: {:?}", phase);
    }

    /// 执行一次完整的获取周期并替换内存代理池
    pub async fn acquire(&mut self) -> AcquisitionReport {
        if !self.config.session.proxies_enabled() {
            info!("🔌 当前会话不使用代理");
            self.live_pool.clear();
            return AcquisitionReport::empty();
        }

        let retried = match self.store.cleanup_old_failures(self.config.pool.amnesty_hours) {
            Ok(retried) => retried,
            Err(e) => {
                warn!("⚠️ 清理过期失败代理时保存失败: {}", e);
                Vec::new()
            }
        };

        self.enter(CyclePhase::CheckStored);
        let (stored_tested, stored_working) = self.check_stored().await;
        if !stored_working.is_empty() && stored_working.len() >= self.config.manager.min_stored_working {
            info!("♻️ 使用 {} 个已存储的可用代理", stored_working.len());
            let working = stored_working.len();
            self.replace_pool(stored_working);
            self.enter(CyclePhase::Done);
            return AcquisitionReport {
                origin: PoolOrigin::Stored,
                tested: stored_tested,
                working,
            };
        }

        // 重新参与检测的代理排在最前，不会被批量上限截掉
        self.enter(CyclePhase::FetchCandidates);
        let mut candidates = retried;
        candidates.extend(self.fetch_candidates().await);

        self.enter(CyclePhase::Filter);
        let batch = self.prepare_batch(&candidates, &stored_working);
        if batch.is_empty() {
            warn!("⚠️ 没有可检测的候选代理");
            let summary = AcquisitionReport {
                origin: if stored_working.is_empty() {
                    PoolOrigin::Empty
                } else {
                    PoolOrigin::Stored
                },
                tested: stored_tested,
                working: stored_working.len(),
            };
            self.replace_pool(stored_working);
            self.enter(CyclePhase::Done);
            return summary;
        }

        self.enter(CyclePhase::Validate);
        let report = self.validator.validate_batch(batch, &self.progress).await;

        self.enter(CyclePhase::Persist);
        for result in &report.results {
            let saved = match result.verdict {
                Verdict::Working | Verdict::Partial => self.store.add_working_proxy(
                    &result.candidate,
                    result.report.response_time_ms,
                    Some(result.score),
                ),
                Verdict::Failed => self
                    .store
                    .mark_proxy_failed(&result.candidate, &result.failure_reason())
                    .map(|_| ()),
            };
            if let Err(e) = saved {
                warn!("⚠️ 保存 {} 的检测结果失败: {}", result.candidate, e);
            }
        }

        let fresh = report.working();
        let origin = match (fresh.is_empty(), stored_working.is_empty()) {
            (false, _) => PoolOrigin::Fresh,
            (true, false) => PoolOrigin::Stored,
            (true, true) => PoolOrigin::Empty,
        };

        // 已存储且通过快速检测的代理优先
        let mut pool = stored_working;
        for candidate in fresh {
            if !pool.contains(&candidate) {
                pool.push(candidate);
            }
        }

        let summary = AcquisitionReport {
            origin,
            tested: stored_tested + report.results.len(),
            working: pool.len(),
        };
        info!(
            "📊 获取完成: 检测 {} 个，可用 {} 个",
            summary.tested, summary.working
        );
        self.replace_pool(pool);
        self.enter(CyclePhase::Done);
        summary
    }

    fn replace_pool(&mut self, pool: Vec<String>) {
        self.live_pool = pool;
        self.last_refresh = Some(Utc::now());
    }

    /// 快速检测排名靠前的已存储代理，返回 (检测数量, 通过列表)
    async fn check_stored(&mut self) -> (usize, Vec<String>) {
        let sample: Vec<String> = self
            .store
            .get_working_proxies()
            .into_iter()
            .take(self.config.manager.stored_sample_size)
            .collect();
        if sample.is_empty() {
            return (0, Vec::new());
        }

        let results = self
            .validator
            .quick_check_batch(sample.clone(), &self.progress)
            .await;

        let mut passed = HashSet::new();
        for result in &results {
            let saved = if result.is_working() {
                passed.insert(result.candidate.clone());
                self.store
                    .add_working_proxy(&result.candidate, result.report.response_time_ms, None)
            } else {
                self.store
                    .mark_proxy_failed(&result.candidate, &result.failure_reason())
                    .map(|_| ())
            };
            if let Err(e) = saved {
                warn!("⚠️ 保存 {} 的检测结果失败: {}", result.candidate, e);
            }
        }

        // 保持存储中的排名顺序
        let working = sample.into_iter().filter(|c| passed.contains(c)).collect();
        (results.len(), working)
    }

    async fn fetch_candidates(&self) -> Vec<String> {
        let limit = self.config.manager.sufficient_candidates;
        let mut candidates = Vec::new();

        for source in self.config.active_sources() {
            if candidates.len() >= limit {
                info!("📦 已收集 {} 个候选代理，停止获取", candidates.len());
                break;
            }
            debug!("从 {} 获取候选代理", source.name());
            candidates.extend(source.fetch(&self.client).await);
        }
        candidates
    }

    fn prepare_batch(&self, candidates: &[String], already_working: &[String]) -> Vec<String> {
        let mut batch: Vec<String> = self
            .filter
            .filter(candidates)
            .into_iter()
            .filter(|c| !self.store.is_failed(c) && !already_working.contains(c))
            .collect();
        batch.truncate(self.config.manager.batch_limit);
        info!(
            "🔍 {} 个候选代理，过滤后检测 {} 个",
            candidates.len(),
            batch.len()
        );
        batch
    }

    /// 返回内存失败次数最少的代理，池为空时先获取，再不行做一次紧急获取
    pub async fn get_best_proxy(&mut self) -> Option<String> {
        if !self.config.session.proxies_enabled() {
            return None;
        }

        if self.live_pool.is_empty() {
            self.acquire().await;
        }
        if self.live_pool.is_empty() {
            warn!("🚨 代理池为空，执行紧急获取");
            self.acquire().await;
        }

        self.live_pool
            .iter()
            .min_by_key(|p| self.failure_counts.get(*p).copied().unwrap_or(0))
            .cloned()
    }

    /// 记录调用方遇到的代理失败，池过小时自动补充
    pub async fn mark_proxy_failed(&mut self, address: &str, reason: &str) {
        let address = canonical(address);
        let address = address.as_str();
        *self.failure_counts.entry(address.to_string()).or_insert(0) += 1;

        match self.store.mark_proxy_failed(address, reason) {
            Ok(true) => info!("🗑️ 代理 {} 已移入失败列表", address),
            Ok(false) => {}
            Err(e) => warn!("⚠️ 保存代理失败记录出错: {}", e),
        }

        self.live_pool.retain(|p| p != address);
        debug!("代理池剩余 {} 个", self.live_pool.len());

        if self.config.session.proxies_enabled()
            && self.live_pool.len() <= self.config.manager.low_water_mark
        {
            info!("🔄 代理池仅剩 {} 个，重新获取", self.live_pool.len());
            self.acquire().await;
        }
    }

    pub async fn connection_plan(&mut self) -> PoolResult<ConnectionPlan> {
        if !self.config.session.proxies_enabled() {
            return Ok(ConnectionPlan::Direct);
        }

        match self.get_best_proxy().await {
            Some(proxy) => Ok(ConnectionPlan::Proxy(proxy)),
            None if self.config.session.fallback_to_direct => {
                warn!("⚠️ 没有可用代理，回退到直连");
                Ok(ConnectionPlan::Direct)
            }
            None => Err(PoolError::Exhausted),
        }
    }
}

/// 与代理池条目一致的规范形式，无法解析时原样返回
fn canonical(address: &str) -> String {
    address
        .parse::<ProxyCandidate>()
        .map(|candidate| candidate.to_string())
        .unwrap_or_else(|_| address.trim().to_string())
}
