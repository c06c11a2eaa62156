//! 代理批量检测：有界并发地探测候选代理并计算综合评分

mod probe;

pub use probe::{HttpProbe, count_keyword_hits};

use crate::config::ValidatorConfig;
use crate::ui::progress::{ProgressStage, ProgressTracker};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};

/// 每项检测通过计 25 分
pub const CHECK_WEIGHT: u8 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    /// 只检测基本连通性
    Quick,
    /// 连通性、健康检查、目标页面、内容校验四项
    Full,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub basic_connectivity: bool,
    pub health_check: bool,
    pub target_page: bool,
    pub content_validation: bool,
    pub response_time_ms: Option<f64>,
    pub origin_ip: Option<String>,
}

impl ProbeReport {
    /// 基本连通性失败时总分为 0
    pub fn score(&self) -> u8 {
        if !self.basic_connectivity {
            return 0;
        }
        let passed = [
            self.basic_connectivity,
            self.health_check,
            self.target_page,
            self.content_validation,
        ]
        .iter()
        .filter(|&&ok| ok)
        .count() as u8;
        passed * CHECK_WEIGHT
    }
}

/// 探测单个代理的能力，HTTP 实现见 [`HttpProbe`]
#[async_trait]
pub trait ProxyProbe: Send + Sync {
    async fn check(&self, candidate: &str, mode: CheckMode) -> anyhow::Result<ProbeReport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Working,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub candidate: String,
    pub report: ProbeReport,
    pub score: u8,
    pub verdict: Verdict,
    pub error: Option<String>,
}

impl ValidationResult {
    fn failed(candidate: String, error: String) -> Self {
        Self {
            candidate,
            report: ProbeReport::default(),
            score: 0,
            verdict: Verdict::Failed,
            error: Some(error),
        }
    }

    pub fn is_working(&self) -> bool {
        self.verdict == Verdict::Working
    }

    pub fn failure_reason(&self) -> String {
        match &self.error {
            Some(e) => format!("检测错误: {}", e),
            None => format!("检测未通过 (评分 {})", self.score),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub results: Vec<ValidationResult>,
    pub stopped_early: bool,
}

impl BatchReport {
    /// 按评分降序、响应时间升序排列
    pub fn working(&self) -> Vec<String> {
        let mut working: Vec<&ValidationResult> =
            self.results.iter().filter(|r| r.is_working()).collect();
        working.sort_by(|a, b| {
            b.score.cmp(&a.score).then_with(|| {
                let a_ms = a.report.response_time_ms.unwrap_or(f64::MAX);
                let b_ms = b.report.response_time_ms.unwrap_or(f64::MAX);
                a_ms.total_cmp(&b_ms)
            })
        });
        working.into_iter().map(|r| r.candidate.clone()).collect()
    }

    pub fn count(&self, verdict: Verdict) -> usize {
        self.results.iter().filter(|r| r.verdict == verdict).count()
    }
}

pub struct ProxyValidator<P> {
    probe: Arc<P>,
    max_workers: usize,
    quick_workers: usize,
    working_score: u8,
    partial_score: u8,
    early_exit_target: usize,
}

impl<P: ProxyProbe + 'static> ProxyValidator<P> {
    pub fn new(probe: P, config: &ValidatorConfig) -> Self {
        Self {
            probe: Arc::new(probe),
            max_workers: config.max_workers.max(1),
            quick_workers: config.quick_workers.max(1),
            working_score: config.working_score,
            partial_score: config.partial_score,
            early_exit_target: config.early_exit_target,
        }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// 完整检测一批候选，找到足够多的可用代理后不再提交新任务
    pub async fn validate_batch(
        &self,
        candidates: Vec<String>,
        progress: &ProgressTracker,
    ) -> BatchReport {
        info!(
            "🚀 并发检测 {} 个候选代理 (并发数 {})",
            candidates.len(),
            self.max_workers
        );
        let stop_after = (self.early_exit_target > 0).then_some(self.early_exit_target);
        let report = self
            .run(candidates, CheckMode::Full, self.max_workers, stop_after, progress)
            .await;

        info!(
            "📈 检测结果: 可用 {} / 部分可用 {} / 失败 {}",
            report.count(Verdict::Working),
            report.count(Verdict::Partial),
            report.count(Verdict::Failed)
        );
        report
    }

    /// 仅检测连通性，返回 `(候选, 是否通过)`
    pub async fn quick_check_batch(
        &self,
        candidates: Vec<String>,
        progress: &ProgressTracker,
    ) -> Vec<ValidationResult> {
        info!("🚀 快速检测 {} 个已存储代理", candidates.len());
        self.run(candidates, CheckMode::Quick, self.quick_workers, None, progress)
            .await
            .results
    }

    fn classify(&self, mode: CheckMode, report: &ProbeReport) -> (u8, Verdict) {
        let score = report.score();
        let verdict = match mode {
            CheckMode::Quick if report.basic_connectivity => Verdict::Working,
            CheckMode::Quick => Verdict::Failed,
            CheckMode::Full if score >= self.working_score => Verdict::Working,
            CheckMode::Full if score >= self.partial_score && score > 0 => Verdict::Partial,
            CheckMode::Full => Verdict::Failed,
        };
        (score, verdict)
    }

    fn absorb(
        &self,
        mode: CheckMode,
        candidate: String,
        outcome: anyhow::Result<ProbeReport>,
        pending: &mut HashMap<String, usize>,
        results: &mut Vec<ValidationResult>,
        progress: &ProgressTracker,
    ) {
        if let Some(count) = pending.get_mut(&candidate) {
            *count -= 1;
            if *count == 0 {
                pending.remove(&candidate);
            }
        }

        let result = match outcome {
            Ok(report) => {
                let (score, verdict) = self.classify(mode, &report);
                ValidationResult {
                    candidate,
                    report,
                    score,
                    verdict,
                    error: None,
                }
            }
            Err(e) => ValidationResult::failed(candidate, format!("{:#}", e)),
        };

        debug!(
            "{} {:?} (评分 {})",
            result.candidate, result.verdict, result.score
        );
        progress.record(stage_of(mode), result.verdict != Verdict::Failed);
        results.push(result);
    }

    async fn run(
        &self,
        candidates: Vec<String>,
        mode: CheckMode,
        workers: usize,
        stop_after: Option<usize>,
        progress: &ProgressTracker,
    ) -> BatchReport {
        let stage = stage_of(mode);
        progress.start(stage, candidates.len() as u64);

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let (tx, mut rx) = mpsc::channel(candidates.len().max(1));
        let mut pending: HashMap<String, usize> = HashMap::new();
        let mut results = Vec::with_capacity(candidates.len());
        let mut stopped_early = false;

        for candidate in candidates {
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            while let Ok((done, outcome)) = rx.try_recv() {
                self.absorb(mode, done, outcome, &mut pending, &mut results, progress);
            }
            if let Some(target) = stop_after {
                if results.iter().filter(|r| r.is_working()).count() >= target {
                    info!("🎯 已找到 {} 个可用代理，停止提交新任务", target);
                    stopped_early = true;
                    break;
                }
            }

            *pending.entry(candidate.clone()).or_insert(0) += 1;
            let tx = tx.clone();
            let probe = Arc::clone(&self.probe);
            tokio::spawn(async move {
                let outcome = probe.check(&candidate, mode).await;
                // 先回传结果再释放许可，主循环拿到许可时结果已在通道中
                let _ = tx.send((candidate, outcome)).await;
                drop(permit);
            });
        }

        // 关闭发送端，所有任务结束后接收端退出
        drop(tx);
        while let Some((done, outcome)) = rx.recv().await {
            self.absorb(mode, done, outcome, &mut pending, &mut results, progress);
        }

        // 任务 panic 时不会回传结果
        for (candidate, count) in pending {
            for _ in 0..count {
                progress.record(stage, false);
                results.push(ValidationResult::failed(
                    candidate.clone(),
                    "检测任务异常退出".to_string(),
                ));
            }
        }

        progress.finish(stage);
        BatchReport {
            results,
            stopped_early,
        }
    }
}

fn stage_of(mode: CheckMode) -> ProgressStage {
    match mode {
        CheckMode::Quick => ProgressStage::Quick,
        CheckMode::Full => ProgressStage::Full,
    }
}
