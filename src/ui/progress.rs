use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStage {
    /// 已存储代理快速检测
    Quick,
    /// 新候选完整检测
    Full,
}

#[derive(Clone)]
pub struct ProgressTracker {
    multi_progress: Option<Arc<MultiProgress>>,
    quick_progress: Option<ProgressBar>,
    full_progress: Option<ProgressBar>,
    total_nodes: Arc<AtomicU64>,
    checked_nodes: Arc<AtomicU64>,
    passed_nodes: Arc<AtomicU64>,
}

impl ProgressTracker {
    pub fn new(enabled: bool) -> Self {
        if !enabled {
            return Self::disabled();
        }

        let multi_progress = Arc::new(MultiProgress::new());

        // 快速检测进度
        let quick_progress = multi_progress.add(ProgressBar::new(0));
        quick_progress.set_style(stage_style(
            "  {spinner:.yellow} 快速检测: [{bar:30.yellow}] {pos}/{len} {msg}",
        ));

        // 完整检测进度
        let full_progress = multi_progress.add(ProgressBar::new(0));
        full_progress.set_style(stage_style(
            "  {spinner:.green} 完整检测: [{bar:30.green}] {pos}/{len} {msg}",
        ));

        Self {
            multi_progress: Some(multi_progress),
            quick_progress: Some(quick_progress),
            full_progress: Some(full_progress),
            total_nodes: Arc::new(AtomicU64::new(0)),
            checked_nodes: Arc::new(AtomicU64::new(0)),
            passed_nodes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn disabled() -> Self {
        Self {
            multi_progress: None,
            quick_progress: None,
            full_progress: None,
            total_nodes: Arc::new(AtomicU64::new(0)),
            checked_nodes: Arc::new(AtomicU64::new(0)),
            passed_nodes: Arc::new(AtomicU64::new(0)),
        }
    }

    fn bar(&self, stage: ProgressStage) -> Option<&ProgressBar> {
        match stage {
            ProgressStage::Quick => self.quick_progress.as_ref(),
            ProgressStage::Full => self.full_progress.as_ref(),
        }
    }

    pub fn start(&self, stage: ProgressStage, total: u64) {
        self.total_nodes.fetch_add(total, Ordering::Relaxed);

        if let Some(pb) = self.bar(stage) {
            pb.reset();
            pb.set_length(total);
            pb.set_position(0);
        }
    }

    pub fn record(&self, stage: ProgressStage, success: bool) {
        self.checked_nodes.fetch_add(1, Ordering::Relaxed);
        if success {
            self.passed_nodes.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(pb) = self.bar(stage) {
            pb.inc(1);
            if success {
                pb.set_message("✅");
            } else {
                pb.set_message("❌");
            }
        }
    }

    pub fn finish(&self, stage: ProgressStage) {
        if let Some(pb) = self.bar(stage) {
            pb.finish_with_message("完成");
        }
    }

    pub fn get_stats(&self) -> ProgressStats {
        ProgressStats {
            total: self.total_nodes.load(Ordering::Relaxed),
            checked: self.checked_nodes.load(Ordering::Relaxed),
            passed: self.passed_nodes.load(Ordering::Relaxed),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.multi_progress.is_some()
    }
}

fn stage_style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressStats {
    pub total: u64,
    pub checked: u64,
    pub passed: u64,
}

impl ProgressStats {
    pub fn success_rate(&self) -> f64 {
        if self.checked > 0 {
            (self.passed as f64 / self.checked as f64) * 100.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_tracker_still_counts() {
        let tracker = ProgressTracker::disabled();
        assert!(!tracker.is_enabled());

        tracker.start(ProgressStage::Full, 4);
        tracker.record(ProgressStage::Full, true);
        tracker.record(ProgressStage::Full, false);
        tracker.finish(ProgressStage::Full);

        let stats = tracker.get_stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.checked, 2);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.success_rate(), 50.0);
    }
}
