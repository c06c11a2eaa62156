//! 候选代理过滤：丢弃格式错误、内网地址以及 CDN/边缘节点网段

use super::ProxyCandidate;
use crate::config::FilterConfig;
use crate::error::PoolResult;
use ipnetwork::Ipv4Network;
use log::debug;
use rayon::prelude::*;
use std::collections::HashSet;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    denylist: Vec<Ipv4Network>,
}

impl CandidateFilter {
    pub fn new(denylist: Vec<Ipv4Network>) -> Self {
        Self { denylist }
    }

    pub fn from_config(config: &FilterConfig) -> PoolResult<Self> {
        Ok(Self::new(config.denylist_networks()?))
    }

    pub fn is_denied(&self, ip: Ipv4Addr) -> bool {
        self.denylist.iter().any(|net| net.contains(ip))
    }

    /// 结果保持输入顺序，重复项只保留第一次出现
    pub fn filter(&self, candidates: &[String]) -> Vec<String> {
        let accepted: Vec<Option<ProxyCandidate>> =
            candidates.par_iter().map(|raw| self.accept(raw)).collect();

        let mut seen = HashSet::new();
        let filtered: Vec<String> = accepted
            .into_iter()
            .flatten()
            .filter(|candidate| seen.insert(candidate.address()))
            .map(|candidate| candidate.to_string())
            .collect();

        debug!(
            "候选过滤: {} 个输入，保留 {} 个",
            candidates.len(),
            filtered.len()
        );
        filtered
    }

    fn accept(&self, raw: &str) -> Option<ProxyCandidate> {
        let candidate = match raw.parse::<ProxyCandidate>() {
            Ok(c) => c,
            Err(e) => {
                debug!("丢弃候选 {}: {}", raw, e);
                return None;
            }
        };

        let ip = candidate.ip;
        if ip.is_private()
            || ip.is_loopback()
            || ip.is_link_local()
            || ip.is_unspecified()
            || ip.is_broadcast()
        {
            debug!("丢弃内网/保留地址 {}", raw);
            return None;
        }

        if self.is_denied(ip) {
            debug!("丢弃 CDN 网段地址 {}", raw);
            return None;
        }

        Some(candidate)
    }
}
