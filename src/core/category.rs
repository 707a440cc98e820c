use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::node::NodeId;
use crate::utils::validator::file_ext_from_uri;

/// 分类匹配规则，均不区分大小写
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchRules {
    pub schemes: Vec<String>,
    /// 支持 `*` 通配，例如 `*.example.com`
    pub hosts: Vec<String>,
    pub file_exts: Vec<String>,
}

impl MatchRules {
    pub fn is_empty(&self) -> bool {
        self.schemes.is_empty() && self.hosts.is_empty() && self.file_exts.is_empty()
    }

    /// 任意一条规则命中即视为匹配；没有规则的分类不匹配任何URI
    pub fn matches(&self, uri: &str) -> bool {
        let parsed = match Url::parse(uri) {
            Ok(url) => url,
            Err(_) => return false,
        };
        let scheme = parsed.scheme();
        if self.schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme)) {
            return true;
        }
        if let Some(host) = parsed.host_str() {
            if self.hosts.iter().any(|pattern| host_matches(pattern, host)) {
                return true;
            }
        }
        if let Some(ext) = file_ext_from_uri(uri) {
            if self.file_exts.iter().any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext)) {
                return true;
            }
        }
        false
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if !pattern.contains('*') {
        return pattern.eq_ignore_ascii_case(host);
    }
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match Regex::new(&format!("(?i)^{}$", body)) {
        Ok(re) => re.is_match(host),
        Err(e) => {
            log::warn!("无效的主机匹配规则 {}: {}", pattern, e);
            false
        }
    }
}

/// 分类：匹配规则加各状态的数量上限（0 表示不限）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub rules: MatchRules,
    pub active_limit: usize,
    /// 已完成（完成或出错）节点的保留上限
    pub finished_limit: usize,
    pub recycled_limit: usize,
}

impl Category {
    pub fn new(rules: MatchRules) -> Self {
        Self {
            rules,
            active_limit: 3,
            finished_limit: 300,
            recycled_limit: 300,
        }
    }

    pub fn with_limits(mut self, active: usize, finished: usize, recycled: usize) -> Self {
        self.active_limit = active;
        self.finished_limit = finished;
        self.recycled_limit = recycled;
        self
    }
}

pub(crate) fn under_limit(count: usize, limit: usize) -> bool {
    limit == 0 || count < limit
}

pub(crate) fn over_limit(count: usize, limit: usize) -> bool {
    limit != 0 && count > limit
}

/// 分类的导出形式，供外部持久化使用（本库不定义磁盘格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryExport {
    pub id: NodeId,
    pub name: Option<String>,
    pub rules: MatchRules,
    pub active_limit: usize,
    pub finished_limit: usize,
    pub recycled_limit: usize,
    pub active: Vec<NodeId>,
    pub queuing: Vec<NodeId>,
    pub finished: Vec<NodeId>,
    pub recycled: Vec<NodeId>,
}
