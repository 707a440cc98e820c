//! 派生视图：按分类拆分、全部合并、合并后再按状态拆分
//!
//! 视图节点只保存指向真实节点的 `base`，状态分组每次都从真实节点的状态位重新计算。

use std::collections::HashMap;

use crate::core::node::{NodeArena, NodeId, NodeKind};
use crate::core::status::StatusGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewNode {
    pub base: NodeId,
}

/// 四个状态分组
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusBuckets {
    groups: [Vec<ViewNode>; 4],
}

impl StatusBuckets {
    pub fn group(&self, group: StatusGroup) -> &[ViewNode] {
        &self.groups[group.index()]
    }

    pub fn len(&self, group: StatusGroup) -> usize {
        self.groups[group.index()].len()
    }

    pub fn total(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.groups.iter().any(|g| g.iter().any(|v| v.base == id))
    }

    fn push(&mut self, group: StatusGroup, id: NodeId) {
        self.groups[group.index()].push(ViewNode { base: id });
    }

    fn extend(&mut self, other: &StatusBuckets) {
        for (mine, theirs) in self.groups.iter_mut().zip(other.groups.iter()) {
            mine.extend_from_slice(theirs);
        }
    }
}

/// 所有派生视图
#[derive(Debug, Default)]
pub struct ViewSet {
    split: HashMap<NodeId, StatusBuckets>,
    mix: Vec<ViewNode>,
    mix_split: StatusBuckets,
}

impl ViewSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某个分类按状态拆分后的视图
    pub fn split(&self, category: NodeId) -> Option<&StatusBuckets> {
        self.split.get(&category)
    }

    /// 所有分类的下载合并在一起
    pub fn mix(&self) -> &[ViewNode] {
        &self.mix
    }

    /// 合并后再按状态拆分
    pub fn mix_split(&self) -> &StatusBuckets {
        &self.mix_split
    }

    /// 任意视图是否还引用该节点
    pub fn references(&self, id: NodeId) -> bool {
        self.mix.iter().any(|v| v.base == id)
            || self.mix_split.contains(id)
            || self.split.values().any(|b| b.contains(id))
    }

    /// 重新计算一个分类的拆分视图，然后重建合并视图
    pub fn refresh_category(&mut self, real: &NodeArena, category: NodeId) {
        match real.get(category) {
            Some(node) if node.kind == NodeKind::Category => {
                self.split.insert(category, Self::bucket_category(real, category));
            }
            _ => {
                self.split.remove(&category);
            }
        }
        self.rebuild_mix(real);
    }

    /// 全部重建
    pub fn rebuild(&mut self, real: &NodeArena) {
        self.split.clear();
        for &category in real.roots() {
            if real.get(category).map(|n| n.kind) == Some(NodeKind::Category) {
                self.split.insert(category, Self::bucket_category(real, category));
            }
        }
        self.rebuild_mix(real);
    }

    fn bucket_category(real: &NodeArena, category: NodeId) -> StatusBuckets {
        let mut buckets = StatusBuckets::default();
        for &child in real.children(category) {
            if let Some(node) = real.get(child) {
                if node.kind == NodeKind::Download {
                    buckets.push(node.data.status().group(), child);
                }
            }
        }
        buckets
    }

    fn rebuild_mix(&mut self, real: &NodeArena) {
        self.mix.clear();
        self.mix_split = StatusBuckets::default();
        for &category in real.roots() {
            let Some(buckets) = self.split.get(&category) else {
                continue;
            };
            self.mix_split.extend(buckets);
            for &child in real.children(category) {
                if real.get(child).map(|n| n.kind) == Some(NodeKind::Download) {
                    self.mix.push(ViewNode { base: child });
                }
            }
        }
    }
}
