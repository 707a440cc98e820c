//! 节点树的存储
//!
//! 所有节点由 [`NodeArena`] 独占，父子关系只保存 [`NodeId`]。
//! 派生视图同样只保存 id，因此不存在引用环。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::data::DataBundle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn new() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Category,
    Download,
    /// 后端发布的子文件
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub data: DataBundle,
}

/// 真实树：顶层是分类节点，分类下是下载节点
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: HashMap<NodeId, Node>,
    roots: Vec<NodeId>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.nodes.get(&id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// 插入新节点；`parent` 为 None 时作为顶层节点，`before` 指定插入位置
    pub fn insert(&mut self, kind: NodeKind, data: DataBundle, parent: Option<NodeId>, before: Option<NodeId>) -> NodeId {
        let id = NodeId::new();
        self.nodes.insert(id, Node { id, kind, parent, children: Vec::new(), data });
        self.link(id, parent, before);
        id
    }

    /// 移动节点到新的父节点下，`before` 为 None 时追加到末尾
    pub fn relink(&mut self, id: NodeId, parent: Option<NodeId>, before: Option<NodeId>) {
        self.unlink(id);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = parent;
        }
        self.link(id, parent, before);
    }

    /// 删除节点及其所有子节点，返回被删除的节点（自身在前）
    pub fn remove(&mut self, id: NodeId) -> Vec<Node> {
        if !self.nodes.contains_key(&id) {
            return Vec::new();
        }
        self.unlink(id);
        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children.iter().copied());
                removed.push(node);
            }
        }
        removed
    }

    fn siblings_mut(&mut self, parent: Option<NodeId>) -> Option<&mut Vec<NodeId>> {
        match parent {
            Some(pid) => self.nodes.get_mut(&pid).map(|p| &mut p.children),
            None => Some(&mut self.roots),
        }
    }

    fn link(&mut self, id: NodeId, parent: Option<NodeId>, before: Option<NodeId>) {
        if let Some(siblings) = self.siblings_mut(parent) {
            let position = before.and_then(|b| siblings.iter().position(|s| *s == b));
            match position {
                Some(index) => siblings.insert(index, id),
                None => siblings.push(id),
            }
        }
    }

    fn unlink(&mut self, id: NodeId) {
        let parent = match self.nodes.get(&id) {
            Some(node) => node.parent,
            None => return,
        };
        if let Some(siblings) = self.siblings_mut(parent) {
            siblings.retain(|s| *s != id);
        }
    }
}
