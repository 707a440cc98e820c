use crate::core::data::{Priority, TaskSnapshot};
use crate::core::node::NodeId;
use crate::plugin::{Event, EventKind, PluginAdapter};

/// 活动节点的调度记录
///
/// 节点进入活动集合时创建，离开时（完成、暂停、出错、删除）立即销毁。
#[derive(Debug)]
pub struct RelationRecord {
    pub node: NodeId,
    pub adapter: PluginAdapter,
    pub priority: Priority,
    /// [下载, 上传] 最近一次 sync 得到的速度
    pub speed: [u64; 2],
    /// [下载, 上传] 当前施加的限速，0 表示不限速
    pub limit: [u64; 2],
    /// 节点自身的限速设置，0 表示没有
    pub own_limit: [u64; 2],
    /// 本轮是否已经 sync 过
    pub synced: bool,
    /// 最近弹出的完成或错误事件，后端在之后的周期才结束时使用
    pub terminal: Option<Event>,
}

impl RelationRecord {
    pub fn new(node: NodeId, adapter: PluginAdapter, priority: Priority, own_limit: [u64; 2]) -> Self {
        Self {
            node,
            adapter,
            priority,
            speed: [0, 0],
            limit: [0, 0],
            own_limit,
            synced: false,
            terminal: None,
        }
    }

    /// 记下本批事件中的结束事件，同一批里错误优先于完成
    pub fn note_terminal(&mut self, events: &[Event]) {
        let last = move |kind: EventKind| events.iter().rev().find(|e| e.kind == kind);
        if let Some(event) = last(EventKind::Error).or_else(|| last(EventKind::Completed)) {
            self.terminal = Some(event.clone());
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            speed: self.speed,
            limit: self.limit,
        }
    }
}
