use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// 下载节点的状态位
    ///
    /// 只能通过 [`Status::for_state`] 写入，保证任意时刻只有一个主状态位。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Status: u32 {
        const QUEUING   = 0b0000_0001;
        const ACTIVE    = 0b0000_0010;
        const PAUSED    = 0b0000_0100;
        const ERROR     = 0b0000_1000;
        const COMPLETED = 0b0001_0000;
        const UPLOADING = 0b0010_0000;
        const FINISHED  = 0b0100_0000;
        const RECYCLED  = 0b1000_0000;
    }
}

/// 主状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    Queuing,
    Active,
    Paused,
    Completed,
    Error,
    Recycled,
}

impl Status {
    /// 由主状态生成状态位；UPLOADING 只会和 ACTIVE 同时出现
    pub fn for_state(state: NodeState, uploading: bool) -> Self {
        match state {
            NodeState::Queuing => Status::QUEUING,
            NodeState::Active if uploading => Status::ACTIVE | Status::UPLOADING,
            NodeState::Active => Status::ACTIVE,
            NodeState::Paused => Status::PAUSED,
            NodeState::Completed => Status::COMPLETED | Status::FINISHED,
            NodeState::Error => Status::ERROR | Status::FINISHED,
            NodeState::Recycled => Status::RECYCLED,
        }
    }

    /// 读取主状态
    pub fn state(self) -> NodeState {
        if self.contains(Status::RECYCLED) {
            NodeState::Recycled
        } else if self.contains(Status::ACTIVE) {
            NodeState::Active
        } else if self.contains(Status::ERROR) {
            NodeState::Error
        } else if self.contains(Status::COMPLETED) {
            NodeState::Completed
        } else if self.contains(Status::PAUSED) {
            NodeState::Paused
        } else {
            NodeState::Queuing
        }
    }

    pub fn group(self) -> StatusGroup {
        match self.state() {
            NodeState::Active => StatusGroup::Active,
            NodeState::Queuing | NodeState::Paused => StatusGroup::Queuing,
            NodeState::Completed | NodeState::Error => StatusGroup::Finished,
            NodeState::Recycled => StatusGroup::Recycled,
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::QUEUING
    }
}

/// 派生视图中的状态分组
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusGroup {
    Active,
    Queuing,
    Finished,
    Recycled,
}

impl StatusGroup {
    pub const ALL: [StatusGroup; 4] = [
        StatusGroup::Active,
        StatusGroup::Queuing,
        StatusGroup::Finished,
        StatusGroup::Recycled,
    ];

    pub fn index(self) -> usize {
        match self {
            StatusGroup::Active => 0,
            StatusGroup::Queuing => 1,
            StatusGroup::Finished => 2,
            StatusGroup::Recycled => 3,
        }
    }
}
