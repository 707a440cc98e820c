//! Core: 节点树、调度、限速、错误处理等核心逻辑模块

pub mod actor_manager;
pub mod category;
pub mod data;
pub mod error;
pub mod governor;
pub mod node;
pub mod relation;
pub mod retry;
pub mod status;
pub mod tree;
pub mod views;

// 只导出主流程和其它模块实际用到的类型
pub use actor_manager::{build_tree, EngineActor, EngineStats, NodeInfo};
pub use data::DataBundle;
pub use error::{EngineError, EngineResult, TransferError};
pub use node::NodeId;
pub use status::{NodeState, Status, StatusGroup};
pub use tree::{NodeTree, TreeConfig, TreeCounts};
