use thiserror::Error;
use std::io;

use crate::core::node::NodeId;

/// 引擎层错误：调用方传入了无效的节点、分类或参数
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("节点不存在: {0}")]
    NodeNotFound(NodeId),

    #[error("分类不存在: {0}")]
    CategoryNotFound(NodeId),

    #[error("节点不是下载任务: {0}")]
    NotADownload(NodeId),

    #[error("节点不是分类: {0}")]
    NotACategory(NodeId),

    #[error("无效的URI: {0}")]
    InvalidUri(String),

    #[error("未注册的后端: {0}")]
    BackendNotFound(String),

    #[error("后端全局设置失败: {0}")]
    BackendGlobal(String),

    #[error("IPC协议错误: {0}")]
    Protocol(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO错误: {0}")]
    Io(#[from] io::Error),

    #[error("序列化错误: {0}")]
    Json(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// 后端传输错误，由具体的传输实现返回，最终转换为事件
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    #[error("网络错误: {0}")]
    Network(String),

    #[error("连接超时")]
    Timeout,

    #[error("下载被取消")]
    Cancelled,

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("不支持的协议: {0}")]
    UnsupportedProtocol(String),

    #[error("服务器错误: {0}")]
    Server(String),

    #[error("权限错误: {0}")]
    Permission(String),

    #[error("外部程序不可用: {0}")]
    HelperUnavailable(String),

    #[error("未知错误: {0}")]
    Unknown(String),
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Network(_) |
            TransferError::Timeout |
            TransferError::Server(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidUrl(_) |
            TransferError::UnsupportedProtocol(_) |
            TransferError::Permission(_) |
            TransferError::HelperUnavailable(_)
        )
    }
}

impl From<String> for TransferError {
    fn from(error: String) -> Self {
        TransferError::Unknown(error)
    }
}

impl From<&str> for TransferError {
    fn from(error: &str) -> Self {
        TransferError::Unknown(error.to_string())
    }
}
