//! Plugin: 后端适配层
//!
//! 不同的传输后端（普通 HTTP/FTP 客户端、RPC 委托下载器、媒体解析、云存储）
//! 都实现同一个 [`Backend`] 契约，由 [`PluginAdapter`] 以统一的方式驱动。
//! 进程级的初始化/清理由 [`PluginRuntime`] 以引用计数管理。

pub mod builtin;
pub mod empty;
pub mod runtime;
pub mod transport;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::core::category::MatchRules;
use crate::core::data::DataBundle;
use crate::core::error::{EngineResult, TransferError};

pub use builtin::TransportFactory;
pub use empty::{EmptyBackend, EmptyFactory};
pub use runtime::{GlobalGuard, PluginRuntime};
pub use transport::{Transfer, TransferJob, TransferLink, TransportBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    PlainTransfer,
    RpcDelegate,
    Extractor,
    CloudStorage,
    Empty,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capabilities: u32 {
        const SPEED_LIMIT = 0b0001;
        /// 支持做种/上传
        const UPLOAD      = 0b0010;
        const MULTI_FILE  = 0b0100;
        const RESUME      = 0b1000;
    }
}

/// 后端的静态描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub kind: BackendKind,
    /// 能处理的 scheme、主机和扩展名；为空表示接受任何URI
    pub rules: MatchRules,
    pub capabilities: Capabilities,
}

impl BackendDescriptor {
    pub fn supports(&self, uri: &str) -> bool {
        self.rules.is_empty() || self.rules.matches(uri)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Normal,
    Warning,
    Error,
    Start,
    Stop,
    Completed,
    Uploading,
    Stopped,
}

/// 后端产生的离散事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub title: Option<String>,
    pub message: String,
    /// 仅对错误事件有意义：是否可以按重试策略重新排队
    pub retryable: bool,
    pub time: DateTime<Local>,
}

impl Event {
    pub fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: None,
            message: message.into(),
            retryable: false,
            time: Local::now(),
        }
    }

    pub fn error(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            retryable,
            ..Self::new(EventKind::Error, message)
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

impl From<&TransferError> for Event {
    fn from(error: &TransferError) -> Self {
        Event::error(error.to_string(), error.is_retryable())
    }
}

/// 带外控制命令，不支持的后端可以直接忽略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    /// 字节/秒，0 表示不限速
    SetSpeedLimit { download: u64, upload: u64 },
    /// 删除任务时要求后端一并清理数据
    EraseData,
}

/// 进程级选项
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalOption {
    /// true 初始化，false 清理；按引用计数配对
    Init(bool),
    RpcUri(String),
    HelperPath(String),
    HelperArgs(String),
    /// 立即启动外部程序
    Launch(bool),
    /// 最后一次清理时关闭外部程序
    Shutdown(bool),
    ShutdownNow,
}

/// 适配器契约
///
/// 所有方法都必须是非阻塞的；实际的 I/O 由后端自己的线程或外部进程完成。
pub trait Backend: Send {
    /// 返回 false 表示无法处理这个URI/选项组合，不是错误
    fn accept(&mut self, data: &DataBundle) -> bool;

    fn control(&mut self, _command: &Control) -> bool {
        false
    }

    /// 异步启动传输，false 表示立即失败
    fn start(&mut self) -> bool;

    /// 更新进度；传输到达终止状态时返回 false
    fn sync(&mut self, data: &mut DataBundle) -> bool;

    /// 请求停止，之后的 sync 最终会返回 false
    fn stop(&mut self);

    /// 取出自上次调用以来积累的事件
    fn pop_events(&mut self) -> Vec<Event>;
}

/// 后端工厂，同时承担进程级的初始化/清理
pub trait BackendFactory: Send + Sync {
    fn descriptor(&self) -> &BackendDescriptor;

    fn create(&self) -> Box<dyn Backend>;

    fn global_init(&self) -> EngineResult<()> {
        Ok(())
    }

    fn global_final(&self) {}

    fn global_set(&self, option: &GlobalOption) -> EngineResult<()> {
        log::debug!("后端 {} 忽略全局选项 {:?}", self.descriptor().name, option);
        Ok(())
    }
}

/// 引用计数的适配器句柄，最后一个克隆被释放时后端随之销毁
#[derive(Clone)]
pub struct PluginAdapter {
    name: Arc<str>,
    kind: BackendKind,
    inner: Arc<Mutex<Box<dyn Backend>>>,
}

impl PluginAdapter {
    pub fn create(factory: &dyn BackendFactory) -> Self {
        let descriptor = factory.descriptor();
        Self {
            name: Arc::from(descriptor.name.as_str()),
            kind: descriptor.kind,
            inner: Arc::new(Mutex::new(factory.create())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn Backend>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn accept(&self, data: &DataBundle) -> bool {
        self.lock().accept(data)
    }

    pub fn control(&self, command: &Control) -> bool {
        self.lock().control(command)
    }

    pub fn start(&self) -> bool {
        self.lock().start()
    }

    pub fn sync(&self, data: &mut DataBundle) -> bool {
        self.lock().sync(data)
    }

    pub fn stop(&self) {
        self.lock().stop()
    }

    pub fn pop_events(&self) -> Vec<Event> {
        self.lock().pop_events()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// 释放一个引用，未取出的事件随后端一起丢弃
    pub fn release(self) {
        if Arc::strong_count(&self.inner) == 1 {
            log::debug!("释放后端实例: {}", self.name);
        }
    }
}

impl fmt::Debug for PluginAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginAdapter")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data::Common;

    #[test]
    fn test_adapter_reference_count() {
        let factory = EmptyFactory::new();
        let adapter = PluginAdapter::create(&factory);
        let second = adapter.clone();
        assert_eq!(adapter.ref_count(), 2);
        second.release();
        assert_eq!(adapter.ref_count(), 1);
        assert_eq!(adapter.name(), "empty");
    }

    #[test]
    fn test_release_with_pending_events() {
        let factory = EmptyFactory::new();
        let adapter = PluginAdapter::create(&factory);
        let data = DataBundle::new().with(Common::with_uri("http://example.com/a"));
        assert!(adapter.accept(&data));
        assert!(adapter.start());
        // start 事件未取出，释放也必须安全
        adapter.release();
    }

    #[test]
    fn test_descriptor_supports() {
        let descriptor = BackendDescriptor {
            name: "plain".into(),
            kind: BackendKind::PlainTransfer,
            rules: MatchRules {
                schemes: vec!["http".into()],
                ..MatchRules::default()
            },
            capabilities: Capabilities::SPEED_LIMIT,
        };
        assert!(descriptor.supports("http://a/b"));
        assert!(!descriptor.supports("magnet:?xt=urn:btih:abc"));
    }

    #[test]
    fn test_event_from_transfer_error() {
        let event = Event::from(&TransferError::Timeout);
        assert_eq!(event.kind, EventKind::Error);
        assert!(event.retryable);
        let event = Event::from(&TransferError::InvalidUrl("x".into()));
        assert!(!event.retryable);
    }
}
