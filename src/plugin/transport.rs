//! 由异步传输引擎驱动的后端
//!
//! 真正的协议实现（HTTP、JSON-RPC、媒体解析、云存储 API）由嵌入方通过
//! [`Transfer`] 提供。这里只负责把异步任务包装成非阻塞的 [`Backend`] 契约：
//! 进度通过共享的 [`TransferLink`] 回传，停止通过 `AbortHandle`，限速通过 `watch` 通道。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::{AbortHandle, Abortable};
use tokio::sync::watch;

use crate::core::data::{Common, DataBundle, Progress};
use crate::core::error::TransferError;
use crate::utils::validator::is_valid_uri;
use super::{Backend, BackendDescriptor, Capabilities, Control, Event, EventKind};

/// 交给传输引擎的任务
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub data: DataBundle,
    /// RPC 委托后端的服务地址
    pub endpoint: Option<String>,
}

impl TransferJob {
    pub fn uri(&self) -> Option<&str> {
        self.data.uri()
    }
}

#[derive(Debug, Default)]
struct LinkState {
    progress: Progress,
    events: Vec<Event>,
    name: Option<String>,
    erase: bool,
}

/// 传输引擎向后端回报状态的通道
#[derive(Clone)]
pub struct TransferLink {
    state: Arc<Mutex<LinkState>>,
    limit: watch::Receiver<[u64; 2]>,
}

impl TransferLink {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn report(&self, complete: u64, total: u64, download_speed: u64, upload_speed: u64) {
        self.update(|p| {
            p.complete = complete;
            p.total = total;
            p.download_speed = download_speed;
            p.upload_speed = upload_speed;
            p.percent = if total > 0 {
                ((complete.min(total) as f64 / total as f64) * 100.0) as u8
            } else {
                0
            };
        });
    }

    pub fn update<F: FnOnce(&mut Progress)>(&self, f: F) {
        f(&mut self.lock().progress);
    }

    pub fn push_event(&self, event: Event) {
        self.lock().events.push(event);
    }

    /// 下载完成后开始做种
    pub fn set_uploading(&self) {
        self.push_event(Event::new(EventKind::Uploading, "开始上传"));
    }

    /// 后端解析出真实文件名时调用
    pub fn set_name(&self, name: impl Into<String>) {
        self.lock().name = Some(name.into());
    }

    /// 当前限速 [下载, 上传]，0 表示不限速
    pub fn speed_limit(&self) -> [u64; 2] {
        *self.limit.borrow()
    }

    /// 等待限速变化；后端已销毁时返回 false
    pub async fn limit_changed(&mut self) -> bool {
        self.limit.changed().await.is_ok()
    }

    pub fn erase_requested(&self) -> bool {
        self.lock().erase
    }
}

/// 嵌入方提供的异步传输实现
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn run(&self, job: TransferJob, link: TransferLink) -> Result<(), TransferError>;
}

pub struct TransportBackend {
    descriptor: BackendDescriptor,
    engine: Arc<dyn Transfer>,
    endpoint: Option<String>,
    job: Option<DataBundle>,
    state: Arc<Mutex<LinkState>>,
    limit_tx: watch::Sender<[u64; 2]>,
    abort: Option<AbortHandle>,
    done: Arc<AtomicBool>,
}

impl TransportBackend {
    pub fn new(descriptor: BackendDescriptor, engine: Arc<dyn Transfer>, endpoint: Option<String>) -> Self {
        let (limit_tx, _) = watch::channel([0u64, 0u64]);
        Self {
            descriptor,
            engine,
            endpoint,
            job: None,
            state: Arc::new(Mutex::new(LinkState::default())),
            limit_tx,
            abort: None,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, message: String) -> bool {
        log::warn!("[{}] {}", self.descriptor.name, message);
        self.lock().events.push(Event::error(message, false));
        false
    }
}

impl Backend for TransportBackend {
    fn accept(&mut self, data: &DataBundle) -> bool {
        let supported = match data.uri() {
            Some(uri) => is_valid_uri(uri) && self.descriptor.supports(uri),
            None => false,
        };
        if supported {
            self.job = Some(data.clone());
        }
        supported
    }

    fn control(&mut self, command: &Control) -> bool {
        match command {
            Control::SetSpeedLimit { download, upload } => {
                if !self.descriptor.capabilities.contains(Capabilities::SPEED_LIMIT) {
                    return false;
                }
                self.limit_tx.send_replace([*download, *upload]);
                true
            }
            Control::EraseData => {
                self.lock().erase = true;
                true
            }
        }
    }

    fn start(&mut self) -> bool {
        if self.abort.is_some() {
            return true;
        }
        let Some(data) = self.job.take() else {
            return self.fail("任务未被接受，无法启动".to_string());
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => return self.fail(format!("没有可用的异步运行时: {}", e)),
        };

        let (abort_handle, registration) = AbortHandle::new_pair();
        let engine = self.engine.clone();
        let link = TransferLink {
            state: self.state.clone(),
            limit: self.limit_tx.subscribe(),
        };
        let report = link.clone();
        let done = self.done.clone();
        let job = TransferJob { data, endpoint: self.endpoint.clone() };
        let name = self.descriptor.name.clone();

        report.push_event(Event::new(EventKind::Start, "传输已启动"));
        runtime.spawn(async move {
            let outcome = Abortable::new(engine.run(job, link), registration).await;
            match outcome {
                Ok(Ok(())) => report.push_event(Event::new(EventKind::Completed, "传输完成")),
                Ok(Err(e)) => {
                    log::warn!("[{}] 传输失败: {}", name, e);
                    report.push_event(Event::from(&e));
                }
                Err(_) => report.push_event(Event::new(EventKind::Stopped, "传输已停止")),
            }
            done.store(true, Ordering::SeqCst);
        });
        self.abort = Some(abort_handle);
        true
    }

    fn sync(&mut self, data: &mut DataBundle) -> bool {
        if self.abort.is_none() {
            return false;
        }
        let (progress, name) = {
            let mut state = self.lock();
            (state.progress.clone(), state.name.take())
        };
        *data.realloc::<Progress>() = progress;
        if let Some(name) = name {
            data.realloc::<Common>().name = Some(name);
        }
        !self.done.load(Ordering::SeqCst)
    }

    fn stop(&mut self) {
        if let Some(handle) = &self.abort {
            handle.abort();
        }
    }

    fn pop_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.lock().events)
    }
}

impl Drop for TransportBackend {
    fn drop(&mut self) {
        if let Some(handle) = self.abort.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::core::category::MatchRules;
    use crate::plugin::BackendKind;

    struct FinishingTransfer;

    #[async_trait]
    impl Transfer for FinishingTransfer {
        async fn run(&self, _job: TransferJob, link: TransferLink) -> Result<(), TransferError> {
            link.set_name("renamed.bin");
            link.report(50, 100, 10, 0);
            tokio::time::sleep(Duration::from_millis(5)).await;
            link.report(100, 100, 10, 0);
            Ok(())
        }
    }

    struct FailingTransfer;

    #[async_trait]
    impl Transfer for FailingTransfer {
        async fn run(&self, _job: TransferJob, _link: TransferLink) -> Result<(), TransferError> {
            Err(TransferError::Timeout)
        }
    }

    struct EndlessTransfer;

    #[async_trait]
    impl Transfer for EndlessTransfer {
        async fn run(&self, _job: TransferJob, mut link: TransferLink) -> Result<(), TransferError> {
            while link.limit_changed().await {}
            Ok(())
        }
    }

    fn descriptor() -> BackendDescriptor {
        BackendDescriptor {
            name: "test".into(),
            kind: BackendKind::PlainTransfer,
            rules: MatchRules {
                schemes: vec!["http".into()],
                ..MatchRules::default()
            },
            capabilities: Capabilities::SPEED_LIMIT,
        }
    }

    fn job() -> DataBundle {
        DataBundle::new().with(Common::with_uri("http://example.com/file.bin"))
    }

    async fn drive(backend: &mut TransportBackend, data: &mut DataBundle) -> bool {
        for _ in 0..200 {
            if !backend.sync(data) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_transfer_completes() {
        let mut backend = TransportBackend::new(descriptor(), Arc::new(FinishingTransfer), None);
        let mut data = job();
        assert!(backend.accept(&data));
        assert!(backend.start());
        assert!(drive(&mut backend, &mut data).await);

        let progress = data.get::<Progress>().unwrap();
        assert_eq!(progress.complete, 100);
        assert_eq!(progress.percent, 100);
        assert_eq!(data.get::<Common>().unwrap().name.as_deref(), Some("renamed.bin"));

        let kinds: Vec<EventKind> = backend.pop_events().into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Start, EventKind::Completed]);
    }

    #[tokio::test]
    async fn test_transfer_error_becomes_event() {
        let mut backend = TransportBackend::new(descriptor(), Arc::new(FailingTransfer), None);
        let mut data = job();
        assert!(backend.accept(&data));
        assert!(backend.start());
        assert!(drive(&mut backend, &mut data).await);
        let events = backend.pop_events();
        let error = events.iter().find(|e| e.kind == EventKind::Error).unwrap();
        assert!(error.retryable);
    }

    #[tokio::test]
    async fn test_stop_is_cooperative() {
        let mut backend = TransportBackend::new(descriptor(), Arc::new(EndlessTransfer), None);
        let mut data = job();
        assert!(backend.accept(&data));
        assert!(backend.start());
        assert!(backend.control(&Control::SetSpeedLimit { download: 100, upload: 0 }));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(backend.sync(&mut data));
        backend.stop();
        assert!(drive(&mut backend, &mut data).await);
        assert!(backend.pop_events().iter().any(|e| e.kind == EventKind::Stopped));
    }

    #[test]
    fn test_rejects_unsupported_scheme() {
        let mut backend = TransportBackend::new(descriptor(), Arc::new(FinishingTransfer), None);
        let data = DataBundle::new().with(Common::with_uri("ftp://example.com/file.bin"));
        assert!(!backend.accept(&data));
        assert!(!backend.start());
        assert_eq!(backend.pop_events()[0].kind, EventKind::Error);
    }

    #[test]
    fn test_start_without_runtime_fails() {
        let mut backend = TransportBackend::new(descriptor(), Arc::new(FinishingTransfer), None);
        assert!(backend.accept(&job()));
        assert!(!backend.start());
    }
}
