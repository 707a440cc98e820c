//! 内置后端描述
//!
//! 四类传输后端共用 [`TransportBackend`]，区别只在能处理的 URI 和能力。
//! RPC 委托后端额外管理一个外部辅助进程。

use std::process::{Child, Command};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::category::MatchRules;
use crate::core::error::{EngineError, EngineResult};
use super::transport::{Transfer, TransportBackend};
use super::{Backend, BackendDescriptor, BackendFactory, BackendKind, Capabilities, GlobalOption};

pub const PLAIN_NAME: &str = "plain";
pub const RPC_NAME: &str = "rpc";
pub const EXTRACTOR_NAME: &str = "extractor";
pub const CLOUD_NAME: &str = "cloud";

#[derive(Default)]
struct HelperState {
    rpc_uri: Option<String>,
    path: Option<String>,
    args: Option<String>,
    shutdown_on_final: bool,
    child: Option<Child>,
}

impl HelperState {
    fn running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn launch(&mut self) -> EngineResult<()> {
        if self.running() {
            log::debug!("辅助进程已在运行");
            return Ok(());
        }
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| EngineError::BackendGlobal("未设置辅助程序路径".to_string()))?;
        let args: Vec<&str> = self.args.as_deref().unwrap_or("").split_whitespace().collect();
        let child = Command::new(path)
            .args(&args)
            .spawn()
            .map_err(|e| EngineError::BackendGlobal(format!("启动辅助程序 {} 失败: {}", path, e)))?;
        log::info!("辅助进程已启动: {} (pid {})", path, child.id());
        self.child = Some(child);
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                log::warn!("关闭辅助进程失败: {}", e);
            }
            let _ = child.wait();
            log::info!("辅助进程已关闭");
        }
    }
}

/// 基于 [`Transfer`] 引擎的后端工厂
pub struct TransportFactory {
    descriptor: BackendDescriptor,
    engine: Arc<dyn Transfer>,
    helper: Mutex<HelperState>,
}

impl TransportFactory {
    pub fn new(descriptor: BackendDescriptor, engine: Arc<dyn Transfer>) -> Self {
        Self {
            descriptor,
            engine,
            helper: Mutex::new(HelperState::default()),
        }
    }

    /// 普通的 HTTP/FTP 传输
    pub fn plain(engine: Arc<dyn Transfer>) -> Self {
        Self::new(
            BackendDescriptor {
                name: PLAIN_NAME.to_string(),
                kind: BackendKind::PlainTransfer,
                rules: MatchRules {
                    schemes: strings(&["http", "https", "ftp", "ftps"]),
                    ..MatchRules::default()
                },
                capabilities: Capabilities::SPEED_LIMIT | Capabilities::RESUME,
            },
            engine,
        )
    }

    /// 委托给外部下载程序，额外支持 magnet、种子和 metalink
    pub fn rpc(engine: Arc<dyn Transfer>) -> Self {
        Self::new(
            BackendDescriptor {
                name: RPC_NAME.to_string(),
                kind: BackendKind::RpcDelegate,
                rules: MatchRules {
                    schemes: strings(&["http", "https", "ftp", "ftps", "sftp", "magnet"]),
                    hosts: Vec::new(),
                    file_exts: strings(&["torrent", "metalink", "meta4"]),
                },
                capabilities: Capabilities::all(),
            },
            engine,
        )
    }

    /// 视频站点解析
    pub fn extractor(engine: Arc<dyn Transfer>) -> Self {
        Self::new(
            BackendDescriptor {
                name: EXTRACTOR_NAME.to_string(),
                kind: BackendKind::Extractor,
                rules: MatchRules {
                    hosts: strings(&["*.youtube.com", "youtube.com", "youtu.be", "*.vimeo.com", "vimeo.com"]),
                    ..MatchRules::default()
                },
                capabilities: Capabilities::SPEED_LIMIT | Capabilities::MULTI_FILE,
            },
            engine,
        )
    }

    /// 云存储
    pub fn cloud(engine: Arc<dyn Transfer>) -> Self {
        Self::new(
            BackendDescriptor {
                name: CLOUD_NAME.to_string(),
                kind: BackendKind::CloudStorage,
                rules: MatchRules {
                    hosts: strings(&["mega.nz", "mega.co.nz", "*.mega.nz"]),
                    ..MatchRules::default()
                },
                capabilities: Capabilities::SPEED_LIMIT,
            },
            engine,
        )
    }

    fn helper(&self) -> MutexGuard<'_, HelperState> {
        self.helper.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn rpc_uri(&self) -> Option<String> {
        self.helper().rpc_uri.clone()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl BackendFactory for TransportFactory {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn create(&self) -> Box<dyn Backend> {
        Box::new(TransportBackend::new(
            self.descriptor.clone(),
            self.engine.clone(),
            self.rpc_uri(),
        ))
    }

    fn global_final(&self) {
        let mut helper = self.helper();
        if helper.shutdown_on_final {
            helper.shutdown();
        }
    }

    fn global_set(&self, option: &GlobalOption) -> EngineResult<()> {
        if self.descriptor.kind != BackendKind::RpcDelegate {
            log::debug!("后端 {} 忽略全局选项 {:?}", self.descriptor.name, option);
            return Ok(());
        }
        let mut helper = self.helper();
        match option {
            GlobalOption::RpcUri(uri) => helper.rpc_uri = Some(uri.clone()),
            GlobalOption::HelperPath(path) => helper.path = Some(path.clone()),
            GlobalOption::HelperArgs(args) => helper.args = Some(args.clone()),
            GlobalOption::Launch(true) => helper.launch()?,
            GlobalOption::Launch(false) => {}
            GlobalOption::Shutdown(flag) => helper.shutdown_on_final = *flag,
            GlobalOption::ShutdownNow => helper.shutdown(),
            GlobalOption::Init(_) => {}
        }
        Ok(())
    }
}
