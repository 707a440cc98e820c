//! IPC: 单实例命令通道
//!
//! 第一个启动的进程监听本地端口，之后启动的进程把自己的命令行参数
//! 转交过去然后退出。监听循环运行在独立线程上，与调度线程之间只通过
//! 加锁的队列交换数据。

pub mod frame;

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdListener};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::cli::Submission;
use crate::core::error::{EngineError, EngineResult};
use frame::{Ack, AckCodec, BatchCodec};

pub const DEFAULT_PORT: u16 = 14777;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type Queue = Arc<Mutex<VecDeque<Vec<String>>>>;

fn lock(queue: &Queue) -> MutexGuard<'_, VecDeque<Vec<String>>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct IpcServer {
    port: u16,
    queue: Queue,
    local_addr: Option<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl IpcServer {
    /// `port` 为 0 时由系统分配
    pub fn new(port: u16) -> Self {
        Self {
            port,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            local_addr: None,
            shutdown: None,
            thread: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// 绑定端口并启动监听线程；端口被占用说明已有实例在运行
    pub fn server_start(&mut self) -> EngineResult<SocketAddr> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }
        let listener = StdListener::bind((Ipv4Addr::LOCALHOST, self.port))?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = oneshot::channel();
        let queue = self.queue.clone();
        let thread = std::thread::Builder::new()
            .name("ipc-server".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    match TcpListener::from_std(listener) {
                        Ok(listener) => accept_loop(listener, queue, rx).await,
                        Err(e) => log::error!("IPC监听失败: {}", e),
                    }
                });
            })?;

        log::info!("IPC服务已启动: {}", addr);
        self.local_addr = Some(addr);
        self.shutdown = Some(tx);
        self.thread = Some(thread);
        Ok(addr)
    }

    pub fn server_has_data(&self) -> bool {
        !lock(&self.queue).is_empty()
    }

    /// 取出一批原始参数
    pub fn server_pop(&self) -> Option<Vec<String>> {
        lock(&self.queue).pop_front()
    }

    /// 取出下一批能解析的参数，无法解析的批次记录日志后丢弃
    pub fn server_get(&self) -> Option<Submission> {
        while let Some(batch) = self.server_pop() {
            if find_help(&batch) || find_version(&batch) {
                log::debug!("忽略转交的帮助/版本请求");
                continue;
            }
            match Submission::from_batch(&batch) {
                Ok(submission) => return Some(submission),
                Err(e) => log::warn!("无法解析转交的参数 {:?}: {}", batch, e),
            }
        }
        None
    }

    /// 本进程直接放入一批参数，空批次被忽略
    pub fn server_add(&self, args: Vec<String>) {
        if !args.is_empty() {
            lock(&self.queue).push_back(args);
        }
    }

    pub fn server_stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("IPC线程异常退出");
            }
            log::info!("IPC服务已停止");
        }
        self.local_addr = None;
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.server_stop();
    }
}

async fn accept_loop(listener: TcpListener, queue: Queue, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let queue = queue.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, queue).await {
                            log::warn!("IPC连接 {} 已关闭: {}", peer, e);
                        }
                    });
                }
                Err(e) => log::warn!("IPC接受连接失败: {}", e),
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, queue: Queue) -> EngineResult<()> {
    let (reader, writer) = stream.into_split();
    let mut batches = FramedRead::new(reader, BatchCodec::new());
    let mut acks = FramedWrite::new(writer, AckCodec);
    while let Some(batch) = batches.next().await {
        let batch = batch?;
        if batch.is_empty() {
            log::debug!("收到IPC心跳");
        } else {
            log::info!("收到转交的参数: {:?}", batch);
            lock(&queue).push_back(batch);
        }
        acks.send(Ack).await?;
    }
    Ok(())
}

/// 把参数交给正在运行的实例；空参数只做存活检测
///
/// 返回 true 表示对方已确认收到。
pub async fn client_send(port: u16, args: &[String]) -> bool {
    match send_batch(port, args).await {
        Ok(()) => true,
        Err(e) => {
            log::debug!("没有可用的运行中实例: {}", e);
            false
        }
    }
}

async fn send_batch(port: u16, args: &[String]) -> EngineResult<()> {
    let timeout = |e: tokio::time::error::Elapsed| EngineError::Protocol(format!("IPC超时: {}", e));
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((Ipv4Addr::LOCALHOST, port)))
        .await
        .map_err(timeout)??;
    let (reader, writer) = stream.into_split();
    let mut batches = FramedWrite::new(writer, BatchCodec::new());
    let mut acks = FramedRead::new(reader, AckCodec);

    batches.send(args).await?;
    match tokio::time::timeout(CONNECT_TIMEOUT, acks.next()).await.map_err(timeout)? {
        Some(ack) => ack.map(|_| ()),
        None => Err(EngineError::Protocol("连接在确认前关闭".to_string())),
    }
}

pub fn find_version(args: &[String]) -> bool {
    args.iter().any(|a| a == "--version" || a == "-V")
}

pub fn find_help(args: &[String]) -> bool {
    args.iter().any(|a| a == "--help" || a == "-h")
}
