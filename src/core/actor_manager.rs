use actix::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cli::Submission;
use crate::config::{CategoryConfig, Config};
use crate::core::data::{Common, Progress, Relation};
use crate::core::error::EngineResult;
use crate::core::node::NodeId;
use crate::core::status::NodeState;
use crate::core::tree::{NodeTree, TreeCounts, HOME_CATEGORY};
use crate::core::data::DataBundle;
use crate::ipc::IpcServer;
use crate::plugin::builtin::RPC_NAME;
use crate::plugin::{Event, GlobalOption, PluginRuntime};

/// 按配置建立分类、后端顺序和全局限速
pub fn build_tree(config: &Config, runtime: PluginRuntime) -> EngineResult<NodeTree> {
    let mut tree = NodeTree::new(runtime.clone(), config.tree_config());

    for category in &config.categories {
        tree.add_category(&category.name, category.to_category(), category.defaults(config));
    }
    let home = match tree.find_category(HOME_CATEGORY) {
        Some(id) => id,
        None => {
            let home = CategoryConfig {
                name: HOME_CATEGORY.to_string(),
                ..CategoryConfig::default()
            };
            tree.add_category(HOME_CATEGORY, home.to_category(), home.defaults(config))
        }
    };
    tree.set_default_category(home)?;

    if runtime.factory(RPC_NAME).is_some() {
        let rpc = &config.rpc;
        if let Some(uri) = &rpc.uri {
            runtime.global_set(RPC_NAME, GlobalOption::RpcUri(uri.clone()))?;
        }
        if let Some(path) = &rpc.helper_path {
            runtime.global_set(RPC_NAME, GlobalOption::HelperPath(path.clone()))?;
        }
        if let Some(args) = &rpc.helper_args {
            runtime.global_set(RPC_NAME, GlobalOption::HelperArgs(args.clone()))?;
        }
        runtime.global_set(RPC_NAME, GlobalOption::Shutdown(rpc.shutdown))?;
        if rpc.launch {
            // 外部程序启动失败不影响其它后端
            if let Err(e) = runtime.global_set(RPC_NAME, GlobalOption::Launch(true)) {
                log::warn!("无法启动外部下载程序: {}", e);
            }
        }
    }

    for name in &config.backends {
        if runtime.factory(name).is_none() {
            log::warn!("未注册的后端 {}，已跳过", name);
            continue;
        }
        tree.add_backend(name)?;
    }
    if let Some(name) = &config.default_backend {
        if runtime.factory(name).is_some() {
            tree.set_default_backend(name)?;
        } else {
            log::warn!("未注册的默认后端 {}，已跳过", name);
        }
    }

    let [download, upload] = config.global_speed();
    tree.set_global_speed(download, upload);
    Ok(tree)
}

/// 全局统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub counts: TreeCounts,
    /// [下载, 上传]（字节/秒）
    pub speed: [u64; 2],
    pub limit: [u64; 2],
    /// 未回收任务的已下载字节
    pub completed_bytes: u64,
    pub total_bytes: u64,
    pub completed: usize,
    pub failed: usize,
    /// 还有活动、排队或停止中的任务
    pub busy: bool,
}

/// 单个任务的状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub category: Option<NodeId>,
    pub name: Option<String>,
    pub uri: Option<String>,
    pub state: NodeState,
    pub plugin_name: Option<String>,
    pub progress: Option<Progress>,
}

/// ================== 消息 ==================

pub struct AddDownload {
    pub data: DataBundle,
    pub category: Option<NodeId>,
}
impl Message for AddDownload { type Result = EngineResult<NodeId>; }

/// 一批命令行任务，分类按名称查找
pub struct SubmitBatch(pub Submission);
impl Message for SubmitBatch { type Result = Vec<NodeId>; }

pub struct PauseDownload(pub NodeId);
impl Message for PauseDownload { type Result = EngineResult<()>; }

pub struct ResumeDownload(pub NodeId);
impl Message for ResumeDownload { type Result = EngineResult<()>; }

pub struct DeleteDownload { pub id: NodeId, pub erase: bool }
impl Message for DeleteDownload { type Result = EngineResult<()>; }

pub struct MoveDownload { pub id: NodeId, pub before: Option<NodeId> }
impl Message for MoveDownload { type Result = EngineResult<()>; }

/// 字节/秒，0 表示不限速
pub struct SetGlobalSpeed { pub download: u64, pub upload: u64 }
impl Message for SetGlobalSpeed { type Result = (); }

pub struct PauseAll;
impl Message for PauseAll { type Result = (); }

pub struct ResumeAll;
impl Message for ResumeAll { type Result = (); }

pub struct GetStats;
impl Message for GetStats { type Result = EngineStats; }

pub struct QueryNode(pub NodeId);
impl Message for QueryNode { type Result = Option<NodeInfo>; }

pub struct TakeEvents;
impl Message for TakeEvents { type Result = Vec<(NodeId, Event)>; }

/// 暂停全部任务并停止调度
pub struct Shutdown;
impl Message for Shutdown { type Result = (); }

/// 调度 Actor：持有节点树，周期性地执行一次 grow
pub struct EngineActor {
    tree: NodeTree,
    ipc: Option<IpcServer>,
    tick: Duration,
    busy: bool,
}

impl EngineActor {
    pub fn new(tree: NodeTree, tick: Duration) -> Self {
        Self {
            tree,
            ipc: None,
            tick,
            busy: false,
        }
    }

    /// 每个周期先取出其它进程转交的任务
    pub fn with_ipc(tree: NodeTree, ipc: IpcServer, tick: Duration) -> Self {
        Self {
            ipc: Some(ipc),
            ..Self::new(tree, tick)
        }
    }

    pub fn tree(&self) -> &NodeTree {
        &self.tree
    }

    fn submit(&mut self, submission: Submission) -> Vec<NodeId> {
        let category = match submission.options.category.as_deref() {
            Some(name) => {
                let found = self.tree.find_category(name);
                if found.is_none() {
                    log::warn!("分类 {} 不存在，按规则匹配", name);
                }
                found
            }
            None => None,
        };
        let mut added = Vec::new();
        for data in submission.to_bundles() {
            match self.tree.add_download(data, category, true) {
                Ok(id) => added.push(id),
                Err(e) => log::warn!("添加任务失败: {}", e),
            }
        }
        added
    }

    fn on_tick(&mut self) {
        let mut batches = Vec::new();
        if let Some(ipc) = &self.ipc {
            while let Some(submission) = ipc.server_get() {
                batches.push(submission);
            }
        }
        for submission in batches {
            let added = self.submit(submission);
            log::info!("收到 {} 个转交的任务", added.len());
        }
        self.busy = self.tree.grow(false);
    }

    fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            counts: self.tree.counts(),
            speed: self.tree.speed(),
            limit: self.tree.governor().global_speed(),
            busy: self.busy,
            ..EngineStats::default()
        };
        for view in self.tree.views().mix() {
            let Some(node) = self.tree.node(view.base) else { continue };
            match node.data.status().state() {
                NodeState::Completed => stats.completed += 1,
                NodeState::Error => stats.failed += 1,
                NodeState::Recycled => continue,
                _ => {}
            }
            if let Some(progress) = node.data.get::<Progress>() {
                stats.completed_bytes += progress.complete;
                stats.total_bytes += progress.total.max(progress.complete);
            }
        }
        stats
    }

    fn node_info(&self, id: NodeId) -> Option<NodeInfo> {
        let node = self.tree.node(id)?;
        if self.tree.category(id).is_some() {
            return None;
        }
        let common = node.data.get::<Common>();
        Some(NodeInfo {
            id,
            category: node.parent,
            name: common.and_then(|c| c.name.clone()),
            uri: common.and_then(|c| c.uri.clone()),
            state: node.data.status().state(),
            plugin_name: node.data.get::<Relation>().and_then(|r| r.plugin_name.clone()),
            progress: node.data.get::<Progress>().cloned(),
        })
    }
}

impl Actor for EngineActor {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::info!("调度器已启动，间隔 {:?}", self.tick);
        ctx.run_interval(self.tick, |act, _ctx| act.on_tick());
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.tree.pause_all();
        self.tree.grow(true);
        if let Some(ipc) = self.ipc.as_mut() {
            ipc.server_stop();
        }
        log::info!("调度器已停止");
    }
}

impl Handler<AddDownload> for EngineActor {
    type Result = EngineResult<NodeId>;
    fn handle(&mut self, msg: AddDownload, _ctx: &mut Self::Context) -> Self::Result {
        self.tree.add_download(msg.data, msg.category, true)
    }
}

impl Handler<SubmitBatch> for EngineActor {
    type Result = MessageResult<SubmitBatch>;
    fn handle(&mut self, msg: SubmitBatch, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.submit(msg.0))
    }
}

impl Handler<PauseDownload> for EngineActor {
    type Result = EngineResult<()>;
    fn handle(&mut self, msg: PauseDownload, _ctx: &mut Self::Context) -> Self::Result {
        self.tree.pause(msg.0)
    }
}

impl Handler<ResumeDownload> for EngineActor {
    type Result = EngineResult<()>;
    fn handle(&mut self, msg: ResumeDownload, _ctx: &mut Self::Context) -> Self::Result {
        self.tree.resume(msg.0)
    }
}

impl Handler<DeleteDownload> for EngineActor {
    type Result = EngineResult<()>;
    fn handle(&mut self, msg: DeleteDownload, _ctx: &mut Self::Context) -> Self::Result {
        self.tree.delete_download(msg.id, msg.erase)
    }
}

impl Handler<MoveDownload> for EngineActor {
    type Result = EngineResult<()>;
    fn handle(&mut self, msg: MoveDownload, _ctx: &mut Self::Context) -> Self::Result {
        self.tree.move_download(msg.id, msg.before)
    }
}

impl Handler<SetGlobalSpeed> for EngineActor {
    type Result = ();
    fn handle(&mut self, msg: SetGlobalSpeed, _ctx: &mut Self::Context) {
        self.tree.set_global_speed(msg.download, msg.upload);
    }
}

impl Handler<PauseAll> for EngineActor {
    type Result = ();
    fn handle(&mut self, _msg: PauseAll, _ctx: &mut Self::Context) {
        self.tree.pause_all();
    }
}

impl Handler<ResumeAll> for EngineActor {
    type Result = ();
    fn handle(&mut self, _msg: ResumeAll, _ctx: &mut Self::Context) {
        self.tree.resume_all();
    }
}

impl Handler<GetStats> for EngineActor {
    type Result = MessageResult<GetStats>;
    fn handle(&mut self, _msg: GetStats, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.stats())
    }
}

impl Handler<QueryNode> for EngineActor {
    type Result = Option<NodeInfo>;
    fn handle(&mut self, msg: QueryNode, _ctx: &mut Self::Context) -> Self::Result {
        self.node_info(msg.0)
    }
}

impl Handler<TakeEvents> for EngineActor {
    type Result = MessageResult<TakeEvents>;
    fn handle(&mut self, _msg: TakeEvents, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.tree.take_events())
    }
}

impl Handler<Shutdown> for EngineActor {
    type Result = ();
    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) {
        ctx.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::plugin::EmptyFactory;

    fn runtime() -> PluginRuntime {
        let runtime = PluginRuntime::new();
        runtime.register(Arc::new(EmptyFactory::new())).unwrap();
        runtime
    }

    fn config() -> Config {
        Config {
            default_backend: Some("empty".to_string()),
            ..Config::default()
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[test]
    fn test_build_tree() {
        let mut config = config();
        config.backends = strings(&["missing", "empty"]);
        config.download_speed_kb = 10;
        config.categories.push(CategoryConfig {
            name: "视频".to_string(),
            file_exts: strings(&["mp4"]),
            ..CategoryConfig::default()
        });
        let tree = build_tree(&config, runtime()).unwrap();

        assert_eq!(tree.backends(), ["empty".to_string()]);
        assert_eq!(tree.categories().len(), 2);
        assert_eq!(tree.default_category(), tree.find_category(HOME_CATEGORY));
        assert_eq!(tree.governor().global_speed(), [10 * 1024, 0]);
        assert_eq!(tree.runtime().ref_count("empty"), 1);
    }

    #[test]
    fn test_home_from_config_reused() {
        let mut config = config();
        config.categories.push(CategoryConfig {
            name: HOME_CATEGORY.to_string(),
            ..CategoryConfig::default()
        });
        let tree = build_tree(&config, runtime()).unwrap();
        assert_eq!(tree.categories().len(), 1);
    }

    #[actix::test]
    async fn test_add_pause_resume() {
        let tree = build_tree(&config(), runtime()).unwrap();
        let addr = EngineActor::new(tree, Duration::from_millis(10)).start();

        let data = DataBundle::new().with(Common::with_uri("http://example.com/a.zip"));
        let id = addr.send(AddDownload { data, category: None }).await.unwrap().unwrap();
        settle().await;

        let info = addr.send(QueryNode(id)).await.unwrap().unwrap();
        assert_eq!(info.state, NodeState::Active);
        assert_eq!(info.plugin_name.as_deref(), Some("empty"));
        assert_eq!(info.name.as_deref(), Some("a.zip"));
        let stats = addr.send(GetStats).await.unwrap();
        assert_eq!(stats.counts.active, 1);
        assert!(stats.busy);

        addr.send(PauseDownload(id)).await.unwrap().unwrap();
        let info = addr.send(QueryNode(id)).await.unwrap().unwrap();
        assert_eq!(info.state, NodeState::Paused);

        addr.send(ResumeDownload(id)).await.unwrap().unwrap();
        settle().await;
        let info = addr.send(QueryNode(id)).await.unwrap().unwrap();
        assert_eq!(info.state, NodeState::Active);

        let events = addr.send(TakeEvents).await.unwrap();
        assert!(events.iter().all(|(node, _)| *node == id));
    }

    #[actix::test]
    async fn test_submit_batch_by_category_name() {
        let mut config = config();
        config.categories.push(CategoryConfig {
            name: "软件".to_string(),
            ..CategoryConfig::default()
        });
        let tree = build_tree(&config, runtime()).unwrap();
        let software = tree.find_category("软件");
        let addr = EngineActor::new(tree, Duration::from_millis(10)).start();

        let submission = Submission::from_batch(&strings(&["http://a.com/1.exe", "http://a.com/2.exe", "--category", "软件", "--paused"])).unwrap();
        let ids = addr.send(SubmitBatch(submission)).await.unwrap();
        assert_eq!(ids.len(), 2);
        settle().await;

        for id in ids {
            let info = addr.send(QueryNode(id)).await.unwrap().unwrap();
            assert_eq!(info.category, software);
            assert_eq!(info.state, NodeState::Paused);
        }
        addr.send(ResumeAll).await.unwrap();
        settle().await;
        assert_eq!(addr.send(GetStats).await.unwrap().counts.active, 2);

        addr.send(PauseAll).await.unwrap();
        let stats = addr.send(GetStats).await.unwrap();
        assert_eq!(stats.counts.active, 0);
        assert_eq!(stats.counts.queuing, 2);
    }

    #[actix::test]
    async fn test_ipc_batches_drained_each_tick() {
        let tree = build_tree(&config(), runtime()).unwrap();
        let ipc = IpcServer::new(0);
        ipc.server_add(strings(&["http://example.com/x.iso"]));
        ipc.server_add(strings(&["--version"]));
        let addr = EngineActor::with_ipc(tree, ipc, Duration::from_millis(10)).start();
        settle().await;

        let stats = addr.send(GetStats).await.unwrap();
        assert_eq!(stats.counts.active, 1);
    }

    #[actix::test]
    async fn test_delete_and_unknown_node() {
        let tree = build_tree(&config(), runtime()).unwrap();
        let addr = EngineActor::new(tree, Duration::from_millis(10)).start();
        let data = DataBundle::new().with(Common::with_uri("http://example.com/b.zip"));
        let id = addr.send(AddDownload { data, category: None }).await.unwrap().unwrap();

        addr.send(DeleteDownload { id, erase: false }).await.unwrap().unwrap();
        let info = addr.send(QueryNode(id)).await.unwrap().unwrap();
        assert_eq!(info.state, NodeState::Recycled);
        addr.send(DeleteDownload { id, erase: false }).await.unwrap().unwrap();
        assert!(addr.send(QueryNode(id)).await.unwrap().is_none());

        assert!(addr.send(PauseDownload(NodeId::new())).await.unwrap().is_err());
        addr.send(SetGlobalSpeed { download: 2048, upload: 0 }).await.unwrap();
        assert_eq!(addr.send(GetStats).await.unwrap().limit, [2048, 0]);

        addr.send(Shutdown).await.unwrap();
        settle().await;
        assert!(!addr.connected());
    }
}
