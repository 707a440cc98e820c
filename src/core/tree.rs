//! 下载节点树
//!
//! [`NodeTree`] 持有真实树、派生视图、限速器和全部后端实例。
//! 所有修改都在同一个调用里同步更新派生视图，调用返回后视图与真实树一致。

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::core::category::{over_limit, under_limit, Category, CategoryExport, MatchRules};
use crate::core::data::{Common, DataBundle, Log, Progress, Relation};
use crate::core::error::{EngineError, EngineResult};
use crate::core::governor::{SpeedGovernor, DEFAULT_SPEED_FLOOR};
use crate::core::node::{Node, NodeArena, NodeId, NodeKind};
use crate::core::relation::RelationRecord;
use crate::core::retry::RetryPolicy;
use crate::core::status::{NodeState, StatusGroup};
use crate::core::views::ViewSet;
use crate::plugin::{Control, Event, EventKind, GlobalGuard, PluginAdapter, PluginRuntime};
use crate::utils::validator::{is_valid_uri, name_from_uri};

/// 自动创建的分类名
pub const HOME_CATEGORY: &str = "Home";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// 全局同时活动的任务上限，0 表示不限
    pub active_limit: usize,
    /// 限速时每个任务的保底速度（字节/秒）
    pub speed_floor: u64,
    pub retry: RetryPolicy,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            active_limit: 0,
            speed_floor: DEFAULT_SPEED_FLOOR,
            retry: RetryPolicy::default(),
        }
    }
}

/// 各状态分组的节点数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeCounts {
    pub active: usize,
    pub queuing: usize,
    pub finished: usize,
    pub recycled: usize,
    /// 已请求停止、仍在等待后端确认的实例
    pub stopping: usize,
}

/// 已请求停止的后端，持续 sync 直到它确认结束
struct Stopping {
    node: NodeId,
    adapter: PluginAdapter,
    /// 节点被永久删除后数据转移到这里
    data: DataBundle,
}

pub struct NodeTree {
    config: TreeConfig,
    runtime: PluginRuntime,
    real: NodeArena,
    views: ViewSet,
    governor: SpeedGovernor,
    stopping: Vec<Stopping>,
    backends: Vec<String>,
    default_backend: Option<String>,
    default_category: Option<NodeId>,
    retry_at: HashMap<NodeId, Instant>,
    outbox: Vec<(NodeId, Event)>,
    speed: [u64; 2],
    seq: u64,
    // 最后释放，保证所有后端实例先于清理销毁
    guards: HashMap<String, GlobalGuard>,
}

impl NodeTree {
    pub fn new(runtime: PluginRuntime, config: TreeConfig) -> Self {
        let governor = SpeedGovernor::new(config.speed_floor);
        Self {
            config,
            runtime,
            real: NodeArena::new(),
            views: ViewSet::new(),
            governor,
            stopping: Vec::new(),
            backends: Vec::new(),
            default_backend: None,
            default_category: None,
            retry_at: HashMap::new(),
            outbox: Vec::new(),
            speed: [0, 0],
            seq: 0,
            guards: HashMap::new(),
        }
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn runtime(&self) -> &PluginRuntime {
        &self.runtime
    }

    // ===== 分类 =====

    pub fn add_category(&mut self, name: &str, category: Category, defaults: DataBundle) -> NodeId {
        let mut data = defaults;
        data.realloc::<Common>().name = Some(name.to_string());
        data.insert(category);
        let id = self.real.insert(NodeKind::Category, data, None, None);
        log::info!("添加分类: {} ({})", name, id);
        self.views.refresh_category(&self.real, id);
        id
    }

    pub fn set_default_category(&mut self, id: NodeId) -> EngineResult<()> {
        self.category_node(id)?;
        self.default_category = Some(id);
        Ok(())
    }

    pub fn default_category(&self) -> Option<NodeId> {
        self.default_category
    }

    pub fn categories(&self) -> Vec<NodeId> {
        self.real
            .roots()
            .iter()
            .copied()
            .filter(|&id| self.kind_of(id) == Some(NodeKind::Category))
            .collect()
    }

    pub fn category(&self, id: NodeId) -> Option<&Category> {
        self.real.get(id).and_then(|n| n.data.get::<Category>())
    }

    pub fn category_of(&self, id: NodeId) -> Option<NodeId> {
        self.real.get(id).and_then(|n| n.parent)
    }

    pub fn find_category(&self, name: &str) -> Option<NodeId> {
        self.categories().into_iter().find(|&id| {
            self.real
                .get(id)
                .and_then(|n| n.data.get::<Common>())
                .and_then(|c| c.name.as_deref())
                == Some(name)
        })
    }

    /// 按分类顺序导出规则、上限和各状态成员，磁盘格式由调用方决定
    pub fn export_categories(&self) -> Vec<CategoryExport> {
        self.categories()
            .into_iter()
            .filter_map(|id| {
                let node = self.real.get(id)?;
                let category = node.data.get::<Category>().cloned().unwrap_or_default();
                let buckets = self.views.split(id);
                let members = |group: StatusGroup| -> Vec<NodeId> {
                    buckets
                        .map(|b| b.group(group).iter().map(|v| v.base).collect())
                        .unwrap_or_default()
                };
                Some(CategoryExport {
                    id,
                    name: node.data.get::<Common>().and_then(|c| c.name.clone()),
                    rules: category.rules,
                    active_limit: category.active_limit,
                    finished_limit: category.finished_limit,
                    recycled_limit: category.recycled_limit,
                    active: members(StatusGroup::Active),
                    queuing: members(StatusGroup::Queuing),
                    finished: members(StatusGroup::Finished),
                    recycled: members(StatusGroup::Recycled),
                })
            })
            .collect()
    }

    pub fn export_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(&self.export_categories())?)
    }

    // ===== 后端 =====

    /// 追加到后端尝试顺序的末尾，并完成一次进程级初始化
    pub fn add_backend(&mut self, name: &str) -> EngineResult<()> {
        self.ensure_initialized(name)?;
        if !self.backends.iter().any(|b| b == name) {
            self.backends.push(name.to_string());
        }
        Ok(())
    }

    pub fn clear_backends(&mut self) {
        self.backends.clear();
    }

    pub fn set_default_backend(&mut self, name: &str) -> EngineResult<()> {
        self.ensure_initialized(name)?;
        self.default_backend = Some(name.to_string());
        Ok(())
    }

    pub fn backends(&self) -> &[String] {
        &self.backends
    }

    fn ensure_initialized(&mut self, name: &str) -> EngineResult<()> {
        if !self.guards.contains_key(name) {
            let guard = self.runtime.acquire(name)?;
            self.guards.insert(name.to_string(), guard);
        }
        Ok(())
    }

    // ===== 下载节点 =====

    /// 添加下载任务
    ///
    /// 分类依次取：指定的分类、第一个规则匹配的分类、默认分类、自动创建的 `Home`。
    pub fn add_download(&mut self, mut data: DataBundle, category: Option<NodeId>, apply_defaults: bool) -> EngineResult<NodeId> {
        let uri = data
            .uri()
            .map(str::to_string)
            .ok_or_else(|| EngineError::InvalidUri(String::new()))?;
        if !is_valid_uri(&uri) {
            return Err(EngineError::InvalidUri(uri));
        }

        let category = match category {
            Some(id) => {
                self.category_node(id)?;
                id
            }
            None => self.match_category(&uri),
        };

        if apply_defaults {
            if let Some(node) = self.real.get(category) {
                let mut defaults = node.data.clone();
                if let Some(common) = defaults.get_mut::<Common>() {
                    common.name = None;
                    common.uri = None;
                }
                data.assign_missing(&defaults);
            }
        }

        let common = data.realloc::<Common>();
        if common.name.is_none() {
            common.name = name_from_uri(&uri);
        }
        let relation = data.realloc::<Relation>();
        if relation.state() != NodeState::Paused {
            relation.set_state(NodeState::Queuing, false);
        }
        relation.task = None;
        let seq = self.next_seq();
        let log = data.realloc::<Log>();
        log.added_time = Some(Local::now());
        log.state_seq = seq;

        let id = self.real.insert(NodeKind::Download, data, Some(category), None);
        log::info!("添加任务: {} -> 分类 {}", uri, category);
        self.views.refresh_category(&self.real, category);
        Ok(id)
    }

    fn match_category(&mut self, uri: &str) -> NodeId {
        let matched = self.categories().into_iter().find(|&id| {
            self.category(id)
                .map(|c| c.rules.matches(uri))
                .unwrap_or(false)
        });
        if let Some(id) = matched {
            return id;
        }
        if let Some(id) = self.default_category.filter(|&id| self.real.contains(id)) {
            return id;
        }
        let id = self.add_category(HOME_CATEGORY, Category::new(MatchRules::default()), DataBundle::new());
        self.default_category = Some(id);
        id
    }

    /// 在同一分类内调整顺序，`before` 为 None 时移到末尾
    pub fn move_download(&mut self, id: NodeId, before: Option<NodeId>) -> EngineResult<()> {
        let parent = self.download_node(id)?.parent;
        let before = before.filter(|b| *b != id && self.category_of(*b) == parent);
        self.real.relink(id, parent, before);
        if let Some(category) = parent {
            self.views.refresh_category(&self.real, category);
        }
        Ok(())
    }

    pub fn move_to_category(&mut self, id: NodeId, category: NodeId) -> EngineResult<()> {
        self.download_node(id)?;
        self.category_node(category)?;
        self.real.relink(id, Some(category), None);
        self.views.rebuild(&self.real);
        self.evict(category);
        Ok(())
    }

    pub fn pause(&mut self, id: NodeId) -> EngineResult<()> {
        match self.state_of(id)? {
            NodeState::Active => {
                self.stop_adapter(id);
                self.set_state(id, NodeState::Paused);
            }
            NodeState::Queuing => self.set_state(id, NodeState::Paused),
            _ => return Ok(()),
        }
        self.retry_at.remove(&id);
        self.refresh_parent(id);
        Ok(())
    }

    pub fn resume(&mut self, id: NodeId) -> EngineResult<()> {
        match self.state_of(id)? {
            NodeState::Paused => {}
            NodeState::Error => {
                if let Some(node) = self.real.get_mut(id) {
                    node.data.realloc::<Common>().retry_count = 0;
                }
            }
            NodeState::Recycled => {
                if let Some(node) = self.real.get_mut(id) {
                    node.data.realloc::<Log>().recycled_time = None;
                }
            }
            _ => return Ok(()),
        }
        self.set_state(id, NodeState::Queuing);
        self.refresh_parent(id);
        Ok(())
    }

    pub fn pause_all(&mut self) {
        for id in self.downloads_in(&[NodeState::Active, NodeState::Queuing]) {
            if let Err(e) = self.pause(id) {
                log::warn!("暂停任务 {} 失败: {}", id, e);
            }
        }
    }

    pub fn resume_all(&mut self) {
        for id in self.downloads_in(&[NodeState::Paused]) {
            if let Err(e) = self.resume(id) {
                log::warn!("恢复任务 {} 失败: {}", id, e);
            }
        }
    }

    /// 未回收的任务移入回收站（`erase` 时通知后端清理数据）；已回收的任务永久删除
    pub fn delete_download(&mut self, id: NodeId, erase: bool) -> EngineResult<()> {
        let state = self.state_of(id)?;
        if state == NodeState::Recycled {
            return self.purge(id);
        }
        if erase {
            match self.governor.get(id) {
                Some(record) => {
                    if !record.adapter.control(&Control::EraseData) {
                        log::debug!("后端 {} 不支持清理数据", record.adapter.name());
                    }
                }
                None => log::debug!("任务 {} 没有运行中的后端，无需清理数据", id),
            }
        }
        self.stop_adapter(id);
        self.retry_at.remove(&id);
        self.set_state(id, NodeState::Recycled);
        let category = self.category_of(id);
        self.refresh_parent(id);
        if let Some(category) = category {
            self.evict(category);
        }
        Ok(())
    }

    /// 永久删除；后端还在停止时节点数据转移给停止列表
    pub fn purge(&mut self, id: NodeId) -> EngineResult<()> {
        self.download_node(id)?;
        self.stop_adapter(id);
        self.retry_at.remove(&id);
        let category = self.category_of(id);
        let removed = self.real.remove(id);
        if let Some(node) = removed.into_iter().next() {
            if let Some(entry) = self.stopping.iter_mut().find(|s| s.node == id) {
                entry.data = node.data;
            }
        }
        match category {
            Some(category) => self.views.refresh_category(&self.real, category),
            None => self.views.rebuild(&self.real),
        }
        log::info!("任务已永久删除: {}", id);
        Ok(())
    }

    // ===== 查询 =====

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.real.get(id)
    }

    pub fn arena(&self) -> &NodeArena {
        &self.real
    }

    pub fn views(&self) -> &ViewSet {
        &self.views
    }

    pub fn governor(&self) -> &SpeedGovernor {
        &self.governor
    }

    pub fn set_global_speed(&mut self, download: u64, upload: u64) {
        self.governor.set_global_speed(download, upload);
    }

    /// 最近一次 grow 计算出的总速度 [下载, 上传]
    pub fn speed(&self) -> [u64; 2] {
        self.speed
    }

    /// 取出所有节点产生的事件
    pub fn take_events(&mut self) -> Vec<(NodeId, Event)> {
        std::mem::take(&mut self.outbox)
    }

    pub fn counts(&self) -> TreeCounts {
        let buckets = self.views.mix_split();
        TreeCounts {
            active: buckets.len(StatusGroup::Active),
            queuing: buckets.len(StatusGroup::Queuing),
            finished: buckets.len(StatusGroup::Finished),
            recycled: buckets.len(StatusGroup::Recycled),
            stopping: self.stopping.len(),
        }
    }

    // ===== 调度 =====

    /// 一个调度周期：同步、准入、限速、统计
    ///
    /// 返回是否还有活动或排队中的任务，或仍在停止中的后端。
    pub fn grow(&mut self, no_queuing: bool) -> bool {
        let mut dirty: HashSet<NodeId> = HashSet::new();

        self.sync_active(&mut dirty);
        self.sync_stopping();
        if !no_queuing {
            self.admit(&mut dirty);
        }

        self.governor.adjust();
        for record in self.governor.records() {
            if let Some(node) = self.real.get_mut(record.node) {
                node.data.realloc::<Relation>().task = Some(record.snapshot());
            }
        }
        self.speed = self.governor.total_speed();

        for category in dirty {
            self.evict(category);
        }
        self.views.rebuild(&self.real);

        let counts = self.counts();
        counts.active > 0 || self.has_waiting() || counts.stopping > 0
    }

    fn has_waiting(&self) -> bool {
        !self.downloads_in(&[NodeState::Queuing]).is_empty()
    }

    fn sync_active(&mut self, dirty: &mut HashSet<NodeId>) {
        for id in self.governor.nodes() {
            let Some(node) = self.real.get_mut(id) else {
                self.governor.remove(id);
                continue;
            };
            let Some(record) = self.governor.get_mut(id) else {
                continue;
            };

            let first_sync = !record.synced;
            let running = record.adapter.sync(&mut node.data);
            let events = record.adapter.pop_events();
            record.synced = true;
            record.note_terminal(&events);
            if let Some(progress) = node.data.get::<Progress>() {
                record.speed = [progress.download_speed, progress.upload_speed];
            }

            let uploading = events.iter().any(|e| e.kind == EventKind::Uploading);
            let silent = events.is_empty();
            self.record_events(id, events);

            if running {
                if uploading {
                    if let Some(node) = self.real.get_mut(id) {
                        node.data.realloc::<Relation>().set_state(NodeState::Active, true);
                    }
                }
                continue;
            }

            // 完成或错误事件可能在之前的周期里已经弹出
            let terminal = self.governor.remove(id).and_then(|record| {
                record.adapter.release();
                record.terminal
            });
            if let Some(category) = self.category_of(id) {
                dirty.insert(category);
            }

            let progress_done = self
                .real
                .get(id)
                .and_then(|n| n.data.get::<Progress>())
                .map(Progress::is_complete)
                .unwrap_or(false);
            let next = match terminal {
                Some(event) if event.kind == EventKind::Error => self.classify_error(id, &event),
                Some(_) => NodeState::Completed,
                None if progress_done => NodeState::Completed,
                None if first_sync && silent => {
                    let event = Event::error("后端没有报告任何状态就结束了", false);
                    self.record_events(id, vec![event]);
                    NodeState::Error
                }
                None => NodeState::Paused,
            };
            log::info!("任务 {} 结束传输: {:?}", id, next);
            self.set_state(id, next);
        }
    }

    fn classify_error(&mut self, id: NodeId, event: &Event) -> NodeState {
        let Some(node) = self.real.get_mut(id) else {
            return NodeState::Error;
        };
        let policy = self.config.retry.for_node(node.data.get::<Common>());
        let retryable = event.retryable || policy.is_retryable_message(&event.message);
        let common = node.data.realloc::<Common>();
        if !policy.should_retry(retryable, common.retry_count) {
            return NodeState::Error;
        }
        let delay = policy.get_delay(common.retry_count);
        common.retry_count += 1;
        log::info!("任务 {} 第 {} 次重试，{:?} 后重新排队", id, common.retry_count, delay);
        self.retry_at.insert(id, Instant::now() + delay);
        NodeState::Queuing
    }

    fn sync_stopping(&mut self) {
        let mut index = 0;
        while index < self.stopping.len() {
            let entry = &mut self.stopping[index];
            let running = entry.adapter.sync(&mut entry.data);
            let events = entry.adapter.pop_events();
            let node = entry.node;
            if running {
                index += 1;
            } else {
                let entry = self.stopping.remove(index);
                log::debug!("任务 {} 的后端已停止", node);
                entry.adapter.release();
            }
            self.record_events(node, events);
        }
    }

    fn admit(&mut self, dirty: &mut HashSet<NodeId>) {
        let now = Instant::now();
        for category in self.categories() {
            let Some(rules) = self.category(category).cloned() else {
                continue;
            };
            let children = self.real.children(category).to_vec();
            let mut active = children
                .iter()
                .filter(|&&id| self.state_of(id).ok() == Some(NodeState::Active))
                .count();

            let mut candidates: Vec<(usize, NodeId)> = children
                .iter()
                .copied()
                .enumerate()
                .filter(|&(_, id)| {
                    self.kind_of(id) == Some(NodeKind::Download)
                        && self.state_of(id).ok() == Some(NodeState::Queuing)
                        && !self.stopping.iter().any(|s| s.node == id)
                        && self.retry_at.get(&id).map(|at| *at <= now).unwrap_or(true)
                })
                .collect();
            candidates.sort_by_key(|&(order, id)| {
                let priority = self
                    .real
                    .get(id)
                    .and_then(|n| n.data.get::<Relation>())
                    .map(|r| r.priority)
                    .unwrap_or_default();
                (std::cmp::Reverse(priority), order)
            });

            for (_, id) in candidates {
                if !under_limit(active, rules.active_limit)
                    || !under_limit(self.governor.len(), self.config.active_limit)
                {
                    break;
                }
                if self.activate(id) {
                    active += 1;
                } else {
                    dirty.insert(category);
                }
            }
        }
    }

    /// 后端尝试顺序：节点指定的后端、配置的顺序、默认后端
    fn backend_order(&self, preferred: Option<&str>) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        let candidates = preferred
            .into_iter()
            .map(str::to_string)
            .chain(self.backends.iter().cloned())
            .chain(self.default_backend.iter().cloned());
        for name in candidates {
            if !order.contains(&name) {
                order.push(name);
            }
        }
        order
    }

    fn activate(&mut self, id: NodeId) -> bool {
        let Some(node) = self.real.get(id) else {
            return false;
        };
        let preferred = node.data.get::<Relation>().and_then(|r| r.plugin_name.clone());
        let order = self.backend_order(preferred.as_deref());

        let mut chosen = None;
        for name in order {
            let Some(factory) = self.runtime.factory(&name) else {
                log::warn!("后端 {} 未注册，跳过", name);
                continue;
            };
            let adapter = PluginAdapter::create(factory.as_ref());
            if adapter.accept(&node.data) {
                chosen = Some((name, adapter));
                break;
            }
            adapter.release();
        }

        let Some((name, adapter)) = chosen else {
            log::warn!("没有后端可以处理任务 {}", id);
            self.record_events(id, vec![Event::error("没有后端可以处理这个任务", false)]);
            self.set_state(id, NodeState::Error);
            return false;
        };

        if !adapter.start() {
            let mut events = adapter.pop_events();
            events.push(Event::error(format!("后端 {} 启动失败", name), false));
            self.record_events(id, events);
            adapter.release();
            self.set_state(id, NodeState::Error);
            return false;
        }

        let Some(node) = self.real.get_mut(id) else {
            return false;
        };
        let own_limit = node
            .data
            .get::<Common>()
            .map(|c| [c.max_download_speed, c.max_upload_speed])
            .unwrap_or([0, 0]);
        let relation = node.data.realloc::<Relation>();
        relation.plugin_name = Some(name.clone());
        let priority = relation.priority;
        let record = RelationRecord::new(id, adapter, priority, own_limit);
        node.data.realloc::<Relation>().task = Some(record.snapshot());
        if let Some(old) = self.governor.add(record) {
            old.adapter.stop();
        }
        self.retry_at.remove(&id);
        self.set_state(id, NodeState::Active);
        log::info!("任务 {} 由后端 {} 开始传输", id, name);
        true
    }

    /// 停止后端并立即移除调度记录，后端进入停止列表
    fn stop_adapter(&mut self, id: NodeId) {
        let Some(record) = self.governor.remove(id) else {
            return;
        };
        record.adapter.stop();
        let data = self.real.get(id).map(|n| n.data.clone()).unwrap_or_default();
        self.stopping.push(Stopping {
            node: id,
            adapter: record.adapter,
            data,
        });
        if let Some(node) = self.real.get_mut(id) {
            node.data.realloc::<Relation>().task = None;
        }
    }

    /// 已完成数量超限时最旧的移入回收站，回收站超限时最旧的永久删除
    fn evict(&mut self, category: NodeId) {
        let Some(rules) = self.category(category).cloned() else {
            return;
        };
        let mut finished = self.members_by_age(category, StatusGroup::Finished);
        while over_limit(finished.len(), rules.finished_limit) {
            let oldest = finished.remove(0);
            log::debug!("分类 {} 的已完成任务超出上限，回收 {}", category, oldest);
            self.set_state(oldest, NodeState::Recycled);
        }

        let mut recycled = self.members_by_age(category, StatusGroup::Recycled);
        while over_limit(recycled.len(), rules.recycled_limit) {
            let oldest = recycled.remove(0);
            log::debug!("分类 {} 的回收站超出上限，删除 {}", category, oldest);
            if let Err(e) = self.purge(oldest) {
                log::warn!("删除任务 {} 失败: {}", oldest, e);
            }
        }
        self.views.refresh_category(&self.real, category);
    }

    fn members_by_age(&self, category: NodeId, group: StatusGroup) -> Vec<NodeId> {
        let mut members: Vec<(u64, NodeId)> = self
            .real
            .children(category)
            .iter()
            .filter_map(|&id| {
                let node = self.real.get(id)?;
                if node.kind != NodeKind::Download || node.data.status().group() != group {
                    return None;
                }
                let seq = node.data.get::<Log>().map(|l| l.state_seq).unwrap_or(0);
                Some((seq, id))
            })
            .collect();
        members.sort();
        members.into_iter().map(|(_, id)| id).collect()
    }

    // ===== 内部工具 =====

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn set_state(&mut self, id: NodeId, state: NodeState) {
        let seq = self.next_seq();
        let Some(node) = self.real.get_mut(id) else {
            return;
        };
        let relation = node.data.realloc::<Relation>();
        relation.set_state(state, false);
        if state != NodeState::Active {
            relation.task = None;
        }
        let log = node.data.realloc::<Log>();
        log.state_seq = seq;
        match state {
            NodeState::Completed => log.completed_time = Some(Local::now()),
            NodeState::Recycled => log.recycled_time = Some(Local::now()),
            _ => {}
        }
    }

    fn record_events(&mut self, id: NodeId, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        if let Some(node) = self.real.get_mut(id) {
            node.data.realloc::<Log>().messages.extend(events.iter().cloned());
        }
        self.outbox.extend(events.into_iter().map(|e| (id, e)));
    }

    fn refresh_parent(&mut self, id: NodeId) {
        if let Some(category) = self.category_of(id) {
            self.views.refresh_category(&self.real, category);
        }
    }

    fn kind_of(&self, id: NodeId) -> Option<NodeKind> {
        self.real.get(id).map(|n| n.kind)
    }

    fn state_of(&self, id: NodeId) -> EngineResult<NodeState> {
        Ok(self.download_node(id)?.data.status().state())
    }

    fn download_node(&self, id: NodeId) -> EngineResult<&Node> {
        let node = self.real.get(id).ok_or(EngineError::NodeNotFound(id))?;
        if node.kind != NodeKind::Download {
            return Err(EngineError::NotADownload(id));
        }
        Ok(node)
    }

    fn category_node(&self, id: NodeId) -> EngineResult<&Node> {
        let node = self.real.get(id).ok_or(EngineError::CategoryNotFound(id))?;
        if node.kind != NodeKind::Category {
            return Err(EngineError::NotACategory(id));
        }
        Ok(node)
    }

    fn downloads_in(&self, states: &[NodeState]) -> Vec<NodeId> {
        self.categories()
            .into_iter()
            .flat_map(|category| self.real.children(category).to_vec())
            .filter(|&id| {
                self.state_of(id)
                    .map(|state| states.contains(&state))
                    .unwrap_or(false)
            })
            .collect()
    }
}
