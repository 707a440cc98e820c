//! 节点选项分组
//!
//! 每个节点持有一个 [`DataBundle`]，按 [`GroupKind`] 存放若干相互独立的分组
//! （Common、Progress、Http、Ftp、Proxy、Log、Relation、Category）。

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::core::category::Category;
use crate::core::status::{NodeState, Status};
use crate::plugin::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupKind {
    Common,
    Progress,
    Proxy,
    Http,
    Ftp,
    Log,
    Relation,
    Category,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Group {
    Common(Common),
    Progress(Progress),
    Proxy(Proxy),
    Http(Http),
    Ftp(Ftp),
    Log(Log),
    Relation(Relation),
    Category(Category),
}

/// 可以放进 [`DataBundle`] 的分组类型
pub trait GroupData: Default + Clone + Sized {
    const KIND: GroupKind;
    /// 是否可以由分类默认值继承
    const INHERITABLE: bool = false;

    fn wrap(self) -> Group;
    fn peek(group: &Group) -> Option<&Self>;
    fn peek_mut(group: &mut Group) -> Option<&mut Self>;

    /// 用默认值填充未设置的字段
    fn fill_from(&mut self, _defaults: &Self) {}
}

macro_rules! group_data {
    (@impl $ty:ident, $($extra:tt)*) => {
        impl GroupData for $ty {
            const KIND: GroupKind = GroupKind::$ty;
            $($extra)*

            fn wrap(self) -> Group {
                Group::$ty(self)
            }

            fn peek(group: &Group) -> Option<&Self> {
                match group {
                    Group::$ty(value) => Some(value),
                    _ => None,
                }
            }

            fn peek_mut(group: &mut Group) -> Option<&mut Self> {
                match group {
                    Group::$ty(value) => Some(value),
                    _ => None,
                }
            }
        }
    };
    ($ty:ident, inherit) => {
        group_data!(@impl $ty,
            const INHERITABLE: bool = true;

            fn fill_from(&mut self, defaults: &Self) {
                $ty::fill_missing(self, defaults)
            }
        );
    };
    ($ty:ident) => {
        group_data!(@impl $ty,);
    };
}

fn fill_str(target: &mut Option<String>, source: &Option<String>) {
    if target.is_none() {
        target.clone_from(source);
    }
}

fn fill_num<T: Copy + Default + PartialEq>(target: &mut T, source: T) {
    if *target == T::default() {
        *target = source;
    }
}

/// 通用选项：URI、保存位置、超时和重试策略
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Common {
    pub name: Option<String>,
    pub uri: Option<String>,
    pub mirrors: Option<String>,
    pub file: Option<String>,
    pub folder: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// 秒
    pub connect_timeout: u32,
    /// 秒
    pub transmit_timeout: u32,
    /// 秒
    pub retry_delay: u32,
    pub retry_limit: u32,
    pub retry_count: u32,
    pub max_connections: u32,
    /// 字节/秒，0 表示不限速
    pub max_download_speed: u64,
    pub max_upload_speed: u64,
    pub timestamp: bool,
    pub debug_level: u8,
}

impl Common {
    pub fn with_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Self::default()
        }
    }

    fn fill_missing(&mut self, defaults: &Self) {
        fill_str(&mut self.name, &defaults.name);
        fill_str(&mut self.uri, &defaults.uri);
        fill_str(&mut self.mirrors, &defaults.mirrors);
        fill_str(&mut self.file, &defaults.file);
        fill_str(&mut self.folder, &defaults.folder);
        fill_str(&mut self.user, &defaults.user);
        fill_str(&mut self.password, &defaults.password);
        fill_num(&mut self.connect_timeout, defaults.connect_timeout);
        fill_num(&mut self.transmit_timeout, defaults.transmit_timeout);
        fill_num(&mut self.retry_delay, defaults.retry_delay);
        fill_num(&mut self.retry_limit, defaults.retry_limit);
        fill_num(&mut self.max_connections, defaults.max_connections);
        fill_num(&mut self.max_download_speed, defaults.max_download_speed);
        fill_num(&mut self.max_upload_speed, defaults.max_upload_speed);
        fill_num(&mut self.debug_level, defaults.debug_level);
        self.timestamp |= defaults.timestamp;
    }
}

/// 传输进度，由后端在 sync 时写入
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// 已用时间（秒）
    pub elapsed: u64,
    /// 剩余时间（秒）
    pub left: u64,
    pub complete: u64,
    pub total: u64,
    pub uploaded: u64,
    pub ratio: f64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub percent: u8,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.complete >= self.total
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyType {
    #[default]
    None,
    /// 由后端自行决定
    Default,
    Http,
    Socks4,
    Socks5,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    pub host: Option<String>,
    pub port: u16,
    pub kind: ProxyType,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Proxy {
    fn fill_missing(&mut self, defaults: &Self) {
        fill_str(&mut self.host, &defaults.host);
        fill_num(&mut self.port, defaults.port);
        fill_num(&mut self.kind, defaults.kind);
        fill_str(&mut self.user, &defaults.user);
        fill_str(&mut self.password, &defaults.password);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Http {
    pub user: Option<String>,
    pub password: Option<String>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub post_data: Option<String>,
    pub post_file: Option<String>,
    pub cookie_data: Option<String>,
    pub cookie_file: Option<String>,
    pub redirection_limit: u32,
    pub redirection_count: u32,
}

impl Http {
    fn fill_missing(&mut self, defaults: &Self) {
        fill_str(&mut self.user, &defaults.user);
        fill_str(&mut self.password, &defaults.password);
        fill_str(&mut self.referrer, &defaults.referrer);
        fill_str(&mut self.user_agent, &defaults.user_agent);
        fill_str(&mut self.post_data, &defaults.post_data);
        fill_str(&mut self.post_file, &defaults.post_file);
        fill_str(&mut self.cookie_data, &defaults.cookie_data);
        fill_str(&mut self.cookie_file, &defaults.cookie_file);
        fill_num(&mut self.redirection_limit, defaults.redirection_limit);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ftp {
    pub user: Option<String>,
    pub password: Option<String>,
    pub active_mode: bool,
}

impl Ftp {
    fn fill_missing(&mut self, defaults: &Self) {
        fill_str(&mut self.user, &defaults.user);
        fill_str(&mut self.password, &defaults.password);
        self.active_mode |= defaults.active_mode;
    }
}

/// 节点日志：时间戳和已弹出的事件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Log {
    pub added_time: Option<DateTime<Local>>,
    pub completed_time: Option<DateTime<Local>>,
    pub recycled_time: Option<DateTime<Local>>,
    pub messages: Vec<Event>,
    /// 最近一次状态变化的序号，用于淘汰最旧的节点
    pub state_seq: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// 发布给界面的只读调度快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// [下载, 上传]，字节/秒
    pub speed: [u64; 2],
    /// [下载, 上传]，0 表示不限速
    pub limit: [u64; 2],
}

/// 节点与调度器之间的关联信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    status: Status,
    pub priority: Priority,
    /// 指定使用的后端名称
    pub plugin_name: Option<String>,
    /// 节点处于活动集合时由调度器写入
    pub task: Option<TaskSnapshot>,
}

impl Relation {
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn state(&self) -> NodeState {
        self.status.state()
    }

    pub fn set_state(&mut self, state: NodeState, uploading: bool) {
        self.status = Status::for_state(state, uploading);
    }
}

group_data!(Common, inherit);
group_data!(Progress);
group_data!(Proxy, inherit);
group_data!(Http, inherit);
group_data!(Ftp, inherit);
group_data!(Log);
group_data!(Relation);
group_data!(Category);

/// 分组容器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataBundle {
    groups: BTreeMap<GroupKind, Group>,
}

impl DataBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: GroupData>(&self) -> Option<&T> {
        self.groups.get(&T::KIND).and_then(T::peek)
    }

    pub fn get_mut<T: GroupData>(&mut self) -> Option<&mut T> {
        self.groups.get_mut(&T::KIND).and_then(T::peek_mut)
    }

    /// 取得分组，不存在时插入默认值
    pub fn realloc<T: GroupData>(&mut self) -> &mut T {
        let group = self.groups.entry(T::KIND).or_insert_with(|| T::default().wrap());
        if T::peek(group).is_none() {
            *group = T::default().wrap();
        }
        match T::peek_mut(group) {
            Some(value) => value,
            None => unreachable!("分组类型与键不一致"),
        }
    }

    pub fn insert<T: GroupData>(&mut self, value: T) {
        self.groups.insert(T::KIND, value.wrap());
    }

    pub fn with<T: GroupData>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    pub fn remove<T: GroupData>(&mut self) -> Option<T> {
        match self.groups.remove(&T::KIND) {
            Some(group) => T::peek(&group).cloned(),
            None => None,
        }
    }

    pub fn contains(&self, kind: GroupKind) -> bool {
        self.groups.contains_key(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = GroupKind> + '_ {
        self.groups.keys().copied()
    }

    /// 将分类默认值中可继承的分组合并进来，已设置的字段保持不变
    pub fn assign_missing(&mut self, defaults: &DataBundle) {
        self.assign_group::<Common>(defaults);
        self.assign_group::<Proxy>(defaults);
        self.assign_group::<Http>(defaults);
        self.assign_group::<Ftp>(defaults);
    }

    fn assign_group<T: GroupData>(&mut self, defaults: &DataBundle) {
        if !T::INHERITABLE {
            return;
        }
        if let Some(source) = defaults.get::<T>() {
            match self.get_mut::<T>() {
                Some(target) => target.fill_from(source),
                None => self.insert(source.clone()),
            }
        }
    }

    pub fn uri(&self) -> Option<&str> {
        self.get::<Common>().and_then(|c| c.uri.as_deref())
    }

    pub fn status(&self) -> Status {
        self.get::<Relation>().map(Relation::status).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realloc_inserts_default() {
        let mut data = DataBundle::new();
        assert!(data.get::<Progress>().is_none());
        data.realloc::<Progress>().total = 100;
        assert_eq!(data.get::<Progress>().map(|p| p.total), Some(100));
        assert!(data.contains(GroupKind::Progress));
    }

    #[test]
    fn test_remove_group() {
        let mut data = DataBundle::new().with(Common::with_uri("http://a/b"));
        let common = data.remove::<Common>();
        assert_eq!(common.and_then(|c| c.uri), Some("http://a/b".to_string()));
        assert!(data.get::<Common>().is_none());
    }

    #[test]
    fn test_assign_missing_keeps_own_fields() {
        let mut defaults = DataBundle::new();
        defaults.insert(Common {
            folder: Some("/downloads".into()),
            retry_limit: 5,
            uri: Some("http://default/".into()),
            ..Common::default()
        });
        defaults.insert(Http {
            user_agent: Some("multiget".into()),
            ..Http::default()
        });
        defaults.realloc::<Progress>().total = 9;

        let mut data = DataBundle::new().with(Common {
            uri: Some("http://own/".into()),
            retry_limit: 2,
            ..Common::default()
        });
        data.assign_missing(&defaults);

        let common = data.get::<Common>().unwrap();
        assert_eq!(common.uri.as_deref(), Some("http://own/"));
        assert_eq!(common.folder.as_deref(), Some("/downloads"));
        assert_eq!(common.retry_limit, 2);
        assert_eq!(data.get::<Http>().unwrap().user_agent.as_deref(), Some("multiget"));
        // 进度不可继承
        assert!(data.get::<Progress>().is_none());
    }

    #[test]
    fn test_only_option_groups_inherit() {
        assert!(Common::INHERITABLE && Proxy::INHERITABLE && Http::INHERITABLE && Ftp::INHERITABLE);
        assert!(!Progress::INHERITABLE && !Log::INHERITABLE && !Relation::INHERITABLE);
        assert!(!Category::INHERITABLE);

        let mut progress = Progress {
            total: 10,
            ..Progress::default()
        };
        progress.fill_from(&Progress {
            total: 99,
            complete: 5,
            ..Progress::default()
        });
        assert_eq!((progress.total, progress.complete), (10, 0));
    }

    #[test]
    fn test_relation_state() {
        let mut relation = Relation::default();
        assert_eq!(relation.state(), NodeState::Queuing);
        relation.set_state(NodeState::Active, true);
        assert!(relation.status().contains(Status::UPLOADING));
        relation.set_state(NodeState::Paused, true);
        assert_eq!(relation.status(), Status::PAUSED);
    }
}
