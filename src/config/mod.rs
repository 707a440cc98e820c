use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::core::category::{Category, MatchRules};
use crate::core::data::{Common, DataBundle, Http};
use crate::core::error::{EngineError, EngineResult};
use crate::core::retry::RetryPolicy;
use crate::core::tree::TreeConfig;
use crate::ipc::DEFAULT_PORT;

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 全局下载速度限制（KB/s），0 表示不限速
    pub download_speed_kb: u64,
    /// 全局上传速度限制（KB/s），0 表示不限速
    pub upload_speed_kb: u64,
    /// 默认下载目录
    pub download_dir: String,
    /// 调度间隔（毫秒）
    pub tick_interval_ms: u64,
    /// 全局同时下载数，0 表示只受分类限制
    pub max_active_downloads: usize,
    /// 限速时每个任务的保底速度（KB/s）
    pub speed_floor_kb: u64,
    /// 单实例通道端口
    pub ipc_port: u16,
    /// 重试次数
    pub retry_count: u32,
    /// 重试延迟（秒）
    pub retry_delay: u64,
    /// 最大重试延迟（秒）
    pub retry_max_delay: u64,
    /// User-Agent
    pub user_agent: String,
    /// 依次尝试的后端
    pub backends: Vec<String>,
    /// 都不接受时使用的后端
    pub default_backend: Option<String>,
    pub rpc: RpcConfig,
    pub log: LogConfig,
    pub categories: Vec<CategoryConfig>,
}

/// 外部 RPC 下载程序
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    pub uri: Option<String>,
    pub helper_path: Option<String>,
    pub helper_args: Option<String>,
    /// 启动时拉起外部程序
    pub launch: bool,
    /// 退出时关闭外部程序
    pub shutdown: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            uri: None,
            helper_path: None,
            helper_args: None,
            launch: false,
            shutdown: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// 日志文件，为空时输出到标准错误
    pub file: Option<String>,
    pub level: String,
    /// 超过后轮转到 `<file>.backup`
    pub max_size_mb: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file: None,
            level: "info".to_string(),
            max_size_mb: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CategoryConfig {
    pub name: String,
    pub schemes: Vec<String>,
    pub hosts: Vec<String>,
    pub file_exts: Vec<String>,
    pub active_limit: usize,
    pub finished_limit: usize,
    pub recycled_limit: usize,
    /// 覆盖全局下载目录
    pub folder: Option<String>,
}

impl Default for CategoryConfig {
    fn default() -> Self {
        let category = Category::new(MatchRules::default());
        Self {
            name: String::new(),
            schemes: Vec::new(),
            hosts: Vec::new(),
            file_exts: Vec::new(),
            active_limit: category.active_limit,
            finished_limit: category.finished_limit,
            recycled_limit: category.recycled_limit,
            folder: None,
        }
    }
}

impl CategoryConfig {
    pub fn to_category(&self) -> Category {
        Category::new(MatchRules {
            schemes: self.schemes.clone(),
            hosts: self.hosts.clone(),
            file_exts: self.file_exts.clone(),
        })
        .with_limits(self.active_limit, self.finished_limit, self.recycled_limit)
    }

    /// 分类中新任务的默认选项
    pub fn defaults(&self, config: &Config) -> DataBundle {
        let mut common = Common {
            folder: Some(self.folder.clone().unwrap_or_else(|| config.download_dir.clone())),
            ..Common::default()
        };
        common.retry_limit = config.retry_count;
        common.retry_delay = config.retry_delay as u32;
        DataBundle::new().with(common).with(Http {
            user_agent: Some(config.user_agent.clone()),
            ..Http::default()
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_speed_kb: 0, // 默认不限速
            upload_speed_kb: 0,
            download_dir: "./downloads".to_string(),
            tick_interval_ms: 500,
            max_active_downloads: 0,
            speed_floor_kb: 1,
            ipc_port: DEFAULT_PORT,
            retry_count: 3,
            retry_delay: 5,
            retry_max_delay: 60,
            user_agent: format!("multiget/{}", env!("CARGO_PKG_VERSION")),
            backends: Vec::new(),
            default_backend: None,
            rpc: RpcConfig::default(),
            log: LogConfig::default(),
            categories: Vec::new(),
        }
    }
}

impl Config {
    /// 加载配置文件，不存在时写入默认配置
    pub fn load(path: &str) -> EngineResult<Self> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            match toml::from_str(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    // 保留用户的文件，只用默认值运行
                    log::warn!("配置文件格式错误: {}，将使用默认配置", e);
                    Ok(Config::default())
                }
            }
        } else {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            Ok(config)
        }
    }

    /// 保存带教程的配置文件（唯一写入方法）
    pub fn save_with_tutorial(&self, path: &str) -> EngineResult<()> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }
        let config_content = toml::to_string_pretty(self)
            .map_err(|e| EngineError::Config(format!("无法序列化配置: {}", e)))?;
        let full_content = format!("{}\n{}", Config::generate_tutorial_content(), config_content);
        fs::write(path, full_content)?;
        Ok(())
    }

    /// 教程只包含注释，配置项由序列化结果给出
    fn generate_tutorial_content() -> String {
        r#"# multiget 配置文件
# ====================
#
# TOML 格式。修改后保存，下次启动生效。
# 命令行参数会覆盖配置文件中的设置，优先级：命令行 > 配置文件 > 默认值
#
# 使用示例：
#   multiget https://example.com/file.zip          # 使用默认配置
#   multiget -l 1000 https://example.com/file.zip  # 下载限速 1000 KB/s
#   multiget -d /path/to/downloads <uri>           # 指定保存目录
#   multiget --category 视频 <uri>                 # 放入指定分类
#
# 已有实例在运行时，再次执行 multiget <uri> 会把任务交给它，然后立即退出。
#
# ==================== 配置项说明 ====================
#
# download_speed_kb / upload_speed_kb
#   全局速度上限（KB/s），0 表示不限速。所有任务按当前速度比例分配，
#   速度很低的任务至少保留 speed_floor_kb。
#
# max_active_downloads
#   全局同时下载数，0 表示只受各分类 active_limit 限制。
#
# tick_interval_ms
#   调度间隔，每个间隔同步一次任务进度并重新分配带宽。
#
# ipc_port
#   单实例通道端口，只监听 127.0.0.1。
#
# retry_count / retry_delay / retry_max_delay
#   可重试错误的重试次数、首次延迟和最大延迟（秒），延迟按指数增长。
#
# backends / default_backend
#   依次尝试的后端名称，例如 ["rpc", "plain"]。都不接受时使用 default_backend。
#
# [rpc]
#   uri          外部下载程序的 RPC 地址
#   helper_path  外部下载程序路径
#   helper_args  启动参数
#   launch       启动时拉起外部程序
#   shutdown     退出时关闭外部程序
#
# [log]
#   file         日志文件，不设置时输出到终端
#   level        error / warn / info / debug / trace
#   max_size_mb  超过后轮转到 <file>.backup
#
# [[categories]]
#   name            分类名称
#   schemes         匹配的协议，例如 ["magnet"]
#   hosts           匹配的主机，支持 * 通配，例如 ["*.example.com"]
#   file_exts       匹配的扩展名，例如 ["mp4", "mkv"]
#   active_limit    分类内同时下载数
#   finished_limit  保留的已完成任务数，超出后最早的进入回收站
#   recycled_limit  回收站容量，超出后最早的被永久删除
#   folder          分类保存目录
#
# ==================== 故障排除 ====================
#
# 问题：新任务一直在排队
# 解决：增大分类的 active_limit 或 max_active_downloads
#
# 问题：提示端口被占用但没有运行中的实例
# 解决：修改 ipc_port
#
# ==================== 当前配置 ====================
"#
        .to_string()
    }

    /// 校验配置合法性
    pub fn validate(&self) -> EngineResult<()> {
        if self.download_dir.is_empty() {
            return Err(EngineError::Config("下载目录不能为空".to_string()));
        }

        if self.tick_interval_ms == 0 {
            return Err(EngineError::Config("调度间隔必须大于0".to_string()));
        }

        if self.ipc_port == 0 {
            return Err(EngineError::Config("IPC端口不能为0".to_string()));
        }

        if self.retry_max_delay < self.retry_delay {
            return Err(EngineError::Config("最大重试延迟不能小于重试延迟".to_string()));
        }

        if log::LevelFilter::from_str(&self.log.level).is_err() {
            return Err(EngineError::Config(format!("无效的日志级别: {}", self.log.level)));
        }

        if matches!(self.default_backend.as_deref(), Some("")) || self.backends.iter().any(String::is_empty) {
            return Err(EngineError::Config("后端名称不能为空".to_string()));
        }

        let mut names = HashSet::new();
        for category in &self.categories {
            if category.name.is_empty() {
                return Err(EngineError::Config("分类名称不能为空".to_string()));
            }
            if !names.insert(category.name.as_str()) {
                return Err(EngineError::Config(format!("分类名称重复: {}", category.name)));
            }
        }

        Ok(())
    }

    /// 合并命令行参数到配置
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        // 命令行参数覆盖配置文件
        if let Some(speed_limit) = args.speed_limit_kb {
            self.download_speed_kb = speed_limit;
        }

        if let Some(upload_limit) = args.upload_limit_kb {
            self.upload_speed_kb = upload_limit;
        }
    }

    /// [下载, 上传]（字节/秒）
    pub fn global_speed(&self) -> [u64; 2] {
        [
            self.download_speed_kb.saturating_mul(1024),
            self.upload_speed_kb.saturating_mul(1024),
        ]
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn tree_config(&self) -> TreeConfig {
        TreeConfig {
            active_limit: self.max_active_downloads,
            speed_floor: self.speed_floor_kb.saturating_mul(1024),
            retry: RetryPolicy {
                max_retries: self.retry_count,
                base_delay: Duration::from_secs(self.retry_delay),
                max_delay: Duration::from_secs(self.retry_max_delay),
                ..RetryPolicy::default()
            },
        }
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        let speed = |kb: u64| if kb == 0 { "不限速".to_string() } else { format!("{} KB/s", kb) };
        format!(
            "配置摘要:\n\
            - 下载目录: {}\n\
            - 下载限速: {}\n\
            - 上传限速: {}\n\
            - 同时下载: {}\n\
            - 重试次数: {}\n\
            - 后端: {}\n\
            - 分类: {}",
            self.download_dir,
            speed(self.download_speed_kb),
            speed(self.upload_speed_kb),
            if self.max_active_downloads == 0 { "按分类".to_string() } else { self.max_active_downloads.to_string() },
            self.retry_count,
            if self.backends.is_empty() { "默认".to_string() } else { self.backends.join(", ") },
            self.categories.iter().map(|c| c.name.as_str()).collect::<Vec<_>>().join(", "),
        )
    }
}
