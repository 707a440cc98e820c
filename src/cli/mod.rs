//! CLI: 命令行接口和参数解析模块
//!
//! ## 主要功能
//!
//! - 命令行参数解析
//! - 配置文件路径管理
//! - URI 列表处理（命令行参数和输入文件）
//! - 把参数转换成下载任务的选项分组
//!
//! 同一套语法也用来解析其它进程转交过来的参数。
//!
//! ## 支持的命令
//!
//! - 基本下载：`multiget <uri>`
//! - 批量下载：`multiget -i uris.txt`
//! - 编辑配置：`multiget -e`
//! - 指定配置：`multiget -c config.conf <uri>`
//! - 速度限制：`multiget -l 1024 <uri>`
//!
//! ## 平台支持
//!
//! - Windows: `%APPDATA%/multiget/multiget.conf`
//! - macOS: `~/Library/Application Support/multiget/multiget.conf`
//! - Linux: `~/.config/multiget/multiget.conf`

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::core::data::{Common, DataBundle, Http, Proxy, ProxyType, Relation};
use crate::core::status::NodeState;
use crate::utils::validator::{is_valid_uri, validate_uris};

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/multiget/multiget.conf", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/multiget/multiget.conf", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/multiget/multiget.conf", home)
    }
}

/// 打开配置文件编辑器
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // 优先 xdg-open，否则 nano
        if std::process::Command::new("xdg-open").arg(config_path).status().is_err() {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

/// multiget 命令行参数
///
/// 示例用法：
///   multiget https://example.com/file.zip
///   multiget -e  # 编辑配置文件
///   multiget -c /path/to/config.conf https://example.com/file.zip
///   multiget -l 1000 https://example.com/file.zip
#[derive(Parser, Debug, Clone)]
#[command(
    name = "multiget",
    author = "panzhifu",
    version = env!("CARGO_PKG_VERSION"),
    about = "一个用 Rust 编写的多后端下载管理器",
    long_about = "按分类排队、全局限速、单实例运行的下载管理器。再次启动时参数会转交给已运行的实例。\n\n示例：\n  multiget https://example.com/file.zip\n  multiget -e\n  multiget -c /path/to/config.conf https://example.com/file.zip\n  multiget -l 1000 magnet:?xt=urn:btih:...\n"
)]
pub struct Args {
    /// 要下载的URI列表（可同时指定多个）
    #[arg(required = false, help = "要下载的URI列表，可以同时指定多个。")]
    pub uris: Vec<String>,

    /// 包含URI列表的文件路径
    #[arg(short = 'i', long = "input-file", help = "包含URI列表的文件路径，每行一个。")]
    pub input_file: Option<String>,

    /// 配置文件路径，默认为平台推荐路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径，默认为平台推荐路径。")]
    pub config: String,

    /// 编辑配置文件（-e 或 --edit）
    #[arg(short = 'e', long = "edit", help = "用系统默认编辑器打开配置文件并退出。")]
    pub edit_config: bool,

    /// 全局下载速度限制（KB/s），0 表示不限速
    #[arg(long, short = 'l', help = "全局下载速度限制（KB/s），0 表示不限速。")]
    pub speed_limit_kb: Option<u64>,

    /// 全局上传速度限制（KB/s），0 表示不限速
    #[arg(long, short = 'u', help = "全局上传速度限制（KB/s），0 表示不限速。")]
    pub upload_limit_kb: Option<u64>,

    /// 保存目录
    #[arg(long = "folder", short = 'd', help = "保存目录，覆盖分类中的设置。")]
    pub folder: Option<String>,

    /// 指定文件名，只对单个URI有效
    #[arg(long, short = 'n', help = "指定文件名，覆盖URI自动推断，只对单个URI有效。")]
    pub file_name: Option<String>,

    #[arg(long, help = "HTTP Referer")]
    pub referrer: Option<String>,

    #[arg(long = "user-agent", help = "HTTP User-Agent")]
    pub user_agent: Option<String>,

    /// 代理，格式 host:port
    #[arg(long, help = "HTTP 代理，格式 host:port。")]
    pub proxy: Option<String>,

    #[arg(long = "cookie-file", help = "Cookie 文件路径。")]
    pub cookie_file: Option<String>,

    /// 放入指定名称的分类
    #[arg(long, help = "放入指定名称的分类，默认按规则自动匹配。")]
    pub category: Option<String>,

    /// 添加后先暂停
    #[arg(long, help = "添加后保持暂停状态。")]
    pub paused: bool,

    /// 不显示进度
    #[arg(long, short = 'q', help = "安静模式，不显示进度。")]
    pub quiet: bool,
}

impl Args {
    /// 读取命令行和输入文件中的URI
    pub fn get_uris(&self) -> Result<Vec<String>> {
        let mut uris = Vec::new();
        uris.extend_from_slice(&self.uris);

        if let Some(file_path) = &self.input_file {
            if !Path::new(file_path).exists() {
                anyhow::bail!("URI文件不存在: {}", file_path);
            }
            let content = fs::read_to_string(file_path)
                .with_context(|| format!("无法读取URI文件: {}", file_path))?;

            // 按行读取，忽略空行和注释
            for line in content.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    uris.push(line.to_string());
                }
            }
        }

        validate_uris(&uris)?;
        Ok(uris)
    }
}

/// 提交给引擎的一批任务
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitOptions {
    pub folder: Option<String>,
    pub file_name: Option<String>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub cookie_file: Option<String>,
    pub category: Option<String>,
    pub paused: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Submission {
    pub uris: Vec<String>,
    pub options: SubmitOptions,
}

impl Submission {
    pub fn from_args(args: &Args) -> Result<Self> {
        Ok(Self {
            uris: args.get_uris()?,
            options: SubmitOptions {
                folder: args.folder.clone(),
                file_name: args.file_name.clone(),
                referrer: args.referrer.clone(),
                user_agent: args.user_agent.clone(),
                proxy: args.proxy.clone(),
                cookie_file: args.cookie_file.clone(),
                category: args.category.clone(),
                paused: args.paused,
            },
        })
    }

    /// 解析其它进程转交的参数（不含程序名）
    pub fn from_batch(batch: &[String]) -> Result<Self> {
        let argv = std::iter::once("multiget".to_string()).chain(batch.iter().cloned());
        let args = Args::try_parse_from(argv)?;
        Self::from_args(&args)
    }

    pub fn is_empty(&self) -> bool {
        self.uris.is_empty()
    }

    /// 每个URI一个选项集合
    pub fn to_bundles(&self) -> Vec<DataBundle> {
        let options = &self.options;
        let single = self.uris.len() == 1;
        self.uris
            .iter()
            .filter(|uri| is_valid_uri(uri))
            .map(|uri| {
                let mut data = DataBundle::new().with(Common {
                    uri: Some(uri.clone()),
                    file: if single { options.file_name.clone() } else { None },
                    folder: options.folder.clone(),
                    ..Common::default()
                });
                if options.referrer.is_some() || options.user_agent.is_some() || options.cookie_file.is_some() {
                    data.insert(Http {
                        referrer: options.referrer.clone(),
                        user_agent: options.user_agent.clone(),
                        cookie_file: options.cookie_file.clone(),
                        ..Http::default()
                    });
                }
                if let Some(proxy) = options.proxy.as_deref().and_then(parse_proxy) {
                    data.insert(proxy);
                }
                if options.paused {
                    data.realloc::<Relation>().set_state(NodeState::Paused, false);
                }
                data
            })
            .collect()
    }
}

fn parse_proxy(value: &str) -> Option<Proxy> {
    let (host, port) = value.rsplit_once(':')?;
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some(Proxy {
        host: Some(host.to_string()),
        port,
        kind: ProxyType::Http,
        ..Proxy::default()
    })
}

/// 带路径值的参数：(短参数, 长参数)
const PATH_OPTIONS: [(&str, &str); 3] = [("-i", "--input-file"), ("-d", "--folder"), ("", "--cookie-file")];

fn absolute(cwd: &Path, value: &str) -> String {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        value.to_string()
    } else {
        cwd.join(path).to_string_lossy().into_owned()
    }
}

/// 转交给运行中实例前把相对路径换成绝对路径
///
/// 对方的工作目录和本进程不同。`--` 之后的参数原样保留。
pub fn forwarded_args(raw: &[String], cwd: &Path) -> Vec<String> {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            out.push(arg.clone());
            out.extend(iter.by_ref().cloned());
            break;
        }
        let matched = PATH_OPTIONS.iter().find_map(|&(short, long)| {
            if arg == long || (!short.is_empty() && arg == short) {
                Some(None)
            } else if let Some(value) = arg.strip_prefix(long).and_then(|v| v.strip_prefix('=')) {
                Some(Some(format!("{}={}", long, absolute(cwd, value))))
            } else if !short.is_empty() && arg.starts_with(short) && !arg.starts_with("--") {
                Some(Some(format!("{}{}", short, absolute(cwd, &arg[short.len()..]))))
            } else {
                None
            }
        });
        match matched {
            Some(Some(rewritten)) => out.push(rewritten),
            Some(None) => {
                out.push(arg.clone());
                if let Some(value) = iter.next() {
                    out.push(absolute(cwd, value));
                }
            }
            None => out.push(arg.clone()),
        }
    }
    out
}

// 测试模块
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = vec!["multiget", "https://example.com/file.zip"];
        let result = Args::try_parse_from(args);
        assert!(result.is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn test_forwarded_args_use_absolute_paths() {
        let cwd = Path::new("/home/user/work");
        let raw: Vec<String> = [
            "-i",
            "list.txt",
            "--folder=out",
            "-d/tmp/abs",
            "--cookie-file",
            "c.txt",
            "-n",
            "name.zip",
            "https://example.com/a.zip",
            "--",
            "-i",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let forwarded = forwarded_args(&raw, cwd);
        assert_eq!(
            forwarded,
            vec![
                "-i",
                "/home/user/work/list.txt",
                "--folder=/home/user/work/out",
                "-d/tmp/abs",
                "--cookie-file",
                "/home/user/work/c.txt",
                "-n",
                "name.zip",
                "https://example.com/a.zip",
                "--",
                "-i",
            ]
        );
        let submission = Submission::from_batch(&forwarded[3..9]).unwrap();
        assert_eq!(submission.options.folder.as_deref(), Some("/tmp/abs"));
    }

    #[test]
    fn test_uri_file_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uris.txt");
        let content = "# 这是一个注释\nhttps://example.com/file1.zip\n\nmagnet:?xt=urn:btih:abc\n";
        fs::write(&path, content).unwrap();

        let args = Args::try_parse_from(["multiget", "-i", path.to_str().unwrap()]).unwrap();
        let uris = args.get_uris().unwrap();
        assert_eq!(uris, vec!["https://example.com/file1.zip", "magnet:?xt=urn:btih:abc"]);
    }

    #[test]
    fn test_invalid_uri_rejected() {
        let args = Args::try_parse_from(["multiget", "not-a-uri"]).unwrap();
        assert!(args.get_uris().is_err());
    }

    #[test]
    fn test_submission_from_batch() {
        let batch: Vec<String> = ["https://example.com/a.zip", "-n", "b.zip", "--referrer", "https://example.com/", "--proxy", "127.0.0.1:8080", "--category", "软件"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let submission = Submission::from_batch(&batch).unwrap();
        assert_eq!(submission.options.category.as_deref(), Some("软件"));

        let bundles = submission.to_bundles();
        assert_eq!(bundles.len(), 1);
        let common = bundles[0].get::<Common>().unwrap();
        assert_eq!(common.file.as_deref(), Some("b.zip"));
        assert_eq!(bundles[0].get::<Http>().unwrap().referrer.as_deref(), Some("https://example.com/"));
        let proxy = bundles[0].get::<Proxy>().unwrap();
        assert_eq!(proxy.port, 8080);
        assert_eq!(proxy.kind, ProxyType::Http);
    }

    #[test]
    fn test_file_name_ignored_for_many() {
        let batch: Vec<String> = ["http://a.com/1", "http://a.com/2", "-n", "x"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let bundles = Submission::from_batch(&batch).unwrap().to_bundles();
        assert_eq!(bundles.len(), 2);
        assert!(bundles.iter().all(|b| b.get::<Common>().unwrap().file.is_none()));
        assert!(bundles.iter().all(|b| b.get::<Http>().is_none()));
    }

    #[test]
    fn test_paused_submission() {
        let batch: Vec<String> = ["http://a.com/1", "--paused"].iter().map(|s| s.to_string()).collect();
        let bundles = Submission::from_batch(&batch).unwrap().to_bundles();
        assert_eq!(bundles[0].get::<Relation>().unwrap().state(), NodeState::Paused);
    }

    #[test]
    fn test_parse_proxy() {
        assert!(parse_proxy("nohost").is_none());
        assert!(parse_proxy(":80").is_none());
        assert_eq!(parse_proxy("proxy.local:3128").map(|p| p.port), Some(3128));
    }
}
