use chrono::Local; // 用于获取本地时间
use env_logger::{Builder, Env, Target};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::config::LogConfig;

/// 按大小轮转的日志文件
pub struct RotatingFile {
    file: File,
    path: PathBuf,
    max_size: u64, // 最大文件大小 (bytes)，0 表示不轮转
    current_size: u64,
}

impl RotatingFile {
    pub fn open(path: impl AsRef<Path>, max_size: u64) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        // 确保日志目录存在
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let current_size = file.metadata()?.len();
        Ok(Self {
            file,
            path,
            max_size,
            current_size,
        })
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".backup");
        PathBuf::from(name)
    }

    /// 检查并执行日志轮转
    fn check_rotation(&mut self) -> io::Result<()> {
        if self.max_size == 0 || self.current_size < self.max_size {
            return Ok(());
        }
        self.file.flush()?;

        // 只保留一个备份
        let backup_path = self.backup_path();
        if backup_path.exists() {
            std::fs::remove_file(&backup_path)?;
        }
        std::fs::rename(&self.path, &backup_path)?;

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_rotation()?;
        let n = self.file.write(buf)?;
        self.current_size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// 初始化全局日志，`RUST_LOG` 优先于配置中的级别
pub fn init(config: &LogConfig) -> io::Result<()> {
    let mut builder = Builder::from_env(Env::default().default_filter_or(config.level.as_str()));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {} - {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.target(),
            record.args()
        )
    });

    if let Some(file) = &config.file {
        let writer = RotatingFile::open(file, config.max_size_mb.saturating_mul(1024 * 1024))?;
        builder.target(Target::Pipe(Box::new(writer)));
    }

    // 重复初始化（例如测试中）不是错误
    if let Err(e) = builder.try_init() {
        eprintln!("日志初始化失败: {}", e);
    }
    Ok(())
}
