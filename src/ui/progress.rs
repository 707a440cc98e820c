use indicatif::{ProgressBar, ProgressStyle};

use crate::core::actor_manager::EngineStats;

// 结构体：ProgressManager
// 所有任务合计的一条进度
pub struct ProgressManager {
    bar: ProgressBar,
}

impl ProgressManager {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::with_template("{spinner} [{bar:40}] {bytes}/{total_bytes} {msg}") {
            bar.set_style(style.progress_chars("=> "));
        }
        ProgressManager { bar }
    }

    /// 安静模式
    pub fn hidden() -> Self {
        ProgressManager {
            bar: ProgressBar::hidden(),
        }
    }

    // 方法：更新合计进度
    pub fn update(&self, stats: &EngineStats) {
        let downloaded = stats.completed_bytes;
        let total = stats.total_bytes;
        if total > 0 {
            self.bar.set_length(total);
        }
        self.bar.set_position(downloaded);

        let speed = stats.speed[0];
        let limit = if stats.limit[0] == 0 {
            String::new()
        } else {
            format!(" (限速 {})", format_speed(stats.limit[0]))
        };
        let counts = &stats.counts;
        let status = format!(
            "{}{} | ETA:{} | 下载 {} 排队 {} 完成 {}",
            format_speed(speed),
            limit,
            format_eta(downloaded, total, speed),
            counts.active,
            counts.queuing,
            counts.finished,
        );
        self.bar.set_message(status);
        self.bar.tick();
    }

    pub fn println(&self, message: &str) {
        self.bar.println(message);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_speed(speed: u64) -> String {
    if speed > 1024 * 1024 {
        format!("{:.2} MB/s", speed as f64 / (1024.0 * 1024.0))
    } else if speed > 1024 {
        format!("{:.2} KB/s", speed as f64 / 1024.0)
    } else {
        format!("{} B/s", speed)
    }
}

// 计算剩余时间
pub fn format_eta(downloaded: u64, total: u64, speed: u64) -> String {
    if speed > 0 && total > downloaded {
        let seconds = (total - downloaded) / speed;
        if seconds > 3600 {
            format!("{}h{}m", seconds / 3600, (seconds % 3600) / 60)
        } else if seconds > 60 {
            format!("{}m{}s", seconds / 60, seconds % 60)
        } else {
            format!("{}s", seconds)
        }
    } else {
        "未知".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(512), "512 B/s");
        assert_eq!(format_speed(2048), "2.00 KB/s");
        assert_eq!(format_speed(3 * 1024 * 1024), "3.00 MB/s");
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(0, 100, 10), "10s");
        assert_eq!(format_eta(0, 7200 + 120, 1), "2h2m");
        assert_eq!(format_eta(100, 100, 10), "未知");
        assert_eq!(format_eta(0, 100, 0), "未知");
    }

    #[test]
    fn test_hidden_update() {
        let progress = ProgressManager::hidden();
        let stats = EngineStats {
            completed_bytes: 50,
            total_bytes: 100,
            ..EngineStats::default()
        };
        progress.update(&stats);
        progress.finish();
    }
}
