use actix::prelude::*;
use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    cursor, execute, terminal,
    event::{self, Event, KeyCode, KeyModifiers},
};
use std::sync::Arc;
use std::time::{Duration, Instant};

use multiget::cli::{self, Submission};
use multiget::config::Config;
use multiget::core::actor_manager::*;
use multiget::ipc::{self, IpcServer};
use multiget::plugin::{EmptyFactory, EventKind, PluginRuntime};
use multiget::ui::{print_error, print_info, print_success, DownloadSummary, ProgressManager};
use multiget::utils::{logger, validator};

const PROGRESS_UPDATE_INTERVAL: Duration = Duration::from_millis(100);
const KEYBOARD_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[actix::main]
async fn main() -> Result<()> {
    let raw: Vec<String> = std::env::args().skip(1).collect();

    // 帮助和版本只在本地回答，不转交给运行中的实例
    if ipc::find_help(&raw) || ipc::find_version(&raw) {
        let _ = cli::Args::parse();
        return Ok(());
    }

    let args = cli::Args::parse();
    if args.edit_config {
        Config::load(&args.config)?;
        cli::open_config_in_editor(&args.config);
        return Ok(());
    }

    let mut config = Config::load(&args.config).with_context(|| format!("无法加载配置文件: {}", args.config))?;
    config.merge_from_args(&args);
    validator::validate_config(&config)?;
    logger::init(&config.log)?;
    log::info!(
        "multiget {} 启动 (构建于 {}, 提交 {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("VERGEN_BUILD_TIMESTAMP").unwrap_or("未知"),
        option_env!("VERGEN_GIT_SHA").unwrap_or("未知"),
    );
    log::info!("配置文件路径: {}", args.config);
    log::info!("{}", config.get_summary());

    // 已有实例在运行：转交参数后退出
    let forwarded = match std::env::current_dir() {
        Ok(cwd) => cli::forwarded_args(&raw, &cwd),
        Err(_) => raw.clone(),
    };
    if ipc::client_send(config.ipc_port, &forwarded).await {
        print_success("任务已交给运行中的 multiget");
        return Ok(());
    }

    let submission = Submission::from_args(&args)?;
    if submission.is_empty() {
        print_error("没有可下载的任务");
        return Ok(());
    }

    let mut server = IpcServer::new(config.ipc_port);
    if let Err(e) = server.server_start() {
        log::warn!("端口 {} 不可用，本次不接收其它进程的任务: {}", config.ipc_port, e);
    }

    let runtime = PluginRuntime::new();
    runtime.register(Arc::new(EmptyFactory::new()))?;
    let mut tree = build_tree(&config, runtime)?;
    if config.default_backend.is_none() {
        tree.set_default_backend("empty")?;
    }

    if !args.quiet {
        println!("{}", config.get_summary());
    }

    let engine = EngineActor::with_ipc(tree, server, config.tick_interval()).start();
    let added = engine.send(SubmitBatch(submission)).await?;
    log::info!("开始下载 {} 个任务", added.len());

    let started = Instant::now();
    if args.quiet {
        run_quiet(&engine, config.tick_interval()).await?;
    } else {
        println!("\n开始下载... (按 'p' 暂停, 'r' 继续, 'q' 退出)");
        run_download_loop(&engine, config.tick_interval()).await?;
    }

    let final_stats = engine.send(GetStats).await?;
    engine.send(Shutdown).await?;
    println!("{}", DownloadSummary::from_stats(&final_stats, started.elapsed()));
    log::info!("下载结束 - 成功: {}, 失败: {}", final_stats.completed, final_stats.failed);

    Ok(())
}

/// 第一个调度周期之前 busy 还没有计算
fn finished(stats: &EngineStats, elapsed: Duration, tick: Duration) -> bool {
    elapsed > tick * 2 && !stats.busy
}

async fn run_quiet(engine: &Addr<EngineActor>, tick: Duration) -> Result<()> {
    let started = Instant::now();
    loop {
        tokio::time::sleep(tick).await;
        let stats = engine.send(GetStats).await?;
        for (id, event) in engine.send(TakeEvents).await? {
            if event.kind == EventKind::Error {
                log::error!("任务 {} 出错: {}", id, event.message);
            }
        }
        if finished(&stats, started.elapsed(), tick) {
            return Ok(());
        }
    }
}

/// 运行下载主循环
async fn run_download_loop(engine: &Addr<EngineActor>, tick: Duration) -> Result<()> {
    let started = Instant::now();
    let mut last_update = Instant::now();

    // 设置终端
    terminal::enable_raw_mode()?;
    execute!(std::io::stdout(), cursor::Hide)?;

    let progress = ProgressManager::new();
    let result = async {
        loop {
            // 处理键盘输入
            if let Ok(true) = event::poll(KEYBOARD_POLL_INTERVAL) {
                if let Ok(Event::Key(key_event)) = event::read() {
                    match key_event.code {
                        KeyCode::Char('q') | KeyCode::Char('Q') => {
                            progress.println("用户退出");
                            log::info!("用户主动退出");
                            break;
                        }
                        KeyCode::Char('c') if key_event.modifiers.contains(KeyModifiers::CONTROL) => {
                            log::info!("用户中断");
                            break;
                        }
                        KeyCode::Char('p') | KeyCode::Char('P') => {
                            engine.send(PauseAll).await?;
                            progress.println("已暂停所有下载任务");
                            log::info!("用户暂停所有下载任务");
                        }
                        KeyCode::Char('r') | KeyCode::Char('R') => {
                            engine.send(ResumeAll).await?;
                            progress.println("已恢复所有下载任务");
                            log::info!("用户恢复所有下载任务");
                        }
                        _ => {}
                    }
                }
            }

            // 更新进度
            if last_update.elapsed() >= PROGRESS_UPDATE_INTERVAL {
                let stats = engine.send(GetStats).await?;
                progress.update(&stats);
                for (id, event) in engine.send(TakeEvents).await? {
                    match event.kind {
                        EventKind::Error => {
                            progress.println(&format!("✗ {}", event.message));
                            log::error!("任务 {} 出错: {}", id, event.message);
                        }
                        EventKind::Completed => progress.println(&format!("✓ {}", event.message)),
                        _ => log::debug!("任务 {} 事件: {:?}", id, event),
                    }
                }

                // 检查是否所有任务都结束
                if finished(&stats, started.elapsed(), tick) {
                    break;
                }
                last_update = Instant::now();
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    // 恢复终端
    execute!(std::io::stdout(), cursor::Show)?;
    terminal::disable_raw_mode()?;
    progress.finish();
    if result.is_ok() {
        print_info("调度已结束");
    }
    result
}
