use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use proxy_pool_rust::config::{Config, ProxyMode};
use proxy_pool_rust::pool::{ConnectionPlan, PoolOrigin, ProxyManager, ProxyStore};
use std::path::Path;

/// Rust 代理池工具
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short = 'f', long, default_value = "config/config.yaml")]
    config: String,

    /// 代理存储文件
    #[arg(long)]
    storage: Option<String>,

    /// 手动代理文件
    #[arg(long)]
    manual: Option<String>,

    /// 代理模式：enterprise, manual_only, direct
    #[arg(long)]
    mode: Option<String>,

    /// 日志级别
    #[arg(long)]
    log_level: Option<String>,

    /// 并发数
    #[arg(long)]
    concurrent: Option<usize>,

    /// 超时时间（毫秒）
    #[arg(long)]
    timeout: Option<u64>,

    /// 不显示进度条
    #[arg(long)]
    no_progress: bool,

    /// 详细输出
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 执行一次完整的代理获取周期
    Acquire,
    /// 输出当前最佳代理
    Best,
    /// 代理存储统计
    Stats,
    /// 列出已存储的可用代理（按优先级）
    List {
        /// 同时列出失败代理
        #[arg(long)]
        failed: bool,
    },
    /// 让过期的失败代理重新参与检测
    Cleanup {
        #[arg(long)]
        hours: Option<i64>,
    },
    /// 记录一次代理失败
    MarkFailed {
        address: String,
        #[arg(long, default_value = "手动标记")]
        reason: String,
    },
    /// 输出本次连接应使用代理还是直连
    Plan,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = if Path::new(&args.config).exists() {
        println!("📁 从配置文件加载设置: {}", args.config);
        Config::load_from_file(&args.config)
            .with_context(|| format!("配置文件加载失败: {}", args.config))?
    } else {
        println!("📝 使用默认配置 (配置文件不存在: {})", args.config);
        Config::default()
    };

    // 覆盖命令行参数
    if let Some(storage) = &args.storage {
        config.storage_file = storage.clone();
    }
    if let Some(manual) = &args.manual {
        config.manual_proxy_file = manual.clone();
    }
    if let Some(mode) = &args.mode {
        config.session.proxy_mode = serde_yaml::from_str::<ProxyMode>(mode)
            .with_context(|| format!("未知的代理模式: {}", mode))?;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(concurrent) = args.concurrent {
        config.validator.max_workers = concurrent;
        config.validator.quick_workers = concurrent;
    }
    if let Some(timeout) = args.timeout {
        config.validator.timeout_ms = timeout;
        config.validator.quick_timeout_ms = timeout;
    }
    if args.no_progress {
        config.print_progress = false;
    }

    config.validate()?;
    Ok(config)
}

fn print_stats(store: &ProxyStore) {
    let stats = store.get_storage_stats();
    println!("\n📊 代理存储统计:");
    println!("{:=<60}", "");
    println!("  存储文件: {}", stats.storage_file.display());
    println!("  可用代理: {}", stats.working_proxies);
    println!("  失败代理: {}", stats.failed_proxies);
    println!("  累计跟踪: {}", stats.total_tracked);
    println!("  平均成功率: {:.1}%", stats.average_success_rate);
    println!("  最后更新: {}", stats.last_updated.format("%Y-%m-%d %H:%M:%S UTC"));
}

fn print_list(store: &ProxyStore, show_failed: bool) {
    let working = store.get_working_proxies();
    println!("\n✅ 可用代理 ({}):", working.len());
    println!("{:-<60}", "");
    for (i, address) in working.iter().enumerate() {
        match store.record(address) {
            Some(record) => println!(
                "{:>3}. {:<28} 成功率 {:>5.1}%  平均 {:>7.0}ms  评分 {}",
                i + 1,
                address,
                record.success_rate() * 100.0,
                record.avg_response_time_ms,
                record.best_score
            ),
            None => println!("{:>3}. {}", i + 1, address),
        }
    }

    if show_failed {
        let failed = store.failed_proxies();
        println!("\n❌ 失败代理 ({}):", failed.len());
        println!("{:-<60}", "");
        for address in failed {
            let reason = store
                .record(&address)
                .and_then(|r| r.recent_failures.last())
                .map(|f| f.reason.as_str())
                .unwrap_or("-");
            println!("  {:<28} {}", address, reason);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let args = Args::parse();
    let config = load_config(&args)?;

    // 设置日志级别
    let level = if args.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    println!("🚀 Rust 代理池工具 v{}", env!("CARGO_PKG_VERSION"));
    println!("{:=<60}", "");

    match &args.command {
        Command::Stats => {
            let store = ProxyStore::open(&config.storage_file, config.pool.clone());
            print_stats(&store);
        }
        Command::List { failed } => {
            let store = ProxyStore::open(&config.storage_file, config.pool.clone());
            print_list(&store, *failed);
        }
        Command::Cleanup { hours } => {
            let mut store = ProxyStore::open(&config.storage_file, config.pool.clone());
            let hours = hours.unwrap_or(config.pool.amnesty_hours);
            let retried = store.cleanup_old_failures(hours)?;
            println!("♻️ {} 个失败超过 {} 小时的代理获得重试机会", retried.len(), hours);
            for address in retried {
                println!("  {}", address);
            }
        }
        Command::MarkFailed { address, reason } => {
            let mut store = ProxyStore::open(&config.storage_file, config.pool.clone());
            if store.mark_proxy_failed(address, reason)? {
                println!("🗑️ 代理 {} 已移入失败列表", address);
            } else {
                println!("📝 已记录代理 {} 的失败", address);
            }
        }
        Command::Acquire => {
            let mut manager = ProxyManager::new(config)?;
            let report = manager.acquire().await;
            let origin = match report.origin {
                PoolOrigin::Stored => "已存储代理",
                PoolOrigin::Fresh => "新获取代理",
                PoolOrigin::Empty => "无",
            };

            println!("\n检测摘要:");
            println!("{:=<60}", "");
            println!("  代理来源: {}", origin);
            println!("  检测数量: {}", report.tested);
            println!("  可用代理: {}", report.working);
            for (i, address) in manager.pool_snapshot().iter().enumerate() {
                println!("    {}. {}", i + 1, address);
            }
            print_stats(manager.store());
        }
        Command::Best => {
            let mut manager = ProxyManager::new(config)?;
            match manager.get_best_proxy().await {
                Some(proxy) => println!("🎯 最佳代理: {}", proxy),
                None => println!("❌ 没有可用代理"),
            }
        }
        Command::Plan => {
            let mut manager = ProxyManager::new(config)?;
            match manager.connection_plan().await? {
                ConnectionPlan::Proxy(proxy) => println!("🎯 使用代理: {}", proxy),
                ConnectionPlan::Direct => println!("🔌 直连"),
            }
        }
    }

    Ok(())
}
