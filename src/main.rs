use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use georoute::app::OutboundManager;
use georoute::config::{self, Config};
use georoute::router::rules::InboundContext;
use georoute::router::Router;

#[derive(Parser)]
#[command(name = "georoute", version, about = "geo-resource policy routing core")]
struct Cli {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// 启动路由核心并保持后台刷新，直到 Ctrl-C
    Run,
    /// 立即下载并替换 GeoIP / GeoSite 数据库
    Update,
    /// 查询 IP 的地区代码或域名的路由结果
    Lookup {
        /// IP 地址或域名
        target: String,
        /// 检查域名是否属于该 geosite 分类
        #[arg(long)]
        geosite: Option<String>,
    },
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;
    init_tracing(&config);
    info!(config = %cli.config, "config loaded");

    let outbounds = Arc::new(OutboundManager::new(&config.outbounds)?);
    let cancel = CancellationToken::new();
    let router = Router::new(&config, outbounds, cancel.clone())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            router.start().await?;
            router.post_start().await;
            info!("georoute running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutting down");
            router.close().await;
        }
        Command::Update => {
            router.update_geo_database().await;
            router.close().await;
        }
        Command::Lookup { target, geosite } => {
            router.start().await?;
            match target.parse::<IpAddr>() {
                Ok(ip) => {
                    if router.geoip_reader().is_none() {
                        router.geoip_store().prepare().await?;
                    }
                    let region = router
                        .geoip_reader()
                        .and_then(|db| db.reader.lookup(ip))
                        .unwrap_or_else(|| "unknown".to_string());
                    println!("{} region={}", ip, region);
                    let ctx = InboundContext::for_ip(ip, 443);
                    println!("{} outbound={}", ip, router.route(&ctx));
                }
                Err(_) => {
                    let ctx = InboundContext::for_domain(&target, 443);
                    if let Some(code) = geosite {
                        if router.geosite_reader().is_none() {
                            router.geosite_catalog().store().prepare().await?;
                        }
                        let rule = router.load_geosite(&code)?;
                        println!("{} geosite:{}={}", target, code, rule.matches(&ctx));
                    }
                    println!("{} outbound={}", target, router.route(&ctx));
                }
            }
            router.close().await;
        }
    }
    Ok(())
}
