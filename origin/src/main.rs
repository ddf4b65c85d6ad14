//! Origin: a live-media origin server. RTMP/SRT/WebRTC/MPEG-TS in, RTMP/
//! HTTP-FLV/HLS/DASH/WebRTC out.

#![warn(rust_2018_idioms)]

mod caster_conn;
mod config;
mod forward;
mod hooks;
mod http;
mod reload;
mod rtc_conn;
mod rtmp_conn;
mod server;

use clap::Parser;
use shared::context::current_cid;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser)]
#[command(name = "origin")]
#[command(version)]
#[command(about = "Live media origin server")]
struct Cli {
    /// Config file path; defaults apply when absent.
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long, default_value_t = format!("info"))]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();
    let level = log::LevelFilter::from_str(&cli.log_level).unwrap_or(log::LevelFilter::Info);
    env_logger::Builder::new()
        .format(|buf, record| {
            let cid = current_cid().map(|c| c.to_string()).unwrap_or_default();
            writeln!(
                buf,
                "[{}][{}][{}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                cid,
                record.args()
            )
        })
        .filter(None, level)
        .init();

    let config = match &cli.config {
        Some(path) => match config::Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                log::error!("load config failed: {}", e);
                std::process::exit(1);
            }
        },
        None => config::Config::default(),
    };

    let ctx = match server::ServerContext::global_initialize(config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("initialize failed: {}", e);
            std::process::exit(1);
        }
    };

    let rt = match runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("runtime failed: {}", e);
            std::process::exit(1);
        }
    };

    let code = rt.block_on(async move {
        let interrupt = runtime::Interrupt::new();
        let i2 = interrupt.clone();
        runtime::spawn("signal", async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                i2.interrupt();
            }
        });
        match server::run(ctx, cli.config.clone(), interrupt).await {
            Ok(()) => 0,
            Err(e) => {
                log::error!("server failed: {}", e);
                1
            }
        }
    });
    std::process::exit(code);
}
