use avlink::config::Config;
use avlink::enhancer::{CommandEnhancer, enhance_latest};
use avlink::fuzzy::FuzzyModeController;
use avlink::receiver::Receiver;
use avlink::sender::Sender;
use avlink::shutdown::{self, Shutdown};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::signal;

#[derive(Parser)]
#[command(name = "avlink", version, about = "Adaptive audio/video link over a measured channel")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 发送端：测量信道、提供决策服务和时间戳回显
    Sender {
        /// Address the decision and timestamp services bind to
        #[arg(long)]
        bind_ip: Option<String>,
        /// Run the control plane only, without ffmpeg streams
        #[arg(long)]
        no_media: bool,
    },
    /// 接收端：轮询决策、采集遥测、录制
    Receiver {
        #[arg(long)]
        sender_ip: String,
        /// Where recordings are written
        #[arg(long)]
        recording_dir: Option<String>,
        #[arg(long)]
        no_media: bool,
    },
    /// Print the decision for one channel measurement
    Evaluate {
        #[arg(allow_hyphen_values = true)]
        s11_db: f64,
    },
    /// Enhance the newest recording
    Enhance {
        #[arg(long)]
        recording_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    // 加载配置
    let mut config = Config::new().unwrap_or_default();

    match cli.command {
        Command::Evaluate { s11_db } => {
            let decision = FuzzyModeController::new().evaluate(s11_db);
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
        Command::Enhance { recording_dir } => {
            let dir = recording_dir.unwrap_or_else(|| config.recording_path());
            let enhancer = CommandEnhancer::from_config(&config);
            let output = enhance_latest(&dir, &enhancer).await?;
            println!("{}", output.display());
            Ok(())
        }
        Command::Sender { bind_ip, no_media } => {
            if let Some(ip) = bind_ip {
                config.bind_ip = ip;
            }
            Sender::new(config, !no_media).run(shutdown_on_ctrl_c()).await
        }
        Command::Receiver { sender_ip, recording_dir, no_media } => {
            config.sender_ip = sender_ip;
            if let Some(dir) = recording_dir {
                config.recording_dir = dir;
            }
            Receiver::new(config, !no_media).run(shutdown_on_ctrl_c()).await
        }
    }
}

fn shutdown_on_ctrl_c() -> Shutdown {
    let (trigger, stop) = shutdown::channel();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => log::info!("Received Ctrl+C, shutting down..."),
            Err(e) => log::error!("Failed to listen for Ctrl+C: {}", e),
        }
        trigger.trigger();
    });
    stop
}
