mod commands;

use clap::{Parser, Subcommand};
use fleetstack_config::EngineSettings;

#[derive(Parser)]
#[command(name = "stack")]
#[command(about = "デプロイ状態を確かめる。ロックを外す。スタックの保守は、ここから。", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// コミット済みスナップショットのリソース一覧を表示
    Show {
        /// スタック名（省略時は設定のスタック）
        #[arg(short, long)]
        stack: Option<String>,
        /// スナップショットをJSONのまま出力
        #[arg(long)]
        json: bool,
    },
    /// コミット済みスナップショットの整合性を検証
    Verify {
        /// スタック名（省略時は設定のスタック）
        #[arg(short, long)]
        stack: Option<String>,
    },
    /// 有効なエンジン設定を表示
    Config,
    /// 中断された実行が残したロックを解除
    Unlock {
        /// スタック名（省略時は設定のスタック）
        #[arg(short, long)]
        stack: Option<String>,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // stdout はコマンド出力専用（特に `show --json`）
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if matches!(cli.command, Commands::Version) {
        println!("fleetstack {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let settings = EngineSettings::load()?;
    tracing::debug!(stack = %settings.stack, state_dir = %settings.state_dir.display(), "loaded settings");

    match cli.command {
        Commands::Show { stack, json } => {
            commands::show::handle(&settings, stack.as_deref(), json).await?;
        }
        Commands::Verify { stack } => {
            commands::verify::handle(&settings, stack.as_deref()).await?;
        }
        Commands::Config => {
            commands::config::handle(&settings)?;
        }
        Commands::Unlock { stack } => {
            commands::unlock::handle(&settings, stack.as_deref()).await?;
        }
        Commands::Version => {
            unreachable!("Version は設定読み込み前に処理済み");
        }
    }

    Ok(())
}
