use colored::Colorize;
use fleetstack_config::EngineSettings;

pub async fn handle(settings: &EngineSettings, stack: Option<&str>) -> anyhow::Result<()> {
    println!("{}", "スナップショットを検証中...".blue());

    let snapshot = super::load_snapshot(settings, stack).await?;
    match snapshot.verify() {
        Ok(()) => {
            println!(
                "{}",
                format!(
                    "✓ {} のスナップショットは正常です（リソース {}個）",
                    snapshot.stack,
                    snapshot.len()
                )
                .green()
                .bold()
            );
        }
        Err(e) => {
            eprintln!();
            eprintln!("{}", "✗ スナップショットに不整合があります".red().bold());
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
    Ok(())
}
