use colored::Colorize;
use fleetstack_config::EngineSettings;

pub async fn handle(
    settings: &EngineSettings,
    stack: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let snapshot = super::load_snapshot(settings, stack).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!(
        "{} {} ({})",
        "スタック".bold(),
        snapshot.stack.cyan(),
        snapshot.project
    );
    match snapshot.updated_at {
        Some(at) => println!("最終コミット: {}", at.to_rfc3339()),
        None => println!("最終コミット: {}", "なし".dimmed()),
    }
    println!();

    if snapshot.is_empty() {
        println!("{}", "リソースはありません".dimmed());
        return Ok(());
    }

    println!("リソース: {}個", snapshot.len());
    for record in &snapshot.resources {
        let id = record.id.as_deref().unwrap_or("-");
        let mut flags = Vec::new();
        if record.is_provider() {
            flags.push("プロバイダー".blue().to_string());
        }
        if !record.custom {
            flags.push("コンポーネント".dimmed().to_string());
        }
        if record.external {
            flags.push("外部".magenta().to_string());
        }
        if record.protect {
            flags.push("保護".yellow().to_string());
        }
        if record.pending_delete {
            flags.push("削除待ち".red().to_string());
        }

        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", flags.join(", "))
        };
        println!("  - {} ({}){}", record.urn.to_string().cyan(), id, flags);
    }
    Ok(())
}
