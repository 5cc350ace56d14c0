use colored::Colorize;
use fleetstack_config::EngineSettings;

pub async fn handle(settings: &EngineSettings, stack: Option<&str>) -> anyhow::Result<()> {
    let (store, stack) = super::open_store(settings, stack);

    if let Some(holder) = store.lock_holder(stack).await? {
        println!(
            "{} のロック: {} が {} から保持",
            stack.cyan(),
            holder.holder,
            holder.acquired_at.to_rfc3339()
        );
    }

    if store.force_unlock(stack).await? {
        println!("{}", format!("✓ {stack} のロックを解除しました").green());
    } else {
        println!("{}", format!("{stack} にロックはありません").dimmed());
    }
    Ok(())
}
