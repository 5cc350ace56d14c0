pub mod config;
pub mod show;
pub mod unlock;
pub mod verify;

use fleetstack_config::EngineSettings;
use fleetstack_engine::{FileSnapshotStore, Snapshot, SnapshotStore};

/// 設定と `--stack` 指定から決まるストアとスタック名
pub fn open_store<'a>(
    settings: &'a EngineSettings,
    stack: Option<&'a str>,
) -> (FileSnapshotStore, &'a str) {
    (
        FileSnapshotStore::new(&settings.state_dir),
        stack.unwrap_or(&settings.stack),
    )
}

pub async fn load_snapshot(
    settings: &EngineSettings,
    stack: Option<&str>,
) -> anyhow::Result<Snapshot> {
    let (store, stack) = open_store(settings, stack);
    Ok(store.load(stack, &settings.project).await?)
}
