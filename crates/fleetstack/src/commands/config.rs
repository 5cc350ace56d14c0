use colored::Colorize;
use fleetstack_config::EngineSettings;

pub fn handle(settings: &EngineSettings) -> anyhow::Result<()> {
    match fleetstack_config::find_config_file() {
        Ok(path) => println!("{} {}", "設定ファイル:".bold(), path.display()),
        Err(_) => println!("{} {}", "設定ファイル:".bold(), "(デフォルト)".dimmed()),
    }
    println!();
    print!("{}", serde_yaml::to_string(settings)?);
    Ok(())
}
