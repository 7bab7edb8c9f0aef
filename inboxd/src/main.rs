use inboxd::config::ConfigStore;
use inboxd::credentials::CredentialStore;
use inboxd::daemon::DaemonRuntime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Logout,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--logout" => mode = CliMode::Logout,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match parse_cli_mode(std::env::args())? {
        CliMode::Logout => {
            let credentials = CredentialStore::new()?;
            credentials.clear()?;
            println!("saved session removed");
            return Ok(());
        }
        CliMode::Help => {
            println!("Usage: inboxd [--logout]");
            println!("  --logout   Remove the saved session and exit");
            return Ok(());
        }
        CliMode::Run => {}
    }

    let config_store = ConfigStore::load_default()?;
    let daemon = DaemonRuntime::bootstrap(config_store).await?;
    daemon.run().await
}
