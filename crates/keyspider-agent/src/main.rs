//! Agent receiver service binary.

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use keyspider_agent::{router, AppState};
use keyspider_core::config::KeyspiderConfig;
use keyspider_core::types::ServerId;
use keyspider_store::Store;

#[derive(Parser)]
#[command(name = "keyspider-agentd")]
#[command(about = "Ingest service for Keyspider on-host agents")]
struct Cli {
    /// Config file prefix (default: keyspider).
    #[arg(short, long, default_value = "keyspider")]
    config: String,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Register an agent token for a server id, print its hash, and exit.
    #[arg(long, value_name = "SERVER_ID")]
    register: Option<i64>,

    /// Token to register (used with --register).
    #[arg(long, requires = "register")]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let store = Store::open(&config.store.path)?;

    if let Some(server_id) = cli.register {
        let token = cli
            .token
            .ok_or_else(|| anyhow::anyhow!("--token is required with --register"))?;
        let hash = keyspider_agent::auth::hash_token(&token);
        store.register_agent(ServerId(server_id), &hash)?;
        store.set_prefer_agent(ServerId(server_id), true)?;
        println!("{hash}");
        return Ok(());
    }

    let listen = cli.listen.unwrap_or_else(|| config.agent.listen_addr.clone());
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(listen = %listen, "Agent receiver listening");

    let app = router(AppState { store });
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_config(file_prefix: &str) -> anyhow::Result<KeyspiderConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("KEYSPIDER")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    Ok(cfg.try_deserialize().unwrap_or_default())
}
