//! CLI entry point for the Keyspider scanner.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use keyspider_core::config::KeyspiderConfig;
use keyspider_core::types::{ScanJobType, ServerId, SshKeyId};
use keyspider_graph::{GraphBuilder, GraphLayer};
use keyspider_ssh::russh_transport::RusshDialer;
use keyspider_ssh::ConnectionPool;
use keyspider_store::Store;

use keyspider_scan::spider::SpiderEngine;
use keyspider_scan::unreachable::{TcpProbe, UnreachableDetector};
use keyspider_scan::watcher::{SpiderSeed, Watcher};

#[derive(Parser)]
#[command(name = "keyspider")]
#[command(about = "SSH trust graph discovery and monitoring")]
struct Cli {
    /// Config file prefix (default: keyspider).
    #[arg(short, long, default_value = "keyspider")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Crawl the trust graph from a seed server.
    Spider {
        /// Seed hostname or IP.
        seed: String,

        #[arg(long, default_value_t = 22)]
        port: u16,

        /// BFS depth (defaults to spider.default_depth).
        #[arg(long)]
        depth: Option<u32>,
    },

    /// Scan a single server without following sources.
    Scan {
        host: String,

        #[arg(long, default_value_t = 22)]
        port: u16,
    },

    /// Tail a server's auth log live, printing events as JSON lines.
    Watch {
        host: String,

        #[arg(long, default_value_t = 22)]
        port: u16,

        /// Crawl newly seen source IPs automatically.
        #[arg(long)]
        auto_spider: bool,

        #[arg(long, default_value_t = 3)]
        spider_depth: u32,
    },

    /// Print a report as JSON.
    Report {
        /// dormant | mystery | stale | exposure | unreachable
        kind: String,
    },

    /// Print the access graph as JSON.
    Graph {
        /// all | authorization | usage
        #[arg(long, default_value = "all")]
        layer: String,

        /// Subgraph centred on a server id.
        #[arg(long)]
        server: Option<i64>,

        #[arg(long, default_value_t = 2)]
        depth: u32,

        /// Subgraph for a key id.
        #[arg(long)]
        key: Option<i64>,

        /// Shortest path: source server id (requires --to).
        #[arg(long)]
        from: Option<i64>,

        #[arg(long)]
        to: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let store = Store::open(&config.store.path)?;

    match cli.command {
        Command::Spider { seed, port, depth } => {
            let (pool, detector) = build_transport(&config);
            let seed_server = store.find_server_by_ip(&seed)?.map(|s| s.id);
            let job = store.create_scan_job(ScanJobType::Spider, "cli", seed_server, depth.unwrap_or(config.spider.default_depth))?;

            let mut engine = SpiderEngine::new(pool, store, detector, &config)
                .with_job(job.id)
                .with_progress(Arc::new(|progress| {
                    tracing::info!(
                        scanned = progress.servers_scanned,
                        failed = progress.servers_failed,
                        queued = progress.queue_depth,
                        events = progress.events_parsed,
                        keys = progress.keys_found,
                        unreachable = progress.unreachable_found,
                        current = %progress.current_server,
                        "Crawl progress"
                    );
                }));
            if let Some(depth) = depth {
                engine = engine.with_max_depth(depth);
            }

            let cancel = engine.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupt received, cancelling at server boundary");
                    cancel.store(true, std::sync::atomic::Ordering::SeqCst);
                }
            });

            let progress = engine.crawl(&seed, port).await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }

        Command::Scan { host, port } => {
            let (pool, detector) = build_transport(&config);
            let progress = keyspider_scan::spider::scan_single_server(
                pool, store, detector, &config, &host, port,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }

        Command::Watch {
            host,
            port,
            auto_spider,
            spider_depth,
        } => {
            let dialer = Arc::new(RusshDialer::new(config.ssh.clone()));
            let server = store.upsert_server(
                &host,
                &host,
                port,
                keyspider_core::types::OsType::Unknown,
                Some("manual"),
            )?;

            let mut watcher = Watcher::new(
                dialer.clone(),
                store.clone(),
                server,
                config.watcher.clone(),
                config.log.clone(),
            );

            let mut seed_rx = None;
            if auto_spider {
                let (tx, rx) = tokio::sync::mpsc::channel::<SpiderSeed>(64);
                watcher = watcher.with_auto_spider(tx, spider_depth);
                seed_rx = Some(rx);
            }

            let handle = watcher.handle();
            let mut stream = watcher.subscribe();

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.stop();
                }
            });

            if let Some(mut rx) = seed_rx.take() {
                let config = config.clone();
                let store = store.clone();
                tokio::spawn(async move {
                    while let Some(seed) = rx.recv().await {
                        tracing::info!(source = %seed.source_ip, "Auto-spider seed");
                        let (pool, detector) = build_transport(&config);
                        let engine = SpiderEngine::new(pool, store.clone(), detector, &config)
                            .with_max_depth(spider_depth.saturating_sub(seed.depth));
                        if let Err(e) = engine.crawl(&seed.source_ip, 22).await {
                            tracing::error!(source = %seed.source_ip, error = %e, "Auto-spider crawl failed");
                        }
                    }
                });
            }

            let run = tokio::spawn(watcher.run());
            while let Some(observation) = stream.recv().await {
                println!("{}", serde_json::to_string(&observation)?);
            }
            run.await??;
        }

        Command::Report { kind } => {
            let json = match kind.as_str() {
                "dormant" => serde_json::to_string_pretty(&store.dormant_keys()?)?,
                "mystery" => serde_json::to_string_pretty(&store.mystery_keys()?)?,
                "stale" => {
                    let cutoff =
                        chrono::Utc::now() - chrono::Duration::days(config.report.stale_after_days);
                    serde_json::to_string_pretty(&store.stale_keys(cutoff)?)?
                }
                "exposure" => serde_json::to_string_pretty(&store.key_exposure()?)?,
                "unreachable" => serde_json::to_string_pretty(&store.list_unreachable(true)?)?,
                other => anyhow::bail!(
                    "Unknown report: {other}. Choose: dormant, mystery, stale, exposure, unreachable"
                ),
            };
            println!("{json}");
        }

        Command::Graph {
            layer,
            server,
            depth,
            key,
            from,
            to,
        } => {
            let builder = GraphBuilder::new(store);
            let json = if let Some(server_id) = server {
                serde_json::to_string_pretty(&builder.server_subgraph(ServerId(server_id), depth)?)?
            } else if let Some(key_id) = key {
                serde_json::to_string_pretty(&builder.key_subgraph(SshKeyId(key_id))?)?
            } else if let (Some(from), Some(to)) = (from, to) {
                serde_json::to_string_pretty(&builder.find_path(ServerId(from), ServerId(to))?)?
            } else {
                let layer = GraphLayer::parse(&layer)
                    .ok_or_else(|| anyhow::anyhow!("Invalid layer: {layer}"))?;
                serde_json::to_string_pretty(&builder.build_graph(layer)?)?
            };
            println!("{json}");
        }
    }

    Ok(())
}

fn build_transport(config: &KeyspiderConfig) -> (ConnectionPool, Arc<UnreachableDetector>) {
    let dialer = Arc::new(RusshDialer::new(config.ssh.clone()));
    let pool = ConnectionPool::new(dialer, config.ssh.clone());
    let probe = Arc::new(TcpProbe::new(config.ssh.connect_timeout()));
    let detector = Arc::new(UnreachableDetector::new(
        probe,
        config.unreachable.cache_ttl(),
    ));
    (pool, detector)
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
