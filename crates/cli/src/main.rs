use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use kache_core::{Key, Partition};
use kache_kubehub::{Kubehub, KubehubConfig};
use kache_watch::Watch;
use kube::core::DynamicObject;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "kachectl", version, about = "Kache CLI: reads through the watch cache")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List objects for a given group/version/kind key
    Ls {
        /// GVK key, e.g. "v1/ConfigMap" or "cert-manager.io/v1/Certificate"
        gvk: String,
        /// Read this many more times after the first, from the live cache
        #[arg(long = "repeat", default_value_t = 0)]
        repeat: u32,
        /// Pause between repeated reads
        #[arg(long = "interval-ms", default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Get a single object by name
    Get {
        /// GVK key, e.g. "apps/v1/Deployment"
        gvk: String,
        name: String,
    },
    /// Establish watches for the given kinds and print the watched set
    Watched {
        /// One or more GVK keys
        #[arg(required = true)]
        gvks: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KACHE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

/// Serve Prometheus metrics on `KACHE_METRICS_ADDR` when it is set.
fn init_metrics() {
    let Ok(addr) = std::env::var("KACHE_METRICS_ADDR") else {
        return;
    };
    let Ok(sock) = addr.parse::<std::net::SocketAddr>() else {
        warn!(addr = %addr, "KACHE_METRICS_ADDR is not host:port; metrics disabled");
        return;
    };
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        warn!(error = %e, "metrics exporter not installed");
        return;
    }
    info!(addr = %sock, "serving metrics");
}

async fn build_watch(cancel: CancellationToken) -> Result<Watch> {
    let hub = Kubehub::connect(KubehubConfig::from_env()).await?;
    Watch::builder()
        .resolver(hub.resolver)
        .factory(hub.factory)
        .backend(hub.backend)
        .cancel(cancel)
        .build()
}

fn list_key(p: &Partition, ns: Option<&str>) -> Key {
    Key::list(ns.unwrap_or(""), p.api_version(), p.kind.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; cancelling watches");
                cancel.cancel();
            }
        }
    });
    let watch = Arc::new(build_watch(cancel.clone()).await?);
    let ns = cli.namespace.as_deref();

    match cli.command {
        Commands::Ls { gvk, repeat, interval_ms } => {
            let p = Partition::from_str(&gvk)?;
            let key = list_key(&p, ns);
            info!(key = %key, repeat, "ls invoked");
            for round in 0..=repeat {
                if round > 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
                let source = if watch.is_watched(&key) { "cache" } else { "backend" };
                match watch.list(&key).await {
                    Ok(items) => {
                        info!(round, source, count = items.len(), "ls ok");
                        print_objects(cli.output, sorted(items))?;
                    }
                    Err(e) => {
                        error!(error = %e, "ls failed");
                        return Err(e.into());
                    }
                }
            }
        }
        Commands::Get { gvk, name } => {
            let p = Partition::from_str(&gvk)?;
            let key = Key::get(ns.unwrap_or(""), p.api_version(), p.kind.clone(), name);
            info!(key = %key, "get invoked");
            match watch.get(&key).await {
                Ok(obj) => print_objects(cli.output, vec![obj])?,
                Err(e) if e.is_not_found() => {
                    eprintln!("not found: {}", key);
                    std::process::exit(2);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Watched { gvks } => {
            for gvk in gvks {
                let p = Partition::from_str(&gvk)?;
                if let Err(e) = watch.list(&list_key(&p, ns)).await {
                    error!(gvk = %gvk, error = %e, "could not establish watch");
                }
            }
            let watched: Vec<String> = watch.watched().iter().map(|p| p.to_string()).collect();
            match cli.output {
                Output::Human => {
                    for p in &watched {
                        println!("{}", p);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&watched)?),
            }
        }
    }

    cancel.cancel();
    Ok(())
}

fn sorted(mut items: Vec<DynamicObject>) -> Vec<DynamicObject> {
    items.sort_by(|a, b| {
        a.metadata.namespace.cmp(&b.metadata.namespace).then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
    items
}

fn print_objects(output: Output, items: Vec<DynamicObject>) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<20} {:<40} {:<8} UID", "NAMESPACE", "NAME", "AGE");
            for o in &items {
                let ns_col = o.metadata.namespace.as_deref().unwrap_or("-");
                let name = o.metadata.name.as_deref().unwrap_or("");
                let age = age_of(o, SystemTime::now());
                let uid = o.metadata.uid.as_deref().unwrap_or("-");
                println!("{:<20} {:<40} {:<8} {}", ns_col, name, age, uid);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
    }
    Ok(())
}

const AGE_UNITS: [(u64, &str); 4] = [(86_400, "d"), (3_600, "h"), (60, "m"), (1, "s")];

/// Two most significant units for days and hours (`2d1h`, `3h5m`), one below.
fn format_age(secs: u64) -> String {
    let Some(i) = AGE_UNITS.iter().position(|(n, _)| secs >= *n) else {
        return "0s".to_string();
    };
    let (n, unit) = AGE_UNITS[i];
    let mut out = format!("{}{}", secs / n, unit);
    if i < 2 {
        let (m, next) = AGE_UNITS[i + 1];
        out.push_str(&format!("{}{}", secs % n / m, next));
    }
    out
}

fn age_of(obj: &DynamicObject, now: SystemTime) -> String {
    let Some(created) = obj.metadata.creation_timestamp.as_ref() else {
        return "-".to_string();
    };
    let created = UNIX_EPOCH + Duration::from_secs(created.0.timestamp().max(0) as u64);
    format_age(now.duration_since(created).unwrap_or_default().as_secs())
}
