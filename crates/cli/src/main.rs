use std::io::Read;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use k8s_openapi::api::apps::v1::Deployment;
use keel_admission::AdmissionReview;
use keel_kubehub::{get_kube_client, KubeStore, ObjectStore, WatchScope};
use keel_operators::{HaConfig, HaScaler, Nginx, NginxReconciler, DEFAULT_HA_ANNOTATION};
use keel_queue::RateLimitConfig;
use keel_runtime::{Controller, ControllerConfig};
use keel_store::ResourceCache;
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel reconciliation controllers")]
struct Cli {
    #[command(flatten)]
    run: RunOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct RunOpts {
    /// Path to a kubeconfig (default: in-cluster, then ~/.kube/config)
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns", global = true, env = "KEEL_NAMESPACE")]
    namespace: Option<String>,

    /// Label selector for the primary watch
    #[arg(long, global = true, env = "KEEL_SELECTOR")]
    selector: Option<String>,

    /// Concurrent reconcile workers
    #[arg(long, global = true, env = "KEEL_WORKERS", default_value_t = 2)]
    workers: usize,

    /// First retry delay
    #[arg(long, global = true, env = "KEEL_BASE_DELAY_MS", default_value_t = 5)]
    base_delay_ms: u64,

    /// Retry delay ceiling
    #[arg(long, global = true, env = "KEEL_MAX_DELAY_SECS", default_value_t = 1000)]
    max_delay_secs: u64,

    /// Permanent failures before a key is dropped (0 = retry forever)
    #[arg(long, global = true, env = "KEEL_MAX_ATTEMPTS", default_value_t = 15)]
    max_attempts: u32,

    /// Bound of the watch event channel
    #[arg(long, global = true, env = "KEEL_QUEUE_CAP", default_value_t = 2048)]
    queue_cap: usize,
}

impl RunOpts {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            scope: WatchScope { namespace: self.namespace.clone(), label_selector: self.selector.clone() },
            workers: self.workers,
            rate_limit: RateLimitConfig {
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_secs(self.max_delay_secs),
                max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
                ..Default::default()
            },
            channel_capacity: self.queue_cap,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Keep annotated Deployments at a minimum replica count
    Scaler {
        /// Marker annotation; Deployments opt in with value "true"
        #[arg(long, env = "KEEL_HA_ANNOTATION", default_value = DEFAULT_HA_ANNOTATION)]
        annotation: String,
        /// Replica count opted-in Deployments are raised to
        #[arg(long, env = "KEEL_MIN_REPLICAS", default_value_t = 2)]
        min_replicas: i32,
    },
    /// Run the Nginx operator (Nginx custom resources → Deployments)
    Webserver,
    /// Print the Nginx CustomResourceDefinition as YAML
    Crd,
    /// Evaluate an AdmissionReview read from a file or stdin
    Admit {
        #[arg(value_enum)]
        hook: Hook,
        /// Review JSON file; "-" reads stdin
        #[arg(long, short = 'f', default_value = "-")]
        file: String,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, clap::ValueEnum)]
enum Hook {
    Validate,
    Mutate,
}

fn init_tracing() {
    let env = std::env::var("KEEL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEEL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KEEL_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancelled on the first SIGINT or SIGTERM.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Ctrl-C received; shutting down"),
            _ = terminate => info!("SIGTERM received; shutting down"),
        }
        trigger.cancel();
    });
    token
}

async fn run_scaler(opts: &RunOpts, annotation: String, min_replicas: i32) -> Result<()> {
    let client = get_kube_client(opts.kubeconfig.as_deref()).await?;
    let cache = Arc::new(ResourceCache::<Deployment>::new());
    let store: Arc<dyn ObjectStore<Deployment>> = Arc::new(KubeStore::new(client.clone()));
    info!(%annotation, min_replicas, ns = ?opts.namespace, "starting HA scaler");
    let scaler = HaScaler::new(Arc::clone(&cache), store, HaConfig { annotation, min_replicas });
    Controller::new(client, opts.controller_config(), cache, Arc::new(scaler))
        .run(shutdown_token())
        .await
}

async fn run_webserver(opts: &RunOpts) -> Result<()> {
    let client = get_kube_client(opts.kubeconfig.as_deref()).await?;
    let cache = Arc::new(ResourceCache::<Nginx>::new());
    let deployments: Arc<dyn ObjectStore<Deployment>> = Arc::new(KubeStore::new(client.clone()));
    let nginxes: Arc<dyn ObjectStore<Nginx>> = Arc::new(KubeStore::new(client.clone()));
    let reconciler = NginxReconciler::new(Arc::clone(&cache), deployments, nginxes);
    info!(ns = ?opts.namespace, "starting Nginx operator");
    Controller::new(client, opts.controller_config(), cache, Arc::new(reconciler))
        .owns::<Deployment>()
        .run(shutdown_token())
        .await
}

fn read_review(file: &str) -> Result<AdmissionReview> {
    let mut raw = String::new();
    if file == "-" {
        std::io::stdin().read_to_string(&mut raw).context("reading review from stdin")?;
    } else {
        raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file))?;
    }
    serde_json::from_str(&raw).context("error getting admission review from request")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Scaler { annotation, min_replicas } => run_scaler(&cli.run, annotation, min_replicas).await?,
        Commands::Webserver => run_webserver(&cli.run).await?,
        Commands::Crd => print!("{}", serde_yaml::to_string(&Nginx::crd())?),
        Commands::Admit { hook, file } => {
            let review = read_review(&file)?;
            let out = match hook {
                Hook::Validate => keel_admission::validate(&review)?,
                Hook::Mutate => keel_admission::mutate(&review)?,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
    }
    Ok(())
}
