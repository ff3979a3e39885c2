//! Trellis Operator - watch resource kinds and run graph queries on events

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use trellis_core::rules::RuleRegistry;
use trellis_engine::QueryExecutor;
use trellis_kube::{ApiProvider, Provider};
use trellis_operator::controller::{self, Context};
use trellis_operator::handler::EventHandlers;
use trellis_operator::watcher::WatcherRegistry;

#[derive(clap::ValueEnum, Clone, Debug)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "trellis-operator", version, about = "Dynamic operator runtime for Trellis")]
struct Args {
    /// Filter directive for `tracing_subscriber::EnvFilter`.
    /// Example: "info,kube=warn,trellis_engine=debug"
    #[arg(long, default_value = "info", env = "TRELLIS_LOG_FILTER")]
    log_filter: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "TRELLIS_LOG_FORMAT")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::new(&args.log_filter);
    match args.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    // In-cluster configuration first, KUBECONFIG otherwise.
    let client = Client::try_default().await?;
    let provider: Arc<dyn Provider> = Arc::new(ApiProvider::new(client.clone()));

    let executor = match QueryExecutor::with_discovered_rules(Arc::clone(&provider)).await {
        Ok(executor) => executor,
        Err(error) => {
            warn!(%error, "schema inspection failed, continuing with the static rule table");
            QueryExecutor::new(
                Arc::clone(&provider),
                Arc::new(RuleRegistry::with_static_rules()),
            )
        }
    };

    let handlers =
        EventHandlers::new(provider, Arc::new(executor)).with_client(client.clone());
    let ctx = Context {
        client,
        handlers: Arc::new(handlers),
        watchers: Arc::new(WatcherRegistry::new()),
    };
    controller::run(ctx).await;
    Ok(())
}
