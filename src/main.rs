use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use opensearch_operator::config::{
    OperatorConfig, Timings, DEFAULT_API_ADDR, DEFAULT_CERTIFICATE_PATH,
    DEFAULT_DBAAS_CERTIFICATE_PATH,
};
use opensearch_operator::controller::{self, ClusterAccess, KubeStore};
use opensearch_operator::Error;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Namespace with the OpenSearchService resources
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "default")]
    namespace: String,

    /// URL of the OpenSearch cluster, overriding `<name>-internal`
    #[arg(long, env = "OPENSEARCH_HOST")]
    opensearch_host: Option<String>,

    /// Listen address of the site manager and health API
    #[arg(long, env = "API_ADDR", default_value = DEFAULT_API_ADDR)]
    api_addr: SocketAddr,

    /// CA certificate of the OpenSearch endpoint
    #[arg(long, env = "CERTIFICATE_PATH", default_value = DEFAULT_CERTIFICATE_PATH)]
    certificate_path: PathBuf,

    /// CA certificate of the DBaaS adapter and aggregator
    #[arg(long, env = "DBAAS_CERTIFICATE_PATH", default_value = DEFAULT_DBAAS_CERTIFICATE_PATH)]
    dbaas_certificate_path: PathBuf,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Log response bodies of the site manager API
    #[arg(long, env = "DEBUG")]
    debug: bool,
}

impl RunArgs {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            namespace: self.namespace.clone(),
            opensearch_host: self.opensearch_host.clone().filter(|h| !h.is_empty()),
            api_addr: self.api_addr,
            certificate_path: self.certificate_path.clone(),
            dbaas_certificate_path: self.dbaas_certificate_path.clone(),
            debug: self.debug,
            timings: Timings::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("OpenSearch Operator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => run_operator(run_args).await,
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

async fn run_operator(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_json);

    info!(
        "Starting OpenSearch Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Initialize Kubernetes client
    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;

    info!("Connected to Kubernetes cluster");

    let config = Arc::new(args.operator_config());
    let store = Arc::new(KubeStore::new(client.clone()));
    let access = ClusterAccess::new(store, config)?;

    // Create shared controller state
    let state = Arc::new(controller::ControllerState::new(access));

    // Start the REST API server
    #[cfg(feature = "rest-api")]
    {
        let api_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = opensearch_operator::rest_api::run_server(api_state).await {
                tracing::error!("REST API server error: {:?}", e);
            }
        });
    }

    // Run the main controller loop
    controller::run_controller(client, state).await
}
