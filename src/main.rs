use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use clientid_syncer::{
    AppState,
    config::{BackendConfig, SyncerConfig},
    observability,
    resolver::{Resolution, ServiceAccountRef},
    webhook,
};

/// How long in-flight admission requests get to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// CLI arguments for the service account identity syncer
#[derive(Parser, Debug)]
#[command(version, about = "Service account identity syncer", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file. Without one, configuration is read from the
    /// environment (PROVIDER_TYPE, AZURE_TENANT_ID, GCP_PROJECT_ID, ...)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run the admission webhook server (default)
    Serve,
    /// Resolve one service account and print the annotations it would get
    Resolve {
        #[arg(short, long)]
        namespace: String,
        #[arg(long)]
        name: String,
    },
    /// Parse and validate configuration, then print a summary
    CheckConfig,
}

#[tokio::main]
async fn main() {
    // Both the webhook listener and the kube client used for issuer detection
    // need a process-level provider; several are compiled in, so pick one.
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("Error: failed to install TLS crypto provider: {e:?}");
        std::process::exit(1);
    }

    let args = Args::parse();

    let config = load_config(args.config.as_deref());

    match args.command {
        Some(Command::CheckConfig) => run_check_config(&config),
        Some(Command::Resolve { namespace, name }) => {
            init_observability(&config);
            run_resolve(config, ServiceAccountRef::new(namespace, name)).await;
        }
        Some(Command::Serve) | None => {
            init_observability(&config);
            run_server(config).await;
        }
    }
}

fn load_config(path: Option<&str>) -> SyncerConfig {
    let result = match path {
        Some(path) => SyncerConfig::from_file(path),
        None => SyncerConfig::from_env(),
    };
    match result {
        Ok(config) => config,
        Err(e) => {
            match path {
                Some(path) => eprintln!("Error: failed to load config from {path}: {e}"),
                None => eprintln!("Error: failed to load config from environment: {e}"),
            }
            std::process::exit(1);
        }
    }
}

fn init_observability(config: &SyncerConfig) {
    if let Err(e) = observability::init_tracing(&config.observability.logging) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::error!(error = %e, "Failed to initialize metrics");
        std::process::exit(1);
    }
}

async fn build_state(config: SyncerConfig) -> AppState {
    match AppState::build(config).await {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize");
            std::process::exit(1);
        }
    }
}

async fn run_server(config: SyncerConfig) {
    let addr = SocketAddr::new(config.server.host, config.server.port);
    let tls = config.server.tls.clone();

    let state = build_state(config).await;
    let app = webhook::build_router(state);

    match tls {
        Some(tls) => {
            let tls_config = match axum_server::tls_rustls::RustlsConfig::from_pem_file(
                &tls.cert_path,
                &tls.key_path,
            )
            .await
            {
                Ok(tls_config) => tls_config,
                Err(e) => {
                    tracing::error!(
                        cert_path = %tls.cert_path,
                        key_path = %tls.key_path,
                        error = %e,
                        "Failed to load TLS certificate"
                    );
                    std::process::exit(1);
                }
            };

            let handle = axum_server::Handle::new();
            let shutdown_handle = handle.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });

            tracing::info!(address = %addr, "Webhook listening (TLS)");
            if let Err(e) = axum_server::bind_rustls(addr, tls_config)
                .handle(handle)
                .serve(app.into_make_service())
                .await
            {
                tracing::error!(error = %e, "Server error");
                std::process::exit(1);
            }
        }
        None => {
            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(address = %addr, error = %e, "Failed to bind");
                    std::process::exit(1);
                }
            };

            tracing::warn!(address = %addr, "Webhook listening without TLS");
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
            {
                tracing::error!(error = %e, "Server error");
                std::process::exit(1);
            }
        }
    }

    tracing::info!("Server stopped");
}

async fn run_resolve(config: SyncerConfig, account: ServiceAccountRef) {
    let state = build_state(config).await;

    match state.resolver.resolve(&account).await {
        Ok(Resolution::Found(candidate)) => {
            let output = serde_json::json!({
                "account": account.to_string(),
                "backend": state.resolver.backend(),
                "outcome": "found",
                "identity": candidate.identity,
                "scope": candidate.scope.id(),
                "annotations": state.resolver.annotations(&candidate),
            });
            print_json(&output);
        }
        Ok(Resolution::NotFound) => {
            let output = serde_json::json!({
                "account": account.to_string(),
                "backend": state.resolver.backend(),
                "outcome": "not_found",
                "annotations": {},
            });
            print_json(&output);
        }
        Err(e) => {
            eprintln!("Error: failed to resolve {account}: {e}");
            std::process::exit(1);
        }
    }
}

fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("Error: failed to serialize output: {e}");
            std::process::exit(1);
        }
    }
}

fn run_check_config(config: &SyncerConfig) {
    println!("Configuration OK");
    println!(
        "  server:   {}:{} ({})",
        config.server.host,
        config.server.port,
        if config.server.tls.is_some() {
            "tls"
        } else {
            "plain http"
        }
    );
    match &config.backend {
        BackendConfig::Azure(azure) => {
            println!("  backend:  azure (tenant {})", azure.tenant_id);
            if azure.auto_detect_oidc_issuer_url {
                println!("  issuer:   auto-detected from the API server");
            } else if let Some(issuer) = &azure.oidc_issuer_url {
                println!("  issuer:   {issuer}");
            }
            if !azure.filter_tags.is_empty() {
                println!("  filter:   {} tag(s)", azure.filter_tags.len());
            }
            if let Some(cluster) = &azure.cluster_identifier {
                println!("  cluster:  {cluster}");
            }
            println!("  auth:     {}", azure.credentials.kind());
        }
        BackendConfig::Gcp(gcp) => {
            println!("  backend:  gcp (project {})", gcp.project_id);
            if let Some(pool) = &gcp.workload_identity_pool {
                println!("  pool:     {pool}");
            }
            println!("  auth:     {}", gcp.credentials.kind());
        }
    }
    println!(
        "  metrics:  {}",
        if config.observability.metrics.enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining in-flight requests");
}
