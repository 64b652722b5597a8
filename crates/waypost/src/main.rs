use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waypost::api::{create_router, AppState};
use waypost::auth::{BuiltinAuth, ExternalAuth, RuntimeAuthenticator, TokenValidator};
use waypost::config::{AuthProvider, Settings};
use waypost::db::Database;
use waypost::store::{NewUser, Role, Store};
use waypost::ws::{reaper, Hub, HubConfig};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Waypost - control plane for agent runtimes.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the control plane server
    Serve(ServeCommand),
    /// Validate the configuration and exit
    CheckConfig,
}

#[derive(Debug, Args)]
struct ServeCommand {
    /// Override the listen address from the config
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    let settings = Settings::load(cli.common.config.as_deref())?;

    match cli.command {
        Command::Serve(cmd) => run_serve(settings, cmd),
        Command::CheckConfig => {
            println!("configuration ok");
            Ok(())
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn run_serve(mut settings: Settings, cmd: ServeCommand) -> Result<()> {
    if let Some(listen) = cmd.listen {
        settings.server.listen_addr = listen;
    }
    let settings = Arc::new(settings);

    let db = Database::open(Path::new(&settings.storage.dsn)).await?;
    let store = Store::new(&db);

    bootstrap_admin(&store, &settings).await?;

    let runtime_auth = Arc::new(RuntimeAuthenticator::new(
        store.clone(),
        settings.runtime_auth.static_tokens.clone(),
        settings.runtime_auth.token_secret.clone(),
        settings.runtime_auth.token_lifetime_secs,
    ));

    let shutdown = CancellationToken::new();
    let hub = Hub::new(
        store.clone(),
        runtime_auth,
        HubConfig::from_settings(&settings),
        shutdown.clone(),
    );

    let (validator, builtin): (Arc<dyn TokenValidator>, Option<Arc<BuiltinAuth>>) =
        match settings.auth.provider {
            AuthProvider::Builtin => {
                let builtin = Arc::new(BuiltinAuth::new(
                    store.clone(),
                    &settings.auth.jwt_secret,
                    settings.auth.jwt_expiry_secs,
                ));
                (builtin.clone() as Arc<dyn TokenValidator>, Some(builtin))
            }
            AuthProvider::External => {
                let url = settings
                    .auth
                    .external_jwks_url
                    .as_deref()
                    .context("external provider requires auth.external_jwks_url")?;
                let external = ExternalAuth::from_jwks_url(
                    url,
                    settings.auth.external_issuer.clone(),
                )
                .await
                .context("loading external key set")?;
                (Arc::new(external) as Arc<dyn TokenValidator>, None)
            }
        };

    let state = AppState::new(
        db,
        store.clone(),
        hub.clone(),
        settings.clone(),
        validator,
        builtin,
    );

    // Background activities.
    reaper::spawn_idle_reaper(hub.clone());
    reaper::spawn_retention(
        store,
        settings.storage.message_retention_days,
        settings.storage.audit_retention_days,
        shutdown.clone(),
    );
    state.login_limiter.clone().spawn_sweeper(shutdown.clone());
    state.user_limiter.clone().spawn_sweeper(shutdown.clone());
    state.device_limiter.clone().spawn_sweeper(shutdown.clone());

    let app = create_router(state);

    let listener = TcpListener::bind(&settings.server.listen_addr)
        .await
        .with_context(|| format!("binding {}", settings.server.listen_addr))?;
    info!(addr = %settings.server.listen_addr, "waypost listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .context("serving")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// First-start convenience: create the configured admin account when the
/// builtin provider is active and the user does not exist yet.
async fn bootstrap_admin(store: &Store, settings: &Settings) -> Result<()> {
    if settings.auth.provider != AuthProvider::Builtin {
        return Ok(());
    }
    let (Some(username), Some(password)) = (
        settings.auth.bootstrap_admin_user.as_deref(),
        settings.auth.bootstrap_admin_password.as_deref(),
    ) else {
        return Ok(());
    };

    if store.get_user_by_username(username).await?.is_some() {
        return Ok(());
    }

    let password_hash = BuiltinAuth::hash_password(password)
        .map_err(|e| anyhow::anyhow!("hashing bootstrap password: {e}"))?;
    match store
        .create_user(NewUser {
            org_id: "default".to_string(),
            external_id: None,
            username: username.to_string(),
            password_hash: Some(password_hash),
            role: Role::Admin,
        })
        .await
    {
        Ok(user) => info!(user_id = %user.id, username, "bootstrap admin created"),
        Err(e) => warn!(error = %e, "bootstrap admin creation failed"),
    }
    Ok(())
}
