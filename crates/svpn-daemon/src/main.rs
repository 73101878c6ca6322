//! SimpleVPN client
//!
//! Connects a redemption code to a tunnel session: takes the code's lease,
//! compiles the connection descriptor, runs the tunnel engine and keeps the
//! lease alive until interrupted.
//!
//! User-facing output uses writeln! to stdout; logs go to stderr.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use svpn_core::config::{Config, load_config};
use svpn_core::identity::{DeviceIdentity, FileIdentityProvider};
use svpn_core::local_state::LocalState;
use svpn_core::time::Timestamp;
use svpn_core::tunnel_config::compile_with;

use svpn_daemon::admin::{self, CodeSpec};
use svpn_daemon::lease::LeaseCoordinator;
use svpn_daemon::session::{SessionController, SessionOptions, SessionState};
use svpn_daemon::storage::{Catalog, SqliteStore};
use svpn_daemon::tunnel::{EngineOptions, SingBoxProcess};

#[derive(Parser, Debug)]
#[command(name = "svpn")]
#[command(version, about = "SimpleVPN - redemption-code tunnel client")]
struct Cli {
    /// Explicit settings file (JSON)
    #[arg(long, global = true, env = "SVPN_CONFIG")]
    config: Option<PathBuf>,

    /// Document store database path
    #[arg(long, global = true, env = "SVPN_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Directory for identity and last-code files
    #[arg(long, global = true, env = "SVPN_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, env = "SVPN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "SVPN_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and stay connected until interrupted
    Connect {
        /// Redemption code (defaults to the last used code)
        code: Option<String>,
        /// Use the shared default connection without a code
        #[arg(long, conflicts_with = "code")]
        no_code: bool,
        /// Path to the tunnel engine binary
        #[arg(long, env = "SVPN_ENGINE_BIN")]
        engine_bin: Option<PathBuf>,
    },
    /// Show the lease state of a code
    Status {
        /// Redemption code (defaults to the last used code)
        code: Option<String>,
    },
    /// Release this device's lease on a code
    Release {
        /// Redemption code (defaults to the last used code)
        code: Option<String>,
    },
    /// Compile a connection descriptor and print the engine configuration
    Compile {
        /// `vless://` descriptor
        descriptor: String,
    },
    /// Print this device's identity
    Identity,
    /// Manage codes and connection descriptors
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },
}

#[derive(Subcommand, Debug)]
enum AdminAction {
    /// Create or update a code
    AddCode {
        code: String,
        /// Create the code deactivated
        #[arg(long)]
        inactive: bool,
        /// Expiry as milliseconds since the Unix epoch
        #[arg(long)]
        expires_at: Option<i64>,
        /// Connection document for this code (e.g. "configs/eu")
        #[arg(long)]
        connection: Option<String>,
    },
    /// Deactivate a code
    Revoke { code: String },
    /// Store a connection descriptor
    SetConnection {
        descriptor: String,
        /// Target document (defaults to the shared default connection)
        #[arg(long)]
        path: Option<String>,
    },
}

struct App {
    config: Config,
    state: LocalState,
    identity_path: PathBuf,
}

impl App {
    fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = load_config(cli.config.as_deref())?;
        if let Some(dir) = &cli.state_dir {
            config.state_dir = Some(dir.clone());
        }
        if let Some(path) = &cli.db_path {
            config.store.database_path = Some(path.clone());
        }
        if let Some(level) = &cli.log_level {
            config.log_level.clone_from(level);
        }
        let dir = config
            .state_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine state directory"))?;
        let state = LocalState::new(dir);
        let identity_path = state.identity_path();
        Ok(Self {
            config,
            state,
            identity_path,
        })
    }

    fn identity(&self) -> anyhow::Result<DeviceIdentity> {
        Ok(DeviceIdentity::load_or_create(&self.identity_path)?)
    }

    async fn store(&self, writer: &str) -> anyhow::Result<SqliteStore> {
        let path = self
            .config
            .database_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine database path"))?;
        info!(path = %path.display(), "Opening document store");
        Ok(SqliteStore::open(&path, writer).await?.with_limits(
            self.config.store.op_timeout(),
            self.config.store.max_transaction_attempts,
        ))
    }

    fn coordinator(&self, store: Arc<SqliteStore>) -> LeaseCoordinator<SqliteStore> {
        LeaseCoordinator::new(
            store,
            Catalog::from_config(&self.config.store),
            self.config.lease.ttl(),
        )
    }

    fn code_or_last(&self, code: Option<String>) -> anyhow::Result<String> {
        code.or_else(|| self.state.load_last_code())
            .ok_or_else(|| anyhow::anyhow!("No code given and no previous code remembered"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let ctx = App::resolve(&cli)?;

    let log_filter = svpn_core::tracing_init::default_filter(&ctx.config.log_level);
    svpn_core::tracing_init::init_tracing(&log_filter, cli.log_json);

    match cli.command {
        Command::Connect {
            code,
            no_code,
            engine_bin,
        } => run_connect(ctx, code, no_code, engine_bin).await,
        Command::Status { code } => run_status(&ctx, code).await,
        Command::Release { code } => run_release(&ctx, code).await,
        Command::Compile { descriptor } => {
            let config = compile_with(&descriptor, &ctx.config.tunnel.compile_options())?;
            writeln!(io::stdout(), "{}", config.to_json_pretty()?)?;
            Ok(())
        }
        Command::Identity => {
            writeln!(io::stdout(), "{}", ctx.identity()?)?;
            Ok(())
        }
        Command::Admin { action } => run_admin(&ctx, action).await,
    }
}

async fn run_connect(
    mut ctx: App,
    code: Option<String>,
    no_code: bool,
    engine_bin: Option<PathBuf>,
) -> anyhow::Result<()> {
    if let Some(bin) = engine_bin {
        ctx.config.tunnel.binary = bin;
    }
    let code = if no_code {
        None
    } else {
        Some(ctx.code_or_last(code)?)
    };

    let identity = ctx.identity()?;
    let store = Arc::new(ctx.store(identity.as_str()).await?);
    let coordinator = Arc::new(ctx.coordinator(store));
    let engine_config = ctx
        .config
        .engine_config_path()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine engine config path"))?;
    let tunnel = Arc::new(SingBoxProcess::new(EngineOptions::from_config(
        &ctx.config.tunnel,
        engine_config,
    )));
    let controller = SessionController::new(
        coordinator,
        tunnel,
        Arc::new(FileIdentityProvider::new(ctx.identity_path.clone())),
        SessionOptions::from_config(&ctx.config),
        Some(ctx.state.clone()),
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        code = code.as_deref().unwrap_or("<none>"),
        holder = %identity,
        "Starting svpn"
    );

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();
    tokio::pin!(sigterm_future);

    let cancel = CancellationToken::new();
    let mut status_rx = controller.subscribe();
    let connect = controller.connect(code.as_deref(), cancel.clone());
    tokio::pin!(connect);

    let early = tokio::select! {
        result = &mut connect => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C during connect");
            None
        }
        _ = &mut sigterm_future => {
            info!("Received SIGTERM during connect");
            None
        }
    };
    let interrupted = early.is_none();
    let result = match early {
        Some(result) => result,
        None => {
            cancel.cancel();
            connect.await
        }
    };
    let session = match result {
        Ok(session) => session,
        Err(e) => {
            writeln!(io::stdout(), "{}", e.status_message())?;
            return Err(anyhow::Error::new(e).context("connect failed"));
        }
    };
    if interrupted {
        // Connected just as the interrupt arrived.
        controller.disconnect().await;
        return Ok(());
    }

    writeln!(
        io::stdout(),
        "Connected (code: {}, lease: {:?})",
        session.code.as_deref().unwrap_or("<none>"),
        session.grant.kind
    )?;

    // Notify systemd once the tunnel is up (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    let lost = loop {
        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break false;
                }
                let status = status_rx.borrow_and_update().clone();
                if status.state == SessionState::Idle {
                    writeln!(io::stdout(), "{}", status.message)?;
                    break true;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
                break false;
            }
            _ = &mut sigterm_future => {
                info!("Received SIGTERM shutdown signal");
                break false;
            }
        }
    };

    if lost {
        anyhow::bail!("session ended: {}", controller.status().message);
    }

    controller.disconnect().await;
    writeln!(io::stdout(), "{}", controller.status().message)?;
    info!("svpn stopped");
    Ok(())
}

async fn run_status(ctx: &App, code: Option<String>) -> anyhow::Result<()> {
    let code = ctx.code_or_last(code)?;
    let identity = ctx.identity()?;
    let store = Arc::new(ctx.store(identity.as_str()).await?);
    let coordinator = ctx.coordinator(store);
    let now = coordinator.now().await?;
    let status = coordinator.status(&code, now).await?;

    let mut out = io::stdout().lock();
    writeln!(out, "Code:     {}", status.code)?;
    writeln!(out, "Active:   {}", status.active)?;
    if let Some(expires_at) = status.expires_at {
        writeln!(out, "Expires:  {}", expires_at.as_millis())?;
    }
    match &status.lease {
        Some(lease) => {
            let mine = lease.holder_id == identity.as_str();
            writeln!(
                out,
                "Holder:   {} ({}){}",
                lease.holder_id,
                lease.platform,
                if mine { " [this device]" } else { "" }
            )?;
            writeln!(out, "Acquired: {}", lease.acquired_at.as_millis())?;
            writeln!(
                out,
                "Renewed:  {} ({}s ago{})",
                lease.renewed_at.as_millis(),
                status.age.unwrap_or_default().as_secs(),
                if status.stale { ", stale" } else { "" }
            )?;
            writeln!(out, "Generation: {}", lease.generation)?;
        }
        None => writeln!(out, "Holder:   <none>")?,
    }
    writeln!(
        out,
        "Local time: {} (store time {})",
        Timestamp::now_local().as_millis(),
        now.as_millis()
    )?;
    Ok(())
}

async fn run_release(ctx: &App, code: Option<String>) -> anyhow::Result<()> {
    let code = ctx.code_or_last(code)?;
    let identity = ctx.identity()?;
    let store = Arc::new(ctx.store(identity.as_str()).await?);
    let coordinator = ctx.coordinator(store);
    coordinator.release(&code, identity.as_str()).await;
    writeln!(io::stdout(), "Released {code} (if held by this device)")?;
    Ok(())
}

async fn run_admin(ctx: &App, action: AdminAction) -> anyhow::Result<()> {
    let identity = ctx.identity()?;
    let store = ctx.store(identity.as_str()).await?;
    let catalog = Catalog::from_config(&ctx.config.store);

    match action {
        AdminAction::AddCode {
            code,
            inactive,
            expires_at,
            connection,
        } => {
            let spec = CodeSpec {
                active: !inactive,
                expires_at: expires_at.map(Timestamp::from_millis),
                connection_path: connection,
            };
            let path = admin::add_code(&store, &catalog, &code, &spec).await?;
            writeln!(io::stdout(), "Saved {path}")?;
        }
        AdminAction::Revoke { code } => {
            admin::revoke_code(&store, &catalog, &code).await?;
            writeln!(io::stdout(), "Revoked {code}")?;
        }
        AdminAction::SetConnection { descriptor, path } => {
            let path = admin::set_connection(&store, &catalog, path.as_deref(), &descriptor).await?;
            writeln!(io::stdout(), "Saved {path}")?;
        }
    }
    Ok(())
}
