use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use osrouter::install::{install_system_daemon, uninstall_system_daemon, InstallPaths, PidFile};
use osrouter::session::Session;
use shared_utils::config::{Config, ConfigError, ConfigManager};
use shared_utils::logging::init_logging_from_config;
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[clap(
        short,
        long,
        value_name = "FILE",
        default_value = "/etc/osrouter/config.toml"
    )]
    config: PathBuf,

    /// Log level (trace|debug|info|warn|error), overrides the config file
    #[clap(short, long)]
    log_level: Option<String>,

    /// Print the commands that would run instead of running them
    #[clap(long)]
    dry_run: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the interface up, apply sysctls and wait until it reports up
    Up,
    /// Converge the interface to a desired-state file
    Apply {
        /// Desired addresses and routes (TOML); defaults to router.desired_path
        #[clap(long, value_name = "FILE")]
        desired: Option<PathBuf>,
    },
    /// Remove every managed address and route, then bring the interface down
    Down,
    /// Tear down whatever a previous run recorded, e.g. after a crash
    Cleanup,
    /// Show the recorded state and whether the interface reports up
    Status,
    /// Stay in the foreground: apply on start and on SIGHUP, tear down on SIGTERM
    Run {
        #[clap(long, value_name = "FILE")]
        desired: Option<PathBuf>,

        /// Write the daemon's pid here while it runs
        #[clap(long, value_name = "FILE")]
        pidfile: Option<PathBuf>,
    },
    /// Install, enable and start the rc.d service
    Install {
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Stop, disable and remove the rc.d service
    Uninstall {
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn load_config(path: &Path) -> Result<(ConfigManager, Option<ConfigError>)> {
    match ConfigManager::load(path) {
        Ok(manager) => Ok((manager, None)),
        Err(err @ ConfigError::FileNotFound(_)) => Ok((
            ConfigManager::with_config(Config::default(), path),
            Some(err),
        )),
        Err(err) => Err(err).with_context(|| format!("loading {}", path.display())),
    }
}

fn desired_path(flag: &Option<PathBuf>, config: &Config) -> Option<PathBuf> {
    flag.clone().or_else(|| config.router.desired_path.clone())
}

async fn run_daemon(
    session: &Session,
    mut manager: ConfigManager,
    desired_flag: Option<PathBuf>,
) -> Result<()> {
    let mut router = session.router(&manager.config().router).await;
    router.up().await.context("bringing interface up")?;

    match desired_path(&desired_flag, manager.config()) {
        Some(path) => {
            if let Err(err) = session.apply_file(&mut router, &path).await {
                error!("initial apply failed: {err}");
            }
        }
        None => info!("no desired state file configured; waiting for SIGHUP"),
    }
    print_dry_run(session);

    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading");
                if let Err(err) = manager.reload() {
                    warn!("keeping previous configuration: {err}");
                } else if manager.config().router.interface != router.iface() {
                    warn!(
                        iface = %router.iface(),
                        "changing the interface requires a restart"
                    );
                }
                match desired_path(&desired_flag, manager.config()) {
                    Some(path) => {
                        if let Err(err) = session.apply_file(&mut router, &path).await {
                            error!("apply failed: {err}");
                        }
                    }
                    None => debug!("no desired state file configured"),
                }
                print_dry_run(session);
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    session
        .shutdown(router)
        .await
        .context("removing addresses and routes")
}

fn print_dry_run(session: &Session) {
    for line in session.take_dry_run_commands() {
        println!("{line}");
    }
}

fn install_paths(args: &Args, config: &Config) -> InstallPaths {
    let mut paths = InstallPaths {
        config_path: args.config.clone(),
        ..Default::default()
    };
    if let Some(dir) = config.router.state_path.parent() {
        paths.state_dir = dir.to_path_buf();
    }
    paths
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (manager, missing) = load_config(&args.config)?;
    let _guard = init_logging_from_config(manager.config(), args.log_level.as_deref());
    if let Some(err) = missing {
        warn!("{err}; falling back to defaults");
    }
    let config = manager.config().clone();
    let router_cfg = &config.router;
    debug!(config = %args.config.display(), iface = %router_cfg.interface, dry_run = args.dry_run);

    let session = Session::from_config(router_cfg, args.dry_run);
    if let Err(err) = session.store().load().await {
        warn!("ignoring unreadable state: {err}");
    }

    let result = match &args.command {
        Command::Up => session
            .router(router_cfg)
            .await
            .up()
            .await
            .context("bringing interface up"),
        Command::Apply { desired } => {
            let path = desired_path(desired, &config)
                .context("no desired state file; pass --desired or set router.desired_path")?;
            let mut router = session.router(router_cfg).await;
            session
                .apply_file(&mut router, &path)
                .await
                .with_context(|| format!("applying {}", path.display()))
        }
        Command::Down => {
            let router = session.router(router_cfg).await;
            session
                .shutdown(router)
                .await
                .context("removing addresses and routes")
        }
        Command::Cleanup => session
            .cleanup(router_cfg)
            .await
            .context("cleaning up recorded state"),
        Command::Status => {
            let report = session.status(router_cfg).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Run { desired, pidfile } => {
            let _pidfile = match pidfile {
                Some(path) if !args.dry_run => Some(PidFile::create(path)?),
                _ => None,
            };
            run_daemon(&session, manager, desired.clone()).await
        }
        Command::Install { args: extra } => {
            if args.dry_run {
                bail!("--dry-run is not supported for install");
            }
            let paths = install_paths(&args, &config);
            install_system_daemon(session.runner().as_ref(), &paths, extra)
                .await
                .map_err(Into::into)
        }
        Command::Uninstall { args: extra } => {
            if args.dry_run {
                bail!("--dry-run is not supported for uninstall");
            }
            let paths = install_paths(&args, &config);
            uninstall_system_daemon(session.runner().as_ref(), &paths, extra)
                .await
                .map_err(Into::into)
        }
    };

    print_dry_run(&session);
    result
}
