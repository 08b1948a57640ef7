use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hsync::config::{self, ClientConf, ServerConf, VERSION};
use hsync::deploy::{self, DeployQueue};
use hsync::server::Server;

/// Continuous client-to-server directory sync with server-side deploy fan-out.
///
/// `-h` is reserved for host selection (not `--help`); pass `--help` for
/// this usage text.
#[derive(Parser, Debug)]
#[command(name = "hsync", version = VERSION, disable_help_flag = true)]
struct Cli {
    /// Run as the sync server (hsyncd) instead of the client.
    #[arg(short = 'd', long = "server")]
    server: bool,

    /// Server only: run a one-shot deploy of everything already on disk, then exit.
    #[arg(long)]
    deploy: bool,

    /// Client only: remote host name to use (defaults to "default", else any configured host).
    #[arg(short = 'h', long = "host")]
    host: Option<String>,

    /// Print an example config ("client" or "server") and exit.
    #[arg(long = "demo_conf")]
    demo_conf: Option<String>,

    /// Client only: max concurrent CHECK dispatches per drain tick.
    #[arg(long = "tr")]
    check_parallelism: Option<usize>,

    /// Print this usage text and exit.
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Config file path. Defaults to hsyncd.json (server) or hsync.json (client).
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(kind) = &cli.demo_conf {
        print!("{}", config::demo_conf(kind));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // `-deploy` is server-only and implies `-d`.
    let server_mode = cli.server || cli.deploy;
    let default_name = if server_mode { "hsyncd.json" } else { "hsync.json" };
    let config_path = cli.config.unwrap_or_else(|| PathBuf::from(default_name));

    if server_mode {
        run_server(&config_path, cli.deploy)
    } else {
        run_client(&config_path, cli.host, cli.check_parallelism)
    }
}

fn run_server(config_path: &Path, deploy_once: bool) -> anyhow::Result<()> {
    let conf = Arc::new(ServerConf::load(config_path)?);
    // Matches the original's NewHSyncServer: create home if missing, then
    // chdir into it, before either the one-shot deploy or the listen loop.
    std::fs::create_dir_all(&conf.home)?;
    std::env::set_current_dir(&conf.home)
        .with_context(|| format!("chdir {}", conf.home.display()))?;

    if deploy_once {
        deploy::deploy_all(&conf)?;
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let queue = DeployQueue::new();
        deploy::spawn(conf.clone(), queue.clone());
        let server = Arc::new(Server::new(conf, queue));
        server.run().await
    })?;
    Ok(())
}

fn run_client(config_path: &Path, host: Option<String>, check_parallelism: Option<usize>) -> anyhow::Result<()> {
    let conf = Arc::new(ClientConf::load(config_path)?);
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(hsync::client::run(conf, host, check_parallelism))?;
    Ok(())
}
