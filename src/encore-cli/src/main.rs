mod now_playing;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use encore_core::{init_logging, AppDirs, Config, RemotingMode};
use encore_remote::{
    remote_release, remote_wait, MemberRemote, MemoryBus, MessageHandler, RemoteMethodProxy,
    RemoteOptions,
};
use now_playing::NowPlaying;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const DEMO_REMOTE_ID: &str = "now-playing";
const SYNC_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "encore", version, about = "Music player member remoting")]
struct Cli {
    /// Config file to load instead of the one in the config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Link a host and a client player in-process and sync "now playing" between them
    Demo(DemoCommand),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Parser, Clone)]
struct DemoCommand {
    /// Number of track changes to sync
    #[arg(short = 'n', long, default_value_t = 3)]
    iterations: u32,
}

#[derive(Debug, Clone, PartialEq)]
struct DemoSummary {
    rounds: u32,
    title: String,
    host_volume: f64,
    position_seconds: u32,
    shuffle_seed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dirs = AppDirs::discover()?;
    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load_or_default(&dirs)?,
    };
    let _logging = init_logging(&config.logging, &dirs)?;

    match cli.command {
        Some(Command::Config) => {
            print!("{}", config.to_toml()?);
        }
        Some(Command::Demo(demo)) => {
            let summary = run_demo(&config, demo.iterations).await?;
            println!(
                "Synced {} round(s): now playing '{}' at {:.2} volume, {}s in (shuffle seed {})",
                summary.rounds,
                summary.title,
                summary.host_volume,
                summary.position_seconds,
                summary.shuffle_seed
            );
        }
        None => {
            tracing::info!(
                mode = ?config.remoting.mode,
                scope = config.remoting.signature_scope.as_str(),
                "Encore ready (config dir: {})",
                dirs.config_dir().display()
            );
            println!("Nothing to do. Try `encore demo` or `encore config`.");
        }
    }

    Ok(())
}

/// Runs the host/client sync over an in-memory bus.
async fn run_demo(config: &Config, iterations: u32) -> Result<DemoSummary> {
    let bus = MemoryBus::new();
    let options = RemoteOptions::from(&config.remoting);

    let host = MemberRemote::attach(
        Arc::new(NowPlaying::default()),
        DEMO_REMOTE_ID,
        Some(bus.handler(RemotingMode::HOST) as Arc<dyn MessageHandler>),
        options.clone(),
    )
    .await?;
    let client = MemberRemote::attach(
        Arc::new(NowPlaying::default()),
        DEMO_REMOTE_ID,
        Some(bus.handler(RemotingMode::CLIENT) as Arc<dyn MessageHandler>),
        options,
    )
    .await?;

    for round in 1..=iterations {
        let title = format!("Track {round}");
        let volume = f64::from(round) / f64::from(iterations.max(1));
        let position = round * 30;

        let released = remote_wait(&client, "track-loaded", None);
        host.instance().set_title(&title);
        host.instance().seek(position);
        remote_release(&host, "track-loaded", None).await?;
        tokio::time::timeout(SYNC_TIMEOUT, released)
            .await
            .context("host never released the track")??;

        client.instance().set_volume(volume);

        wait_until(|| {
            let seen = client.instance().snapshot();
            seen.title == title
                && seen.position_seconds == position
                && (host.instance().snapshot().volume - volume).abs() < 1e-9
        })
        .await
        .with_context(|| format!("round {round} did not converge"))?;

        tracing::info!(round, %title, volume, position, "round synced");
    }

    let host_proxy = RemoteMethodProxy::new("shuffle_seed", &host)?;
    let client_proxy = RemoteMethodProxy::new("shuffle_seed", &client)?;
    let pending = client_proxy.receive_result::<u64>(None);
    let seed = host_proxy.publish_result(rand::random::<u64>(), None).await?;
    let received = tokio::time::timeout(SYNC_TIMEOUT, pending)
        .await
        .context("shuffle seed never arrived")??;
    if received != seed {
        bail!("client got shuffle seed {received}, host computed {seed}");
    }

    let state = client.instance().snapshot();
    Ok(DemoSummary {
        rounds: iterations,
        title: state.title,
        host_volume: host.instance().snapshot().volume,
        position_seconds: state.position_seconds,
        shuffle_seed: seed,
    })
}

async fn wait_until(mut check: impl FnMut() -> bool) -> Result<()> {
    let poll = async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(SYNC_TIMEOUT, poll).await?;
    Ok(())
}
