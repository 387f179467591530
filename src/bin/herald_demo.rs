use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;

use herald::{session_watcher, ClusterNode, HeraldConfig, MemoryEnsemble, MemorySession};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Runs an in-process cohort and kills leaders one by one",
    long_about = None
)]
struct Args {
    /// Number of participants to start
    #[arg(short, long, default_value_t = 3)]
    nodes: usize,

    /// JSON config file (namespaces, prefixes, sequence width)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port of the first participant's advertised address
    #[arg(long, default_value_t = 8080)]
    base_port: u16,

    /// Pause between leader failures
    #[arg(long, default_value_t = 500)]
    failover_interval_ms: u64,
}

struct Participant {
    session: Arc<MemorySession>,
    node: ClusterNode,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.nodes == 0 {
        bail!("--nodes must be at least 1");
    }

    let config = match &args.config {
        Some(path) => HeraldConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => HeraldConfig::default(),
    };
    let interval = Duration::from_millis(args.failover_interval_ms);
    let ensemble = MemoryEnsemble::from_config(&config);
    info!(
        "in-process ensemble {} (session timeout {:?})",
        ensemble.name(),
        config.session_timeout()
    );

    let mut participants = Vec::with_capacity(args.nodes);
    for idx in 0..args.nodes {
        let name = format!("node-{idx}");
        let port = u16::try_from(idx)
            .ok()
            .and_then(|offset| args.base_port.checked_add(offset))
            .with_context(|| format!("no port left for {name} above {}", args.base_port))?;
        let (watcher, handles) = session_watcher(name.clone());
        let session = ensemble.connect(watcher)?;
        let node = ClusterNode::start(
            name.clone(),
            config.clone(),
            format!("127.0.0.1:{port}"),
            session.clone(),
            handles,
        )
        .with_context(|| format!("failed to start {name}"))?;
        participants.push(Participant { session, node });
    }

    while participants.len() > 1 {
        std::thread::sleep(interval);
        let Some(idx) = participants
            .iter()
            .position(|participant| participant.node.election().is_leader())
        else {
            bail!("no leader among {} participants", participants.len());
        };

        let leader = participants.remove(idx);
        let workers = leader.node.registry().cached()?.unwrap_or_default();
        info!(
            "{} leads, workers: {:?}; closing its session",
            leader.node.name(),
            workers.sorted()
        );
        leader.session.close()?;
        let end = leader.node.run_until_shutdown();
        info!("former leader exited: {end:?}");
    }

    std::thread::sleep(interval);
    for participant in &participants {
        info!(
            "{} final state: {:?}",
            participant.node.name(),
            participant.node.election().state()?
        );
    }
    for participant in participants {
        participant.session.close()?;
    }
    println!("Disconnected from coordination store, exiting");
    Ok(())
}
