use clap::Parser;

use flight_consensus::cli::Cli;
use flight_consensus::logging::init_logging;
use flight_consensus::voting::MajorityVoting;

/// Stands up one CORE peer process: a full Link/PFD/BEB/ERB/HCO/LEL/Voting
/// stack bound to its configured socket, wired to trivial
/// decide/deliver callbacks. The actual flight-control decision logic is an
/// external collaborator out of scope for this crate (spec.md §1).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();
    let configuration = cli.load_configuration()?;
    let node = &configuration.node;

    log::info!(
        "starting peer {} (socket dir {}, {} known peers)",
        node.process_number,
        node.socket_dir,
        configuration.peers.len()
    );

    let voting = MajorityVoting::bind(
        node.peer_id(),
        node.socket_dir.clone(),
        node.timeout(),
        node.ring_buffer_capacity,
        |value| {
            log::info!("deciding on proposed value {value:?}: accepting");
            true
        },
        |value| {
            println!("delivered: {value:?}");
        },
    )?;

    voting.add_peers(
        configuration
            .peer_ids()
            .into_iter()
            .filter(|peer| *peer != node.peer_id()),
    );
    voting.start();

    if let Some(leader) = voting.get_leader(node.timeout() * 10).await {
        log::info!("elected leader: {leader}");
    } else {
        log::warn!("no leader elected within the timeout");
    }

    tokio::signal::ctrl_c().await?;
    voting.stop();

    Ok(())
}
