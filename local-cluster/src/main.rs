use color_eyre::eyre::{bail, Result};
use tracing_subscriber::EnvFilter;

use quorumchat_local_cluster::{
    local_cluster_tester::{local_config, LocalClusterRunner},
    local_node::LocalNodeSummary,
};
use quorumchat_replica::config::ClusterConfig;

const USAGE: &str = "usage: quorumchat-local-cluster [--nodes N | --config PATH]";

fn init_tracing() {
    if std::env::var_os("QUORUMCHAT_CONSOLE").is_some() {
        console_subscriber::init();
        return;
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn parse_args() -> Result<ClusterConfig> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => Ok(local_config(5)),
        [flag, n] if flag == "--nodes" => Ok(local_config(n.parse()?)),
        [flag, path] if flag == "--config" => Ok(ClusterConfig::load(path)?),
        _ => bail!(USAGE),
    }
}

fn print_cluster(nodes: &[LocalNodeSummary]) {
    for node in nodes {
        match &node.replica {
            Some(r) => println!(
                "  node {} ({}) {} leader={} users={:?} messages={:?}",
                node.id,
                node.address,
                r.role,
                r.leader_address.as_deref().unwrap_or("-"),
                r.usernames,
                r.message_ids
            ),
            None => println!("  node {} ({}) dead", node.id, node.address),
        }
    }
}

/// Runs a scripted session against an in-process cluster: elect, write,
/// lose the leader, re-elect, and read back through the new leader.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();
    let config = parse_args()?;
    let mut cr = LocalClusterRunner::with_config(config)?;

    let first = cr.check_one_leader().await?;
    println!("Leader elected: node {} at {}", first.id, first.address);
    let leader = cr.node(first.id)?;
    leader.create_account("alice", "alice-pw").await?;
    leader.create_account("bob", "bob-pw").await?;
    for body in ["hello", "are you there?", "ping"] {
        leader.send_message("alice", "bob", body).await?;
    }
    print_cluster(&cr.get_cluster_state().await?);
    drop(leader);

    println!("Killing node {}", first.id);
    cr.kill(first.id).await?;
    let second = cr.check_one_leader().await?;
    println!("New leader: node {} at {}", second.id, second.address);

    let leader = cr.node(second.id)?;
    let login = leader.login("bob", "bob-pw").await?;
    println!("{} ({} unread)", login.message, login.unread_count);
    for message in leader.read_messages("bob", 0).await? {
        println!(
            "  #{} {} -> {}: {}",
            message.id, message.sender, message.recipient, message.body
        );
    }
    drop(leader);

    println!("Restarting node {}", first.id);
    cr.restart(first.id).await?;
    cr.sleep(1000).await;
    print_cluster(&cr.get_cluster_state().await?);
    Ok(())
}
