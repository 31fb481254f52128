//! Form a session over an in-process cluster and run every collective.
//!
//! ```bash
//! RUST_LOG=cohort=debug cargo run --example local_cluster
//! ```

use cohort::{CollectiveKind, Comms, CommsOptions, LocalCluster, Operation};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> cohort::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cluster = Arc::new(LocalCluster::new(4));
    let options = CommsOptions {
        comms_p2p: true,
        verbose: true,
    };
    let mut comms = Comms::new(Arc::clone(&cluster), options);
    comms.init().await?;

    let info = comms.worker_info(comms.worker_addresses()?)?;
    for worker in comms.worker_addresses()? {
        println!("{worker}: rank {}", info[worker].rank);
    }

    for kind in CollectiveKind::ALL {
        comms.run(Operation::Collective { kind, root: 0 }).await?;
        println!("{kind}: ok");
    }
    comms.run(Operation::SendRecv { n_trials: 5 }).await?;
    println!("send_recv: ok");
    comms.run(Operation::Split { color_mod: 2 }).await?;
    println!("split: ok");

    comms.destroy().await
}
