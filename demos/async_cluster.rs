//! Dispatches a command asynchronously with an error callback that retries
//! transient failures and gives up on anything else.
//!
//! Expects a cluster reachable through 127.0.0.1:7000.

use std::time::Duration;

use redis_cluster_router::{cmd, Action, Cluster, NodeAddr, RouterError, Stage, TokioAdapter};

fn main() {
    let cluster = Cluster::create(
        &NodeAddr::new("127.0.0.1", 7000),
        TokioAdapter,
        Duration::from_secs(3),
    )
    .expect("cluster seed probe failed");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let mut done_tx = Some(done_tx);

        cluster.command(
            b"FOO",
            cmd("SET").arg("FOO").arg("BAR1"),
            move |reply| {
                println!("reply to SET FOO: {reply:?}");
                if let Some(done) = done_tx.take() {
                    let _ = done.send(());
                }
            },
            |err: &RouterError, stage: Stage| {
                eprintln!("error while processing the command ({stage:?}): {err}");
                match stage {
                    Stage::Ready => Action::Retry,
                    _ => Action::Finish,
                }
            },
        );

        let _ = done_rx.await;
    });

    cluster.disconnect();
}
