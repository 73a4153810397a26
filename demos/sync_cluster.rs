//! Walks a handful of keys through the synchronous frontend.
//!
//! Expects a cluster reachable through 127.0.0.1:7000.

use redis_cluster_router::{cmd, ClusterClient, NodeAddr};

fn main() {
    let client = ClusterClient::new(NodeAddr::new("127.0.0.1", 7000));
    let connection = client.get_connection().expect("cluster seed probe failed");

    for i in 0..16 {
        let key = format!("demo:{i}");
        let reply = connection
            .req_command(key.as_bytes(), cmd("SET").arg(&key).arg("test"))
            .expect("SET failed");
        println!("{key} -> {reply:?}");
    }

    connection.disconnect();
}
