//! End-to-end scenarios for the asynchronous router, driven against
//! scripted in-process nodes speaking the wire protocol.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Decoder;

use redis_cluster_router::{
    cmd, Action, Cluster, ErrorKind, NodeAddr, RouterError, RouterResult, Stage, TokioAdapter,
    Value, ValueCodec,
};

type CommandLog = Arc<Mutex<Vec<String>>>;

async fn bind_node() -> (NodeAddr, TcpListener) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = NodeAddr::new("127.0.0.1", listener.local_addr().unwrap().port());
    (addr, listener)
}

/// Serves a scripted node: every decoded request is answered with whatever
/// the script returns for its words. An empty script result withholds the
/// reply.
fn serve<F>(listener: TcpListener, script: F) -> CommandLog
where
    F: Fn(&[String]) -> Vec<u8> + Send + Sync + 'static,
{
    let log: CommandLog = Arc::new(Mutex::new(Vec::new()));
    let script = Arc::new(script);
    let accept_log = log.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let script = script.clone();
            let log = accept_log.clone();
            tokio::spawn(async move {
                let mut framed = ValueCodec::default().framed(stream);
                while let Some(Ok(Ok(request))) = framed.next().await {
                    let words = request_words(&request);
                    log.lock().unwrap().push(words.first().cloned().unwrap_or_default());
                    let reply = script(&words);
                    if reply.is_empty() {
                        continue;
                    }
                    if framed.send(reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    log
}

fn request_words(request: &Value) -> Vec<String> {
    match request {
        Value::Bulk(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn seen(log: &CommandLog, word: &str) -> usize {
    log.lock().unwrap().iter().filter(|entry| *entry == word).count()
}

/// A CLUSTER SLOTS reply mapping every slot to one node.
fn full_coverage(addr: &NodeAddr) -> Vec<u8> {
    format!(
        "*1\r\n*3\r\n:0\r\n:16383\r\n*2\r\n${}\r\n{}\r\n:{}\r\n",
        addr.host.len(),
        addr.host,
        addr.port
    )
    .into_bytes()
}

fn moved_to(addr: &NodeAddr) -> Vec<u8> {
    format!("-MOVED 12182 {addr}\r\n").into_bytes()
}

fn ask_to(addr: &NodeAddr) -> Vec<u8> {
    format!("-ASK 12182 {addr}\r\n").into_bytes()
}

const UNEXPECTED: &[u8] = b"-ERR unexpected command\r\n";

async fn create_cluster(seed: &NodeAddr) -> Cluster {
    let seed = seed.clone();
    tokio::task::spawn_blocking(move || {
        Cluster::create(&seed, TokioAdapter, Duration::from_secs(2)).unwrap()
    })
    .await
    .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_completes_in_one_round_trip() {
    let (addr, listener) = bind_node().await;
    let own = addr.clone();
    let log = serve(listener, move |words| match words[0].as_str() {
        "CLUSTER" => full_coverage(&own),
        "SET" => b"+OK\r\n".to_vec(),
        _ => UNEXPECTED.to_vec(),
    });

    let cluster = create_cluster(&addr).await;
    let reply = cluster
        .route_command(b"foo", cmd("SET").arg("foo").arg("bar"))
        .await
        .unwrap();
    assert_eq!(reply.as_status(), Some("OK"));
    assert_eq!(seen(&log, "SET"), 1);
    cluster.disconnect();
}

#[tokio::test(flavor = "multi_thread")]
async fn moved_redirect_is_followed_and_marks_the_topology() {
    let (addr_a, listener_a) = bind_node().await;
    let (addr_b, listener_b) = bind_node().await;

    // Node A owns everything at probe time, then reports the slot as moved
    // to B; any later topology query returns the post-move map.
    let own_a = addr_a.clone();
    let peer_b = addr_b.clone();
    let probes = AtomicUsize::new(0);
    let log_a = serve(listener_a, move |words| match words[0].as_str() {
        "CLUSTER" => {
            if probes.fetch_add(1, Ordering::SeqCst) == 0 {
                full_coverage(&own_a)
            } else {
                full_coverage(&peer_b)
            }
        }
        "SET" => moved_to(&peer_b),
        _ => UNEXPECTED.to_vec(),
    });
    let own_b = addr_b.clone();
    let log_b = serve(listener_b, move |words| match words[0].as_str() {
        "CLUSTER" => full_coverage(&own_b),
        "SET" => b"+OK\r\n".to_vec(),
        "GET" => b"$3\r\nbar\r\n".to_vec(),
        _ => UNEXPECTED.to_vec(),
    });

    let cluster = create_cluster(&addr_a).await;
    let reply = cluster
        .route_command(b"foo", cmd("SET").arg("foo").arg("bar"))
        .await
        .unwrap();
    assert_eq!(reply, Value::Okay);
    assert_eq!(seen(&log_b, "SET"), 1);

    // The relocation marked the topology: the next command refreshes the
    // slot table before routing and lands on B directly.
    let reply = cluster.route_command(b"foo", cmd("GET").arg("foo")).await.unwrap();
    assert_eq!(reply, Value::Data(b"bar".to_vec()));
    assert!(seen(&log_a, "CLUSTER") + seen(&log_b, "CLUSTER") >= 2);
    assert_eq!(seen(&log_b, "GET"), 1);
    cluster.disconnect();
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_redirect_handshakes_without_marking_the_topology() {
    let (addr_a, listener_a) = bind_node().await;
    let (addr_b, listener_b) = bind_node().await;

    let own_a = addr_a.clone();
    let peer_b = addr_b.clone();
    let log_a = serve(listener_a, move |words| match words[0].as_str() {
        "CLUSTER" => full_coverage(&own_a),
        "GET" => ask_to(&peer_b),
        "SET" => b"+OK\r\n".to_vec(),
        _ => UNEXPECTED.to_vec(),
    });
    let log_b = serve(listener_b, move |words| match words[0].as_str() {
        "ASKING" => b"+OK\r\n".to_vec(),
        "GET" => b"$3\r\nbar\r\n".to_vec(),
        _ => UNEXPECTED.to_vec(),
    });

    let cluster = create_cluster(&addr_a).await;
    let reply = cluster.route_command(b"foo", cmd("GET").arg("foo")).await.unwrap();
    assert_eq!(reply, Value::Data(b"bar".to_vec()));
    assert_eq!(
        *log_b.lock().unwrap(),
        vec!["ASKING".to_string(), "GET".to_string()]
    );

    // The topology was not marked: the next command routes through A with
    // no refresh probe in between.
    let reply = cluster
        .route_command(b"other", cmd("SET").arg("other").arg("x"))
        .await
        .unwrap();
    assert_eq!(reply, Value::Okay);
    assert_eq!(seen(&log_a, "CLUSTER"), 1);
    assert_eq!(seen(&log_b, "CLUSTER"), 0);
    cluster.disconnect();
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_error_is_retried_on_callback_demand() {
    let (addr, listener) = bind_node().await;
    let own = addr.clone();
    let sets = AtomicUsize::new(0);
    let log = serve(listener, move |words| match words[0].as_str() {
        "CLUSTER" => full_coverage(&own),
        "SET" => {
            if sets.fetch_add(1, Ordering::SeqCst) == 0 {
                b"-LOADING Redis is loading the dataset in memory\r\n".to_vec()
            } else {
                b"+OK\r\n".to_vec()
            }
        }
        _ => UNEXPECTED.to_vec(),
    });

    let cluster = create_cluster(&addr).await;
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel();
    let consulted = Arc::new(Mutex::new(Vec::new()));
    let consulted_in_cb = consulted.clone();
    cluster.command(
        b"foo",
        cmd("SET").arg("foo").arg("bar"),
        move |result: RouterResult<Value>| {
            reply_tx.send(result).unwrap();
        },
        move |err: &RouterError, stage: Stage| {
            consulted_in_cb.lock().unwrap().push((err.kind(), stage));
            Action::Retry
        },
    );

    let result = reply_rx.recv().await.unwrap();
    assert_eq!(result.unwrap(), Value::Okay);
    assert_eq!(*consulted.lock().unwrap(), vec![(ErrorKind::ResponseError, Stage::Ready)]);
    assert_eq!(seen(&log, "SET"), 2);

    // The reply callback fired exactly once.
    assert!(timeout(Duration::from_millis(100), reply_rx.recv()).await.is_err());
    cluster.disconnect();
}

#[tokio::test(flavor = "multi_thread")]
async fn cluster_down_finishes_and_leaves_the_router_usable() {
    let (addr, listener) = bind_node().await;
    let own = addr.clone();
    serve(listener, move |words| match words[0].as_str() {
        "CLUSTER" => full_coverage(&own),
        "SET" => b"-CLUSTERDOWN The cluster is down\r\n".to_vec(),
        "GET" => b"$3\r\nbar\r\n".to_vec(),
        _ => UNEXPECTED.to_vec(),
    });

    let cluster = create_cluster(&addr).await;
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel();
    let consulted = Arc::new(Mutex::new(Vec::new()));
    let consulted_in_cb = consulted.clone();
    cluster.command(
        b"foo",
        cmd("SET").arg("foo").arg("bar"),
        move |result: RouterResult<Value>| {
            reply_tx.send(result).unwrap();
        },
        move |err: &RouterError, stage: Stage| {
            consulted_in_cb.lock().unwrap().push((err.kind(), stage));
            Action::Finish
        },
    );

    let result = reply_rx.recv().await.unwrap();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::ClusterDown);
    assert_eq!(*consulted.lock().unwrap(), vec![(ErrorKind::ClusterDown, Stage::Failed)]);

    // The topology survives a CLUSTERDOWN command.
    let reply = cluster.route_command(b"foo", cmd("GET").arg("foo")).await.unwrap();
    assert_eq!(reply, Value::Data(b"bar".to_vec()));
    cluster.disconnect();
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_moved_target_reaches_the_error_callback() {
    let (addr_a, listener_a) = bind_node().await;
    // Bind and immediately drop a listener so the port refuses connections.
    let (dead_addr, dead_listener) = bind_node().await;
    drop(dead_listener);

    let own = addr_a.clone();
    let dead = dead_addr.clone();
    serve(listener_a, move |words| match words[0].as_str() {
        "CLUSTER" => full_coverage(&own),
        "SET" => moved_to(&dead),
        _ => UNEXPECTED.to_vec(),
    });

    let cluster = create_cluster(&addr_a).await;
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel();
    let consulted = Arc::new(Mutex::new(Vec::new()));
    let consulted_in_cb = consulted.clone();
    cluster.command(
        b"foo",
        cmd("SET").arg("foo").arg("bar"),
        move |result: RouterResult<Value>| {
            reply_tx.send(result).unwrap();
        },
        move |err: &RouterError, stage: Stage| {
            consulted_in_cb.lock().unwrap().push((err.kind(), stage));
            Action::Finish
        },
    );

    let result = reply_rx.recv().await.unwrap();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::MovedFailed);
    assert_eq!(*consulted.lock().unwrap(), vec![(ErrorKind::MovedFailed, Stage::Moved)]);
    cluster.disconnect();
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_terminates_in_flight_commands_exactly_once() {
    let (addr, listener) = bind_node().await;
    let own = addr.clone();
    serve(listener, move |words| match words[0].as_str() {
        "CLUSTER" => full_coverage(&own),
        // Withhold the SET reply so the command stays in flight.
        "SET" => Vec::new(),
        _ => UNEXPECTED.to_vec(),
    });

    let cluster = create_cluster(&addr).await;
    let replies: Arc<Mutex<Vec<RouterResult<Value>>>> = Arc::new(Mutex::new(Vec::new()));
    let replies_in_cb = replies.clone();
    cluster.command(
        b"foo",
        cmd("SET").arg("foo").arg("bar"),
        move |result: RouterResult<Value>| {
            replies_in_cb.lock().unwrap().push(result);
        },
        |_err: &RouterError, _stage: Stage| Action::Retry,
    );

    sleep(Duration::from_millis(100)).await;
    assert!(replies.lock().unwrap().is_empty());
    cluster.disconnect();
    sleep(Duration::from_millis(200)).await;

    {
        let replies = replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].as_ref().unwrap_err().kind(), ErrorKind::Disconnected);
    }

    // Commands submitted after the teardown fail immediately.
    let err = cluster
        .route_command(b"foo", cmd("GET").arg("foo"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Disconnected);
}

#[tokio::test(flavor = "multi_thread")]
async fn subscription_mode_keeps_the_command_alive() {
    let (addr, listener) = bind_node().await;
    let own = addr.clone();
    serve(listener, move |words| match words[0].as_str() {
        "CLUSTER" => full_coverage(&own),
        // Confirmation plus two pushed messages in one burst.
        "SUBSCRIBE" => concat_frames(&[
            b"*3\r\n$9\r\nsubscribe\r\n$2\r\nch\r\n:1\r\n",
            b"*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$5\r\nhello\r\n",
            b"*3\r\n$7\r\nmessage\r\n$2\r\nch\r\n$5\r\nworld\r\n",
        ]),
        _ => UNEXPECTED.to_vec(),
    });

    let cluster = create_cluster(&addr).await;
    let messages: Arc<Mutex<Vec<RouterResult<Value>>>> = Arc::new(Mutex::new(Vec::new()));
    let messages_in_cb = messages.clone();
    cluster.command(
        b"ch",
        cmd("SUBSCRIBE").arg("ch"),
        move |result: RouterResult<Value>| {
            messages_in_cb.lock().unwrap().push(result);
        },
        |_err: &RouterError, _stage: Stage| Action::Finish,
    );

    sleep(Duration::from_millis(200)).await;
    assert_eq!(messages.lock().unwrap().len(), 3);

    cluster.disconnect();
    sleep(Duration::from_millis(100)).await;
    // Teardown ends the subscription without further callbacks.
    assert_eq!(messages.lock().unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_argv_fails_through_the_callbacks() {
    let (addr, listener) = bind_node().await;
    let own = addr.clone();
    serve(listener, move |words| match words[0].as_str() {
        "CLUSTER" => full_coverage(&own),
        _ => UNEXPECTED.to_vec(),
    });

    let cluster = create_cluster(&addr).await;
    let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel();
    let consulted = Arc::new(Mutex::new(Vec::new()));
    let consulted_in_cb = consulted.clone();
    cluster.command_argv(
        b"foo",
        &Vec::<Vec<u8>>::new(),
        move |result: RouterResult<Value>| {
            reply_tx.send(result).unwrap();
        },
        move |err: &RouterError, stage: Stage| {
            consulted_in_cb.lock().unwrap().push((err.kind(), stage));
            Action::Finish
        },
    );

    let result = reply_rx.recv().await.unwrap();
    assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(*consulted.lock().unwrap(), vec![(ErrorKind::InvalidArgument, Stage::Failed)]);
    cluster.disconnect();
}

fn concat_frames(frames: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(frame);
    }
    out
}
