//! The asynchronous routing core.
//!
//! Each dispatched command runs as its own task whose body is the
//! redirection state machine: the command is submitted to the node owning
//! the key's slot, the reply is inspected, and MOVED/ASK excursions, the
//! ASKING handshake, retries and failures are handled inside the task
//! before the reply callback fires exactly once.
//!
//! Connections are driver tasks owning a framed socket; the router keeps
//! one per node and hands out cheap cloneable handles to them. Drivers are
//! bound to an event reactor through an [`Adapter`].
//!
//! # Example
//! ```rust,no_run
//! use redis_cluster_router::{cmd, Cluster, NodeAddr, TokioAdapter};
//! use std::time::Duration;
//!
//! # async fn run() -> redis_cluster_router::RouterResult<()> {
//! let cluster = Cluster::create(
//!     &NodeAddr::new("127.0.0.1", 7000),
//!     TokioAdapter,
//!     Duration::from_secs(3),
//! )?;
//! let reply = cluster
//!     .route_command(b"foo", cmd("SET").arg("foo").arg("bar"))
//!     .await?;
//! cluster.disconnect();
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use arcstr::ArcStr;
use backoff::{future::retry, Error as BackoffError, ExponentialBackoff};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use rand::seq::SliceRandom;
use rand::thread_rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Decoder;
use tracing::{info, trace, warn};

use crate::client::ClusterParams;
use crate::cmd::{self, Cmd, ASKING};
use crate::connection::NodeAddr;
use crate::parser::ValueCodec;
use crate::slot::hash_slot;
use crate::topology::{
    self, slot_cmd, SlotMap, SLOT_REFRESH_INITIAL_INTERVAL, SLOT_REFRESH_TIMEOUT,
};
use crate::types::{Action, ErrorKind, RouterError, RouterResult, Stage, Value};

/// Binds freshly created connections to an event reactor.
///
/// The router calls [`attach`](Adapter::attach) once per connection (and
/// once per dispatched command); the driver future completes when the
/// connection is torn down. The same adapter serves every connection of a
/// [`Cluster`] for its whole lifetime.
pub trait Adapter: Send + Sync + 'static {
    /// Attaches a driver future to the reactor.
    fn attach(&self, driver: BoxFuture<'static, ()>);
}

impl Adapter for tokio::runtime::Handle {
    fn attach(&self, driver: BoxFuture<'static, ()>) {
        self.spawn(driver);
    }
}

/// Adapter spawning onto the ambient tokio runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioAdapter;

impl Adapter for TokioAdapter {
    fn attach(&self, driver: BoxFuture<'static, ()>) {
        tokio::spawn(driver);
    }
}

/// Reply callback: receives the command's outcome. Invoked exactly once,
/// except in subscription mode where it fires for every pushed message.
pub trait ReplyCallback: FnMut(RouterResult<Value>) + Send + 'static {}
impl<T: FnMut(RouterResult<Value>) + Send + 'static> ReplyCallback for T {}

/// Error callback: consulted when a command fails, with the failure and the
/// lifecycle stage it occurred in. Returning [`Action::Retry`] re-submits
/// the command on the connection used last.
pub trait ErrorCallback: FnMut(&RouterError, Stage) -> Action + Send + 'static {}
impl<T: FnMut(&RouterError, Stage) -> Action + Send + 'static> ErrorCallback for T {}

enum ReplySink {
    Single(oneshot::Sender<RouterResult<Value>>),
    Subscription(mpsc::UnboundedSender<RouterResult<Value>>),
}

enum NodeRequest {
    Command { packed: Vec<u8>, sink: ReplySink },
    // Orderly shutdown: in-flight commands hold handle clones, so closing
    // the channel alone would not stop the driver.
    Close,
}

/// Cheap handle to one node's driver task.
#[derive(Clone)]
struct NodeConnection {
    id: usize,
    tx: mpsc::UnboundedSender<NodeRequest>,
}

impl NodeConnection {
    async fn request(&self, packed: Vec<u8>) -> RouterResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(NodeRequest::Command {
                packed,
                sink: ReplySink::Single(tx),
            })
            .map_err(|_| disconnected())?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(disconnected()),
        }
    }

    fn subscribe(&self, packed: Vec<u8>) -> RouterResult<mpsc::UnboundedReceiver<RouterResult<Value>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx
            .send(NodeRequest::Command {
                packed,
                sink: ReplySink::Subscription(tx),
            })
            .map_err(|_| disconnected())?;
        Ok(rx)
    }

    fn close(&self) {
        let _ = self.tx.send(NodeRequest::Close);
    }
}

fn disconnected() -> RouterError {
    RouterError::from((ErrorKind::Disconnected, "Connection is gone"))
}

fn deliver(sink: ReplySink, item: RouterResult<Value>) {
    // A dropped receiver means the command no longer cares.
    match sink {
        ReplySink::Single(tx) => {
            let _ = tx.send(item);
        }
        ReplySink::Subscription(tx) => {
            let _ = tx.send(item);
        }
    }
}

// One driver per connection: writes queued requests to the socket and pairs
// incoming frames with pending reply sinks in FIFO order. Once the codec
// has seen a subscribe-family command, frames beyond the pending queue are
// pushed to the subscription sink instead.
async fn drive_connection(
    addr: ArcStr,
    conn_id: usize,
    stream: TcpStream,
    mut rx: mpsc::UnboundedReceiver<NodeRequest>,
    core: Weak<ClusterCore>,
) {
    let mut framed = ValueCodec::default().framed(stream);
    let mut pending: VecDeque<ReplySink> = VecDeque::new();
    let mut subscription: Option<mpsc::UnboundedSender<RouterResult<Value>>> = None;

    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(NodeRequest::Command { packed, sink }) => {
                    if let Err(err) = framed.send(packed).await {
                        deliver(sink, Err(err));
                        break;
                    }
                    match sink {
                        ReplySink::Single(tx) => pending.push_back(ReplySink::Single(tx)),
                        ReplySink::Subscription(tx) => subscription = Some(tx),
                    }
                }
                // Orderly shutdown, or the pool dropped this connection.
                Some(NodeRequest::Close) | None => break,
            },
            frame = framed.next() => match frame {
                Some(Ok(item)) => {
                    let fatal = matches!(&item, Err(err) if err.kind() == ErrorKind::CriticalFailure);
                    if let Some(sink) = pending.pop_front() {
                        deliver(sink, item);
                    } else if let Some(tx) = &subscription {
                        let _ = tx.send(item);
                    } else {
                        warn!("dropping an unsolicited frame from {}", addr);
                    }
                    if fatal {
                        // The stream position is unknown after a framing
                        // violation; the connection cannot be reused.
                        break;
                    }
                }
                Some(Err(err)) => {
                    if let Some(sink) = pending.pop_front() {
                        deliver(sink, Err(err));
                    }
                    break;
                }
                None => break,
            },
        }
    }

    for sink in pending {
        deliver(sink, Err(disconnected()));
    }
    drop(subscription);
    if let Some(core) = core.upgrade() {
        core.remove_connection(&addr, conn_id);
    }
    trace!("connection to {} closed", addr);
}

struct ClusterCore {
    slots: ArcSwap<SlotMap>,
    connections: DashMap<ArcStr, NodeConnection>,
    adapter: Box<dyn Adapter>,
    params: ClusterParams,
    needs_refresh: AtomicBool,
    refresh_in_progress: AtomicBool,
    shutdown: AtomicBool,
    next_conn_id: AtomicUsize,
}

impl ClusterCore {
    fn mark_moved(&self) {
        self.needs_refresh.store(true, Ordering::Relaxed);
    }

    // Idempotent: only removes the entry if it still belongs to the driver
    // reporting the disconnect.
    fn remove_connection(&self, addr: &ArcStr, conn_id: usize) {
        self.connections.remove_if(addr, |_, conn| conn.id == conn_id);
    }

    fn disconnect(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for entry in self.connections.iter() {
            entry.value().close();
        }
        // The drivers fail their pending sinks with a synthetic disconnect
        // and exit.
        self.connections.clear();
    }

    async fn connection_for(self: &Arc<Self>, key: &[u8]) -> RouterResult<NodeConnection> {
        if self.needs_refresh.swap(false, Ordering::Relaxed) {
            if let Err(err) = self.refresh_slots().await {
                self.needs_refresh.store(true, Ordering::Relaxed);
                warn!("slot table refresh failed, keeping the stale table: {}", err);
            }
        }
        let slot = hash_slot(key);
        let addr = self
            .slots
            .load()
            .node_for_slot(slot)
            .cloned()
            .ok_or_else(|| {
                RouterError::from((
                    ErrorKind::ConnectionFailed,
                    "Missing slot coverage",
                    slot.to_string(),
                ))
            })?;
        self.connection_to(&addr).await
    }

    // Redirect targets may not be in the slot table yet; reuse a pooled
    // connection when possible, otherwise open a fresh one.
    async fn connection_to(self: &Arc<Self>, addr: &ArcStr) -> RouterResult<NodeConnection> {
        if let Some(conn) = self.connections.get(addr) {
            return Ok(conn.clone());
        }
        self.new_connection(addr).await
    }

    async fn new_connection(self: &Arc<Self>, addr: &ArcStr) -> RouterResult<NodeConnection> {
        if self.shutdown.load(Ordering::Relaxed) {
            fail!((ErrorKind::Disconnected, "The cluster has been shut down"));
        }
        let node: NodeAddr = addr.parse()?;
        let stream = tokio::time::timeout(
            self.params.connection_timeout,
            TcpStream::connect((node.host.as_str(), node.port)),
        )
        .await
        .map_err(|_| {
            RouterError::from((
                ErrorKind::ConnectionFailed,
                "Connection attempt timed out",
                addr.to_string(),
            ))
        })?
        .map_err(|err| {
            RouterError::from((
                ErrorKind::ConnectionFailed,
                "Failed to connect to node",
                format!("{addr}: {err}"),
            ))
        })?;
        stream.set_nodelay(true)?;

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = NodeConnection { id: conn_id, tx };
        self.adapter.attach(
            drive_connection(addr.clone(), conn_id, stream, rx, Arc::downgrade(self)).boxed(),
        );
        self.connections.insert(addr.clone(), conn.clone());
        trace!("opened connection to {}", addr);
        Ok(conn)
    }

    // Query a node to discover slot->master mappings, with bounded backoff.
    // Concurrent refreshes coalesce into one.
    async fn refresh_slots(self: &Arc<Self>) -> RouterResult<()> {
        if self
            .refresh_in_progress
            .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return Ok(());
        }
        let retry_strategy = ExponentialBackoff {
            initial_interval: SLOT_REFRESH_INITIAL_INTERVAL,
            max_interval: SLOT_REFRESH_TIMEOUT,
            max_elapsed_time: Some(SLOT_REFRESH_TIMEOUT),
            ..Default::default()
        };
        let core = self.clone();
        let result = retry(retry_strategy, move || {
            let core = core.clone();
            async move { core.refresh_slots_once().await.map_err(BackoffError::transient) }
        })
        .await;
        self.refresh_in_progress.store(false, Ordering::Relaxed);
        result
    }

    async fn refresh_slots_once(self: &Arc<Self>) -> RouterResult<()> {
        info!("refreshing the slot table");
        let mut candidates: Vec<NodeConnection> =
            self.connections.iter().map(|entry| entry.value().clone()).collect();
        if candidates.is_empty() {
            fail!((
                ErrorKind::ConnectionFailed,
                "No live connections to refresh slots from"
            ));
        }
        candidates.shuffle(&mut thread_rng());

        let packed = slot_cmd().get_packed_command();
        let mut result = Err(RouterError::from((
            ErrorKind::CriticalFailure,
            "Slot refresh error.",
            "didn't get any slots from server".to_string(),
        )));
        for conn in candidates {
            match conn.request(packed.clone()).await {
                Ok(value) => {
                    let mut new_slots = SlotMap::new();
                    match topology::parse_slots(&value)
                        .and_then(|v| topology::build_slot_map(&mut new_slots, v))
                    {
                        Ok(_) => {
                            result = Ok(new_slots);
                            break;
                        }
                        Err(err) => result = Err(err),
                    }
                }
                Err(err) => result = Err(err),
            }
        }
        let new_slots = result?;

        // Reap connections to nodes that left the table.
        let nodes = new_slots.nodes();
        self.connections.retain(|addr, _| nodes.contains(addr));
        self.slots.store(Arc::new(new_slots));
        info!("slot table refreshed");
        Ok(())
    }
}

/// The client's local view of the cluster: the slot table plus one live
/// connection per node, shared by every command dispatched through it.
#[derive(Clone)]
pub struct Cluster {
    core: Arc<ClusterCore>,
}

impl Cluster {
    /// Connects to the cluster reachable through `seed`.
    ///
    /// The seed is probed over a temporary blocking connection bounded by
    /// `timeout`; per-node connections are opened lazily once commands are
    /// dispatched. Call this before entering the reactor, or from a
    /// blocking-friendly context.
    pub fn create<A: Adapter>(seed: &NodeAddr, adapter: A, timeout: Duration) -> RouterResult<Cluster> {
        let params = ClusterParams {
            connection_timeout: timeout,
            ..Default::default()
        };
        Cluster::with_params(seed, adapter, params)
    }

    pub(crate) fn with_params<A: Adapter>(
        seed: &NodeAddr,
        adapter: A,
        params: ClusterParams,
    ) -> RouterResult<Cluster> {
        let slots = topology::probe_seed(seed, params.connection_timeout)?;
        Ok(Cluster {
            core: Arc::new(ClusterCore {
                slots: ArcSwap::from_pointee(slots),
                connections: DashMap::new(),
                adapter: Box::new(adapter),
                params,
                needs_refresh: AtomicBool::new(false),
                refresh_in_progress: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                next_conn_id: AtomicUsize::new(0),
            }),
        })
    }

    /// Sends `cmd` to the node owning `key`'s slot and awaits the final
    /// reply, following redirections as the cluster requires.
    pub async fn route_command(&self, key: &[u8], cmd: &Cmd) -> RouterResult<Value> {
        let mut finish = |_: &RouterError, _: Stage| Action::Finish;
        drive(&self.core, key, cmd.get_packed_command(), &mut finish).await
    }

    /// Dispatches `cmd` with callbacks.
    ///
    /// The reply callback fires exactly once with the command's outcome
    /// (repeatedly for subscription commands); the error callback is
    /// consulted on failures and may demand a retry.
    pub fn command(&self, key: &[u8], cmd: &Cmd, reply_cb: impl ReplyCallback, err_cb: impl ErrorCallback) {
        self.dispatch(key, Ok(cmd.get_packed_command()), reply_cb, err_cb);
    }

    /// Packs an argv-style command and dispatches it with callbacks.
    pub fn command_argv<A: AsRef<[u8]>>(
        &self,
        key: &[u8],
        argv: &[A],
        reply_cb: impl ReplyCallback,
        err_cb: impl ErrorCallback,
    ) {
        self.dispatch(key, cmd::pack_command(argv), reply_cb, err_cb);
    }

    /// Initiates an orderly shutdown: all connections are closed, in-flight
    /// commands terminate through their callbacks with a synthetic
    /// disconnect, and nothing fires afterwards.
    pub fn disconnect(&self) {
        self.core.disconnect();
    }

    fn dispatch(
        &self,
        key: &[u8],
        packed: RouterResult<Vec<u8>>,
        mut reply_cb: impl ReplyCallback,
        mut err_cb: impl ErrorCallback,
    ) {
        let core = self.core.clone();
        let key = key.to_vec();
        self.core.adapter.attach(
            async move {
                match packed {
                    Ok(packed) if cmd::is_subscribe_command(&packed) => {
                        run_subscription(core, key, packed, reply_cb, err_cb).await;
                    }
                    Ok(packed) => {
                        let result = drive(&core, &key, packed, &mut err_cb).await;
                        reply_cb(result);
                    }
                    // Precondition violations surface through the same
                    // callback path as any post-submission failure.
                    Err(err) => {
                        let _ = err_cb(&err, Stage::Failed);
                        reply_cb(Err(err));
                    }
                }
            }
            .boxed(),
        );
    }
}

fn consult(core: &ClusterCore, err_cb: &mut impl FnMut(&RouterError, Stage) -> Action, err: &RouterError, stage: Stage) -> Action {
    let action = err_cb(err, stage);
    if core.shutdown.load(Ordering::Relaxed) {
        // Teardown overrides the callback's verdict.
        return Action::Finish;
    }
    action
}

// The command state machine. Returns the terminal result; the caller owns
// the exactly-once reply delivery.
async fn drive(
    core: &Arc<ClusterCore>,
    key: &[u8],
    packed: Vec<u8>,
    err_cb: &mut impl FnMut(&RouterError, Stage) -> Action,
) -> RouterResult<Value> {
    let mut conn = loop {
        match core.connection_for(key).await {
            Ok(conn) => break conn,
            Err(err) => match consult(core, err_cb, &err, Stage::Failed) {
                Action::Retry => continue,
                Action::Finish => return Err(err),
            },
        }
    };

    let mut redirects = 0u32;
    // Set after the error callback demanded a retry; a failed re-submission
    // then terminates the command instead of consulting again.
    let mut retrying = false;

    'submit: loop {
        let err = match conn.request(packed.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if retrying && err.is_connection_dropped() {
            // The retry submission itself failed.
            let _ = err_cb(&err, Stage::Failed);
            return Err(err);
        }
        retrying = false;

        let (failure, stage) = match err.kind() {
            ErrorKind::Moved | ErrorKind::Ask => {
                let asking = err.kind() == ErrorKind::Ask;
                let stage = if asking { Stage::Ask } else { Stage::Moved };
                if !asking {
                    core.mark_moved();
                }
                if redirects >= core.params.max_redirects {
                    let kind = if asking { ErrorKind::AskingFailed } else { ErrorKind::MovedFailed };
                    (
                        RouterError::from((kind, "Reached the redirect limit")),
                        stage,
                    )
                } else {
                    redirects += 1;
                    trace!("following {} to {:?}", if asking { "ASK" } else { "MOVED" }, err.redirect_node());
                    match follow_redirect(core, &err, asking).await {
                        Ok(next) => {
                            conn = next;
                            continue 'submit;
                        }
                        Err(failure) => (failure, stage),
                    }
                }
            }
            ErrorKind::ClusterDown
            | ErrorKind::CriticalFailure
            | ErrorKind::Disconnected
            | ErrorKind::IoError => (err, Stage::Failed),
            // Domain-level error replies reach the caller unchanged; the
            // error callback may still demand a retry first.
            _ => (err, Stage::Ready),
        };

        match consult(core, err_cb, &failure, stage) {
            Action::Retry => retrying = true,
            Action::Finish => return Err(failure),
        }
    }
}

// Acquires the redirect connection named by a MOVED/ASK reply, performing
// the ASKING handshake on ASK excursions.
async fn follow_redirect(
    core: &Arc<ClusterCore>,
    err: &RouterError,
    asking: bool,
) -> RouterResult<NodeConnection> {
    let failed_kind = if asking { ErrorKind::AskingFailed } else { ErrorKind::MovedFailed };
    let (addr, _slot) = err
        .redirect_node()
        .ok_or((ErrorKind::LogicError, "Redirect reply carried no target"))?;
    let addr = ArcStr::from(addr);

    let conn = core.connection_to(&addr).await.map_err(|source| {
        RouterError::from((
            failed_kind,
            "Failed to open a redirect connection",
            source.to_string(),
        ))
    })?;

    if asking {
        match conn.request(ASKING.to_vec()).await {
            Ok(Value::Okay) => {}
            Ok(_) => fail!((ErrorKind::AskingFailed, "ASKING was not acknowledged")),
            Err(source) => fail!((
                ErrorKind::AskingFailed,
                "ASKING could not be submitted",
                source.to_string()
            )),
        }
    }
    Ok(conn)
}

// Subscription commands never terminate: every pushed message goes through
// the reply callback, and the task ends silently when the connection does.
async fn run_subscription(
    core: Arc<ClusterCore>,
    key: Vec<u8>,
    packed: Vec<u8>,
    mut reply_cb: impl ReplyCallback,
    mut err_cb: impl ErrorCallback,
) {
    let subscribed = async {
        let conn = core.connection_for(&key).await?;
        conn.subscribe(packed)
    }
    .await;

    let mut rx = match subscribed {
        Ok(rx) => rx,
        Err(err) => {
            let _ = err_cb(&err, Stage::Failed);
            reply_cb(Err(err));
            return;
        }
    };

    while let Some(item) = rx.recv().await {
        reply_cb(item);
    }
}
