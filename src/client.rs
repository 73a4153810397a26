//! Client-level configuration and entry points for both frontends.

use std::time::Duration;

use crate::cluster::ClusterConnection;
use crate::cluster_async::{Adapter, Cluster};
use crate::connection::NodeAddr;
use crate::types::RouterResult;

/// Parameters controlling how transient failures are retried.
#[derive(Clone, Debug)]
pub struct RetryParams {
    /// Maximum number of retries before an error is returned.
    pub number_of_retries: u32,
    max_wait_time: u64,
    min_wait_time: u64,
    exponent_base: u64,
    factor: u64,
}

impl Default for RetryParams {
    fn default() -> Self {
        const DEFAULT_NUMBER_OF_RETRIES: u32 = 16;
        const DEFAULT_MAX_RETRY_WAIT_TIME: u64 = 655_360;
        const DEFAULT_MIN_RETRY_WAIT_TIME: u64 = 10;
        const DEFAULT_EXPONENT_BASE: u64 = 2;
        const DEFAULT_FACTOR: u64 = 10;

        Self {
            number_of_retries: DEFAULT_NUMBER_OF_RETRIES,
            max_wait_time: DEFAULT_MAX_RETRY_WAIT_TIME,
            min_wait_time: DEFAULT_MIN_RETRY_WAIT_TIME,
            exponent_base: DEFAULT_EXPONENT_BASE,
            factor: DEFAULT_FACTOR,
        }
    }
}

impl RetryParams {
    pub(crate) fn wait_time_for_retry(&self, retry: u32) -> Duration {
        let base_wait = self.exponent_base.saturating_pow(retry).saturating_mul(self.factor);
        Duration::from_millis(base_wait.clamp(self.min_wait_time, self.max_wait_time))
    }
}

/// Parameters shared by every connection of one cluster view.
#[derive(Clone, Debug)]
pub struct ClusterParams {
    /// Bound on connect attempts and on the seed probe.
    pub connection_timeout: Duration,
    /// Bound on the MOVED/ASK hop chain of a single command.
    pub max_redirects: u32,
    /// Retry behavior for transient failures.
    pub retry_params: RetryParams,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            // The seed-probe default the original adapters shipped with.
            connection_timeout: Duration::from_secs(3),
            max_redirects: 16,
            retry_params: RetryParams::default(),
        }
    }
}

/// Entry point for connecting to a cluster through a seed node.
///
/// ```rust,no_run
/// use redis_cluster_router::{cmd, ClusterClient, NodeAddr, TokioAdapter};
///
/// # async fn run() -> redis_cluster_router::RouterResult<()> {
/// let client = ClusterClient::new(NodeAddr::new("127.0.0.1", 7000));
/// let cluster = client.create(TokioAdapter)?;
/// let reply = cluster.route_command(b"foo", cmd("SET").arg("foo").arg("bar")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ClusterClient {
    seed: NodeAddr,
    params: ClusterParams,
}

impl ClusterClient {
    /// Creates a client for the cluster reachable through `seed`.
    pub fn new(seed: NodeAddr) -> ClusterClient {
        ClusterClient {
            seed,
            params: ClusterParams::default(),
        }
    }

    /// Sets the connect/probe timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> ClusterClient {
        self.params.connection_timeout = timeout;
        self
    }

    /// Sets the bound on the redirect chain of a single command.
    pub fn max_redirects(mut self, max_redirects: u32) -> ClusterClient {
        self.params.max_redirects = max_redirects;
        self
    }

    /// Sets the number of transient-failure retries of the sync frontend.
    pub fn retries(mut self, retries: u32) -> ClusterClient {
        self.params.retry_params.number_of_retries = retries;
        self
    }

    /// Opens a synchronous cluster connection.
    pub fn get_connection(&self) -> RouterResult<ClusterConnection> {
        ClusterConnection::new(&self.seed, self.params.clone())
    }

    /// Builds the asynchronous router, probing the seed synchronously.
    pub fn create<A: Adapter>(&self, adapter: A) -> RouterResult<Cluster> {
        Cluster::with_params(&self.seed, adapter, self.params.clone())
    }
}
