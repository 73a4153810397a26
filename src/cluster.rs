//! The synchronous cluster frontend.
//!
//! A single-threaded specialization of the routing core: the redirect loop
//! runs inline on the calling thread over blocking connections.
//!
//! # Example
//! ```rust,no_run
//! use redis_cluster_router::{cmd, ClusterClient, NodeAddr};
//!
//! let client = ClusterClient::new(NodeAddr::new("127.0.0.1", 7000));
//! let connection = client.get_connection().unwrap();
//!
//! let reply = connection
//!     .req_command(b"test", cmd("SET").arg("test").arg("test_data"))
//!     .unwrap();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use arcstr::ArcStr;
use rand::seq::IteratorRandom;
use rand::thread_rng;
use tracing::{trace, warn};

use crate::client::ClusterParams;
use crate::cmd::{Cmd, ASKING};
use crate::connection::{Connection, NodeAddr};
use crate::slot::hash_slot;
use crate::topology::{self, slot_cmd, Redirect, SlotMap};
use crate::types::{ErrorKind, RouterResult, Value};

/// A synchronous connection to a cluster.
///
/// Stores one blocking connection per node alongside the slot table, and
/// transparently follows MOVED/ASK redirections.
#[derive(Debug)]
pub struct ClusterConnection {
    connections: RefCell<HashMap<ArcStr, Connection>>,
    slots: RefCell<SlotMap>,
    needs_refresh: Cell<bool>,
    read_timeout: RefCell<Option<Duration>>,
    write_timeout: RefCell<Option<Duration>>,
    params: ClusterParams,
}

impl ClusterConnection {
    pub(crate) fn new(seed: &NodeAddr, params: ClusterParams) -> RouterResult<Self> {
        let slots = topology::probe_seed(seed, params.connection_timeout)?;
        Ok(ClusterConnection {
            connections: RefCell::new(HashMap::new()),
            slots: RefCell::new(slots),
            needs_refresh: Cell::new(false),
            read_timeout: RefCell::new(None),
            write_timeout: RefCell::new(None),
            params,
        })
    }

    /// Sets the read timeout for all connections, present and future.
    ///
    /// If the provided value is `None`, reads block indefinitely.
    pub fn set_read_timeout(&self, dur: Option<Duration>) -> RouterResult<()> {
        let mut t = self.read_timeout.borrow_mut();
        *t = dur;
        let connections = self.connections.borrow();
        for conn in connections.values() {
            conn.set_read_timeout(dur)?;
        }
        Ok(())
    }

    /// Sets the write timeout for all connections, present and future.
    ///
    /// If the provided value is `None`, writes block indefinitely.
    pub fn set_write_timeout(&self, dur: Option<Duration>) -> RouterResult<()> {
        let mut t = self.write_timeout.borrow_mut();
        *t = dur;
        let connections = self.connections.borrow();
        for conn in connections.values() {
            conn.set_write_timeout(dur)?;
        }
        Ok(())
    }

    /// Sends `cmd` to the node owning `key`'s slot and returns the reply,
    /// following redirections as the cluster requires.
    pub fn req_command(&self, key: &[u8], cmd: &Cmd) -> RouterResult<Value> {
        self.request(key, &cmd.get_packed_command())
    }

    /// Flags the slot table as stale; the next request rebuilds it first.
    pub fn mark_moved(&self) {
        self.needs_refresh.set(true);
    }

    /// Closes all connections.
    pub fn disconnect(&self) {
        self.connections.borrow_mut().clear();
    }

    // Query a node to discover slot->master mappings.
    fn refresh_slots(&self) -> RouterResult<()> {
        let new_slots = self.create_new_slots()?;

        let nodes = new_slots.nodes();
        let mut connections = self.connections.borrow_mut();
        connections.retain(|addr, conn| nodes.contains(addr) && conn.is_open());

        *self.slots.borrow_mut() = new_slots;
        Ok(())
    }

    fn create_new_slots(&self) -> RouterResult<SlotMap> {
        let mut connections = self.connections.borrow_mut();
        let mut rng = thread_rng();
        let len = connections.len();
        let mut samples = connections.values_mut().choose_multiple(&mut rng, len);
        let mut result = Err((
            ErrorKind::ConnectionFailed,
            "Slot refresh error.",
            "didn't get any slots from server".to_string(),
        )
            .into());
        for conn in samples.iter_mut() {
            let value = conn.req_command(&slot_cmd())?;
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
        result
    }

    fn connect(&self, addr: &str) -> RouterResult<Connection> {
        let node: NodeAddr = addr.parse()?;
        let conn = Connection::connect(&node, Some(self.params.connection_timeout))?;
        conn.set_read_timeout(*self.read_timeout.borrow())?;
        conn.set_write_timeout(*self.write_timeout.borrow())?;
        Ok(conn)
    }

    fn connection_for<'a>(
        &self,
        connections: &'a mut HashMap<ArcStr, Connection>,
        key: &[u8],
    ) -> RouterResult<(ArcStr, &'a mut Connection)> {
        let slot = hash_slot(key);
        let addr = {
            let slots = self.slots.borrow();
            slots.node_for_slot(slot).cloned().ok_or((
                ErrorKind::ConnectionFailed,
                "Missing slot coverage",
            ))?
        };
        Ok((addr.clone(), self.get_connection_by_addr(connections, &addr)?))
    }

    fn get_connection_by_addr<'a>(
        &self,
        connections: &'a mut HashMap<ArcStr, Connection>,
        addr: &ArcStr,
    ) -> RouterResult<&'a mut Connection> {
        if connections.contains_key(addr) {
            Ok(connections.get_mut(addr).unwrap())
        } else {
            let conn = self.connect(addr)?;
            Ok(connections.entry(addr.clone()).or_insert(conn))
        }
    }

    fn request(&self, key: &[u8], packed: &[u8]) -> RouterResult<Value> {
        let mut retries = 0;
        let mut redirected = None::<Redirect>;

        loop {
            if self.needs_refresh.replace(false) {
                if let Err(err) = self.refresh_slots() {
                    self.needs_refresh.set(true);
                    warn!("slot table refresh failed, keeping the stale table: {}", err);
                }
            }

            // Get target address and response.
            let (addr, rv) = {
                let mut connections = self.connections.borrow_mut();
                let (addr, conn) = if let Some(redirected) = redirected.take() {
                    let (addr, is_asking) = match redirected {
                        Redirect::Moved(addr) => (addr, false),
                        Redirect::Ask(addr) => (addr, true),
                    };
                    let conn = self.get_connection_by_addr(&mut connections, &addr)?;
                    if is_asking {
                        // Feed a single ASKING command into the connection
                        // before the one we actually want to execute.
                        match conn.req_packed_command(ASKING) {
                            Ok(Value::Okay) => {}
                            _ => fail!((ErrorKind::AskingFailed, "ASKING was not acknowledged")),
                        }
                    }
                    (addr, conn)
                } else {
                    self.connection_for(&mut connections, key)?
                };
                (addr, conn.req_packed_command(packed))
            };

            match rv {
                Ok(rv) => return Ok(rv),
                Err(err) => {
                    if retries == self.params.retry_params.number_of_retries {
                        return Err(err);
                    }
                    retries += 1;

                    match err.kind() {
                        ErrorKind::Ask => {
                            redirected = err
                                .redirect_node()
                                .map(|(node, _slot)| Redirect::Ask(ArcStr::from(node)));
                        }
                        ErrorKind::Moved => {
                            trace!("following MOVED to {:?}", err.redirect_node());
                            self.mark_moved();
                            redirected = err
                                .redirect_node()
                                .map(|(node, _slot)| Redirect::Moved(ArcStr::from(node)));
                        }
                        ErrorKind::TryAgain | ErrorKind::ClusterDown => {
                            // Sleep and retry.
                            let sleep_time = self.params.retry_params.wait_time_for_retry(retries);
                            thread::sleep(sleep_time);
                        }
                        ErrorKind::Disconnected | ErrorKind::IoError => {
                            let mut connections = self.connections.borrow_mut();
                            connections.remove(&addr);
                            if let Ok(conn) = self.connect(&addr) {
                                connections.insert(addr, conn);
                            }
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }
}
