//! The slot table: parsing the cluster-state probe reply and mapping slots
//! to node addresses.

use std::collections::BTreeMap;
use std::time::Duration;

use arcstr::ArcStr;
use tracing::trace;

use crate::cmd::Cmd;
use crate::connection::{Connection, NodeAddr};
use crate::slot::SLOT_COUNT;
use crate::types::{ErrorKind, RouterError, RouterResult, Value};

pub(crate) const SLOT_REFRESH_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub(crate) const SLOT_REFRESH_TIMEOUT: Duration = Duration::from_secs(3);

/// A contiguous slot range and the nodes serving it.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Slot {
    start: u16,
    end: u16,
    master: ArcStr,
    replicas: Vec<ArcStr>,
}

impl Slot {
    pub(crate) fn new(start: u16, end: u16, master: ArcStr, replicas: Vec<ArcStr>) -> Slot {
        Slot {
            start,
            end,
            master,
            replicas,
        }
    }

    pub(crate) fn start(&self) -> u16 {
        self.start
    }

    pub(crate) fn end(&self) -> u16 {
        self.end
    }

    pub(crate) fn master(&self) -> &ArcStr {
        &self.master
    }

    #[allow(dead_code)]
    pub(crate) fn replicas(&self) -> &[ArcStr] {
        &self.replicas
    }
}

/// The slot→node table. Keyed by the inclusive end of each range, so that
/// the owner of a slot is the first entry at or past it.
#[derive(Debug, Default, Clone)]
pub(crate) struct SlotMap(BTreeMap<u16, ArcStr>);

impl SlotMap {
    pub(crate) fn new() -> SlotMap {
        SlotMap(BTreeMap::new())
    }

    pub(crate) fn clear(&mut self) {
        self.0.clear();
    }

    pub(crate) fn fill_slots(&mut self, slots: &[Slot]) {
        for slot in slots {
            self.0.insert(slot.end(), slot.master().clone());
        }
    }

    /// The address owning `slot`, if the table covers it.
    pub(crate) fn node_for_slot(&self, slot: u16) -> Option<&ArcStr> {
        self.0.range(slot..).next().map(|(_, addr)| addr)
    }

    /// All distinct node addresses in the table.
    pub(crate) fn nodes(&self) -> Vec<ArcStr> {
        let mut nodes: Vec<ArcStr> = self.0.values().cloned().collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }
}

/// A server-initiated redirection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Redirect {
    Moved(ArcStr),
    Ask(ArcStr),
}

pub(crate) fn slot_cmd() -> Cmd {
    let mut cmd = Cmd::new();
    cmd.arg("CLUSTER").arg("SLOTS");
    cmd
}

// Parse slot data from the raw probe reply.
pub(crate) fn parse_slots(raw_slot_resp: &Value) -> RouterResult<Vec<Slot>> {
    let mut result = Vec::with_capacity(2);

    if let Value::Bulk(items) = raw_slot_resp {
        let mut iter = items.iter();
        while let Some(Value::Bulk(item)) = iter.next() {
            if item.len() < 3 {
                continue;
            }

            let start = if let Value::Int(start) = item[0] {
                start as u16
            } else {
                continue;
            };

            let end = if let Value::Int(end) = item[1] {
                end as u16
            } else {
                continue;
            };

            let mut nodes: Vec<ArcStr> = item
                .iter()
                .skip(2)
                .filter_map(|node| {
                    if let Value::Bulk(node) = node {
                        if node.len() < 2 {
                            return None;
                        }

                        let ip = if let Value::Data(ref ip) = node[0] {
                            String::from_utf8_lossy(ip)
                        } else {
                            return None;
                        };
                        if ip.is_empty() {
                            return None;
                        }

                        let port = if let Value::Int(port) = node[1] {
                            port as u16
                        } else {
                            return None;
                        };
                        Some(ArcStr::from(NodeAddr::new(ip.into_owned(), port).to_string()))
                    } else {
                        None
                    }
                })
                .collect();

            if nodes.is_empty() {
                continue;
            }

            let replicas = nodes.split_off(1);
            result.push(Slot::new(start, end, nodes.pop().unwrap(), replicas));
        }
    }

    Ok(result)
}

// Validates coverage and builds the table. The ranges must tile the whole
// slot space without gaps or overlaps.
pub(crate) fn build_slot_map(slot_map: &mut SlotMap, mut slots_data: Vec<Slot>) -> RouterResult<()> {
    slots_data.sort_by_key(|slot_data| slot_data.start());
    let last_slot = slots_data.iter().try_fold(0u32, |prev_end, slot_data| {
        if prev_end != u32::from(slot_data.start()) {
            return Err(RouterError::from((
                ErrorKind::CriticalFailure,
                "Slot refresh error.",
                format!(
                    "Received overlapping slots {} and {}..{}",
                    prev_end,
                    slot_data.start(),
                    slot_data.end()
                ),
            )));
        }
        Ok(u32::from(slot_data.end()) + 1)
    })?;

    if last_slot != u32::from(SLOT_COUNT) {
        return Err(RouterError::from((
            ErrorKind::CriticalFailure,
            "Slot refresh error.",
            format!("Lacks the slots >= {last_slot}"),
        )));
    }
    slot_map.clear();
    slot_map.fill_slots(&slots_data);
    trace!("{:?}", slot_map);
    Ok(())
}

/// Probes a seed node over a temporary blocking connection and builds the
/// initial slot table.
pub(crate) fn probe_seed(seed: &NodeAddr, timeout: Duration) -> RouterResult<SlotMap> {
    let mut con = Connection::connect(seed, Some(timeout))?;
    con.set_read_timeout(Some(timeout))?;
    con.set_write_timeout(Some(timeout))?;

    let reply = con.req_command(&slot_cmd()).map_err(|err| match err.kind() {
        ErrorKind::ResponseError | ErrorKind::CriticalFailure => RouterError::from((
            ErrorKind::CriticalFailure,
            "Unexpected reply to the cluster-state probe",
            err.to_string(),
        )),
        _ => RouterError::from((
            ErrorKind::ConnectionFailed,
            "The seed node did not answer the cluster-state probe",
            err.to_string(),
        )),
    })?;

    let mut slots = SlotMap::new();
    build_slot_map(&mut slots, parse_slots(&reply)?)?;
    Ok(slots)
}
