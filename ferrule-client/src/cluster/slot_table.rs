//! Slot to shard mapping built from `CLUSTER SLOTS`
//!
//! Shards live in an arena; each of the 16384 slots holds either nothing or
//! an index into it. A table is immutable once built and replaced whole.

use crate::config::join_address;
use crate::error::{Error, Result};
use crate::reply::Reply;
use crate::slot::SLOT_COUNT;
use std::collections::{BTreeSet, HashMap};

/// Immutable slot table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTable {
    /// Node addresses per shard; index 0 is the master, then replicas
    shards: Vec<Vec<String>>,
    /// Shard index per slot
    slots: Box<[Option<u32>]>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::empty()
    }
}

impl SlotTable {
    /// Table with no slot assigned
    pub fn empty() -> Self {
        Self {
            shards: Vec::new(),
            slots: vec![None; SLOT_COUNT as usize].into_boxed_slice(),
        }
    }

    /// Build a table from a `CLUSTER SLOTS` reply
    ///
    /// Each entry is `[start, end, [host, port, id?], [host, port, id?]...]`.
    /// An empty host means "the node that answered", so `origin_host` is
    /// substituted. Ranges with identical node lists share one shard.
    pub fn from_cluster_slots(reply: &Reply, origin_host: &str) -> Result<Self> {
        let entries = reply
            .as_multi()
            .ok_or_else(|| unexpected("CLUSTER SLOTS", reply))?;

        let mut table = Self::empty();
        let mut shard_ids: HashMap<Vec<String>, u32> = HashMap::new();

        for entry in entries {
            let items = entry
                .as_multi()
                .ok_or_else(|| unexpected("slot range", entry))?;
            if items.len() < 3 {
                return Err(Error::UnexpectedReply(format!(
                    "slot range with {} elements",
                    items.len()
                )));
            }

            let start = slot_bound(&items[0])?;
            let end = slot_bound(&items[1])?;
            if start > end {
                return Err(Error::UnexpectedReply(format!(
                    "slot range {}-{} is reversed",
                    start, end
                )));
            }

            let nodes = items[2..]
                .iter()
                .map(|node| node_address(node, origin_host))
                .collect::<Result<Vec<_>>>()?;

            let next_id = table.shards.len() as u32;
            let id = *shard_ids.entry(nodes.clone()).or_insert(next_id);
            if id == next_id {
                table.shards.push(nodes);
            }

            for slot in start..=end {
                table.slots[slot as usize] = Some(id);
            }
        }

        Ok(table)
    }

    /// Shard member list serving `slot`, master first
    pub fn shard(&self, slot: u16) -> Option<&[String]> {
        let id = (*self.slots.get(slot as usize)?)?;
        self.shards.get(id as usize).map(Vec::as_slice)
    }

    pub fn shards(&self) -> &[Vec<String>] {
        &self.shards
    }

    /// Number of slots with an owner
    pub fn assigned_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Every address referenced by some shard
    pub fn addresses(&self) -> BTreeSet<&str> {
        self.shards
            .iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

fn slot_bound(reply: &Reply) -> Result<u16> {
    reply
        .to_integer()
        .filter(|n| (0..i64::from(SLOT_COUNT)).contains(n))
        .map(|n| n as u16)
        .ok_or_else(|| unexpected("slot number", reply))
}

fn node_address(node: &Reply, origin_host: &str) -> Result<String> {
    let fields = node
        .as_multi()
        .filter(|fields| fields.len() >= 2)
        .ok_or_else(|| unexpected("node entry", node))?;
    let host = fields[0]
        .as_str()
        .ok_or_else(|| unexpected("node host", &fields[0]))?;
    let port = fields[1]
        .to_integer()
        .filter(|port| (1..=i64::from(u16::MAX)).contains(port))
        .ok_or_else(|| unexpected("node port", &fields[1]))?;

    let host = if host.is_empty() { origin_host } else { host };
    Ok(join_address(host, port as u16))
}

fn unexpected(what: &str, reply: &Reply) -> Error {
    Error::UnexpectedReply(format!("{} was a {} reply", what, reply.kind()))
}
