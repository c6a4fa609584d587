//! Node inventory and GPU accounting
//!
//! The registry keeps nodes in insertion order, which is the order the
//! round-robin cursor walks. It has no locking of its own: the scheduling
//! loop is its only owner.

use dlsched_core::{DlschedError, DlschedResult, NodeInfo};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// GPU bookkeeping for one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeState {
    /// Node name
    pub name: String,
    /// Declared GPU capacity; `None` when GPU accounting does not apply
    pub total_gpus: Option<u32>,
    /// GPUs not committed to a placed pod
    pub available_gpus: u32,
}

impl NodeState {
    fn from_info(info: &NodeInfo) -> Self {
        Self {
            name: info.name.clone(),
            total_gpus: info.gpu_capacity,
            available_gpus: info.gpu_capacity.unwrap_or(0),
        }
    }

    /// Whether a pod needing `gpus` GPUs fits on this node right now
    pub fn fits(&self, gpus: u32) -> bool {
        self.total_gpus.is_some() && self.available_gpus >= gpus
    }

    /// GPUs currently reserved by placed pods
    pub fn reserved_gpus(&self) -> u32 {
        self.total_gpus
            .map(|t| t.saturating_sub(self.available_gpus))
            .unwrap_or(0)
    }
}

/// Ordered node inventory with a round-robin cursor
#[derive(Debug, Default)]
pub struct NodeRegistry {
    /// Node names in round-robin order
    order: Vec<String>,
    /// Node state indexed by name
    nodes: HashMap<String, NodeState>,
    /// Index into `order` where the next placement scan starts
    cursor: usize,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new node. Returns `false` if it was already known.
    pub fn add_node(&mut self, info: &NodeInfo) -> bool {
        if self.nodes.contains_key(&info.name) {
            debug!(node = %info.name, "Ignoring add for known node");
            return false;
        }

        let state = NodeState::from_info(info);
        info!(
            node = %info.name,
            gpus = ?state.total_gpus,
            available = state.available_gpus,
            "Node added"
        );
        self.nodes.insert(info.name.clone(), state);
        if !self.order.contains(&info.name) {
            self.order.push(info.name.clone());
        }
        true
    }

    /// Refresh a node's capacity.
    ///
    /// Availability of an already tracked GPU node is carried over so that
    /// in-flight reservations survive the update. Unknown nodes are added.
    pub fn update_node(&mut self, info: &NodeInfo) {
        let carried = match self.nodes.get(&info.name) {
            Some(prev) if prev.total_gpus.is_some() => Some(prev.available_gpus),
            Some(_) => None,
            None => {
                debug!(node = %info.name, "Update for unknown node, adding it");
                if !self.order.contains(&info.name) {
                    self.order.push(info.name.clone());
                }
                None
            }
        };

        let mut state = NodeState::from_info(info);
        if let Some(available) = carried {
            state.available_gpus = available;
        }
        if let Some(total) = state.total_gpus {
            if state.available_gpus > total {
                warn!(
                    node = %info.name,
                    total = total,
                    available = state.available_gpus,
                    "Node capacity shrank below its carried-over availability"
                );
            }
        }

        debug!(
            node = %info.name,
            gpus = ?state.total_gpus,
            available = state.available_gpus,
            "Node updated"
        );
        self.nodes.insert(info.name.clone(), state);
    }

    /// Forget a node and reset the round-robin cursor to the start.
    pub fn remove_node(&mut self, name: &str) -> Option<NodeState> {
        let removed = self.nodes.remove(name);
        if let Some(pos) = self.order.iter().position(|n| n == name) {
            self.order.remove(pos);
        }
        self.cursor = 0;

        info!(node = %name, known = removed.is_some(), "Node deleted");
        removed
    }

    /// Commit `count` GPUs of a node to a placed pod.
    ///
    /// Fails without mutating if the node would go below zero.
    pub fn reserve(&mut self, name: &str, count: u32) -> DlschedResult<()> {
        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| DlschedError::UnknownNode(name.to_string()))?;

        let remaining = node.available_gpus.checked_sub(count).ok_or_else(|| {
            DlschedError::AccountingViolation(format!(
                "node {} would have negative available GPUs: {} - {}",
                name, node.available_gpus, count
            ))
        })?;
        node.available_gpus = remaining;

        debug!(node = %name, reserved = count, available = remaining, "Reserved GPUs");
        Ok(())
    }

    /// Return `count` GPUs of a node.
    ///
    /// Availability never exceeds the declared capacity.
    pub fn release(&mut self, name: &str, count: u32) -> DlschedResult<()> {
        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| DlschedError::UnknownNode(name.to_string()))?;

        let mut available = node.available_gpus.saturating_add(count);
        if let Some(total) = node.total_gpus {
            if available > total {
                warn!(
                    node = %name,
                    total = total,
                    released = count,
                    "Release exceeds node capacity, clamping"
                );
                available = total;
            }
        }
        node.available_gpus = available;

        debug!(node = %name, released = count, available = available, "Released GPUs");
        Ok(())
    }

    /// Look up a node
    pub fn get(&self, name: &str) -> Option<&NodeState> {
        self.nodes.get(name)
    }

    /// Node state at a round-robin position
    pub fn at(&self, index: usize) -> Option<&NodeState> {
        self.order.get(index).and_then(|name| self.nodes.get(name))
    }

    /// Node names in round-robin order
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Number of nodes in the round-robin order
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Current round-robin cursor
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub(crate) fn set_cursor(&mut self, index: usize) {
        self.cursor = index;
    }

    /// Move the cursor one step, wrapping at the end of the order
    pub(crate) fn advance_cursor(&mut self) {
        if !self.order.is_empty() {
            self.cursor = (self.cursor + 1) % self.order.len();
        }
    }

    /// Node states in round-robin order
    pub fn snapshot(&self) -> Vec<NodeState> {
        self.order
            .iter()
            .filter_map(|name| self.nodes.get(name).cloned())
            .collect()
    }
}
