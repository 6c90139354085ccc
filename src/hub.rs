//! Registry of live viewers and fan-out of output and status to them.
//!
//! Each viewer owns a bounded delivery queue. One broadcast round puts at
//! most one batch on every queue, so a viewer falls behind by whole rounds
//! and is dropped once its queue is full. The registry itself is not
//! synchronized; the engine keeps it under the same lock as the output
//! buffer so a catch-up snapshot and the following live batches never
//! overlap or leave a gap.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::output_buffer::OutputBuffer;
use crate::protocol::WireMessage;

pub type ViewerId = u32;

/// Messages delivered to a viewer in one round, in order.
pub type ViewerBatch = Vec<WireMessage>;

/// Default number of undelivered rounds a viewer may lag behind.
pub const DEFAULT_VIEWER_QUEUE: usize = 256;

struct Viewer {
    // Finalized lines already queued for this viewer.
    cursor: usize,
    tx: mpsc::Sender<ViewerBatch>,
}

/// Outcome of one broadcast round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub removed: Vec<ViewerId>,
}

impl BroadcastReport {
    pub fn log(&self, what: &'static str) {
        for id in &self.removed {
            tracing::info!(
                target = "task_agent::hub",
                viewer = id,
                during = what,
                "viewer removed after failed delivery"
            );
        }
    }
}

#[derive(Default)]
pub struct ViewerRegistry {
    viewers: HashMap<ViewerId, Viewer>,
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }

    #[cfg(test)]
    fn contains(&self, id: ViewerId) -> bool {
        self.viewers.contains_key(&id)
    }

    #[cfg(test)]
    fn cursor(&self, id: ViewerId) -> Option<usize> {
        self.viewers.get(&id).map(|viewer| viewer.cursor)
    }

    /// Queues the catch-up batch (`status`, every finalized line, the open
    /// line) and registers the viewer. A viewer whose catch-up cannot be
    /// queued is never registered.
    pub fn attach(
        &mut self,
        task_id: u32,
        status: WireMessage,
        buffer: &OutputBuffer,
        tx: mpsc::Sender<ViewerBatch>,
    ) -> Option<ViewerId> {
        let mut batch = Vec::with_capacity(buffer.finalized_len() + 2);
        batch.push(status);
        batch.extend(
            buffer
                .lines()
                .iter()
                .map(|line| WireMessage::stdout(task_id, line.clone())),
        );
        batch.push(WireMessage::stdbuf(task_id, buffer.tail()));
        if tx.try_send(batch).is_err() {
            return None;
        }

        let id = self.unused_id();
        self.viewers.insert(
            id,
            Viewer {
                cursor: buffer.finalized_len(),
                tx,
            },
        );
        Some(id)
    }

    /// Sends every viewer the lines past its cursor followed by the current
    /// open line.
    pub fn broadcast_lines(&mut self, task_id: u32, buffer: &OutputBuffer) -> BroadcastReport {
        let total = buffer.finalized_len();
        let tail = buffer.tail();
        let mut report = BroadcastReport::default();
        self.viewers.retain(|id, viewer| {
            let mut batch: ViewerBatch = buffer
                .lines_from(viewer.cursor)
                .iter()
                .map(|line| WireMessage::stdout(task_id, line.clone()))
                .collect();
            batch.push(WireMessage::stdbuf(task_id, tail));
            if viewer.tx.try_send(batch).is_ok() {
                viewer.cursor = total;
                report.delivered += 1;
                true
            } else {
                report.removed.push(*id);
                false
            }
        });
        report
    }

    pub fn broadcast_status(&mut self, status: &WireMessage) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        self.viewers.retain(|id, viewer| {
            if viewer.tx.try_send(vec![status.clone()]).is_ok() {
                report.delivered += 1;
                true
            } else {
                report.removed.push(*id);
                false
            }
        });
        report
    }

    /// Forgets a viewer whose client went away.
    pub fn detach(&mut self, id: ViewerId) -> bool {
        self.viewers.remove(&id).is_some()
    }

    /// Sends a close notice to every viewer and drops them all. Returns how
    /// many viewers were attached.
    pub fn detach_all(&mut self, task_id: u32) -> usize {
        let count = self.viewers.len();
        for (_, viewer) in self.viewers.drain() {
            let _ = viewer.tx.try_send(vec![WireMessage::close(task_id)]);
        }
        count
    }

    fn unused_id(&self) -> ViewerId {
        loop {
            let id = rand::random::<ViewerId>();
            if !self.viewers.contains_key(&id) {
                return id;
            }
        }
    }
}
