//! Server-wide traffic metrics.

use std::time::Duration;

use serde::Serialize;

use crate::{counting::per_second, registry::SocketRegistry};

/// Snapshot of server traffic, refreshed on every background tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerMetrics {
    /// Bytes read since the server started.
    pub total_read: u64,
    /// Bytes written since the server started.
    pub total_written: u64,
    /// Inbound bytes per second over the last tick.
    pub reads_per_second: u64,
    /// Outbound bytes per second over the last tick.
    pub writes_per_second: u64,
    /// Open connections at the last tick.
    pub connections: usize,
    /// Highest `connections` value observed.
    pub max_connections: usize,
    /// Execution units (tasks) reported by the strategy.
    pub execution_units: usize,
    /// Highest `execution_units` value observed.
    pub max_execution_units: usize,
}

impl ServerMetrics {
    /// Fold one tick of per-socket counters into the server totals.
    pub(crate) fn record_tick(&mut self, registry: &SocketRegistry, interval: Duration) {
        let mut read = 0;
        let mut written = 0;
        let mut connections = 0;
        registry.for_each(|socket| {
            read += socket.read_counter().update(interval);
            written += socket.write_counter().update(interval);
            if !socket.is_closed() {
                connections += 1;
            }
        });

        self.total_read += read;
        self.total_written += written;
        self.reads_per_second = per_second(read, interval);
        self.writes_per_second = per_second(written, interval);
        self.connections = connections;
        self.max_connections = self.max_connections.max(connections);
    }
}
