//! Connection log and per-process traffic counters.
//!
//! The network controller samples the socket table on a fixed interval.
//! Established connections not already in the log are appended, and the log
//! keeps only the most recent [`CONNECTION_LOG_CAPACITY`] entries. Process
//! I/O counters are sampled on the same tick.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::os::{ConnectionInfo, ProcessIo};

/// Connections retained in the log.
pub const CONNECTION_LOG_CAPACITY: usize = 1000;

/// An established connection and when it was first seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    /// When the sample that first contained it was taken.
    pub seen_at: DateTime<Utc>,
    /// The connection.
    #[serde(flatten)]
    pub connection: ConnectionInfo,
}

type ConnectionKey = (String, u16, u32);

fn key(connection: &ConnectionInfo) -> ConnectionKey {
    (
        connection.remote_address.clone(),
        connection.remote_port,
        connection.pid,
    )
}

/// Bounded log of established connections, oldest first.
#[derive(Debug)]
pub struct ConnectionLog {
    entries: VecDeque<ConnectionRecord>,
    capacity: usize,
}

impl Default for ConnectionLog {
    fn default() -> Self {
        Self::with_capacity(CONNECTION_LOG_CAPACITY)
    }
}

impl ConnectionLog {
    /// An empty log holding at most `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(CONNECTION_LOG_CAPACITY)),
            capacity,
        }
    }

    /// Append the established connections of `sample` that the log does not
    /// already hold, keyed by remote endpoint and owning process. Returns the
    /// records that were added.
    pub fn record(
        &mut self,
        sample: &[ConnectionInfo],
        now: DateTime<Utc>,
    ) -> Vec<ConnectionRecord> {
        let mut known: HashSet<ConnectionKey> =
            self.entries.iter().map(|r| key(&r.connection)).collect();

        let added: Vec<ConnectionRecord> = sample
            .iter()
            .filter(|c| c.is_established())
            .filter(|c| known.insert(key(c)))
            .map(|c| ConnectionRecord {
                seen_at: now,
                connection: c.clone(),
            })
            .collect();

        self.entries.extend(added.iter().cloned());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        added
    }

    /// Up to `limit` most recent records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<ConnectionRecord> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// I/O totals of the processes sharing one image name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessTraffic {
    /// Executable image name.
    pub process_name: String,
    /// Live processes with this name.
    pub processes: usize,
    /// Bytes written.
    pub bytes_sent: u64,
    /// Bytes read.
    pub bytes_received: u64,
    /// When the counters were last sampled.
    pub updated_at: DateTime<Utc>,
}

/// Latest counters per process ID.
#[derive(Debug, Default)]
pub struct TrafficTable {
    by_pid: BTreeMap<u32, (ProcessIo, DateTime<Utc>)>,
}

impl TrafficTable {
    /// Replace the table with `sample`. Processes missing from the sample
    /// have exited and are dropped.
    pub fn update(&mut self, sample: Vec<ProcessIo>, now: DateTime<Utc>) {
        self.by_pid = sample.into_iter().map(|io| (io.pid, (io, now))).collect();
    }

    /// Totals grouped by image name.
    pub fn by_process(&self) -> BTreeMap<String, ProcessTraffic> {
        let mut totals: BTreeMap<String, ProcessTraffic> = BTreeMap::new();
        for (io, updated_at) in self.by_pid.values() {
            let entry = totals
                .entry(io.name.clone())
                .or_insert_with(|| ProcessTraffic {
                    process_name: io.name.clone(),
                    processes: 0,
                    bytes_sent: 0,
                    bytes_received: 0,
                    updated_at: *updated_at,
                });
            entry.processes += 1;
            entry.bytes_sent = entry.bytes_sent.saturating_add(io.bytes_written);
            entry.bytes_received = entry.bytes_received.saturating_add(io.bytes_read);
            entry.updated_at = entry.updated_at.max(*updated_at);
        }
        totals
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_pid.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::Protocol;

    fn established(pid: u32, remote: &str, port: u16) -> ConnectionInfo {
        ConnectionInfo {
            pid,
            process_name: Some("chrome.exe".to_string()),
            protocol: Protocol::Tcp,
            local_address: "10.0.0.5".to_string(),
            local_port: 50000,
            remote_address: remote.to_string(),
            remote_port: port,
            state: "Established".to_string(),
        }
    }

    fn io(pid: u32, name: &str, read: u64, written: u64) -> ProcessIo {
        ProcessIo {
            pid,
            name: name.to_string(),
            bytes_read: read,
            bytes_written: written,
        }
    }

    #[test]
    fn test_record_skips_known_and_unestablished() {
        let mut log = ConnectionLog::default();
        let now = Utc::now();
        let listener = ConnectionInfo {
            state: "Listen".to_string(),
            ..established(4, "0.0.0.0", 0)
        };

        let added = log.record(
            &[
                established(10, "142.250.74.46", 443),
                established(10, "142.250.74.46", 443),
                listener,
            ],
            now,
        );
        assert_eq!(added.len(), 1);

        // Same endpoint from another process is a new entry
        let added = log.record(
            &[
                established(10, "142.250.74.46", 443),
                established(11, "142.250.74.46", 443),
            ],
            now,
        );
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].connection.pid, 11);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_log_keeps_most_recent() {
        let mut log = ConnectionLog::with_capacity(3);
        let sample: Vec<ConnectionInfo> = (1..=5)
            .map(|i| established(i, &format!("10.1.0.{}", i), 443))
            .collect();

        log.record(&sample, Utc::now());

        assert_eq!(log.len(), 3);
        let pids: Vec<u32> = log.recent(10).iter().map(|r| r.connection.pid).collect();
        assert_eq!(pids, vec![3, 4, 5]);
        let pids: Vec<u32> = log.recent(2).iter().map(|r| r.connection.pid).collect();
        assert_eq!(pids, vec![4, 5]);
    }

    #[test]
    fn test_default_capacity_bound() {
        let mut log = ConnectionLog::default();
        for batch in 0..3u32 {
            let sample: Vec<ConnectionInfo> = (0..500u32)
                .map(|i| established(batch * 500 + i, "10.2.0.1", 443))
                .collect();
            log.record(&sample, Utc::now());
        }
        assert_eq!(log.len(), CONNECTION_LOG_CAPACITY);
        assert_eq!(log.recent(1)[0].connection.pid, 1499);
    }

    #[test]
    fn test_traffic_grouped_by_name() {
        let mut table = TrafficTable::default();
        table.update(
            vec![
                io(10, "chrome.exe", 100, 10),
                io(11, "chrome.exe", 50, 5),
                io(20, "teams.exe", 7, 3),
            ],
            Utc::now(),
        );

        let totals = table.by_process();
        assert_eq!(totals["chrome.exe"].processes, 2);
        assert_eq!(totals["chrome.exe"].bytes_received, 150);
        assert_eq!(totals["chrome.exe"].bytes_sent, 15);
        assert_eq!(totals["teams.exe"].bytes_sent, 3);
    }

    #[test]
    fn test_traffic_drops_exited_processes() {
        let mut table = TrafficTable::default();
        table.update(vec![io(10, "chrome.exe", 1, 1), io(20, "teams.exe", 1, 1)], Utc::now());
        table.update(vec![io(20, "teams.exe", 9, 9)], Utc::now());

        assert_eq!(table.len(), 1);
        assert!(!table.by_process().contains_key("chrome.exe"));
        assert_eq!(table.by_process()["teams.exe"].bytes_received, 9);
    }
}
