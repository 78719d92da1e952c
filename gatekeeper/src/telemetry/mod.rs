//! Append-only traffic telemetry in SQLite.
//!
//! Writes are queued to a dedicated writer thread that batches them into
//! transactions; reads go through a second connection and only see
//! committed rows.

mod writer;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    sync::Mutex,
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use rusqlite::{Connection, Statement, params_from_iter, types::Value};
use serde::Serialize;

use crate::config::{STATEMENT_CACHE_ARITY, WRITER_QUEUE_CAPACITY};
use crate::error::StoreError;
use crate::model::pack_ipv4;

pub use writer::{UsageBatch, UsageDelta};
use writer::{LogRow, WriterCommand};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        local_addr INTEGER NOT NULL,
        local_port INTEGER NOT NULL,
        remote_addr INTEGER NOT NULL,
        remote_port INTEGER NOT NULL,
        sent_bytes INTEGER NOT NULL,
        received_bytes INTEGER NOT NULL,
        protocol TEXT NOT NULL CHECK (protocol IN ('tcp', 'http', 'tls')),
        server_name TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_log_local_created ON log(local_addr, created_at);

    CREATE TABLE IF NOT EXISTS usage (
        client_ip TEXT NOT NULL,
        account_id INTEGER NOT NULL,
        client_id INTEGER NOT NULL,
        destination TEXT NOT NULL,
        bucket_start INTEGER NOT NULL,
        bucket_end INTEGER NOT NULL,
        bytes_in INTEGER NOT NULL DEFAULT 0,
        bytes_out INTEGER NOT NULL DEFAULT 0,
        UNIQUE (client_ip, destination, bucket_start)
    );
";

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Http,
    Tls,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Http => "http",
            Protocol::Tls => "tls",
        }
    }
}

/// One observed connection.
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub protocol: Protocol,
    /// Peer label; defaults to `"<remote ip>:<remote port>"` when empty.
    pub server_name: String,
    pub started_at: DateTime<Utc>,
}

impl LogEntry {
    fn into_row(self) -> LogRow {
        let server_name = if self.server_name.is_empty() {
            format!("{}:{}", self.remote.ip(), self.remote.port())
        } else {
            self.server_name
        };
        LogRow {
            local_addr: pack_ipv4(self.local.ip()),
            local_port: self.local.port(),
            remote_addr: pack_ipv4(self.remote.ip()),
            remote_port: self.remote.port(),
            sent_bytes: self.sent_bytes,
            received_bytes: self.received_bytes,
            protocol: self.protocol,
            server_name,
            created_at_ms: self.started_at.timestamp_millis(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccessLog {
    pub server_name: String,
    pub sent: u64,
    pub received: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub client_ip: String,
    pub account_id: u32,
    pub client_id: u32,
    pub destination: String,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

pub struct TelemetryStore {
    commands: Option<Sender<WriterCommand>>,
    reader: Mutex<Connection>,
    writer: Option<thread::JoinHandle<()>>,
}

impl TelemetryStore {
    pub fn open(path: &Path, commit_interval: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        let reader = Connection::open(path)?;
        reader.set_prepared_statement_cache_capacity(2 * STATEMENT_CACHE_ARITY + 4);

        let (tx, rx) = crossbeam_channel::bounded(WRITER_QUEUE_CAPACITY);
        let writer = writer::spawn_writer(conn, rx, commit_interval)?;

        Ok(Self {
            commands: Some(tx),
            reader: Mutex::new(reader),
            writer: Some(writer),
        })
    }

    fn send(&self, command: WriterCommand) -> Result<(), StoreError> {
        let commands = self.commands.as_ref().ok_or(StoreError::WriterGone)?;
        commands.send(command).map_err(|_| StoreError::WriterGone)
    }

    /// Queues `entry`. Entries without traffic are dropped.
    pub fn insert(&self, entry: LogEntry) -> Result<(), StoreError> {
        if entry.sent_bytes == 0 && entry.received_bytes == 0 {
            return Ok(());
        }
        self.send(WriterCommand::Insert(entry.into_row()))
    }

    /// Queues an additive merge into the usage table.
    pub fn record_usage(&self, batch: UsageBatch) -> Result<(), StoreError> {
        if batch.deltas.is_empty() {
            return Ok(());
        }
        self.send(WriterCommand::Usage(batch))
    }

    /// Blocks until everything queued so far is committed.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.send(WriterCommand::FlushBarrier)?;
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        self.send(WriterCommand::Signal(done_tx))?;
        done_rx.recv().map_err(|_| StoreError::WriterGone)
    }

    /// Top `limit` peer labels by received bytes for `clients` since `since`.
    pub fn query(
        &self,
        clients: &[IpAddr],
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AccessLog>, StoreError> {
        if clients.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT server_name, SUM(sent_bytes) AS sent, SUM(received_bytes) AS recv FROM log
             WHERE local_addr IN ({}) AND created_at >= ?
             GROUP BY server_name
             ORDER BY recv DESC
             LIMIT ?",
            placeholders(clients.len())
        );
        let mut args = client_args(clients);
        args.push(Value::Integer(since.timestamp_millis()));
        args.push(Value::Integer(limit.min(i64::MAX as usize) as i64));

        let conn = self.reader.lock().expect("telemetry reader mutex poisoned");
        let logs = with_statement(&conn, &sql, clients.len(), |stmt| {
            stmt.query_map(params_from_iter(args), |row| {
                Ok(AccessLog {
                    server_name: row.get(0)?,
                    sent: row.get::<_, i64>(1)? as u64,
                    received: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect()
        })?;
        Ok(logs)
    }

    /// Lifetime (sent, received) for `clients`.
    pub fn total(&self, clients: &[IpAddr]) -> Result<(u64, u64), StoreError> {
        if clients.is_empty() {
            return Ok((0, 0));
        }

        let sql = format!(
            "SELECT IFNULL(SUM(sent_bytes), 0), IFNULL(SUM(received_bytes), 0) FROM log
             WHERE local_addr IN ({})",
            placeholders(clients.len())
        );
        let args = client_args(clients);

        let conn = self.reader.lock().expect("telemetry reader mutex poisoned");
        let (sent, received) = with_statement(&conn, &sql, clients.len(), |stmt| {
            stmt.query_row(params_from_iter(args), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
        })?;
        Ok((sent as u64, received as u64))
    }

    /// Usage buckets for `clients` starting at or after `since`, newest first.
    pub fn usage(
        &self,
        clients: &[Ipv4Addr],
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, StoreError> {
        if clients.is_empty() {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT client_ip, account_id, client_id, destination,
                    bucket_start, bucket_end, bytes_in, bytes_out FROM usage
             WHERE client_ip IN ({}) AND bucket_start >= ?
             ORDER BY bucket_start DESC, bytes_in DESC",
            placeholders(clients.len())
        );
        let mut args: Vec<Value> = clients
            .iter()
            .map(|ip| Value::Text(ip.to_string()))
            .collect();
        args.push(Value::Integer(since.timestamp_millis()));

        let conn = self.reader.lock().expect("telemetry reader mutex poisoned");
        let records = with_statement(&conn, &sql, clients.len(), |stmt| {
            stmt.query_map(params_from_iter(args), |row| {
                Ok(UsageRecord {
                    client_ip: row.get(0)?,
                    account_id: row.get(1)?,
                    client_id: row.get(2)?,
                    destination: row.get(3)?,
                    bucket_start: millis(row.get(4)?),
                    bucket_end: millis(row.get(5)?),
                    bytes_in: row.get::<_, i64>(6)? as u64,
                    bytes_out: row.get::<_, i64>(7)? as u64,
                })
            })?
            .collect()
        })?;
        Ok(records)
    }
}

impl Drop for TelemetryStore {
    fn drop(&mut self) {
        // Closing the queue makes the writer commit and exit.
        self.commands.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn client_args(clients: &[IpAddr]) -> Vec<Value> {
    clients
        .iter()
        .map(|ip| Value::Integer(pack_ipv4(*ip) as i64))
        .collect()
}

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Small arities reuse a cached statement; large ones are prepared ad hoc so
/// the cache is not flooded with one-off shapes.
fn with_statement<T>(
    conn: &Connection,
    sql: &str,
    arity: usize,
    f: impl FnOnce(&mut Statement<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    if arity < STATEMENT_CACHE_ARITY {
        let mut stmt = conn.prepare_cached(sql)?;
        f(&mut stmt)
    } else {
        let mut stmt = conn.prepare(sql)?;
        f(&mut stmt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use tempfile::TempDir;

    const LONG: Duration = Duration::from_secs(3600);

    fn open_store() -> (TempDir, TelemetryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TelemetryStore::open(&dir.path().join("telemetry.sqlite"), LONG).unwrap();
        (dir, store)
    }

    fn entry(local: [u8; 4], label: &str, sent: u64, received: u64) -> LogEntry {
        LogEntry {
            local: SocketAddr::from((local, 40000)),
            remote: SocketAddr::from(([93, 184, 216, 34], 443)),
            sent_bytes: sent,
            received_bytes: received,
            protocol: Protocol::Tls,
            server_name: label.to_string(),
            started_at: Utc::now(),
        }
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn hundred_inserts_aggregate_to_one_row() {
        let (_dir, store) = open_store();
        let start = Utc::now() - TimeDelta::hours(1);
        for i in 0..100u64 {
            store.insert(entry([127, 0, 0, 1], "a", i, 2 * i)).unwrap();
        }
        store.flush().unwrap();

        let rows = store.query(&[localhost()], start, 10).unwrap();
        assert_eq!(
            rows,
            vec![AccessLog {
                server_name: "a".into(),
                sent: 4950,
                received: 9900
            }]
        );
        assert_eq!(store.total(&[localhost()]).unwrap(), (4950, 9900));
    }

    #[test]
    fn zero_byte_entries_are_dropped() {
        let (_dir, store) = open_store();
        store.insert(entry([127, 0, 0, 1], "a", 0, 0)).unwrap();
        store.flush().unwrap();

        let count: i64 = store
            .reader
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM log", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn empty_label_falls_back_to_remote_endpoint() {
        let (_dir, store) = open_store();
        store.insert(entry([127, 0, 0, 1], "", 5, 6)).unwrap();
        store.flush().unwrap();

        let rows = store
            .query(&[localhost()], Utc::now() - TimeDelta::hours(1), 10)
            .unwrap();
        assert_eq!(rows[0].server_name, "93.184.216.34:443");
    }

    #[test]
    fn query_orders_by_received_and_honours_limit() {
        let (_dir, store) = open_store();
        store.insert(entry([10, 8, 0, 2], "small", 1, 10)).unwrap();
        store.insert(entry([10, 8, 0, 2], "big", 1, 1000)).unwrap();
        store.insert(entry([10, 8, 0, 2], "mid", 1, 100)).unwrap();
        store.insert(entry([10, 8, 0, 3], "other", 1, 5000)).unwrap();
        store.flush().unwrap();

        let client = [IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2))];
        let since = Utc::now() - TimeDelta::hours(1);
        let rows = store.query(&client, since, 2).unwrap();
        let labels: Vec<_> = rows.iter().map(|r| r.server_name.as_str()).collect();
        assert_eq!(labels, vec!["big", "mid"]);

        let all = store.query(&client, since, 100).unwrap();
        let received: u64 = all.iter().map(|r| r.received).sum();
        assert_eq!(store.total(&client).unwrap(), (3, received));
    }

    #[test]
    fn since_filters_older_rows() {
        let (_dir, store) = open_store();
        let mut old = entry([127, 0, 0, 1], "old", 1, 1);
        old.started_at = Utc::now() - TimeDelta::days(3);
        store.insert(old).unwrap();
        store.insert(entry([127, 0, 0, 1], "new", 1, 1)).unwrap();
        store.flush().unwrap();

        let rows = store
            .query(&[localhost()], Utc::now() - TimeDelta::hours(2), 10)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].server_name, "new");
        assert_eq!(store.total(&[localhost()]).unwrap(), (2, 2));
    }

    #[test]
    fn empty_client_set_short_circuits() {
        let (_dir, store) = open_store();
        assert!(store.query(&[], Utc::now(), 10).unwrap().is_empty());
        assert_eq!(store.total(&[]).unwrap(), (0, 0));
        assert!(store.usage(&[], Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn large_client_sets_skip_the_statement_cache() {
        let (_dir, store) = open_store();
        store.insert(entry([10, 0, 0, 1], "x", 3, 4)).unwrap();
        store.flush().unwrap();

        let clients: Vec<IpAddr> = (1..=12)
            .map(|n| IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)))
            .collect();
        assert_eq!(store.total(&clients).unwrap(), (3, 4));
        let rows = store
            .query(&clients, Utc::now() - TimeDelta::hours(1), 5)
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn usage_upserts_additively() {
        let (_dir, store) = open_store();
        let start = DateTime::from_timestamp(1_700_000_000 - 1_700_000_000 % 3600, 0).unwrap();
        let batch = |bytes_in, bytes_out| UsageBatch {
            bucket_start_ms: start.timestamp_millis(),
            bucket_end_ms: (start + TimeDelta::hours(1)).timestamp_millis(),
            deltas: vec![UsageDelta {
                client_ip: "10.8.0.2".into(),
                account_id: 1,
                client_id: 7,
                destination: "1.1.1.1:443".into(),
                bytes_in,
                bytes_out,
            }],
        };
        store.record_usage(batch(100, 10)).unwrap();
        store.record_usage(batch(50, 5)).unwrap();
        store.flush().unwrap();

        let records = store
            .usage(&[Ipv4Addr::new(10, 8, 0, 2)], start - TimeDelta::hours(1))
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bytes_in, 150);
        assert_eq!(records[0].bytes_out, 15);
        assert_eq!(records[0].bucket_start, start);
        assert_eq!(records[0].bucket_end - records[0].bucket_start, TimeDelta::hours(1));
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.sqlite");
        {
            let store = TelemetryStore::open(&path, LONG).unwrap();
            store.insert(entry([127, 0, 0, 1], "a", 1, 2)).unwrap();
            // Dropping commits the open batch.
        }
        let store = TelemetryStore::open(&path, LONG).unwrap();
        assert_eq!(store.total(&[localhost()]).unwrap(), (1, 2));
    }

    #[test]
    fn timer_commits_while_queue_stays_busy() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Instant;

        let dir = tempfile::tempdir().unwrap();
        let store =
            TelemetryStore::open(&dir.path().join("telemetry.sqlite"), Duration::from_millis(50))
                .unwrap();
        let stop = AtomicBool::new(false);

        let committed = thread::scope(|scope| {
            scope.spawn(|| {
                while !stop.load(Ordering::Relaxed) {
                    store.insert(entry([127, 0, 0, 1], "busy", 1, 1)).unwrap();
                }
            });

            let give_up = Instant::now() + Duration::from_secs(10);
            let mut committed = false;
            while Instant::now() < give_up {
                if store.total(&[localhost()]).unwrap().0 > 0 {
                    committed = true;
                    break;
                }
                thread::sleep(Duration::from_millis(20));
            }
            stop.store(true, Ordering::Relaxed);
            committed
        });

        assert!(committed, "no rows visible while the writer was kept busy");
    }
}
