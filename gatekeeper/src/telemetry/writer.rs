use std::{
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rusqlite::{Connection, Transaction, params};
use tracing::{debug, error, warn};

use crate::error::StoreError;

use super::Protocol;

/// A `log` row, already packed for storage.
#[derive(Clone, Debug)]
pub struct LogRow {
    pub local_addr: u32,
    pub local_port: u16,
    pub remote_addr: u32,
    pub remote_port: u16,
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub protocol: Protocol,
    pub server_name: String,
    pub created_at_ms: i64,
}

/// Additive usage for one (client, destination) in one bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageDelta {
    pub client_ip: String,
    pub account_id: u32,
    pub client_id: u32,
    pub destination: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Clone, Debug)]
pub struct UsageBatch {
    pub bucket_start_ms: i64,
    pub bucket_end_ms: i64,
    pub deltas: Vec<UsageDelta>,
}

pub enum WriterCommand {
    Insert(LogRow),
    Usage(UsageBatch),
    /// Commit the open transaction now.
    FlushBarrier,
    /// Fires once every command queued before it has been applied.
    Signal(Sender<()>),
}

const INSERT_LOG: &str = "INSERT INTO log (
        local_addr, local_port, remote_addr, remote_port,
        sent_bytes, received_bytes, protocol, server_name, created_at
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

const UPSERT_USAGE: &str = "INSERT INTO usage (
        client_ip, account_id, client_id, destination,
        bucket_start, bucket_end, bytes_in, bytes_out
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT (client_ip, destination, bucket_start) DO UPDATE SET
        bytes_in = bytes_in + excluded.bytes_in,
        bytes_out = bytes_out + excluded.bytes_out,
        account_id = excluded.account_id,
        client_id = excluded.client_id";

pub fn spawn_writer(
    conn: Connection,
    commands: Receiver<WriterCommand>,
    commit_interval: Duration,
) -> Result<thread::JoinHandle<()>, StoreError> {
    thread::Builder::new()
        .name("telemetry-writer".into())
        .spawn(move || {
            debug!("telemetry writer started");
            run_writer(conn, commands, commit_interval);
            debug!("telemetry writer stopped");
        })
        .map_err(StoreError::Spawn)
}

/// Applies commands inside one transaction at a time, committing when the
/// interval elapses, on a flush barrier, and when every sender is gone.
fn run_writer(mut conn: Connection, commands: Receiver<WriterCommand>, commit_interval: Duration) {
    loop {
        let tx = match conn.transaction() {
            Ok(tx) => tx,
            Err(err) => {
                error!(error = %err, "failed to begin telemetry transaction");
                return;
            }
        };

        let deadline = Instant::now() + commit_interval;
        let mut open = true;
        loop {
            match commands.recv_deadline(deadline) {
                Ok(WriterCommand::Insert(row)) => {
                    if let Err(err) = insert_log(&tx, &row) {
                        warn!(error = %err, "failed to insert telemetry row");
                    }
                }
                Ok(WriterCommand::Usage(batch)) => {
                    if let Err(err) = upsert_usage(&tx, &batch) {
                        warn!(error = %err, "failed to merge usage");
                    }
                }
                Ok(WriterCommand::FlushBarrier) => break,
                Ok(WriterCommand::Signal(done)) => {
                    let _ = done.send(());
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    open = false;
                    break;
                }
            }
            // A queue that never runs dry never times out.
            if Instant::now() >= deadline {
                break;
            }
        }

        if let Err(err) = tx.commit() {
            warn!(error = %err, "failed to commit telemetry");
        }
        if !open {
            return;
        }
    }
}

fn insert_log(tx: &Transaction<'_>, row: &LogRow) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare_cached(INSERT_LOG)?;
    stmt.execute(params![
        row.local_addr,
        row.local_port,
        row.remote_addr,
        row.remote_port,
        row.sent_bytes as i64,
        row.received_bytes as i64,
        row.protocol.as_str(),
        row.server_name,
        row.created_at_ms,
    ])?;
    Ok(())
}

fn upsert_usage(tx: &Transaction<'_>, batch: &UsageBatch) -> rusqlite::Result<()> {
    let mut stmt = tx.prepare_cached(UPSERT_USAGE)?;
    for delta in &batch.deltas {
        stmt.execute(params![
            delta.client_ip,
            delta.account_id,
            delta.client_id,
            delta.destination,
            batch.bucket_start_ms,
            batch.bucket_end_ms,
            delta.bytes_in as i64,
            delta.bytes_out as i64,
        ])?;
    }
    Ok(())
}
