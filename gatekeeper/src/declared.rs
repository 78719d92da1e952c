//! Read-only view of the administrative database.

use std::{net::Ipv4Addr, path::Path};

use ipnet::Ipv4Net;
use rusqlite::{Connection, OpenFlags, OptionalExtension as _, Row, params};
use tracing::warn;

use crate::error::StoreError;
use crate::model::{ClientAccount, ClientRow, DeclaredInterface, PeerKey, clamp_rate};

const ACTIVE_INTERFACE: &str = "
    SELECT id, name, private_key, listen_port, subnet, nat_iface, external_ip, dns
    FROM interfaces
    WHERE deleted_at IS NULL
    ORDER BY id DESC
    LIMIT 1";

const ACTIVE_CLIENTS: &str = "
    SELECT clients.id, clients.account_id, clients.public_key, clients.ip_address,
           accounts.bandwidth_in_limit, accounts.bandwidth_out_limit
    FROM clients
    JOIN accounts ON accounts.id = clients.account_id
    WHERE accounts.deleted_at IS NULL
      AND clients.deleted_at IS NULL
      AND accounts.interface_id = ?1
    ORDER BY clients.id";

pub struct DeclaredStore {
    conn: Connection,
}

impl DeclaredStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    /// The newest interface that is not soft-deleted.
    pub fn interface(&self) -> Result<Option<DeclaredInterface>, StoreError> {
        let raw = self
            .conn
            .prepare_cached(ACTIVE_INTERFACE)?
            .query_row([], RawInterface::from_row)
            .optional()?;
        raw.map(RawInterface::parse).transpose()
    }

    /// Clients of live accounts on `interface_id`. Rows whose key or address
    /// does not parse are logged and left out.
    pub fn client_rows(&self, interface_id: i64) -> Result<Vec<ClientRow>, StoreError> {
        let mut stmt = self.conn.prepare_cached(ACTIVE_CLIENTS)?;
        let rows = stmt.query_map(params![interface_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut clients = Vec::new();
        for row in rows {
            let (id, account_id, public_key, ip_address, limit_in, limit_out) = row?;
            let Ok(public_key) = PeerKey::try_from(public_key.as_slice()) else {
                warn!(client = id, len = public_key.len(), "skipping client with malformed public key");
                continue;
            };
            let Ok(address) = ip_address.trim().parse::<Ipv4Addr>() else {
                warn!(client = id, address = %ip_address, "skipping client with malformed address");
                continue;
            };
            let (Ok(client_id), Ok(account_id)) = (u32::try_from(id), u32::try_from(account_id))
            else {
                warn!(client = id, account = account_id, "skipping client with out-of-range id");
                continue;
            };
            clients.push(ClientRow {
                public_key,
                address,
                account: ClientAccount {
                    client_id,
                    account_id,
                    inbound_rate: clamp_rate(limit_in),
                    outbound_rate: clamp_rate(limit_out),
                },
            });
        }
        Ok(clients)
    }
}

struct RawInterface {
    id: i64,
    name: String,
    private_key: Vec<u8>,
    listen_port: i64,
    subnet: String,
    nat_iface: Option<String>,
    external_ip: Option<String>,
    dns: Option<String>,
}

impl RawInterface {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            private_key: row.get(2)?,
            listen_port: row.get(3)?,
            subnet: row.get(4)?,
            nat_iface: row.get(5)?,
            external_ip: row.get(6)?,
            dns: row.get(7)?,
        })
    }

    fn parse(self) -> Result<DeclaredInterface, StoreError> {
        let malformed = |what, value: String| StoreError::Malformed {
            what,
            row: self.id,
            value,
        };
        let private_key = PeerKey::try_from(self.private_key.as_slice())
            .map_err(|_| malformed("private key length", self.private_key.len().to_string()))?;
        let listen_port = u16::try_from(self.listen_port)
            .map_err(|_| malformed("listen port", self.listen_port.to_string()))?;
        let subnet = self
            .subnet
            .trim()
            .parse::<Ipv4Net>()
            .map_err(|_| malformed("subnet", self.subnet.clone()))?;
        if self.name.is_empty() {
            return Err(malformed("interface name", self.name.clone()));
        }

        Ok(DeclaredInterface {
            id: self.id,
            name: self.name,
            private_key,
            listen_port,
            subnet,
            nat_iface: self.nat_iface.unwrap_or_default(),
            external_ip: self.external_ip.unwrap_or_default(),
            dns: self.dns.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) const SCHEMA: &str = "
        CREATE TABLE interfaces (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            private_key BLOB NOT NULL,
            listen_port INTEGER NOT NULL,
            subnet TEXT NOT NULL,
            nat_iface TEXT,
            external_ip TEXT,
            dns TEXT,
            deleted_at DATETIME
        );
        CREATE TABLE accounts (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            bandwidth_in_limit INTEGER NOT NULL DEFAULT 0,
            bandwidth_out_limit INTEGER NOT NULL DEFAULT 0,
            interface_id INTEGER NOT NULL,
            deleted_at DATETIME
        );
        CREATE TABLE clients (
            id INTEGER PRIMARY KEY,
            account_id INTEGER NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            public_key BLOB NOT NULL,
            ip_address TEXT NOT NULL UNIQUE,
            deleted_at DATETIME
        );
    ";

    fn fixture() -> (TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("db.sqlite")).unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        (dir, conn)
    }

    fn reader(dir: &TempDir) -> DeclaredStore {
        DeclaredStore::open(&dir.path().join("db.sqlite")).unwrap()
    }

    fn add_interface(conn: &Connection, id: i64, name: &str, deleted: bool) {
        conn.execute(
            "INSERT INTO interfaces (id, name, private_key, listen_port, subnet, nat_iface, deleted_at)
             VALUES (?1, ?2, ?3, 51820, '10.8.0.1/24', 'eth0', ?4)",
            params![id, name, vec![id as u8; 32], deleted.then_some("2024-01-01")],
        )
        .unwrap();
    }

    #[test]
    fn no_interface_is_none() {
        let (dir, _conn) = fixture();
        assert_eq!(reader(&dir).interface().unwrap(), None);
    }

    #[test]
    fn newest_live_interface_wins() {
        let (dir, conn) = fixture();
        add_interface(&conn, 1, "wg0", false);
        add_interface(&conn, 2, "wg1", false);
        add_interface(&conn, 3, "wg2", true);

        let iface = reader(&dir).interface().unwrap().unwrap();
        assert_eq!(iface.id, 2);
        assert_eq!(iface.name, "wg1");
        assert_eq!(iface.listen_port, 51820);
        assert_eq!(iface.subnet, "10.8.0.1/24".parse::<Ipv4Net>().unwrap());
        assert_eq!(iface.nat_iface, "eth0");
        assert_eq!(iface.dns, "");
        assert_eq!(iface.private_key, PeerKey::new([2; 32]));
    }

    #[test]
    fn malformed_interface_is_an_error() {
        let (dir, conn) = fixture();
        conn.execute(
            "INSERT INTO interfaces (id, name, private_key, listen_port, subnet)
             VALUES (1, 'wg0', x'0102', 51820, '10.8.0.1/24')",
            [],
        )
        .unwrap();
        let err = reader(&dir).interface().unwrap_err();
        assert!(matches!(err, StoreError::Malformed { row: 1, .. }));
    }

    #[test]
    fn client_rows_exclude_deleted_and_foreign() {
        let (dir, conn) = fixture();
        add_interface(&conn, 1, "wg0", false);
        conn.execute_batch(
            "INSERT INTO accounts (id, name, bandwidth_in_limit, bandwidth_out_limit, interface_id, deleted_at)
             VALUES (1, 'live', 125000, 250000, 1, NULL),
                    (2, 'gone', 1, 1, 1, '2024-01-01'),
                    (3, 'other', 1, 1, 9, NULL);",
        )
        .unwrap();
        let insert = |id: i64, account: i64, ip: &str, deleted: Option<&str>| {
            conn.execute(
                "INSERT INTO clients (id, account_id, public_key, ip_address, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, account, vec![id as u8; 32], ip, deleted],
            )
            .unwrap();
        };
        insert(1, 1, "10.8.0.2", None);
        insert(2, 1, "10.8.0.3", Some("2024-01-01"));
        insert(3, 2, "10.8.0.4", None);
        insert(4, 3, "10.8.0.5", None);
        insert(5, 1, "10.8.0.6", None);

        let rows = reader(&dir).client_rows(1).unwrap();
        let addresses: Vec<_> = rows.iter().map(|r| r.address.to_string()).collect();
        assert_eq!(addresses, vec!["10.8.0.2", "10.8.0.6"]);
        assert_eq!(
            rows[0].account,
            ClientAccount {
                client_id: 1,
                account_id: 1,
                inbound_rate: 125_000,
                outbound_rate: 250_000,
            }
        );
        assert_eq!(rows[1].public_key, PeerKey::new([5; 32]));
    }

    #[test]
    fn malformed_clients_are_skipped() {
        let (dir, conn) = fixture();
        add_interface(&conn, 1, "wg0", false);
        conn.execute_batch(
            "INSERT INTO accounts (id, name, bandwidth_in_limit, bandwidth_out_limit, interface_id)
             VALUES (1, 'a', -1, 10000000000, 1);
             INSERT INTO clients (id, account_id, public_key, ip_address)
             VALUES (1, 1, x'00', '10.8.0.2'),
                    (2, 1, zeroblob(32), 'not-an-ip'),
                    (3, 1, zeroblob(32), '10.8.0.4');",
        )
        .unwrap();

        let rows = reader(&dir).client_rows(1).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].address, Ipv4Addr::new(10, 8, 0, 4));
        assert_eq!(rows[0].account.inbound_rate, 0);
        assert_eq!(rows[0].account.outbound_rate, u32::MAX);
    }
}
