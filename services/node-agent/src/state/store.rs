//! SQLite-backed record store.
//!
//! Address lists are stored as JSON text columns; the last committed VM is
//! kept as a JSON document next to the instance it belongs to.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use stratus_id::{DiskId, NetworkId, VmId};
use stratus_networking::{Ipv4Prefix, Ipv6Prefix};
use tokio::sync::Mutex;
use tracing::debug;

use super::{RecordStore, StoreError};
use crate::vm::{
    DiskRecord, Instance, InstanceState, PrivateAddresses, VirtualMachine, VirtualNetwork, VmState,
};

/// SQLite record store.
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

impl SqliteRecordStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace an instance record.
    pub async fn upsert_instance(&self, inst: &Instance) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO instances (id, name, image, init_disk_size, image_backing, vnc_password,
                                   state, vm_state, private_ips, private_ips6, host_ips,
                                   created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                image = excluded.image,
                init_disk_size = excluded.init_disk_size,
                image_backing = excluded.image_backing,
                vnc_password = excluded.vnc_password,
                state = excluded.state,
                vm_state = excluded.vm_state,
                private_ips = excluded.private_ips,
                private_ips6 = excluded.private_ips6,
                host_ips = excluded.host_ips,
                updated_at = excluded.updated_at
            "#,
            params![
                inst.id.to_string(),
                inst.name,
                inst.image.to_string(),
                inst.init_disk_size,
                inst.image_backing,
                inst.vnc_password,
                inst.state.as_str(),
                inst.vm_state.as_str(),
                to_json(&inst.private_ips)?,
                to_json(&inst.private_ips6)?,
                to_json(&inst.host_ips)?,
                now,
            ],
        )?;
        Ok(())
    }

    /// Insert or replace a virtual network.
    pub async fn upsert_network(&self, network: &VirtualNetwork) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO networks (id, vlan_id, subnet, subnet6) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                vlan_id = excluded.vlan_id,
                subnet = excluded.subnet,
                subnet6 = excluded.subnet6
            "#,
            params![
                network.id.to_string(),
                network.vlan_id,
                network.subnet.to_string(),
                network.subnet6.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Last VM committed on an instance.
    pub async fn committed_vm(&self, id: &VmId) -> Result<Option<VirtualMachine>, StoreError> {
        let conn = self.conn.lock().await;
        let data: Option<Option<String>> = conn
            .query_row(
                "SELECT vm FROM instances WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match data.flatten() {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::Invalid(format!("vm document: {}", e))),
            None => Ok(None),
        }
    }

    /// Number of disk records.
    pub async fn disk_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM disks", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS instances (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            image TEXT NOT NULL,
            init_disk_size INTEGER NOT NULL,
            image_backing INTEGER NOT NULL DEFAULT 0,
            vnc_password TEXT,
            state TEXT NOT NULL,
            vm_state TEXT NOT NULL,
            vm TEXT,
            private_ips TEXT NOT NULL DEFAULT '[]',
            private_ips6 TEXT NOT NULL DEFAULT '[]',
            host_ips TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS disks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            instance TEXT,
            source_instance TEXT NOT NULL,
            image TEXT NOT NULL,
            disk_index INTEGER NOT NULL,
            size INTEGER NOT NULL,
            backing INTEGER NOT NULL DEFAULT 0,
            backing_image TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_disks_instance ON disks(instance, disk_index);

        CREATE TABLE IF NOT EXISTS networks (
            id TEXT PRIMARY KEY,
            vlan_id INTEGER NOT NULL,
            subnet TEXT NOT NULL,
            subnet6 TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS address_leases (
            pool TEXT NOT NULL,
            address TEXT NOT NULL,
            vm_id TEXT NOT NULL,
            PRIMARY KEY (pool, address),
            UNIQUE (pool, vm_id)
        );
        "#,
    )?;

    debug!("Record store schema initialized");
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Invalid(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(column: &str, raw: &str) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Invalid(format!("{}: {}", column, e)))
}

fn parse<T: FromStr>(column: &str, raw: &str) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Invalid(format!("{}: {:?}", column, raw)))
}

fn expect_one(changed: usize, what: impl std::fmt::Display) -> Result<(), StoreError> {
    if changed == 0 {
        return Err(StoreError::NotFound(what.to_string()));
    }
    Ok(())
}

const INSTANCE_COLUMNS: &str = "id, name, image, init_disk_size, image_backing, vnc_password, \
                                state, vm_state, private_ips, private_ips6, host_ips";

struct InstanceRow {
    id: String,
    name: String,
    image: String,
    init_disk_size: u32,
    image_backing: bool,
    vnc_password: Option<String>,
    state: String,
    vm_state: String,
    private_ips: String,
    private_ips6: String,
    host_ips: String,
}

impl InstanceRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            image: row.get(2)?,
            init_disk_size: row.get(3)?,
            image_backing: row.get(4)?,
            vnc_password: row.get(5)?,
            state: row.get(6)?,
            vm_state: row.get(7)?,
            private_ips: row.get(8)?,
            private_ips6: row.get(9)?,
            host_ips: row.get(10)?,
        })
    }

    fn into_instance(self) -> Result<Instance, StoreError> {
        Ok(Instance {
            id: parse("id", &self.id)?,
            name: self.name,
            image: parse("image", &self.image)?,
            init_disk_size: self.init_disk_size,
            image_backing: self.image_backing,
            vnc_password: self.vnc_password,
            state: InstanceState::parse(&self.state)
                .ok_or_else(|| StoreError::Invalid(format!("state: {:?}", self.state)))?,
            vm_state: VmState::parse(&self.vm_state).unwrap_or(VmState::Failed),
            private_ips: from_json("private_ips", &self.private_ips)?,
            private_ips6: from_json::<Vec<Ipv6Addr>>("private_ips6", &self.private_ips6)?,
            host_ips: from_json("host_ips", &self.host_ips)?,
        })
    }
}

const DISK_COLUMNS: &str =
    "id, name, instance, source_instance, image, disk_index, size, backing, backing_image";

struct DiskRow {
    id: String,
    name: String,
    instance: Option<String>,
    source_instance: String,
    image: String,
    index: u32,
    size: u32,
    backing: bool,
    backing_image: Option<String>,
}

impl DiskRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            instance: row.get(2)?,
            source_instance: row.get(3)?,
            image: row.get(4)?,
            index: row.get(5)?,
            size: row.get(6)?,
            backing: row.get(7)?,
            backing_image: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<DiskRecord, StoreError> {
        Ok(DiskRecord {
            id: parse("id", &self.id)?,
            name: self.name,
            instance: self
                .instance
                .as_deref()
                .map(|raw| parse("instance", raw))
                .transpose()?,
            source_instance: parse("source_instance", &self.source_instance)?,
            image: parse("image", &self.image)?,
            index: self.index,
            size: self.size,
            backing: self.backing,
            backing_image: self.backing_image.map(PathBuf::from),
        })
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn commit_vm(&self, vm: &VirtualMachine) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE instances SET vm_state = ?1, vm = ?2, updated_at = ?3 WHERE id = ?4",
            params![vm.state.as_str(), to_json(vm)?, now, vm.id.to_string()],
        )?;
        expect_one(changed, vm.id)
    }

    async fn commit_vm_state(
        &self,
        vm: &VirtualMachine,
        state: InstanceState,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE instances SET state = ?1, vm_state = ?2, vm = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                state.as_str(),
                vm.state.as_str(),
                to_json(vm)?,
                now,
                vm.id.to_string()
            ],
        )?;
        expect_one(changed, vm.id)
    }

    async fn commit_addresses(
        &self,
        id: &VmId,
        addresses: &PrivateAddresses,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE instances SET private_ips = ?1, private_ips6 = ?2, host_ips = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                to_json(&addresses.private_ips)?,
                to_json(&addresses.private_ips6)?,
                to_json(&addresses.host_ips)?,
                now,
                id.to_string()
            ],
        )?;
        expect_one(changed, id)
    }

    async fn get_instance(&self, id: &VmId) -> Result<Instance, StoreError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM instances WHERE id = ?1", INSTANCE_COLUMNS),
                params![id.to_string()],
                InstanceRow::read,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        row.into_instance()
    }

    async fn list_instances(&self) -> Result<Vec<Instance>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM instances ORDER BY created_at, id",
            INSTANCE_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], InstanceRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(InstanceRow::into_instance).collect()
    }

    async fn instance_disk(
        &self,
        instance: &VmId,
        index: u32,
    ) -> Result<Option<DiskRecord>, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!(
                "SELECT {} FROM disks WHERE instance = ?1 AND disk_index = ?2",
                DISK_COLUMNS
            ),
            params![instance.to_string(), index],
            DiskRow::read,
        )
        .optional()?
        .map(DiskRow::into_record)
        .transpose()
    }

    async fn get_disk(&self, id: &DiskId) -> Result<DiskRecord, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("SELECT {} FROM disks WHERE id = ?1", DISK_COLUMNS),
            params![id.to_string()],
            DiskRow::read,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?
        .into_record()
    }

    async fn insert_disk(&self, disk: &DiskRecord) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO disks ({}, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                DISK_COLUMNS
            ),
            params![
                disk.id.to_string(),
                disk.name,
                disk.instance.map(|id| id.to_string()),
                disk.source_instance.to_string(),
                disk.image.to_string(),
                disk.index,
                disk.size,
                disk.backing,
                disk.backing_image
                    .as_ref()
                    .map(|path| path.to_string_lossy().into_owned()),
                now,
            ],
        )?;
        Ok(())
    }

    async fn delete_disk(&self, id: &DiskId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute("DELETE FROM disks WHERE id = ?1", params![id.to_string()])?;
        expect_one(changed, id)
    }

    async fn detach_disk(&self, id: &DiskId) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE disks SET instance = NULL WHERE id = ?1",
            params![id.to_string()],
        )?;
        expect_one(changed, id)
    }

    async fn get_network(&self, id: &NetworkId) -> Result<VirtualNetwork, StoreError> {
        let conn = self.conn.lock().await;
        let (vlan_id, subnet, subnet6): (u16, String, String) = conn
            .query_row(
                "SELECT vlan_id, subnet, subnet6 FROM networks WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        Ok(VirtualNetwork {
            id: *id,
            vlan_id,
            subnet: Ipv4Prefix::from_cidr(&subnet)
                .map_err(|e| StoreError::Invalid(format!("subnet: {}", e)))?,
            subnet6: Ipv6Prefix::from_cidr(&subnet6)
                .map_err(|e| StoreError::Invalid(format!("subnet6: {}", e)))?,
        })
    }

    async fn lease_address(
        &self,
        pool: &str,
        vm: &VmId,
        subnet: &Ipv4Prefix,
        reserved: &[Ipv4Addr],
    ) -> Result<Ipv4Addr, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let vm_id = vm.to_string();

        let existing: Option<String> = tx
            .query_row(
                "SELECT address FROM address_leases WHERE pool = ?1 AND vm_id = ?2",
                params![pool, vm_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(raw) = existing {
            let addr: Ipv4Addr = parse("address", &raw)?;
            if subnet.contains(addr) {
                return Ok(addr);
            }
            tx.execute(
                "DELETE FROM address_leases WHERE pool = ?1 AND vm_id = ?2",
                params![pool, vm_id],
            )?;
        }

        let taken = {
            let mut stmt = tx.prepare("SELECT address FROM address_leases WHERE pool = ?1")?;
            let rows = stmt
                .query_map(params![pool], |row| row.get::<_, String>(0))?
                .collect::<Result<HashSet<_>, _>>()?;
            rows
        };

        let addr = subnet
            .hosts()
            .find(|addr| !reserved.contains(addr) && !taken.contains(&addr.to_string()))
            .ok_or_else(|| StoreError::Exhausted(format!("{} ({})", pool, subnet)))?;

        tx.execute(
            "INSERT INTO address_leases (pool, address, vm_id) VALUES (?1, ?2, ?3)",
            params![pool, addr.to_string(), vm_id],
        )?;
        tx.commit()?;

        debug!(pool = %pool, vm_id = %vm, address = %addr, "Leased address");
        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_id::ImageId;

    fn instance() -> Instance {
        Instance::new(VmId::new(), "web-1", ImageId::new())
    }

    #[tokio::test]
    async fn test_instance_roundtrip() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let mut inst = instance();
        inst.vnc_password = Some("secret".to_string());
        store.upsert_instance(&inst).await.unwrap();

        assert_eq!(store.get_instance(&inst.id).await.unwrap(), inst);
        assert_eq!(store.list_instances().await.unwrap(), vec![inst]);
    }

    #[tokio::test]
    async fn test_commits_on_missing_instance_are_not_found() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let vm = VirtualMachine::new(VmId::new(), ImageId::new(), NetworkId::new());

        assert!(store.commit_vm(&vm).await.unwrap_err().is_not_found());
        assert!(store
            .commit_vm_state(&vm, InstanceState::Cleanup)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store
            .commit_addresses(&vm.id, &PrivateAddresses::default())
            .await
            .unwrap_err()
            .is_not_found());
        assert!(store.get_instance(&vm.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_commit_vm_state() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let inst = instance();
        store.upsert_instance(&inst).await.unwrap();

        let mut vm = VirtualMachine::new(inst.id, inst.image, NetworkId::new());
        vm.state = VmState::Failed;
        store
            .commit_vm_state(&vm, InstanceState::Cleanup)
            .await
            .unwrap();

        let stored = store.get_instance(&inst.id).await.unwrap();
        assert_eq!(stored.state, InstanceState::Cleanup);
        assert_eq!(stored.vm_state, VmState::Failed);
        assert_eq!(store.committed_vm(&inst.id).await.unwrap(), Some(vm));
    }

    #[tokio::test]
    async fn test_disk_lifecycle() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let owner = VmId::new();
        let disk = DiskRecord {
            id: DiskId::new(),
            name: "web-1".to_string(),
            instance: Some(owner),
            source_instance: owner,
            image: ImageId::new(),
            index: 0,
            size: 10,
            backing: true,
            backing_image: Some(PathBuf::from("/var/lib/stratus/images/base.qcow2")),
        };
        store.insert_disk(&disk).await.unwrap();

        assert_eq!(store.instance_disk(&owner, 0).await.unwrap(), Some(disk.clone()));
        assert_eq!(store.instance_disk(&owner, 1).await.unwrap(), None);

        store.detach_disk(&disk.id).await.unwrap();
        assert_eq!(store.get_disk(&disk.id).await.unwrap().instance, None);
        assert_eq!(store.instance_disk(&owner, 0).await.unwrap(), None);

        store.delete_disk(&disk.id).await.unwrap();
        assert!(store.delete_disk(&disk.id).await.unwrap_err().is_not_found());
        assert!(store.detach_disk(&disk.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_network_roundtrip() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let network = VirtualNetwork {
            id: NetworkId::new(),
            vlan_id: 101,
            subnet: Ipv4Prefix::from_cidr("10.196.0.0/24").unwrap(),
            subnet6: Ipv6Prefix::from_cidr("fd00:10::/64").unwrap(),
        };
        store.upsert_network(&network).await.unwrap();
        assert_eq!(store.get_network(&network.id).await.unwrap(), network);
        assert!(store
            .get_network(&NetworkId::new())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_leases_are_sticky_and_unique() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let subnet = Ipv4Prefix::from_cidr("10.196.0.0/29").unwrap();
        let gateway = subnet.first_host();
        let (a, b) = (VmId::new(), VmId::new());

        let addr_a = store.lease_address("net", &a, &subnet, &[gateway]).await.unwrap();
        let addr_b = store.lease_address("net", &b, &subnet, &[gateway]).await.unwrap();
        assert_eq!(addr_a, Ipv4Addr::new(10, 196, 0, 2));
        assert_eq!(addr_b, Ipv4Addr::new(10, 196, 0, 3));
        assert_eq!(
            store.lease_address("net", &a, &subnet, &[gateway]).await.unwrap(),
            addr_a
        );

        // Pools are independent
        assert_eq!(
            store.lease_address("other", &b, &subnet, &[gateway]).await.unwrap(),
            addr_a
        );
    }

    #[tokio::test]
    async fn test_lease_exhaustion() {
        let store = SqliteRecordStore::open_in_memory().unwrap();
        let subnet = Ipv4Prefix::from_cidr("10.196.0.0/30").unwrap();
        let gateway = subnet.first_host();

        store
            .lease_address("tiny", &VmId::new(), &subnet, &[gateway])
            .await
            .unwrap();
        let err = store
            .lease_address("tiny", &VmId::new(), &subnet, &[gateway])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Exhausted(_)));
    }
}
