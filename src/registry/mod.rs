// src/registry/mod.rs
//
// Registries (C8, spec.md §4.8). Three process-wide stores — hosts, bridges
// and interface-name mappings, and router metadata — each backed by one JSON
// file on a tmpfs-backed path, mutated under an OS-level advisory lock held
// only for the read-modify-write span (spec.md §5 "Locking discipline").
// Grounded on the design note in spec.md §9 ("global singletons and
// module-level config... become typed stores with a clean open/close API")
// and on the `fs2` file-lock crate as attested in the example pack's
// `auser-mvm` manifest.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::RegistryError;

/// Source-of-truth record for one pool-managed host, per spec.md §3
/// "HostRegistryEntry". `connection_type` names the subnet member count this
/// host attached to (spec.md §3 Subnet invariant), echoing the teacher's
/// pattern of carrying classification alongside raw facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRegistryEntry {
    pub name: String,
    pub primary_ip: Ipv4Addr,
    pub secondary_ips: Vec<Ipv4Addr>,
    pub connected_router: String,
    pub gateway_ip: Ipv4Addr,
    pub creation_timestamp: String,
    pub creator_tag: Option<String>,
    pub mesh_bridge: String,
    pub mesh_veth: String,
    pub connection_type: String,
}

/// `short_name <-> original_name`, kept because Linux caps interface names
/// at 15 characters (spec.md §3 "InterfaceNameMap").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceNameEntry {
    pub short_name: String,
    pub original_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterMetadata {
    pub router_type: Option<String>,
    pub role: Option<String>,
    pub declared_interfaces: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BridgeRegistryFile {
    subnet_to_bridge: HashMap<String, String>,
    interface_names: Vec<InterfaceNameEntry>,
}

/// A single JSON-file-backed map with advisory-lock-guarded
/// read-modify-write access. Every registry (`HostRegistry`, `BridgeRegistry`,
/// `RouterRegistry`) is an instance of this with a different value type,
/// mirroring the three JSON files spec.md §4.8 names.
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T> JsonFileStore<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore {
            path: path.into(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Opens (creating if absent) the backing file, takes an exclusive
    /// advisory lock, and hands the deserialized content to `f`. Whatever `f`
    /// returns is re-serialized and written back before the lock is
    /// released. The lock is held for exactly this span, never longer, per
    /// spec.md §5.
    fn with_locked<R>(
        &self,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, RegistryError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RegistryError::Io(self.path.clone(), e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| RegistryError::Io(self.path.clone(), e))?;

        file.lock_exclusive()
            .map_err(|e| RegistryError::Lock(self.path.clone(), e))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| RegistryError::Io(self.path.clone(), e))?;

        let mut value: T = if contents.trim().is_empty() {
            T::default()
        } else {
            serde_json::from_str(&contents)
                .map_err(|e| RegistryError::Corrupt(self.path.clone(), e))?
        };

        let result = f(&mut value);

        let serialized = serde_json::to_string_pretty(&value)
            .map_err(|e| RegistryError::Corrupt(self.path.clone(), e))?;
        file.set_len(0).map_err(|e| RegistryError::Io(self.path.clone(), e))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| RegistryError::Io(self.path.clone(), e))?;
        file.write_all(serialized.as_bytes())
            .map_err(|e| RegistryError::Io(self.path.clone(), e))?;

        FileExt::unlock(&file).map_err(|e| RegistryError::Lock(self.path.clone(), e))?;
        Ok(result)
    }

    /// Reads the current value without taking the exclusive lock. Callers
    /// that need a consistent read-then-write span use `with_locked`
    /// instead; this is for best-effort lookups (`get`, `all`) where a race
    /// against a concurrent writer just means a slightly stale answer.
    fn read_only(&self) -> Result<T, RegistryError> {
        if !self.path.exists() {
            return Ok(T::default());
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| RegistryError::Io(self.path.clone(), e))?;
        if contents.trim().is_empty() {
            Ok(T::default())
        } else {
            serde_json::from_str(&contents).map_err(|e| RegistryError::Corrupt(self.path.clone(), e))
        }
    }
}

/// Host registry: `name -> HostRegistryEntry`.
pub struct HostRegistry {
    store: JsonFileStore<HashMap<String, HostRegistryEntry>>,
}

impl HostRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        HostRegistry {
            store: JsonFileStore::new(path),
        }
    }

    pub fn upsert(&self, entry: HostRegistryEntry) -> Result<(), RegistryError> {
        self.store
            .with_locked(|map| {
                map.insert(entry.name.clone(), entry);
            })
    }

    pub fn remove(&self, name: &str) -> Result<Option<HostRegistryEntry>, RegistryError> {
        self.store.with_locked(|map| map.remove(name))
    }

    pub fn get(&self, name: &str) -> Result<Option<HostRegistryEntry>, RegistryError> {
        Ok(self.store.read_only()?.get(name).cloned())
    }

    pub fn all(&self) -> Result<HashMap<String, HostRegistryEntry>, RegistryError> {
        self.store.read_only()
    }
}

/// Bridge/interface registry: subnet -> bridge name, plus the short/original
/// interface-name table.
pub struct BridgeRegistry {
    store: JsonFileStore<BridgeRegistryFile>,
}

impl BridgeRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        BridgeRegistry {
            store: JsonFileStore::new(path),
        }
    }

    pub fn set_bridge(&self, subnet: &str, bridge_name: &str) -> Result<(), RegistryError> {
        self.store.with_locked(|file| {
            file.subnet_to_bridge
                .insert(subnet.to_string(), bridge_name.to_string());
        })
    }

    pub fn bridge_for(&self, subnet: &str) -> Result<Option<String>, RegistryError> {
        Ok(self.store.read_only()?.subnet_to_bridge.get(subnet).cloned())
    }

    pub fn register_interface_name(
        &self,
        short_name: &str,
        original_name: &str,
    ) -> Result<(), RegistryError> {
        self.store.with_locked(|file| {
            if !file.interface_names.iter().any(|e| e.short_name == short_name) {
                file.interface_names.push(InterfaceNameEntry {
                    short_name: short_name.to_string(),
                    original_name: original_name.to_string(),
                });
            }
        })
    }

    pub fn original_name_for(&self, short_name: &str) -> Result<Option<String>, RegistryError> {
        Ok(self
            .store
            .read_only()?
            .interface_names
            .into_iter()
            .find(|e| e.short_name == short_name)
            .map(|e| e.original_name))
    }
}

/// Router registry: `router_name -> RouterMetadata`.
pub struct RouterRegistry {
    store: JsonFileStore<HashMap<String, RouterMetadata>>,
}

impl RouterRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RouterRegistry {
            store: JsonFileStore::new(path),
        }
    }

    pub fn upsert(&self, name: &str, metadata: RouterMetadata) -> Result<(), RegistryError> {
        self.store
            .with_locked(|map| {
                map.insert(name.to_string(), metadata);
            })
    }

    pub fn get(&self, name: &str) -> Result<Option<RouterMetadata>, RegistryError> {
        Ok(self.store.read_only()?.get(name).cloned())
    }

    pub fn all(&self) -> Result<HashMap<String, RouterMetadata>, RegistryError> {
        self.store.read_only()
    }
}

/// The three registries constructed together against a base directory, the
/// shape `main`/the scheduler actually constructs and threads through the
/// rest of the crate.
pub struct Registries {
    pub hosts: HostRegistry,
    pub bridges: BridgeRegistry,
    pub routers: RouterRegistry,
}

impl Registries {
    pub fn open(base_dir: &Path) -> Self {
        Registries {
            hosts: HostRegistry::new(base_dir.join("hosts.json")),
            bridges: BridgeRegistry::new(base_dir.join("bridges.json")),
            routers: RouterRegistry::new(base_dir.join("routers.json")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_host(name: &str) -> HostRegistryEntry {
        HostRegistryEntry {
            name: name.to_string(),
            primary_ip: "10.0.0.1".parse().unwrap(),
            secondary_ips: vec![],
            connected_router: "r1".to_string(),
            gateway_ip: "10.0.0.254".parse().unwrap(),
            creation_timestamp: crate::progress::now_rfc3339(),
            creator_tag: Some("alice".to_string()),
            mesh_bridge: "br1001124".to_string(),
            mesh_veth: "h12345678".to_string(),
            connection_type: "bridged".to_string(),
        }
    }

    #[test]
    fn host_registry_round_trips_through_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let reg = HostRegistry::new(dir.path().join("hosts.json"));
        reg.upsert(sample_host("source-1")).unwrap();
        let fetched = reg.get("source-1").unwrap().unwrap();
        assert_eq!(fetched.connected_router, "r1");
        assert_eq!(reg.all().unwrap().len(), 1);
    }

    #[test]
    fn host_registry_remove_drops_entry() {
        let dir = tempfile::tempdir().unwrap();
        let reg = HostRegistry::new(dir.path().join("hosts.json"));
        reg.upsert(sample_host("source-1")).unwrap();
        let removed = reg.remove("source-1").unwrap();
        assert!(removed.is_some());
        assert!(reg.get("source-1").unwrap().is_none());
    }

    #[test]
    fn bridge_registry_tracks_subnet_and_interface_names() {
        let dir = tempfile::tempdir().unwrap();
        let reg = BridgeRegistry::new(dir.path().join("bridges.json"));
        reg.set_bridge("10.1.1.0/24", "br101124").unwrap();
        assert_eq!(
            reg.bridge_for("10.1.1.0/24").unwrap(),
            Some("br101124".to_string())
        );
        reg.register_interface_name("v001", "router-eth0").unwrap();
        assert_eq!(
            reg.original_name_for("v001").unwrap(),
            Some("router-eth0".to_string())
        );
    }

    #[test]
    fn router_registry_survives_reopen_against_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routers.json");
        {
            let reg = RouterRegistry::new(&path);
            reg.upsert(
                "hq-core",
                RouterMetadata {
                    router_type: Some("core".to_string()),
                    role: None,
                    declared_interfaces: vec!["eth0".to_string()],
                },
            )
            .unwrap();
        }
        let reopened = RouterRegistry::new(&path);
        let meta = reopened.get("hq-core").unwrap().unwrap();
        assert_eq!(meta.router_type.as_deref(), Some("core"));
    }

    #[test]
    fn malformed_json_surfaces_as_corrupt_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        std::fs::write(&path, "not json").unwrap();
        let reg = HostRegistry::new(&path);
        let err = reg.get("anything").unwrap_err();
        assert!(matches!(err, RegistryError::Corrupt(_, _)));
    }
}
