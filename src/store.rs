//! The persistent store (§6 "Persistent state"): a single JSON file under
//! the per-user config directory holding `{address: {uuid, family}}`,
//! atomically replaced on every update so a crash mid-write never corrupts
//! previously-persisted registrations.

use crate::bdaddr::BDAddr;
use crate::error::{Error, Result};
use crate::model::{Family, RegistrationRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    uuid: String,
    family: Family,
}

/// File-backed implementation of the external collaborator §1 calls "a
/// persistent store": holds only the registration UUID per device address.
pub struct PersistentStore {
    path: PathBuf,
}

impl PersistentStore {
    /// `<config dir>/tuhi/registrations.json`, matching the teacher's
    /// convention of namespacing its persisted state under a per-app
    /// subdirectory of the XDG config home.
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| {
            Error::Store("could not determine per-user config directory".into())
        })?;
        Ok(base.join("tuhi").join("registrations.json"))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Self::default_path()?))
    }

    pub fn load(&self) -> Result<Vec<RegistrationRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&self.path)?;
        let raw: HashMap<String, StoredRecord> = serde_json::from_slice(&bytes)?;
        let mut out = Vec::with_capacity(raw.len());
        for (addr, record) in raw {
            let address: BDAddr = addr.parse()?;
            let uuid = parse_hex_uuid(&record.uuid)
                .ok_or_else(|| Error::Store(format!("malformed uuid for {addr}")))?;
            out.push(RegistrationRecord {
                address,
                uuid,
                family: record.family,
            });
        }
        Ok(out)
    }

    /// Replaces the whole file with `records`, via a temp file + rename so
    /// a concurrent reader never observes a partially-written file.
    pub fn save_all(&self, records: &[RegistrationRecord]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw: HashMap<String, StoredRecord> = records
            .iter()
            .map(|r| {
                (
                    r.address.to_string(),
                    StoredRecord {
                        uuid: hex_encode(&r.uuid),
                        family: r.family,
                    },
                )
            })
            .collect();
        let json = serde_json::to_vec_pretty(&raw)?;
        atomic_write(&self.path, &json)
    }

    /// Loads the current contents, upserts `record`, and writes the whole
    /// file back out.
    pub fn persist(&self, record: RegistrationRecord) -> Result<()> {
        let mut records = self.load()?;
        if let Some(existing) = records.iter_mut().find(|r| r.address == record.address) {
            *existing = record;
        } else {
            records.push(record);
        }
        self.save_all(&records)
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp_path)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn hex_encode(bytes: &[u8; 16]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn parse_hex_uuid(s: &str) -> Option<[u8; 16]> {
    if s.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        out[i] = u8::from_str_radix(std::str::from_utf8(chunk).ok()?, 16).ok()?;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Removes its directory on drop so store tests don't leak files into
    /// the system temp dir across runs.
    struct TempGuard(PathBuf);

    impl Drop for TempGuard {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn tmp_store() -> (PersistentStore, TempGuard) {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("tuhi-store-test-{}-{n}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = PersistentStore::new(dir.join("registrations.json"));
        (store, TempGuard(dir))
    }

    #[test]
    fn round_trips_through_disk() {
        let (store, _dir) = tmp_store();
        let record = RegistrationRecord {
            address: "00:11:22:33:44:55".parse().unwrap(),
            uuid: [7u8; 16],
            family: Family::Slate,
        };
        store.persist(record.clone()).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[test]
    fn missing_file_loads_as_empty() {
        let (store, _dir) = tmp_store();
        assert_eq!(store.load().unwrap(), Vec::new());
    }

    #[test]
    fn persist_overwrites_existing_record_for_same_address() {
        let (store, _dir) = tmp_store();
        let addr: BDAddr = "00:11:22:33:44:55".parse().unwrap();
        store
            .persist(RegistrationRecord {
                address: addr,
                uuid: [1u8; 16],
                family: Family::Spark,
            })
            .unwrap();
        store
            .persist(RegistrationRecord {
                address: addr,
                uuid: [2u8; 16],
                family: Family::Spark,
            })
            .unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].uuid, [2u8; 16]);
    }
}
