//! Credential staging list kept on the host between pushes.
//!
//! Edits accumulate here and travel to the device as one atomic batch.
//! The list survives an aborted sync untouched and is cleared only once
//! the device confirms a commit.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use shared::record::{CredentialRecord, SecretString};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StagingList {
    /// Records waiting for the next push, in push order.
    pub records: Vec<CredentialRecord>,
    /// Last version the device confirmed, per record id. New edits must
    /// exceed these or the device will reject them as stale.
    #[serde(default)]
    committed_versions: BTreeMap<Uuid, u32>,
}

impl StagingList {
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read staging list {}", path.display()));
            }
        };
        serde_json::from_str(&content)
            .with_context(|| format!("invalid staging list {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("failed to write staging list {}", path.display()))
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Stage one credential. An existing staged entry for the same
    /// service and username is replaced in place, keeping its id; the
    /// version always moves past anything the device has confirmed.
    pub fn stage(
        &mut self,
        service_name: String,
        username: String,
        secret: SecretString,
        icon: String,
    ) -> Uuid {
        if let Some(existing) = self
            .records
            .iter_mut()
            .find(|record| record.service_name == service_name && record.username == username)
        {
            existing.secret = secret;
            existing.icon = icon;
            return existing.id;
        }

        let id = Uuid::new_v4();
        let version = self.next_version(&id);
        self.records.push(CredentialRecord {
            id,
            service_name,
            username,
            secret,
            icon,
            last_accessed: 0,
            version,
        });
        id
    }

    /// Stage a new revision of a credential the device already holds.
    pub fn stage_update(&mut self, id: Uuid, record: CredentialRecord) {
        let version = self.next_version(&id);
        let mut record = record;
        record.id = id;
        record.version = version;
        self.records.retain(|existing| existing.id != id);
        self.records.push(record);
    }

    pub fn remove(&mut self, id: &Uuid) -> bool {
        let before = self.records.len();
        self.records.retain(|record| record.id != *id);
        self.records.len() != before
    }

    /// The device confirmed the whole batch: remember the confirmed
    /// versions and clear the list.
    pub fn mark_committed(&mut self) {
        for record in self.records.drain(..) {
            self.committed_versions.insert(record.id, record.version);
        }
    }

    fn next_version(&self, id: &Uuid) -> u32 {
        self.committed_versions
            .get(id)
            .copied()
            .unwrap_or(0)
            .saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn staging_survives_disk_round_trip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("staging.json");

        let mut staging = StagingList::default();
        let id = staging.stage(
            "example.org".into(),
            "alice".into(),
            SecretString::from("hunter2"),
            "globe".into(),
        );
        staging.save(&path).expect("save");

        let reloaded = StagingList::load(&path).expect("load");
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.records[0].id, id);
        assert_eq!(&*reloaded.records[0].secret, "hunter2");
    }

    #[test]
    fn restaging_same_service_replaces_entry() {
        let mut staging = StagingList::default();
        let first = staging.stage(
            "example.org".into(),
            "alice".into(),
            SecretString::from("old"),
            "globe".into(),
        );
        let second = staging.stage(
            "example.org".into(),
            "alice".into(),
            SecretString::from("new"),
            "globe".into(),
        );

        assert_eq!(first, second);
        assert_eq!(staging.len(), 1);
        assert_eq!(&*staging.records[0].secret, "new");
    }

    #[test]
    fn versions_advance_past_committed() {
        let mut staging = StagingList::default();
        let id = staging.stage(
            "example.org".into(),
            "alice".into(),
            SecretString::from("one"),
            "globe".into(),
        );
        assert_eq!(staging.records[0].version, 1);

        staging.mark_committed();
        assert!(staging.is_empty());

        let update = CredentialRecord {
            id,
            service_name: "example.org".into(),
            username: "alice".into(),
            secret: SecretString::from("two"),
            icon: "globe".into(),
            last_accessed: 0,
            version: 0,
        };
        staging.stage_update(id, update);
        assert_eq!(staging.records[0].version, 2);
    }

    #[test]
    fn remove_drops_only_the_named_record() {
        let mut staging = StagingList::default();
        let keep = staging.stage(
            "one.example".into(),
            "alice".into(),
            SecretString::from("a"),
            "globe".into(),
        );
        let drop = staging.stage(
            "two.example".into(),
            "bob".into(),
            SecretString::from("b"),
            "globe".into(),
        );

        assert!(staging.remove(&drop));
        assert!(!staging.remove(&drop));
        assert_eq!(staging.len(), 1);
        assert_eq!(staging.records[0].id, keep);
    }
}
