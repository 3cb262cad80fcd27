//! Durable per-number credential storage.
//!
//! Each phone number gets its own sled database under
//! `<root>/<digits>/`, so one number's store can be deleted or fail without
//! touching another. Inside a database the account metadata lives under
//! `meta` (postcard) and every key blob under `key/<name>`.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    dashmap::{DashMap, mapref::entry::Entry},
    serde::{Deserialize, Serialize},
    tokio::sync::Mutex,
    tracing::{debug, info},
};

use crate::{
    error::Result,
    identity::Identity,
    types::{CredentialBundle, CredentialUpdate, KeyMaterial},
};

const META_KEY: &[u8] = b"meta";
const KEY_PREFIX: &[u8] = b"key/";

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredMeta {
    registered: bool,
    me: Option<String>,
}

fn key_path(name: &str) -> Vec<u8> {
    let mut path = KEY_PREFIX.to_vec();
    path.extend_from_slice(name.as_bytes());
    path
}

/// Credential storage rooted at one directory, one database per number.
///
/// Reads and writes for the same number are serialized; different numbers
/// never wait on each other.
pub struct CredentialStore {
    root: PathBuf,
    dbs: DashMap<Identity, sled::Db>,
    locks: DashMap<Identity, Arc<Mutex<()>>>,
}

impl CredentialStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            dbs: DashMap::new(),
            locks: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, identity: &Identity) -> PathBuf {
        self.root.join(identity.as_str())
    }

    fn lock_for(&self, identity: &Identity) -> Arc<Mutex<()>> {
        self.locks.entry(identity.clone()).or_default().clone()
    }

    /// Forget `identity`'s lock once no caller holds it.
    fn prune_lock(&self, identity: &Identity) {
        self.locks.remove_if(identity, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn db(&self, identity: &Identity) -> Result<sled::Db> {
        match self.dbs.entry(identity.clone()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(e) => {
                let db = sled::open(self.dir(identity))?;
                e.insert(db.clone());
                Ok(db)
            },
        }
    }

    /// The database for `identity` if one exists. Never creates one.
    fn existing_db(&self, identity: &Identity) -> Result<Option<sled::Db>> {
        if let Some(db) = self.dbs.get(identity) {
            return Ok(Some(db.clone()));
        }
        if !self.dir(identity).is_dir() {
            return Ok(None);
        }
        self.db(identity).map(Some)
    }

    fn read_meta(db: &sled::Db) -> Result<StoredMeta> {
        match db.get(META_KEY)? {
            Some(raw) => Ok(postcard::from_bytes(&raw)?),
            None => Ok(StoredMeta::default()),
        }
    }

    /// Load the bundle for `identity`. A number with nothing stored gets an
    /// empty unregistered bundle and nothing is written to disk.
    pub async fn load(&self, identity: &Identity) -> Result<CredentialBundle> {
        let lock = self.lock_for(identity);
        let guard = lock.lock().await;

        let Some(db) = self.existing_db(identity)? else {
            drop(guard);
            drop(lock);
            self.prune_lock(identity);
            return Ok(CredentialBundle::default());
        };
        let meta = Self::read_meta(&db)?;
        let mut keys = BTreeMap::new();
        for item in db.scan_prefix(KEY_PREFIX) {
            let (path, value) = item?;
            let name = String::from_utf8_lossy(&path[KEY_PREFIX.len()..]).into_owned();
            keys.insert(name, KeyMaterial(value.to_vec()));
        }

        Ok(CredentialBundle {
            registered: meta.registered,
            me: meta.me,
            keys,
        })
    }

    /// Persist a credential change. Returns once the write is flushed to disk.
    pub async fn on_update(&self, identity: &Identity, update: &CredentialUpdate) -> Result<()> {
        let lock = self.lock_for(identity);
        let _guard = lock.lock().await;

        let db = self.db(identity)?;
        let mut meta = Self::read_meta(&db)?;
        if let Some(registered) = update.registered {
            meta.registered = registered;
        }
        if let Some(me) = &update.me {
            meta.me = Some(me.clone());
        }

        let mut batch = sled::Batch::default();
        batch.insert(META_KEY, postcard::to_allocvec(&meta)?);
        for (name, value) in &update.keys {
            match value {
                Some(material) => batch.insert(key_path(name), material.0.clone()),
                None => batch.remove(key_path(name)),
            }
        }
        db.apply_batch(batch)?;

        let flushed = tokio::task::spawn_blocking(move || db.flush())
            .await
            .map_err(io::Error::from)??;
        debug!(
            identity = %identity,
            keys = update.keys.len(),
            bytes = flushed,
            "persisted credential update"
        );
        Ok(())
    }

    /// Delete everything stored for `identity`. The next [`load`](Self::load)
    /// returns an empty bundle.
    pub async fn reset(&self, identity: &Identity) -> Result<()> {
        let removed = {
            let lock = self.lock_for(identity);
            let _guard = lock.lock().await;

            // Close the database before removing its files.
            if let Some((_, db)) = self.dbs.remove(identity) {
                drop(db);
            }
            tokio::fs::remove_dir_all(self.dir(identity)).await
        };
        self.prune_lock(identity);

        match removed {
            Ok(()) => {
                info!(identity = %identity, "deleted stored credentials");
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Numbers that have a store on disk.
    pub fn identities(&self) -> Result<Vec<Identity>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && let Ok(identity) = Identity::parse(name)
                && identity.as_str() == name
            {
                found.push(identity);
            }
        }
        found.sort();
        Ok(found)
    }
}
