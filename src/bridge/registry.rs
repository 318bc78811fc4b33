use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::database::{Database, Portal as DbPortal, PortalKey};
use crate::matrix::MatrixApi;

use super::identity::{DisappearingScheduler, IdentityStore};
use super::portal::Portal;

#[derive(Default)]
struct PortalCache {
    by_key: HashMap<PortalKey, Arc<Portal>>,
    by_mxid: HashMap<String, Arc<Portal>>,
}

/// Shared bridge context: configuration, persistence, the bot intent and the
/// portal registry. Portals are created on first need and stay cached for
/// the lifetime of the process.
pub struct Bridge {
    pub config: Config,
    pub db: Database,
    pub bot: Arc<dyn MatrixApi>,
    pub identities: Arc<dyn IdentityStore>,
    pub disappearing: Arc<dyn DisappearingScheduler>,
    cache: Mutex<PortalCache>,
}

impl Bridge {
    pub fn new(
        config: Config,
        db: Database,
        bot: Arc<dyn MatrixApi>,
        identities: Arc<dyn IdentityStore>,
        disappearing: Arc<dyn DisappearingScheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            bot,
            identities,
            disappearing,
            cache: Mutex::new(PortalCache::default()),
        })
    }

    async fn load_portal(
        self: &Arc<Self>,
        cache: &mut PortalCache,
        db_portal: Option<DbPortal>,
        key: Option<&PortalKey>,
    ) -> Result<Option<Arc<Portal>>> {
        let row = match db_portal {
            Some(row) => row,
            None => {
                let Some(key) = key else {
                    return Ok(None);
                };
                let row = DbPortal::new(key);
                self.db.insert_portal(&row).await?;
                row
            }
        };
        let mxid = row.mxid.clone();
        let portal = Portal::spawn(Arc::clone(self), row);
        cache.by_key.insert(portal.key().clone(), Arc::clone(&portal));
        if let Some(mxid) = mxid {
            cache.by_mxid.insert(mxid, Arc::clone(&portal));
        }
        Ok(Some(portal))
    }

    async fn unlocked_get_portal_by_key(
        self: &Arc<Self>,
        cache: &mut PortalCache,
        key: &PortalKey,
        only_if_exists: bool,
    ) -> Result<Option<Arc<Portal>>> {
        if let Some(cached) = cache.by_key.get(key) {
            return Ok(Some(Arc::clone(cached)));
        }
        let row = self.db.get_portal_by_key(key).await?;
        let create_key = if only_if_exists { None } else { Some(key) };
        self.load_portal(cache, row, create_key).await
    }

    /// Gets the portal for a key, creating a placeholder row when absent.
    pub async fn get_portal_by_key(self: &Arc<Self>, key: &PortalKey) -> Result<Arc<Portal>> {
        let mut cache = self.cache.lock().await;
        let portal = self
            .unlocked_get_portal_by_key(&mut cache, key, false)
            .await?;
        Ok(portal.expect("portal is created when missing"))
    }

    /// Looks up a portal without creating one. When the key carries a
    /// receiver, a receiver-less portal for the same chat also matches.
    pub async fn get_existing_portal_by_key(
        self: &Arc<Self>,
        key: &PortalKey,
    ) -> Result<Option<Arc<Portal>>> {
        let mut cache = self.cache.lock().await;
        if key.receiver.is_empty() {
            return self
                .unlocked_get_portal_by_key(&mut cache, key, true)
                .await;
        }
        if let Some(cached) = cache.by_key.get(key) {
            return Ok(Some(Arc::clone(cached)));
        }
        let id_only = PortalKey::id_only(&key.id);
        if let Some(cached) = cache.by_key.get(&id_only) {
            return Ok(Some(Arc::clone(cached)));
        }
        let Some(found) = self.db.find_portal_receiver(&key.id, &key.receiver).await? else {
            return Ok(None);
        };
        self.unlocked_get_portal_by_key(&mut cache, &found, true).await
    }

    pub async fn get_portal_by_mxid(self: &Arc<Self>, mxid: &str) -> Result<Option<Arc<Portal>>> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.by_mxid.get(mxid) {
            return Ok(Some(Arc::clone(cached)));
        }
        let row = self.db.get_portal_by_mxid(mxid).await?;
        self.load_portal(&mut cache, row, None).await
    }

    /// Resolves DM vs group semantics for a chat id: exact receiver match
    /// first, then the receiver-less portal, then the database.
    pub async fn find_portal_receiver(
        &self,
        id: &str,
        maybe_receiver: &str,
    ) -> Result<Option<PortalKey>> {
        {
            let cache = self.cache.lock().await;
            let exact = PortalKey::new(id, maybe_receiver);
            if let Some(portal) = cache.by_key.get(&exact) {
                return Ok(Some(portal.key().clone()));
            }
            let id_only = PortalKey::id_only(id);
            if let Some(portal) = cache.by_key.get(&id_only) {
                return Ok(Some(portal.key().clone()));
            }
        }
        self.db.find_portal_receiver(id, maybe_receiver).await
    }

    pub async fn get_all_portals_with_mxid(self: &Arc<Self>) -> Result<Vec<Arc<Portal>>> {
        let rows = self.db.get_all_portals_with_mxid().await?;
        let mut cache = self.cache.lock().await;
        let mut output = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(cached) = cache.by_key.get(&row.key()) {
                output.push(Arc::clone(cached));
            } else if let Some(loaded) = self.load_portal(&mut cache, Some(row), None).await? {
                output.push(loaded);
            }
        }
        Ok(output)
    }

    pub(crate) async fn register_portal_mxid(&self, mxid: &str, portal: &Arc<Portal>) {
        let mut cache = self.cache.lock().await;
        cache.by_mxid.insert(mxid.to_string(), Arc::clone(portal));
    }

    pub(crate) async fn unregister_portal_mxid(&self, mxid: &str) {
        let mut cache = self.cache.lock().await;
        cache.by_mxid.remove(mxid);
    }

    pub(crate) async fn drop_portal_from_cache(&self, key: &PortalKey, mxid: Option<&str>) {
        let mut cache = self.cache.lock().await;
        cache.by_key.remove(key);
        if let Some(mxid) = mxid {
            cache.by_mxid.remove(mxid);
        }
        debug!(portal_id = %key, "Dropped portal from cache");
    }
}
