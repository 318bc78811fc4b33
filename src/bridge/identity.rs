use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::database::{DisappearingMessage, PortalKey};
use crate::matrix::MatrixApi;
use crate::network::{NetworkClient, UserInfo};

/// A Matrix user of the bridge.
pub struct User {
    pub mxid: String,
    double_puppet: Option<Arc<dyn MatrixApi>>,
}

impl User {
    pub fn new(mxid: impl Into<String>) -> Self {
        Self {
            mxid: mxid.into(),
            double_puppet: None,
        }
    }

    pub fn with_double_puppet(mxid: impl Into<String>, intent: Arc<dyn MatrixApi>) -> Self {
        Self {
            mxid: mxid.into(),
            double_puppet: Some(intent),
        }
    }

    /// The user's own credentials used to act as them, when available.
    pub fn double_puppet(&self) -> Option<Arc<dyn MatrixApi>> {
        self.double_puppet.clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct GhostProfile {
    pub name: String,
    pub avatar_mxc: String,
}

/// A puppet Matrix identity representing one remote user.
pub struct Ghost {
    pub id: String,
    pub intent: Arc<dyn MatrixApi>,
    profile: Mutex<GhostProfile>,
}

impl Ghost {
    pub fn new(id: impl Into<String>, intent: Arc<dyn MatrixApi>) -> Self {
        Self {
            id: id.into(),
            intent,
            profile: Mutex::new(GhostProfile::default()),
        }
    }

    pub fn name(&self) -> String {
        self.profile.lock().unwrap().name.clone()
    }

    pub fn avatar_mxc(&self) -> String {
        self.profile.lock().unwrap().avatar_mxc.clone()
    }

    pub fn update_info(&self, info: &UserInfo) -> bool {
        let mut profile = self.profile.lock().unwrap();
        let mut changed = false;
        if let Some(name) = &info.name {
            if &profile.name != name {
                profile.name = name.clone();
                changed = true;
            }
        }
        if let Some(avatar) = &info.avatar_mxc {
            if &profile.avatar_mxc != avatar {
                profile.avatar_mxc = avatar.clone();
                changed = true;
            }
        }
        changed
    }
}

/// One session of a Matrix user on the remote network.
pub struct UserLogin {
    pub id: String,
    pub user: Arc<User>,
    pub client: Arc<dyn NetworkClient>,
}

impl UserLogin {
    pub fn new(id: impl Into<String>, user: Arc<User>, client: Arc<dyn NetworkClient>) -> Self {
        Self {
            id: id.into(),
            user,
            client,
        }
    }

    pub fn user_mxid(&self) -> &str {
        &self.user.mxid
    }
}

/// Lookup cache for users, ghosts and logins. The portal only consumes
/// lookups; cache maintenance lives with the surrounding bridge.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Gets or creates the ghost for a remote user id.
    async fn ghost_by_id(&self, id: &str) -> anyhow::Result<Arc<Ghost>>;

    async fn ghost_by_mxid(&self, mxid: &str) -> anyhow::Result<Option<Arc<Ghost>>>;

    async fn user_by_mxid(&self, mxid: &str) -> anyhow::Result<Option<Arc<User>>>;

    fn login_by_id(&self, id: &str) -> Option<Arc<UserLogin>>;

    fn logins_for_user(&self, mxid: &str) -> Vec<Arc<UserLogin>>;

    async fn user_logins_in_portal(&self, key: &PortalKey) -> anyhow::Result<Vec<Arc<UserLogin>>>;

    fn is_ghost_mxid(&self, mxid: &str) -> bool;
}

/// Consumer of `(room, event, expire-at)` tuples. The sweep itself runs
/// outside the portal core.
#[async_trait]
pub trait DisappearingScheduler: Send + Sync {
    async fn enqueue(&self, msg: DisappearingMessage);

    /// Starts the after-read timers for every eligible message in a room.
    async fn start_all(&self, room_mxid: &str);
}
