use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::database::{
    DisappearingSetting, Message as DbMessage, Portal as DbPortal, PortalKey, RoomType,
    UserPortal,
};
use crate::error::{EventError, EventResult};
use crate::matrix::{MatrixApi, MatrixEvent, MessageStatus, MessageStatusEventInfo};
use crate::network::{ChatInfo, EchoHandler, EventSender, RemoteEvent};

use super::identity::{User, UserLogin};
use super::registry::Bridge;

pub const PORTAL_EVENT_BUFFER: usize = 64;

pub(crate) enum PortalEvent {
    Matrix {
        evt: MatrixEvent,
        sender: Arc<User>,
    },
    Remote {
        evt: Box<dyn RemoteEvent>,
        source: Arc<UserLogin>,
    },
    Create {
        source: Arc<UserLogin>,
        info: Option<ChatInfo>,
        done: oneshot::Sender<EventResult<()>>,
    },
}

/// A locally-initiated send waiting for its remote echo.
pub(crate) struct OutgoingMessage {
    pub db: DbMessage,
    pub room_id: String,
    pub event_id: String,
    pub sender_mxid: String,
    pub handle: Option<EchoHandler>,
}

#[derive(Default)]
pub(crate) struct TypingState {
    pub currently: Vec<String>,
    pub logins: HashMap<String, Arc<UserLogin>>,
}

/// One bridged conversation. All mutations go through a single worker task
/// consuming the portal's mailbox, so handlers never race each other within
/// one portal while separate portals run in parallel.
pub struct Portal {
    pub bridge: Arc<Bridge>,
    key: PortalKey,
    inner: Mutex<DbPortal>,
    events: mpsc::Sender<PortalEvent>,
    pub(crate) room_create_lock: tokio::sync::Mutex<()>,
    outgoing: Mutex<HashMap<String, OutgoingMessage>>,
    pub(crate) typing: Mutex<TypingState>,
}

impl Portal {
    pub(crate) fn spawn(bridge: Arc<Bridge>, row: DbPortal) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(PORTAL_EVENT_BUFFER);
        let portal = Arc::new(Self {
            bridge,
            key: row.key(),
            inner: Mutex::new(row),
            events: tx,
            room_create_lock: tokio::sync::Mutex::new(()),
            outgoing: Mutex::new(HashMap::new()),
            typing: Mutex::new(TypingState::default()),
        });
        let worker = Arc::clone(&portal);
        tokio::spawn(async move { worker.event_loop(rx).await });
        portal
    }

    pub fn key(&self) -> &PortalKey {
        &self.key
    }

    pub fn receiver(&self) -> &str {
        &self.key.receiver
    }

    pub(crate) fn with_row<R>(&self, f: impl FnOnce(&mut DbPortal) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    pub fn db_row(&self) -> DbPortal {
        self.inner.lock().unwrap().clone()
    }

    pub fn mxid(&self) -> Option<String> {
        self.inner.lock().unwrap().mxid.clone()
    }

    pub fn name(&self) -> String {
        self.inner.lock().unwrap().name.clone()
    }

    pub fn topic(&self) -> String {
        self.inner.lock().unwrap().topic.clone()
    }

    pub fn room_type(&self) -> RoomType {
        self.inner.lock().unwrap().room_type()
    }

    pub fn other_user_id(&self) -> Option<String> {
        self.inner.lock().unwrap().other_user_id.clone()
    }

    pub fn parent_id(&self) -> Option<String> {
        self.inner.lock().unwrap().parent_id.clone()
    }

    pub fn disappear(&self) -> DisappearingSetting {
        self.inner.lock().unwrap().disappear()
    }

    pub fn relay(&self) -> Option<Arc<UserLogin>> {
        let relay_login_id = self.inner.lock().unwrap().relay_login_id.clone()?;
        self.bridge.identities.login_by_id(&relay_login_id)
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let row = self.db_row();
        self.bridge.db.update_portal(&row).await
    }

    /// Non-blocking enqueue; the event is dropped when the mailbox is full.
    pub fn enqueue_matrix_event(&self, evt: MatrixEvent, sender: Arc<User>) {
        if self
            .events
            .try_send(PortalEvent::Matrix { evt, sender })
            .is_err()
        {
            error!(portal_id = %self.key, "Portal event buffer is full");
        }
    }

    /// Non-blocking enqueue; the event is dropped when the mailbox is full.
    pub fn enqueue_remote_event(&self, evt: Box<dyn RemoteEvent>, source: Arc<UserLogin>) {
        if self
            .events
            .try_send(PortalEvent::Remote { evt, source })
            .is_err()
        {
            error!(portal_id = %self.key, "Portal event buffer is full");
        }
    }

    /// Creates the Matrix room for this portal, blocking until the create
    /// request has been processed by the portal worker. Dropping the future
    /// abandons the wait; the creation still completes inside the worker.
    pub async fn create_matrix_room(
        self: &Arc<Self>,
        source: &Arc<UserLogin>,
        info: Option<ChatInfo>,
    ) -> EventResult<()> {
        if self.mxid().is_some() {
            self.mark_login_in_portal(source).await;
            return Ok(());
        }
        let (done, wait) = oneshot::channel();
        self.events
            .send(PortalEvent::Create {
                source: Arc::clone(source),
                info,
                done,
            })
            .await
            .map_err(|_| EventError::Network("portal event loop is gone".to_string()))?;
        wait.await
            .unwrap_or_else(|_| Err(EventError::Network("room creation was abandoned".to_string())))
    }

    async fn event_loop(self: Arc<Self>, mut rx: mpsc::Receiver<PortalEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                PortalEvent::Matrix { evt, sender } => {
                    let fut =
                        std::panic::AssertUnwindSafe(self.handle_matrix_event(&sender, &evt))
                            .catch_unwind();
                    if let Err(panic) = fut.await {
                        error!(
                            portal_id = %self.key,
                            event_id = %evt.event_id,
                            panic = %panic_message(panic.as_ref()),
                            "Matrix event handler panicked"
                        );
                        if !evt.event_id.is_empty() {
                            self.send_error_status(&evt, &EventError::PanicInHandler).await;
                        }
                    }
                }
                PortalEvent::Remote { evt, source } => {
                    let fut = std::panic::AssertUnwindSafe(
                        self.handle_remote_event(&source, evt.as_ref()),
                    )
                    .catch_unwind();
                    if let Err(panic) = fut.await {
                        error!(
                            portal_id = %self.key,
                            panic = %panic_message(panic.as_ref()),
                            "Remote event handler panicked"
                        );
                    }
                }
                PortalEvent::Create { source, info, done } => {
                    let fut = std::panic::AssertUnwindSafe(
                        self.create_matrix_room_in_loop(&source, info),
                    )
                    .catch_unwind();
                    let result = match fut.await {
                        Ok(result) => result,
                        Err(panic) => {
                            error!(
                                portal_id = %self.key,
                                panic = %panic_message(panic.as_ref()),
                                "Portal creation panicked"
                            );
                            Err(EventError::PanicInHandler)
                        }
                    };
                    let _ = done.send(result);
                }
            }
        }
    }

    /// Picks the login a Matrix user's events should be sent through.
    /// `Ok(None)` means the caller should fall back to the portal relay.
    pub async fn find_preferred_login(
        &self,
        user: &Arc<User>,
        allow_relay: bool,
    ) -> EventResult<(Option<Arc<UserLogin>>, Option<UserPortal>)> {
        if !self.receiver().is_empty() {
            let Some(login) = self.bridge.identities.login_by_id(self.receiver()) else {
                return Err(EventError::NotLoggedIn);
            };
            if login.user_mxid() != user.mxid {
                if allow_relay && self.relay().is_some() {
                    return Ok((None, None));
                }
                return Err(EventError::NotLoggedIn);
            }
            let up = self
                .bridge
                .db
                .get_user_portal(&login.id, &self.key)
                .await
                .map_err(EventError::database)?;
            return Ok((Some(login), up));
        }
        let rows = self
            .bridge
            .db
            .get_user_portals_for_user(&user.mxid, &self.key)
            .await
            .map_err(EventError::database)?;
        for row in rows {
            if let Some(login) = self.bridge.identities.login_by_id(&row.login_id) {
                if login.user_mxid() == user.mxid && login.client.is_logged_in() {
                    return Ok((Some(login), Some(row)));
                }
            }
        }
        if !allow_relay {
            return Err(EventError::NotLoggedIn);
        }
        if self.relay().is_some() {
            return Ok((None, None));
        }
        let logins = self.bridge.identities.logins_for_user(&user.mxid);
        if let Some(first) = logins.into_iter().next() {
            warn!(
                portal_id = %self.key,
                chosen_login_id = %first.id,
                "No usable user portal rows found, returning random login"
            );
            return Ok((Some(first), None));
        }
        Err(EventError::NotLoggedIn)
    }

    /// Resolves the intent a remote sender's events are emitted with, plus
    /// an optional extra Matrix user to attribute alongside a ghost intent.
    pub(crate) async fn intent_and_user_mxid_for(
        &self,
        sender: &EventSender,
        source: &Arc<UserLogin>,
        other_logins: Option<&[Arc<UserLogin>]>,
    ) -> (Option<Arc<dyn MatrixApi>>, Option<String>) {
        let mut sender = sender.clone();
        if !sender.is_from_me && sender.force_dm_user {
            if let Some(other_user) = self.other_user_id() {
                if !sender.sender.is_empty() && sender.sender != other_user {
                    warn!(
                        portal_id = %self.key,
                        original_id = %sender.sender,
                        default_other_user = %other_user,
                        "Overriding event sender with primary other user in DM portal"
                    );
                    sender.sender = other_user;
                }
            }
        }
        let mut ghost = None;
        if !sender.sender.is_empty() {
            match self.bridge.identities.ghost_by_id(&sender.sender).await {
                Ok(found) => ghost = Some(found),
                Err(err) => {
                    error!(portal_id = %self.key, error = %err, "Failed to get ghost for event sender");
                    return (None, None);
                }
            }
        }
        let mut extra_user_id = None;
        if sender.is_from_me {
            if let Some(dp) = source.user.double_puppet() {
                return (Some(dp), None);
            }
            extra_user_id = Some(source.user_mxid().to_string());
        } else if !sender.sender_login.is_empty() && self.receiver().is_empty() {
            if let Some(sender_login) = self.bridge.identities.login_by_id(&sender.sender_login) {
                if let Some(dp) = sender_login.user.double_puppet() {
                    return (Some(dp), None);
                }
                extra_user_id = Some(sender_login.user_mxid().to_string());
            }
        }
        if !sender.sender.is_empty() && self.receiver().is_empty() {
            if let Some(other_logins) = other_logins {
                for login in other_logins {
                    if login.client.is_this_user(&sender.sender).await {
                        if let Some(dp) = login.user.double_puppet() {
                            return (Some(dp), None);
                        }
                        extra_user_id = Some(login.user_mxid().to_string());
                    }
                }
            }
        }
        let intent = ghost.map(|g| Arc::clone(&g.intent));
        (intent, extra_user_id)
    }

    pub(crate) async fn intent_for(
        &self,
        sender: &EventSender,
        source: &Arc<UserLogin>,
    ) -> Arc<dyn MatrixApi> {
        let (intent, _) = self.intent_and_user_mxid_for(sender, source, None).await;
        intent.unwrap_or_else(|| Arc::clone(&self.bridge.bot))
    }

    /// Resolves the intent behind an arbitrary Matrix user id: a ghost's
    /// intent, or a real user's double puppet.
    pub(crate) async fn intent_for_mxid(
        &self,
        mxid: &str,
    ) -> anyhow::Result<Option<Arc<dyn MatrixApi>>> {
        if mxid.is_empty() {
            return Ok(None);
        }
        if let Some(ghost) = self.bridge.identities.ghost_by_mxid(mxid).await? {
            return Ok(Some(Arc::clone(&ghost.intent)));
        }
        if let Some(user) = self.bridge.identities.user_by_mxid(mxid).await? {
            return Ok(user.double_puppet());
        }
        Ok(None)
    }

    pub(crate) fn register_pending(&self, transaction_id: String, pending: OutgoingMessage) {
        self.outgoing.lock().unwrap().insert(transaction_id, pending);
    }

    pub(crate) fn take_pending(&self, transaction_id: &str) -> Option<OutgoingMessage> {
        self.outgoing.lock().unwrap().remove(transaction_id)
    }

    pub(crate) async fn send_success_status(&self, evt: &MatrixEvent) {
        self.send_status_raw(&evt.room_id, &evt.event_id, &evt.sender, MessageStatus::success())
            .await;
    }

    pub(crate) async fn send_error_status(&self, evt: &MatrixEvent, err: &EventError) {
        if !err.should_send_status() {
            return;
        }
        self.send_status_raw(&evt.room_id, &evt.event_id, &evt.sender, MessageStatus::from(err))
            .await;
    }

    pub(crate) async fn send_status_raw(
        &self,
        room_id: &str,
        event_id: &str,
        sender: &str,
        status: MessageStatus,
    ) {
        let info = MessageStatusEventInfo {
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
            sender: sender.to_string(),
        };
        self.bridge.bot.send_message_status(&status, &info).await;
    }

    pub(crate) async fn parent_portal(&self) -> Option<Arc<Portal>> {
        let parent_id = self.parent_id()?;
        match self
            .bridge
            .get_portal_by_key(&PortalKey::id_only(parent_id))
            .await
        {
            Ok(parent) => Some(parent),
            Err(err) => {
                error!(portal_id = %self.key, error = %err, "Failed to get parent portal");
                None
            }
        }
    }

    /// Walks the parent chain to the topmost space. Assumes the parent graph
    /// is acyclic.
    pub async fn get_top_level_parent(self: &Arc<Self>) -> Option<Arc<Portal>> {
        let mut current = Arc::clone(self);
        loop {
            match current.parent_portal().await {
                Some(parent) => current = parent,
                None => {
                    if current.room_type() == RoomType::Space {
                        return Some(current);
                    }
                    return None;
                }
            }
        }
    }

    pub(crate) async fn mark_login_in_portal(&self, login: &Arc<UserLogin>) {
        let mut row = match self.bridge.db.get_user_portal(&login.id, &self.key).await {
            Ok(Some(row)) => row,
            Ok(None) => UserPortal::new(&login.id, login.user_mxid(), &self.key),
            Err(err) => {
                error!(portal_id = %self.key, error = %err, "Failed to get user portal row");
                return;
            }
        };
        row.in_portal = true;
        if let Err(err) = self.bridge.db.put_user_portal(&row).await {
            error!(portal_id = %self.key, error = %err, "Failed to save user portal row");
        }
    }

    pub(crate) fn enqueue_disappearing(
        &self,
        event_mxid: &str,
        setting: &DisappearingSetting,
        message_ts: DateTime<Utc>,
    ) {
        if !setting.is_enabled() {
            return;
        }
        let Some(room_mxid) = self.mxid() else {
            return;
        };
        let disappear_at = match setting.disappear_type {
            crate::database::DisappearingType::AfterSend => {
                Some((message_ts + chrono::Duration::from_std(setting.timer).unwrap_or_default()).timestamp_millis())
            }
            _ => None,
        };
        let msg = crate::database::DisappearingMessage {
            room_mxid,
            event_mxid: event_mxid.to_string(),
            disappear_type: setting.disappear_type.as_str().to_string(),
            timer: setting.timer.as_millis() as i64,
            disappear_at,
        };
        let scheduler = Arc::clone(&self.bridge.disappearing);
        tokio::spawn(async move { scheduler.enqueue(msg).await });
    }

    /// Deletes the portal row and drops the Matrix room.
    pub async fn delete(&self) -> anyhow::Result<()> {
        let mxid = self.mxid();
        self.bridge.db.delete_portal(&self.key).await?;
        self.bridge
            .drop_portal_from_cache(&self.key, mxid.as_deref())
            .await;
        Ok(())
    }

    /// Forgets the Matrix room without deleting the portal row.
    pub async fn remove_mxid(&self) -> anyhow::Result<()> {
        let Some(mxid) = self.mxid() else {
            return Ok(());
        };
        self.with_row(|row| row.mxid = None);
        self.save().await?;
        self.bridge.unregister_portal_mxid(&mxid).await;
        Ok(())
    }

    pub async fn set_relay(&self, relay: Option<&Arc<UserLogin>>) -> anyhow::Result<()> {
        self.with_row(|row| row.relay_login_id = relay.map(|r| r.id.clone()));
        self.save().await
    }

    /// Finalizes a pending outgoing message when its remote echo arrives.
    /// Returns the saved row when the event was consumed as an echo.
    pub(crate) async fn check_pending_message(
        &self,
        evt: &dyn crate::network::RemoteMessage,
    ) -> Option<DbMessage> {
        let transaction_id = evt.transaction_id()?;
        let mut pending = self.take_pending(&transaction_id)?;
        pending.db.id = evt.message_id();
        if pending.db.sender_id.is_empty() {
            pending.db.sender_id = evt.sender().sender;
        }
        if let Some(ts) = evt.timestamp() {
            pending.db.set_timestamp(ts);
        }
        let mut status_err = None;
        let mut save_message = true;
        if let Some(handle) = pending.handle.take() {
            let (save, err) = handle(evt as &dyn RemoteEvent, &mut pending.db);
            save_message = save;
            status_err = err;
        }
        if save_message {
            // The ghost row must exist before the message row references it.
            let _ = self.bridge.identities.ghost_by_id(&pending.db.sender_id).await;
            if let Err(err) = self.bridge.db.insert_message(&pending.db).await {
                error!(
                    portal_id = %self.key,
                    error = %err,
                    "Failed to save message to database after receiving remote echo"
                );
            }
        }
        match status_err {
            Some(EventError::NoStatus) => {}
            Some(err) => {
                if err.should_send_status() {
                    self.send_status_raw(
                        &pending.room_id,
                        &pending.event_id,
                        &pending.sender_mxid,
                        MessageStatus::from(&err),
                    )
                    .await;
                }
            }
            None => {
                self.send_status_raw(
                    &pending.room_id,
                    &pending.event_id,
                    &pending.sender_mxid,
                    MessageStatus::success(),
                )
                .await;
            }
        }
        debug!(
            portal_id = %self.key,
            event_id = %pending.event_id,
            "Received remote echo for message"
        );
        Some(pending.db)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
