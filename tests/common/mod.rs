#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use matrix_bridge_core::bridge::{
    Bridge, DisappearingScheduler, Ghost, IdentityStore, Portal, User, UserLogin,
};
use matrix_bridge_core::config::Config;
use matrix_bridge_core::database::{
    Database, DisappearingMessage, Message as DbMessage, Portal as DbPortal, PortalKey,
    UserPortal,
};
use matrix_bridge_core::error::{EventResult, MatrixResult};
use matrix_bridge_core::matrix::{
    CreateRoomRequest, MatrixApi, MatrixEvent, MemberContent, MessageStatus,
    MessageStatusEventInfo, MessageStatusCode, PowerLevelsContent, SendResponse, TypingType,
};
use matrix_bridge_core::network::{
    ChatInfo, ConvertedMessage, ConvertedMessagePart, EventSender,
    MatrixEditEvent, MatrixMessageEvent, MatrixMessageRemoveEvent, MatrixReactionEvent,
    MatrixReactionRemoveEvent, MatrixReactionRequest, MatrixReadReceiptEvent, MessageResponse,
    NetworkClient, ReactionPreResponse, ReplyRef, RoomCapabilities,
    EditHandler, ReactionHandler, ReadReceiptHandler, RedactionHandler, TypingHandler,
    RemoteChatInfoChange, ChatInfoChange,
    RemoteEvent, RemoteEventType, RemoteMessage, RemoteMessageRemove, RemoteReaction,
    RemoteReactionSync, ReactionSyncData,
};

#[derive(Debug, Clone)]
pub enum MatrixCall {
    SendMessage {
        sender: String,
        room_id: String,
        event_type: String,
        content: serde_json::Value,
        event_id: String,
    },
    SendState {
        sender: String,
        room_id: String,
        event_type: String,
        state_key: String,
        content: serde_json::Value,
    },
    Status {
        event_id: String,
        success: bool,
        message: String,
    },
    CreateRoom {
        room_id: String,
    },
    MarkRead {
        sender: String,
        event_id: String,
    },
    EnsureJoined {
        sender: String,
        room_id: String,
    },
    DeleteRoom {
        room_id: String,
    },
}

#[derive(Default)]
pub struct MatrixEnv {
    pub calls: Mutex<Vec<MatrixCall>>,
    counter: AtomicU64,
    pub members: Mutex<HashMap<String, MemberContent>>,
    pub power: Mutex<PowerLevelsContent>,
}

impl MatrixEnv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            power: Mutex::new(PowerLevelsContent::default()),
            ..Default::default()
        })
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst))
    }

    pub fn calls(&self) -> Vec<MatrixCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent_messages(&self) -> Vec<MatrixCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, MatrixCall::SendMessage { .. }))
            .collect()
    }

    pub fn statuses(&self) -> Vec<(String, bool, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MatrixCall::Status {
                    event_id,
                    success,
                    message,
                } => Some((event_id, success, message)),
                _ => None,
            })
            .collect()
    }

    pub fn redactions(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MatrixCall::SendMessage {
                    event_type, content, ..
                } if event_type == "m.room.redaction" => content
                    .get("redacts")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                _ => None,
            })
            .collect()
    }

    pub fn create_room_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MatrixCall::CreateRoom { .. }))
            .count()
    }
}

pub struct MockIntent {
    pub env: Arc<MatrixEnv>,
    pub mxid: String,
}

#[async_trait]
impl MatrixApi for MockIntent {
    fn user_id(&self) -> String {
        self.mxid.clone()
    }

    async fn send_message(
        &self,
        room_id: &str,
        event_type: &str,
        content: serde_json::Value,
        _ts: Option<DateTime<Utc>>,
    ) -> MatrixResult<SendResponse> {
        let event_id = self.env.next_id("$evt-");
        self.env.calls.lock().unwrap().push(MatrixCall::SendMessage {
            sender: self.mxid.clone(),
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            content,
            event_id: event_id.clone(),
        });
        Ok(SendResponse { event_id })
    }

    async fn send_state(
        &self,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: serde_json::Value,
        _ts: Option<DateTime<Utc>>,
    ) -> MatrixResult<SendResponse> {
        self.env.calls.lock().unwrap().push(MatrixCall::SendState {
            sender: self.mxid.clone(),
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            state_key: state_key.to_string(),
            content,
        });
        Ok(SendResponse {
            event_id: self.env.next_id("$state-"),
        })
    }

    async fn mark_read(&self, _room_id: &str, event_id: &str, _ts: DateTime<Utc>) -> MatrixResult<()> {
        self.env.calls.lock().unwrap().push(MatrixCall::MarkRead {
            sender: self.mxid.clone(),
            event_id: event_id.to_string(),
        });
        Ok(())
    }

    async fn mark_typing(
        &self,
        _room_id: &str,
        _typing_type: TypingType,
        _timeout: Duration,
    ) -> MatrixResult<()> {
        Ok(())
    }

    async fn mark_unread(&self, _room_id: &str, _unread: bool) -> MatrixResult<()> {
        Ok(())
    }

    async fn mark_as_dm(&self, _room_id: &str, _with_user: &str) -> MatrixResult<()> {
        Ok(())
    }

    async fn mute_room(&self, _room_id: &str, _until: Option<DateTime<Utc>>) -> MatrixResult<()> {
        Ok(())
    }

    async fn tag_room(&self, _room_id: &str, _tag: &str, _set: bool) -> MatrixResult<()> {
        Ok(())
    }

    async fn ensure_joined(&self, room_id: &str) -> MatrixResult<()> {
        self.env.calls.lock().unwrap().push(MatrixCall::EnsureJoined {
            sender: self.mxid.clone(),
            room_id: room_id.to_string(),
        });
        Ok(())
    }

    async fn create_room(&self, _req: &CreateRoomRequest) -> MatrixResult<String> {
        let room_id = format!("!created-{}:test", self.env.counter.fetch_add(1, Ordering::SeqCst));
        self.env.calls.lock().unwrap().push(MatrixCall::CreateRoom {
            room_id: room_id.clone(),
        });
        Ok(room_id)
    }

    async fn delete_room(&self, room_id: &str) -> MatrixResult<()> {
        self.env.calls.lock().unwrap().push(MatrixCall::DeleteRoom {
            room_id: room_id.to_string(),
        });
        Ok(())
    }

    async fn get_member_info(
        &self,
        _room_id: &str,
        user_id: &str,
    ) -> MatrixResult<Option<MemberContent>> {
        Ok(self.env.members.lock().unwrap().get(user_id).cloned())
    }

    async fn get_members(&self, _room_id: &str) -> MatrixResult<HashMap<String, MemberContent>> {
        Ok(self.env.members.lock().unwrap().clone())
    }

    async fn get_power_levels(&self, _room_id: &str) -> MatrixResult<PowerLevelsContent> {
        Ok(self.env.power.lock().unwrap().clone())
    }

    async fn send_message_status(&self, status: &MessageStatus, info: &MessageStatusEventInfo) {
        self.env.calls.lock().unwrap().push(MatrixCall::Status {
            event_id: info.event_id.clone(),
            success: status.status == MessageStatusCode::Success,
            message: status.message.clone(),
        });
    }

    fn generate_deterministic_event_id(
        &self,
        _room_id: &str,
        portal_key: &PortalKey,
        message_id: &str,
        part_id: &str,
    ) -> String {
        format!("$det:{}:{}:{}", portal_key, message_id, part_id)
    }

    fn parse_ghost_user_id(&self, mxid: &str) -> Option<String> {
        mxid.strip_prefix("@ghost_")
            .and_then(|rest| rest.strip_suffix(":test"))
            .map(str::to_string)
    }

    fn server_name(&self) -> String {
        "test".to_string()
    }
}

#[derive(Default)]
pub struct MockClient {
    pub remote_user_id: String,
    pub caps: RoomCapabilities,
    pub support_edits: bool,
    pub support_reactions: bool,
    pub support_redactions: bool,
    pub support_read_receipts: bool,
    pub support_typing: bool,
    pub emoji_as_id: bool,
    pub max_reactions: usize,
    pub pending_txn: Mutex<Option<String>>,
    pub chat_info: Mutex<ChatInfo>,
    pub messages: Mutex<Vec<MatrixMessageEvent>>,
    pub edits: Mutex<Vec<MatrixEditEvent>>,
    pub reactions: Mutex<Vec<MatrixReactionRequest>>,
    pub removals: Mutex<Vec<String>>,
    pub typing_calls: Mutex<Vec<bool>>,
    pub receipts: Mutex<Vec<MatrixReadReceiptEvent>>,
}

impl MockClient {
    pub fn text_network() -> Self {
        Self {
            remote_user_id: "alice-remote".to_string(),
            caps: RoomCapabilities {
                replies: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn set_pending(&self, txn: &str) {
        *self.pending_txn.lock().unwrap() = Some(txn.to_string());
    }
}

#[async_trait]
impl NetworkClient for MockClient {
    fn is_logged_in(&self) -> bool {
        true
    }

    async fn is_this_user(&self, user_id: &str) -> bool {
        user_id == self.remote_user_id
    }

    async fn get_capabilities(&self, _portal: &Portal) -> RoomCapabilities {
        self.caps.clone()
    }

    async fn get_chat_info(&self, _portal: &Portal) -> EventResult<ChatInfo> {
        Ok(self.chat_info.lock().unwrap().clone())
    }

    async fn handle_message(
        &self,
        _portal: &Portal,
        evt: MatrixMessageEvent,
    ) -> EventResult<MessageResponse> {
        let mut message = DbMessage {
            id: format!("rm-{}", evt.event_id),
            sender_id: self.remote_user_id.clone(),
            ..Default::default()
        };
        message.set_timestamp(evt.timestamp);
        self.messages.lock().unwrap().push(evt);
        let pending = self.pending_txn.lock().unwrap().take();
        if pending.is_some() {
            message.id = String::new();
        }
        Ok(MessageResponse {
            message,
            pending_transaction_id: pending,
            echo_handler: None,
        })
    }

    fn edit_handler(&self) -> Option<&dyn EditHandler> {
        self.support_edits.then_some(self as &dyn EditHandler)
    }

    fn reaction_handler(&self) -> Option<&dyn ReactionHandler> {
        self.support_reactions.then_some(self as &dyn ReactionHandler)
    }

    fn redaction_handler(&self) -> Option<&dyn RedactionHandler> {
        self.support_redactions.then_some(self as &dyn RedactionHandler)
    }

    fn read_receipt_handler(&self) -> Option<&dyn ReadReceiptHandler> {
        self.support_read_receipts.then_some(self as &dyn ReadReceiptHandler)
    }

    fn typing_handler(&self) -> Option<&dyn TypingHandler> {
        self.support_typing.then_some(self as &dyn TypingHandler)
    }
}

#[async_trait]
impl EditHandler for MockClient {
    async fn handle_edit(&self, _portal: &Portal, evt: MatrixEditEvent) -> EventResult<DbMessage> {
        let mut updated = evt.edit_target.clone();
        updated.edit_count += 1;
        self.edits.lock().unwrap().push(evt);
        Ok(updated)
    }
}

#[async_trait]
impl ReactionHandler for MockClient {
    async fn pre_handle_reaction(
        &self,
        _portal: &Portal,
        evt: &MatrixReactionEvent,
    ) -> EventResult<ReactionPreResponse> {
        Ok(ReactionPreResponse {
            sender_id: self.remote_user_id.clone(),
            emoji_id: if self.emoji_as_id {
                evt.emoji.clone()
            } else {
                String::new()
            },
            emoji: evt.emoji.clone(),
            max_reactions: self.max_reactions,
        })
    }

    async fn handle_reaction(
        &self,
        _portal: &Portal,
        req: MatrixReactionRequest,
    ) -> EventResult<Option<matrix_bridge_core::database::Reaction>> {
        self.reactions.lock().unwrap().push(req);
        Ok(None)
    }

    async fn handle_reaction_remove(
        &self,
        _portal: &Portal,
        evt: MatrixReactionRemoveEvent,
    ) -> EventResult<()> {
        self.removals.lock().unwrap().push(evt.target_reaction.mxid.clone());
        Ok(())
    }
}

#[async_trait]
impl RedactionHandler for MockClient {
    async fn handle_message_remove(
        &self,
        _portal: &Portal,
        evt: MatrixMessageRemoveEvent,
    ) -> EventResult<()> {
        self.removals.lock().unwrap().push(evt.target_message.mxid.clone());
        Ok(())
    }
}

#[async_trait]
impl ReadReceiptHandler for MockClient {
    async fn handle_read_receipt(
        &self,
        _portal: &Portal,
        evt: MatrixReadReceiptEvent,
    ) -> EventResult<()> {
        self.receipts.lock().unwrap().push(evt);
        Ok(())
    }
}

#[async_trait]
impl TypingHandler for MockClient {
    async fn handle_typing(&self, _portal: &Portal, is_typing: bool) -> EventResult<()> {
        self.typing_calls.lock().unwrap().push(is_typing);
        Ok(())
    }
}

pub struct MockIdentities {
    pub env: Arc<MatrixEnv>,
    pub ghosts: Mutex<HashMap<String, Arc<Ghost>>>,
    pub users: Mutex<HashMap<String, Arc<User>>>,
    pub logins: Mutex<HashMap<String, Arc<UserLogin>>>,
}

impl MockIdentities {
    pub fn new(env: Arc<MatrixEnv>) -> Arc<Self> {
        Arc::new(Self {
            env,
            ghosts: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            logins: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl IdentityStore for MockIdentities {
    async fn ghost_by_id(&self, id: &str) -> anyhow::Result<Arc<Ghost>> {
        let mut ghosts = self.ghosts.lock().unwrap();
        if let Some(ghost) = ghosts.get(id) {
            return Ok(Arc::clone(ghost));
        }
        let intent = Arc::new(MockIntent {
            env: Arc::clone(&self.env),
            mxid: format!("@ghost_{}:test", id),
        });
        let ghost = Arc::new(Ghost::new(id, intent));
        ghosts.insert(id.to_string(), Arc::clone(&ghost));
        Ok(ghost)
    }

    async fn ghost_by_mxid(&self, mxid: &str) -> anyhow::Result<Option<Arc<Ghost>>> {
        let Some(id) = mxid
            .strip_prefix("@ghost_")
            .and_then(|rest| rest.strip_suffix(":test"))
        else {
            return Ok(None);
        };
        Ok(Some(self.ghost_by_id(id).await?))
    }

    async fn user_by_mxid(&self, mxid: &str) -> anyhow::Result<Option<Arc<User>>> {
        Ok(self.users.lock().unwrap().get(mxid).cloned())
    }

    fn login_by_id(&self, id: &str) -> Option<Arc<UserLogin>> {
        self.logins.lock().unwrap().get(id).cloned()
    }

    fn logins_for_user(&self, mxid: &str) -> Vec<Arc<UserLogin>> {
        self.logins
            .lock()
            .unwrap()
            .values()
            .filter(|login| login.user_mxid() == mxid)
            .cloned()
            .collect()
    }

    async fn user_logins_in_portal(&self, _key: &PortalKey) -> anyhow::Result<Vec<Arc<UserLogin>>> {
        Ok(Vec::new())
    }

    fn is_ghost_mxid(&self, mxid: &str) -> bool {
        mxid.starts_with("@ghost_")
    }
}

#[derive(Default)]
pub struct MockScheduler {
    pub enqueued: Mutex<Vec<DisappearingMessage>>,
    pub started: Mutex<Vec<String>>,
}

#[async_trait]
impl DisappearingScheduler for MockScheduler {
    async fn enqueue(&self, msg: DisappearingMessage) {
        self.enqueued.lock().unwrap().push(msg);
    }

    async fn start_all(&self, room_mxid: &str) {
        self.started.lock().unwrap().push(room_mxid.to_string());
    }
}

const CONFIG_YAML: &str = r#"
network:
    id: testnet
    displayname: Test Network
database:
    type: sqlite
    uri: unused
bridge:
    relay:
        enabled: false
"#;

pub struct TestHarness {
    pub bridge: Arc<Bridge>,
    pub env: Arc<MatrixEnv>,
    pub client: Arc<MockClient>,
    pub login: Arc<UserLogin>,
    pub user: Arc<User>,
    pub identities: Arc<MockIdentities>,
    pub scheduler: Arc<MockScheduler>,
}

static DB_COUNTER: AtomicU64 = AtomicU64::new(0);

pub async fn harness_with(client: MockClient) -> TestHarness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let db_path = std::env::temp_dir().join(format!(
        "matrix-bridge-core-test-{}-{}.sqlite",
        std::process::id(),
        DB_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    let db = Database::connect("sqlite", db_path.to_str().unwrap(), 1, 1)
        .await
        .unwrap();
    db.run_migrations().await.unwrap();

    let env = MatrixEnv::new();
    let bot: Arc<dyn MatrixApi> = Arc::new(MockIntent {
        env: Arc::clone(&env),
        mxid: "@bot:test".to_string(),
    });
    let double_puppet: Arc<dyn MatrixApi> = Arc::new(MockIntent {
        env: Arc::clone(&env),
        mxid: "@alice:test".to_string(),
    });
    let user = Arc::new(User::with_double_puppet("@alice:test", double_puppet));
    let client = Arc::new(client);
    let client_dyn: Arc<dyn NetworkClient> = Arc::clone(&client) as Arc<dyn NetworkClient>;
    let login = Arc::new(UserLogin::new("login1", Arc::clone(&user), client_dyn));

    let identities = MockIdentities::new(Arc::clone(&env));
    identities
        .users
        .lock()
        .unwrap()
        .insert("@alice:test".to_string(), Arc::clone(&user));
    identities
        .logins
        .lock()
        .unwrap()
        .insert("login1".to_string(), Arc::clone(&login));

    let scheduler = Arc::new(MockScheduler::default());
    let config = Config::load_from_bytes(CONFIG_YAML.as_bytes()).unwrap();
    let bridge = Bridge::new(
        config,
        db,
        bot,
        Arc::clone(&identities) as Arc<dyn IdentityStore>,
        Arc::clone(&scheduler) as Arc<dyn DisappearingScheduler>,
    );

    TestHarness {
        bridge,
        env,
        client,
        login,
        user,
        identities,
        scheduler,
    }
}

pub async fn make_portal(h: &TestHarness, chat_id: &str, with_room: bool) -> Arc<Portal> {
    let key = PortalKey::id_only(chat_id);
    let mut row = DbPortal::new(&key);
    if with_room {
        row.mxid = Some(format!("!{}:test", chat_id));
    }
    h.bridge.db.insert_portal(&row).await.unwrap();
    h.bridge
        .db
        .put_user_portal(&UserPortal::new("login1", "@alice:test", &key))
        .await
        .unwrap();
    h.bridge.get_portal_by_key(&key).await.unwrap()
}

pub async fn insert_message(
    h: &TestHarness,
    key: &PortalKey,
    id: &str,
    part_id: &str,
    mxid: &str,
    sender_id: &str,
    ts: i64,
) -> DbMessage {
    let mut message = DbMessage {
        id: id.to_string(),
        part_id: part_id.to_string(),
        mxid: mxid.to_string(),
        sender_id: sender_id.to_string(),
        sender_mxid: format!("@ghost_{}:test", sender_id),
        timestamp: ts,
        ..Default::default()
    };
    message.set_key(key);
    h.bridge.db.insert_message(&message).await.unwrap();
    message
}

pub fn matrix_event(
    room_id: &str,
    event_id: &str,
    event_type: &str,
    content: serde_json::Value,
) -> MatrixEvent {
    MatrixEvent {
        event_type: event_type.to_string(),
        event_id: event_id.to_string(),
        sender: "@alice:test".to_string(),
        room_id: room_id.to_string(),
        origin_server_ts: 1_700_000_000_000,
        state_key: None,
        content,
        prev_content: None,
        redacts: None,
    }
}

pub fn text_event(room_id: &str, event_id: &str, body: &str) -> MatrixEvent {
    matrix_event(
        room_id,
        event_id,
        "m.room.message",
        serde_json::json!({ "msgtype": "m.text", "body": body }),
    )
}

/// Polls until `check` returns true, panicking after a couple of seconds.
pub async fn wait_until(check: impl Fn() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not reached in time");
}

/// Gives the portal worker time to drain its mailbox.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

pub struct TestRemoteMessage {
    pub id: String,
    pub sender: EventSender,
    pub txn_id: Option<String>,
    pub ts: Option<DateTime<Utc>>,
    pub parts: Vec<(String, String)>,
    pub thread_root: Option<String>,
    pub reply_to: Option<ReplyRef>,
    pub create_portal: bool,
}

impl TestRemoteMessage {
    pub fn text(id: &str, sender: &str, body: &str) -> Self {
        Self {
            id: id.to_string(),
            sender: EventSender::remote(sender),
            txn_id: None,
            ts: None,
            parts: vec![(String::new(), body.to_string())],
            thread_root: None,
            reply_to: None,
            create_portal: false,
        }
    }

    pub fn echo(id: &str, txn_id: &str, ts: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            sender: EventSender::from_me("alice-remote"),
            txn_id: Some(txn_id.to_string()),
            ts: Some(ts),
            parts: Vec::new(),
            thread_root: None,
            reply_to: None,
            create_portal: false,
        }
    }
}

impl RemoteEvent for TestRemoteMessage {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::Message
    }

    fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.ts
    }

    fn should_create_portal(&self) -> bool {
        self.create_portal
    }

    fn as_message(&self) -> Option<&dyn RemoteMessage> {
        Some(self)
    }
}

#[async_trait]
impl RemoteMessage for TestRemoteMessage {
    fn message_id(&self) -> String {
        self.id.clone()
    }

    fn transaction_id(&self) -> Option<String> {
        self.txn_id.clone()
    }

    async fn convert(
        &self,
        _portal: &Portal,
        _intent: &Arc<dyn MatrixApi>,
    ) -> EventResult<ConvertedMessage> {
        Ok(ConvertedMessage {
            parts: self
                .parts
                .iter()
                .map(|(part_id, body)| {
                    ConvertedMessagePart::text(
                        part_id.clone(),
                        matrix_bridge_core::matrix::MessageContent::text(body.clone()),
                    )
                })
                .collect(),
            thread_root: self.thread_root.clone(),
            reply_to: self.reply_to.clone(),
            disappear: None,
        })
    }
}

pub struct TestRemoteReactionSync {
    pub target: String,
    pub sender: EventSender,
    pub data: ReactionSyncData,
}

impl RemoteEvent for TestRemoteReactionSync {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::ReactionSync
    }

    fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    fn as_reaction_sync(&self) -> Option<&dyn RemoteReactionSync> {
        Some(self)
    }
}

impl RemoteReactionSync for TestRemoteReactionSync {
    fn target_message(&self) -> String {
        self.target.clone()
    }

    fn reactions(&self) -> ReactionSyncData {
        self.data.clone()
    }
}

pub struct TestRemoteReaction {
    pub target: String,
    pub sender: EventSender,
    pub emoji: String,
    pub emoji_id: String,
}

impl RemoteEvent for TestRemoteReaction {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::Reaction
    }

    fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    fn as_reaction(&self) -> Option<&dyn RemoteReaction> {
        Some(self)
    }
}

impl RemoteReaction for TestRemoteReaction {
    fn target_message(&self) -> String {
        self.target.clone()
    }

    fn reaction_emoji(&self) -> (String, String) {
        (self.emoji.clone(), self.emoji_id.clone())
    }
}

pub struct TestRemoteMessageRemove {
    pub target: String,
    pub sender: EventSender,
}

impl RemoteEvent for TestRemoteMessageRemove {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::MessageRemove
    }

    fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    fn as_message_remove(&self) -> Option<&dyn RemoteMessageRemove> {
        Some(self)
    }
}

impl RemoteMessageRemove for TestRemoteMessageRemove {
    fn target_message(&self) -> String {
        self.target.clone()
    }
}

pub struct TestMemberSync {
    pub sender: EventSender,
    pub change: ChatInfoChange,
}

impl RemoteEvent for TestMemberSync {
    fn event_type(&self) -> RemoteEventType {
        RemoteEventType::ChatInfoChange
    }

    fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    fn as_chat_info_change(&self) -> Option<&dyn RemoteChatInfoChange> {
        Some(self)
    }
}

#[async_trait]
impl RemoteChatInfoChange for TestMemberSync {
    async fn get_chat_info_change(&self) -> EventResult<ChatInfoChange> {
        Ok(self.change.clone())
    }
}
