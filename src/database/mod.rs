mod schema;
mod portal;
mod message;
mod reaction;
mod user_portal;
mod disappearing;

pub use disappearing::*;
pub use message::*;
pub use portal::*;
pub use reaction::*;
pub use user_portal::*;

use anyhow::Context;
use anyhow::Result;
use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Database {
    inner: DatabaseInner,
}

#[derive(Debug, Clone)]
enum DatabaseInner {
    Sqlite(Pool<ConnectionManager<SqliteConnection>>),
    Postgres(Pool<ConnectionManager<PgConnection>>),
}

impl Database {
    pub async fn connect(db_type: &str, uri: &str, max_open: u32, max_idle: u32) -> Result<Self> {
        let max_open = max_open.max(1);
        let max_idle = max_idle.min(max_open);
        let db_type = db_type.trim().to_ascii_lowercase();

        match db_type.as_str() {
            "sqlite" | "sqlite3" => {
                info!("Connecting to SQLite database with Diesel");
                let database_url = normalize_sqlite_uri(uri);
                let manager = ConnectionManager::<SqliteConnection>::new(database_url);
                let pool = Pool::builder()
                    .max_size(max_open)
                    .min_idle(Some(max_idle))
                    .build(manager)
                    .context("failed to create sqlite connection pool")?;
                Ok(Self {
                    inner: DatabaseInner::Sqlite(pool),
                })
            }
            "postgres" | "postgresql" | "pgsql" => {
                info!("Connecting to PostgreSQL database with Diesel");
                let manager = ConnectionManager::<PgConnection>::new(uri.to_owned());
                let pool = Pool::builder()
                    .max_size(max_open)
                    .min_idle(Some(max_idle))
                    .build(manager)
                    .context("failed to create postgres connection pool")?;
                Ok(Self {
                    inner: DatabaseInner::Postgres(pool),
                })
            }
            _ => anyhow::bail!(
                "Unsupported database type: {db_type}. Supported types: sqlite/sqlite3/postgres/postgresql/pgsql"
            ),
        }
    }

    pub fn is_sqlite(&self) -> bool {
        matches!(self.inner, DatabaseInner::Sqlite(_))
    }

    pub async fn run_migrations(&self) -> Result<()> {
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                let migration_sql = include_str!("../../migrations/001_initial.sql")
                    .lines()
                    .filter(|line| !line.starts_with("-- only: postgres"))
                    .collect::<Vec<_>>()
                    .join("\n");
                self.with_sqlite_conn(move |conn| {
                    conn.batch_execute(&migration_sql)?;
                    Ok(())
                })
                .await?;
            }
            DatabaseInner::Postgres(_) => {
                let migration_sql = include_str!("../../migrations/001_initial.sql");
                self.with_postgres_conn(move |conn| {
                    conn.batch_execute(migration_sql)?;
                    Ok(())
                })
                .await?;
            }
        }

        info!("Database migrations completed");
        Ok(())
    }

    pub async fn get_portal_by_key(&self, key: &PortalKey) -> Result<Option<Portal>> {
        let key = key.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| PortalQuery::get_by_key_sqlite(conn, &key))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| PortalQuery::get_by_key_postgres(conn, &key))
                    .await
            }
        }
    }

    pub async fn get_portal_by_mxid(&self, mxid: &str) -> Result<Option<Portal>> {
        let mxid = mxid.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| PortalQuery::get_by_mxid_sqlite(conn, &mxid))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| PortalQuery::get_by_mxid_postgres(conn, &mxid))
                    .await
            }
        }
    }

    pub async fn get_all_portals_with_mxid(&self) -> Result<Vec<Portal>> {
        match &self.inner {
            DatabaseInner::Sqlite(_) => self.with_sqlite_conn(PortalQuery::get_all_with_mxid_sqlite).await,
            DatabaseInner::Postgres(_) => self.with_postgres_conn(PortalQuery::get_all_with_mxid_postgres).await,
        }
    }

    pub async fn find_portal_receiver(&self, id: &str, maybe_receiver: &str) -> Result<Option<PortalKey>> {
        let id = id.to_owned();
        let maybe_receiver = maybe_receiver.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| PortalQuery::find_receiver_sqlite(conn, &id, &maybe_receiver))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| PortalQuery::find_receiver_postgres(conn, &id, &maybe_receiver))
                    .await
            }
        }
    }

    pub async fn insert_portal(&self, item: &Portal) -> Result<()> {
        let item = item.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => self.with_sqlite_conn(move |conn| PortalQuery::insert_sqlite(conn, &item)).await,
            DatabaseInner::Postgres(_) => self.with_postgres_conn(move |conn| PortalQuery::insert_postgres(conn, &item)).await,
        }
    }

    pub async fn update_portal(&self, item: &Portal) -> Result<()> {
        let item = item.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => self.with_sqlite_conn(move |conn| PortalQuery::update_sqlite(conn, &item)).await,
            DatabaseInner::Postgres(_) => self.with_postgres_conn(move |conn| PortalQuery::update_postgres(conn, &item)).await,
        }
    }

    pub async fn delete_portal(&self, key: &PortalKey) -> Result<()> {
        let key = key.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => self.with_sqlite_conn(move |conn| PortalQuery::delete_sqlite(conn, &key)).await,
            DatabaseInner::Postgres(_) => self.with_postgres_conn(move |conn| PortalQuery::delete_postgres(conn, &key)).await,
        }
    }

    pub async fn get_message_part_by_mxid(&self, mxid: &str) -> Result<Option<Message>> {
        let mxid = mxid.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| MessageQuery::get_part_by_mxid_sqlite(conn, &mxid))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| MessageQuery::get_part_by_mxid_postgres(conn, &mxid))
                    .await
            }
        }
    }

    pub async fn get_message_parts(&self, receiver: &str, id: &str) -> Result<Vec<Message>> {
        let receiver = receiver.to_owned();
        let id = id.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| MessageQuery::get_all_parts_sqlite(conn, &receiver, &id))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| MessageQuery::get_all_parts_postgres(conn, &receiver, &id))
                    .await
            }
        }
    }

    pub async fn get_first_message_part(&self, receiver: &str, id: &str) -> Result<Option<Message>> {
        let receiver = receiver.to_owned();
        let id = id.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| MessageQuery::get_first_part_sqlite(conn, &receiver, &id))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| MessageQuery::get_first_part_postgres(conn, &receiver, &id))
                    .await
            }
        }
    }

    pub async fn get_message_part(&self, receiver: &str, id: &str, part_id: &str) -> Result<Option<Message>> {
        let receiver = receiver.to_owned();
        let id = id.to_owned();
        let part_id = part_id.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| MessageQuery::get_part_sqlite(conn, &receiver, &id, &part_id))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| MessageQuery::get_part_postgres(conn, &receiver, &id, &part_id))
                    .await
            }
        }
    }

    pub async fn get_last_message_part(&self, receiver: &str, id: &str) -> Result<Option<Message>> {
        let receiver = receiver.to_owned();
        let id = id.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| MessageQuery::get_last_part_sqlite(conn, &receiver, &id))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| MessageQuery::get_last_part_postgres(conn, &receiver, &id))
                    .await
            }
        }
    }

    pub async fn get_first_thread_message(&self, key: &PortalKey, thread_root: &str) -> Result<Option<Message>> {
        let key = key.clone();
        let thread_root = thread_root.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| MessageQuery::get_first_by_thread_sqlite(conn, &key, &thread_root))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| MessageQuery::get_first_by_thread_postgres(conn, &key, &thread_root))
                    .await
            }
        }
    }

    pub async fn get_last_thread_message(&self, key: &PortalKey, thread_root: &str) -> Result<Option<Message>> {
        let key = key.clone();
        let thread_root = thread_root.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| MessageQuery::get_last_by_thread_sqlite(conn, &key, &thread_root))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| MessageQuery::get_last_by_thread_postgres(conn, &key, &thread_root))
                    .await
            }
        }
    }

    pub async fn get_last_message_before(&self, key: &PortalKey, max_ts: i64) -> Result<Option<Message>> {
        let key = key.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| MessageQuery::get_last_before_sqlite(conn, &key, max_ts))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| MessageQuery::get_last_before_postgres(conn, &key, max_ts))
                    .await
            }
        }
    }

    pub async fn insert_message(&self, item: &Message) -> Result<()> {
        let item = item.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => self.with_sqlite_conn(move |conn| MessageQuery::insert_sqlite(conn, &item)).await,
            DatabaseInner::Postgres(_) => self.with_postgres_conn(move |conn| MessageQuery::insert_postgres(conn, &item)).await,
        }
    }

    pub async fn update_message(&self, item: &Message) -> Result<()> {
        let item = item.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => self.with_sqlite_conn(move |conn| MessageQuery::update_sqlite(conn, &item)).await,
            DatabaseInner::Postgres(_) => self.with_postgres_conn(move |conn| MessageQuery::update_postgres(conn, &item)).await,
        }
    }

    pub async fn delete_message_parts(&self, receiver: &str, id: &str) -> Result<()> {
        let receiver = receiver.to_owned();
        let id = id.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| MessageQuery::delete_all_parts_sqlite(conn, &receiver, &id))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| MessageQuery::delete_all_parts_postgres(conn, &receiver, &id))
                    .await
            }
        }
    }

    pub async fn delete_message_part(&self, receiver: &str, id: &str, part_id: &str) -> Result<()> {
        let receiver = receiver.to_owned();
        let id = id.to_owned();
        let part_id = part_id.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| MessageQuery::delete_part_sqlite(conn, &receiver, &id, &part_id))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| MessageQuery::delete_part_postgres(conn, &receiver, &id, &part_id))
                    .await
            }
        }
    }

    pub async fn get_reaction(
        &self,
        message_id: &str,
        part_id: &str,
        sender_id: &str,
        emoji_id: &str,
    ) -> Result<Option<Reaction>> {
        let message_id = message_id.to_owned();
        let part_id = part_id.to_owned();
        let sender_id = sender_id.to_owned();
        let emoji_id = emoji_id.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| {
                    ReactionQuery::get_by_id_sqlite(conn, &message_id, &part_id, &sender_id, &emoji_id)
                })
                .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| {
                    ReactionQuery::get_by_id_postgres(conn, &message_id, &part_id, &sender_id, &emoji_id)
                })
                .await
            }
        }
    }

    pub async fn get_reaction_without_part(
        &self,
        message_id: &str,
        sender_id: &str,
        emoji_id: &str,
    ) -> Result<Option<Reaction>> {
        let message_id = message_id.to_owned();
        let sender_id = sender_id.to_owned();
        let emoji_id = emoji_id.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| {
                    ReactionQuery::get_by_id_without_part_sqlite(conn, &message_id, &sender_id, &emoji_id)
                })
                .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| {
                    ReactionQuery::get_by_id_without_part_postgres(conn, &message_id, &sender_id, &emoji_id)
                })
                .await
            }
        }
    }

    pub async fn get_reaction_by_mxid(&self, mxid: &str) -> Result<Option<Reaction>> {
        let mxid = mxid.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| ReactionQuery::get_by_mxid_sqlite(conn, &mxid))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| ReactionQuery::get_by_mxid_postgres(conn, &mxid))
                    .await
            }
        }
    }

    pub async fn get_reactions_by_sender(&self, message_id: &str, sender_id: &str) -> Result<Vec<Reaction>> {
        let message_id = message_id.to_owned();
        let sender_id = sender_id.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| ReactionQuery::get_all_by_sender_sqlite(conn, &message_id, &sender_id))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| ReactionQuery::get_all_by_sender_postgres(conn, &message_id, &sender_id))
                    .await
            }
        }
    }

    pub async fn get_reactions_to_message(&self, message_id: &str) -> Result<Vec<Reaction>> {
        let message_id = message_id.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| ReactionQuery::get_all_to_message_sqlite(conn, &message_id))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| ReactionQuery::get_all_to_message_postgres(conn, &message_id))
                    .await
            }
        }
    }

    pub async fn get_reactions_to_part(&self, message_id: &str, part_id: &str) -> Result<Vec<Reaction>> {
        let message_id = message_id.to_owned();
        let part_id = part_id.to_owned();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| ReactionQuery::get_all_to_part_sqlite(conn, &message_id, &part_id))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| ReactionQuery::get_all_to_part_postgres(conn, &message_id, &part_id))
                    .await
            }
        }
    }

    pub async fn upsert_reaction(&self, item: &Reaction) -> Result<()> {
        let item = item.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => self.with_sqlite_conn(move |conn| ReactionQuery::upsert_sqlite(conn, &item)).await,
            DatabaseInner::Postgres(_) => self.with_postgres_conn(move |conn| ReactionQuery::upsert_postgres(conn, &item)).await,
        }
    }

    pub async fn delete_reaction(&self, item: &Reaction) -> Result<()> {
        let item = item.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => self.with_sqlite_conn(move |conn| ReactionQuery::delete_sqlite(conn, &item)).await,
            DatabaseInner::Postgres(_) => self.with_postgres_conn(move |conn| ReactionQuery::delete_postgres(conn, &item)).await,
        }
    }

    pub async fn get_user_portal(&self, login_id: &str, key: &PortalKey) -> Result<Option<UserPortal>> {
        let login_id = login_id.to_owned();
        let key = key.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| UserPortalQuery::get_sqlite(conn, &login_id, &key))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| UserPortalQuery::get_postgres(conn, &login_id, &key))
                    .await
            }
        }
    }

    pub async fn get_user_portals_for_user(&self, user_mxid: &str, key: &PortalKey) -> Result<Vec<UserPortal>> {
        let user_mxid = user_mxid.to_owned();
        let key = key.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| UserPortalQuery::get_all_for_user_sqlite(conn, &user_mxid, &key))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| UserPortalQuery::get_all_for_user_postgres(conn, &user_mxid, &key))
                    .await
            }
        }
    }

    pub async fn get_user_portals_in_portal(&self, key: &PortalKey) -> Result<Vec<UserPortal>> {
        let key = key.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => {
                self.with_sqlite_conn(move |conn| UserPortalQuery::get_all_in_portal_sqlite(conn, &key))
                    .await
            }
            DatabaseInner::Postgres(_) => {
                self.with_postgres_conn(move |conn| UserPortalQuery::get_all_in_portal_postgres(conn, &key))
                    .await
            }
        }
    }

    pub async fn put_user_portal(&self, item: &UserPortal) -> Result<()> {
        let item = item.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => self.with_sqlite_conn(move |conn| UserPortalQuery::put_sqlite(conn, &item)).await,
            DatabaseInner::Postgres(_) => self.with_postgres_conn(move |conn| UserPortalQuery::put_postgres(conn, &item)).await,
        }
    }

    pub async fn upsert_disappearing_message(&self, item: &DisappearingMessage) -> Result<()> {
        let item = item.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => self.with_sqlite_conn(move |conn| DisappearingQuery::upsert_sqlite(conn, &item)).await,
            DatabaseInner::Postgres(_) => self.with_postgres_conn(move |conn| DisappearingQuery::upsert_postgres(conn, &item)).await,
        }
    }

    pub async fn upsert_backfill_task(&self, item: &BackfillTask) -> Result<()> {
        let item = item.clone();
        match &self.inner {
            DatabaseInner::Sqlite(_) => self.with_sqlite_conn(move |conn| BackfillQuery::upsert_sqlite(conn, &item)).await,
            DatabaseInner::Postgres(_) => self.with_postgres_conn(move |conn| BackfillQuery::upsert_postgres(conn, &item)).await,
        }
    }

    async fn with_sqlite_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
    {
        let pool = match &self.inner {
            DatabaseInner::Sqlite(pool) => pool.clone(),
            DatabaseInner::Postgres(_) => anyhow::bail!("internal error: expected sqlite database"),
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .context("failed to get sqlite connection from pool")?;
            conn.batch_execute("PRAGMA foreign_keys = ON;")?;
            f(&mut conn)
        })
        .await
        .context("diesel task join error")?
    }

    async fn with_postgres_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
    {
        let pool = match &self.inner {
            DatabaseInner::Sqlite(_) => anyhow::bail!("internal error: expected postgres database"),
            DatabaseInner::Postgres(pool) => pool.clone(),
        };
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .context("failed to get postgres connection from pool")?;
            f(&mut conn)
        })
        .await
        .context("diesel task join error")?
    }
}

fn normalize_sqlite_uri(uri: &str) -> String {
    uri.strip_prefix("sqlite://")
        .or_else(|| uri.strip_prefix("sqlite:"))
        .unwrap_or(uri)
        .to_owned()
}

/// Identifies one portal: remote chat id plus the receiving login for chats
/// that are split per user (DMs). Group chats leave the receiver empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PortalKey {
    pub id: String,
    pub receiver: String,
}

impl PortalKey {
    pub fn new(id: impl Into<String>, receiver: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            receiver: receiver.into(),
        }
    }

    pub fn id_only(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            receiver: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

impl std::fmt::Display for PortalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.receiver.is_empty() {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{}:{}", self.id, self.receiver)
        }
    }
}
