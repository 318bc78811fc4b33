use anyhow::Result;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};

use super::schema::user_portal;
use super::PortalKey;

/// Per-login state in a portal: read watermark plus in-space/in-portal flags.
#[derive(Debug, Clone, Queryable, Selectable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = user_portal)]
pub struct UserPortal {
    pub login_id: String,
    pub user_mxid: String,
    pub chat_id: String,
    pub chat_receiver: String,
    pub in_space: bool,
    pub in_portal: bool,
    pub last_read: i64,
}

impl UserPortal {
    pub fn new(login_id: &str, user_mxid: &str, key: &PortalKey) -> Self {
        Self {
            login_id: login_id.to_string(),
            user_mxid: user_mxid.to_string(),
            chat_id: key.id.clone(),
            chat_receiver: key.receiver.clone(),
            in_space: false,
            in_portal: false,
            last_read: 0,
        }
    }

    pub fn key(&self) -> PortalKey {
        PortalKey::new(&self.chat_id, &self.chat_receiver)
    }
}

pub struct UserPortalQuery;

macro_rules! impl_user_portal_query_for_conn {
    (
        $get:ident,
        $get_all_for_user:ident,
        $get_all_in_portal:ident,
        $put:ident,
        $conn_ty:ty
    ) => {
        pub fn $get(
            conn: &mut $conn_ty,
            login_id: &str,
            key: &PortalKey,
        ) -> Result<Option<UserPortal>> {
            let item = user_portal::table
                .select(UserPortal::as_select())
                .filter(user_portal::login_id.eq(login_id))
                .filter(user_portal::chat_id.eq(&key.id))
                .filter(user_portal::chat_receiver.eq(&key.receiver))
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $get_all_for_user(
            conn: &mut $conn_ty,
            user_mxid: &str,
            key: &PortalKey,
        ) -> Result<Vec<UserPortal>> {
            let items = user_portal::table
                .select(UserPortal::as_select())
                .filter(user_portal::user_mxid.eq(user_mxid))
                .filter(user_portal::chat_id.eq(&key.id))
                .filter(user_portal::chat_receiver.eq(&key.receiver))
                .order(user_portal::last_read.desc())
                .load(conn)?;
            Ok(items)
        }

        pub fn $get_all_in_portal(conn: &mut $conn_ty, key: &PortalKey) -> Result<Vec<UserPortal>> {
            let items = user_portal::table
                .select(UserPortal::as_select())
                .filter(user_portal::chat_id.eq(&key.id))
                .filter(user_portal::chat_receiver.eq(&key.receiver))
                .load(conn)?;
            Ok(items)
        }

        pub fn $put(conn: &mut $conn_ty, item: &UserPortal) -> Result<()> {
            diesel::insert_into(user_portal::table)
                .values(item)
                .on_conflict((
                    user_portal::login_id,
                    user_portal::chat_id,
                    user_portal::chat_receiver,
                ))
                .do_update()
                .set((
                    user_portal::user_mxid.eq(&item.user_mxid),
                    user_portal::in_space.eq(item.in_space),
                    user_portal::in_portal.eq(item.in_portal),
                    user_portal::last_read.eq(item.last_read),
                ))
                .execute(conn)?;
            Ok(())
        }
    };
}

impl UserPortalQuery {
    impl_user_portal_query_for_conn!(
        get_sqlite,
        get_all_for_user_sqlite,
        get_all_in_portal_sqlite,
        put_sqlite,
        SqliteConnection
    );

    impl_user_portal_query_for_conn!(
        get_postgres,
        get_all_for_user_postgres,
        get_all_in_portal_postgres,
        put_postgres,
        PgConnection
    );
}
