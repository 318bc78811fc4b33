use anyhow::Result;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};

use super::schema::portal;
use super::{DisappearingSetting, DisappearingType, PortalKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomType {
    Dm,
    GroupDm,
    Default,
    Space,
}

impl Default for RoomType {
    fn default() -> Self {
        Self::Default
    }
}

impl RoomType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dm => "dm",
            Self::GroupDm => "group_dm",
            Self::Default => "",
            Self::Space => "space",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "dm" => Self::Dm,
            "group_dm" => Self::GroupDm,
            "space" => Self::Space,
            _ => Self::Default,
        }
    }

    pub fn is_dm(&self) -> bool {
        matches!(self, Self::Dm | Self::GroupDm)
    }
}

impl std::fmt::Display for RoomType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset, Serialize, Deserialize)]
#[diesel(table_name = portal)]
#[diesel(treat_none_as_null = true)]
pub struct Portal {
    pub id: String,
    pub receiver: String,
    pub mxid: Option<String>,
    pub name: String,
    pub name_set: bool,
    pub topic: String,
    pub topic_set: bool,
    pub avatar_id: String,
    pub avatar_mxc: String,
    pub avatar_hash: String,
    pub avatar_set: bool,
    pub name_is_custom: bool,
    pub room_type: String,
    pub parent_id: Option<String>,
    pub in_space: bool,
    pub other_user_id: Option<String>,
    pub relay_login_id: Option<String>,
    pub disappear_type: String,
    pub disappear_timer: i64,
    pub metadata: String,
}

impl Portal {
    pub fn new(key: &PortalKey) -> Self {
        Self {
            id: key.id.clone(),
            receiver: key.receiver.clone(),
            mxid: None,
            name: String::new(),
            name_set: false,
            topic: String::new(),
            topic_set: false,
            avatar_id: String::new(),
            avatar_mxc: String::new(),
            avatar_hash: String::new(),
            avatar_set: false,
            name_is_custom: false,
            room_type: String::new(),
            parent_id: None,
            in_space: false,
            other_user_id: None,
            relay_login_id: None,
            disappear_type: String::new(),
            disappear_timer: 0,
            metadata: String::new(),
        }
    }

    pub fn key(&self) -> PortalKey {
        PortalKey::new(&self.id, &self.receiver)
    }

    pub fn room_type(&self) -> RoomType {
        RoomType::parse(&self.room_type)
    }

    pub fn set_room_type(&mut self, room_type: RoomType) {
        self.room_type = room_type.as_str().to_string();
    }

    pub fn disappear(&self) -> DisappearingSetting {
        DisappearingSetting {
            disappear_type: DisappearingType::parse(&self.disappear_type),
            timer: std::time::Duration::from_millis(self.disappear_timer.max(0) as u64),
        }
    }

    pub fn set_disappear(&mut self, setting: &DisappearingSetting) {
        self.disappear_type = setting.disappear_type.as_str().to_string();
        self.disappear_timer = setting.timer.as_millis() as i64;
    }
}

pub struct PortalQuery;

macro_rules! impl_portal_query_for_conn {
    (
        $get_by_key:ident,
        $get_by_mxid:ident,
        $get_all_with_mxid:ident,
        $find_receiver:ident,
        $insert:ident,
        $update:ident,
        $delete:ident,
        $conn_ty:ty
    ) => {
        pub fn $get_by_key(conn: &mut $conn_ty, key: &PortalKey) -> Result<Option<Portal>> {
            let item = portal::table
                .select(Portal::as_select())
                .filter(portal::id.eq(&key.id))
                .filter(portal::receiver.eq(&key.receiver))
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $get_by_mxid(conn: &mut $conn_ty, mxid: &str) -> Result<Option<Portal>> {
            let item = portal::table
                .select(Portal::as_select())
                .filter(portal::mxid.eq(mxid))
                .first(conn)
                .optional()?;
            Ok(item)
        }

        pub fn $get_all_with_mxid(conn: &mut $conn_ty) -> Result<Vec<Portal>> {
            let items = portal::table
                .select(Portal::as_select())
                .filter(portal::mxid.is_not_null())
                .load(conn)?;
            Ok(items)
        }

        pub fn $find_receiver(
            conn: &mut $conn_ty,
            id: &str,
            maybe_receiver: &str,
        ) -> Result<Option<PortalKey>> {
            let candidates: Vec<Portal> = portal::table
                .select(Portal::as_select())
                .filter(portal::id.eq(id))
                .filter(
                    portal::receiver
                        .eq(maybe_receiver)
                        .or(portal::receiver.eq("")),
                )
                .load(conn)?;
            let exact = candidates.iter().find(|p| p.receiver == maybe_receiver);
            Ok(exact.or(candidates.first()).map(Portal::key))
        }

        pub fn $insert(conn: &mut $conn_ty, item: &Portal) -> Result<()> {
            diesel::insert_into(portal::table).values(item).execute(conn)?;
            Ok(())
        }

        pub fn $update(conn: &mut $conn_ty, item: &Portal) -> Result<()> {
            diesel::update(
                portal::table
                    .filter(portal::id.eq(&item.id))
                    .filter(portal::receiver.eq(&item.receiver)),
            )
            .set(item)
            .execute(conn)?;
            Ok(())
        }

        pub fn $delete(conn: &mut $conn_ty, key: &PortalKey) -> Result<()> {
            diesel::delete(
                portal::table
                    .filter(portal::id.eq(&key.id))
                    .filter(portal::receiver.eq(&key.receiver)),
            )
            .execute(conn)?;
            Ok(())
        }
    };
}

impl PortalQuery {
    impl_portal_query_for_conn!(
        get_by_key_sqlite,
        get_by_mxid_sqlite,
        get_all_with_mxid_sqlite,
        find_receiver_sqlite,
        insert_sqlite,
        update_sqlite,
        delete_sqlite,
        SqliteConnection
    );

    impl_portal_query_for_conn!(
        get_by_key_postgres,
        get_by_mxid_postgres,
        get_all_with_mxid_postgres,
        find_receiver_postgres,
        insert_postgres,
        update_postgres,
        delete_postgres,
        PgConnection
    );
}
