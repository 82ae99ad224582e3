//! User profile rows.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use fitlink_shared::Role;

use crate::database::{format_ts, parse_enum, Database};
use crate::error::Result;
use crate::models::ProfileSummary;

impl Database {
    /// Insert the user if unknown. An existing row keeps its profile fields.
    pub fn ensure_user(&self, user_id: &str, role: Role) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, role, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO NOTHING",
            params![user_id, role.as_str(), format_ts(&Utc::now())],
        )?;
        Ok(())
    }

    /// Upsert the public profile fields.
    pub fn update_profile(
        &self,
        user_id: &str,
        role: Role,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<ProfileSummary> {
        self.conn().execute(
            "INSERT INTO users (id, role, display_name, avatar_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = excluded.display_name,
                 avatar_url   = excluded.avatar_url",
            params![
                user_id,
                role.as_str(),
                display_name,
                avatar_url,
                format_ts(&Utc::now())
            ],
        )?;

        Ok(ProfileSummary {
            user_id: user_id.to_string(),
            display_name: display_name.map(str::to_string),
            avatar_url: avatar_url.map(str::to_string),
        })
    }

    /// The role recorded for `user_id`, if the user is known.
    pub fn user_role(&self, user_id: &str) -> Result<Option<Role>> {
        let role = self
            .conn()
            .query_row(
                "SELECT role FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    let raw: String = row.get(0)?;
                    parse_enum::<Role>(0, &raw)
                },
            )
            .optional()?;
        Ok(role)
    }
}
