//! User notification settings store.

use async_trait::async_trait;

use crate::Result;
use crate::database::DbPool;
use crate::database::models::UserNotificationSettingsDbModel;
use crate::database::time::now_ms;
use crate::notification::UserNotificationSettings;

/// Source of per-user notification settings.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// `None` when the user has never saved settings.
    async fn get_settings(&self, user_id: i64) -> Result<Option<UserNotificationSettings>>;

    async fn upsert_settings(&self, settings: &UserNotificationSettings) -> Result<()>;
}

/// SQLx implementation of PreferenceStore.
pub struct SqlxPreferenceStore {
    pool: DbPool,
}

impl SqlxPreferenceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PreferenceStore for SqlxPreferenceStore {
    async fn get_settings(&self, user_id: i64) -> Result<Option<UserNotificationSettings>> {
        let row = sqlx::query_as::<_, UserNotificationSettingsDbModel>(
            "SELECT * FROM user_notification_settings WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UserNotificationSettingsDbModel::into_settings)
            .transpose()
    }

    async fn upsert_settings(&self, settings: &UserNotificationSettings) -> Result<()> {
        let row = UserNotificationSettingsDbModel::from_settings(settings, now_ms())?;
        sqlx::query(
            r#"
            INSERT INTO user_notification_settings (user_id, channels, types, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                channels = excluded.channels,
                types = excluded.types,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(row.user_id)
        .bind(&row.channels)
        .bind(&row.types)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
