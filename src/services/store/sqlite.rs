use anyhow::Error;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};

use crate::settings::Settings;
use crate::xmpp::jid::Jid;

use super::StoreBackend;

pub struct SqliteStoreBackend {
    pool: Pool<Sqlite>,
}

impl SqliteStoreBackend {
    pub async fn new(settings: &Settings) -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&settings.database_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                bare_jid TEXT PRIMARY KEY,
                stored_password TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }
}

impl StoreBackend for SqliteStoreBackend {
    async fn get_stored_password(&self, jid: Jid) -> Option<String> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT bare_jid, stored_password
            FROM users
            WHERE bare_jid = ?
            "#,
        )
        .bind(jid.to_bare().to_string())
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        user.map(|user| user.stored_password)
    }

    async fn add_user(&mut self, jid: Jid, stored_password: String) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO users (bare_jid, stored_password)
            VALUES (?, ?)
            "#,
        )
        .bind(jid.to_bare().to_string())
        .bind(stored_password)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_user(&mut self, jid: Jid) -> Result<(), Error> {
        sqlx::query(
            r#"
            DELETE FROM users
            WHERE bare_jid = ?
            "#,
        )
        .bind(jid.to_bare().to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct User {
    #[allow(dead_code)]
    bare_jid: String,
    stored_password: String,
}
