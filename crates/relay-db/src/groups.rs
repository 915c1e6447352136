use relay_types::{ContainerConfig, RegisteredGroup, RelayError, Result};

use crate::connection::{decode_ts, encode_ts, Database};

/// Repository for registered conversation storage and retrieval.
pub struct GroupRepository<'a> {
    db: &'a Database,
}

impl<'a> GroupRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Save or update a group keyed by jid.
    ///
    /// Fails if another jid already owns the folder.
    pub async fn save_group(&self, group: &RegisteredGroup) -> Result<()> {
        let allowed_senders = group
            .allowed_senders
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let container_config = group
            .container_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO groups
             (jid, name, folder, trigger_pattern, allowed_senders, container_config,
              requires_trigger, is_main, added_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(jid) DO UPDATE SET
                name = excluded.name,
                folder = excluded.folder,
                trigger_pattern = excluded.trigger_pattern,
                allowed_senders = excluded.allowed_senders,
                container_config = excluded.container_config,
                requires_trigger = excluded.requires_trigger,
                is_main = excluded.is_main",
        )
        .bind(&group.jid)
        .bind(&group.name)
        .bind(&group.folder)
        .bind(&group.trigger)
        .bind(&allowed_senders)
        .bind(&container_config)
        .bind(group.requires_trigger as i32)
        .bind(group.is_main as i32)
        .bind(encode_ts(group.added_at))
        .execute(self.db.pool())
        .await
        .map_err(|e| RelayError::Database(format!("Save group: {e}")))?;

        Ok(())
    }

    /// Get a group by JID.
    pub async fn get_group(&self, jid: &str) -> Result<Option<RegisteredGroup>> {
        let row: Option<GroupRow> = sqlx::query_as(
            "SELECT jid, name, folder, trigger_pattern, allowed_senders, container_config,
                    requires_trigger, is_main, added_at
             FROM groups WHERE jid = ?",
        )
        .bind(jid)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| RelayError::Database(format!("Get group: {e}")))?;

        row.map(row_to_group).transpose()
    }

    /// Get the group owning a working folder.
    pub async fn get_by_folder(&self, folder: &str) -> Result<Option<RegisteredGroup>> {
        let row: Option<GroupRow> = sqlx::query_as(
            "SELECT jid, name, folder, trigger_pattern, allowed_senders, container_config,
                    requires_trigger, is_main, added_at
             FROM groups WHERE folder = ?",
        )
        .bind(folder)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| RelayError::Database(format!("Get group by folder: {e}")))?;

        row.map(row_to_group).transpose()
    }

    /// Get all registered groups.
    pub async fn get_all(&self) -> Result<Vec<RegisteredGroup>> {
        let rows: Vec<GroupRow> = sqlx::query_as(
            "SELECT jid, name, folder, trigger_pattern, allowed_senders, container_config,
                    requires_trigger, is_main, added_at
             FROM groups ORDER BY added_at ASC",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| RelayError::Database(format!("Get all groups: {e}")))?;

        rows.into_iter().map(row_to_group).collect()
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    jid: String,
    name: String,
    folder: String,
    trigger_pattern: String,
    allowed_senders: Option<String>,
    container_config: Option<String>,
    requires_trigger: i32,
    is_main: i32,
    added_at: String,
}

fn row_to_group(row: GroupRow) -> Result<RegisteredGroup> {
    let allowed_senders: Option<Vec<String>> = row
        .allowed_senders
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;
    let container_config: Option<ContainerConfig> = row
        .container_config
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(RegisteredGroup {
        jid: row.jid,
        name: row.name,
        folder: row.folder,
        trigger: row.trigger_pattern,
        allowed_senders,
        container_config,
        requires_trigger: row.requires_trigger != 0,
        is_main: row.is_main != 0,
        added_at: decode_ts(&row.added_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use relay_types::AdditionalMount;

    async fn setup() -> Database {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    fn make_group(jid: &str, name: &str, folder: &str) -> RegisteredGroup {
        RegisteredGroup {
            jid: jid.to_string(),
            name: name.to_string(),
            folder: folder.to_string(),
            trigger: "@Andy".to_string(),
            allowed_senders: None,
            container_config: None,
            requires_trigger: true,
            is_main: false,
            added_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_and_get_group() {
        let db = setup().await;
        let repo = GroupRepository::new(&db);

        let group = make_group("tg:123", "Test Group", "test");
        repo.save_group(&group).await.unwrap();

        let found = repo.get_group("tg:123").await.unwrap().unwrap();
        assert_eq!(found.jid, "tg:123");
        assert_eq!(found.name, "Test Group");
        assert_eq!(found.trigger, "@Andy");
        assert!(found.requires_trigger);
        assert!(!found.is_main);

        let by_folder = repo.get_by_folder("test").await.unwrap().unwrap();
        assert_eq!(by_folder.jid, "tg:123");
    }

    #[tokio::test]
    async fn save_group_upsert() {
        let db = setup().await;
        let repo = GroupRepository::new(&db);

        let mut group = make_group("tg:123", "Old Name", "test");
        repo.save_group(&group).await.unwrap();

        group.name = "New Name".to_string();
        repo.save_group(&group).await.unwrap();

        let found = repo.get_group("tg:123").await.unwrap().unwrap();
        assert_eq!(found.name, "New Name");
        assert_eq!(repo.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn folder_is_unique_across_jids() {
        let db = setup().await;
        let repo = GroupRepository::new(&db);

        repo.save_group(&make_group("a:1", "A", "shared"))
            .await
            .unwrap();
        let err = repo
            .save_group(&make_group("b:2", "B", "shared"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Database(_)));
    }

    #[tokio::test]
    async fn group_not_found() {
        let db = setup().await;
        let repo = GroupRepository::new(&db);

        assert!(repo.get_group("nonexistent").await.unwrap().is_none());
        assert!(repo.get_by_folder("nowhere").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn group_with_json_columns() {
        let db = setup().await;
        let repo = GroupRepository::new(&db);

        let mut group = make_group("tg:1", "G1", "f1");
        group.is_main = true;
        group.allowed_senders = Some(vec!["alice".to_string(), "bob".to_string()]);
        group.container_config = Some(ContainerConfig {
            additional_mounts: vec![AdditionalMount {
                host_path: "/srv/docs".to_string(),
                container_path: Some("docs".to_string()),
                read_write: false,
            }],
            timeout: Some(60),
        });
        repo.save_group(&group).await.unwrap();

        let found = repo.get_group("tg:1").await.unwrap().unwrap();
        assert!(found.is_main);
        assert_eq!(found.allowed_senders, group.allowed_senders);
        assert_eq!(found.container_config, group.container_config);
        assert_eq!(found.timeout_override(), Some(60));
    }
}
