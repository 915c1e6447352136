use std::collections::HashMap;
use std::sync::Arc;

use relay_db::{Database, GroupRepository};
use relay_types::{RegisteredGroup, RelayError, Result};
use tokio::sync::RwLock;
use tracing::info;

use crate::security::validate_folder_name;

/// Registered conversations, cached in memory and persisted in the database.
pub struct GroupRegistry {
    db: Arc<Database>,
    groups: RwLock<HashMap<String, RegisteredGroup>>,
}

impl GroupRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Load every persisted group into memory. Returns the number loaded.
    pub async fn load(&self) -> Result<usize> {
        let all = GroupRepository::new(&self.db).get_all().await?;
        let mut groups = self.groups.write().await;
        groups.clear();
        for group in all {
            groups.insert(group.jid.clone(), group);
        }
        info!(count = groups.len(), "Loaded registered groups");
        Ok(groups.len())
    }

    /// Register a conversation or update its settings.
    ///
    /// The folder of an existing jid cannot change, and a folder belongs to one jid.
    pub async fn register(&self, mut group: RegisteredGroup) -> Result<RegisteredGroup> {
        validate_folder_name(&group.folder)?;
        if group.trigger.trim().is_empty() {
            return Err(RelayError::Config(format!(
                "Group {} needs a trigger phrase",
                group.jid
            )));
        }

        let mut groups = self.groups.write().await;
        if let Some(existing) = groups.get(&group.jid) {
            if existing.folder != group.folder {
                return Err(RelayError::Config(format!(
                    "Folder of {} is '{}' and cannot change to '{}'",
                    group.jid, existing.folder, group.folder
                )));
            }
            group.added_at = existing.added_at;
        }
        if let Some(owner) = groups
            .values()
            .find(|g| g.folder == group.folder && g.jid != group.jid)
        {
            return Err(RelayError::Config(format!(
                "Folder '{}' already belongs to {}",
                group.folder, owner.jid
            )));
        }

        GroupRepository::new(&self.db).save_group(&group).await?;
        groups.insert(group.jid.clone(), group.clone());

        info!(
            jid = %group.jid,
            folder = %group.folder,
            is_main = group.is_main,
            "Group registered"
        );
        Ok(group)
    }

    pub async fn get(&self, jid: &str) -> Option<RegisteredGroup> {
        self.groups.read().await.get(jid).cloned()
    }

    pub async fn get_by_folder(&self, folder: &str) -> Option<RegisteredGroup> {
        self.groups
            .read()
            .await
            .values()
            .find(|g| g.folder == folder)
            .cloned()
    }

    /// Whether `folder` belongs to a privileged conversation.
    pub async fn is_main_folder(&self, folder: &str) -> bool {
        self.groups
            .read()
            .await
            .values()
            .any(|g| g.folder == folder && g.is_main)
    }

    pub async fn all(&self) -> Vec<RegisteredGroup> {
        let mut groups: Vec<RegisteredGroup> = self.groups.read().await.values().cloned().collect();
        groups.sort_by(|a, b| a.folder.cmp(&b.folder));
        groups
    }

    pub async fn len(&self) -> usize {
        self.groups.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.groups.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn setup() -> Arc<Database> {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        Arc::new(db)
    }

    fn make_group(jid: &str, folder: &str, is_main: bool) -> RegisteredGroup {
        RegisteredGroup {
            jid: jid.to_string(),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger: "@Andy".to_string(),
            allowed_senders: None,
            container_config: None,
            requires_trigger: true,
            is_main,
            added_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let db = setup().await;
        let registry = GroupRegistry::new(db.clone());

        registry.register(make_group("tg:1", "main", true)).await.unwrap();
        registry.register(make_group("tg:2", "acme", false)).await.unwrap();

        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.get("tg:2").await.unwrap().folder, "acme");
        assert_eq!(registry.get_by_folder("main").await.unwrap().jid, "tg:1");
        assert!(registry.is_main_folder("main").await);
        assert!(!registry.is_main_folder("acme").await);
        assert!(!registry.is_main_folder("ghost").await);

        // Survives a reload from the database
        let reloaded = GroupRegistry::new(db);
        assert_eq!(reloaded.load().await.unwrap(), 2);
        assert!(reloaded.get("tg:1").await.unwrap().is_main);
    }

    #[tokio::test]
    async fn folder_is_immutable_and_unique() {
        let registry = GroupRegistry::new(setup().await);
        registry.register(make_group("tg:1", "acme", false)).await.unwrap();

        let err = registry
            .register(make_group("tg:1", "renamed", false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot change"));

        let err = registry
            .register(make_group("tg:2", "acme", false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already belongs"));

        // Updating other settings is fine
        let mut updated = make_group("tg:1", "acme", false);
        updated.name = "Acme Corp".to_string();
        registry.register(updated).await.unwrap();
        assert_eq!(registry.get("tg:1").await.unwrap().name, "Acme Corp");
    }

    #[tokio::test]
    async fn invalid_folder_rejected() {
        let registry = GroupRegistry::new(setup().await);
        assert!(registry
            .register(make_group("tg:1", "../etc", false))
            .await
            .is_err());
        assert!(registry
            .register(make_group("tg:1", "errors", false))
            .await
            .is_err());
        assert!(registry.is_empty().await);
    }
}
