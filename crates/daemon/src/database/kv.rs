use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};

use common::kv::{key_for, KvError, KvNode, KvProvider};

use super::Database;

/// Key-value provider over the node's SQLite database.
///
/// Every write bumps a store-wide revision inside the same transaction, and
///  the bump comes first so the transaction holds SQLite's write lock before
///  it reads anything it compares against.
#[derive(Debug, Clone)]
pub struct SqliteKv {
    db: Database,
    namespace: String,
}

type Row = (String, String, i64);

fn into_node((key, value, modified_index): Row) -> KvNode {
    KvNode {
        key,
        value,
        modified_index: modified_index.max(0) as u64,
    }
}

impl SqliteKv {
    pub fn new(db: Database, namespace: impl Into<String>) -> Self {
        Self {
            db,
            namespace: namespace.into(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn prefix(&self, prefix: &str) -> String {
        key_for(&self.namespace, prefix.trim_matches('/'))
    }

    async fn bump_revision(tx: &mut Transaction<'_, Sqlite>) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "UPDATE kv_meta SET value = value + 1 WHERE name = 'revision' RETURNING value",
        )
        .fetch_one(&mut **tx)
        .await
    }

    async fn upsert(
        tx: &mut Transaction<'_, Sqlite>,
        prefix: &str,
        key: &str,
        value: &str,
        revision: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO kv_nodes (key, prefix, value, modified_index)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                modified_index = excluded.modified_index
            "#,
        )
        .bind(key)
        .bind(prefix)
        .bind(value)
        .bind(revision)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KvProvider for SqliteKv {
    type Error = sqlx::Error;

    async fn get_by_id(&self, prefix: &str, id: &str) -> Result<KvNode, KvError<Self::Error>> {
        let key = key_for(&self.prefix(prefix), id);
        let row = sqlx::query_as::<_, Row>(
            "SELECT key, value, modified_index FROM kv_nodes WHERE key = ?1",
        )
        .bind(&key)
        .fetch_optional(&*self.db)
        .await?;
        row.map(into_node).ok_or(KvError::NotFound(key))
    }

    async fn set(
        &self,
        prefix: &str,
        id: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>> {
        let prefix = self.prefix(prefix);
        let key = key_for(&prefix, id);
        let mut tx = self.db.begin().await?;
        let revision = Self::bump_revision(&mut tx).await?;
        Self::upsert(&mut tx, &prefix, &key, &value, revision).await?;
        tx.commit().await?;
        Ok(into_node((key, value, revision)))
    }

    async fn create(
        &self,
        prefix: &str,
        id: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>> {
        let prefix = self.prefix(prefix);
        let key = key_for(&prefix, id);
        let mut tx = self.db.begin().await?;
        let revision = Self::bump_revision(&mut tx).await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO kv_nodes (key, prefix, value, modified_index)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO NOTHING
            "#,
        )
        .bind(&key)
        .bind(&prefix)
        .bind(&value)
        .bind(revision)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            // dropping the transaction rolls the revision back
            return Err(KvError::AlreadyExists(key));
        }
        tx.commit().await?;
        Ok(into_node((key, value, revision)))
    }

    async fn compare_and_swap(
        &self,
        prefix: &str,
        id: &str,
        expected: &str,
        value: String,
    ) -> Result<KvNode, KvError<Self::Error>> {
        let key = key_for(&self.prefix(prefix), id);
        let mut tx = self.db.begin().await?;
        let revision = Self::bump_revision(&mut tx).await?;
        let swapped = sqlx::query(
            "UPDATE kv_nodes SET value = ?1, modified_index = ?2 WHERE key = ?3 AND value = ?4",
        )
        .bind(&value)
        .bind(revision)
        .bind(&key)
        .bind(expected)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if swapped == 0 {
            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM kv_nodes WHERE key = ?1",
            )
            .bind(&key)
            .fetch_one(&mut *tx)
            .await?;
            return Err(if exists == 0 {
                KvError::NotFound(key)
            } else {
                KvError::Conflict(key)
            });
        }

        tx.commit().await?;
        Ok(into_node((key, value, revision)))
    }

    async fn delete(&self, prefix: &str, id: &str) -> Result<(), KvError<Self::Error>> {
        let key = key_for(&self.prefix(prefix), id);
        let mut tx = self.db.begin().await?;
        Self::bump_revision(&mut tx).await?;
        let removed = sqlx::query("DELETE FROM kv_nodes WHERE key = ?1")
            .bind(&key)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(KvError::NotFound(key));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvNode>, KvError<Self::Error>> {
        let rows = sqlx::query_as::<_, Row>(
            "SELECT key, value, modified_index FROM kv_nodes WHERE prefix = ?1 ORDER BY key",
        )
        .bind(self.prefix(prefix))
        .fetch_all(&*self.db)
        .await?;
        Ok(rows.into_iter().map(into_node).collect())
    }

    async fn add_to_index(
        &self,
        prefix: &str,
        name: &str,
        id: &str,
    ) -> Result<(), KvError<Self::Error>> {
        sqlx::query(
            r#"
            INSERT INTO kv_index (prefix, name, id) VALUES (?1, ?2, ?3)
            ON CONFLICT(prefix, name) DO UPDATE SET id = excluded.id
            "#,
        )
        .bind(self.prefix(prefix))
        .bind(name)
        .bind(id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn delete_from_index(
        &self,
        prefix: &str,
        name: &str,
    ) -> Result<(), KvError<Self::Error>> {
        let prefix = self.prefix(prefix);
        let removed = sqlx::query("DELETE FROM kv_index WHERE prefix = ?1 AND name = ?2")
            .bind(&prefix)
            .bind(name)
            .execute(&*self.db)
            .await?
            .rows_affected();
        if removed == 0 {
            return Err(KvError::NotFound(key_for(&prefix, name)));
        }
        Ok(())
    }

    async fn find_id(&self, prefix: &str, name: &str) -> Result<String, KvError<Self::Error>> {
        let prefix = self.prefix(prefix);
        sqlx::query_scalar::<_, String>("SELECT id FROM kv_index WHERE prefix = ?1 AND name = ?2")
            .bind(&prefix)
            .bind(name)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| KvError::NotFound(key_for(&prefix, name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn kv() -> SqliteKv {
        SqliteKv::new(Database::in_memory().await.unwrap(), "test.dots.io")
    }

    #[tokio::test]
    async fn test_create_then_conflict() {
        let kv = kv().await;
        let node = kv.create("things", "a", "1".to_string()).await.unwrap();
        assert_eq!(node.id(), "a");
        assert_eq!(node.key, "test.dots.io/things/a");

        let again = kv.create("things", "a", "2".to_string()).await;
        assert!(matches!(again, Err(KvError::AlreadyExists(_))));
        assert_eq!(kv.get_by_id("things", "a").await.unwrap().value, "1");
    }

    #[tokio::test]
    async fn test_failed_create_does_not_consume_revision() {
        let kv = kv().await;
        let first = kv.create("things", "a", "1".to_string()).await.unwrap();
        let _ = kv.create("things", "a", "2".to_string()).await;
        let second = kv.set("things", "b", "3".to_string()).await.unwrap();
        assert_eq!(second.modified_index, first.modified_index + 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let kv = kv().await;
        kv.set("things", "a", "old".to_string()).await.unwrap();

        let swapped = kv
            .compare_and_swap("things", "a", "old", "new".to_string())
            .await
            .unwrap();
        assert_eq!(swapped.value, "new");

        let stale = kv
            .compare_and_swap("things", "a", "old", "newer".to_string())
            .await;
        assert!(matches!(stale, Err(KvError::Conflict(_))));

        let missing = kv
            .compare_and_swap("things", "zzz", "old", "new".to_string())
            .await;
        assert!(matches!(missing, Err(KvError::NotFound(_))));
        assert_eq!(kv.get_by_id("things", "a").await.unwrap().value, "new");
    }

    #[tokio::test]
    async fn test_delete() {
        let kv = kv().await;
        kv.set("things", "a", "1".to_string()).await.unwrap();
        kv.delete("things", "a").await.unwrap();
        assert!(matches!(
            kv.get_by_id("things", "a").await,
            Err(KvError::NotFound(_))
        ));
        assert!(matches!(
            kv.delete("things", "a").await,
            Err(KvError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_direct_children() {
        let kv = kv().await;
        kv.set("things", "b", "2".to_string()).await.unwrap();
        kv.set("things", "a", "1".to_string()).await.unwrap();
        kv.set("things/nested", "c", "3".to_string()).await.unwrap();

        let ids: Vec<_> = kv
            .list("things")
            .await
            .unwrap()
            .iter()
            .map(|n| n.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_index_lookup() {
        let kv = kv().await;
        let id = uuid::Uuid::new_v4().to_string();
        kv.create_with_index("things", &id, "alice/data", "payload".to_string())
            .await
            .unwrap();
        assert_eq!(kv.find_id("things", "alice/data").await.unwrap(), id);
        assert_eq!(kv.get("things", "alice/data").await.unwrap().value, "payload");

        kv.delete_from_index("things", "alice/data").await.unwrap();
        assert!(matches!(
            kv.delete_from_index("things", "alice/data").await,
            Err(KvError::NotFound(_))
        ));
    }
}
