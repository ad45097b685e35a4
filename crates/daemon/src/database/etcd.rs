//! etcd-backed key-value provider, for nodes that share cluster state.
//!
//! Values live at `<namespace>/<prefix>/<id>`. The name index lives under a
//! separate `<namespace>/_index/` tree so listing a prefix never sees it.
//! Conditional writes are single etcd transactions, which makes `create`
//! and `compare_and_swap` atomic across every node talking to the cluster.

use common::kv::key_for;

/// Key layout of an etcd-backed store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdLayout {
    namespace: String,
}

impl EtcdLayout {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into().trim_end_matches('/').to_string(),
        }
    }

    fn dir(&self, prefix: &str) -> String {
        key_for(&self.namespace, prefix.trim_matches('/'))
    }

    pub fn value_key(&self, prefix: &str, id: &str) -> String {
        key_for(&self.dir(prefix), id)
    }

    pub fn index_key(&self, prefix: &str, name: &str) -> String {
        format!(
            "{}/_index/{}/{}",
            self.namespace,
            prefix.trim_matches('/'),
            name
        )
    }

    /// Key prefix covering every value under `prefix`
    pub fn range(&self, prefix: &str) -> String {
        format!("{}/", self.dir(prefix))
    }

    /// Whether `key` sits directly under `prefix` rather than deeper down
    pub fn is_direct_child(&self, prefix: &str, key: &str) -> bool {
        key.strip_prefix(&self.range(prefix))
            .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
    }
}

#[cfg(feature = "etcd")]
pub use provider::EtcdKv;

#[cfg(feature = "etcd")]
mod provider {
    use std::fmt;

    use async_trait::async_trait;
    use etcd_client::{
        Client, Compare, CompareOp, GetOptions, KeyValue, ResponseHeader, Txn, TxnOp,
        TxnOpResponse,
    };

    use common::kv::{KvError, KvNode, KvProvider};

    use super::EtcdLayout;

    #[derive(Clone)]
    pub struct EtcdKv {
        client: Client,
        layout: EtcdLayout,
    }

    impl fmt::Debug for EtcdKv {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("EtcdKv")
                .field("layout", &self.layout)
                .finish()
        }
    }

    impl EtcdKv {
        pub async fn connect(
            endpoints: &[String],
            namespace: impl Into<String>,
        ) -> Result<Self, etcd_client::Error> {
            tracing::info!(?endpoints, "connecting to etcd");
            let client = Client::connect(endpoints, None).await?;
            Ok(Self {
                client,
                layout: EtcdLayout::new(namespace),
            })
        }

        pub fn layout(&self) -> &EtcdLayout {
            &self.layout
        }
    }

    fn revision(header: Option<&ResponseHeader>) -> u64 {
        header.map(|h| h.revision().max(0) as u64).unwrap_or(0)
    }

    fn into_node(kv: &KeyValue) -> KvNode {
        KvNode {
            key: String::from_utf8_lossy(kv.key()).into_owned(),
            value: String::from_utf8_lossy(kv.value()).into_owned(),
            modified_index: kv.mod_revision().max(0) as u64,
        }
    }

    #[async_trait]
    impl KvProvider for EtcdKv {
        type Error = etcd_client::Error;

        async fn get_by_id(&self, prefix: &str, id: &str) -> Result<KvNode, KvError<Self::Error>> {
            let key = self.layout.value_key(prefix, id);
            let resp = self.client.clone().get(key.as_str(), None).await?;
            resp.kvs().first().map(into_node).ok_or(KvError::NotFound(key))
        }

        async fn set(
            &self,
            prefix: &str,
            id: &str,
            value: String,
        ) -> Result<KvNode, KvError<Self::Error>> {
            let key = self.layout.value_key(prefix, id);
            let resp = self
                .client
                .clone()
                .put(key.as_str(), value.as_str(), None)
                .await?;
            Ok(KvNode {
                key,
                value,
                modified_index: revision(resp.header()),
            })
        }

        async fn create(
            &self,
            prefix: &str,
            id: &str,
            value: String,
        ) -> Result<KvNode, KvError<Self::Error>> {
            let key = self.layout.value_key(prefix, id);
            // version 0 means the key has never been written, or was deleted
            let txn = Txn::new()
                .when([Compare::version(key.as_str(), CompareOp::Equal, 0)])
                .and_then([TxnOp::put(key.as_str(), value.as_str(), None)]);
            let resp = self.client.clone().txn(txn).await?;
            if !resp.succeeded() {
                return Err(KvError::AlreadyExists(key));
            }
            Ok(KvNode {
                key,
                value,
                modified_index: revision(resp.header()),
            })
        }

        async fn compare_and_swap(
            &self,
            prefix: &str,
            id: &str,
            expected: &str,
            value: String,
        ) -> Result<KvNode, KvError<Self::Error>> {
            let key = self.layout.value_key(prefix, id);
            let txn = Txn::new()
                .when([Compare::value(key.as_str(), CompareOp::Equal, expected)])
                .and_then([TxnOp::put(key.as_str(), value.as_str(), None)])
                .or_else([TxnOp::get(key.as_str(), None)]);
            let resp = self.client.clone().txn(txn).await?;
            if resp.succeeded() {
                return Ok(KvNode {
                    key,
                    value,
                    modified_index: revision(resp.header()),
                });
            }

            let exists = resp.op_responses().iter().any(|op| match op {
                TxnOpResponse::Get(get) => !get.kvs().is_empty(),
                _ => false,
            });
            Err(if exists {
                KvError::Conflict(key)
            } else {
                KvError::NotFound(key)
            })
        }

        async fn delete(&self, prefix: &str, id: &str) -> Result<(), KvError<Self::Error>> {
            let key = self.layout.value_key(prefix, id);
            let resp = self.client.clone().delete(key.as_str(), None).await?;
            if resp.deleted() == 0 {
                return Err(KvError::NotFound(key));
            }
            Ok(())
        }

        async fn list(&self, prefix: &str) -> Result<Vec<KvNode>, KvError<Self::Error>> {
            let range = self.layout.range(prefix);
            let resp = self
                .client
                .clone()
                .get(range.as_str(), Some(GetOptions::new().with_prefix()))
                .await?;
            let mut nodes: Vec<KvNode> = resp
                .kvs()
                .iter()
                .map(into_node)
                .filter(|node| self.layout.is_direct_child(prefix, &node.key))
                .collect();
            nodes.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(nodes)
        }

        async fn add_to_index(
            &self,
            prefix: &str,
            name: &str,
            id: &str,
        ) -> Result<(), KvError<Self::Error>> {
            let key = self.layout.index_key(prefix, name);
            self.client.clone().put(key, id, None).await?;
            Ok(())
        }

        async fn delete_from_index(
            &self,
            prefix: &str,
            name: &str,
        ) -> Result<(), KvError<Self::Error>> {
            let key = self.layout.index_key(prefix, name);
            let resp = self.client.clone().delete(key.as_str(), None).await?;
            if resp.deleted() == 0 {
                return Err(KvError::NotFound(key));
            }
            Ok(())
        }

        async fn find_id(&self, prefix: &str, name: &str) -> Result<String, KvError<Self::Error>> {
            let key = self.layout.index_key(prefix, name);
            let resp = self.client.clone().get(key.as_str(), None).await?;
            resp.kvs()
                .first()
                .map(|kv| String::from_utf8_lossy(kv.value()).into_owned())
                .ok_or(KvError::NotFound(key))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        /// Needs a live cluster: `DOTS_TEST_ETCD=http://127.0.0.1:2379`
        async fn live_kv() -> Option<EtcdKv> {
            let endpoint = std::env::var("DOTS_TEST_ETCD").ok()?;
            let namespace = format!("test.dots.io/{}", uuid::Uuid::new_v4());
            Some(EtcdKv::connect(&[endpoint], namespace).await.unwrap())
        }

        #[tokio::test]
        async fn test_conditional_writes_against_live_cluster() {
            let Some(kv) = live_kv().await else {
                return;
            };

            kv.create("things", "a", "old".to_string()).await.unwrap();
            assert!(matches!(
                kv.create("things", "a", "again".to_string()).await,
                Err(KvError::AlreadyExists(_))
            ));

            let swapped = kv
                .compare_and_swap("things", "a", "old", "new".to_string())
                .await
                .unwrap();
            assert_eq!(swapped.value, "new");
            assert!(matches!(
                kv.compare_and_swap("things", "a", "old", "x".to_string())
                    .await,
                Err(KvError::Conflict(_))
            ));
            assert!(matches!(
                kv.compare_and_swap("things", "zzz", "old", "x".to_string())
                    .await,
                Err(KvError::NotFound(_))
            ));

            kv.set("things/nested", "c", "3".to_string()).await.unwrap();
            let listed: Vec<_> = kv
                .list("things")
                .await
                .unwrap()
                .iter()
                .map(|n| n.id().to_string())
                .collect();
            assert_eq!(listed, vec!["a"]);

            kv.add_to_index("things", "alice/data", "a").await.unwrap();
            assert_eq!(kv.find_id("things", "alice/data").await.unwrap(), "a");
            kv.delete_from_index("things", "alice/data").await.unwrap();
            kv.delete("things", "a").await.unwrap();
            assert!(matches!(
                kv.delete("things", "a").await,
                Err(KvError::NotFound(_))
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_and_index_keys() {
        let layout = EtcdLayout::new("dots.io/");
        assert_eq!(
            layout.value_key("filesystems/masters", "fs-1"),
            "dots.io/filesystems/masters/fs-1"
        );
        assert_eq!(
            layout.index_key("filesystems/registry", "admin/data"),
            "dots.io/_index/filesystems/registry/admin/data"
        );
        assert_eq!(layout.range("/things/"), "dots.io/things/");
    }

    #[test]
    fn test_direct_children_only() {
        let layout = EtcdLayout::new("dots.io");
        assert!(layout.is_direct_child("things", "dots.io/things/a"));
        assert!(!layout.is_direct_child("things", "dots.io/things/nested/c"));
        assert!(!layout.is_direct_child("things", "dots.io/things/"));
        assert!(!layout.is_direct_child("things", "dots.io/thingsmore/a"));
        // index entries never show up in a listing
        let index = layout.index_key("things", "a");
        assert!(!layout.is_direct_child("things", &index));
    }
}
