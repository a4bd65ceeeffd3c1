//! Dirty record scans.

use crate::{error::Result, store::LocalStore, Record, Registry, TableName};

/// Dirty records grouped by table, in dependency order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirtySet {
    tables: Vec<(TableName, Vec<Record>)>,
}

impl DirtySet {
    /// Dirty records of one table.
    pub fn get(&self, table: &str) -> &[Record] {
        self.tables
            .iter()
            .find(|(name, _)| name == table)
            .map(|(_, records)| records.as_slice())
            .unwrap_or(&[])
    }

    /// Iterate `(table, records)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&TableName, &[Record])> {
        self.tables.iter().map(|(t, r)| (t, r.as_slice()))
    }

    /// Total dirty records across all tables.
    pub fn total(&self) -> usize {
        self.tables.iter().map(|(_, r)| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Read-only scan of locally dirty records.
///
/// Cost follows the store's dirty index, so it is proportional to the dirty
/// set rather than the table size.
pub struct DirtyTracker<'a, L: LocalStore + ?Sized> {
    local: &'a L,
    registry: &'a Registry,
}

impl<'a, L: LocalStore + ?Sized> DirtyTracker<'a, L> {
    pub fn new(local: &'a L, registry: &'a Registry) -> Self {
        Self { local, registry }
    }

    /// Dirty records of every declared table.
    pub async fn scan(&self) -> Result<DirtySet> {
        let mut tables = Vec::with_capacity(self.registry.len());
        for descriptor in self.registry.dependency_order() {
            let records = self.local.get_dirty(&descriptor.table).await?;
            tables.push((descriptor.table.clone(), records));
        }
        Ok(DirtySet { tables })
    }

    /// Dirty records of one declared table.
    pub async fn scan_table(&self, table: &str) -> Result<Vec<Record>> {
        self.registry.get(table)?;
        let mut records = self.local.get_dirty(table).await?;
        // Stable order keeps push runs reproducible.
        records.sort_by(|a, b| a.last_modified.cmp(&b.last_modified).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    /// Dirty counts per declared table.
    pub async fn counts(&self) -> Result<Vec<(TableName, usize)>> {
        let mut counts = Vec::with_capacity(self.registry.len());
        for descriptor in self.registry.dependency_order() {
            let n = self.local.dirty_count(&descriptor.table).await?;
            counts.push((descriptor.table.clone(), n));
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityDescriptor, Error, MemoryLocalStore};
    use serde_json::json;

    fn registry() -> Registry {
        Registry::new(vec![
            EntityDescriptor::local_authoritative("contracts")
                .with_dependent("change_orders", "contractId"),
            EntityDescriptor::remote_assigned("change_orders", ["contractId", "number"]),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn scan_groups_by_table() {
        let store = MemoryLocalStore::new();
        store
            .put(Record::new_local("c-1", "contracts", json!({}), 1000))
            .await
            .unwrap();
        store
            .put(Record::new_local("tmp-1", "change_orders", json!({}), 1000))
            .await
            .unwrap();
        store
            .put(Record::new_local("tmp-2", "change_orders", json!({}), 1001))
            .await
            .unwrap();
        let mut clean = Record::new_local("c-2", "contracts", json!({}), 1000);
        clean.mark_synced(1000);
        store.put(clean).await.unwrap();

        let registry = registry();
        let tracker = DirtyTracker::new(&store, &registry);
        let dirty = tracker.scan().await.unwrap();

        assert_eq!(dirty.total(), 3);
        assert_eq!(dirty.get("contracts").len(), 1);
        assert_eq!(dirty.get("change_orders").len(), 2);
        assert!(dirty.get("nope").is_empty());

        let order: Vec<_> = dirty.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(order, vec!["contracts", "change_orders"]);
    }

    #[tokio::test]
    async fn scan_is_read_only() {
        let store = MemoryLocalStore::new();
        store
            .put(Record::new_local("c-1", "contracts", json!({}), 1000))
            .await
            .unwrap();
        let registry = registry();
        let tracker = DirtyTracker::new(&store, &registry);

        tracker.scan().await.unwrap();
        tracker.scan().await.unwrap();
        assert_eq!(store.dirty_count("contracts").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scan_table_orders_by_modification() {
        let store = MemoryLocalStore::new();
        store
            .put(Record::new_local("b", "change_orders", json!({}), 2000))
            .await
            .unwrap();
        store
            .put(Record::new_local("a", "change_orders", json!({}), 3000))
            .await
            .unwrap();
        store
            .put(Record::new_local("c", "change_orders", json!({}), 1000))
            .await
            .unwrap();

        let registry = registry();
        let tracker = DirtyTracker::new(&store, &registry);
        let ids: Vec<_> = tracker
            .scan_table("change_orders")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        assert!(matches!(
            tracker.scan_table("unknown").await,
            Err(Error::UnknownTable(_))
        ));
    }

    #[tokio::test]
    async fn counts() {
        let store = MemoryLocalStore::new();
        store
            .put(Record::new_local("tmp-1", "change_orders", json!({}), 1000))
            .await
            .unwrap();
        let registry = registry();
        let counts = DirtyTracker::new(&store, &registry).counts().await.unwrap();
        assert_eq!(
            counts,
            vec![("contracts".to_string(), 0), ("change_orders".to_string(), 1)]
        );
    }
}
