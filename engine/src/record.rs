//! Record types held in the local cache and exchanged with the remote store.

use crate::{error::Result, Error, RecordId, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Ordered map of business-key field names to their values.
pub type BusinessKey = BTreeMap<String, Value>;

/// A locally cached record of any entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Local primary key (the working identity)
    pub id: RecordId,
    /// Table this record belongs to
    pub table: TableName,
    /// Identity on the remote store, once known
    pub remote_id: Option<RecordId>,
    /// Field values (JSON object)
    pub payload: Value,
    /// Not yet confirmed persisted on the remote store
    pub dirty: bool,
    /// Soft delete flag (tombstone)
    pub deleted: bool,
    /// When the record last round-tripped with the remote store
    pub last_sync: Option<Timestamp>,
    /// When the record content last changed (locally or remotely)
    pub last_modified: Timestamp,
}

impl Record {
    /// Create a new, locally authored record. It starts dirty with no remote identity.
    pub fn new_local(
        id: impl Into<RecordId>,
        table: impl Into<TableName>,
        payload: Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            remote_id: None,
            payload,
            dirty: true,
            deleted: false,
            last_sync: None,
            last_modified: timestamp,
        }
    }

    /// Build a clean local record from an authoritative remote row.
    pub fn from_remote(row: &RemoteRow, synced_at: Timestamp) -> Self {
        Self {
            id: row.id.clone(),
            table: row.table.clone(),
            remote_id: Some(row.id.clone()),
            payload: row.payload.clone(),
            dirty: false,
            deleted: false,
            last_sync: Some(synced_at),
            last_modified: row.last_modified,
        }
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Replace the payload and mark the record for the next push.
    pub fn update_payload(&mut self, payload: Value, timestamp: Timestamp) {
        self.payload = payload;
        self.touch(timestamp);
    }

    /// Set a single payload field and mark the record for the next push.
    pub fn set_field(&mut self, field: &str, value: Value, timestamp: Timestamp) {
        if let Value::Object(map) = &mut self.payload {
            map.insert(field.to_string(), value);
        } else {
            let mut map = serde_json::Map::new();
            map.insert(field.to_string(), value);
            self.payload = Value::Object(map);
        }
        self.touch(timestamp);
    }

    /// Tombstone the record; the deletion travels with the next push.
    pub fn mark_deleted(&mut self, timestamp: Timestamp) {
        self.deleted = true;
        self.touch(timestamp);
    }

    /// Mark as dirty without changing content.
    pub fn touch(&mut self, timestamp: Timestamp) {
        self.dirty = true;
        self.last_modified = timestamp;
    }

    /// Mark as confirmed by the remote store.
    pub fn mark_synced(&mut self, timestamp: Timestamp) {
        self.dirty = false;
        self.last_sync = Some(timestamp);
    }

    /// Read a payload field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Extract the business key from the payload.
    ///
    /// Every named field must be present and non-null.
    pub fn business_key(&self, fields: &[String]) -> Result<BusinessKey> {
        let mut key = BusinessKey::new();
        for field in fields {
            match self.payload.get(field) {
                None | Some(Value::Null) => {
                    return Err(Error::validation(
                        self.table.clone(),
                        self.id.clone(),
                        format!("business key field '{}' is missing", field),
                    ))
                }
                Some(value) => {
                    key.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(key)
    }
}

/// A row as the remote store holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRow {
    /// Remote primary key
    pub id: RecordId,
    /// Table the row lives in
    pub table: TableName,
    /// Field values (JSON object)
    pub payload: Value,
    /// Server-side modification time
    pub last_modified: Timestamp,
}

/// A recorded local-to-remote identity mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    pub table: TableName,
    pub local_id: RecordId,
    pub remote_id: RecordId,
    pub mapped_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_local_record_is_dirty() {
        let record = Record::new_local(
            "tmp-1",
            "change_orders",
            json!({"number": "CO-1"}),
            1000,
        );

        assert!(record.dirty);
        assert!(record.is_active());
        assert!(record.remote_id.is_none());
        assert!(record.last_sync.is_none());
        assert_eq!(record.last_modified, 1000);
    }

    #[test]
    fn from_remote_is_clean() {
        let row = RemoteRow {
            id: "R-1".into(),
            table: "contracts".into(),
            payload: json!({"name": "Bridge"}),
            last_modified: 500,
        };
        let record = Record::from_remote(&row, 900);

        assert_eq!(record.id, "R-1");
        assert_eq!(record.remote_id.as_deref(), Some("R-1"));
        assert!(!record.dirty);
        assert_eq!(record.last_sync, Some(900));
        assert_eq!(record.last_modified, 500);
    }

    #[test]
    fn set_field_marks_dirty() {
        let row = RemoteRow {
            id: "R-1".into(),
            table: "change_order_items".into(),
            payload: json!({"changeOrderId": "tmp-1"}),
            last_modified: 500,
        };
        let mut record = Record::from_remote(&row, 900);
        record.set_field("changeOrderId", json!("R-77"), 1000);

        assert!(record.dirty);
        assert_eq!(record.field("changeOrderId"), Some(&json!("R-77")));
        assert_eq!(record.last_modified, 1000);
    }

    #[test]
    fn business_key_extraction() {
        let record = Record::new_local(
            "tmp-1",
            "payment_requests",
            json!({"contractId": "C-1", "number": 3, "subtotal": 10.0}),
            1000,
        );

        let key = record
            .business_key(&["contractId".to_string(), "number".to_string()])
            .unwrap();
        assert_eq!(key.len(), 2);
        assert_eq!(key["contractId"], json!("C-1"));
        assert_eq!(key["number"], json!(3));
    }

    #[test]
    fn business_key_missing_field() {
        let record = Record::new_local(
            "tmp-1",
            "payment_requests",
            json!({"contractId": "C-1", "number": null}),
            1000,
        );

        let result = record.business_key(&["contractId".to_string(), "number".to_string()]);
        assert!(matches!(result, Err(Error::Validation { reason, .. }) if reason.contains("number")));
    }

    #[test]
    fn tombstone_and_sync() {
        let mut record = Record::new_local("L-1", "contracts", json!({}), 1000);
        record.mark_synced(2000);
        assert!(!record.dirty);

        record.mark_deleted(3000);
        assert!(record.deleted);
        assert!(record.dirty);
        assert_eq!(record.last_sync, Some(2000));
    }

    #[test]
    fn serialization_format() {
        let record = Record::new_local("tmp-1", "contracts", json!({"a": 1}), 1000);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("remoteId"));
        assert!(json.contains("lastModified"));

        let parsed: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
