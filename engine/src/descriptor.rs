//! Entity type descriptors and the registry that orders them.
//!
//! Each synced table is declared once as an [`EntityDescriptor`]. The push and
//! pull pipelines iterate the [`Registry`] generically; per-table differences
//! (identity mode, business key, dependents, typed fields) are data here.

use crate::{error::Result, Error, Record, TableName};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// How a table's remote primary key is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityMode {
    /// The local id is also the remote primary key.
    LocalAuthoritative,
    /// The remote store assigns the key; rows are matched by business key.
    RemoteAssigned,
}

/// Field types supported in descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    /// Monetary or fractional amount
    Number,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Number => write!(f, "Number"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a typed payload field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Check a payload value against this definition. Returns the failure reason.
    fn check(&self, value: Option<&serde_json::Value>) -> std::result::Result<(), String> {
        use serde_json::Value;

        let value = match value {
            None | Some(Value::Null) if self.required => {
                return Err(format!("missing required field '{}'", self.name))
            }
            None | Some(Value::Null) => return Ok(()),
            Some(v) => v,
        };

        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(format!(
                "type mismatch for field '{}': expected {}, got {}",
                self.name,
                self.field_type,
                json_type_name(value)
            ))
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Number",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// A child table holding a foreign key to this entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependent {
    pub table: TableName,
    pub foreign_key_field: String,
}

impl Dependent {
    pub fn new(table: impl Into<TableName>, foreign_key_field: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            foreign_key_field: foreign_key_field.into(),
        }
    }
}

/// Declaration of one synced entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescriptor {
    pub table: TableName,
    pub identity_mode: IdentityMode,
    /// Fields used to find-or-create under [`IdentityMode::RemoteAssigned`]
    pub business_key_fields: Vec<String>,
    pub dependents: Vec<Dependent>,
    /// Typed fields validated before push. Empty means no validation.
    pub fields: Vec<FieldDef>,
    /// Move the local record to its remote key once one is assigned
    pub rekey_on_assign: bool,
    /// Consulted by the wiped-storage heuristic
    pub key_table: bool,
}

impl EntityDescriptor {
    /// A table whose local ids are the remote primary keys.
    pub fn local_authoritative(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            identity_mode: IdentityMode::LocalAuthoritative,
            business_key_fields: Vec::new(),
            dependents: Vec::new(),
            fields: Vec::new(),
            rekey_on_assign: false,
            key_table: false,
        }
    }

    /// A table whose remote primary keys are assigned by the server.
    pub fn remote_assigned<I, S>(table: impl Into<TableName>, business_key_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            identity_mode: IdentityMode::RemoteAssigned,
            business_key_fields: business_key_fields.into_iter().map(Into::into).collect(),
            dependents: Vec::new(),
            fields: Vec::new(),
            rekey_on_assign: true,
            key_table: false,
        }
    }

    /// Builder-style method to declare a dependent table.
    pub fn with_dependent(
        mut self,
        table: impl Into<TableName>,
        foreign_key_field: impl Into<String>,
    ) -> Self {
        self.dependents.push(Dependent::new(table, foreign_key_field));
        self
    }

    /// Builder-style method to declare typed fields.
    pub fn with_fields(mut self, fields: Vec<FieldDef>) -> Self {
        self.fields = fields;
        self
    }

    /// Keep the local working id after the remote store assigns its own.
    pub fn keep_local_key(mut self) -> Self {
        self.rekey_on_assign = false;
        self
    }

    /// Mark as a key table for wiped-storage detection.
    pub fn key_table(mut self) -> Self {
        self.key_table = true;
        self
    }

    /// The identity this record is known by on the remote store, if any.
    pub fn remote_identity<'r>(&self, record: &'r Record) -> Option<&'r str> {
        match self.identity_mode {
            IdentityMode::LocalAuthoritative => Some(record.id.as_str()),
            IdentityMode::RemoteAssigned => record.remote_id.as_deref(),
        }
    }

    /// Validate a record's payload before it is transmitted.
    pub fn validate(&self, record: &Record) -> Result<()> {
        if record.deleted {
            return Ok(());
        }

        let obj = record.payload.as_object().ok_or_else(|| {
            Error::validation(
                self.table.clone(),
                record.id.clone(),
                "payload must be an object",
            )
        })?;

        for field in &self.fields {
            field
                .check(obj.get(&field.name))
                .map_err(|reason| Error::validation(self.table.clone(), record.id.clone(), reason))?;
        }

        if self.identity_mode == IdentityMode::RemoteAssigned {
            record.business_key(&self.business_key_fields)?;
        }

        Ok(())
    }
}

/// The set of declared entity types, with a precomputed push order.
#[derive(Debug, Clone)]
pub struct Registry {
    descriptors: Vec<EntityDescriptor>,
    by_table: HashMap<TableName, usize>,
    order: Vec<usize>,
}

impl Registry {
    /// Build a registry. Fails on duplicate tables, dependents naming
    /// undeclared tables, or dependency cycles.
    pub fn new(descriptors: Vec<EntityDescriptor>) -> Result<Self> {
        let mut by_table = HashMap::with_capacity(descriptors.len());
        for (idx, descriptor) in descriptors.iter().enumerate() {
            if by_table.insert(descriptor.table.clone(), idx).is_some() {
                return Err(Error::InvalidConfig(format!(
                    "table declared twice: {}",
                    descriptor.table
                )));
            }
        }

        for descriptor in &descriptors {
            for dependent in &descriptor.dependents {
                if !by_table.contains_key(&dependent.table) {
                    return Err(Error::UnknownTable(dependent.table.clone()));
                }
            }
        }

        let order = dependency_order(&descriptors, &by_table)?;

        Ok(Self {
            descriptors,
            by_table,
            order,
        })
    }

    /// Get a descriptor by table name.
    pub fn get(&self, table: &str) -> Result<&EntityDescriptor> {
        self.by_table
            .get(table)
            .map(|&idx| &self.descriptors[idx])
            .ok_or_else(|| Error::UnknownTable(table.to_string()))
    }

    /// Descriptors in declaration order.
    pub fn descriptors(&self) -> &[EntityDescriptor] {
        &self.descriptors
    }

    /// Descriptors with every parent before the children holding a foreign key to it.
    pub fn dependency_order(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.order.iter().map(|&idx| &self.descriptors[idx])
    }

    /// Tables marked as key tables.
    pub fn key_tables(&self) -> impl Iterator<Item = &EntityDescriptor> {
        self.descriptors.iter().filter(|d| d.key_table)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// Kahn's algorithm, picking the earliest-declared ready table each step so
/// the order is stable with respect to declaration order.
fn dependency_order(
    descriptors: &[EntityDescriptor],
    by_table: &HashMap<TableName, usize>,
) -> Result<Vec<usize>> {
    let mut in_degree = vec![0usize; descriptors.len()];
    let mut children: Vec<HashSet<usize>> = vec![HashSet::new(); descriptors.len()];

    for (parent, descriptor) in descriptors.iter().enumerate() {
        for dependent in &descriptor.dependents {
            let child = by_table[&dependent.table];
            if child == parent {
                // Self-references do not constrain ordering.
                continue;
            }
            if children[parent].insert(child) {
                in_degree[child] += 1;
            }
        }
    }

    let mut order = Vec::with_capacity(descriptors.len());
    let mut done = vec![false; descriptors.len()];

    while order.len() < descriptors.len() {
        let next = (0..descriptors.len()).find(|&idx| !done[idx] && in_degree[idx] == 0);
        let Some(idx) = next else {
            let stuck: Vec<_> = (0..descriptors.len())
                .filter(|&idx| !done[idx])
                .map(|idx| descriptors[idx].table.as_str())
                .collect();
            return Err(Error::DependencyCycle(stuck.join(", ")));
        };

        done[idx] = true;
        order.push(idx);
        for &child in &children[idx] {
            in_degree[child] -= 1;
        }
    }

    Ok(order)
}
