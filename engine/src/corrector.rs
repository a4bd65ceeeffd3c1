//! Pre-push repair of derived financial fields.
//!
//! The remote store enforces the relationship between primitive amounts and
//! their derived totals. Before a record is transmitted, every invariant
//! declared for its table is recomputed from the primitives; a stored derived
//! value that drifted by more than the tolerance is overwritten. The record
//! is always repaired and pushed, never rejected, unless the primitives
//! themselves are unusable.

use crate::{error::Result, Error, Record, TableName};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Field values keyed by name.
pub type Amounts = BTreeMap<String, f64>;

type RecomputeFn = dyn Fn(&Amounts) -> Amounts + Send + Sync;

/// A declared relationship between source fields and derived fields.
#[derive(Clone)]
pub struct Invariant {
    pub name: String,
    pub derived_fields: Vec<String>,
    pub source_fields: Vec<String>,
    recompute: Arc<RecomputeFn>,
}

impl fmt::Debug for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invariant")
            .field("name", &self.name)
            .field("derived_fields", &self.derived_fields)
            .field("source_fields", &self.source_fields)
            .finish()
    }
}

impl Invariant {
    /// Declare an invariant with an arbitrary recompute function.
    pub fn new<F>(
        name: impl Into<String>,
        derived_fields: Vec<String>,
        source_fields: Vec<String>,
        recompute: F,
    ) -> Self
    where
        F: Fn(&Amounts) -> Amounts + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            derived_fields,
            source_fields,
            recompute: Arc::new(recompute),
        }
    }

    /// `derived = parts[0] + parts[1] + ...`
    pub fn sum(derived: &str, parts: &[&str]) -> Self {
        let target = derived.to_string();
        let sources: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
        let summed = sources.clone();
        Self::new(
            format!("{} = {}", derived, parts.join(" + ")),
            vec![target.clone()],
            sources,
            move |amounts| {
                let total = summed.iter().filter_map(|f| amounts.get(f)).sum::<f64>();
                Amounts::from([(target.clone(), total)])
            },
        )
    }

    /// `derived = a * b`
    pub fn product(derived: &str, a: &str, b: &str) -> Self {
        let target = derived.to_string();
        let (fa, fb) = (a.to_string(), b.to_string());
        Self::new(
            format!("{} = {} * {}", derived, a, b),
            vec![target.clone()],
            vec![fa.clone(), fb.clone()],
            move |amounts| {
                let value = amounts.get(&fa).copied().unwrap_or(0.0)
                    * amounts.get(&fb).copied().unwrap_or(0.0);
                Amounts::from([(target.clone(), value)])
            },
        )
    }

    pub fn recompute(&self, sources: &Amounts) -> Amounts {
        (self.recompute)(sources)
    }
}

/// A single field that was overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub table: TableName,
    pub id: String,
    pub invariant: String,
    pub field: String,
    pub stored: Option<f64>,
    pub corrected: f64,
}

/// Round to whole cents.
pub fn round_currency(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Declarative table of invariants per entity type.
#[derive(Debug, Clone, Default)]
pub struct ConsistencyCorrector {
    epsilon: f64,
    rules: HashMap<TableName, Vec<Invariant>>,
}

impl ConsistencyCorrector {
    pub fn new(epsilon: f64) -> Self {
        Self {
            epsilon,
            rules: HashMap::new(),
        }
    }

    /// Builder-style method to declare an invariant for a table.
    pub fn with_invariant(mut self, table: impl Into<TableName>, invariant: Invariant) -> Self {
        self.add_invariant(table, invariant);
        self
    }

    pub fn add_invariant(&mut self, table: impl Into<TableName>, invariant: Invariant) {
        self.rules.entry(table.into()).or_default().push(invariant);
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Replace the tolerance, keeping the declared invariants.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn has_rules(&self, table: &str) -> bool {
        self.rules.get(table).is_some_and(|r| !r.is_empty())
    }

    pub fn invariants(&self, table: &str) -> &[Invariant] {
        self.rules.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Check a record without modifying it. Returns the corrections `correct` would make.
    pub fn inspect(&self, record: &Record) -> Result<Vec<Correction>> {
        let mut copy = record.clone();
        self.correct(&mut copy)
    }

    /// Repair drifted derived fields in place.
    ///
    /// Missing or non-numeric source fields cannot be fixed by recomputing and
    /// yield [`Error::Validation`]. Tombstones are left alone.
    pub fn correct(&self, record: &mut Record) -> Result<Vec<Correction>> {
        let mut corrections = Vec::new();
        if record.deleted {
            return Ok(corrections);
        }

        for invariant in self.invariants(&record.table) {
            let sources = self.read_sources(record, invariant)?;
            let recomputed = invariant.recompute(&sources);

            let drifted = invariant.derived_fields.iter().any(|field| {
                match (read_number(record.payload.get(field)), recomputed.get(field)) {
                    (Some(stored), Some(&expected)) => (stored - expected).abs() - self.epsilon > 1e-9,
                    (None, Some(_)) => true,
                    (_, None) => false,
                }
            });
            if !drifted {
                continue;
            }

            for field in &invariant.derived_fields {
                let Some(&value) = recomputed.get(field) else {
                    continue;
                };
                if !value.is_finite() {
                    return Err(Error::validation(
                        record.table.clone(),
                        record.id.clone(),
                        format!("{} produced a non-finite {}", invariant.name, field),
                    ));
                }
                let corrected = round_currency(value);
                let stored = read_number(record.payload.get(field));
                write_number(&mut record.payload, field, corrected);
                corrections.push(Correction {
                    table: record.table.clone(),
                    id: record.id.clone(),
                    invariant: invariant.name.clone(),
                    field: field.clone(),
                    stored,
                    corrected,
                });
            }
        }

        Ok(corrections)
    }

    fn read_sources(&self, record: &Record, invariant: &Invariant) -> Result<Amounts> {
        let mut sources = Amounts::new();
        for field in &invariant.source_fields {
            let value = read_number(record.payload.get(field)).ok_or_else(|| {
                Error::validation(
                    record.table.clone(),
                    record.id.clone(),
                    format!("{}: source field '{}' is missing or not a number", invariant.name, field),
                )
            })?;
            sources.insert(field.clone(), value);
        }
        Ok(sources)
    }
}

fn read_number(value: Option<&Value>) -> Option<f64> {
    value?.as_f64().filter(|v| v.is_finite())
}

fn write_number(payload: &mut Value, field: &str, value: f64) {
    let number = serde_json::Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null);
    if let Value::Object(map) = payload {
        map.insert(field.to_string(), number);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn corrector() -> ConsistencyCorrector {
        ConsistencyCorrector::new(0.05)
            .with_invariant("payment_requests", Invariant::sum("total", &["subtotal", "tax"]))
            .with_invariant(
                "payment_request_items",
                Invariant::product("amount", "quantity", "unitPrice"),
            )
    }

    fn request(payload: Value) -> Record {
        Record::new_local("tmp-1", "payment_requests", payload, 1000)
    }

    #[test]
    fn repairs_drifted_total() {
        let mut record = request(json!({"subtotal": 100.00, "tax": 16.00, "total": 120.00}));
        let corrections = corrector().correct(&mut record).unwrap();

        assert_eq!(corrections.len(), 1);
        assert_eq!(corrections[0].field, "total");
        assert_eq!(corrections[0].stored, Some(120.0));
        assert_eq!(corrections[0].corrected, 116.0);
        assert_eq!(record.payload["total"], json!(116.0));
        assert_eq!(record.payload["subtotal"], json!(100.0));
        assert_eq!(record.payload["tax"], json!(16.0));
    }

    #[test]
    fn within_epsilon_is_left_alone() {
        let mut record = request(json!({"subtotal": 100.00, "tax": 16.00, "total": 116.04}));
        let corrections = corrector().correct(&mut record).unwrap();

        assert!(corrections.is_empty());
        assert_eq!(record.payload["total"], json!(116.04));
    }

    #[test]
    fn just_over_epsilon_is_repaired() {
        let mut record = request(json!({"subtotal": 100.00, "tax": 16.00, "total": 116.06}));
        assert_eq!(corrector().correct(&mut record).unwrap().len(), 1);
        assert_eq!(record.payload["total"], json!(116.0));
    }

    #[test]
    fn missing_derived_field_is_filled() {
        let mut record = request(json!({"subtotal": 10.5, "tax": 1.68}));
        let corrections = corrector().correct(&mut record).unwrap();

        assert_eq!(corrections[0].stored, None);
        assert_eq!(record.payload["total"], json!(12.18));
    }

    #[test]
    fn missing_source_is_validation_error() {
        let mut record = request(json!({"subtotal": 100.00, "total": 116.00}));
        let result = corrector().correct(&mut record);
        assert!(matches!(result, Err(Error::Validation { reason, .. }) if reason.contains("tax")));
    }

    #[test]
    fn string_amounts_are_not_numbers() {
        let mut record = Record::new_local(
            "i-1",
            "payment_request_items",
            json!({"quantity": "3", "unitPrice": "2.50", "amount": "0"}),
            1000,
        );
        let result = corrector().correct(&mut record);
        assert!(matches!(result, Err(Error::Validation { reason, .. }) if reason.contains("quantity")));
        assert_eq!(record.payload["amount"], json!("0"));
    }

    #[test]
    fn custom_epsilon() {
        let strict = corrector().with_epsilon(0.001);
        let mut record = request(json!({"subtotal": 100.00, "tax": 16.00, "total": 116.01}));
        assert_eq!(strict.correct(&mut record).unwrap().len(), 1);
    }

    #[test]
    fn tables_without_rules_pass_through() {
        let mut record = Record::new_local("c-1", "contracts", json!({"total": "whatever"}), 1000);
        assert!(!corrector().has_rules("contracts"));
        assert!(corrector().correct(&mut record).unwrap().is_empty());
    }

    #[test]
    fn inspect_does_not_modify() {
        let record = request(json!({"subtotal": 100.00, "tax": 16.00, "total": 120.00}));
        let corrections = corrector().inspect(&record).unwrap();
        assert_eq!(corrections.len(), 1);
        assert_eq!(record.payload["total"], json!(120.0));
    }

    #[test]
    fn rounding() {
        assert_eq!(round_currency(116.004), 116.0);
        assert_eq!(round_currency(0.125 + 0.0001), 0.13);
        assert_eq!(round_currency(-3.333), -3.33);
    }

    proptest! {
        #[test]
        fn corrected_total_is_within_epsilon(
            subtotal_cents in 0i64..100_000_000,
            tax_cents in 0i64..20_000_000,
            stored_cents in -1_000_000i64..200_000_000,
        ) {
            let subtotal = subtotal_cents as f64 / 100.0;
            let tax = tax_cents as f64 / 100.0;
            let stored = stored_cents as f64 / 100.0;
            let mut record = request(json!({"subtotal": subtotal, "tax": tax, "total": stored}));

            corrector().correct(&mut record).unwrap();

            let total = record.payload["total"].as_f64().unwrap();
            prop_assert!((total - (subtotal + tax)).abs() <= 0.05 + 1e-6);
            prop_assert_eq!(record.payload["subtotal"].as_f64().unwrap(), subtotal);
            prop_assert_eq!(record.payload["tax"].as_f64().unwrap(), tax);
        }
    }
}
