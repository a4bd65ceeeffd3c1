//! Entity declarations for construction-contract payment documents.
//!
//! ```text
//! contracts ──┬── change_orders ──── change_order_items
//!             ├── payment_requests ─┬─ payment_request_items
//!             │                     └─ disbursements
//!             └── catalog_items
//! ```

use crate::{
    corrector::{ConsistencyCorrector, Invariant},
    descriptor::{EntityDescriptor, FieldDef, FieldType, Registry},
    error::Result,
};

pub const CONTRACTS: &str = "contracts";
pub const CATALOG_ITEMS: &str = "catalog_items";
pub const CHANGE_ORDERS: &str = "change_orders";
pub const CHANGE_ORDER_ITEMS: &str = "change_order_items";
pub const PAYMENT_REQUESTS: &str = "payment_requests";
pub const PAYMENT_REQUEST_ITEMS: &str = "payment_request_items";
pub const DISBURSEMENTS: &str = "disbursements";

/// Descriptors for every synced table, in declaration order.
pub fn contract_descriptors() -> Vec<EntityDescriptor> {
    vec![
        EntityDescriptor::local_authoritative(CONTRACTS)
            .key_table()
            .with_dependent(CATALOG_ITEMS, "contractId")
            .with_dependent(CHANGE_ORDERS, "contractId")
            .with_dependent(PAYMENT_REQUESTS, "contractId")
            .with_fields(vec![
                FieldDef::required("code", FieldType::String),
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("amount", FieldType::Number),
                FieldDef::optional("startsAt", FieldType::Timestamp),
            ]),
        EntityDescriptor::local_authoritative(CATALOG_ITEMS).with_fields(vec![
            FieldDef::required("contractId", FieldType::String),
            FieldDef::required("code", FieldType::String),
            FieldDef::optional("description", FieldType::String),
            FieldDef::optional("unit", FieldType::String),
            FieldDef::optional("unitPrice", FieldType::Number),
        ]),
        EntityDescriptor::remote_assigned(CHANGE_ORDERS, ["contractId", "number"])
            .with_dependent(CHANGE_ORDER_ITEMS, "changeOrderId")
            .with_fields(vec![
                FieldDef::required("contractId", FieldType::String),
                FieldDef::required("number", FieldType::Int),
                FieldDef::optional("title", FieldType::String),
                FieldDef::optional("amount", FieldType::Number),
            ]),
        EntityDescriptor::remote_assigned(CHANGE_ORDER_ITEMS, ["changeOrderId", "line"]).with_fields(
            vec![
                FieldDef::required("changeOrderId", FieldType::String),
                FieldDef::required("line", FieldType::Int),
                FieldDef::optional("catalogItemId", FieldType::String),
                FieldDef::required("quantity", FieldType::Number),
                FieldDef::required("unitPrice", FieldType::Number),
                FieldDef::optional("amount", FieldType::Number),
            ],
        ),
        EntityDescriptor::remote_assigned(PAYMENT_REQUESTS, ["contractId", "number"])
            .key_table()
            .with_dependent(PAYMENT_REQUEST_ITEMS, "paymentRequestId")
            .with_dependent(DISBURSEMENTS, "paymentRequestId")
            .with_fields(vec![
                FieldDef::required("contractId", FieldType::String),
                FieldDef::required("number", FieldType::Int),
                FieldDef::optional("period", FieldType::String),
                FieldDef::required("subtotal", FieldType::Number),
                FieldDef::required("tax", FieldType::Number),
                FieldDef::optional("total", FieldType::Number),
            ]),
        EntityDescriptor::remote_assigned(PAYMENT_REQUEST_ITEMS, ["paymentRequestId", "line"])
            .with_fields(vec![
                FieldDef::required("paymentRequestId", FieldType::String),
                FieldDef::required("line", FieldType::Int),
                FieldDef::optional("catalogItemId", FieldType::String),
                FieldDef::required("quantity", FieldType::Number),
                FieldDef::required("unitPrice", FieldType::Number),
                FieldDef::optional("amount", FieldType::Number),
            ]),
        EntityDescriptor::remote_assigned(DISBURSEMENTS, ["paymentRequestId", "reference"])
            .with_fields(vec![
                FieldDef::required("paymentRequestId", FieldType::String),
                FieldDef::required("reference", FieldType::String),
                FieldDef::required("amount", FieldType::Number),
                FieldDef::optional("paidAt", FieldType::Timestamp),
            ]),
    ]
}

/// Registry for the contract document tables.
pub fn contract_registry() -> Result<Registry> {
    Registry::new(contract_descriptors())
}

/// Financial invariants enforced before push.
pub fn contract_corrector(epsilon: f64) -> ConsistencyCorrector {
    ConsistencyCorrector::new(epsilon)
        .with_invariant(PAYMENT_REQUESTS, Invariant::sum("total", &["subtotal", "tax"]))
        .with_invariant(
            PAYMENT_REQUEST_ITEMS,
            Invariant::product("amount", "quantity", "unitPrice"),
        )
        .with_invariant(
            CHANGE_ORDER_ITEMS,
            Invariant::product("amount", "quantity", "unitPrice"),
        )
}
