//! # Collection Snapshots
//!
//! Each synced path carries the WHOLE collection as one value. This module
//! gives those values an explicit, versioned schema instead of untyped JSON.
//!
//! ## Wire Shape
//! ```text
//! {
//!   "collection":    "inventory",      ← tag, checked on decode
//!   "schemaVersion": 1,                ← bumped when the item shape changes
//!   "items":         [ ... ]
//! }
//! ```
//!
//! Bare JSON arrays (written by clients that predate the envelope) decode as
//! schema version 0 of the expected collection.
//!
//! ## Typed Aliases
//! | Alias                 | Item            | Path            |
//! |-----------------------|-----------------|-----------------|
//! | `InventorySnapshot`   | `InventoryItem` | `inventory`     |
//! | `TransactionSnapshot` | `Transaction`   | `transactions`  |
//! | `InwardSnapshot`      | `InwardEntry`   | `inwardEntries` |

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::money::{GstRate, Money};
use crate::types::CollectionPath;

// =============================================================================
// Collection Item Trait
// =============================================================================

/// An element type stored in one synced collection.
pub trait CollectionItem:
    Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static
{
    /// Where the collection lives.
    const PATH: CollectionPath;

    /// Newest schema version this build writes and reads.
    const SCHEMA_VERSION: u32;
}

// =============================================================================
// Snapshot Envelope
// =============================================================================

/// The whole value of one collection at one moment.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T: CollectionItem> {
    pub schema_version: u32,
    pub items: Vec<T>,
}

pub type InventorySnapshot = Snapshot<InventoryItem>;
pub type TransactionSnapshot = Snapshot<Transaction>;
pub type InwardSnapshot = Snapshot<InwardEntry>;

#[derive(Deserialize)]
#[serde(untagged)]
enum WireSnapshot<T> {
    Envelope {
        collection: String,
        #[serde(rename = "schemaVersion")]
        schema_version: u32,
        items: Vec<T>,
    },
    Legacy(Vec<T>),
}

impl<T: CollectionItem> Snapshot<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            schema_version: T::SCHEMA_VERSION,
            items,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn path() -> CollectionPath {
        T::PATH
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encodes to the tagged envelope.
    pub fn to_value(&self) -> CoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decodes either the tagged envelope or a legacy bare array.
    pub fn from_value(value: &Value) -> CoreResult<Self> {
        let path = T::PATH.as_str();
        let wire: WireSnapshot<T> =
            serde_json::from_value(value.clone()).map_err(|e| CoreError::SnapshotDecode {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        match wire {
            WireSnapshot::Legacy(items) => Ok(Self {
                schema_version: 0,
                items,
            }),
            WireSnapshot::Envelope {
                collection,
                schema_version,
                items,
            } => {
                if collection != path {
                    return Err(CoreError::CollectionMismatch {
                        expected: path.to_string(),
                        found: collection,
                    });
                }
                if schema_version > T::SCHEMA_VERSION {
                    return Err(CoreError::UnsupportedSchemaVersion {
                        path: path.to_string(),
                        found: schema_version,
                        supported: T::SCHEMA_VERSION,
                    });
                }
                Ok(Self {
                    schema_version,
                    items,
                })
            }
        }
    }
}

impl<T: CollectionItem> Default for Snapshot<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: CollectionItem> Serialize for Snapshot<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Snapshot", 3)?;
        state.serialize_field("collection", T::PATH.as_str())?;
        state.serialize_field("schemaVersion", &self.schema_version)?;
        state.serialize_field("items", &self.items)?;
        state.end()
    }
}

// =============================================================================
// Inventory
// =============================================================================

/// One batch of one medicine on the shelf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct InventoryItem {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub manufacturer: Option<String>,
    pub batch_number: String,
    #[ts(as = "String")]
    pub expiry_date: NaiveDate,
    pub quantity: i64,
    pub mrp: Money,
    pub purchase_price: Money,
    pub gst_rate: GstRate,
    #[serde(default)]
    pub hsn_code: Option<String>,
}

impl InventoryItem {
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiry_date <= today
    }

    /// Stock value at purchase price.
    pub fn stock_value(&self) -> Money {
        self.purchase_price.multiply_quantity(self.quantity)
    }
}

impl CollectionItem for InventoryItem {
    const PATH: CollectionPath = CollectionPath::Inventory;
    const SCHEMA_VERSION: u32 = 1;
}

// =============================================================================
// Transactions (bills)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum PaymentMode {
    Cash,
    Upi,
    Card,
    Credit,
}

/// One line of a bill. Prices are GST-inclusive MRP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct BillLine {
    pub item_id: String,
    pub name: String,
    pub batch_number: String,
    pub quantity: i64,
    pub unit_price: Money,
    pub gst_rate: GstRate,
}

impl BillLine {
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply_quantity(self.quantity)
    }

    /// GST portion included in the line total.
    pub fn gst_included(&self) -> Money {
        let total = self.line_total();
        let taxable = Money::from_paise(
            (total.paise() as i128 * 10_000 / (10_000 + self.gst_rate.bps() as i128)) as i64,
        );
        total - taxable
    }
}

/// A completed bill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Transaction {
    pub id: String,
    pub bill_number: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    pub lines: Vec<BillLine>,
    #[serde(default)]
    pub discount: Money,
    pub payment_mode: PaymentMode,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn subtotal(&self) -> Money {
        self.lines.iter().map(BillLine::line_total).sum()
    }

    pub fn gst_total(&self) -> Money {
        self.lines.iter().map(BillLine::gst_included).sum()
    }

    pub fn total(&self) -> Money {
        self.subtotal() - self.discount
    }
}

impl CollectionItem for Transaction {
    const PATH: CollectionPath = CollectionPath::Transactions;
    const SCHEMA_VERSION: u32 = 1;
}

// =============================================================================
// Inward entries (stock received from suppliers)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct InwardLine {
    pub item_id: String,
    pub name: String,
    pub batch_number: String,
    #[ts(as = "String")]
    pub expiry_date: NaiveDate,
    pub quantity: i64,
    #[serde(default)]
    pub free_quantity: i64,
    pub purchase_price: Money,
    pub mrp: Money,
    pub gst_rate: GstRate,
}

impl InwardLine {
    /// Purchase value before tax; free units cost nothing.
    pub fn taxable_value(&self) -> Money {
        self.purchase_price.multiply_quantity(self.quantity)
    }
}

/// One supplier invoice as received into stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct InwardEntry {
    pub id: String,
    pub supplier_name: String,
    pub invoice_number: String,
    #[ts(as = "String")]
    pub invoice_date: NaiveDate,
    #[ts(as = "String")]
    pub received_at: DateTime<Utc>,
    pub lines: Vec<InwardLine>,
}

impl InwardEntry {
    /// Invoice value including GST on every line.
    pub fn invoice_value(&self) -> Money {
        self.lines
            .iter()
            .map(|line| {
                let taxable = line.taxable_value();
                taxable + taxable.gst_on(line.gst_rate)
            })
            .sum()
    }
}

impl CollectionItem for InwardEntry {
    const PATH: CollectionPath = CollectionPath::InwardEntries;
    const SCHEMA_VERSION: u32 = 1;
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn paracetamol() -> InventoryItem {
        InventoryItem {
            id: "inv-1".to_string(),
            name: "Paracetamol 500mg".to_string(),
            manufacturer: Some("Acme Pharma".to_string()),
            batch_number: "PCM2401".to_string(),
            expiry_date: NaiveDate::from_ymd_opt(2027, 3, 31).unwrap(),
            quantity: 40,
            mrp: Money::from_paise(2500),
            purchase_price: Money::from_paise(1800),
            gst_rate: GstRate::GST_12,
            hsn_code: Some("3004".to_string()),
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let snapshot = InventorySnapshot::new(vec![paracetamol()]);
        let value = snapshot.to_value().unwrap();

        assert_eq!(value["collection"], "inventory");
        assert_eq!(value["schemaVersion"], 1);
        assert_eq!(value["items"][0]["batchNumber"], "PCM2401");
        assert_eq!(value["items"][0]["expiryDate"], "2027-03-31");

        let back = InventorySnapshot::from_value(&value).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_legacy_array_decodes_as_version_zero() {
        let item = serde_json::to_value(paracetamol()).unwrap();
        let snapshot = InventorySnapshot::from_value(&json!([item])).unwrap();
        assert_eq!(snapshot.schema_version, 0);
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_wrong_collection_tag_rejected() {
        let value = json!({"collection": "transactions", "schemaVersion": 1, "items": []});
        let err = InventorySnapshot::from_value(&value).unwrap_err();
        assert!(matches!(err, CoreError::CollectionMismatch { .. }));
    }

    #[test]
    fn test_newer_schema_rejected() {
        let value = json!({"collection": "inwardEntries", "schemaVersion": 9, "items": []});
        let err = InwardSnapshot::from_value(&value).unwrap_err();
        assert!(matches!(
            err,
            CoreError::UnsupportedSchemaVersion { found: 9, supported: 1, .. }
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        let err = TransactionSnapshot::from_value(&json!({"hello": "world"})).unwrap_err();
        assert!(matches!(err, CoreError::SnapshotDecode { .. }));
    }

    #[test]
    fn test_inventory_helpers() {
        let item = paracetamol();
        assert_eq!(item.stock_value().paise(), 72_000);
        assert!(!item.is_expired(NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()));
        assert!(item.is_expired(NaiveDate::from_ymd_opt(2027, 3, 31).unwrap()));
    }

    #[test]
    fn test_bill_totals() {
        let bill = Transaction {
            id: "t-1".to_string(),
            bill_number: "B-0001".to_string(),
            customer_name: None,
            customer_phone: None,
            lines: vec![BillLine {
                item_id: "inv-1".to_string(),
                name: "Paracetamol 500mg".to_string(),
                batch_number: "PCM2401".to_string(),
                quantity: 2,
                unit_price: Money::from_paise(11_200),
                gst_rate: GstRate::GST_12,
            }],
            discount: Money::from_paise(400),
            payment_mode: PaymentMode::Upi,
            created_at: Utc::now(),
        };
        assert_eq!(bill.subtotal().paise(), 22_400);
        // 22400 inclusive of 12% -> taxable 20000, gst 2400
        assert_eq!(bill.gst_total().paise(), 2_400);
        assert_eq!(bill.total().paise(), 22_000);
    }

    #[test]
    fn test_inward_invoice_value() {
        let entry = InwardEntry {
            id: "in-1".to_string(),
            supplier_name: "City Distributors".to_string(),
            invoice_number: "CD/889".to_string(),
            invoice_date: NaiveDate::from_ymd_opt(2026, 5, 2).unwrap(),
            received_at: Utc::now(),
            lines: vec![InwardLine {
                item_id: "inv-1".to_string(),
                name: "Paracetamol 500mg".to_string(),
                batch_number: "PCM2401".to_string(),
                expiry_date: NaiveDate::from_ymd_opt(2027, 3, 31).unwrap(),
                quantity: 10,
                free_quantity: 2,
                purchase_price: Money::from_paise(1000),
                mrp: Money::from_paise(2500),
                gst_rate: GstRate::GST_5,
            }],
        };
        assert_eq!(entry.invoice_value().paise(), 10_500);
    }
}
