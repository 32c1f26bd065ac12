// 📦 Purchase Order Entity - document number → open purchase order + items
//
// The feed is the complete list of open purchase orders; passes run with
// replace-all so orders the snapshot drops are deleted with their items.

use super::{ChildWrite, Entity, ExistingHeader, NewHeader};
use crate::db::date_text;
use crate::mapping::SalesmanMapper;
use crate::reader::FeedKind;
use crate::schema::{quantize, FeedSchema, FieldSpec, NormalizedRow, MONEY_SCALE};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;

pub fn schema() -> FeedSchema {
    FeedSchema::new(
        FeedKind::PurchaseOrders,
        "document number",
        vec![
            FieldSpec::text("document number"),
            FieldSpec::text("document internal id"),
            FieldSpec::date("posting date"),
            FieldSpec::text("customer/supplier no."),
            FieldSpec::text("customer/supplier name"),
            FieldSpec::text("item no."),
            FieldSpec::text("item/service description"),
            FieldSpec::quantity("quantity"),
            FieldSpec::money("price"),
            FieldSpec::money("row total"),
            FieldSpec::money("document total"),
            FieldSpec::text("status"),
            FieldSpec::text("bill to").optional(),
            FieldSpec::text("customer phone").optional(),
            FieldSpec::text("vat number").optional(),
            FieldSpec::text("bp reference no.").optional(),
            FieldSpec::text("sales employee name").optional(),
            FieldSpec::money("discount percent").optional(),
            FieldSpec::money("vat sum").optional(),
            FieldSpec::money("total discount").optional(),
            FieldSpec::text("closing remarks").optional(),
            FieldSpec::text("manufacturer name").optional(),
            FieldSpec::text("row status").optional(),
            FieldSpec::quantity("remaining open quantity").optional(),
        ],
    )
}

const LINE_COLUMNS: &[&str] = &[
    "item no.",
    "item/service description",
    "quantity",
    "price",
    "row total",
];

#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseOrderHeader {
    pub internal_number: Option<String>,
    pub posting_date: Option<NaiveDate>,
    pub supplier_code: Option<String>,
    pub supplier_name: Option<String>,
    pub supplier_address: Option<String>,
    pub supplier_phone: Option<String>,
    pub vat_number: Option<String>,
    pub bp_reference_no: Option<String>,
    /// Buyer as the ERP spells it; purchase orders are not attributed
    pub salesman_name: Option<String>,
    pub discount_percentage: Decimal,
    pub document_total: Decimal,
    pub vat_sum: Decimal,
    pub total_discount: Decimal,
    pub status: Option<String>,
    pub closing_remarks: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseOrderLine {
    pub item_no: String,
    pub description: Option<String>,
    pub manufacturer: Option<String>,
    pub quantity: Decimal,
    pub price: Decimal,
    pub row_total: Decimal,
    pub row_status: Option<String>,
    pub remaining_open_quantity: Decimal,
    pub pending_amount: Decimal,
}

fn owned(row: &NormalizedRow, column: &str) -> Option<String> {
    row.text(column).map(str::to_string)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PurchaseOrders;

impl Entity for PurchaseOrders {
    type Header = PurchaseOrderHeader;
    type Child = PurchaseOrderLine;

    fn feed(&self) -> FeedKind {
        FeedKind::PurchaseOrders
    }

    fn table(&self) -> &'static str {
        "purchase_orders"
    }

    fn key_column(&self) -> &'static str {
        "po_number"
    }

    fn header(
        &self,
        row: &NormalizedRow,
        _mapper: &SalesmanMapper,
    ) -> Result<PurchaseOrderHeader, String> {
        Ok(PurchaseOrderHeader {
            internal_number: owned(row, "document internal id"),
            posting_date: row.date("posting date"),
            supplier_code: owned(row, "customer/supplier no."),
            supplier_name: owned(row, "customer/supplier name"),
            supplier_address: owned(row, "bill to"),
            supplier_phone: owned(row, "customer phone"),
            vat_number: owned(row, "vat number"),
            bp_reference_no: owned(row, "bp reference no."),
            salesman_name: owned(row, "sales employee name"),
            discount_percentage: row.decimal("discount percent"),
            document_total: row.decimal("document total"),
            vat_sum: row.decimal("vat sum"),
            total_discount: row.decimal("total discount"),
            status: owned(row, "status"),
            closing_remarks: owned(row, "closing remarks"),
        })
    }

    fn child(&self, row: &NormalizedRow) -> Result<Option<PurchaseOrderLine>, String> {
        if row.all_blank(LINE_COLUMNS) {
            return Ok(None);
        }
        let item_no = row
            .text("item no.")
            .ok_or_else(|| "line has data but no item no.".to_string())?;

        let price = row.decimal("price");
        let remaining = row.decimal("remaining open quantity");
        let pending = remaining
            .checked_mul(price)
            .ok_or_else(|| format!("pending amount of item {} overflows", item_no))?;
        Ok(Some(PurchaseOrderLine {
            item_no: item_no.to_string(),
            description: owned(row, "item/service description"),
            manufacturer: owned(row, "manufacturer name"),
            quantity: row.decimal("quantity"),
            price,
            row_total: row.decimal("row total"),
            row_status: owned(row, "row status"),
            remaining_open_quantity: remaining,
            pending_amount: quantize(pending, MONEY_SCALE),
        }))
    }

    fn insert_headers(
        &self,
        conn: &Connection,
        headers: &[NewHeader<'_, PurchaseOrderHeader>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO purchase_orders (
                po_number, internal_number, posting_date, supplier_code, supplier_name,
                supplier_address, supplier_phone, vat_number, bp_reference_no, salesman_name,
                discount_percentage, document_total, vat_sum, total_discount, status,
                closing_remarks
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )?;

        for (key, h, _) in headers {
            stmt.execute(params![
                key,
                h.internal_number,
                date_text(h.posting_date),
                h.supplier_code,
                h.supplier_name,
                h.supplier_address,
                h.supplier_phone,
                h.vat_number,
                h.bp_reference_no,
                h.salesman_name,
                h.discount_percentage.to_string(),
                h.document_total.to_string(),
                h.vat_sum.to_string(),
                h.total_discount.to_string(),
                h.status,
                h.closing_remarks,
            ])?;
        }
        Ok(headers.len())
    }

    fn update_headers(
        &self,
        conn: &Connection,
        headers: &[ExistingHeader<'_, PurchaseOrderHeader>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "UPDATE purchase_orders SET
                internal_number = ?2, posting_date = ?3, supplier_code = ?4,
                supplier_name = ?5, supplier_address = ?6, supplier_phone = ?7,
                vat_number = ?8, bp_reference_no = ?9, salesman_name = ?10,
                discount_percentage = ?11, document_total = ?12, vat_sum = ?13,
                total_discount = ?14, status = ?15, closing_remarks = ?16
             WHERE id = ?1",
        )?;

        for (id, h, _) in headers {
            stmt.execute(params![
                id,
                h.internal_number,
                date_text(h.posting_date),
                h.supplier_code,
                h.supplier_name,
                h.supplier_address,
                h.supplier_phone,
                h.vat_number,
                h.bp_reference_no,
                h.salesman_name,
                h.discount_percentage.to_string(),
                h.document_total.to_string(),
                h.vat_sum.to_string(),
                h.total_discount.to_string(),
                h.status,
                h.closing_remarks,
            ])?;
        }
        Ok(headers.len())
    }

    fn child_table(&self) -> Option<(&'static str, &'static str)> {
        Some(("purchase_order_items", "order_id"))
    }

    fn insert_children(
        &self,
        conn: &Connection,
        children: &[ChildWrite<'_, PurchaseOrderLine>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO purchase_order_items (
                order_id, line_no, item_no, description, manufacturer, quantity, price,
                row_total, row_status, remaining_open_quantity, pending_amount
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;

        for write in children {
            let line = write.child;
            stmt.execute(params![
                write.parent_id,
                write.line_no,
                line.item_no,
                line.description,
                line.manufacturer,
                line.quantity.to_string(),
                line.price.to_string(),
                line.row_total.to_string(),
                line.row_status,
                line.remaining_open_quantity.to_string(),
                line.pending_amount.to_string(),
            ])?;
        }
        Ok(children.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RawRow;

    #[test]
    fn test_supplier_columns_and_pending() {
        let raw = RawRow::new(2)
            .with("Document Number", "PO-3")
            .with("Customer/Supplier No.", "V-10")
            .with("Customer/Supplier Name", "Parts Co")
            .with("Bill To", "Dock 4")
            .with("Status", "O")
            .with("Item No.", "P1")
            .with("Price", "4.5")
            .with("Remaining Open Quantity", "2");
        let row = schema().normalize(&raw).unwrap();

        let header = PurchaseOrders.header(&row, &SalesmanMapper::default()).unwrap();
        assert_eq!(header.supplier_code.as_deref(), Some("V-10"));
        assert_eq!(header.supplier_address.as_deref(), Some("Dock 4"));

        let line = PurchaseOrders.child(&row).unwrap().unwrap();
        assert_eq!(line.pending_amount.to_string(), "9.00");
    }

    #[test]
    fn test_pending_overflow_is_child_error() {
        let raw = RawRow::new(2)
            .with("Document Number", "PO-3")
            .with("Item No.", "P1")
            .with("Price", "100000000000000000000")
            .with("Remaining Open Quantity", "100000000000000000000");
        let row = schema().normalize(&raw).unwrap();
        assert!(PurchaseOrders.child(&row).is_err());
    }
}
