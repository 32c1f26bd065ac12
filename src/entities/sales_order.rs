// 🧾 Sales Order Entity - document number → order header + line items
//
// One spreadsheet row (or one flattened ERP line) per order line. Lines are
// replaced wholesale on every sight. A full open-order snapshot can close
// orders the ERP no longer reports as open.

use super::{attribute, ChildWrite, Entity, ExistingHeader, NewHeader};
use crate::db::{date_text, fetch_ids_where, update_by_ids};
use crate::mapping::SalesmanMapper;
use crate::reader::FeedKind;
use crate::schema::{quantize, FeedSchema, FieldSpec, NormalizedRow, MONEY_SCALE};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::collections::HashSet;

pub fn schema() -> FeedSchema {
    FeedSchema::new(
        FeedKind::SalesOrders,
        "document number",
        vec![
            FieldSpec::text("document number"),
            FieldSpec::text("document internal id"),
            FieldSpec::date("posting date"),
            FieldSpec::text("customer/supplier no."),
            FieldSpec::text("customer/supplier name"),
            FieldSpec::text("sales employee name"),
            FieldSpec::text("manufacturer name"),
            FieldSpec::text("bp reference no."),
            FieldSpec::text("item no."),
            FieldSpec::text("item/service description"),
            FieldSpec::quantity("quantity"),
            FieldSpec::money("price"),
            FieldSpec::money("row total"),
            FieldSpec::money("document total"),
            FieldSpec::text("status"),
            FieldSpec::text("bill to"),
            FieldSpec::money("discount percent").optional(),
            FieldSpec::text("vat number").optional(),
            FieldSpec::text("customer phone").optional(),
            FieldSpec::text("row status").optional(),
            FieldSpec::quantity("remaining open quantity").optional(),
            FieldSpec::money("vat sum").optional(),
            FieldSpec::money("total discount").optional(),
            FieldSpec::text("proforma invoice").optional(),
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
pub struct SalesOrderHeader {
    pub internal_number: Option<String>,
    pub posting_date: Option<NaiveDate>,
    pub customer_code: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub vat_number: Option<String>,
    pub bill_to: Option<String>,
    /// As the ERP spells it; used for per-user visibility
    pub salesman_name: Option<String>,
    /// Canonical name, None when unmapped
    pub salesman: Option<String>,
    pub bp_reference_no: Option<String>,
    pub discount_percentage: Decimal,
    pub document_total: Decimal,
    pub vat_sum: Decimal,
    pub total_discount: Decimal,
    /// Raised against a proforma invoice in the ERP
    pub is_sap_pi: bool,
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SalesOrderLine {
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

fn owned(text: Option<&str>) -> Option<String> {
    text.map(str::to_string)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SalesOrders;

impl Entity for SalesOrders {
    type Header = SalesOrderHeader;
    type Child = SalesOrderLine;

    fn feed(&self) -> FeedKind {
        FeedKind::SalesOrders
    }

    fn table(&self) -> &'static str {
        "sales_orders"
    }

    fn key_column(&self) -> &'static str {
        "so_number"
    }

    fn header(&self, row: &NormalizedRow, mapper: &SalesmanMapper) -> Result<SalesOrderHeader, String> {
        let salesman_name = owned(row.text("sales employee name"));
        Ok(SalesOrderHeader {
            internal_number: owned(row.text("document internal id")),
            posting_date: row.date("posting date"),
            customer_code: owned(row.text("customer/supplier no.")),
            customer_name: owned(row.text("customer/supplier name")),
            customer_phone: owned(row.text("customer phone")),
            vat_number: owned(row.text("vat number")),
            bill_to: owned(row.text("bill to")),
            salesman: attribute(mapper, salesman_name.as_deref()),
            salesman_name,
            bp_reference_no: owned(row.text("bp reference no.")),
            discount_percentage: row.decimal("discount percent"),
            document_total: row.decimal("document total"),
            vat_sum: row.decimal("vat sum"),
            total_discount: row.decimal("total discount"),
            is_sap_pi: row.flag("proforma invoice"),
            status: owned(row.text("status")),
        })
    }

    fn salesman<'h>(&self, header: &'h SalesOrderHeader) -> Option<&'h str> {
        header.salesman.as_deref()
    }

    fn child(&self, row: &NormalizedRow) -> Result<Option<SalesOrderLine>, String> {
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
        Ok(Some(SalesOrderLine {
            item_no: item_no.to_string(),
            description: owned(row.text("item/service description")),
            manufacturer: owned(row.text("manufacturer name")),
            quantity: row.decimal("quantity"),
            price,
            row_total: row.decimal("row total"),
            row_status: owned(row.text("row status")),
            remaining_open_quantity: remaining,
            pending_amount: quantize(pending, MONEY_SCALE),
        }))
    }

    fn insert_headers(
        &self,
        conn: &Connection,
        headers: &[NewHeader<'_, SalesOrderHeader>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO sales_orders (
                so_number, internal_number, posting_date, customer_code, customer_name,
                customer_phone, vat_number, bill_to, salesman_name, salesman_id,
                bp_reference_no, discount_percentage, document_total, status,
                vat_sum, total_discount, is_sap_pi
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        )?;

        for (key, h, salesman_id) in headers {
            stmt.execute(params![
                key,
                h.internal_number,
                date_text(h.posting_date),
                h.customer_code,
                h.customer_name,
                h.customer_phone,
                h.vat_number,
                h.bill_to,
                h.salesman_name,
                salesman_id,
                h.bp_reference_no,
                h.discount_percentage.to_string(),
                h.document_total.to_string(),
                h.status,
                h.vat_sum.to_string(),
                h.total_discount.to_string(),
                h.is_sap_pi,
            ])?;
        }
        Ok(headers.len())
    }

    fn update_headers(
        &self,
        conn: &Connection,
        headers: &[ExistingHeader<'_, SalesOrderHeader>],
    ) -> rusqlite::Result<usize> {
        // Exhaustive list of synced columns; anything else (remarks,
        // created_at) keeps its stored value.
        let mut stmt = conn.prepare_cached(
            "UPDATE sales_orders SET
                internal_number = ?2, posting_date = ?3, customer_code = ?4,
                customer_name = ?5, customer_phone = ?6, vat_number = ?7, bill_to = ?8,
                salesman_name = ?9, salesman_id = ?10, bp_reference_no = ?11,
                discount_percentage = ?12, document_total = ?13, status = ?14,
                vat_sum = ?15, total_discount = ?16, is_sap_pi = ?17
             WHERE id = ?1",
        )?;

        for (id, h, salesman_id) in headers {
            stmt.execute(params![
                id,
                h.internal_number,
                date_text(h.posting_date),
                h.customer_code,
                h.customer_name,
                h.customer_phone,
                h.vat_number,
                h.bill_to,
                h.salesman_name,
                salesman_id,
                h.bp_reference_no,
                h.discount_percentage.to_string(),
                h.document_total.to_string(),
                h.status,
                h.vat_sum.to_string(),
                h.total_discount.to_string(),
                h.is_sap_pi,
            ])?;
        }
        Ok(headers.len())
    }

    fn child_table(&self) -> Option<(&'static str, &'static str)> {
        Some(("sales_order_items", "order_id"))
    }

    fn insert_children(
        &self,
        conn: &Connection,
        children: &[ChildWrite<'_, SalesOrderLine>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO sales_order_items (
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

    /// Open orders absent from the snapshot are closed, and their lines
    /// lose any remaining open quantity.
    fn close_missing(&self, conn: &Connection, seen: &HashSet<&str>) -> rusqlite::Result<usize> {
        let stale: Vec<i64> = fetch_ids_where(conn, "sales_orders", "so_number", OPEN_FILTER)?
            .into_iter()
            .filter(|(_, so_number)| !seen.contains(so_number.as_str()))
            .map(|(id, _)| id)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        update_by_ids(conn, "sales_orders", "status = 'C'", "id", &stale)?;
        update_by_ids(
            conn,
            "sales_order_items",
            "row_status = 'C', remaining_open_quantity = '0.000', pending_amount = '0.00'",
            "order_id",
            &stale,
        )?;
        tracing::debug!(closed = stale.len(), "closed orders missing from open snapshot");
        Ok(stale.len())
    }
}

const OPEN_FILTER: &str = "UPPER(status) IN ('O', 'OPEN')";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RawRow;

    fn normalized(pairs: &[(&str, &str)]) -> NormalizedRow {
        let raw = pairs
            .iter()
            .fold(RawRow::new(2), |row, (c, v)| row.with(c, v));
        schema().normalize(&raw).unwrap()
    }

    #[test]
    fn test_header_attribution_uses_mapper() {
        let mapper = SalesmanMapper::with_defaults();
        let row = normalized(&[
            ("Document Number", "SO1"),
            ("Sales Employee Name", "A.MR.RAFIQ AD"),
            ("Document Total", "1,000"),
        ]);

        let header = SalesOrders.header(&row, &mapper).unwrap();
        assert_eq!(header.salesman_name.as_deref(), Some("A.MR.RAFIQ AD"));
        assert_eq!(header.salesman.as_deref(), Some("RAFIQ"));
        assert_eq!(header.document_total.to_string(), "1000.00");

        let row = normalized(&[("Document Number", "SO2"), ("Sales Employee Name", "Z.UNKNOWN")]);
        assert_eq!(SalesOrders.header(&row, &mapper).unwrap().salesman, None);
    }

    #[test]
    fn test_child_pending_amount() {
        let row = normalized(&[
            ("Document Number", "SO1"),
            ("Item No.", "X1"),
            ("Quantity", "4"),
            ("Price", "2.50"),
            ("Remaining Open Quantity", "3"),
        ]);

        let line = SalesOrders.child(&row).unwrap().unwrap();
        assert_eq!(line.item_no, "X1");
        assert_eq!(line.pending_amount.to_string(), "7.50");
    }

    #[test]
    fn test_header_only_row_has_no_child() {
        let row = normalized(&[("Document Number", "SO1"), ("Status", "O")]);
        assert_eq!(SalesOrders.child(&row), Ok(None));
    }

    #[test]
    fn test_line_without_item_no_is_child_error() {
        let row = normalized(&[("Document Number", "SO1"), ("Quantity", "2")]);
        assert!(SalesOrders.child(&row).is_err());
    }

    #[test]
    fn test_proforma_and_totals() {
        let mapper = SalesmanMapper::with_defaults();
        let row = normalized(&[
            ("Document Number", "SO1"),
            ("VAT Sum", "15"),
            ("Total Discount", "2.5"),
            ("Proforma Invoice", "y"),
        ]);

        let header = SalesOrders.header(&row, &mapper).unwrap();
        assert_eq!(header.vat_sum.to_string(), "15.00");
        assert_eq!(header.total_discount.to_string(), "2.50");
        assert!(header.is_sap_pi);

        let row = normalized(&[("Document Number", "SO2"), ("Proforma Invoice", "N")]);
        assert!(!SalesOrders.header(&row, &mapper).unwrap().is_sap_pi);
    }

    #[test]
    fn test_pending_amount_overflow_is_child_error() {
        let row = normalized(&[
            ("Document Number", "SO1"),
            ("Item No.", "X1"),
            ("Price", "100000000000000000000"),
            ("Remaining Open Quantity", "100000000000000000000"),
        ]);

        let err = SalesOrders.child(&row).unwrap_err();
        assert!(err.contains("X1"));
    }

    #[test]
    fn test_close_missing_spans_chunks() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::setup_database(&conn).unwrap();
        for i in 0..1200 {
            conn.execute(
                "INSERT INTO sales_orders (so_number, discount_percentage, document_total, status)
                 VALUES (?1, '0.00', '1.00', 'O')",
                params![format!("SO{}", i)],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO sales_order_items (order_id, line_no, item_no, quantity, price, row_total,
                    remaining_open_quantity, pending_amount)
                 VALUES (?1, 1, 'X', '1.000', '1.00', '1.00', '1.000', '1.00')",
                params![conn.last_insert_rowid()],
            )
            .unwrap();
        }

        let seen: HashSet<&str> = ["SO0", "SO1"].into_iter().collect();
        assert_eq!(SalesOrders.close_missing(&conn, &seen).unwrap(), 1198);

        let open_lines: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sales_order_items WHERE remaining_open_quantity <> '0.000'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(open_lines, 2);
        assert_eq!(SalesOrders.close_missing(&conn, &seen).unwrap(), 0);
    }
}
