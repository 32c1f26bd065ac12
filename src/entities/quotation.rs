// 📝 Sales Quotation Entity - document number → quotation header + items
//
// Same row shape as sales orders. Status is kept as OPEN / CLOSED; an open
// snapshot that no longer lists a quotation closes it.

use super::{attribute, ChildWrite, Entity, ExistingHeader, NewHeader};
use crate::db::{date_text, fetch_ids_where, update_by_ids};
use crate::mapping::SalesmanMapper;
use crate::reader::FeedKind;
use crate::schema::{FeedSchema, FieldSpec, NormalizedRow};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::collections::HashSet;

pub fn schema() -> FeedSchema {
    FeedSchema::new(
        FeedKind::Quotations,
        "document number",
        vec![
            FieldSpec::text("document number"),
            FieldSpec::text("document internal id"),
            FieldSpec::date("posting date"),
            FieldSpec::text("customer/supplier no."),
            FieldSpec::text("customer/supplier name"),
            FieldSpec::text("sales employee name"),
            FieldSpec::text("bp reference no."),
            FieldSpec::text("item no."),
            FieldSpec::text("item/service description"),
            FieldSpec::quantity("quantity"),
            FieldSpec::money("price"),
            FieldSpec::money("row total"),
            FieldSpec::money("document total"),
            FieldSpec::text("status"),
            FieldSpec::text("bill to").optional(),
            FieldSpec::money("vat sum").optional(),
            FieldSpec::money("total discount").optional(),
            FieldSpec::money("rounding diff amount").optional(),
            FieldSpec::money("discount percent").optional(),
            FieldSpec::text("comments").optional(),
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
pub struct QuotationHeader {
    pub internal_number: Option<String>,
    pub posting_date: Option<NaiveDate>,
    pub customer_code: Option<String>,
    pub customer_name: Option<String>,
    pub bp_reference_no: Option<String>,
    pub salesman_name: Option<String>,
    pub salesman: Option<String>,
    pub document_total: Decimal,
    pub vat_sum: Decimal,
    pub total_discount: Decimal,
    pub rounding_diff_amount: Decimal,
    pub discount_percent: Decimal,
    /// OPEN, CLOSED, or the source value when it is neither
    pub status: Option<String>,
    pub bill_to: Option<String>,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuotationLine {
    pub item_no: String,
    pub description: Option<String>,
    pub quantity: Decimal,
    pub price: Decimal,
    pub row_total: Decimal,
}

/// O / OPEN → OPEN, C / CLOSED → CLOSED (any case).
pub fn quotation_status(raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    if upper == "O" || upper == "OPEN" {
        "OPEN".to_string()
    } else if upper == "C" || upper == "CLOSED" {
        "CLOSED".to_string()
    } else {
        raw.trim().to_string()
    }
}

fn owned(row: &NormalizedRow, column: &str) -> Option<String> {
    row.text(column).map(str::to_string)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Quotations;

impl Entity for Quotations {
    type Header = QuotationHeader;
    type Child = QuotationLine;

    fn feed(&self) -> FeedKind {
        FeedKind::Quotations
    }

    fn table(&self) -> &'static str {
        "quotations"
    }

    fn key_column(&self) -> &'static str {
        "q_number"
    }

    fn header(&self, row: &NormalizedRow, mapper: &SalesmanMapper) -> Result<QuotationHeader, String> {
        let salesman_name = owned(row, "sales employee name");
        Ok(QuotationHeader {
            internal_number: owned(row, "document internal id"),
            posting_date: row.date("posting date"),
            customer_code: owned(row, "customer/supplier no."),
            customer_name: owned(row, "customer/supplier name"),
            bp_reference_no: owned(row, "bp reference no."),
            salesman: attribute(mapper, salesman_name.as_deref()),
            salesman_name,
            document_total: row.decimal("document total"),
            vat_sum: row.decimal("vat sum"),
            total_discount: row.decimal("total discount"),
            rounding_diff_amount: row.decimal("rounding diff amount"),
            discount_percent: row.decimal("discount percent"),
            status: row.text("status").map(quotation_status),
            bill_to: owned(row, "bill to"),
            remarks: owned(row, "comments"),
        })
    }

    fn salesman<'h>(&self, header: &'h QuotationHeader) -> Option<&'h str> {
        header.salesman.as_deref()
    }

    fn child(&self, row: &NormalizedRow) -> Result<Option<QuotationLine>, String> {
        if row.all_blank(LINE_COLUMNS) {
            return Ok(None);
        }
        let item_no = row
            .text("item no.")
            .ok_or_else(|| "line has data but no item no.".to_string())?;

        Ok(Some(QuotationLine {
            item_no: item_no.to_string(),
            description: owned(row, "item/service description"),
            quantity: row.decimal("quantity"),
            price: row.decimal("price"),
            row_total: row.decimal("row total"),
        }))
    }

    fn insert_headers(
        &self,
        conn: &Connection,
        headers: &[NewHeader<'_, QuotationHeader>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO quotations (
                q_number, internal_number, posting_date, customer_code, customer_name,
                bp_reference_no, salesman_name, salesman_id, document_total, vat_sum,
                total_discount, rounding_diff_amount, discount_percent, status, bill_to, remarks
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )?;

        for (key, h, salesman_id) in headers {
            stmt.execute(params![
                key,
                h.internal_number,
                date_text(h.posting_date),
                h.customer_code,
                h.customer_name,
                h.bp_reference_no,
                h.salesman_name,
                salesman_id,
                h.document_total.to_string(),
                h.vat_sum.to_string(),
                h.total_discount.to_string(),
                h.rounding_diff_amount.to_string(),
                h.discount_percent.to_string(),
                h.status,
                h.bill_to,
                h.remarks,
            ])?;
        }
        Ok(headers.len())
    }

    fn update_headers(
        &self,
        conn: &Connection,
        headers: &[ExistingHeader<'_, QuotationHeader>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "UPDATE quotations SET
                internal_number = ?2, posting_date = ?3, customer_code = ?4,
                customer_name = ?5, bp_reference_no = ?6, salesman_name = ?7,
                salesman_id = ?8, document_total = ?9, vat_sum = ?10, total_discount = ?11,
                rounding_diff_amount = ?12, discount_percent = ?13, status = ?14,
                bill_to = ?15, remarks = ?16
             WHERE id = ?1",
        )?;

        for (id, h, salesman_id) in headers {
            stmt.execute(params![
                id,
                h.internal_number,
                date_text(h.posting_date),
                h.customer_code,
                h.customer_name,
                h.bp_reference_no,
                h.salesman_name,
                salesman_id,
                h.document_total.to_string(),
                h.vat_sum.to_string(),
                h.total_discount.to_string(),
                h.rounding_diff_amount.to_string(),
                h.discount_percent.to_string(),
                h.status,
                h.bill_to,
                h.remarks,
            ])?;
        }
        Ok(headers.len())
    }

    fn child_table(&self) -> Option<(&'static str, &'static str)> {
        Some(("quotation_items", "quotation_id"))
    }

    fn insert_children(
        &self,
        conn: &Connection,
        children: &[ChildWrite<'_, QuotationLine>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO quotation_items (
                quotation_id, line_no, item_no, description, quantity, price, row_total
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;

        for write in children {
            let line = write.child;
            stmt.execute(params![
                write.parent_id,
                write.line_no,
                line.item_no,
                line.description,
                line.quantity.to_string(),
                line.price.to_string(),
                line.row_total.to_string(),
            ])?;
        }
        Ok(children.len())
    }

    /// Items are left as they are; only the header status changes.
    fn close_missing(&self, conn: &Connection, seen: &HashSet<&str>) -> rusqlite::Result<usize> {
        let stale: Vec<i64> = fetch_ids_where(
            conn,
            "quotations",
            "q_number",
            "UPPER(status) IN ('O', 'OPEN')",
        )?
        .into_iter()
        .filter(|(_, q_number)| !seen.contains(q_number.as_str()))
        .map(|(id, _)| id)
        .collect();

        update_by_ids(conn, "quotations", "status = 'CLOSED'", "id", &stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RawRow;

    #[test]
    fn test_quotation_status() {
        assert_eq!(quotation_status("o"), "OPEN");
        assert_eq!(quotation_status(" Open "), "OPEN");
        assert_eq!(quotation_status("C"), "CLOSED");
        assert_eq!(quotation_status("closed"), "CLOSED");
        assert_eq!(quotation_status("Cancelled"), "Cancelled");
    }

    #[test]
    fn test_header_and_line() {
        let raw = RawRow::new(2)
            .with("Document Number", "Q-7")
            .with("Sales Employee Name", "A.MR.RAFIQ")
            .with("Status", "O")
            .with("Rounding Diff Amount", "0.004")
            .with("Comments", "call back")
            .with("Item No.", "X1")
            .with("Quantity", "2")
            .with("Price", "5");
        let row = schema().normalize(&raw).unwrap();

        let header = Quotations.header(&row, &SalesmanMapper::with_defaults()).unwrap();
        assert_eq!(header.status.as_deref(), Some("OPEN"));
        assert_eq!(header.salesman.as_deref(), Some("RAFIQ"));
        assert_eq!(header.rounding_diff_amount.to_string(), "0.00");
        assert_eq!(header.remarks.as_deref(), Some("call back"));

        let line = Quotations.child(&row).unwrap().unwrap();
        assert_eq!(line.item_no, "X1");
        assert_eq!(line.price.to_string(), "5.00");
    }

    #[test]
    fn test_close_missing_marks_closed() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::setup_database(&conn).unwrap();
        for (q, status) in [("Q1", "OPEN"), ("Q2", "open"), ("Q3", "O"), ("Q4", "CLOSED")] {
            conn.execute(
                "INSERT INTO quotations (q_number, document_total, vat_sum, total_discount,
                    rounding_diff_amount, discount_percent, status)
                 VALUES (?1, '0', '0', '0', '0', '0', ?2)",
                params![q, status],
            )
            .unwrap();
        }

        let seen: HashSet<&str> = ["Q1"].into_iter().collect();
        assert_eq!(Quotations.close_missing(&conn, &seen).unwrap(), 2);

        let closed: Vec<String> = conn
            .prepare("SELECT q_number FROM quotations WHERE status = 'CLOSED' ORDER BY q_number")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(closed, vec!["Q2", "Q3", "Q4"]);
    }
}
