// 🧮 AR Documents - invoices and credit memos
// Same shape, separate tables. DocumentKind picks the tables.

use super::{attribute, ChildWrite, Entity, ExistingHeader, NewHeader};
use crate::db::date_text;
use crate::mapping::SalesmanMapper;
use crate::reader::FeedKind;
use crate::schema::{FeedSchema, FieldSpec, NormalizedRow};
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Invoice,
    CreditMemo,
}

impl DocumentKind {
    pub fn feed(&self) -> FeedKind {
        match self {
            DocumentKind::Invoice => FeedKind::ArInvoices,
            DocumentKind::CreditMemo => FeedKind::ArCreditMemos,
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "ar_invoices",
            DocumentKind::CreditMemo => "ar_credit_memos",
        }
    }

    pub fn item_table(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "ar_invoice_items",
            DocumentKind::CreditMemo => "ar_credit_memo_items",
        }
    }
}

pub fn schema(feed: FeedKind) -> FeedSchema {
    FeedSchema::new(
        feed,
        "document number",
        vec![
            FieldSpec::text("document number"),
            FieldSpec::date("posting date"),
            FieldSpec::text("customer/supplier no."),
            FieldSpec::text("customer/supplier name"),
            FieldSpec::text("sales employee name"),
            FieldSpec::money("document total"),
            FieldSpec::text("item no."),
            FieldSpec::text("item/service description"),
            FieldSpec::quantity("quantity"),
            FieldSpec::money("price"),
            FieldSpec::money("row total"),
            FieldSpec::text("document internal id").optional(),
            FieldSpec::date("due date").optional(),
            FieldSpec::text("vat number").optional(),
            FieldSpec::text("bp reference no.").optional(),
            FieldSpec::money("vat sum").optional(),
            FieldSpec::money("gross profit").optional(),
            FieldSpec::money("discount percent").optional(),
            FieldSpec::text("store").optional().or("HO"),
            FieldSpec::text("status").optional(),
            FieldSpec::text("cancel status").optional(),
            FieldSpec::text("comments").optional(),
            FieldSpec::money("line gross profit").optional(),
            FieldSpec::money("tax total").optional(),
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
pub struct ArDocumentHeader {
    pub internal_number: Option<String>,
    pub posting_date: Option<NaiveDate>,
    pub doc_due_date: Option<NaiveDate>,
    pub customer_code: Option<String>,
    pub customer_name: Option<String>,
    pub vat_number: Option<String>,
    pub salesman_name: Option<String>,
    pub salesman: Option<String>,
    pub store: String,
    pub bp_reference_no: Option<String>,
    pub doc_total: Decimal,
    pub vat_sum: Decimal,
    pub total_gross_profit: Decimal,
    pub discount_percent: Decimal,
    pub document_status: Option<String>,
    pub cancel_status: Option<String>,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArDocumentLine {
    pub item_code: String,
    pub item_description: Option<String>,
    pub quantity: Decimal,
    pub price: Decimal,
    pub line_total: Decimal,
    pub gross_profit: Decimal,
    pub tax_total: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct ArDocuments {
    pub kind: DocumentKind,
}

impl ArDocuments {
    pub fn invoices() -> Self {
        ArDocuments {
            kind: DocumentKind::Invoice,
        }
    }

    pub fn credit_memos() -> Self {
        ArDocuments {
            kind: DocumentKind::CreditMemo,
        }
    }
}

fn owned(row: &NormalizedRow, column: &str) -> Option<String> {
    row.text(column).map(str::to_string)
}

impl Entity for ArDocuments {
    type Header = ArDocumentHeader;
    type Child = ArDocumentLine;

    fn feed(&self) -> FeedKind {
        self.kind.feed()
    }

    fn table(&self) -> &'static str {
        self.kind.table()
    }

    fn key_column(&self) -> &'static str {
        "document_number"
    }

    fn header(&self, row: &NormalizedRow, mapper: &SalesmanMapper) -> Result<ArDocumentHeader, String> {
        let salesman_name = owned(row, "sales employee name");
        Ok(ArDocumentHeader {
            internal_number: owned(row, "document internal id"),
            posting_date: row.date("posting date"),
            doc_due_date: row.date("due date"),
            customer_code: owned(row, "customer/supplier no."),
            customer_name: owned(row, "customer/supplier name"),
            vat_number: owned(row, "vat number"),
            salesman: attribute(mapper, salesman_name.as_deref()),
            salesman_name,
            store: row.text_or("store", "HO"),
            bp_reference_no: owned(row, "bp reference no."),
            doc_total: row.decimal("document total"),
            vat_sum: row.decimal("vat sum"),
            total_gross_profit: row.decimal("gross profit"),
            discount_percent: row.decimal("discount percent"),
            document_status: owned(row, "status"),
            cancel_status: owned(row, "cancel status"),
            comments: owned(row, "comments"),
        })
    }

    fn salesman<'h>(&self, header: &'h ArDocumentHeader) -> Option<&'h str> {
        header.salesman.as_deref()
    }

    fn child(&self, row: &NormalizedRow) -> Result<Option<ArDocumentLine>, String> {
        if row.all_blank(LINE_COLUMNS) {
            return Ok(None);
        }
        let item_code = row
            .text("item no.")
            .ok_or_else(|| "line has data but no item no.".to_string())?;

        Ok(Some(ArDocumentLine {
            item_code: item_code.to_string(),
            item_description: owned(row, "item/service description"),
            quantity: row.decimal("quantity"),
            price: row.decimal("price"),
            line_total: row.decimal("row total"),
            gross_profit: row.decimal("line gross profit"),
            tax_total: row.decimal("tax total"),
        }))
    }

    fn insert_headers(
        &self,
        conn: &Connection,
        headers: &[NewHeader<'_, ArDocumentHeader>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT INTO {} (
                document_number, internal_number, posting_date, doc_due_date,
                customer_code, customer_name, vat_number, salesman_name, salesman_id,
                store, bp_reference_no, doc_total, vat_sum, total_gross_profit,
                discount_percent, document_status, cancel_status, comments
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            self.kind.table()
        ))?;

        for (key, h, salesman_id) in headers {
            stmt.execute(params![
                key,
                h.internal_number,
                date_text(h.posting_date),
                date_text(h.doc_due_date),
                h.customer_code,
                h.customer_name,
                h.vat_number,
                h.salesman_name,
                salesman_id,
                h.store,
                h.bp_reference_no,
                h.doc_total.to_string(),
                h.vat_sum.to_string(),
                h.total_gross_profit.to_string(),
                h.discount_percent.to_string(),
                h.document_status,
                h.cancel_status,
                h.comments,
            ])?;
        }
        Ok(headers.len())
    }

    fn update_headers(
        &self,
        conn: &Connection,
        headers: &[ExistingHeader<'_, ArDocumentHeader>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(&format!(
            "UPDATE {} SET
                internal_number = ?2, posting_date = ?3, doc_due_date = ?4,
                customer_code = ?5, customer_name = ?6, vat_number = ?7,
                salesman_name = ?8, salesman_id = ?9, store = ?10, bp_reference_no = ?11,
                doc_total = ?12, vat_sum = ?13, total_gross_profit = ?14,
                discount_percent = ?15, document_status = ?16, cancel_status = ?17,
                comments = ?18
             WHERE id = ?1",
            self.kind.table()
        ))?;

        for (id, h, salesman_id) in headers {
            stmt.execute(params![
                id,
                h.internal_number,
                date_text(h.posting_date),
                date_text(h.doc_due_date),
                h.customer_code,
                h.customer_name,
                h.vat_number,
                h.salesman_name,
                salesman_id,
                h.store,
                h.bp_reference_no,
                h.doc_total.to_string(),
                h.vat_sum.to_string(),
                h.total_gross_profit.to_string(),
                h.discount_percent.to_string(),
                h.document_status,
                h.cancel_status,
                h.comments,
            ])?;
        }
        Ok(headers.len())
    }

    fn child_table(&self) -> Option<(&'static str, &'static str)> {
        Some((self.kind.item_table(), "document_id"))
    }

    fn insert_children(
        &self,
        conn: &Connection,
        children: &[ChildWrite<'_, ArDocumentLine>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(&format!(
            "INSERT INTO {} (
                document_id, line_no, item_code, item_description, quantity, price,
                line_total, gross_profit, tax_total
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            self.kind.item_table()
        ))?;

        for write in children {
            let line = write.child;
            stmt.execute(params![
                write.parent_id,
                write.line_no,
                line.item_code,
                line.item_description,
                line.quantity.to_string(),
                line.price.to_string(),
                line.line_total.to_string(),
                line.gross_profit.to_string(),
                line.tax_total.to_string(),
            ])?;
        }
        Ok(children.len())
    }
}
