// Entity Models
//
// Each persisted aggregate has:
// - a natural business key (UNIQUE column) that identifies it across imports
// - header fields written by an explicit, exhaustive column list
// - optionally, child rows that are replaced wholesale on every sight
//
// The reconciler is generic over `Entity`; these modules only say how rows
// become headers/children and which SQL writes them.

pub mod ar_document;
pub mod contact_card;
pub mod customer;
pub mod purchase_order;
pub mod quotation;
pub mod sales_order;

pub use ar_document::{ArDocumentHeader, ArDocumentLine, ArDocuments, DocumentKind};
pub use contact_card::{ContactCard, ContactCards};
pub use customer::{CustomerFinance, CustomerFinanceHeader};
pub use purchase_order::{PurchaseOrderHeader, PurchaseOrderLine, PurchaseOrders};
pub use quotation::{QuotationHeader, QuotationLine, Quotations};
pub use sales_order::{SalesOrderHeader, SalesOrderLine, SalesOrders};

use crate::mapping::SalesmanMapper;
use crate::reader::FeedKind;
use crate::schema::{FeedSchema, NormalizedRow};
use rusqlite::Connection;
use std::collections::HashSet;
use std::fmt::Debug;

/// (natural key, header, salesman id) for a header that does not exist yet
pub type NewHeader<'a, H> = (&'a str, &'a H, Option<i64>);

/// (row id, header, salesman id) for a header that already exists
pub type ExistingHeader<'a, H> = (i64, &'a H, Option<i64>);

#[derive(Debug)]
pub struct ChildWrite<'a, C> {
    pub parent_id: i64,
    /// 1-based, per parent, in source order
    pub line_no: i64,
    pub child: &'a C,
}

pub trait Entity {
    type Header: Debug + Clone;
    type Child: Debug;

    fn feed(&self) -> FeedKind;

    /// Header table and its natural key column
    fn table(&self) -> &'static str;
    fn key_column(&self) -> &'static str;

    fn schema(&self) -> FeedSchema {
        schema_for(self.feed())
    }

    /// `Err` rejects the whole row (header and child) and is reported.
    fn header(&self, row: &NormalizedRow, mapper: &SalesmanMapper) -> Result<Self::Header, String>;

    /// Canonical salesman to attribute, if any
    fn salesman<'h>(&self, _header: &'h Self::Header) -> Option<&'h str> {
        None
    }

    /// `Ok(None)` when the row carries no line data (header-only row).
    /// `Err` skips the child and is reported; the parent is still written.
    fn child(&self, _row: &NormalizedRow) -> Result<Option<Self::Child>, String> {
        Ok(None)
    }

    fn insert_headers(
        &self,
        conn: &Connection,
        headers: &[NewHeader<'_, Self::Header>],
    ) -> rusqlite::Result<usize>;

    fn update_headers(
        &self,
        conn: &Connection,
        headers: &[ExistingHeader<'_, Self::Header>],
    ) -> rusqlite::Result<usize>;

    /// Child table and its parent id column, for entities with children
    fn child_table(&self) -> Option<(&'static str, &'static str)> {
        None
    }

    fn insert_children(
        &self,
        _conn: &Connection,
        _children: &[ChildWrite<'_, Self::Child>],
    ) -> rusqlite::Result<usize> {
        Ok(0)
    }

    /// Close entities that a complete open snapshot no longer contains.
    fn close_missing(&self, _conn: &Connection, _seen: &HashSet<&str>) -> rusqlite::Result<usize> {
        Ok(0)
    }
}

/// Column schema for each feed.
pub fn schema_for(feed: FeedKind) -> FeedSchema {
    match feed {
        FeedKind::SalesOrders => sales_order::schema(),
        FeedKind::Quotations => quotation::schema(),
        FeedKind::PurchaseOrders => purchase_order::schema(),
        FeedKind::ArInvoices | FeedKind::ArCreditMemos => ar_document::schema(feed),
        FeedKind::FinanceSummary => customer::schema(),
        FeedKind::ContactCards => contact_card::schema(),
    }
}

/// Canonical salesman for a raw ERP name, or None when the mapper says
/// there is no mapping.
pub(crate) fn attribute(mapper: &SalesmanMapper, raw: Option<&str>) -> Option<String> {
    raw.and_then(|name| mapper.map(name).canonical().map(str::to_string))
}
