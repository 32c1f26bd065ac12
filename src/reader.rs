// 📥 Source Reader - CSV uploads and ERP payloads → raw rows
//
// Every source yields the same thing: a lazy, ordered stream of string-keyed
// rows whose keys are normalized column names. ERP JSON is flattened into the
// spreadsheet vocabulary so both paths share one schema per feed.

use crate::error::{RowError, SyncError, SyncResult};
use crate::schema::{parse_decimal, quantize, FeedSchema, MONEY_SCALE};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

// ============================================================================
// FEED KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    SalesOrders,
    Quotations,
    PurchaseOrders,
    ArInvoices,
    ArCreditMemos,
    FinanceSummary,
    ContactCards,
}

impl FeedKind {
    pub fn name(&self) -> &'static str {
        match self {
            FeedKind::SalesOrders => "Sales Orders",
            FeedKind::Quotations => "Sales Quotations",
            FeedKind::PurchaseOrders => "Purchase Orders",
            FeedKind::ArInvoices => "AR Invoices",
            FeedKind::ArCreditMemos => "AR Credit Memos",
            FeedKind::FinanceSummary => "Customer Finance",
            FeedKind::ContactCards => "Contact Cards",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            FeedKind::SalesOrders => "sales_orders",
            FeedKind::Quotations => "quotations",
            FeedKind::PurchaseOrders => "purchase_orders",
            FeedKind::ArInvoices => "ar_invoices",
            FeedKind::ArCreditMemos => "ar_credit_memos",
            FeedKind::FinanceSummary => "finance_summary",
            FeedKind::ContactCards => "contact_cards",
        }
    }

    pub fn all() -> [FeedKind; 7] {
        [
            FeedKind::SalesOrders,
            FeedKind::Quotations,
            FeedKind::PurchaseOrders,
            FeedKind::ArInvoices,
            FeedKind::ArCreditMemos,
            FeedKind::FinanceSummary,
            FeedKind::ContactCards,
        ]
    }
}

impl std::fmt::Display for FeedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for FeedKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase().replace('-', "_");
        FeedKind::all()
            .into_iter()
            .find(|k| k.code() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = FeedKind::all().iter().map(|k| k.code()).collect();
                format!("unknown feed '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}

// ============================================================================
// RAW ROW
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// 1-based; file rows count the header row
    pub line_number: usize,
    pub fields: HashMap<String, String>,
}

impl RawRow {
    pub fn new(line_number: usize) -> Self {
        RawRow {
            line_number,
            fields: HashMap::new(),
        }
    }

    /// Builder for tests and in-memory batches
    pub fn with(mut self, column: &str, value: &str) -> Self {
        self.fields.insert(normalize_header(column), value.to_string());
        self
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields.get(column).map(String::as_str)
    }

    pub fn is_blank(&self) -> bool {
        self.fields.values().all(|v| v.trim().is_empty())
    }
}

/// Trim, drop a stray BOM, collapse inner whitespace, lower-case.
pub fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ============================================================================
// ROW SOURCE TRAIT
// ============================================================================

pub type RowIter = Box<dyn Iterator<Item = Result<RawRow, RowError>>>;

/// Anything a pass can read rows from.
///
/// `open` validates the column set against the schema before yielding a
/// single row; a missing column is a `SyncError::Schema` and the pass ends
/// without writing anything.
pub trait RowSource {
    fn feed(&self) -> FeedKind;

    /// Human-readable origin for logs ("upload.csv", "ERP /SalesOrder")
    fn describe(&self) -> String;

    fn open(self: Box<Self>, schema: &FeedSchema) -> SyncResult<RowIter>;
}

fn check_columns<'a, I>(schema: &FeedSchema, columns: I) -> SyncResult<()>
where
    I: IntoIterator<Item = &'a String>,
{
    let present: BTreeSet<&str> = columns.into_iter().map(String::as_str).collect();
    let missing = schema.missing_columns(&present);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SyncError::schema(schema.feed.code(), missing))
    }
}

// ============================================================================
// CSV SOURCE
// ============================================================================

enum CsvInput {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

pub struct CsvSource {
    feed: FeedKind,
    input: CsvInput,
}

/// UTF-8 BOM bytes.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

impl CsvSource {
    pub fn from_path<P: AsRef<Path>>(feed: FeedKind, path: P) -> Self {
        CsvSource {
            feed,
            input: CsvInput::Path(path.as_ref().to_path_buf()),
        }
    }

    pub fn from_bytes(feed: FeedKind, data: impl Into<Vec<u8>>) -> Self {
        CsvSource {
            feed,
            input: CsvInput::Bytes(data.into()),
        }
    }

    fn rows(data: Arc<[u8]>, schema: &FeedSchema) -> SyncResult<RowIter> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::None)
            .from_reader(Cursor::new(Arc::clone(&data)));

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| SyncError::Source(format!("unreadable header row: {}", e)))?
            .iter()
            .map(normalize_header)
            .collect();

        check_columns(schema, &headers)?;

        let mut last_line = 1;
        let iter = reader
            .into_records()
            .map(move |result| {
                let position = match &result {
                    Ok(record) => record.position(),
                    Err(e) => e.position(),
                };
                let line_number = position
                    .map(|pos| record_line(&data, pos))
                    .unwrap_or(last_line + 1);
                last_line = line_number;

                let record = result.map_err(|e| {
                    RowError::parse(line_number, None, format!("unreadable record: {}", e))
                })?;

                let fields = headers
                    .iter()
                    .zip(record.iter())
                    .map(|(h, v)| (h.clone(), v.to_string()))
                    .collect();

                Ok(RawRow {
                    line_number,
                    fields,
                })
            })
            .filter(|row| !matches!(row, Ok(r) if r.is_blank()));

        Ok(Box::new(iter))
    }
}

/// 1-based physical line a record starts on. csv takes the record position
/// before it skips empty lines, so the line breaks between that position and
/// the first byte of the record are added back.
fn record_line(data: &[u8], pos: &csv::Position) -> usize {
    let start = usize::try_from(pos.byte()).unwrap_or(usize::MAX);
    let skipped = data
        .get(start..)
        .unwrap_or_default()
        .iter()
        .take_while(|b| matches!(**b, b'\r' | b'\n'))
        .filter(|b| **b == b'\n')
        .count();
    usize::try_from(pos.line()).unwrap_or(usize::MAX).saturating_add(skipped)
}

impl RowSource for CsvSource {
    fn feed(&self) -> FeedKind {
        self.feed
    }

    fn describe(&self) -> String {
        match &self.input {
            CsvInput::Path(path) => path.display().to_string(),
            CsvInput::Bytes(data) => format!("<{} bytes>", data.len()),
        }
    }

    /// Files are read whole; line numbers are recovered from byte offsets.
    fn open(self: Box<Self>, schema: &FeedSchema) -> SyncResult<RowIter> {
        let mut data = match self.input {
            CsvInput::Path(path) => std::fs::read(&path).map_err(|e| {
                SyncError::Source(format!("cannot open {}: {}", path.display(), e))
            })?,
            CsvInput::Bytes(data) => data,
        };
        if data.starts_with(UTF8_BOM) {
            data.drain(..UTF8_BOM.len());
        }
        Self::rows(Arc::from(data), schema)
    }
}

// ============================================================================
// ERP PAYLOAD SOURCE
// ============================================================================

/// Column → JSON paths tried in order (dotted paths walk nested objects).
type ColumnMap = &'static [(&'static str, &'static [&'static str])];

const DOCUMENT_HEADER: ColumnMap = &[
    ("document number", &["DocNum"]),
    ("document internal id", &["DocEntry"]),
    ("posting date", &["DocDate"]),
    ("customer/supplier no.", &["BusinessPartner.CardCode", "CardCode"]),
    ("customer/supplier name", &["BusinessPartner.CardName", "CardName"]),
    ("vat number", &["BusinessPartner.FederalTaxID", "FederalTaxID"]),
    ("customer phone", &["BusinessPartner.Phone1", "Phone1"]),
    ("bill to", &["Address"]),
    (
        "sales employee name",
        &["SalesPerson.SalesEmployeeName", "SalesEmployeeName", "SalesPersonCode"],
    ),
    ("bp reference no.", &["NumAtCard", "U_PurchaseOrder"]),
    ("document total", &["DocTotal"]),
    ("vat sum", &["VatSum"]),
    ("total discount", &["TotalDiscount"]),
    ("discount percent", &["DiscountPercent"]),
    ("status", &["DocumentStatus"]),
    ("comments", &["Comments"]),
];

const DOCUMENT_LINE: ColumnMap = &[
    ("item no.", &["ItemCode"]),
    ("item/service description", &["ItemDescription"]),
    ("manufacturer name", &["Manufacturer", "U_Manufacturer"]),
    ("quantity", &["Quantity"]),
    ("price", &["Price"]),
    ("row total", &["LineTotal"]),
    ("row status", &["LineStatus"]),
    ("remaining open quantity", &["RemainingOpenQuantity"]),
];

const SALES_ORDER_EXTRA: ColumnMap = &[("proforma invoice", &["U_PROFORMAINVOICE"])];

const QUOTATION_EXTRA: ColumnMap = &[("rounding diff amount", &["RoundingDiffAmount"])];

const PURCHASE_ORDER_EXTRA: ColumnMap = &[("closing remarks", &["ClosingRemarks"])];

const AR_HEADER_EXTRA: ColumnMap = &[
    ("due date", &["DocDueDate"]),
    ("gross profit", &["TotalGrossProfit", "GrossProfit"]),
    ("store", &["U_Store", "Store"]),
    ("cancel status", &["Cancelled", "CancelStatus"]),
];

const AR_LINE_EXTRA: ColumnMap = &[
    ("line gross profit", &["GrossProfit"]),
    ("tax total", &["TaxTotal"]),
];

const PLAIN_LINES: &[ColumnMap] = &[DOCUMENT_LINE];
const SALES_ORDER_MAPS: &[ColumnMap] = &[DOCUMENT_HEADER, SALES_ORDER_EXTRA];
const QUOTATION_MAPS: &[ColumnMap] = &[DOCUMENT_HEADER, QUOTATION_EXTRA];
const PURCHASE_ORDER_MAPS: &[ColumnMap] = &[DOCUMENT_HEADER, PURCHASE_ORDER_EXTRA];
const AR_MAPS: &[ColumnMap] = &[DOCUMENT_HEADER, AR_HEADER_EXTRA];
const AR_LINES: &[ColumnMap] = &[DOCUMENT_LINE, AR_LINE_EXTRA];

/// (header maps, line maps) for each document feed
fn document_maps(feed: FeedKind) -> Option<(&'static [ColumnMap], &'static [ColumnMap])> {
    match feed {
        FeedKind::SalesOrders => Some((SALES_ORDER_MAPS, PLAIN_LINES)),
        FeedKind::Quotations => Some((QUOTATION_MAPS, PLAIN_LINES)),
        FeedKind::PurchaseOrders => Some((PURCHASE_ORDER_MAPS, PLAIN_LINES)),
        FeedKind::ArInvoices | FeedKind::ArCreditMemos => Some((AR_MAPS, AR_LINES)),
        FeedKind::FinanceSummary | FeedKind::ContactCards => None,
    }
}

/// ERP document status → single-letter status. Values that are not ERP
/// enum names pass through untouched.
pub fn erp_status(raw: &str) -> String {
    let raw = raw.trim();
    match raw.strip_prefix("bost_") {
        Some("Open") => "O".to_string(),
        Some(_) => "C".to_string(),
        None => raw.to_string(),
    }
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |node, key| node.get(key))
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(if *b { "Y" } else { "N" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn apply_maps(record: &Value, maps: &[ColumnMap], out: &mut HashMap<String, String>) {
    for (column, paths) in maps.iter().flat_map(|map| map.iter()) {
        let text = paths
            .iter()
            .filter_map(|p| lookup(record, p))
            .find_map(value_text)
            .unwrap_or_default();
        out.insert(column.to_string(), text);
    }
}

/// Wraps ERP JSON records for one feed.
pub struct ApiSource {
    feed: FeedKind,
    records: Vec<Value>,
    origin: String,
}

impl ApiSource {
    pub fn new(feed: FeedKind, records: Vec<Value>) -> Self {
        ApiSource {
            feed,
            records,
            origin: "ERP payload".to_string(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// One row per document line with the header columns repeated; a
    /// document without lines still yields its header row.
    fn flatten_document(
        record: &Value,
        header_maps: &[ColumnMap],
        line_maps: &[ColumnMap],
    ) -> Vec<HashMap<String, String>> {
        let mut header = HashMap::new();
        apply_maps(record, header_maps, &mut header);
        if let Some(status) = header.get_mut("status") {
            *status = erp_status(status);
        }

        let lines = record
            .get("DocumentLines")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        if lines.is_empty() {
            let mut row = header;
            apply_maps(&Value::Null, line_maps, &mut row);
            return vec![row];
        }

        lines
            .iter()
            .map(|line| {
                let mut row = header.clone();
                apply_maps(line, line_maps, &mut row);
                if let Some(status) = row.get_mut("row status") {
                    *status = erp_status(status);
                }
                row
            })
            .collect()
    }

    /// Sum of remaining open quantity × price over the lines. `None` when
    /// the sum does not fit a decimal.
    fn open_line_total(record: &Value) -> Option<Decimal> {
        let lines = record
            .get("DocumentLines")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        lines.iter().try_fold(Decimal::ZERO, |total, line| {
            let number = |key: &str| {
                line.get(key)
                    .and_then(value_text)
                    .and_then(|text| parse_decimal(&text))
                    .unwrap_or(Decimal::ZERO)
            };
            number("RemainingOpenQuantity")
                .checked_mul(number("Price"))
                .and_then(|pending| total.checked_add(pending))
        })
    }

    /// Flat records: keys become columns as-is.
    fn flatten_flat(record: &Value) -> Vec<HashMap<String, String>> {
        let row = record
            .as_object()
            .map(|obj| {
                obj.iter()
                    .map(|(k, v)| (normalize_header(k), value_text(v).unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default();
        vec![row]
    }

    pub fn flatten(feed: FeedKind, record: &Value) -> Vec<HashMap<String, String>> {
        let Some((header_maps, line_maps)) = document_maps(feed) else {
            return Self::flatten_flat(record);
        };
        let mut rows = Self::flatten_document(record, header_maps, line_maps);

        // An open order is worth what is still to be delivered; DocTotal
        // only stands in when nothing is pending.
        if feed == FeedKind::SalesOrders {
            match Self::open_line_total(record) {
                Some(total) if !total.is_zero() => {
                    let total = quantize(total, MONEY_SCALE).to_string();
                    for row in &mut rows {
                        row.insert("document total".to_string(), total.clone());
                    }
                }
                Some(_) => {}
                None => tracing::warn!(
                    doc_num = %record.get("DocNum").and_then(value_text).unwrap_or_default(),
                    "open line total overflows, keeping DocTotal"
                ),
            }
        }
        rows
    }
}

impl RowSource for ApiSource {
    fn feed(&self) -> FeedKind {
        self.feed
    }

    fn describe(&self) -> String {
        format!("{} ({} records)", self.origin, self.records.len())
    }

    fn open(self: Box<Self>, schema: &FeedSchema) -> SyncResult<RowIter> {
        let feed = self.feed;
        let rows: Vec<HashMap<String, String>> = self
            .records
            .iter()
            .flat_map(|record| Self::flatten(feed, record))
            .collect();

        // An empty snapshot is a legitimate answer; only check columns when
        // there is something to check.
        if !rows.is_empty() {
            let mut columns = BTreeSet::new();
            for row in &rows {
                columns.extend(row.keys().cloned());
            }
            check_columns(schema, columns.iter())?;
        }

        let iter = rows
            .into_iter()
            .enumerate()
            .map(|(idx, fields)| {
                Ok(RawRow {
                    line_number: idx + 1,
                    fields,
                })
            })
            .filter(|row: &Result<RawRow, RowError>| !matches!(row, Ok(r) if r.is_blank()));

        Ok(Box::new(iter))
    }
}

/// Rows already in memory; used by tests and by callers that pre-build a batch.
pub struct MemorySource {
    feed: FeedKind,
    rows: Vec<RawRow>,
}

impl MemorySource {
    pub fn new(feed: FeedKind, rows: Vec<RawRow>) -> Self {
        MemorySource { feed, rows }
    }
}

impl RowSource for MemorySource {
    fn feed(&self) -> FeedKind {
        self.feed
    }

    fn describe(&self) -> String {
        format!("<{} in-memory rows>", self.rows.len())
    }

    fn open(self: Box<Self>, schema: &FeedSchema) -> SyncResult<RowIter> {
        if let Some(first) = self.rows.first() {
            let columns: Vec<String> = first.fields.keys().cloned().collect();
            check_columns(schema, &columns)?;
        }
        Ok(Box::new(self.rows.into_iter().map(Ok)))
    }
}

// ============================================================================
// TESTS
// ============================================================================
