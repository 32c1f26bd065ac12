use crate::mapping::ScopeFilter;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// SQLite's default host-parameter limit is 999 on older builds; stay well
/// under it for IN (...) lists.
const KEY_CHUNK: usize = 500;

// ============================================================================
// SETUP
// ============================================================================

/// Open (or create) the store and make sure every table exists.
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Failed to open database: {:?}", path))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Salesmen (canonical identities, get-or-create)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS salesmen (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Sales orders + line items
    // `remarks` is maintained locally and never written by sync.
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sales_orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            so_number TEXT UNIQUE NOT NULL,
            internal_number TEXT,
            posting_date TEXT,
            customer_code TEXT,
            customer_name TEXT,
            customer_phone TEXT,
            vat_number TEXT,
            bill_to TEXT,
            salesman_name TEXT,
            salesman_id INTEGER REFERENCES salesmen(id),
            bp_reference_no TEXT,
            discount_percentage TEXT NOT NULL,
            document_total TEXT NOT NULL,
            vat_sum TEXT NOT NULL DEFAULT '0.00',
            total_discount TEXT NOT NULL DEFAULT '0.00',
            is_sap_pi INTEGER NOT NULL DEFAULT 0,
            status TEXT,
            remarks TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // Stores created before these columns existed
    ensure_column(conn, "sales_orders", "vat_sum", "TEXT NOT NULL DEFAULT '0.00'")?;
    ensure_column(conn, "sales_orders", "total_discount", "TEXT NOT NULL DEFAULT '0.00'")?;
    ensure_column(conn, "sales_orders", "is_sap_pi", "INTEGER NOT NULL DEFAULT 0")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sales_order_items (
            order_id INTEGER NOT NULL REFERENCES sales_orders(id),
            line_no INTEGER NOT NULL,
            item_no TEXT NOT NULL,
            description TEXT,
            manufacturer TEXT,
            quantity TEXT NOT NULL,
            price TEXT NOT NULL,
            row_total TEXT NOT NULL,
            row_status TEXT,
            remaining_open_quantity TEXT NOT NULL,
            pending_amount TEXT NOT NULL,
            PRIMARY KEY (order_id, line_no)
        )",
        [],
    )?;

    // ==========================================================================
    // Sales quotations + line items
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS quotations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            q_number TEXT UNIQUE NOT NULL,
            internal_number TEXT,
            posting_date TEXT,
            customer_code TEXT,
            customer_name TEXT,
            bp_reference_no TEXT,
            salesman_name TEXT,
            salesman_id INTEGER REFERENCES salesmen(id),
            document_total TEXT NOT NULL,
            vat_sum TEXT NOT NULL,
            total_discount TEXT NOT NULL,
            rounding_diff_amount TEXT NOT NULL,
            discount_percent TEXT NOT NULL,
            status TEXT,
            bill_to TEXT,
            remarks TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quotation_items (
            quotation_id INTEGER NOT NULL REFERENCES quotations(id),
            line_no INTEGER NOT NULL,
            item_no TEXT NOT NULL,
            description TEXT,
            quantity TEXT NOT NULL,
            price TEXT NOT NULL,
            row_total TEXT NOT NULL,
            PRIMARY KEY (quotation_id, line_no)
        )",
        [],
    )?;

    // ==========================================================================
    // Open purchase orders (replaced in full on every sync)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS purchase_orders (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            po_number TEXT UNIQUE NOT NULL,
            internal_number TEXT,
            posting_date TEXT,
            supplier_code TEXT,
            supplier_name TEXT,
            supplier_address TEXT,
            supplier_phone TEXT,
            vat_number TEXT,
            bp_reference_no TEXT,
            salesman_name TEXT,
            discount_percentage TEXT NOT NULL,
            document_total TEXT NOT NULL,
            vat_sum TEXT NOT NULL,
            total_discount TEXT NOT NULL,
            status TEXT,
            closing_remarks TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS purchase_order_items (
            order_id INTEGER NOT NULL REFERENCES purchase_orders(id),
            line_no INTEGER NOT NULL,
            item_no TEXT NOT NULL,
            description TEXT,
            manufacturer TEXT,
            quantity TEXT NOT NULL,
            price TEXT NOT NULL,
            row_total TEXT NOT NULL,
            row_status TEXT,
            remaining_open_quantity TEXT NOT NULL,
            pending_amount TEXT NOT NULL,
            PRIMARY KEY (order_id, line_no)
        )",
        [],
    )?;

    // ==========================================================================
    // Customer finance summary
    // `phone_number` is maintained locally and never written by sync.
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS customers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            customer_code TEXT UNIQUE NOT NULL,
            customer_name TEXT,
            salesman_name TEXT,
            salesman_id INTEGER REFERENCES salesmen(id),
            credit_limit TEXT NOT NULL,
            credit_days TEXT NOT NULL,
            month_pending_1 TEXT NOT NULL,
            month_pending_2 TEXT NOT NULL,
            month_pending_3 TEXT NOT NULL,
            month_pending_4 TEXT NOT NULL,
            month_pending_5 TEXT NOT NULL,
            month_pending_6 TEXT NOT NULL,
            old_months_pending TEXT NOT NULL,
            total_outstanding TEXT NOT NULL,
            pdc_received TEXT NOT NULL,
            total_outstanding_with_pdc TEXT NOT NULL,
            phone_number TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // AR invoices and credit memos (same shape, separate tables)
    // ==========================================================================
    for (header, items) in [
        ("ar_invoices", "ar_invoice_items"),
        ("ar_credit_memos", "ar_credit_memo_items"),
    ] {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {header} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    document_number TEXT UNIQUE NOT NULL,
                    internal_number TEXT,
                    posting_date TEXT,
                    doc_due_date TEXT,
                    customer_code TEXT,
                    customer_name TEXT,
                    vat_number TEXT,
                    salesman_name TEXT,
                    salesman_id INTEGER REFERENCES salesmen(id),
                    store TEXT NOT NULL,
                    bp_reference_no TEXT,
                    doc_total TEXT NOT NULL,
                    vat_sum TEXT NOT NULL,
                    total_gross_profit TEXT NOT NULL,
                    discount_percent TEXT NOT NULL,
                    document_status TEXT,
                    cancel_status TEXT,
                    comments TEXT,
                    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
                )"
            ),
            [],
        )?;

        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {items} (
                    document_id INTEGER NOT NULL REFERENCES {header}(id),
                    line_no INTEGER NOT NULL,
                    item_code TEXT NOT NULL,
                    item_description TEXT,
                    quantity TEXT NOT NULL,
                    price TEXT NOT NULL,
                    line_total TEXT NOT NULL,
                    gross_profit TEXT NOT NULL,
                    tax_total TEXT NOT NULL,
                    PRIMARY KEY (document_id, line_no)
                )"
            ),
            [],
        )?;
    }

    // ==========================================================================
    // Contact cards
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS contact_cards (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT UNIQUE NOT NULL,
            name TEXT NOT NULL,
            phone TEXT NOT NULL,
            designation TEXT NOT NULL,
            department TEXT NOT NULL,
            company_name TEXT NOT NULL,
            photo_filename TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Sync events (audit trail, one row per pass)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS sync_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    for sql in [
        "CREATE INDEX IF NOT EXISTS idx_sales_orders_status ON sales_orders(status)",
        "CREATE INDEX IF NOT EXISTS idx_sales_orders_salesman ON sales_orders(salesman_name)",
        "CREATE INDEX IF NOT EXISTS idx_quotations_status ON quotations(status)",
        "CREATE INDEX IF NOT EXISTS idx_customers_salesman ON customers(salesman_id)",
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON sync_events(entity_type, entity_id)",
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON sync_events(timestamp)",
    ] {
        conn.execute(sql, [])?;
    }

    Ok(())
}

/// Add `column` to `table` when an older store lacks it.
fn ensure_column(conn: &Connection, table: &str, column: &str, definition: &str) -> Result<()> {
    let exists = conn
        .prepare(&format!("SELECT 1 FROM pragma_table_info('{table}') WHERE name = ?1"))?
        .exists(params![column])?;
    if !exists {
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"), [])?;
        tracing::info!(table, column, "added missing column");
    }
    Ok(())
}

// ============================================================================
// VALUE HELPERS
// ============================================================================

/// Money and quantities are stored as TEXT so they round-trip exactly.
pub fn decimal_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = row.get(idx)?;
    Decimal::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub fn date_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        NaiveDate::parse_from_str(&t, "%Y-%m-%d")
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub fn date_text(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

// ============================================================================
// BULK HELPERS (used by the reconciler inside its transaction)
// ============================================================================

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// natural key → row id for every key that already exists.
/// `table` and `key_column` come from entity definitions, never from input.
pub fn fetch_key_index(
    conn: &Connection,
    table: &str,
    key_column: &str,
    keys: &[&str],
) -> rusqlite::Result<HashMap<String, i64>> {
    let mut index = HashMap::with_capacity(keys.len());

    for chunk in keys.chunks(KEY_CHUNK) {
        let sql = format!(
            "SELECT {key_column}, id FROM {table} WHERE {key_column} IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (key, id) = row?;
            index.insert(key, id);
        }
    }

    Ok(index)
}

/// Delete every child row whose parent id is in `parent_ids`.
pub fn delete_by_parent(
    conn: &Connection,
    table: &str,
    parent_column: &str,
    parent_ids: &[i64],
) -> rusqlite::Result<usize> {
    let mut deleted = 0;
    for chunk in parent_ids.chunks(KEY_CHUNK) {
        let sql = format!(
            "DELETE FROM {table} WHERE {parent_column} IN ({})",
            placeholders(chunk.len())
        );
        deleted += conn.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    Ok(deleted)
}

/// `UPDATE {table} SET {assignments} WHERE {id_column} IN (...)`, one
/// statement per chunk of ids. `assignments` comes from entity code.
pub fn update_by_ids(
    conn: &Connection,
    table: &str,
    assignments: &str,
    id_column: &str,
    ids: &[i64],
) -> rusqlite::Result<usize> {
    let mut updated = 0;
    for chunk in ids.chunks(KEY_CHUNK) {
        let sql = format!(
            "UPDATE {table} SET {assignments} WHERE {id_column} IN ({})",
            placeholders(chunk.len())
        );
        updated += conn.execute(&sql, params_from_iter(chunk.iter()))?;
    }
    Ok(updated)
}

/// (row id, natural key) for every stored row matching `filter`
/// (an SQL condition from entity code, or "1" for all rows).
pub fn fetch_ids_where(
    conn: &Connection,
    table: &str,
    key_column: &str,
    filter: &str,
) -> rusqlite::Result<Vec<(i64, String)>> {
    let sql = format!("SELECT id, {key_column} FROM {table} WHERE {filter}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_or_create_salesman(conn: &Connection, name: &str) -> rusqlite::Result<i64> {
    conn.prepare_cached("INSERT OR IGNORE INTO salesmen (name) VALUES (?1)")?
        .execute(params![name])?;
    conn.prepare_cached("SELECT id FROM salesmen WHERE name = ?1")?
        .query_row(params![name], |row| row.get(0))
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<i64> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count)
}

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Event for audit trail
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO sync_events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let timestamp_str: String = row.get(1)?;
    let data_json: String = row.get(5)?;

    Ok(Event {
        event_id: row.get(0)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?
            .with_timezone(&Utc),
        event_type: row.get(2)?,
        entity_type: row.get(3)?,
        entity_id: row.get(4)?,
        data: serde_json::from_str(&data_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        actor: row.get(6)?,
    })
}

/// Events for one run (entity_id) of one feed (entity_type)
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM sync_events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

pub fn recent_events(conn: &Connection, limit: usize) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM sync_events
         ORDER BY id DESC
         LIMIT ?1",
    )?;

    let events = stmt
        .query_map(params![limit as i64], event_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// QUERIES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SalesOrderSummary {
    pub so_number: String,
    pub posting_date: Option<NaiveDate>,
    pub customer_code: Option<String>,
    pub customer_name: Option<String>,
    pub salesman_name: Option<String>,
    pub status: Option<String>,
    pub document_total: Decimal,
    pub pending_amount: Decimal,
    pub line_count: i64,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SalesOrderLine {
    pub line_no: i64,
    pub item_no: String,
    pub description: Option<String>,
    pub quantity: Decimal,
    pub price: Decimal,
    pub row_total: Decimal,
    pub row_status: Option<String>,
    pub remaining_open_quantity: Decimal,
    pub pending_amount: Decimal,
}

/// Sales orders the viewer may see, newest first.
pub fn list_sales_orders(conn: &Connection, scope: &ScopeFilter) -> Result<Vec<SalesOrderSummary>> {
    let mut stmt = conn.prepare(
        "SELECT so_number, posting_date, customer_code, customer_name, salesman_name,
                status, document_total, remarks, id
         FROM sales_orders
         ORDER BY posting_date DESC, so_number DESC",
    )?;
    let mut pending_stmt = conn.prepare(
        "SELECT pending_amount FROM sales_order_items WHERE order_id = ?1",
    )?;

    let orders = stmt
        .query_map([], |row| {
            Ok((
                SalesOrderSummary {
                    so_number: row.get(0)?,
                    posting_date: date_at(row, 1)?,
                    customer_code: row.get(2)?,
                    customer_name: row.get(3)?,
                    salesman_name: row.get(4)?,
                    status: row.get(5)?,
                    document_total: decimal_at(row, 6)?,
                    pending_amount: Decimal::ZERO,
                    line_count: 0,
                    remarks: row.get(7)?,
                },
                row.get::<_, i64>(8)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut visible = Vec::new();
    for (mut order, id) in orders {
        if !scope.allows(order.salesman_name.as_deref().unwrap_or("")) {
            continue;
        }
        let pending = pending_stmt
            .query_map(params![id], |row| decimal_at(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;
        order.line_count = pending.len() as i64;
        order.pending_amount = checked_total(pending)
            .with_context(|| format!("pending amount of {} overflows", order.so_number))?;
        visible.push(order);
    }

    Ok(visible)
}

pub fn get_sales_order_lines(conn: &Connection, so_number: &str) -> Result<Vec<SalesOrderLine>> {
    let mut stmt = conn.prepare(
        "SELECT i.line_no, i.item_no, i.description, i.quantity, i.price, i.row_total,
                i.row_status, i.remaining_open_quantity, i.pending_amount
         FROM sales_order_items i
         JOIN sales_orders o ON o.id = i.order_id
         WHERE o.so_number = ?1
         ORDER BY i.line_no",
    )?;

    let lines = stmt
        .query_map(params![so_number], |row| {
            Ok(SalesOrderLine {
                line_no: row.get(0)?,
                item_no: row.get(1)?,
                description: row.get(2)?,
                quantity: decimal_at(row, 3)?,
                price: decimal_at(row, 4)?,
                row_total: decimal_at(row, 5)?,
                row_status: row.get(6)?,
                remaining_open_quantity: decimal_at(row, 7)?,
                pending_amount: decimal_at(row, 8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(lines)
}

/// Local annotation that sync never overwrites. Returns false for unknown orders.
pub fn set_sales_order_remarks(conn: &Connection, so_number: &str, remarks: &str) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE sales_orders SET remarks = ?1 WHERE so_number = ?2",
        params![remarks, so_number],
    )?;
    Ok(changed > 0)
}

/// Sum that reports overflow instead of panicking.
fn checked_total<I: IntoIterator<Item = Decimal>>(values: I) -> Option<Decimal> {
    values
        .into_iter()
        .try_fold(Decimal::ZERO, |acc, value| acc.checked_add(value))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SalesmanOutstanding {
    pub salesman: String,
    pub customers: i64,
    pub total_outstanding: Decimal,
    pub pdc_received: Decimal,
    pub total_outstanding_with_pdc: Decimal,
}

/// Outstanding totals per canonical salesman. Customers with no salesman
/// link are left out. The scope applies to the ERP name on each customer,
/// the same names user scopes list.
pub fn outstanding_by_salesman(
    conn: &Connection,
    scope: &ScopeFilter,
) -> Result<Vec<SalesmanOutstanding>> {
    let mut stmt = conn.prepare(
        "SELECT s.name, c.salesman_name,
                c.total_outstanding, c.pdc_received, c.total_outstanding_with_pdc
         FROM customers c
         JOIN salesmen s ON s.id = c.salesman_id
         ORDER BY s.name",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                decimal_at(row, 2)?,
                decimal_at(row, 3)?,
                decimal_at(row, 4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut totals: Vec<SalesmanOutstanding> = Vec::new();
    for (salesman, erp_name, outstanding, pdc, with_pdc) in rows {
        if !scope.allows(erp_name.as_deref().unwrap_or("")) {
            continue;
        }
        match totals.last_mut() {
            Some(last) if last.salesman == salesman => {
                let sums = (
                    last.total_outstanding.checked_add(outstanding),
                    last.pdc_received.checked_add(pdc),
                    last.total_outstanding_with_pdc.checked_add(with_pdc),
                );
                let (Some(total), Some(pdc_total), Some(with_pdc_total)) = sums else {
                    anyhow::bail!("outstanding total for {} overflows", salesman);
                };
                last.customers += 1;
                last.total_outstanding = total;
                last.pdc_received = pdc_total;
                last.total_outstanding_with_pdc = with_pdc_total;
            }
            _ => totals.push(SalesmanOutstanding {
                salesman,
                customers: 1,
                total_outstanding: outstanding,
                pdc_received: pdc,
                total_outstanding_with_pdc: with_pdc,
            }),
        }
    }

    Ok(totals)
}

/// Explicit maintenance delete. Ordinary sync never removes entities.
pub fn purge_sales_orders(conn: &mut Connection, so_numbers: &[String]) -> Result<usize> {
    let tx = conn.transaction()?;
    let keys: Vec<&str> = so_numbers.iter().map(String::as_str).collect();
    let index = fetch_key_index(&tx, "sales_orders", "so_number", &keys)?;
    let ids: Vec<i64> = index.values().copied().collect();

    delete_by_parent(&tx, "sales_order_items", "order_id", &ids)?;
    let purged = delete_by_parent(&tx, "sales_orders", "id", &ids)?;
    tx.commit()?;

    tracing::info!(requested = so_numbers.len(), purged, "purged sales orders");
    Ok(purged)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn insert_order(conn: &Connection, so_number: &str, salesman: &str, status: &str) -> i64 {
        conn.execute(
            "INSERT INTO sales_orders (so_number, salesman_name, discount_percentage, document_total, status, posting_date)
             VALUES (?1, ?2, '0.00', '100.00', ?3, '2024-03-05')",
            params![so_number, salesman, status],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    fn insert_item(conn: &Connection, order_id: i64, line_no: i64, pending: &str) {
        conn.execute(
            "INSERT INTO sales_order_items (order_id, line_no, item_no, quantity, price, row_total, remaining_open_quantity, pending_amount)
             VALUES (?1, ?2, 'X', '1.000', '1.00', '1.00', '1.000', ?3)",
            params![order_id, line_no, pending],
        )
        .unwrap();
    }

    #[test]
    fn test_setup_is_repeatable() {
        let conn = test_db();
        setup_database(&conn).unwrap();
        assert_eq!(count_rows(&conn, "sales_orders").unwrap(), 0);
    }

    #[test]
    fn test_get_or_create_salesman_is_stable() {
        let conn = test_db();
        let first = get_or_create_salesman(&conn, "RAFIQ").unwrap();
        let again = get_or_create_salesman(&conn, "RAFIQ").unwrap();
        let other = get_or_create_salesman(&conn, "SIYAB").unwrap();

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(count_rows(&conn, "salesmen").unwrap(), 2);
    }

    #[test]
    fn test_fetch_key_index_only_returns_existing_keys() {
        let conn = test_db();
        let id = insert_order(&conn, "SO1", "A.MR.RAFIQ", "O");

        let index = fetch_key_index(&conn, "sales_orders", "so_number", &["SO1", "SO2"]).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index["SO1"], id);

        let empty = fetch_key_index(&conn, "sales_orders", "so_number", &[]).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_fetch_key_index_spans_chunks() {
        let conn = test_db();
        let keys: Vec<String> = (0..1200).map(|i| format!("SO{}", i)).collect();
        for key in &keys {
            insert_order(&conn, key, "", "O");
        }

        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let index = fetch_key_index(&conn, "sales_orders", "so_number", &refs).unwrap();
        assert_eq!(index.len(), 1200);
    }

    #[test]
    fn test_event_log() {
        let conn = test_db();
        let event = Event::new(
            "pass_completed",
            "sales_orders",
            "run-1",
            serde_json::json!({"created": 3}),
            "test",
        );
        insert_event(&conn, &event).unwrap();

        let events = get_events_for_entity(&conn, "sales_orders", "run-1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "pass_completed");
        assert_eq!(events[0].data["created"], 3);

        assert_eq!(recent_events(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_list_sales_orders_respects_scope() {
        let conn = test_db();
        let a = insert_order(&conn, "SO1", "A.MR.RAFIQ", "O");
        insert_item(&conn, a, 1, "10.00");
        insert_item(&conn, a, 2, "5.50");
        insert_order(&conn, "SO2", "A.MR.SIYAB", "O");

        let all = list_sales_orders(&conn, &ScopeFilter::All).unwrap();
        assert_eq!(all.len(), 2);

        let rafiq = list_sales_orders(
            &conn,
            &ScopeFilter::Names(vec!["a.mr.rafiq".to_string()]),
        )
        .unwrap();
        assert_eq!(rafiq.len(), 1);
        assert_eq!(rafiq[0].so_number, "SO1");
        assert_eq!(rafiq[0].line_count, 2);
        assert_eq!(rafiq[0].pending_amount, Decimal::new(1550, 2));

        assert!(list_sales_orders(&conn, &ScopeFilter::Nothing).unwrap().is_empty());
    }

    #[test]
    fn test_purge_removes_children_first() {
        let mut conn = test_db();
        let a = insert_order(&conn, "SO1", "", "O");
        insert_item(&conn, a, 1, "1.00");
        insert_order(&conn, "SO2", "", "O");

        let purged = purge_sales_orders(&mut conn, &["SO1".to_string(), "SO9".to_string()]).unwrap();
        assert_eq!(purged, 1);
        assert_eq!(count_rows(&conn, "sales_orders").unwrap(), 1);
        assert_eq!(count_rows(&conn, "sales_order_items").unwrap(), 0);
    }

    #[test]
    fn test_outstanding_excludes_unattributed_customers() {
        let conn = test_db();
        let rafiq = get_or_create_salesman(&conn, "RAFIQ").unwrap();
        for (code, salesman, outstanding) in [
            ("C1", Some(rafiq), "100.00"),
            ("C2", Some(rafiq), "50.25"),
            ("C3", None, "999.00"),
        ] {
            conn.execute(
                "INSERT INTO customers (customer_code, salesman_id, credit_limit, credit_days,
                    month_pending_1, month_pending_2, month_pending_3, month_pending_4,
                    month_pending_5, month_pending_6, old_months_pending,
                    total_outstanding, pdc_received, total_outstanding_with_pdc)
                 VALUES (?1, ?2, '0', '0', '0', '0', '0', '0', '0', '0', '0', ?3, '0.00', ?3)",
                params![code, salesman, outstanding],
            )
            .unwrap();
        }

        let totals = outstanding_by_salesman(&conn, &ScopeFilter::All).unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].salesman, "RAFIQ");
        assert_eq!(totals[0].customers, 2);
        assert_eq!(totals[0].total_outstanding, Decimal::new(15025, 2));
    }
    #[test]
    fn test_outstanding_scope_uses_erp_salesman_name() {
        let conn = test_db();
        // Mapping folded the ERP name onto a different canonical one
        let canonical = get_or_create_salesman(&conn, "RAFIQ").unwrap();
        conn.execute(
            "INSERT INTO customers (customer_code, salesman_name, salesman_id, credit_limit, credit_days,
                month_pending_1, month_pending_2, month_pending_3, month_pending_4,
                month_pending_5, month_pending_6, old_months_pending,
                total_outstanding, pdc_received, total_outstanding_with_pdc)
             VALUES ('C1', 'A.MR.RAFIQ', ?1, '0', '0', '0', '0', '0', '0', '0', '0', '0', '70.00', '5.00', '75.00')",
            params![canonical],
        )
        .unwrap();

        let scoped = ScopeFilter::Names(vec!["A.MR.RAFIQ".to_string()]);
        let totals = outstanding_by_salesman(&conn, &scoped).unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].salesman, "RAFIQ");
        assert_eq!(totals[0].total_outstanding_with_pdc, Decimal::new(7500, 2));

        let canonical_only = ScopeFilter::Names(vec!["RAFIQ".to_string()]);
        assert!(outstanding_by_salesman(&conn, &canonical_only).unwrap().is_empty());
    }

    #[test]
    fn test_pending_total_overflow_is_an_error() {
        let conn = test_db();
        let a = insert_order(&conn, "SO1", "", "O");
        insert_item(&conn, a, 1, "70000000000000000000000000000");
        insert_item(&conn, a, 2, "70000000000000000000000000000");

        let err = list_sales_orders(&conn, &ScopeFilter::All).unwrap_err();
        assert!(format!("{:#}", err).contains("SO1"));
    }

    #[test]
    fn test_update_by_ids_spans_chunks() {
        let conn = test_db();
        let ids: Vec<i64> = (0..1100)
            .map(|i| insert_order(&conn, &format!("SO{}", i), "", "O"))
            .collect();

        let updated = update_by_ids(&conn, "sales_orders", "status = 'C'", "id", &ids[..1050]).unwrap();
        assert_eq!(updated, 1050);

        let open: i64 = conn
            .query_row("SELECT COUNT(*) FROM sales_orders WHERE status = 'O'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(open, 50);
        assert_eq!(update_by_ids(&conn, "sales_orders", "status = 'C'", "id", &[]).unwrap(), 0);
    }

    #[test]
    fn test_ensure_column_upgrades_old_store() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE sales_orders (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                so_number TEXT UNIQUE NOT NULL,
                salesman_name TEXT,
                discount_percentage TEXT NOT NULL,
                document_total TEXT NOT NULL,
                status TEXT
            )",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO sales_orders (so_number, discount_percentage, document_total) VALUES ('SO1', '0', '1')",
            [],
        )
        .unwrap();

        setup_database(&conn).unwrap();

        let (vat, pi): (String, i64) = conn
            .query_row("SELECT vat_sum, is_sap_pi FROM sales_orders WHERE so_number = 'SO1'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(vat, "0.00");
        assert_eq!(pi, 0);
    }
}
