// ⚖️ Reconciler - idempotent upsert + wholesale child replacement
//
// For one batch of one entity, inside one IMMEDIATE transaction:
//   1. group rows by natural key (last header wins, every row adds its child)
//   2. one keyed fetch of the existing index
//   3. bulk insert new keys, bulk update existing keys (explicit columns)
//   4. delete every child of every touched entity, insert the fresh set
//   5. optionally close open entities missing from a full snapshot, or
//      delete every stored entity the snapshot does not list
// Any store failure rolls the whole pass back.

use crate::db;
use crate::entities::{ChildWrite, Entity, ExistingHeader, NewHeader};
use crate::error::{RowError, SyncResult};
use crate::mapping::SalesmanMapper;
use crate::schema::{batch_digest, NormalizedRow};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

// ============================================================================
// OPTIONS / OUTCOME
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassOptions {
    /// The batch is the complete set of open entities; open entities not in
    /// it get closed.
    #[serde(default)]
    pub close_missing_open: bool,
    /// The batch is the complete set of entities; stored entities not in it
    /// are deleted along with their children.
    #[serde(default)]
    pub replace_all: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PassOutcome {
    /// Distinct natural keys in the batch
    pub entities: usize,
    pub created: usize,
    pub updated: usize,
    pub children_written: usize,
    pub closed: usize,
    /// Deleted by replace-all
    pub removed: usize,
    /// SHA-256 of the normalized batch
    pub digest: String,
    /// Rows whose header or child could not be built
    pub errors: Vec<RowError>,
}

struct KeyGroup<H, C> {
    key: String,
    header: H,
    children: Vec<C>,
}

// ============================================================================
// RECONCILER
// ============================================================================

pub struct Reconciler<'a> {
    mapper: &'a SalesmanMapper,
}

impl<'a> Reconciler<'a> {
    pub fn new(mapper: &'a SalesmanMapper) -> Self {
        Reconciler { mapper }
    }

    /// Rows whose header cannot be built are dropped whole; their keys are
    /// still returned as seen so a snapshot pass does not close or delete
    /// the stored entity because of one bad row.
    fn group<'r, E: Entity>(
        &self,
        entity: &E,
        rows: &'r [NormalizedRow],
        errors: &mut Vec<RowError>,
    ) -> (Vec<KeyGroup<E::Header, E::Child>>, Vec<&'r str>) {
        let mut groups: Vec<KeyGroup<E::Header, E::Child>> = Vec::new();
        let mut positions: HashMap<&str, usize> = HashMap::new();
        let mut rejected: Vec<&str> = Vec::new();

        for row in rows {
            let header = match entity.header(row, self.mapper) {
                Ok(header) => header,
                Err(message) => {
                    errors.push(
                        RowError::parse(row.line_number, None, message)
                            .with_key(Some(row.key.clone())),
                    );
                    rejected.push(row.key.as_str());
                    continue;
                }
            };
            let idx = match positions.get(row.key.as_str()) {
                Some(&idx) => {
                    groups[idx].header = header;
                    idx
                }
                None => {
                    positions.insert(row.key.as_str(), groups.len());
                    groups.push(KeyGroup {
                        key: row.key.clone(),
                        header,
                        children: Vec::new(),
                    });
                    groups.len() - 1
                }
            };

            match entity.child(row) {
                Ok(Some(child)) => groups[idx].children.push(child),
                Ok(None) => {}
                Err(message) => errors.push(RowError::child(row.line_number, &row.key, message)),
            }
        }

        (groups, rejected)
    }

    pub fn reconcile<E: Entity>(
        &self,
        conn: &mut Connection,
        entity: &E,
        rows: &[NormalizedRow],
        options: &PassOptions,
    ) -> SyncResult<PassOutcome> {
        let mut outcome = PassOutcome {
            digest: batch_digest(rows),
            ..PassOutcome::default()
        };

        let (groups, rejected) = self.group(entity, rows, &mut outcome.errors);
        outcome.entities = groups.len();

        // An empty batch writes nothing, and in particular closes nothing.
        if groups.is_empty() {
            tracing::info!(feed = %entity.feed(), "empty batch, nothing to reconcile");
            return Ok(outcome);
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
        let existing = db::fetch_key_index(&tx, entity.table(), entity.key_column(), &keys)?;

        let mut salesman_ids: HashMap<&str, i64> = HashMap::new();
        for group in &groups {
            if let Some(name) = entity.salesman(&group.header) {
                if !salesman_ids.contains_key(name) {
                    salesman_ids.insert(name, db::get_or_create_salesman(&tx, name)?);
                }
            }
        }
        let salesman_id =
            |header: &E::Header| entity.salesman(header).and_then(|n| salesman_ids.get(n).copied());

        let mut to_create: Vec<NewHeader<'_, E::Header>> = Vec::new();
        let mut to_update: Vec<ExistingHeader<'_, E::Header>> = Vec::new();
        for group in &groups {
            let sid = salesman_id(&group.header);
            match existing.get(&group.key) {
                Some(&id) => to_update.push((id, &group.header, sid)),
                None => to_create.push((group.key.as_str(), &group.header, sid)),
            }
        }

        outcome.created = entity.insert_headers(&tx, &to_create)?;
        outcome.updated = entity.update_headers(&tx, &to_update)?;

        if let Some((child_table, parent_column)) = entity.child_table() {
            let index = db::fetch_key_index(&tx, entity.table(), entity.key_column(), &keys)?;
            let parent_ids: Vec<i64> = groups
                .iter()
                .filter_map(|g| index.get(&g.key).copied())
                .collect();
            db::delete_by_parent(&tx, child_table, parent_column, &parent_ids)?;

            let writes: Vec<ChildWrite<'_, E::Child>> = groups
                .iter()
                .filter_map(|g| index.get(&g.key).map(|&id| (id, g)))
                .flat_map(|(parent_id, g)| {
                    g.children.iter().enumerate().map(move |(i, child)| ChildWrite {
                        parent_id,
                        line_no: i as i64 + 1,
                        child,
                    })
                })
                .collect();
            outcome.children_written = entity.insert_children(&tx, &writes)?;
        }

        let seen: HashSet<&str> = keys.iter().chain(rejected.iter()).copied().collect();
        if options.close_missing_open {
            outcome.closed = entity.close_missing(&tx, &seen)?;
        }
        if options.replace_all {
            outcome.removed = Self::remove_unseen(&tx, entity, &seen)?;
        }

        tx.commit()?;

        tracing::info!(
            feed = %entity.feed(),
            entities = outcome.entities,
            created = outcome.created,
            updated = outcome.updated,
            children = outcome.children_written,
            closed = outcome.closed,
            removed = outcome.removed,
            "reconciled batch"
        );

        Ok(outcome)
    }

    /// Delete stored entities (children first) whose key is not in `seen`.
    fn remove_unseen<E: Entity>(
        conn: &Connection,
        entity: &E,
        seen: &HashSet<&str>,
    ) -> rusqlite::Result<usize> {
        let stale: Vec<i64> = db::fetch_ids_where(conn, entity.table(), entity.key_column(), "1")?
            .into_iter()
            .filter(|(_, key)| !seen.contains(key.as_str()))
            .map(|(id, _)| id)
            .collect();

        if let Some((child_table, parent_column)) = entity.child_table() {
            db::delete_by_parent(conn, child_table, parent_column, &stale)?;
        }
        db::delete_by_parent(conn, entity.table(), "id", &stale)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_rows, get_sales_order_lines, set_sales_order_remarks, setup_database};
    use crate::entities::{ContactCards, CustomerFinance, PurchaseOrders, SalesOrders};
    use crate::error::{RowErrorKind, SyncError};
    use crate::reader::RawRow;
    use rust_decimal::Decimal;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn so_row(line: usize, doc: &str, item: &str, qty: &str) -> NormalizedRow {
        let raw = RawRow::new(line)
            .with("Document Number", doc)
            .with("Customer/Supplier No.", "HO-001")
            .with("Customer/Supplier Name", "Acme Trading")
            .with("Sales Employee Name", "A.MR.RAFIQ")
            .with("Item No.", item)
            .with("Quantity", qty)
            .with("Price", "10")
            .with("Document Total", "100")
            .with("Status", "O");
        SalesOrders.schema().normalize(&raw).unwrap()
    }

    /// Every column of every row, as text, in a stable order.
    fn snapshot(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM {} ORDER BY 1, 2", table))
            .unwrap();
        let columns = stmt.column_count();
        stmt.query_map([], |row| {
            let mut cells = Vec::new();
            for i in 0..columns {
                cells.push(format!("{:?}", row.get_ref(i)?));
            }
            Ok(cells.join("|"))
        })
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
    }

    #[test]
    fn test_duplicate_key_one_entity_two_children() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let rows = vec![so_row(2, "SO1", "X1", "10"), so_row(3, "SO1", "X2", "abc")];

        let outcome = Reconciler::new(&mapper)
            .reconcile(&mut conn, &SalesOrders, &rows, &PassOptions::default())
            .unwrap();

        assert_eq!(outcome.entities, 1);
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.children_written, 2);
        assert_eq!(count_rows(&conn, "sales_orders").unwrap(), 1);

        let lines = get_sales_order_lines(&conn, "SO1").unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].line_no, 1);
        assert_eq!(lines[0].quantity, Decimal::from(10));
        assert_eq!(lines[1].line_no, 2);
        assert_eq!(lines[1].quantity, Decimal::ZERO);
    }

    #[test]
    fn test_same_batch_twice_leaves_identical_state() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let rows = vec![
            so_row(2, "SO1", "X1", "1"),
            so_row(3, "SO1", "X2", "2"),
            so_row(4, "SO2", "Y1", "3"),
        ];
        let reconciler = Reconciler::new(&mapper);

        reconciler
            .reconcile(&mut conn, &SalesOrders, &rows, &PassOptions::default())
            .unwrap();
        let orders = snapshot(&conn, "sales_orders");
        let items = snapshot(&conn, "sales_order_items");
        let salesmen = snapshot(&conn, "salesmen");

        let second = reconciler
            .reconcile(&mut conn, &SalesOrders, &rows, &PassOptions::default())
            .unwrap();

        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(snapshot(&conn, "sales_orders"), orders);
        assert_eq!(snapshot(&conn, "sales_order_items"), items);
        assert_eq!(snapshot(&conn, "salesmen"), salesmen);
    }

    #[test]
    fn test_upsert_touches_only_keys_in_batch() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let reconciler = Reconciler::new(&mapper);

        let first = vec![
            so_row(2, "SO1", "X1", "1"),
            so_row(3, "SO1", "X2", "1"),
            so_row(4, "SO1", "X3", "1"),
            so_row(5, "SO2", "Y1", "1"),
            so_row(6, "SO2", "Y2", "1"),
        ];
        reconciler
            .reconcile(&mut conn, &SalesOrders, &first, &PassOptions::default())
            .unwrap();

        let second = vec![so_row(2, "SO1", "Z9", "5"), so_row(3, "SO3", "W1", "1")];
        let outcome = reconciler
            .reconcile(&mut conn, &SalesOrders, &second, &PassOptions::default())
            .unwrap();

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.updated, 1);

        let so1 = get_sales_order_lines(&conn, "SO1").unwrap();
        assert_eq!(so1.len(), 1);
        assert_eq!(so1[0].item_no, "Z9");
        assert_eq!(get_sales_order_lines(&conn, "SO2").unwrap().len(), 2);
        assert_eq!(get_sales_order_lines(&conn, "SO3").unwrap().len(), 1);
        assert_eq!(count_rows(&conn, "sales_orders").unwrap(), 3);
    }

    #[test]
    fn test_last_row_wins_for_header_fields() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let raw = RawRow::new(3)
            .with("Document Number", "SO1")
            .with("Customer/Supplier Name", "Acme Renamed")
            .with("Item No.", "X2")
            .with("Status", "C");
        let late = SalesOrders.schema().normalize(&raw).unwrap();

        Reconciler::new(&mapper)
            .reconcile(
                &mut conn,
                &SalesOrders,
                &[so_row(2, "SO1", "X1", "1"), late],
                &PassOptions::default(),
            )
            .unwrap();

        let (name, status): (String, String) = conn
            .query_row(
                "SELECT customer_name, status FROM sales_orders WHERE so_number = 'SO1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(name, "Acme Renamed");
        assert_eq!(status, "C");
    }

    #[test]
    fn test_unlisted_columns_survive_resync() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let rows = vec![so_row(2, "SO1", "X1", "1")];
        let reconciler = Reconciler::new(&mapper);

        reconciler
            .reconcile(&mut conn, &SalesOrders, &rows, &PassOptions::default())
            .unwrap();
        assert!(set_sales_order_remarks(&conn, "SO1", "call before delivery").unwrap());

        reconciler
            .reconcile(&mut conn, &SalesOrders, &rows, &PassOptions::default())
            .unwrap();

        let remarks: String = conn
            .query_row("SELECT remarks FROM sales_orders WHERE so_number = 'SO1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(remarks, "call before delivery");
    }

    #[test]
    fn test_bad_child_keeps_parent() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let rows = vec![so_row(2, "SO1", "X1", "1"), so_row(3, "SO1", "", "4")];

        let outcome = Reconciler::new(&mapper)
            .reconcile(&mut conn, &SalesOrders, &rows, &PassOptions::default())
            .unwrap();

        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.children_written, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].line, 3);
        assert_eq!(outcome.errors[0].kind, RowErrorKind::Child);
        assert_eq!(outcome.errors[0].key.as_deref(), Some("SO1"));
    }

    #[test]
    fn test_salesman_attribution_and_skip() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let unknown = RawRow::new(3)
            .with("Document Number", "SO2")
            .with("Sales Employee Name", "Z.UNKNOWN");
        let rows = vec![
            so_row(2, "SO1", "X1", "1"),
            SalesOrders.schema().normalize(&unknown).unwrap(),
        ];

        Reconciler::new(&mapper)
            .reconcile(&mut conn, &SalesOrders, &rows, &PassOptions::default())
            .unwrap();

        let linked: Option<String> = conn
            .query_row(
                "SELECT s.name FROM sales_orders o LEFT JOIN salesmen s ON s.id = o.salesman_id
                 WHERE o.so_number = 'SO1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let unlinked: Option<i64> = conn
            .query_row("SELECT salesman_id FROM sales_orders WHERE so_number = 'SO2'", [], |row| {
                row.get(0)
            })
            .unwrap();

        assert_eq!(linked.as_deref(), Some("RAFIQ"));
        assert_eq!(unlinked, None);
        assert_eq!(count_rows(&conn, "salesmen").unwrap(), 1);
    }

    #[test]
    fn test_close_missing_open_orders() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let reconciler = Reconciler::new(&mapper);

        reconciler
            .reconcile(
                &mut conn,
                &SalesOrders,
                &[so_row(2, "SO1", "X1", "2"), so_row(3, "SO2", "Y1", "2")],
                &PassOptions::default(),
            )
            .unwrap();
        conn.execute(
            "UPDATE sales_order_items SET remaining_open_quantity = '2.000', pending_amount = '20.00'",
            [],
        )
        .unwrap();

        let outcome = reconciler
            .reconcile(
                &mut conn,
                &SalesOrders,
                &[so_row(2, "SO1", "X1", "2")],
                &PassOptions {
                    close_missing_open: true,
                    ..PassOptions::default()
                },
            )
            .unwrap();
        assert_eq!(outcome.closed, 1);

        let status: String = conn
            .query_row("SELECT status FROM sales_orders WHERE so_number = 'SO2'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(status, "C");

        let so2 = get_sales_order_lines(&conn, "SO2").unwrap();
        assert_eq!(so2[0].row_status.as_deref(), Some("C"));
        assert_eq!(so2[0].pending_amount, Decimal::ZERO);
    }

    #[test]
    fn test_empty_batch_closes_nothing() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let reconciler = Reconciler::new(&mapper);
        reconciler
            .reconcile(&mut conn, &SalesOrders, &[so_row(2, "SO1", "X1", "1")], &PassOptions::default())
            .unwrap();

        let outcome = reconciler
            .reconcile(
                &mut conn,
                &SalesOrders,
                &[],
                &PassOptions {
                    close_missing_open: true,
                    ..PassOptions::default()
                },
            )
            .unwrap();
        assert_eq!(outcome.closed, 0);
        assert_eq!(outcome.entities, 0);
    }

    #[test]
    fn test_store_failure_rolls_back_whole_pass() {
        let mut conn = test_db();
        conn.execute("DROP TABLE sales_order_items", []).unwrap();
        let mapper = SalesmanMapper::with_defaults();

        let result = Reconciler::new(&mapper).reconcile(
            &mut conn,
            &SalesOrders,
            &[so_row(2, "SO1", "X1", "1")],
            &PassOptions::default(),
        );

        assert!(matches!(result, Err(SyncError::Structural(_))));
        assert_eq!(count_rows(&conn, "sales_orders").unwrap(), 0);
        assert_eq!(count_rows(&conn, "salesmen").unwrap(), 0);
    }

    #[test]
    fn test_entity_without_children() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let raw = RawRow::new(2)
            .with("email", "ana@x.com")
            .with("name", "Ana")
            .with("phone", "555")
            .with("designation", "Rep")
            .with("department", "Sales");
        let rows = vec![ContactCards.schema().normalize(&raw).unwrap()];

        let outcome = Reconciler::new(&mapper)
            .reconcile(&mut conn, &ContactCards, &rows, &PassOptions::default())
            .unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.children_written, 0);

        let company: String = conn
            .query_row("SELECT company_name FROM contact_cards", [], |row| row.get(0))
            .unwrap();
        assert_eq!(company, "Company Name");
    }

    fn po_row(line: usize, doc: &str, item: &str) -> NormalizedRow {
        let raw = RawRow::new(line)
            .with("Document Number", doc)
            .with("Customer/Supplier No.", "V-1")
            .with("Item No.", item)
            .with("Quantity", "1")
            .with("Price", "3")
            .with("Status", "O");
        PurchaseOrders.schema().normalize(&raw).unwrap()
    }

    #[test]
    fn test_replace_all_deletes_unlisted_entities_and_children() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::default();
        let reconciler = Reconciler::new(&mapper);
        let replace = PassOptions {
            replace_all: true,
            ..PassOptions::default()
        };

        reconciler
            .reconcile(
                &mut conn,
                &PurchaseOrders,
                &[po_row(2, "PO1", "A"), po_row(3, "PO2", "B"), po_row(4, "PO2", "C")],
                &replace,
            )
            .unwrap();
        assert_eq!(count_rows(&conn, "purchase_order_items").unwrap(), 3);

        let outcome = reconciler
            .reconcile(&mut conn, &PurchaseOrders, &[po_row(2, "PO1", "A")], &replace)
            .unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(outcome.updated, 1);
        assert_eq!(count_rows(&conn, "purchase_orders").unwrap(), 1);
        assert_eq!(count_rows(&conn, "purchase_order_items").unwrap(), 1);

        // An empty snapshot is not a reason to wipe the table
        let empty = reconciler
            .reconcile(&mut conn, &PurchaseOrders, &[], &replace)
            .unwrap();
        assert_eq!(empty.removed, 0);
        assert_eq!(count_rows(&conn, "purchase_orders").unwrap(), 1);
    }

    #[test]
    fn test_rejected_header_skips_row_without_closing_it() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let reconciler = Reconciler::new(&mapper);

        let finance = |line: usize, code: &str, balance: &str| {
            let raw = RawRow::new(line)
                .with("CardCode", code)
                .with("BalanceDue", balance)
                .with("ChecksBal", balance);
            CustomerFinance.schema().normalize(&raw).unwrap()
        };
        let huge = "50000000000000000000000000000";

        let outcome = reconciler
            .reconcile(
                &mut conn,
                &CustomerFinance,
                &[finance(2, "HO-1", "10"), finance(3, "HO-2", huge)],
                &PassOptions::default(),
            )
            .unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.entities, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].line, 3);
        assert_eq!(outcome.errors[0].kind, RowErrorKind::Parse);
        assert_eq!(outcome.errors[0].key.as_deref(), Some("HO-2"));

        // The stored HO-2 survives a replace-all pass whose HO-2 row is bad
        reconciler
            .reconcile(&mut conn, &CustomerFinance, &[finance(2, "HO-2", "5")], &PassOptions::default())
            .unwrap();
        let outcome = reconciler
            .reconcile(
                &mut conn,
                &CustomerFinance,
                &[finance(2, "HO-1", "10"), finance(3, "HO-2", huge)],
                &PassOptions {
                    replace_all: true,
                    ..PassOptions::default()
                },
            )
            .unwrap();
        assert_eq!(outcome.removed, 0);
        assert_eq!(count_rows(&conn, "customers").unwrap(), 2);
    }
}
