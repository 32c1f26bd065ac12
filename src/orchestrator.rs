// 🔁 Sync Orchestrator - run passes in order, never give up on the run
//
// A pass = one source read, normalized, and reconciled into one entity.
// Fatal errors (schema, remote, store) end that pass only; they land in
// `fatal_errors` and the next pass runs. `run` always returns a report.

use crate::db::{insert_event, Event};
use crate::entities::{
    ArDocuments, ContactCards, CustomerFinance, Entity, PurchaseOrders, Quotations, SalesOrders,
};
use crate::error::{RowError, SyncResult};
use crate::mapping::SalesmanMapper;
use crate::reader::{FeedKind, RowSource};
use crate::reconciler::{PassOptions, Reconciler};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use uuid::Uuid;

// ============================================================================
// PASSES
// ============================================================================

pub struct SyncPass {
    pub name: String,
    pub source: Box<dyn RowSource>,
    pub options: PassOptions,
}

impl SyncPass {
    pub fn new(name: impl Into<String>, source: Box<dyn RowSource>) -> Self {
        SyncPass {
            name: name.into(),
            source,
            options: PassOptions::default(),
        }
    }

    /// The source is a complete open-entity snapshot.
    pub fn closing_missing_open(mut self) -> Self {
        self.options.close_missing_open = true;
        self
    }

    /// The source is the complete set; everything else stored is deleted.
    pub fn replacing_all(mut self) -> Self {
        self.options.replace_all = true;
        self
    }
}

// ============================================================================
// REPORTS
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub name: String,
    pub feed: FeedKind,
    pub source: String,
    pub rows_read: usize,
    pub entities: usize,
    pub created: usize,
    pub updated: usize,
    pub children_written: usize,
    pub closed: usize,
    pub removed: usize,
    pub digest: String,
    pub errors: Vec<RowError>,
}

/// A pass that ended without reconciling. `kind` is the `SyncError` code.
#[derive(Debug, Clone, Serialize)]
pub struct FatalError {
    pub pass: String,
    pub kind: &'static str,
    pub message: String,
}

impl std::fmt::Display for FatalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed ({}): {}", self.pass, self.kind, self.message)
    }
}

impl std::error::Error for FatalError {}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub passes: Vec<PassReport>,
    pub fatal_errors: Vec<FatalError>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.fatal_errors.is_empty() && self.passes.iter().all(|p| p.errors.is_empty())
    }

    /// Every row error and fatal error as "pass: message" lines.
    pub fn all_errors(&self) -> Vec<String> {
        let rows = self
            .passes
            .iter()
            .flat_map(|p| p.errors.iter().map(move |e| format!("{}: {}", p.name, e)));
        let fatal = self
            .fatal_errors
            .iter()
            .map(|f| format!("{}: [{}] {}", f.pass, f.kind, f.message));
        rows.chain(fatal).collect()
    }

    pub fn pass(&self, name: &str) -> Option<&PassReport> {
        self.passes.iter().find(|p| p.name == name)
    }

    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for p in &self.passes {
            lines.push(format!(
                "{:<16} created {:>5}  updated {:>5}  lines {:>6}  closed {:>4}  removed {:>4}  errors {:>4}",
                p.name,
                p.created,
                p.updated,
                p.children_written,
                p.closed,
                p.removed,
                p.errors.len()
            ));
        }
        for f in &self.fatal_errors {
            lines.push(format!("{:<16} FAILED ({}): {}", f.pass, f.kind, f.message));
        }
        lines.join("\n")
    }
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct Orchestrator<'a> {
    conn: &'a mut Connection,
    mapper: &'a SalesmanMapper,
    actor: String,
}

impl<'a> Orchestrator<'a> {
    pub fn new(conn: &'a mut Connection, mapper: &'a SalesmanMapper) -> Self {
        Orchestrator {
            conn,
            mapper,
            actor: "sales-sync".to_string(),
        }
    }

    /// Name recorded on audit events
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn run(&mut self, passes: Vec<SyncPass>) -> SyncReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut reports = Vec::new();
        let mut fatal_errors = Vec::new();

        tracing::info!(run_id = %run_id, passes = passes.len(), "sync run started");

        for pass in passes {
            match self.run_audited(run_id, pass) {
                Ok(report) => reports.push(report),
                Err(fatal) => fatal_errors.push(fatal),
            }
        }

        let report = SyncReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            passes: reports,
            fatal_errors,
        };

        tracing::info!(
            run_id = %run_id,
            passes = report.passes.len(),
            failed = report.fatal_errors.len(),
            "sync run finished"
        );
        report
    }

    /// One pass as its own run; a fatal error comes back with its kind.
    pub fn run_one(&mut self, pass: SyncPass) -> Result<PassReport, FatalError> {
        self.run_audited(Uuid::new_v4(), pass)
    }

    fn run_audited(&mut self, run_id: Uuid, pass: SyncPass) -> Result<PassReport, FatalError> {
        let name = pass.name.clone();
        let feed = pass.source.feed();

        match self.run_pass(pass) {
            Ok(report) => {
                for err in &report.errors {
                    tracing::warn!(pass = %name, "{}", err);
                }
                self.audit(run_id, feed, "pass_completed", serde_json::json!({
                    "pass": name,
                    "created": report.created,
                    "updated": report.updated,
                    "children_written": report.children_written,
                    "closed": report.closed,
                    "removed": report.removed,
                    "row_errors": report.errors.len(),
                    "digest": report.digest,
                }));
                Ok(report)
            }
            Err(err) => {
                tracing::error!(pass = %name, kind = err.code(), "pass failed: {}", err);
                self.audit(run_id, feed, "pass_failed", serde_json::json!({
                    "pass": name,
                    "kind": err.code(),
                    "message": err.to_string(),
                }));
                Err(FatalError {
                    pass: name,
                    kind: err.code(),
                    message: err.to_string(),
                })
            }
        }
    }

    fn run_pass(&mut self, pass: SyncPass) -> SyncResult<PassReport> {
        match pass.source.feed() {
            FeedKind::SalesOrders => self.reconcile_with(&SalesOrders, pass),
            FeedKind::Quotations => self.reconcile_with(&Quotations, pass),
            FeedKind::PurchaseOrders => self.reconcile_with(&PurchaseOrders, pass),
            FeedKind::ArInvoices => self.reconcile_with(&ArDocuments::invoices(), pass),
            FeedKind::ArCreditMemos => self.reconcile_with(&ArDocuments::credit_memos(), pass),
            FeedKind::FinanceSummary => self.reconcile_with(&CustomerFinance, pass),
            FeedKind::ContactCards => self.reconcile_with(&ContactCards, pass),
        }
    }

    fn reconcile_with<E: Entity>(&mut self, entity: &E, pass: SyncPass) -> SyncResult<PassReport> {
        let SyncPass {
            name,
            source,
            options,
        } = pass;
        let feed = source.feed();
        let origin = source.describe();
        let schema = entity.schema();

        tracing::info!(pass = %name, feed = %feed, source = %origin, "pass started");

        let mut rows = Vec::new();
        let mut errors = Vec::new();
        let mut rows_read = 0;
        for item in source.open(&schema)? {
            rows_read += 1;
            match item {
                Ok(raw) => match schema.normalize(&raw) {
                    Ok(row) => rows.push(row),
                    Err(row_errors) => errors.extend(row_errors),
                },
                Err(err) => errors.push(err),
            }
        }

        let outcome = Reconciler::new(self.mapper).reconcile(self.conn, entity, &rows, &options)?;
        errors.extend(outcome.errors);

        Ok(PassReport {
            name,
            feed,
            source: origin,
            rows_read,
            entities: outcome.entities,
            created: outcome.created,
            updated: outcome.updated,
            children_written: outcome.children_written,
            closed: outcome.closed,
            removed: outcome.removed,
            digest: outcome.digest,
            errors,
        })
    }

    /// Audit is best effort; a failed insert is logged, not fatal.
    fn audit(&mut self, run_id: Uuid, feed: FeedKind, event_type: &str, data: serde_json::Value) {
        let event = Event::new(event_type, feed.code(), &run_id.to_string(), data, &self.actor);
        if let Err(e) = insert_event(self.conn, &event) {
            tracing::warn!(event_type, "could not record sync event: {}", e);
        }
    }
}

/// Convenience for callers that only need one pass.
pub fn run_single(
    conn: &mut Connection,
    mapper: &SalesmanMapper,
    pass: SyncPass,
) -> Result<PassReport, FatalError> {
    Orchestrator::new(conn, mapper).run_one(pass)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_rows, get_events_for_entity, setup_database};
    use crate::error::RowErrorKind;
    use crate::reader::{ApiSource, CsvSource, MemorySource, RawRow};
    use serde_json::json;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn contacts_csv(body: &str) -> Box<dyn RowSource> {
        let data = format!("Name,Phone,Email,Designation,Department\n{}", body);
        Box::new(CsvSource::from_bytes(FeedKind::ContactCards, data))
    }

    fn order_row(doc: &str, price: &str, remaining: &str) -> RawRow {
        RawRow::new(2)
            .with("Document Number", doc)
            .with("Document Internal ID", "1")
            .with("Posting Date", "05.03.24")
            .with("Customer/Supplier No.", "HO-1")
            .with("Customer/Supplier Name", "Acme")
            .with("Sales Employee Name", "A.MR.RAFIQ")
            .with("Manufacturer Name", "")
            .with("BP Reference No.", "")
            .with("Item No.", "X1")
            .with("Item/Service Description", "Widget")
            .with("Quantity", "1")
            .with("Price", price)
            .with("Remaining Open Quantity", remaining)
            .with("Row Total", "1")
            .with("Document Total", "1")
            .with("Status", "O")
            .with("Bill To", "")
    }

    fn order_rows() -> Box<dyn RowSource> {
        let row = order_row("SO1", "1", "1");
        Box::new(MemorySource::new(FeedKind::SalesOrders, vec![row]))
    }

    fn finance_records() -> Box<dyn RowSource> {
        Box::new(ApiSource::new(
            FeedKind::FinanceSummary,
            vec![json!({
                "CardCode": "HO-1",
                "CardName": "Acme",
                "Sales Employee": "A.MR.SIYAB",
                "BalanceDue": 120.5,
                "ChecksBal": 20
            })],
        ))
    }

    #[test]
    fn test_required_field_rejection_with_row_number() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let source = contacts_csv(
            "Ana,555,ana@x.com,Rep,Sales\n\
             Ben,556,,Rep,Sales\n\
             Cy,557,cy@x.com,Rep,Sales\n",
        );

        let report = Orchestrator::new(&mut conn, &mapper).run(vec![SyncPass::new("contacts", source)]);

        let pass = report.pass("contacts").unwrap();
        assert_eq!(pass.created, 2);
        assert_eq!(pass.errors.len(), 1);
        assert_eq!(pass.errors[0].line, 3);
        assert_eq!(pass.errors[0].kind, RowErrorKind::MissingField);
        assert_eq!(report.all_errors(), vec!["contacts: Row 3: email is required"]);
        assert_eq!(count_rows(&conn, "contact_cards").unwrap(), 2);
    }

    #[test]
    fn test_structural_failure_does_not_stop_later_passes() {
        let mut conn = test_db();
        conn.execute("DROP TABLE sales_order_items", []).unwrap();
        let mapper = SalesmanMapper::with_defaults();

        let report = Orchestrator::new(&mut conn, &mapper).run(vec![
            SyncPass::new("contacts", contacts_csv("Ana,555,ana@x.com,Rep,Sales\n")),
            SyncPass::new("orders", order_rows()),
            SyncPass::new("finance", finance_records()),
        ]);

        assert_eq!(report.passes.len(), 2);
        assert_eq!(report.pass("contacts").unwrap().created, 1);
        assert_eq!(report.pass("finance").unwrap().created, 1);
        assert_eq!(report.fatal_errors.len(), 1);
        assert_eq!(report.fatal_errors[0].pass, "orders");
        assert_eq!(report.fatal_errors[0].kind, "structural");
        assert!(!report.is_clean());

        assert_eq!(count_rows(&conn, "sales_orders").unwrap(), 0);
        assert_eq!(count_rows(&conn, "customers").unwrap(), 1);
    }

    #[test]
    fn test_schema_error_is_fatal_for_that_pass_only() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let bad = Box::new(CsvSource::from_bytes(FeedKind::ContactCards, "Name,Email\nAna,a@x.com\n"));

        let report = Orchestrator::new(&mut conn, &mapper).run(vec![
            SyncPass::new("bad contacts", bad),
            SyncPass::new("finance", finance_records()),
        ]);

        assert_eq!(report.fatal_errors.len(), 1);
        assert_eq!(report.fatal_errors[0].kind, "schema");
        assert!(report.fatal_errors[0].message.contains("phone, designation, department"));
        assert_eq!(report.pass("finance").unwrap().created, 1);
        assert_eq!(count_rows(&conn, "contact_cards").unwrap(), 0);
    }

    #[test]
    fn test_each_pass_is_audited() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();

        let report = Orchestrator::new(&mut conn, &mapper)
            .with_actor("test")
            .run(vec![SyncPass::new("finance", finance_records())]);
        assert!(report.is_clean());

        let events =
            get_events_for_entity(&conn, "finance_summary", &report.run_id.to_string()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "pass_completed");
        assert_eq!(events[0].actor, "test");
        assert_eq!(events[0].data["created"], 1);
    }

    #[test]
    fn test_run_single_returns_pass_report() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();

        let pass = run_single(&mut conn, &mapper, SyncPass::new("orders", order_rows())).unwrap();
        assert_eq!(pass.created, 1);
        assert_eq!(pass.children_written, 1);
        assert_eq!(pass.rows_read, 1);
    }

    #[test]
    fn test_run_single_keeps_fatal_kind() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let bad = Box::new(CsvSource::from_bytes(FeedKind::ContactCards, "Name,Email\nAna,a@x.com\n"));

        let fatal = run_single(&mut conn, &mapper, SyncPass::new("contacts", bad)).unwrap_err();
        assert_eq!(fatal.kind, "schema");
        assert_eq!(fatal.pass, "contacts");
        assert!(fatal.to_string().starts_with("contacts failed (schema)"));

        let missing = Box::new(CsvSource::from_path(FeedKind::ContactCards, "/nonexistent/c.csv"));
        let fatal = Orchestrator::new(&mut conn, &mapper)
            .run_one(SyncPass::new("contacts", missing))
            .unwrap_err();
        assert_eq!(fatal.kind, "source");
    }

    #[test]
    fn test_oversized_amounts_become_row_errors() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let huge = "100000000000000000000";
        let huge_line = order_row("SO9", huge, huge);
        let orders = Box::new(MemorySource::new(FeedKind::SalesOrders, vec![huge_line]));
        let finance = Box::new(ApiSource::new(
            FeedKind::FinanceSummary,
            vec![
                json!({"CardCode": "HO-8", "CardName": "Big", "Sales Employee": "",
                       "BalanceDue": "5e28", "ChecksBal": "5e28"}),
                json!({"CardCode": "HO-9", "CardName": "Small", "Sales Employee": "",
                       "BalanceDue": 10, "ChecksBal": 1}),
            ],
        ));

        let report = Orchestrator::new(&mut conn, &mapper).run(vec![
            SyncPass::new("orders", orders),
            SyncPass::new("finance", finance),
        ]);

        assert!(report.fatal_errors.is_empty());
        let orders = report.pass("orders").unwrap();
        assert_eq!(orders.created, 1);
        assert_eq!(orders.children_written, 0);
        assert_eq!(orders.errors[0].kind, RowErrorKind::Child);

        let finance = report.pass("finance").unwrap();
        assert_eq!(finance.created, 1);
        assert_eq!(finance.errors.len(), 1);
        assert_eq!(finance.errors[0].key.as_deref(), Some("HO-8"));
    }

    #[test]
    fn test_replacing_pass_reports_removed() {
        let mut conn = test_db();
        let mapper = SalesmanMapper::with_defaults();
        let po = |doc: &str| {
            json!({"DocNum": doc, "CardCode": "V-1", "DocumentStatus": "bost_Open",
                   "DocumentLines": [{"ItemCode": "P1", "Quantity": 1, "Price": 2}]})
        };

        let first = ApiSource::new(FeedKind::PurchaseOrders, vec![po("PO1"), po("PO2")]);
        Orchestrator::new(&mut conn, &mapper)
            .run_one(SyncPass::new("purchase orders", Box::new(first)).replacing_all())
            .unwrap();

        let second = ApiSource::new(FeedKind::PurchaseOrders, vec![po("PO2")]);
        let report = Orchestrator::new(&mut conn, &mapper)
            .run(vec![SyncPass::new("purchase orders", Box::new(second)).replacing_all()]);

        let pass = report.pass("purchase orders").unwrap();
        assert_eq!(pass.removed, 1);
        assert!(report.summary().contains("removed    1"));
        assert_eq!(count_rows(&conn, "purchase_orders").unwrap(), 1);
        assert_eq!(count_rows(&conn, "purchase_order_items").unwrap(), 1);
    }
}
