// Sales Sync - Core Library
// ERP feeds (files or HTTP) → normalized rows → idempotent upserts in SQLite.
// Shared by the CLI, the receive server, and tests.

pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod mapping;
pub mod orchestrator;
pub mod reader;
pub mod reconciler;
pub mod remote;
pub mod schema;

// Re-export commonly used types
pub use config::{RemoteConfig, SyncConfig};
pub use db::{
    Event, SalesOrderLine, SalesOrderSummary, SalesmanOutstanding,
    open_database, setup_database, insert_event, get_events_for_entity, recent_events,
    list_sales_orders, get_sales_order_lines, set_sales_order_remarks,
    outstanding_by_salesman, purge_sales_orders, count_rows,
};
pub use entities::{
    ArDocuments, ContactCards, CustomerFinance, Entity, PurchaseOrders, Quotations, SalesOrders,
};
pub use error::{RowError, RowErrorKind, SyncError, SyncResult};
pub use mapping::{MappingRule, NameMatch, SalesScope, SalesmanMapper, ScopeFilter};
pub use orchestrator::{run_single, FatalError, Orchestrator, PassReport, SyncPass, SyncReport};
pub use reader::{ApiSource, CsvSource, FeedKind, MemorySource, RawRow, RowSource};
pub use reconciler::{PassOptions, PassOutcome, Reconciler};
pub use remote::{sync_passes, FeedClient, FetchScope, FetchWindow, HttpFeedClient, RemoteSource};
pub use schema::{FeedSchema, NormalizedRow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
