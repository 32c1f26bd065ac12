// 🔄 sales-sync CLI - import files, pull the ERP, inspect the store

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sales_sync::{
    list_sales_orders, open_database, outstanding_by_salesman, purge_sales_orders, recent_events,
    sync_passes, CsvSource, FeedClient, FeedKind, FetchScope, FetchWindow, HttpFeedClient,
    Orchestrator, SyncConfig, SyncPass, SyncReport,
};

/// Invoices and credit memos can only be searched by date; a DocNum lookup
/// scans this many days back.
const DOC_NUM_LOOKBACK_DAYS: u32 = 30;

#[derive(Parser, Debug)]
#[command(name = "sales-sync")]
#[command(about = "Sync ERP sales data into a local SQLite store", version)]
struct Cli {
    /// JSON config file (defaults apply when omitted)
    #[arg(long, global = true, env = "SALES_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Database path, overrides the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print reports as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import one CSV file into one feed
    Import {
        /// sales-orders, quotations, purchase-orders, ar-invoices,
        /// ar-credit-memos, finance-summary, contact-cards
        feed: FeedKind,
        file: PathBuf,
        /// The file is the complete list of open orders
        #[arg(long)]
        close_missing_open: bool,
        /// The file is the complete list; stored entries it lacks are deleted
        #[arg(long)]
        replace_all: bool,
    },
    /// Pull every feed from the ERP once
    Sync {
        #[arg(long, conflicts_with_all = ["date", "doc_num"])]
        days_back: Option<u32>,
        /// Only documents dated on this day (YYYY-MM-DD)
        #[arg(long, conflicts_with = "doc_num")]
        date: Option<NaiveDate>,
        /// Only this document number
        #[arg(long)]
        doc_num: Option<String>,
        /// Limit the run to these feeds
        #[arg(long, value_delimiter = ',')]
        only: Vec<FeedKind>,
    },
    /// Pull every feed on a fixed interval until killed
    Watch {
        #[arg(long)]
        interval_minutes: Option<u64>,
        #[arg(long)]
        days_back: Option<u32>,
    },
    /// Delete sales orders (and their lines) by number
    Purge {
        #[arg(required = true)]
        so_numbers: Vec<String>,
    },
    /// Sales orders and outstanding totals visible to a user
    Report {
        #[arg(long, default_value = "")]
        user: String,
        #[arg(long)]
        admin: bool,
    },
    /// Most recent sync events
    Events {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sales_sync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::load(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }

    match cli.command {
        Command::Import {
            feed,
            file,
            close_missing_open,
            replace_all,
        } => run_import(&config, feed, file, close_missing_open, replace_all, cli.json),
        Command::Sync {
            days_back,
            date,
            doc_num,
            only,
        } => {
            let scope = fetch_scope(&config, days_back, date, doc_num);
            let report = run_sync(&config, scope, &only)?;
            print_report(&report, cli.json)?;
            if !report.fatal_errors.is_empty() {
                std::process::exit(2);
            }
            Ok(())
        }
        Command::Watch {
            interval_minutes,
            days_back,
        } => run_watch(&config, interval_minutes, days_back, cli.json),
        Command::Purge { so_numbers } => run_purge(&config, &so_numbers),
        Command::Report { user, admin } => run_report(&config, &user, admin, cli.json),
        Command::Events { limit } => run_events(&config, limit, cli.json),
    }
}

fn open_store(config: &SyncConfig) -> Result<Connection> {
    open_database(&config.database_path)
        .with_context(|| format!("Failed to open database {:?}", config.database_path))
}

// ============================================================================
// IMPORT
// ============================================================================

fn run_import(
    config: &SyncConfig,
    feed: FeedKind,
    file: PathBuf,
    close_missing_open: bool,
    replace_all: bool,
    json: bool,
) -> Result<()> {
    if !json {
        println!("📥 Import: {} ← {}", feed.name(), file.display());
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        println!("\n🔧 Opening database {:?}...", config.database_path);
    }

    let mut conn = open_store(config)?;
    let mapper = config.mapper();

    let name = feed.code().to_string();
    let mut pass = SyncPass::new(name, Box::new(CsvSource::from_path(feed, &file)));
    if close_missing_open {
        pass = pass.closing_missing_open();
    }
    if replace_all {
        pass = pass.replacing_all();
    }

    let report = Orchestrator::new(&mut conn, &mapper).run(vec![pass]);
    print_report(&report, json)?;

    if !report.fatal_errors.is_empty() {
        std::process::exit(2);
    }
    Ok(())
}

// ============================================================================
// SYNC / WATCH
// ============================================================================

fn fetch_scope(
    config: &SyncConfig,
    days_back: Option<u32>,
    date: Option<NaiveDate>,
    doc_num: Option<String>,
) -> FetchScope {
    let today = Local::now().date_naive();
    match (date, doc_num) {
        (_, Some(doc_num)) => FetchScope::Document {
            doc_num,
            lookback: FetchWindow::last_days(today, DOC_NUM_LOOKBACK_DAYS),
        },
        (Some(day), None) => FetchScope::Day(day),
        (None, None) => {
            let days = days_back.unwrap_or(config.remote.days_back);
            FetchScope::Recent(FetchWindow::last_days(today, days))
        }
    }
}

fn run_sync(config: &SyncConfig, scope: FetchScope, only: &[FeedKind]) -> Result<SyncReport> {
    let client: Arc<dyn FeedClient> = Arc::new(HttpFeedClient::new(&config.remote)?);
    tracing::info!(scope = %scope, "starting ERP sync");

    let passes: Vec<SyncPass> = sync_passes(client, scope)
        .into_iter()
        .filter(|pass| only.is_empty() || only.contains(&pass.source.feed()))
        .collect();

    let mut conn = open_store(config)?;
    let mapper = config.mapper();
    Ok(Orchestrator::new(&mut conn, &mapper).run(passes))
}

fn run_watch(
    config: &SyncConfig,
    interval_minutes: Option<u64>,
    days_back: Option<u32>,
    json: bool,
) -> Result<()> {
    let interval = interval_minutes.unwrap_or(config.interval_minutes).max(1);
    println!("⏱️  Watching ERP feeds every {} minutes (Ctrl+C to stop)", interval);

    loop {
        // A broken run must not end the loop; the next tick retries.
        let scope = fetch_scope(config, days_back, None, None);
        match run_sync(config, scope, &[]) {
            Ok(report) => print_report(&report, json)?,
            Err(e) => tracing::error!("sync run could not start: {:#}", e),
        }
        std::thread::sleep(Duration::from_secs(interval * 60));
    }
}

fn print_report(report: &SyncReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("\n📊 Sync run {}", report.run_id);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{}", report.summary());

    let errors = report.all_errors();
    if !errors.is_empty() {
        println!("\n⚠️  {} problem(s):", errors.len());
        for line in errors.iter().take(50) {
            println!("   {}", line);
        }
        if errors.len() > 50 {
            println!("   ... and {} more", errors.len() - 50);
        }
    }

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    if report.is_clean() {
        println!("✅ All passes clean");
    } else if report.fatal_errors.is_empty() {
        println!("✓ Completed with row errors");
    } else {
        println!("❌ {} pass(es) failed", report.fatal_errors.len());
    }
    Ok(())
}

// ============================================================================
// MAINTENANCE / QUERIES
// ============================================================================

fn run_purge(config: &SyncConfig, so_numbers: &[String]) -> Result<()> {
    let mut conn = open_store(config)?;
    let deleted = purge_sales_orders(&mut conn, so_numbers)?;
    println!("🗑️  Deleted {} of {} sales orders", deleted, so_numbers.len());
    Ok(())
}

fn run_report(config: &SyncConfig, user: &str, admin: bool, json: bool) -> Result<()> {
    let conn = open_store(config)?;
    let filter = config.scope().filter_for(user, admin);

    let orders = list_sales_orders(&conn, &filter)?;
    let outstanding = outstanding_by_salesman(&conn, &filter)?;

    if json {
        let body = serde_json::json!({ "sales_orders": orders, "outstanding": outstanding });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("🧾 Sales orders ({})", orders.len());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for o in &orders {
        println!(
            "{:<12} {:<10} {:<28} {:<14} {:>12} {:>12} {:>3}",
            o.so_number,
            o.posting_date.map(|d| d.to_string()).unwrap_or_default(),
            o.customer_name.as_deref().unwrap_or(""),
            o.salesman_name.as_deref().unwrap_or(""),
            o.document_total,
            o.pending_amount,
            o.status.as_deref().unwrap_or(""),
        );
    }

    println!("\n💳 Outstanding by salesman");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for s in &outstanding {
        println!(
            "{:<16} customers {:>4}  outstanding {:>14}  with PDC {:>14}",
            s.salesman, s.customers, s.total_outstanding, s.total_outstanding_with_pdc
        );
    }
    Ok(())
}

fn run_events(config: &SyncConfig, limit: usize, json: bool) -> Result<()> {
    let conn = open_store(config)?;
    let events = recent_events(&conn, limit)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
        return Ok(());
    }

    for e in &events {
        println!(
            "{}  {:<15} {:<16} {}",
            e.timestamp.format("%Y-%m-%d %H:%M:%S"),
            e.event_type,
            e.entity_type,
            e.data
        );
    }
    Ok(())
}
