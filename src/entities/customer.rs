// 💳 Customer Finance Entity - card code → aging buckets and outstanding
//
// ERP aging columns count backwards from today ("1" is the oldest full
// month, "6" the current one), so bucket "6" lands in month_pending_1.

use super::{attribute, Entity, ExistingHeader, NewHeader};
use crate::mapping::SalesmanMapper;
use crate::reader::FeedKind;
use crate::schema::{FeedSchema, FieldSpec, NormalizedRow};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;

const CREDIT_DAYS_MAX: usize = 30;

pub fn schema() -> FeedSchema {
    FeedSchema::new(
        FeedKind::FinanceSummary,
        "cardcode",
        vec![
            FieldSpec::text("cardcode"),
            FieldSpec::text("cardname"),
            FieldSpec::text("sales employee"),
            FieldSpec::money("balancedue"),
            FieldSpec::money("creditlimit").optional(),
            FieldSpec::text("creditdays").optional(),
            FieldSpec::money("1").optional(),
            FieldSpec::money("2").optional(),
            FieldSpec::money("3").optional(),
            FieldSpec::money("4").optional(),
            FieldSpec::money("5").optional(),
            FieldSpec::money("6").optional(),
            FieldSpec::money("6+").optional(),
            FieldSpec::money("checksbal").optional(),
        ],
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomerFinanceHeader {
    pub customer_name: String,
    pub salesman_name: Option<String>,
    pub salesman: Option<String>,
    pub credit_limit: Decimal,
    pub credit_days: String,
    /// month_pending_1 ..= month_pending_6
    pub month_pending: [Decimal; 6],
    pub old_months_pending: Decimal,
    pub total_outstanding: Decimal,
    pub pdc_received: Decimal,
    pub total_outstanding_with_pdc: Decimal,
}

/// ERP sends "null", "-Null-" or nothing for "no terms".
pub fn normalize_credit_days(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        None | Some("") => "0".to_string(),
        Some(v) if v.eq_ignore_ascii_case("null") || v.eq_ignore_ascii_case("-null-") => {
            "0".to_string()
        }
        Some(v) => v.chars().take(CREDIT_DAYS_MAX).collect(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CustomerFinance;

impl Entity for CustomerFinance {
    type Header = CustomerFinanceHeader;
    type Child = ();

    fn feed(&self) -> FeedKind {
        FeedKind::FinanceSummary
    }

    fn table(&self) -> &'static str {
        "customers"
    }

    fn key_column(&self) -> &'static str {
        "customer_code"
    }

    fn header(
        &self,
        row: &NormalizedRow,
        mapper: &SalesmanMapper,
    ) -> Result<CustomerFinanceHeader, String> {
        let salesman_name = row.text("sales employee").map(str::to_string);
        let total_outstanding = row.decimal("balancedue");
        let pdc_received = row.decimal("checksbal");
        let total_outstanding_with_pdc = total_outstanding
            .checked_add(pdc_received)
            .ok_or_else(|| "outstanding balance plus PDC overflows".to_string())?;

        Ok(CustomerFinanceHeader {
            customer_name: row.text_or("cardname", ""),
            salesman: attribute(mapper, salesman_name.as_deref()),
            salesman_name,
            credit_limit: row.decimal("creditlimit"),
            credit_days: normalize_credit_days(row.text("creditdays")),
            month_pending: [
                row.decimal("6"),
                row.decimal("5"),
                row.decimal("4"),
                row.decimal("3"),
                row.decimal("2"),
                row.decimal("1"),
            ],
            old_months_pending: row.decimal("6+"),
            total_outstanding,
            pdc_received,
            total_outstanding_with_pdc,
        })
    }

    fn salesman<'h>(&self, header: &'h CustomerFinanceHeader) -> Option<&'h str> {
        header.salesman.as_deref()
    }

    fn insert_headers(
        &self,
        conn: &Connection,
        headers: &[NewHeader<'_, CustomerFinanceHeader>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO customers (
                customer_code, customer_name, salesman_name, salesman_id,
                credit_limit, credit_days,
                month_pending_1, month_pending_2, month_pending_3,
                month_pending_4, month_pending_5, month_pending_6,
                old_months_pending, total_outstanding, pdc_received,
                total_outstanding_with_pdc
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )?;

        for (key, h, salesman_id) in headers {
            let m = h.month_pending.map(|d| d.to_string());
            stmt.execute(params![
                key,
                h.customer_name,
                h.salesman_name,
                salesman_id,
                h.credit_limit.to_string(),
                h.credit_days,
                m[0],
                m[1],
                m[2],
                m[3],
                m[4],
                m[5],
                h.old_months_pending.to_string(),
                h.total_outstanding.to_string(),
                h.pdc_received.to_string(),
                h.total_outstanding_with_pdc.to_string(),
            ])?;
        }
        Ok(headers.len())
    }

    fn update_headers(
        &self,
        conn: &Connection,
        headers: &[ExistingHeader<'_, CustomerFinanceHeader>],
    ) -> rusqlite::Result<usize> {
        // phone_number and created_at are not synced
        let mut stmt = conn.prepare_cached(
            "UPDATE customers SET
                customer_name = ?2, salesman_name = ?3, salesman_id = ?4,
                credit_limit = ?5, credit_days = ?6,
                month_pending_1 = ?7, month_pending_2 = ?8, month_pending_3 = ?9,
                month_pending_4 = ?10, month_pending_5 = ?11, month_pending_6 = ?12,
                old_months_pending = ?13, total_outstanding = ?14, pdc_received = ?15,
                total_outstanding_with_pdc = ?16
             WHERE id = ?1",
        )?;

        for (id, h, salesman_id) in headers {
            let m = h.month_pending.map(|d| d.to_string());
            stmt.execute(params![
                id,
                h.customer_name,
                h.salesman_name,
                salesman_id,
                h.credit_limit.to_string(),
                h.credit_days,
                m[0],
                m[1],
                m[2],
                m[3],
                m[4],
                m[5],
                h.old_months_pending.to_string(),
                h.total_outstanding.to_string(),
                h.pdc_received.to_string(),
                h.total_outstanding_with_pdc.to_string(),
            ])?;
        }
        Ok(headers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RawRow;

    #[test]
    fn test_credit_days_normalization() {
        assert_eq!(normalize_credit_days(None), "0");
        assert_eq!(normalize_credit_days(Some("null")), "0");
        assert_eq!(normalize_credit_days(Some("-Null-")), "0");
        assert_eq!(normalize_credit_days(Some(" 45 ")), "45");
        assert_eq!(normalize_credit_days(Some(&"9".repeat(40))).len(), 30);
    }

    #[test]
    fn test_aging_buckets_are_reversed() {
        let raw = RawRow::new(1)
            .with("CardCode", "HO-1")
            .with("CardName", "Acme")
            .with("Sales Employee", "A.MR.SIYAB")
            .with("1", "1")
            .with("6", "6")
            .with("6+", "99")
            .with("BalanceDue", "1,000.50")
            .with("ChecksBal", "200");
        let row = schema().normalize(&raw).unwrap();

        let header = CustomerFinance.header(&row, &SalesmanMapper::with_defaults()).unwrap();
        assert_eq!(header.month_pending[0], Decimal::from(6));
        assert_eq!(header.month_pending[5], Decimal::from(1));
        assert_eq!(header.old_months_pending, Decimal::from(99));
        assert_eq!(header.total_outstanding_with_pdc.to_string(), "1200.50");
        assert_eq!(header.salesman.as_deref(), Some("SIYAB"));
        assert_eq!(header.credit_days, "0");
    }

    #[test]
    fn test_outstanding_overflow_rejects_row() {
        let raw = RawRow::new(2)
            .with("CardCode", "HO-1")
            .with("BalanceDue", "50000000000000000000000000000")
            .with("ChecksBal", "50000000000000000000000000000");
        let row = schema().normalize(&raw).unwrap();

        let err = CustomerFinance.header(&row, &SalesmanMapper::with_defaults()).unwrap_err();
        assert!(err.contains("overflows"));
    }
}
