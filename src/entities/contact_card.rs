// 📇 Contact Card Entity - email → employee card details

use super::{Entity, ExistingHeader, NewHeader};
use crate::mapping::SalesmanMapper;
use crate::reader::FeedKind;
use crate::schema::{FeedSchema, FieldSpec, NormalizedRow};
use rusqlite::{params, Connection};

pub const DEFAULT_COMPANY: &str = "Company Name";

pub fn schema() -> FeedSchema {
    FeedSchema::new(
        FeedKind::ContactCards,
        "email",
        vec![
            FieldSpec::text("email"),
            FieldSpec::text("name").required(),
            FieldSpec::text("phone").required(),
            FieldSpec::text("designation").required(),
            FieldSpec::text("department").required(),
            FieldSpec::text("company_name").optional(),
            FieldSpec::text("photo_filename").optional(),
        ],
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContactCard {
    pub name: String,
    pub phone: String,
    pub designation: String,
    pub department: String,
    /// None when the source has no company; new cards get DEFAULT_COMPANY,
    /// existing cards keep what they have.
    pub company_name: Option<String>,
    pub photo_filename: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContactCards;

impl Entity for ContactCards {
    type Header = ContactCard;
    type Child = ();

    fn feed(&self) -> FeedKind {
        FeedKind::ContactCards
    }

    fn table(&self) -> &'static str {
        "contact_cards"
    }

    fn key_column(&self) -> &'static str {
        "email"
    }

    fn header(&self, row: &NormalizedRow, _mapper: &SalesmanMapper) -> Result<ContactCard, String> {
        Ok(ContactCard {
            name: row.text_or("name", ""),
            phone: row.text_or("phone", ""),
            designation: row.text_or("designation", ""),
            department: row.text_or("department", ""),
            company_name: row.text("company_name").map(str::to_string),
            photo_filename: row.text("photo_filename").map(str::to_string),
        })
    }

    fn insert_headers(
        &self,
        conn: &Connection,
        headers: &[NewHeader<'_, ContactCard>],
    ) -> rusqlite::Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO contact_cards (
                email, name, phone, designation, department, company_name, photo_filename
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;

        for (email, card, _) in headers {
            stmt.execute(params![
                email,
                card.name,
                card.phone,
                card.designation,
                card.department,
                card.company_name.as_deref().unwrap_or(DEFAULT_COMPANY),
                card.photo_filename,
            ])?;
        }
        Ok(headers.len())
    }

    fn update_headers(
        &self,
        conn: &Connection,
        headers: &[ExistingHeader<'_, ContactCard>],
    ) -> rusqlite::Result<usize> {
        // A blank photo or company column keeps the value already on file
        let mut stmt = conn.prepare_cached(
            "UPDATE contact_cards SET
                name = ?2, phone = ?3, designation = ?4, department = ?5,
                company_name = COALESCE(?6, company_name),
                photo_filename = COALESCE(?7, photo_filename)
             WHERE id = ?1",
        )?;

        for (id, card, _) in headers {
            stmt.execute(params![
                id,
                card.name,
                card.phone,
                card.designation,
                card.department,
                card.company_name,
                card.photo_filename,
            ])?;
        }
        Ok(headers.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::RawRow;

    fn card(company: Option<&str>) -> ContactCard {
        let mut raw = RawRow::new(2)
            .with("email", "ana@example.com")
            .with("name", "Ana")
            .with("phone", "555")
            .with("designation", "Sales")
            .with("department", "Retail");
        if let Some(company) = company {
            raw = raw.with("company_name", company);
        }
        let row = schema().normalize(&raw).unwrap();
        ContactCards.header(&row, &SalesmanMapper::default()).unwrap()
    }

    fn stored_company(conn: &Connection) -> String {
        conn.query_row("SELECT company_name FROM contact_cards", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_missing_company_keeps_stored_value() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::setup_database(&conn).unwrap();

        let first = card(Some("Acme Trading"));
        ContactCards
            .insert_headers(&conn, &[("ana@example.com", &first, None)])
            .unwrap();
        let id = conn.last_insert_rowid();

        let without_company = card(None);
        assert_eq!(without_company.company_name, None);
        ContactCards
            .update_headers(&conn, &[(id, &without_company, None)])
            .unwrap();
        assert_eq!(stored_company(&conn), "Acme Trading");

        let renamed = card(Some("Acme Group"));
        ContactCards.update_headers(&conn, &[(id, &renamed, None)]).unwrap();
        assert_eq!(stored_company(&conn), "Acme Group");
    }

    #[test]
    fn test_new_card_without_company_gets_default() {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::setup_database(&conn).unwrap();

        ContactCards
            .insert_headers(&conn, &[("ana@example.com", &card(None), None)])
            .unwrap();
        assert_eq!(stored_company(&conn), DEFAULT_COMPANY);
    }
}
