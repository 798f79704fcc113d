//! GraphQL documents for the external CRM.
//!
//! Each entity kind has a selection set shared by the single-record query and
//! the paginated connection query.

use fieldsync_core::EntityKind;

/// Records requested per page during backfill.
pub const PAGE_SIZE: u32 = 50;

pub const ACCOUNT_QUERY: &str = "query Account { account { id name } }";

const CLIENT_FIELDS: &str = "id name firstName lastName companyName isCompany isLead isArchived balance \
     emails { address primary } phones { number primary } \
     billingAddress { street city province postalCode country } createdAt updatedAt";

const JOB_FIELDS: &str = "id jobNumber title jobStatus client { id } \
     property { address { street city province postalCode country } } \
     instructions startAt endAt total createdAt updatedAt";

const QUOTE_FIELDS: &str = "id quoteNumber title quoteStatus client { id } \
     amounts { subtotal total depositAmount } message createdAt updatedAt";

const INVOICE_FIELDS: &str = "id invoiceNumber subject invoiceStatus client { id } \
     jobs { nodes { id } } issuedDate dueDate \
     amounts { subtotal total invoiceBalance } createdAt updatedAt";

const VISIT_FIELDS: &str = "id title visitStatus job { id } client { id } startAt endAt completedAt \
     assignedUsers { nodes { id name { full } } } createdAt";

const TIMESHEET_FIELDS: &str = "id user { id name { full } } job { id } visit { id } \
     startAt endAt finalDuration approved note";

/// Root field names and selection set for one entity kind.
#[derive(Debug, Clone, Copy)]
pub struct KindQuery {
    pub single_field: &'static str,
    pub list_field: &'static str,
    pub fields: &'static str,
}

pub fn for_kind(kind: EntityKind) -> KindQuery {
    let (single_field, list_field, fields) = match kind {
        EntityKind::Client => ("client", "clients", CLIENT_FIELDS),
        EntityKind::Job => ("job", "jobs", JOB_FIELDS),
        EntityKind::Quote => ("quote", "quotes", QUOTE_FIELDS),
        EntityKind::Invoice => ("invoice", "invoices", INVOICE_FIELDS),
        EntityKind::Visit => ("visit", "visits", VISIT_FIELDS),
        EntityKind::Timesheet => ("timeSheetEntry", "timeSheetEntries", TIMESHEET_FIELDS),
    };
    KindQuery {
        single_field,
        list_field,
        fields,
    }
}

impl KindQuery {
    pub fn single(&self) -> String {
        format!(
            "query Fetch($id: EncodedId!) {{ {}(id: $id) {{ {} }} }}",
            self.single_field, self.fields
        )
    }

    pub fn list(&self) -> String {
        format!(
            "query List($first: Int!, $after: String) {{ {}(first: $first, after: $after) {{ nodes {{ {} }} pageInfo {{ hasNextPage endCursor }} }} }}",
            self.list_field, self.fields
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_queries() {
        for kind in EntityKind::ALL {
            let q = for_kind(kind);
            assert!(q.single().contains(&format!("{}(id: $id)", q.single_field)));
            assert!(q.list().contains("pageInfo { hasNextPage endCursor }"));
            assert!(q.list().starts_with("query List("));
        }
    }
}
