//! Duplicate-key detection for handler failures.
//!
//! Handlers usually perform create-if-absent writes keyed by natural
//! identity, so a unique-constraint violation on redelivery means the side
//! effect already happened. Backends word this differently; each family gets
//! its own marker.

use crate::error::HandlerError;

const SQLITE_UNIQUE: &str = "UNIQUE constraint failed";
const MYSQL_DUPLICATE: &str = "Integrity constraint violation: 1062";
const MYSQL_DUPLICATE_ENTRY: &str = "Duplicate entry";
const POSTGRES_UNIQUE: &str = "duplicate key value violates unique constraint";

const SQLSTATE_INTEGRITY: &str = "23000";
const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

pub fn is_duplicate_violation(err: &HandlerError) -> bool {
    if err.is_already_applied() {
        return true;
    }

    let msg = err.message.as_str();
    if msg.contains(SQLITE_UNIQUE) || msg.contains(POSTGRES_UNIQUE) {
        return true;
    }
    if msg.contains(MYSQL_DUPLICATE) || (msg.contains("1062") && msg.contains(MYSQL_DUPLICATE_ENTRY)) {
        return true;
    }

    match err.code.as_deref() {
        Some(SQLSTATE_UNIQUE_VIOLATION) => true,
        Some(SQLSTATE_INTEGRITY) => msg.to_ascii_lowercase().contains("duplicate"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(message: &str) -> HandlerError {
        HandlerError::new("QueryError", message)
    }

    #[test]
    fn backend_messages() {
        assert!(is_duplicate_violation(&err(
            "UNIQUE constraint failed: contacts.email"
        )));
        assert!(is_duplicate_violation(&err(
            "SQLSTATE[23000]: Integrity constraint violation: 1062 Duplicate entry 'a' for key 'email'"
        )));
        assert!(is_duplicate_violation(&err(
            "duplicate key value violates unique constraint \"contacts_email_key\""
        )));
    }

    #[test]
    fn sqlstate_codes() {
        assert!(is_duplicate_violation(&err("insert failed").with_code("23505")));
        assert!(is_duplicate_violation(&err("Duplicate row").with_code("23000")));
        assert!(!is_duplicate_violation(&err("foreign key mismatch").with_code("23000")));
    }

    #[test]
    fn typed_outcome() {
        assert!(is_duplicate_violation(&HandlerError::already_applied("contact exists")));
    }

    #[test]
    fn generic_failures_are_not_duplicates() {
        assert!(!is_duplicate_violation(&err("boom")));
        assert!(!is_duplicate_violation(&err("connection reset").with_code("08006")));
    }
}
