//! Health-check filtering (§4.8): requests whose normalized query is in a
//! static set are captured only in a debug counter, never surfaced as
//! `RequestRecord`s.

const HEALTH_CHECK_QUERIES: &[&str] = &["SELECT NOW()", "SELECT 1", "SELECT VERSION()", ""];

/// Normalize a query for health-check comparison and dedup keying:
/// trim whitespace, drop a trailing `;`, uppercase.
pub fn normalize(query: &str) -> String {
    query.trim().trim_end_matches(';').trim().to_uppercase()
}

pub fn is_health_check(query: &str) -> bool {
    let normalized = normalize(query);
    HEALTH_CHECK_QUERIES.iter().any(|candidate| normalize(candidate) == normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_known_health_check_queries() {
        assert!(is_health_check("select 1"));
        assert!(is_health_check("SELECT NOW();"));
        assert!(is_health_check(""));
    }

    #[test]
    fn does_not_flag_ordinary_queries() {
        assert!(!is_health_check("SELECT * FROM users"));
    }
}
