//! Directory filter: hides backup objects from normal directory enumeration
//! and lookup. Purely a view transformation — it does not affect the
//! underlying lower enumeration cursor.

/// The exact prefix (5 bytes) that marks a lower-directory entry as a backup
/// object rather than a user-visible file.
pub const BACKUP_PREFIX: &str = ".bkp_";

/// `true` if `name` is a backup object and must be suppressed from
/// enumeration and rejected on direct lookup.
pub fn is_backup_name(name: &str) -> bool {
    name.starts_with(BACKUP_PREFIX)
}

/// Filter a lower directory's entry names, keeping only user-visible ones.
/// The lower enumeration cursor (e.g. a `ReadDir` iterator) still advances
/// over every entry; this only governs what reaches the caller.
pub fn filter_entries<I, S>(entries: I) -> impl Iterator<Item = S>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter(|name| !is_backup_name(name.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_backup_prefix() {
        assert!(is_backup_name(".bkp_file.3"));
        assert!(!is_backup_name("file.3"));
        assert!(!is_backup_name(".bkp"));
    }

    #[test]
    fn filter_entries_suppresses_backups_only() {
        let names = vec!["a", ".bkp_a.1", "b", ".bkp_a.2", "c"];
        let visible: Vec<_> = filter_entries(names).collect();
        assert_eq!(visible, vec!["a", "b", "c"]);
    }
}
