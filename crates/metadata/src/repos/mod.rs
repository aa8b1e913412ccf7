//! Repository traits for metadata operations.

pub mod cache_entries;
pub mod storage_locations;
pub mod uploads;

pub use cache_entries::CacheEntryRepo;
pub use storage_locations::StorageLocationRepo;
pub use uploads::UploadRepo;

/// Escape `%`, `_` and the escape character itself so a user-supplied prefix
/// is matched literally by `LIKE ... ESCAPE '\'`.
pub fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 1);
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// `LIKE` pattern matching every string that starts with `prefix`.
pub fn prefix_pattern(prefix: &str) -> String {
    format!("{}%", escape_like(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("cargo-deps"), "cargo-deps");
        assert_eq!(escape_like("100%_done\\"), "100\\%\\_done\\\\");
        assert_eq!(prefix_pattern("node_modules"), "node\\_modules%");
    }
}
