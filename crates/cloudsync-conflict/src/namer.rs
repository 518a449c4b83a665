//! Conflict naming for keep-both resolution
//!
//! Generates sibling names for conflict copies, following the pattern:
//! `name (conflicted copy YYYY-MM-DD).ext`, with ` N` appended inside the
//! parentheses when that name is taken.

use chrono::NaiveDate;

use cloudsync_core::domain::{DomainError, SyncPath};

/// Generates unique conflict file names
pub struct ConflictNamer;

impl ConflictNamer {
    /// Generates a conflict copy filename
    ///
    /// Given "report.docx" on 2024-05-01, produces
    /// "report (conflicted copy 2024-05-01).docx"
    pub fn generate(original_name: &str, date: NaiveDate) -> String {
        Self::format(original_name, date, None)
    }

    /// Generates a name that `exists` reports as free
    ///
    /// Tries the plain name first, then numeric suffixes from 2 upwards.
    pub fn generate_unique<F>(original_name: &str, date: NaiveDate, mut exists: F) -> String
    where
        F: FnMut(&str) -> bool,
    {
        let candidate = Self::generate(original_name, date);
        if !exists(&candidate) {
            return candidate;
        }

        let mut n: u32 = 2;
        loop {
            let numbered = Self::format(original_name, date, Some(n));
            if !exists(&numbered) {
                return numbered;
            }
            n += 1;
        }
    }

    /// Derives the sibling path for a conflict copy of `path`
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` for the scope root
    pub fn conflict_copy_path<F>(
        path: &SyncPath,
        date: NaiveDate,
        mut exists: F,
    ) -> Result<SyncPath, DomainError>
    where
        F: FnMut(&SyncPath) -> bool,
    {
        let name = path
            .file_name()
            .ok_or_else(|| DomainError::InvalidPath("Root has no conflict copy".to_string()))?;

        let copy_name = Self::generate_unique(name, date, |candidate| {
            path.with_file_name(candidate)
                .map(|p| exists(&p))
                .unwrap_or(true)
        });

        path.with_file_name(&copy_name)
    }

    fn format(original_name: &str, date: NaiveDate, suffix: Option<u32>) -> String {
        let date = date.format("%Y-%m-%d");
        let tag = match suffix {
            Some(n) => format!("(conflicted copy {date} {n})"),
            None => format!("(conflicted copy {date})"),
        };

        // A leading dot marks a hidden file, not an extension
        match original_name.rfind('.') {
            Some(dot_pos) if dot_pos > 0 => {
                let stem = &original_name[..dot_pos];
                let ext = &original_name[dot_pos..];
                format!("{stem} {tag}{ext}")
            }
            _ => format!("{original_name} {tag}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn may_first() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn test_generate_with_extension() {
        assert_eq!(
            ConflictNamer::generate("report.docx", may_first()),
            "report (conflicted copy 2024-05-01).docx"
        );
    }

    #[test]
    fn test_generate_without_extension() {
        assert_eq!(
            ConflictNamer::generate("Makefile", may_first()),
            "Makefile (conflicted copy 2024-05-01)"
        );
    }

    #[test]
    fn test_generate_with_multiple_dots() {
        assert_eq!(
            ConflictNamer::generate("archive.tar.gz", may_first()),
            "archive.tar (conflicted copy 2024-05-01).gz"
        );
    }

    #[test]
    fn test_generate_hidden_file() {
        assert_eq!(
            ConflictNamer::generate(".bashrc", may_first()),
            ".bashrc (conflicted copy 2024-05-01)"
        );
    }

    #[test]
    fn test_generate_unique_appends_suffix_on_collision() {
        let taken = [
            "notes (conflicted copy 2024-05-01).txt",
            "notes (conflicted copy 2024-05-01 2).txt",
        ];
        let name =
            ConflictNamer::generate_unique("notes.txt", may_first(), |c| taken.contains(&c));
        assert_eq!(name, "notes (conflicted copy 2024-05-01 3).txt");
    }

    #[test]
    fn test_conflict_copy_path_is_sibling() {
        let path: SyncPath = "/Documents/report.docx".parse().unwrap();
        let copy = ConflictNamer::conflict_copy_path(&path, may_first(), |_| false).unwrap();
        assert_eq!(
            copy.as_str(),
            "/Documents/report (conflicted copy 2024-05-01).docx"
        );
        assert!(ConflictNamer::conflict_copy_path(&SyncPath::root(), may_first(), |_| false)
            .is_err());
    }
}
