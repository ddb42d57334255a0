use chrono::Utc;
use serde::{Deserialize, Serialize};

pub const ARCHIVE_SUFFIX: &str = ".tar.gz";
pub const ARCHIVE_CONTENT_TYPE: &str = "application/gzip";

/// Builds the storage key for a completed backup:
/// `{projectName}-{date}-{dataset}-{projectId}.tar.gz`.
///
/// The project name may itself contain hyphens; the parser below relies
/// on date/dataset/projectId being the rightmost three segments.
pub fn archive_key(project_name: &str, dataset: &str, project_id: &str) -> String {
    let date = Utc::now().format("%Y-%m-%d");
    format!("{project_name}-{date}-{dataset}-{project_id}{ARCHIVE_SUFFIX}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSummary {
    pub key: String,
    pub project_name: String,
    pub date: String,
    pub dataset: String,
    pub project_id: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

/// Splits a key back into its embedded fields. The rightmost three
/// hyphen-delimited segments are date, dataset, and projectId; everything
/// before them is the project name. Keys without the archive suffix or
/// with too few segments are not archives and yield `None`.
///
/// Known limitation of the inherited naming scheme: a dataset or date
/// containing hyphens beyond the `YYYY-MM-DD` shape cannot be recovered.
pub fn parse_archive_key(key: &str) -> Option<(String, String, String, String)> {
    let stem = key.strip_suffix(ARCHIVE_SUFFIX)?;

    let (rest, project_id) = stem.rsplit_once('-')?;
    let (rest, dataset) = rest.rsplit_once('-')?;

    // The date itself is hyphenated (YYYY-MM-DD), so peel three more
    // segments and rejoin them.
    let (rest, day) = rest.rsplit_once('-')?;
    let (rest, month) = rest.rsplit_once('-')?;
    let (project_name, year) = rest.rsplit_once('-')?;
    if project_name.is_empty() {
        return None;
    }
    let date = format!("{year}-{month}-{day}");

    Some((
        project_name.to_string(),
        date,
        dataset.to_string(),
        project_id.to_string(),
    ))
}

/// Turns raw object listings into summaries, dropping keys that are not
/// recognizable archives, newest embedded date first (plain string
/// comparison, which matches ISO dates).
pub fn summarize_archives(
    objects: impl IntoIterator<Item = (String, u64, Option<i64>)>,
) -> Vec<ArchiveSummary> {
    let mut out: Vec<ArchiveSummary> = objects
        .into_iter()
        .filter_map(|(key, size, last_modified)| {
            let (project_name, date, dataset, project_id) = parse_archive_key(&key)?;
            Some(ArchiveSummary {
                key,
                project_name,
                date,
                dataset,
                project_id,
                size,
                last_modified,
            })
        })
        .collect();
    out.sort_by(|a, b| b.date.cmp(&a.date));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_parser() {
        let key = archive_key("acme", "production", "abc123");
        let (name, date, dataset, project_id) = parse_archive_key(&key).unwrap();
        assert_eq!(name, "acme");
        assert_eq!(dataset, "production");
        assert_eq!(project_id, "abc123");
        assert_eq!(date.len(), 10);
    }

    #[test]
    fn hyphenated_project_name_is_recovered() {
        let (name, date, dataset, project_id) =
            parse_archive_key("my-cool-site-2025-01-15-production-abc123.tar.gz").unwrap();
        assert_eq!(name, "my-cool-site");
        assert_eq!(date, "2025-01-15");
        assert_eq!(dataset, "production");
        assert_eq!(project_id, "abc123");
    }

    #[test]
    fn non_archive_keys_are_rejected() {
        assert!(parse_archive_key("notes.txt").is_none());
        assert!(parse_archive_key("short-2025.tar.gz").is_none());
        assert!(parse_archive_key("-2025-01-15-production-abc123.tar.gz").is_none());
    }

    #[test]
    fn listing_sorts_string_descending_by_date() {
        let summaries = summarize_archives(vec![
            ("acme-2025-01-15-production-abc123.tar.gz".to_string(), 10, None),
            ("acme-2025-02-01-staging-def456.tar.gz".to_string(), 20, None),
            ("readme.md".to_string(), 1, None),
        ]);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].date, "2025-02-01");
        assert_eq!(summaries[0].dataset, "staging");
        assert_eq!(summaries[1].date, "2025-01-15");
    }
}
