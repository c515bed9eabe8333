//! Snapshot naming for generating and parsing timestamp-based archive names
//!
//! Names look like `backup-2025-06-01T14-30-00-123Z`: an ISO-8601 UTC
//! timestamp with the colons and the fractional dot replaced by dashes.
//! Every field is fixed width, so lexicographic order of the names equals
//! chronological order, which listing and retention rely on.

use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, Utc};

/// Prefix shared by snapshot directories and archives
pub const ARCHIVE_PREFIX: &str = "backup-";

/// Extension of a finished archive
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3fZ";

/// Render a timestamp in the dash-separated form used inside file names
pub fn timestamp_token(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Name of one point-in-time snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName {
    name: String,
    timestamp: DateTime<Utc>,
}

impl SnapshotName {
    /// Name a snapshot taken now
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    /// Name a snapshot taken at the given time, truncated to milliseconds
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        let timestamp = timestamp.trunc_subsecs(3);
        Self {
            name: format!("{}{}", ARCHIVE_PREFIX, timestamp_token(timestamp)),
            timestamp,
        }
    }

    /// The following name, one millisecond later. Used to step past a
    /// collision without breaking the sort order.
    pub fn successor(&self) -> Self {
        Self::at(self.timestamp + Duration::milliseconds(1))
    }

    /// Parse a snapshot directory name
    pub fn parse(name: &str) -> Option<Self> {
        let token = name.strip_prefix(ARCHIVE_PREFIX)?;
        let naive = NaiveDateTime::parse_from_str(token, TIMESTAMP_FORMAT).ok()?;
        let parsed = Self::at(naive.and_utc());
        // Reject anything that would not format back identically
        (parsed.name == name).then_some(parsed)
    }

    /// Parse an archive file name (`<snapshot>.tar.gz`)
    pub fn parse_archive_file_name(file_name: &str) -> Option<Self> {
        Self::parse(file_name.strip_suffix(ARCHIVE_EXTENSION)?)
    }

    /// The snapshot directory name
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// The archive file name for this snapshot
    pub fn archive_file_name(&self) -> String {
        format!("{}{}", self.name, ARCHIVE_EXTENSION)
    }
}

impl std::fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}
