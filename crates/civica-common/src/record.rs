//! Civic record rows and their on-disk markdown form
//!
//! Each record exists twice: as a row in the relational store and as a
//! markdown file with YAML frontmatter in the version-controlled records
//! tree. The frontmatter carries the record's *legal* status; saga progress
//! is never written to the file.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::util::unix_time;

/// Legal status of a record
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Not yet adopted
    Draft,
    /// In force
    Published,
    /// Out of active circulation
    Archived,
}

impl RecordStatus {
    /// Stable string form used for persistence
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            "archived" => Ok(Self::Archived),
            other => Err(format!("Unknown record status: {other}")),
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Slug id, unique across the records tree
    pub id: String,
    /// Human title
    pub title: String,
    /// Record type from the catalog, e.g. `bylaw`
    pub record_type: String,
    /// Legal status, persisted in the row and in frontmatter
    pub status: RecordStatus,
    /// Markdown body
    pub body: String,
    /// Path of the on-disk file, relative to the records root
    pub path: String,
    /// Creation timestamp (unix seconds)
    pub created_at: u64,
    /// Last modification timestamp (unix seconds)
    pub updated_at: u64,
}

/// A draft row; same shape as a record but not yet published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    /// Slug id; the published record keeps it
    pub id: String,
    /// Human title
    pub title: String,
    /// Record type the draft will publish as
    pub record_type: String,
    /// Markdown body
    pub body: String,
    /// Creation timestamp (unix seconds)
    pub created_at: u64,
    /// Last modification timestamp (unix seconds)
    pub updated_at: u64,
}

/// Frontmatter block rendered at the top of every record file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Frontmatter {
    id: String,
    title: String,
    #[serde(rename = "type")]
    record_type: String,
    status: RecordStatus,
    created: u64,
    updated: u64,
}

impl Record {
    /// Relative path of a record file under the records root
    pub fn rel_path(record_type: &str, id: &str) -> String {
        format!("records/{record_type}/{id}.md")
    }

    /// Relative path of an archived record file
    pub fn archive_path(record_type: &str, id: &str) -> String {
        format!("archive/{record_type}/{id}.md")
    }

    /// Build a published record from a draft
    pub fn from_draft(draft: &Draft) -> Self {
        let now = unix_time();
        Self {
            id: draft.id.clone(),
            title: draft.title.clone(),
            record_type: draft.record_type.clone(),
            status: RecordStatus::Published,
            body: draft.body.clone(),
            path: Self::rel_path(&draft.record_type, &draft.id),
            created_at: draft.created_at,
            updated_at: now,
        }
    }

    /// Render the on-disk form: YAML frontmatter followed by the body
    pub fn to_markdown(&self) -> Result<String, Error> {
        let front = Frontmatter {
            id: self.id.clone(),
            title: self.title.clone(),
            record_type: self.record_type.clone(),
            status: self.status,
            created: self.created_at,
            updated: self.updated_at,
        };
        let yaml = serde_yaml::to_string(&front)?;
        Ok(format!("---\n{yaml}---\n\n{}\n", self.body.trim_end()))
    }

    /// Parse the on-disk form back into a record
    pub fn from_markdown(content: &str) -> Result<Self, Error> {
        let rest = content
            .strip_prefix("---\n")
            .ok_or_else(|| Error::Internal("record file has no frontmatter".to_string()))?;
        let (yaml, body) = rest
            .split_once("\n---\n")
            .ok_or_else(|| Error::Internal("unterminated frontmatter".to_string()))?;
        let front: Frontmatter = serde_yaml::from_str(yaml)?;

        Ok(Self {
            path: Self::rel_path(&front.record_type, &front.id),
            id: front.id,
            title: front.title,
            record_type: front.record_type,
            status: front.status,
            body: body.trim_start_matches('\n').trim_end().to_string(),
            created_at: front.created,
            updated_at: front.updated,
        })
    }
}

/// Derive a slug id from a title: lowercase alphanumerics with single
/// dashes, no leading or trailing dash.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;

    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }

    while slug.ends_with('-') {
        slug.pop();
    }

    slug
}
