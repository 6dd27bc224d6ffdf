//! Decision ledger records and retrieval filters

use crate::error::{RecallError, Result};
use crate::similarity::normalize_text;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Open,
    /// Terminal, set only by an explicit caller action
    Closed,
    Superseded,
}

impl DecisionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStatus::Open => "open",
            DecisionStatus::Closed => "closed",
            DecisionStatus::Superseded => "superseded",
        }
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "open" => Ok(DecisionStatus::Open),
            "closed" => Ok(DecisionStatus::Closed),
            "superseded" => Ok(DecisionStatus::Superseded),
            other => Err(format!("unknown decision status: {other}")),
        }
    }
}

/// An entry in the append-only decision ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub id: String,
    /// Normalized decision text
    pub decision_head: String,
    pub status: DecisionStatus,
    /// Immediate successor only; chains are resolved on read
    pub superseded_by: Option<String>,
    pub entities: BTreeSet<String>,
    pub files: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub head_embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
}

impl DecisionRecord {
    /// Build an open record, normalizing the head and validating names
    pub fn new<E, F>(head: &str, entities: E, files: F) -> Result<Self>
    where
        E: IntoIterator,
        E::Item: Into<String>,
        F: IntoIterator,
        F::Item: Into<String>,
    {
        let decision_head = normalize_head(head);
        if decision_head.is_empty() {
            return Err(RecallError::validation("decision head is empty"));
        }

        let entities = clean_names(entities, "entity")?;
        let files = clean_names(files, "file")?;

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            decision_head,
            status: DecisionStatus::Open,
            superseded_by: None,
            entities,
            files,
            head_embedding: Vec::new(),
            created_at: Utc::now(),
            superseded_at: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.status == DecisionStatus::Open
    }

    pub fn shares_entity_with(&self, other: &DecisionRecord) -> bool {
        !self.entities.is_disjoint(&other.entities)
    }
}

/// Trim and collapse whitespace. Case is preserved for display.
pub fn normalize_head(head: &str) -> String {
    head.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased head used for comparison and embedding
pub(crate) fn comparable_head(head: &str) -> String {
    normalize_text(head)
}

fn clean_names<I>(names: I, what: &str) -> Result<BTreeSet<String>>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    names
        .into_iter()
        .map(|name| {
            let name: String = name.into();
            let trimmed = name.trim();
            if trimmed.is_empty() {
                Err(RecallError::validation(format!("{what} name is empty")))
            } else {
                Ok(trimmed.to_string())
            }
        })
        .collect()
}

/// Filter for `retrieve_decisions`; empty sets match everything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionFilter {
    /// Any-overlap match
    pub entities: BTreeSet<String>,
    /// Any-overlap match
    pub files: BTreeSet<String>,
    pub statuses: Vec<DecisionStatus>,
    pub limit: Option<usize>,
}

impl DecisionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open() -> Self {
        Self::default().status(DecisionStatus::Open)
    }

    pub fn entity(mut self, entity: impl Into<String>) -> Self {
        self.entities.insert(entity.into());
        self
    }

    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.files.insert(file.into());
        self
    }

    pub fn status(mut self, status: DecisionStatus) -> Self {
        if !self.statuses.contains(&status) {
            self.statuses.push(status);
        }
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &DecisionRecord) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }
        if !self.entities.is_empty() && self.entities.is_disjoint(&record.entities) {
            return false;
        }
        if !self.files.is_empty() && self.files.is_disjoint(&record.files) {
            return false;
        }
        true
    }
}

/// Result of `submit_decision`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitOutcome {
    pub decision_id: String,
    pub superseded_previous: Option<String>,
}
