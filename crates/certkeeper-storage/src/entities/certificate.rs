//! Certificate entity: a definition the pipeline keeps valid indefinitely

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "certificates")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(unique)]
    pub name: String,

    pub description: Option<String>,

    pub account_id: i64,

    /// Default key for new orders; the finalized key of an existing order may
    /// differ after a key change
    pub private_key_id: i64,

    /// Common name; also present in `subject_alts`
    pub subject: String,

    /// Comma-joined SAN list
    #[sea_orm(column_type = "Text")]
    pub subject_alts: String,

    pub api_key: String,
    pub api_key_new: Option<String>,

    /// When false, the capability may not be presented as a URL segment
    pub api_key_via_url: bool,

    /// Optional command to run after a successful order
    pub post_processing_command: Option<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// SANs as a list (stored comma-joined)
    pub fn subject_alt_names(&self) -> Vec<String> {
        split_comma_joined(&self.subject_alts)
    }

    /// All dns identifiers an order for this certificate covers: the subject
    /// plus every SAN, deduplicated, subject first
    pub fn dns_identifiers(&self) -> Vec<String> {
        let mut identifiers = vec![self.subject.clone()];
        for alt in self.subject_alt_names() {
            if !identifiers.contains(&alt) {
                identifiers.push(alt);
            }
        }
        identifiers
    }
}

/// Split a comma-joined storage field, dropping empty segments
pub fn split_comma_joined(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join values for comma-joined storage
pub fn join_comma(values: &[String]) -> String {
    values.join(",")
}
