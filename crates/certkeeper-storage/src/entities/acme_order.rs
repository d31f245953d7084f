//! AcmeOrder entity: one issuance attempt, kept forever as an audit trail

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "acme_orders")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub certificate_id: i64,

    /// The order URL on the ACME server
    pub location: String,

    /// pending | ready | processing | valid | invalid; valid/invalid are
    /// terminal (only `known_revoked` may change afterwards)
    pub status: String,

    /// ACME problem document (json) when the order failed
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,

    /// Order expiry, unix seconds
    pub expires: Option<i64>,

    /// Comma-joined dns identifiers covered by the order
    #[sea_orm(column_type = "Text")]
    pub dns_identifiers: String,

    /// Comma-joined authorization URLs
    #[sea_orm(column_type = "Text")]
    pub authorizations: String,

    pub finalize: String,

    /// The key that signed the CSR; may differ from the certificate's
    /// current default key
    pub finalized_key_id: Option<i64>,

    pub certificate_url: Option<String>,

    /// Issued chain PEM
    #[sea_orm(column_type = "Text", nullable)]
    pub pem: Option<String>,

    /// Leaf NotBefore / NotAfter, unix seconds
    pub valid_from: Option<i64>,
    pub valid_to: Option<i64>,

    pub known_revoked: bool,

    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn is_terminal(&self) -> bool {
        self.status == "valid" || self.status == "invalid"
    }

    pub fn authorization_urls(&self) -> Vec<String> {
        super::certificate::split_comma_joined(&self.authorizations)
    }
}
