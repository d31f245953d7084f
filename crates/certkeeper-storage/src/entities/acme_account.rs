//! AcmeAccount entity: one registration against an ACME directory

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "acme_accounts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(unique)]
    pub name: String,

    pub description: Option<String>,

    /// Contact email registered with the CA (blank = none)
    pub email: Option<String>,

    pub accepted_tos: bool,

    /// The key that signs this account's requests. Immutable once `kid` is
    /// set (RFC 8555 section 7.3); rollover replaces the key via the CA, not
    /// this column directly.
    pub private_key_id: i64,

    /// Which directory the account lives on: "prod" or "staging"
    pub directory: String,

    /// Server-assigned account URL; set iff registration has succeeded
    pub kid: Option<String>,

    /// unknown | valid | deactivated | revoked
    pub status: String,

    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
