//! PrivateKey entity: operator-managed key material and its capability tokens

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "private_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    #[sea_orm(unique)]
    pub name: String,

    pub description: Option<String>,

    /// Stable algorithm value (rsa2048 .. ecdsap384)
    pub algorithm: String,

    /// PKCS#8 PEM; must parse to a key matching `algorithm`
    #[sea_orm(column_type = "Text")]
    pub pem: String,

    /// Capability token authorizing key downloads
    pub api_key: String,

    /// Rotation slot; both tokens are valid while set
    pub api_key_new: Option<String>,

    /// Unix seconds
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
