//! Order storage operations
//!
//! Every mutation checks the terminal-state guard: a `valid` or `invalid`
//! order only ever changes its `known_revoked` flag.

use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, FromQueryResult, QueryOrder, Statement};

use certkeeper_acme as acme;

use crate::entities::acme_order;
use crate::entities::certificate::join_comma;
use crate::{unix_now, Storage, StorageError};

/// Payload for persisting a freshly placed ACME order
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub certificate_id: i64,
    pub location: String,
    pub status: acme::OrderStatus,
    pub expires: Option<i64>,
    pub dns_identifiers: Vec<String>,
    pub authorizations: Vec<String>,
    pub finalize: String,
}

#[derive(FromQueryResult)]
struct IdRow {
    id: i64,
}

impl Storage {
    pub async fn insert_order(&self, new: NewOrder) -> Result<acme_order::Model, StorageError> {
        // the order must belong to a real certificate
        self.get_certificate(new.certificate_id).await?;

        let now = unix_now();
        let active = acme_order::ActiveModel {
            certificate_id: Set(new.certificate_id),
            location: Set(new.location),
            status: Set(new.status.as_str().to_string()),
            error: Set(None),
            expires: Set(new.expires),
            dns_identifiers: Set(join_comma(&new.dns_identifiers)),
            authorizations: Set(join_comma(&new.authorizations)),
            finalize: Set(new.finalize),
            finalized_key_id: Set(None),
            certificate_url: Set(None),
            pem: Set(None),
            valid_from: Set(None),
            valid_to: Set(None),
            known_revoked: Set(false),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        Ok(active.insert(self.db()).await?)
    }

    pub async fn get_order(&self, id: i64) -> Result<acme_order::Model, StorageError> {
        acme_order::Entity::find_by_id(id)
            .one(self.db())
            .await?
            .ok_or(StorageError::NotFound)
    }

    pub async fn get_cert_orders(
        &self,
        cert_id: i64,
    ) -> Result<Vec<acme_order::Model>, StorageError> {
        Ok(acme_order::Entity::find()
            .filter(acme_order::Column::CertificateId.eq(cert_id))
            .order_by_desc(acme_order::Column::CreatedAt)
            .all(self.db())
            .await?)
    }

    /// Sync the persisted row with a freshly fetched ACME order object
    /// (status, expiry, authorizations, certificate URL)
    pub async fn update_order_from_acme(
        &self,
        id: i64,
        remote: &acme::Order,
        expires_unix: Option<i64>,
    ) -> Result<acme_order::Model, StorageError> {
        let model = self.get_order(id).await?;
        if model.is_terminal() {
            return Err(StorageError::TerminalOrder);
        }

        let mut active: acme_order::ActiveModel = model.into();
        active.status = Set(remote.status.as_str().to_string());
        if expires_unix.is_some() {
            active.expires = Set(expires_unix);
        }
        if !remote.authorizations.is_empty() {
            active.authorizations = Set(join_comma(&remote.authorizations));
        }
        if remote.certificate.is_some() {
            active.certificate_url = Set(remote.certificate.clone());
        }
        if let Some(problem) = &remote.error {
            active.error = Set(serde_json::to_string(problem).ok());
        }
        active.updated_at = Set(unix_now());

        Ok(active.update(self.db()).await?)
    }

    /// Final success transition: persist the issued chain and its validity
    pub async fn set_order_valid(
        &self,
        id: i64,
        pem: &str,
        finalized_key_id: i64,
        valid_from: i64,
        valid_to: i64,
    ) -> Result<acme_order::Model, StorageError> {
        let model = self.get_order(id).await?;
        if model.is_terminal() {
            return Err(StorageError::TerminalOrder);
        }

        let mut active: acme_order::ActiveModel = model.into();
        active.status = Set("valid".to_string());
        active.pem = Set(Some(pem.to_string()));
        active.finalized_key_id = Set(Some(finalized_key_id));
        active.valid_from = Set(Some(valid_from));
        active.valid_to = Set(Some(valid_to));
        active.error = Set(None);
        active.updated_at = Set(unix_now());

        Ok(active.update(self.db()).await?)
    }

    /// Final failure transition, with the problem document preserved
    pub async fn set_order_invalid(
        &self,
        id: i64,
        problem: Option<&acme::Problem>,
    ) -> Result<acme_order::Model, StorageError> {
        let model = self.get_order(id).await?;
        if model.is_terminal() {
            return Err(StorageError::TerminalOrder);
        }

        let mut active: acme_order::ActiveModel = model.into();
        active.status = Set("invalid".to_string());
        if let Some(problem) = problem {
            active.error = Set(serde_json::to_string(problem).ok());
        }
        active.updated_at = Set(unix_now());

        Ok(active.update(self.db()).await?)
    }

    /// Record a transient failure without changing state
    pub async fn set_order_error(
        &self,
        id: i64,
        problem: &acme::Problem,
    ) -> Result<(), StorageError> {
        let model = self.get_order(id).await?;
        if model.is_terminal() {
            return Err(StorageError::TerminalOrder);
        }

        let mut active: acme_order::ActiveModel = model.into();
        active.error = Set(serde_json::to_string(problem).ok());
        active.updated_at = Set(unix_now());
        active.update(self.db()).await?;
        Ok(())
    }

    /// The only mutation allowed on a terminal order
    pub async fn mark_order_revoked(&self, id: i64) -> Result<acme_order::Model, StorageError> {
        let model = self.get_order(id).await?;
        let mut active: acme_order::ActiveModel = model.into();
        active.known_revoked = Set(true);
        active.updated_at = Set(unix_now());
        Ok(active.update(self.db()).await?)
    }

    /// All orders not yet in a terminal state; re-queued by the scheduler
    pub async fn get_all_incomplete_order_ids(&self) -> Result<Vec<i64>, StorageError> {
        let rows = IdRow::find_by_statement(Statement::from_string(
            self.db().get_database_backend(),
            r#"
            SELECT id FROM acme_orders
            WHERE status NOT IN ('valid', 'invalid')
            ORDER BY id
            "#,
        ))
        .all(self.db())
        .await?;

        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    /// The newest non-terminal order for a certificate, if any
    pub async fn get_newest_incomplete_cert_order_id(
        &self,
        cert_id: i64,
    ) -> Result<Option<i64>, StorageError> {
        let row = IdRow::find_by_statement(Statement::from_sql_and_values(
            self.db().get_database_backend(),
            r#"
            SELECT id FROM acme_orders
            WHERE certificate_id = $1 AND status NOT IN ('valid', 'invalid')
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
            [cert_id.into()],
        ))
        .one(self.db())
        .await?;

        Ok(row.map(|row| row.id))
    }
}
