//! Certificate storage operations

use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, FromQueryResult, QueryOrder, Statement};

use crate::entities::certificate::{self, join_comma};
use crate::entities::{acme_order, private_key};
use crate::{unix_now, Storage, StorageError};

#[derive(Debug, Clone)]
pub struct NewCertificate {
    pub name: String,
    pub description: Option<String>,
    pub account_id: i64,
    pub private_key_id: i64,
    pub subject: String,
    pub subject_alts: Vec<String>,
    pub api_key: String,
    pub api_key_via_url: bool,
    pub post_processing_command: Option<String>,
}

/// Partial update; `None` fields are left unchanged
#[derive(Debug, Clone, Default)]
pub struct CertificateUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub private_key_id: Option<i64>,
    pub subject_alts: Option<Vec<String>>,
    pub api_key_via_url: Option<bool>,
    pub post_processing_command: Option<Option<String>>,
}

#[derive(FromQueryResult)]
struct IdRow {
    id: i64,
}

#[derive(FromQueryResult)]
struct PemRow {
    id: i64,
    pem: Option<String>,
    finalized_key_id: Option<i64>,
}

impl Storage {
    pub async fn create_certificate(
        &self,
        new: NewCertificate,
    ) -> Result<certificate::Model, StorageError> {
        // both references must resolve
        self.get_account(new.account_id).await?;
        self.get_key(new.private_key_id).await?;

        if self.find_certificate_by_name(&new.name).await?.is_some() {
            return Err(StorageError::Conflict(format!(
                "certificate name '{}' already exists",
                new.name
            )));
        }

        let now = unix_now();
        let active = certificate::ActiveModel {
            name: Set(new.name),
            description: Set(new.description),
            account_id: Set(new.account_id),
            private_key_id: Set(new.private_key_id),
            subject: Set(new.subject),
            subject_alts: Set(join_comma(&new.subject_alts)),
            api_key: Set(new.api_key),
            api_key_new: Set(None),
            api_key_via_url: Set(new.api_key_via_url),
            post_processing_command: Set(new.post_processing_command),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        Ok(active.insert(self.db()).await?)
    }

    pub async fn get_certificate(&self, id: i64) -> Result<certificate::Model, StorageError> {
        certificate::Entity::find_by_id(id)
            .one(self.db())
            .await?
            .ok_or(StorageError::NotFound)
    }

    pub async fn get_certificate_by_name(
        &self,
        name: &str,
    ) -> Result<certificate::Model, StorageError> {
        self.find_certificate_by_name(name)
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn find_certificate_by_name(
        &self,
        name: &str,
    ) -> Result<Option<certificate::Model>, StorageError> {
        Ok(certificate::Entity::find()
            .filter(certificate::Column::Name.eq(name))
            .one(self.db())
            .await?)
    }

    pub async fn list_certificates(&self) -> Result<Vec<certificate::Model>, StorageError> {
        Ok(certificate::Entity::find()
            .order_by_asc(certificate::Column::Id)
            .all(self.db())
            .await?)
    }

    pub async fn update_certificate(
        &self,
        id: i64,
        update: CertificateUpdate,
    ) -> Result<certificate::Model, StorageError> {
        let model = self.get_certificate(id).await?;

        if let Some(new_name) = &update.name {
            if new_name != &model.name
                && self.find_certificate_by_name(new_name).await?.is_some()
            {
                return Err(StorageError::Conflict(format!(
                    "certificate name '{new_name}' already exists"
                )));
            }
        }
        if let Some(key_id) = update.private_key_id {
            self.get_key(key_id).await?;
        }

        let mut active: certificate::ActiveModel = model.into();
        if let Some(name) = update.name {
            active.name = Set(name);
        }
        if let Some(description) = update.description {
            active.description = Set(Some(description));
        }
        if let Some(key_id) = update.private_key_id {
            active.private_key_id = Set(key_id);
        }
        if let Some(alts) = update.subject_alts {
            active.subject_alts = Set(join_comma(&alts));
        }
        if let Some(via_url) = update.api_key_via_url {
            active.api_key_via_url = Set(via_url);
        }
        if let Some(command) = update.post_processing_command {
            active.post_processing_command = Set(command);
        }
        active.updated_at = Set(unix_now());

        Ok(active.update(self.db()).await?)
    }

    pub async fn stage_certificate_api_key(
        &self,
        id: i64,
        api_key_new: String,
    ) -> Result<certificate::Model, StorageError> {
        let model = self.get_certificate(id).await?;
        let mut active: certificate::ActiveModel = model.into();
        active.api_key_new = Set(Some(api_key_new));
        active.updated_at = Set(unix_now());
        Ok(active.update(self.db()).await?)
    }

    pub async fn promote_certificate_api_key(
        &self,
        id: i64,
    ) -> Result<certificate::Model, StorageError> {
        let model = self.get_certificate(id).await?;
        let Some(staged) = model.api_key_new.clone() else {
            return Err(StorageError::Conflict(
                "certificate has no staged api key to promote".to_string(),
            ));
        };

        let mut active: certificate::ActiveModel = model.into();
        active.api_key = Set(staged);
        active.api_key_new = Set(None);
        active.updated_at = Set(unix_now());
        Ok(active.update(self.db()).await?)
    }

    /// Delete a certificate along with its order history
    pub async fn delete_certificate(&self, id: i64) -> Result<(), StorageError> {
        let result = certificate::Entity::delete_by_id(id).exec(self.db()).await?;
        if result.rows_affected == 0 {
            return Err(StorageError::NotFound);
        }

        acme_order::Entity::delete_many()
            .filter(acme_order::Column::CertificateId.eq(id))
            .exec(self.db())
            .await?;

        Ok(())
    }

    /// Ids of certificates whose newest usable order expires within the
    /// threshold; certificates with no valid order are not "expiring" (the
    /// incomplete-order retry path covers those)
    pub async fn get_expiring_cert_ids(
        &self,
        threshold_days: i64,
    ) -> Result<Vec<i64>, StorageError> {
        let cutoff = unix_now() + threshold_days * 86_400;

        let rows = IdRow::find_by_statement(Statement::from_sql_and_values(
            self.db().get_database_backend(),
            r#"
            SELECT c.id AS id
            FROM certificates c
            JOIN acme_orders ao ON ao.certificate_id = c.id
            WHERE ao.status = 'valid' AND ao.known_revoked = 0 AND ao.pem IS NOT NULL
            GROUP BY c.id
            HAVING MAX(ao.valid_to) <= $1
            ORDER BY c.id
            "#,
            [cutoff.into()],
        ))
        .all(self.db())
        .await?;

        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    /// The chain PEM of the certificate's newest valid, unrevoked order.
    /// Returns `(order_id, pem, finalized_key_id)`.
    pub async fn get_cert_pem_by_id(
        &self,
        cert_id: i64,
    ) -> Result<(i64, String, Option<i64>), StorageError> {
        let row = PemRow::find_by_statement(Statement::from_sql_and_values(
            self.db().get_database_backend(),
            r#"
            SELECT id, pem, finalized_key_id
            FROM acme_orders
            WHERE certificate_id = $1
              AND status = 'valid'
              AND known_revoked = 0
              AND pem IS NOT NULL
            ORDER BY valid_to DESC
            LIMIT 1
            "#,
            [cert_id.into()],
        ))
        .one(self.db())
        .await?
        .ok_or(StorageError::NotFound)?;

        let pem = row.pem.ok_or(StorageError::NotFound)?;
        Ok((row.id, pem, row.finalized_key_id))
    }

    /// Convenience for the TLS listener: chain PEM looked up by certificate
    /// name
    pub async fn get_cert_pem_by_name(&self, name: &str) -> Result<String, StorageError> {
        let cert = self.get_certificate_by_name(name).await?;
        let (_, pem, _) = self.get_cert_pem_by_id(cert.id).await?;
        Ok(pem)
    }

    /// The certificate's current default key
    pub async fn get_certificate_key(
        &self,
        cert: &certificate::Model,
    ) -> Result<private_key::Model, StorageError> {
        self.get_key(cert.private_key_id).await
    }
}
