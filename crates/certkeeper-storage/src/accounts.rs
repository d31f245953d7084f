//! ACME account storage operations

use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, PaginatorTrait, QueryOrder};

use crate::entities::{acme_account, certificate};
use crate::{unix_now, Storage, StorageError};

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub description: Option<String>,
    pub email: Option<String>,
    pub accepted_tos: bool,
    pub private_key_id: i64,
    /// "prod" or "staging"
    pub directory: String,
}

impl Storage {
    pub async fn create_account(
        &self,
        new: NewAccount,
    ) -> Result<acme_account::Model, StorageError> {
        // the referenced key must resolve
        self.get_key(new.private_key_id).await?;

        if self.find_account_by_name(&new.name).await?.is_some() {
            return Err(StorageError::Conflict(format!(
                "account name '{}' already exists",
                new.name
            )));
        }

        let now = unix_now();
        let active = acme_account::ActiveModel {
            name: Set(new.name),
            description: Set(new.description),
            email: Set(new.email),
            accepted_tos: Set(new.accepted_tos),
            private_key_id: Set(new.private_key_id),
            directory: Set(new.directory),
            kid: Set(None),
            status: Set("unknown".to_string()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        Ok(active.insert(self.db()).await?)
    }

    pub async fn get_account(&self, id: i64) -> Result<acme_account::Model, StorageError> {
        acme_account::Entity::find_by_id(id)
            .one(self.db())
            .await?
            .ok_or(StorageError::NotFound)
    }

    pub async fn get_account_by_name(
        &self,
        name: &str,
    ) -> Result<acme_account::Model, StorageError> {
        self.find_account_by_name(name)
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn find_account_by_name(
        &self,
        name: &str,
    ) -> Result<Option<acme_account::Model>, StorageError> {
        Ok(acme_account::Entity::find()
            .filter(acme_account::Column::Name.eq(name))
            .one(self.db())
            .await?)
    }

    pub async fn list_accounts(&self) -> Result<Vec<acme_account::Model>, StorageError> {
        Ok(acme_account::Entity::find()
            .order_by_asc(acme_account::Column::Id)
            .all(self.db())
            .await?)
    }

    pub async fn update_account_info(
        &self,
        id: i64,
        name: Option<String>,
        description: Option<String>,
        email: Option<String>,
    ) -> Result<acme_account::Model, StorageError> {
        let model = self.get_account(id).await?;

        if let Some(new_name) = &name {
            if new_name != &model.name && self.find_account_by_name(new_name).await?.is_some() {
                return Err(StorageError::Conflict(format!(
                    "account name '{new_name}' already exists"
                )));
            }
        }

        let mut active: acme_account::ActiveModel = model.into();
        if let Some(name) = name {
            active.name = Set(name);
        }
        if let Some(description) = description {
            active.description = Set(Some(description));
        }
        if let Some(email) = email {
            active.email = Set(Some(email));
        }
        active.updated_at = Set(unix_now());

        Ok(active.update(self.db()).await?)
    }

    /// Record the outcome of a registration (or deactivation) POST: the
    /// server-assigned kid and the account status
    pub async fn set_account_registration(
        &self,
        id: i64,
        kid: &str,
        status: &str,
    ) -> Result<acme_account::Model, StorageError> {
        let model = self.get_account(id).await?;
        let mut active: acme_account::ActiveModel = model.into();
        active.kid = Set(Some(kid.to_string()));
        active.status = Set(status.to_string());
        active.updated_at = Set(unix_now());
        Ok(active.update(self.db()).await?)
    }

    pub async fn set_account_status(
        &self,
        id: i64,
        status: &str,
    ) -> Result<acme_account::Model, StorageError> {
        let model = self.get_account(id).await?;
        let mut active: acme_account::ActiveModel = model.into();
        active.status = Set(status.to_string());
        active.updated_at = Set(unix_now());
        Ok(active.update(self.db()).await?)
    }

    /// Swap the account key after a successful ACME key rollover
    pub async fn set_account_key(
        &self,
        id: i64,
        private_key_id: i64,
    ) -> Result<acme_account::Model, StorageError> {
        self.get_key(private_key_id).await?;

        let model = self.get_account(id).await?;
        let mut active: acme_account::ActiveModel = model.into();
        active.private_key_id = Set(private_key_id);
        active.updated_at = Set(unix_now());
        Ok(active.update(self.db()).await?)
    }

    /// Delete an account. Refused while certificates reference it.
    pub async fn delete_account(&self, id: i64) -> Result<(), StorageError> {
        let cert_refs = certificate::Entity::find()
            .filter(certificate::Column::AccountId.eq(id))
            .count(self.db())
            .await?;
        if cert_refs > 0 {
            return Err(StorageError::Conflict(
                "account is in use by a certificate".to_string(),
            ));
        }

        let result = acme_account::Entity::delete_by_id(id).exec(self.db()).await?;
        if result.rows_affected == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }
}
