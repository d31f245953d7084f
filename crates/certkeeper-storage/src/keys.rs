//! Private key storage operations

use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue::Set, PaginatorTrait, QueryOrder};

use crate::entities::{acme_account, certificate, private_key};
use crate::{unix_now, Storage, StorageError};

/// Payload for creating a key row; the pem/api key are produced by the caller
#[derive(Debug, Clone)]
pub struct NewKey {
    pub name: String,
    pub description: Option<String>,
    pub algorithm: String,
    pub pem: String,
    pub api_key: String,
}

impl Storage {
    pub async fn create_key(&self, new: NewKey) -> Result<private_key::Model, StorageError> {
        if self.find_key_by_name(&new.name).await?.is_some() {
            return Err(StorageError::Conflict(format!(
                "key name '{}' already exists",
                new.name
            )));
        }

        let now = unix_now();
        let active = private_key::ActiveModel {
            name: Set(new.name),
            description: Set(new.description),
            algorithm: Set(new.algorithm),
            pem: Set(new.pem),
            api_key: Set(new.api_key),
            api_key_new: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };

        Ok(active.insert(self.db()).await?)
    }

    pub async fn get_key(&self, id: i64) -> Result<private_key::Model, StorageError> {
        private_key::Entity::find_by_id(id)
            .one(self.db())
            .await?
            .ok_or(StorageError::NotFound)
    }

    pub async fn get_key_by_name(&self, name: &str) -> Result<private_key::Model, StorageError> {
        self.find_key_by_name(name)
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn find_key_by_name(
        &self,
        name: &str,
    ) -> Result<Option<private_key::Model>, StorageError> {
        Ok(private_key::Entity::find()
            .filter(private_key::Column::Name.eq(name))
            .one(self.db())
            .await?)
    }

    pub async fn list_keys(&self) -> Result<Vec<private_key::Model>, StorageError> {
        Ok(private_key::Entity::find()
            .order_by_asc(private_key::Column::Id)
            .all(self.db())
            .await?)
    }

    pub async fn update_key_info(
        &self,
        id: i64,
        name: Option<String>,
        description: Option<String>,
    ) -> Result<private_key::Model, StorageError> {
        let model = self.get_key(id).await?;

        if let Some(new_name) = &name {
            if new_name != &model.name && self.find_key_by_name(new_name).await?.is_some() {
                return Err(StorageError::Conflict(format!(
                    "key name '{new_name}' already exists"
                )));
            }
        }

        let mut active: private_key::ActiveModel = model.into();
        if let Some(name) = name {
            active.name = Set(name);
        }
        if let Some(description) = description {
            active.description = Set(Some(description));
        }
        active.updated_at = Set(unix_now());

        Ok(active.update(self.db()).await?)
    }

    /// Stage a rotation token: both `api_key` and `api_key_new` are accepted
    /// until the new one is promoted
    pub async fn stage_key_api_key(
        &self,
        id: i64,
        api_key_new: String,
    ) -> Result<private_key::Model, StorageError> {
        let model = self.get_key(id).await?;
        let mut active: private_key::ActiveModel = model.into();
        active.api_key_new = Set(Some(api_key_new));
        active.updated_at = Set(unix_now());
        Ok(active.update(self.db()).await?)
    }

    /// Promote the staged token, retiring the old one
    pub async fn promote_key_api_key(&self, id: i64) -> Result<private_key::Model, StorageError> {
        let model = self.get_key(id).await?;
        let Some(staged) = model.api_key_new.clone() else {
            return Err(StorageError::Conflict(
                "key has no staged api key to promote".to_string(),
            ));
        };

        let mut active: private_key::ActiveModel = model.into();
        active.api_key = Set(staged);
        active.api_key_new = Set(None);
        active.updated_at = Set(unix_now());
        Ok(active.update(self.db()).await?)
    }

    /// Delete a key. Refused while any account or certificate references it.
    pub async fn delete_key(&self, id: i64) -> Result<(), StorageError> {
        let account_refs = acme_account::Entity::find()
            .filter(acme_account::Column::PrivateKeyId.eq(id))
            .count(self.db())
            .await?;
        if account_refs > 0 {
            return Err(StorageError::Conflict(
                "key is in use by an acme account".to_string(),
            ));
        }

        let cert_refs = certificate::Entity::find()
            .filter(certificate::Column::PrivateKeyId.eq(id))
            .count(self.db())
            .await?;
        if cert_refs > 0 {
            return Err(StorageError::Conflict(
                "key is in use by a certificate".to_string(),
            ));
        }

        let result = private_key::Entity::delete_by_id(id).exec(self.db()).await?;
        if result.rows_affected == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    /// Keys not referenced by any account or certificate (available for new
    /// assignments)
    pub async fn get_available_key_ids(&self) -> Result<Vec<i64>, StorageError> {
        let account_keys: Vec<i64> = acme_account::Entity::find()
            .all(self.db())
            .await?
            .into_iter()
            .map(|a| a.private_key_id)
            .collect();
        let cert_keys: Vec<i64> = certificate::Entity::find()
            .all(self.db())
            .await?
            .into_iter()
            .map(|c| c.private_key_id)
            .collect();

        Ok(self
            .list_keys()
            .await?
            .into_iter()
            .map(|k| k.id)
            .filter(|id| !account_keys.contains(id) && !cert_keys.contains(id))
            .collect())
    }
}
