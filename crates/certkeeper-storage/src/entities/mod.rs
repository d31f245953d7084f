//! Database entities

pub mod acme_account;
pub mod acme_order;
pub mod certificate;
pub mod private_key;

pub use acme_account::Entity as AcmeAccount;
pub use acme_order::Entity as AcmeOrder;
pub use certificate::Entity as Certificate;
pub use private_key::Entity as PrivateKey;

pub mod prelude {
    pub use super::acme_account::Entity as AcmeAccount;
    pub use super::acme_order::Entity as AcmeOrder;
    pub use super::certificate::Entity as Certificate;
    pub use super::private_key::Entity as PrivateKey;
}
