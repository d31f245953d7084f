//! Initial schema: private_keys, acme_accounts, certificates, acme_orders

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PrivateKeys::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PrivateKeys::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string_len_uniq(PrivateKeys::Name, 255))
                    .col(string_null(PrivateKeys::Description))
                    .col(string_len(PrivateKeys::Algorithm, 32).not_null())
                    .col(text(PrivateKeys::Pem))
                    .col(string(PrivateKeys::ApiKey))
                    .col(string_null(PrivateKeys::ApiKeyNew))
                    .col(big_integer(PrivateKeys::CreatedAt))
                    .col(big_integer(PrivateKeys::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(AcmeAccounts::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AcmeAccounts::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string_len_uniq(AcmeAccounts::Name, 255))
                    .col(string_null(AcmeAccounts::Description))
                    .col(string_null(AcmeAccounts::Email))
                    .col(boolean(AcmeAccounts::AcceptedTos).default(false))
                    .col(big_integer(AcmeAccounts::PrivateKeyId))
                    .col(string_len(AcmeAccounts::Directory, 16).not_null())
                    .col(string_null(AcmeAccounts::Kid))
                    .col(
                        string_len(AcmeAccounts::Status, 16)
                            .not_null()
                            .default("unknown"),
                    )
                    .col(big_integer(AcmeAccounts::CreatedAt))
                    .col(big_integer(AcmeAccounts::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Certificates::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Certificates::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(string_len_uniq(Certificates::Name, 255))
                    .col(string_null(Certificates::Description))
                    .col(big_integer(Certificates::AccountId))
                    .col(big_integer(Certificates::PrivateKeyId))
                    .col(string(Certificates::Subject))
                    .col(text(Certificates::SubjectAlts))
                    .col(string(Certificates::ApiKey))
                    .col(string_null(Certificates::ApiKeyNew))
                    .col(boolean(Certificates::ApiKeyViaUrl).default(false))
                    .col(string_null(Certificates::PostProcessingCommand))
                    .col(big_integer(Certificates::CreatedAt))
                    .col(big_integer(Certificates::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(AcmeOrders::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AcmeOrders::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(big_integer(AcmeOrders::CertificateId))
                    .col(string(AcmeOrders::Location))
                    .col(
                        string_len(AcmeOrders::Status, 16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(text_null(AcmeOrders::Error))
                    .col(big_integer_null(AcmeOrders::Expires))
                    .col(text(AcmeOrders::DnsIdentifiers))
                    .col(text(AcmeOrders::Authorizations))
                    .col(string(AcmeOrders::Finalize))
                    .col(big_integer_null(AcmeOrders::FinalizedKeyId))
                    .col(string_null(AcmeOrders::CertificateUrl))
                    .col(text_null(AcmeOrders::Pem))
                    .col(big_integer_null(AcmeOrders::ValidFrom))
                    .col(big_integer_null(AcmeOrders::ValidTo))
                    .col(boolean(AcmeOrders::KnownRevoked).default(false))
                    .col(big_integer(AcmeOrders::CreatedAt))
                    .col(big_integer(AcmeOrders::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_acme_orders_certificate_id")
                    .table(AcmeOrders::Table)
                    .col(AcmeOrders::CertificateId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_acme_orders_status")
                    .table(AcmeOrders::Table)
                    .col(AcmeOrders::Status)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AcmeOrders::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Certificates::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(AcmeAccounts::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PrivateKeys::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PrivateKeys {
    Table,
    Id,
    Name,
    Description,
    Algorithm,
    Pem,
    ApiKey,
    ApiKeyNew,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AcmeAccounts {
    Table,
    Id,
    Name,
    Description,
    Email,
    AcceptedTos,
    PrivateKeyId,
    Directory,
    Kid,
    Status,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Certificates {
    Table,
    Id,
    Name,
    Description,
    AccountId,
    PrivateKeyId,
    Subject,
    SubjectAlts,
    ApiKey,
    ApiKeyNew,
    ApiKeyViaUrl,
    PostProcessingCommand,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum AcmeOrders {
    Table,
    Id,
    CertificateId,
    Location,
    Status,
    Error,
    Expires,
    DnsIdentifiers,
    Authorizations,
    Finalize,
    FinalizedKeyId,
    CertificateUrl,
    Pem,
    ValidFrom,
    ValidTo,
    KnownRevoked,
    CreatedAt,
    UpdatedAt,
}
