use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_lookup_and_catalog_tables::Migration),
            Box::new(m20240301_000002_create_budget_and_contract_tables::Migration),
            Box::new(m20240301_000003_create_reservation_tables::Migration),
            Box::new(m20240301_000004_create_demand_and_study_tables::Migration),
        ]
    }
}

// Migration implementations

mod m20240301_000001_create_lookup_and_catalog_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_lookup_and_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(LookupEntries::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(LookupEntries::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(LookupEntries::Kind).string_len(32).not_null())
                        .col(ColumnDef::new(LookupEntries::NaturalKey).string().not_null())
                        .col(
                            ColumnDef::new(LookupEntries::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(LookupEntries::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(LookupEntries::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // The resolver relies on this index to detect a lost insert race.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_lookup_entries_kind_natural_key")
                        .table(LookupEntries::Table)
                        .col(LookupEntries::Kind)
                        .col(LookupEntries::NaturalKey)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(CatalogItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CatalogItems::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(CatalogItems::Name).string().not_null())
                        .col(ColumnDef::new(CatalogItems::UnitOfMeasure).string().not_null())
                        .col(ColumnDef::new(CatalogItems::ItemType).string_len(16).not_null())
                        .col(ColumnDef::new(CatalogItems::TaxonomyCode).string().null())
                        .col(
                            ColumnDef::new(CatalogItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(CatalogItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CatalogItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(LookupEntries::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum LookupEntries {
        Table,
        Id,
        Kind,
        NaturalKey,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum CatalogItems {
        Table,
        Id,
        Name,
        UnitOfMeasure,
        ItemType,
        TaxonomyCode,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000002_create_budget_and_contract_tables {

    use super::m20240301_000001_create_lookup_and_catalog_tables::CatalogItems;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_budget_and_contract_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(BudgetLines::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(BudgetLines::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(BudgetLines::FiscalYear).integer().not_null())
                        .col(ColumnDef::new(BudgetLines::LedgerNumber).string().not_null())
                        .col(ColumnDef::new(BudgetLines::UnitId).integer().not_null())
                        .col(
                            ColumnDef::new(BudgetLines::InitialBalance)
                                .decimal_len(15, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(BudgetLines::CurrentBalance)
                                .decimal_len(15, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(BudgetLines::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(BudgetLines::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_budget_lines_year_unit_ledger")
                        .table(BudgetLines::Table)
                        .col(BudgetLines::FiscalYear)
                        .col(BudgetLines::UnitId)
                        .col(BudgetLines::LedgerNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ContractItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ContractItems::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(ContractItems::ContractId).integer().not_null())
                        .col(
                            ColumnDef::new(ContractItems::SequenceNumber)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ContractItems::CatalogItemId)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ContractItems::ContractedQuantity)
                                .decimal_len(15, 3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ContractItems::UnitPrice)
                                .decimal_len(15, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ContractItems::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(ContractItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ContractItems::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_contract_items_catalog_item")
                                .from(ContractItems::Table, ContractItems::CatalogItemId)
                                .to(CatalogItems::Table, CatalogItems::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_contract_items_contract_sequence")
                        .table(ContractItems::Table)
                        .col(ContractItems::ContractId)
                        .col(ContractItems::SequenceNumber)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ContractItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(BudgetLines::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum BudgetLines {
        Table,
        Id,
        FiscalYear,
        LedgerNumber,
        UnitId,
        InitialBalance,
        CurrentBalance,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum ContractItems {
        Table,
        Id,
        ContractId,
        SequenceNumber,
        CatalogItemId,
        ContractedQuantity,
        UnitPrice,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000003_create_reservation_tables {

    use super::m20240301_000002_create_budget_and_contract_tables::{BudgetLines, ContractItems};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_reservation_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(DeliveryOrders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DeliveryOrders::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrders::OrderNumber)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(DeliveryOrders::BudgetLineId).integer().null())
                        .col(
                            ColumnDef::new(DeliveryOrders::IssuedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryOrders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_delivery_orders_budget_line")
                                .from(DeliveryOrders::Table, DeliveryOrders::BudgetLineId)
                                .to(BudgetLines::Table, BudgetLines::Id)
                                .on_delete(ForeignKeyAction::SetNull),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Reservations::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Reservations::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(Reservations::ContractItemId)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Reservations::DeliveryOrderId)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Reservations::RequestedQuantity)
                                .decimal_len(15, 3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Reservations::DeliveredQuantity)
                                .decimal_len(15, 3)
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Reservations::Status).string_len(32).not_null())
                        .col(ColumnDef::new(Reservations::LastDeliveryNote).string().null())
                        .col(ColumnDef::new(Reservations::LastDeliveryDate).date().null())
                        .col(
                            ColumnDef::new(Reservations::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Reservations::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_reservations_contract_item")
                                .from(Reservations::Table, Reservations::ContractItemId)
                                .to(ContractItems::Table, ContractItems::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_reservations_delivery_order")
                                .from(Reservations::Table, Reservations::DeliveryOrderId)
                                .to(DeliveryOrders::Table, DeliveryOrders::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            // Balance checks scan reservations by contract item.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_reservations_contract_item_id")
                        .table(Reservations::Table)
                        .col(Reservations::ContractItemId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_reservations_delivery_order_id")
                        .table(Reservations::Table)
                        .col(Reservations::DeliveryOrderId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Reservations::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(DeliveryOrders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum DeliveryOrders {
        Table,
        Id,
        OrderNumber,
        BudgetLineId,
        IssuedAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Reservations {
        Table,
        Id,
        ContractItemId,
        DeliveryOrderId,
        RequestedQuantity,
        DeliveredQuantity,
        Status,
        LastDeliveryNote,
        LastDeliveryDate,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000004_create_demand_and_study_tables {

    use super::m20240301_000001_create_lookup_and_catalog_tables::CatalogItems;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_demand_and_study_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(TechnicalStudies::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(TechnicalStudies::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(TechnicalStudies::Title).string().not_null())
                        .col(
                            ColumnDef::new(TechnicalStudies::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(TechnicalStudies::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(TechnicalStudies::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(DemandDocuments::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DemandDocuments::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(DemandDocuments::Reference).string().not_null())
                        .col(
                            ColumnDef::new(DemandDocuments::RequestingUnitId)
                                .integer()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(DemandDocuments::TechnicalStudyId)
                                .integer()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(DemandDocuments::Status)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DemandDocuments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DemandDocuments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_demand_documents_technical_study")
                                .from(DemandDocuments::Table, DemandDocuments::TechnicalStudyId)
                                .to(TechnicalStudies::Table, TechnicalStudies::Id)
                                .on_delete(ForeignKeyAction::SetNull),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_demand_documents_technical_study_id")
                        .table(DemandDocuments::Table)
                        .col(DemandDocuments::TechnicalStudyId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(DemandItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DemandItems::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(DemandItems::DemandDocumentId)
                                .integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(DemandItems::CatalogItemId).integer().not_null())
                        .col(
                            ColumnDef::new(DemandItems::Quantity)
                                .decimal_len(15, 3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DemandItems::EstimatedUnitPrice)
                                .decimal_len(15, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(DemandItems::EstimatedTotal)
                                .decimal_len(15, 2)
                                .not_null()
                                .default(0),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_demand_items_demand_document")
                                .from(DemandItems::Table, DemandItems::DemandDocumentId)
                                .to(DemandDocuments::Table, DemandDocuments::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_demand_items_catalog_item")
                                .from(DemandItems::Table, DemandItems::CatalogItemId)
                                .to(CatalogItems::Table, CatalogItems::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ConsolidatedItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ConsolidatedItems::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(ConsolidatedItems::TechnicalStudyId)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ConsolidatedItems::CatalogItemId)
                                .integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ConsolidatedItems::Quantity)
                                .decimal_len(15, 3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ConsolidatedItems::ReferenceUnitPrice)
                                .decimal_len(15, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(ConsolidatedItems::Total)
                                .decimal_len(15, 2)
                                .not_null()
                                .default(0),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_consolidated_items_technical_study")
                                .from(ConsolidatedItems::Table, ConsolidatedItems::TechnicalStudyId)
                                .to(TechnicalStudies::Table, TechnicalStudies::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_consolidated_items_catalog_item")
                                .from(ConsolidatedItems::Table, ConsolidatedItems::CatalogItemId)
                                .to(CatalogItems::Table, CatalogItems::Id)
                                .on_delete(ForeignKeyAction::Restrict),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("uq_consolidated_items_study_catalog_item")
                        .table(ConsolidatedItems::Table)
                        .col(ConsolidatedItems::TechnicalStudyId)
                        .col(ConsolidatedItems::CatalogItemId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ConsolidatedItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(DemandItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(DemandDocuments::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(TechnicalStudies::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum TechnicalStudies {
        Table,
        Id,
        Title,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum DemandDocuments {
        Table,
        Id,
        Reference,
        RequestingUnitId,
        TechnicalStudyId,
        Status,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum DemandItems {
        Table,
        Id,
        DemandDocumentId,
        CatalogItemId,
        Quantity,
        EstimatedUnitPrice,
        EstimatedTotal,
    }

    #[derive(DeriveIden)]
    enum ConsolidatedItems {
        Table,
        Id,
        TechnicalStudyId,
        CatalogItemId,
        Quantity,
        ReferenceUnitPrice,
        Total,
    }
}
