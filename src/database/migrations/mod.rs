//! SeaORM migrations for the library store

use sea_orm_migration::prelude::*;

pub mod m20250301_000001_initial_schema;
pub mod m20250315_000001_uploaded_artifacts;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_initial_schema::Migration),
            Box::new(m20250315_000001_uploaded_artifacts::Migration),
        ]
    }
}
