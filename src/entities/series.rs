use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "series")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub title: String,
    #[sea_orm(unique)]
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub thumbnail_local: Option<String>,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::volumes::Entity")]
    Volumes,
}

impl Related<super::volumes::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Volumes.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
