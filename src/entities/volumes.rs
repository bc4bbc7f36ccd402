use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "volumes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub title: String,
    #[sea_orm(unique)]
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub thumbnail_local: Option<String>,
    pub description: Option<String>,
    pub pages: i32,
    pub series_id: Option<i32>,
    pub now_downloading: bool,
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::series::Entity",
        from = "Column::SeriesId",
        to = "super::series::Column::Id",
        on_update = "NoAction",
        on_delete = "SetNull"
    )]
    Series,
    #[sea_orm(has_many = "super::user_volumes::Entity")]
    UserVolumes,
}

impl Related<super::series::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Series.def()
    }
}

impl Related<super::user_volumes::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserVolumes.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
