use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub language: String,
    pub email: Option<String>,
    pub password: Option<String>,
    pub save_credentials: bool,
    pub file_format: String,
    pub cache_expire_date: Option<ChronoDateTimeUtc>,
    pub now_caching: bool,
    pub cache_built: bool,
    pub login_error: bool,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::user_volumes::Entity")]
    UserVolumes,
    #[sea_orm(has_many = "super::uploaded_artifacts::Entity")]
    UploadedArtifacts,
}

impl Related<super::user_volumes::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UserVolumes.def()
    }
}

impl Related<super::uploaded_artifacts::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::UploadedArtifacts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
