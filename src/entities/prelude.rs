pub use super::series::Entity as Series;
pub use super::uploaded_artifacts::Entity as UploadedArtifacts;
pub use super::user_volumes::Entity as UserVolumes;
pub use super::users::Entity as Users;
pub use super::volumes::Entity as Volumes;
