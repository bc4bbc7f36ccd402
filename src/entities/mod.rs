//! SeaORM entity definitions

pub mod prelude;

pub mod series;
pub mod uploaded_artifacts;
pub mod user_volumes;
pub mod users;
pub mod volumes;
