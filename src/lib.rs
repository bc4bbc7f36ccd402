pub mod config;
pub mod convert;
pub mod database;
pub mod delivery;
pub mod entities;
pub mod errors;
pub mod i18n;
pub mod job_scheduling;
pub mod models;
pub mod remote;
pub mod storage;
pub mod utils;
