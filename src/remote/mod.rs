//! Remote storefront access
//!
//! The scheduler depends only on [`RemoteLibraryClient`]; [`http::HttpLibraryClient`]
//! is the reqwest implementation used by the binary.

pub mod http;

pub use http::HttpLibraryClient;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::RemoteResult;
use crate::models::{PurchaseItem, Session, Volume, VolumeDetails, VolumeListing};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteLibraryClient: Send + Sync {
    /// Log in and return an authenticated session.
    ///
    /// `fast_login` posts straight to the configured login endpoint instead of
    /// discovering it from the storefront front page.
    async fn authenticate(
        &self,
        email: &str,
        password: &str,
        fast_login: bool,
    ) -> RemoteResult<Session>;

    /// Every purchased item across all library pages
    async fn list_purchases(&self, session: &Session) -> RemoteResult<Vec<PurchaseItem>>;

    /// Volumes of a purchased series, oldest first
    async fn list_series_volumes(
        &self,
        session: &Session,
        series: &PurchaseItem,
    ) -> RemoteResult<Vec<VolumeListing>>;

    async fn fetch_details(&self, session: &Session, details_url: &str)
    -> RemoteResult<VolumeDetails>;

    /// Short-lived download URL of a single page; never reuse it for another page
    async fn derive_page_url(
        &self,
        session: &Session,
        volume: &Volume,
        page: u32,
    ) -> RemoteResult<String>;

    async fn fetch_bytes(&self, url: &str) -> RemoteResult<Bytes>;
}
