//! Values exchanged with the remote storefront

use serde::{Deserialize, Serialize};
use std::fmt;

/// Entry of the purchased-items listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseItem {
    pub name: String,
    pub url: String,
    pub details_url: String,
    pub thumbnail_url: Option<String>,
    pub is_series: bool,
}

impl PurchaseItem {
    /// A standalone purchase is its own single volume
    pub fn as_volume_listing(&self) -> VolumeListing {
        VolumeListing {
            name: self.name.clone(),
            url: self.url.clone(),
            details_url: self.details_url.clone(),
            thumbnail_url: self.thumbnail_url.clone(),
        }
    }
}

/// Entry of a series' volume listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeListing {
    pub name: String,
    pub url: String,
    pub details_url: String,
    pub thumbnail_url: Option<String>,
}

/// Product details fetched the first time a volume is seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeDetails {
    pub description: String,
    pub pages: u32,
}

/// Authenticated storefront session, opaque to the scheduler
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    cookies: Vec<(String, String)>,
}

impl Session {
    pub fn from_cookies<I, K, V>(cookies: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            cookies: cookies
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value for a `Cookie` request header
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.cookies.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("Session").field("cookies", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_joins_pairs() {
        let session = Session::from_cookies([("a", "1"), ("b", "2")]);
        assert_eq!(session.cookie_header(), "a=1; b=2");
        assert!(!format!("{session:?}").contains('1'));
    }
}
