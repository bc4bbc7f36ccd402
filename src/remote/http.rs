//! reqwest + scraper implementation of the storefront client

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use reqwest::header::{COOKIE, HeaderMap, LOCATION, SET_COOKIE};
use reqwest::{Client, StatusCode, redirect};
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;
use tracing::{debug, info, warn};
use url::Url;

use super::RemoteLibraryClient;
use crate::config::RemoteConfig;
use crate::errors::{RemoteError, RemoteResult};
use crate::models::{PurchaseItem, Session, Volume, VolumeDetails, VolumeListing};
use crate::utils::jitter::retry_delay;

macro_rules! selector {
    ($name:ident, $css:expr) => {
        static $name: LazyLock<Selector> = LazyLock::new(|| Selector::parse($css).unwrap());
    };
}

macro_rules! regex {
    ($name:ident, $regex:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($regex).unwrap());
    };
}

selector!(LOGIN_LINK_SELECTOR, "a.hd-btn--login[href]");
selector!(FORM_SELECTOR, "form");
selector!(FORM_INPUT_SELECTOR, "input[name]");
selector!(BOOK_LIST_SELECTOR, "ul.m-boxListBookProductLarge__list");
selector!(BOOK_BLOCK_SELECTOR, ".m-boxListBookProductBlock__wrap");
selector!(BOOK_LINK_SELECTOR, ".m-boxListBookProductBlock__item > [href]");
selector!(BOOK_TITLE_SELECTOR, ".m-boxListBookProductBlock__main__info__ttl > a[href]");
selector!(BOOK_THUMBNAIL_SELECTOR, ".m-boxListBookProductBlock__main__tmb img[src]");
selector!(
    PAGINATION_ITEM_SELECTOR,
    "ul.m-boxPagenation__list li.m-boxPagenation__list__item"
);
selector!(LINK_SELECTOR, "a[href]");
selector!(STORY_SELECTOR, "div.m-boxDetailProduct__info__story");
selector!(
    PRODUCT_INFO_SELECTOR,
    "div.m-boxDetailProductInfo dd.m-boxDetailProductInfo__list__description"
);
regex!(PAGE_COUNT_REGEX, r"^([0-9]+)ページ");
regex!(READER_CONTENTS_REGEX, r#""contents_url"\s*:\s*"([^"]+)""#);
regex!(READER_TOKEN_REGEX, r#""token"\s*:\s*"([^"]+)""#);

const MAX_LOGIN_REDIRECTS: usize = 5;
/// Index of the page-count entry among the product info descriptions
const PAGE_COUNT_FIELD: usize = 2;

/// Storefront client over plain HTTP
pub struct HttpLibraryClient {
    client: Client,
    /// Redirects are inspected by hand during login
    login_client: Client,
    config: RemoteConfig,
}

impl HttpLibraryClient {
    pub fn new(config: &RemoteConfig) -> RemoteResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        let login_client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .redirect(redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            login_client,
            config: config.clone(),
        })
    }

    fn map_transport(error: reqwest::Error, operation: &str, limit: std::time::Duration) -> RemoteError {
        if error.is_timeout() {
            RemoteError::timeout(operation, limit)
        } else {
            RemoteError::Transport(error)
        }
    }

    /// Login endpoint advertised on the storefront, falling back to the configured one
    async fn discover_login_url(&self) -> String {
        let fallback = self.config.login_url.clone();
        let response = match self.client.get(&self.config.store_url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(
                    "Storefront returned {} during login discovery, using configured login URL",
                    response.status()
                );
                return fallback;
            }
            Err(e) => {
                debug!("Login discovery failed, using configured login URL: {}", e);
                return fallback;
            }
        };

        let Ok(body) = response.text().await else {
            return fallback;
        };
        let base = Url::parse(&self.config.store_url).ok();
        let document = Html::parse_document(&body);
        document
            .select(&LOGIN_LINK_SELECTOR)
            .next()
            .and_then(|link| link.value().attr("href"))
            .and_then(|href| resolve_url(base.as_ref(), href))
            .unwrap_or(fallback)
    }

    /// GET an HTML page, retrying non-success statuses
    async fn get_listing_page(
        &self,
        session: &Session,
        url: &str,
        page: u32,
        what: &str,
    ) -> RemoteResult<String> {
        let attempts = self.config.max_listing_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = self
                .client
                .get(url)
                .query(&[("page", page)])
                .header(COOKIE, session.cookie_header())
                .send()
                .await;

            match result {
                Ok(response) if response.status() == StatusCode::OK => {
                    info!("Successfully requested page {} of {}", page, what);
                    return response
                        .text()
                        .await
                        .map_err(|e| Self::map_transport(e, what, self.config.request_timeout));
                }
                Ok(response) => {
                    warn!(
                        "Failed to obtain page {} of {} (status {}), attempt {} out of {}",
                        page,
                        what,
                        response.status(),
                        attempt,
                        attempts
                    );
                    last_error = Some(RemoteError::Http {
                        status: response.status().as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(e) => {
                    warn!(
                        "Failed to obtain page {} of {}: {}, attempt {} out of {}",
                        page, what, e, attempt, attempts
                    );
                    last_error = Some(Self::map_transport(e, what, self.config.request_timeout));
                }
            }

            if attempt < attempts {
                tokio::time::sleep(retry_delay(self.config.retry_backoff, attempt)).await;
            }
        }

        Err(match last_error {
            Some(RemoteError::Http { status, .. }) => {
                RemoteError::fetch(url, format!("page {page} of {what} returned {status}"))
            }
            Some(error) => error,
            None => RemoteError::fetch(url, format!("page {page} of {what} was not requested")),
        })
    }

    async fn get_authenticated(&self, session: &Session, url: &str) -> RemoteResult<String> {
        let response = self
            .client
            .get(url)
            .header(COOKIE, session.cookie_header())
            .send()
            .await
            .map_err(|e| Self::map_transport(e, url, self.config.request_timeout))?;

        if !response.status().is_success() {
            return Err(RemoteError::Http {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        response
            .text()
            .await
            .map_err(|e| Self::map_transport(e, url, self.config.request_timeout))
    }
}

#[async_trait]
impl RemoteLibraryClient for HttpLibraryClient {
    async fn authenticate(
        &self,
        email: &str,
        password: &str,
        fast_login: bool,
    ) -> RemoteResult<Session> {
        let login_url = if fast_login {
            self.config.login_url.clone()
        } else {
            self.discover_login_url().await
        };
        debug!("Logging in {} via {}", email, login_url);

        let mut cookies = Vec::new();
        let response = self
            .login_client
            .get(&login_url)
            .send()
            .await
            .map_err(|e| Self::map_transport(e, "login page", self.config.request_timeout))?;
        collect_cookies(response.headers(), &mut cookies);
        if !response.status().is_success() {
            return Err(RemoteError::Http {
                status: response.status().as_u16(),
                url: login_url,
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| Self::map_transport(e, "login page", self.config.request_timeout))?;

        let base = Url::parse(&login_url)
            .map_err(|e| RemoteError::parse("login url", e.to_string()))?;
        let form = parse_login_form(&body, &base)?;
        let mut fields = form.hidden_fields;
        fields.push(("login_id".to_string(), email.to_string()));
        fields.push(("password".to_string(), password.to_string()));

        let mut response = self
            .login_client
            .post(&form.action)
            .header(COOKIE, cookie_header(&cookies))
            .form(&fields)
            .send()
            .await
            .map_err(|e| Self::map_transport(e, "login", self.config.request_timeout))?;

        for _ in 0..MAX_LOGIN_REDIRECTS {
            collect_cookies(response.headers(), &mut cookies);
            if !response.status().is_redirection() {
                break;
            }
            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|href| resolve_url(Some(&base), href))
            else {
                break;
            };

            if location.contains(&self.config.login_redirect_marker) {
                info!("Obtained storefront session for {}", email);
                return Ok(Session::from_cookies(cookies));
            }

            response = self
                .login_client
                .get(&location)
                .header(COOKIE, cookie_header(&cookies))
                .send()
                .await
                .map_err(|e| Self::map_transport(e, "login", self.config.request_timeout))?;
        }

        Err(RemoteError::authentication(
            email,
            "redirect not happening, wrong email or password?",
        ))
    }

    async fn list_purchases(&self, session: &Session) -> RemoteResult<Vec<PurchaseItem>> {
        let base = Url::parse(&self.config.store_url)
            .map_err(|e| RemoteError::parse("store url", e.to_string()))?;
        let mut items = Vec::new();
        let mut page = 1;

        loop {
            let body = self
                .get_listing_page(session, &self.config.library_url, page, "purchased books")
                .await?;
            match parse_book_list(&body, &base) {
                Some(listings) if !listings.is_empty() => {
                    items.extend(listings.into_iter().map(|listing| PurchaseItem {
                        is_series: listing.url.contains("series"),
                        name: listing.name,
                        url: listing.url,
                        details_url: listing.details_url,
                        thumbnail_url: listing.thumbnail_url,
                    }));
                    page += 1;
                }
                _ => {
                    info!("Purchased book library ended at page {}", page);
                    break;
                }
            }
        }

        Ok(items)
    }

    async fn list_series_volumes(
        &self,
        session: &Session,
        series: &PurchaseItem,
    ) -> RemoteResult<Vec<VolumeListing>> {
        if !series.is_series {
            return Ok(vec![series.as_volume_listing()]);
        }

        let base = Url::parse(&self.config.store_url)
            .map_err(|e| RemoteError::parse("store url", e.to_string()))?;
        let mut volumes = Vec::new();
        let mut page = 1;

        loop {
            let body = self
                .get_listing_page(session, &series.url, page, "volumes of series")
                .await?;
            let listings = parse_book_list(&body, &base).ok_or_else(|| {
                RemoteError::parse(&series.url, "unable to obtain all the volumes in series")
            })?;
            volumes.extend(listings);

            if is_last_page(&body) {
                break;
            }
            page += 1;
        }

        volumes.reverse();
        Ok(volumes)
    }

    async fn fetch_details(
        &self,
        session: &Session,
        details_url: &str,
    ) -> RemoteResult<VolumeDetails> {
        let body = self.get_authenticated(session, details_url).await?;
        parse_details(&body).map_err(|e| match e {
            RemoteError::Parse { message, .. } => RemoteError::parse(details_url, message),
            other => other,
        })
    }

    async fn derive_page_url(
        &self,
        session: &Session,
        volume: &Volume,
        page: u32,
    ) -> RemoteResult<String> {
        let body = self.get_authenticated(session, &volume.url).await?;
        page_url_from_reader(&body, page)
    }

    async fn fetch_bytes(&self, url: &str) -> RemoteResult<Bytes> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::map_transport(e, "download", self.config.request_timeout))?;

        if !response.status().is_success() {
            return Err(RemoteError::Http {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        response
            .bytes()
            .await
            .map_err(|e| Self::map_transport(e, "download", self.config.request_timeout))
    }
}

#[derive(Debug, PartialEq, Eq)]
struct LoginForm {
    action: String,
    hidden_fields: Vec<(String, String)>,
}

fn resolve_url(base: Option<&Url>, href: &str) -> Option<String> {
    match base {
        Some(base) => base.join(href).ok().map(String::from),
        None => Url::parse(href).ok().map(String::from),
    }
}

fn collect_cookies(headers: &HeaderMap, jar: &mut Vec<(String, String)>) {
    for value in headers.get_all(SET_COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let pair = value.split(';').next().unwrap_or_default();
        let Some((name, value)) = pair.split_once('=') else {
            continue;
        };
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        jar.retain(|(existing, _)| existing != &name);
        jar.push((name, value));
    }
}

fn cookie_header(cookies: &[(String, String)]) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Form holding the `login_id` field, with its hidden inputs
fn parse_login_form(body: &str, base: &Url) -> RemoteResult<LoginForm> {
    let document = Html::parse_document(body);
    let form = document
        .select(&FORM_SELECTOR)
        .find(|form| {
            form.select(&FORM_INPUT_SELECTOR)
                .any(|input| input.value().attr("name") == Some("login_id"))
        })
        .ok_or_else(|| RemoteError::parse("login page", "login form not found"))?;

    let action = form
        .value()
        .attr("action")
        .and_then(|action| resolve_url(Some(base), action))
        .unwrap_or_else(|| base.to_string());

    let hidden_fields = form
        .select(&FORM_INPUT_SELECTOR)
        .filter(|input| input.value().attr("type") == Some("hidden"))
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            Some((
                name.to_string(),
                input.value().attr("value").unwrap_or_default().to_string(),
            ))
        })
        .collect();

    Ok(LoginForm {
        action,
        hidden_fields,
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Book entries of a library or series page; `None` once the list disappears.
/// Entries without a reader link are not purchased and are skipped.
fn parse_book_list(body: &str, base: &Url) -> Option<Vec<VolumeListing>> {
    let document = Html::parse_document(body);
    let list = document.select(&BOOK_LIST_SELECTOR).next()?;

    let listings = list
        .select(&BOOK_BLOCK_SELECTOR)
        .filter_map(|block| {
            let link = block
                .select(&BOOK_LINK_SELECTOR)
                .next()?
                .value()
                .attr("href")?;
            let title = block.select(&BOOK_TITLE_SELECTOR).next()?;
            let details = title.value().attr("href")?;
            let thumbnail = block
                .select(&BOOK_THUMBNAIL_SELECTOR)
                .next()
                .and_then(|img| img.value().attr("src"))
                .and_then(|src| resolve_url(Some(base), src));

            Some(VolumeListing {
                name: element_text(title),
                url: resolve_url(Some(base), link)?,
                details_url: resolve_url(Some(base), details)?,
                thumbnail_url: thumbnail,
            })
        })
        .collect();

    Some(listings)
}

/// The last pagination entry carries no link on the final page
fn is_last_page(body: &str) -> bool {
    let document = Html::parse_document(body);
    match document.select(&PAGINATION_ITEM_SELECTOR).last() {
        Some(item) => item.select(&LINK_SELECTOR).next().is_none(),
        None => true,
    }
}

fn parse_details(body: &str) -> RemoteResult<VolumeDetails> {
    let document = Html::parse_document(body);
    let description = document
        .select(&STORY_SELECTOR)
        .next()
        .map(element_text)
        .ok_or_else(|| RemoteError::parse("details", "description not found"))?;

    let page_field = document
        .select(&PRODUCT_INFO_SELECTOR)
        .nth(PAGE_COUNT_FIELD)
        .map(element_text)
        .ok_or_else(|| RemoteError::parse("details", "page count not found"))?;
    let pages = PAGE_COUNT_REGEX
        .captures(&page_field)
        .and_then(|captures| captures.get(1))
        .and_then(|count| count.as_str().parse::<u32>().ok())
        .ok_or_else(|| {
            RemoteError::parse("details", format!("unexpected page count '{page_field}'"))
        })?;

    Ok(VolumeDetails { description, pages })
}

fn page_url_from_reader(body: &str, page: u32) -> RemoteResult<String> {
    let capture = |regex: &Regex, name: &str| {
        regex
            .captures(body)
            .and_then(|captures| captures.get(1))
            .map(|value| value.as_str().replace("\\/", "/"))
            .ok_or_else(|| RemoteError::parse("reader", format!("{name} not found")))
    };
    let contents_url = capture(&READER_CONTENTS_REGEX, "contents_url")?;
    let token = capture(&READER_TOKEN_REGEX, "token")?;

    let mut url = Url::parse(&format!(
        "{}/{}.jpg",
        contents_url.trim_end_matches('/'),
        page
    ))
    .map_err(|e| RemoteError::parse("reader", e.to_string()))?;
    url.query_pairs_mut().append_pair("token", &token);
    Ok(url.into())
}
