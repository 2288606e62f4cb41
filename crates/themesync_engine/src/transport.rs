//! Remote store access.

use crate::config::{Configuration, ThemeId};
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, HttpRequest, Method};
use crate::local::Inventory;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use themesync_protocol::{
    Asset, AssetEnvelope, AssetKey, AssetListResponse, AssetUpload, Checksum, ThemeListResponse,
};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Header carrying the store access token.
pub const ACCESS_TOKEN_HEADER: &str = "X-Shopify-Access-Token";

/// Operations the engine needs from the remote store.
///
/// All methods are safe to repeat: writing identical content is a no-op
/// and deleting an absent asset succeeds.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Full inventory with checksums, across all pages.
    async fn list(&self) -> SyncResult<Inventory>;

    /// Content of one asset.
    async fn fetch(&self, key: &AssetKey) -> SyncResult<Vec<u8>>;

    /// Creates or overwrites one asset.
    async fn write(&self, key: &AssetKey, content: &[u8]) -> SyncResult<()>;

    /// Deletes one asset; already absent is success.
    async fn delete(&self, key: &AssetKey) -> SyncResult<()>;
}

/// [`RemoteClient`] over the theme assets REST API.
pub struct HttpTransport<C: HttpClient> {
    client: C,
    base_url: String,
    password: String,
    theme: ThemeId,
    resolved: OnceCell<u64>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport for the environment in `config`.
    pub fn new(config: &Configuration, client: C) -> Self {
        Self {
            client,
            base_url: config.base_url(),
            password: config.password.clone(),
            theme: config.theme_id,
            resolved: OnceCell::new(),
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Numeric id of the target theme, resolving `live` once.
    pub async fn theme_id(&self) -> SyncResult<u64> {
        match self.theme {
            ThemeId::Id(id) => Ok(id),
            ThemeId::Live => self
                .resolved
                .get_or_try_init(|| self.resolve_live())
                .await
                .copied(),
        }
    }

    async fn resolve_live(&self) -> SyncResult<u64> {
        let url = format!("{}/admin/themes.json", self.base_url);
        let response = self.send(HttpRequest::new(Method::Get, url)).await?;
        let themes: ThemeListResponse = decode(&response.body)?;
        let main = themes
            .main_theme()
            .ok_or_else(|| SyncError::NotFound("store has no published theme".into()))?;
        info!(theme_id = main.id, name = %main.name, "resolved live theme");
        Ok(main.id)
    }

    async fn assets_url(&self) -> SyncResult<String> {
        Ok(format!(
            "{}/admin/themes/{}/assets.json",
            self.base_url,
            self.theme_id().await?
        ))
    }

    async fn asset_url(&self, key: &AssetKey) -> SyncResult<String> {
        let base = self.assets_url().await?;
        let url = Url::parse_with_params(&base, &[("asset[key]", key.as_str())])
            .map_err(|e| SyncError::config(format!("invalid store url {}: {}", base, e)))?;
        Ok(url.to_string())
    }

    async fn send(&self, request: HttpRequest) -> SyncResult<crate::http::HttpResponse> {
        let request = request
            .with_header(ACCESS_TOKEN_HEADER, self.password.as_str())
            .with_header("Accept", "application/json");
        self.client.send(request).await?.error_for_status()
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> SyncResult<T> {
    serde_json::from_slice(body).map_err(|e| SyncError::Protocol(e.into()))
}

#[async_trait]
impl<C: HttpClient> RemoteClient for HttpTransport<C> {
    async fn list(&self) -> SyncResult<Inventory> {
        let mut inventory = Inventory::new();
        let mut seen = HashSet::new();
        let mut next = Some(self.assets_url().await?);

        while let Some(url) = next.take() {
            if !seen.insert(url.clone()) {
                return Err(SyncError::transport_fatal(format!(
                    "pagination loop at {}",
                    url
                )));
            }
            let response = self.send(HttpRequest::new(Method::Get, url)).await?;
            next = response.next_page();
            let page: AssetListResponse = decode(&response.body)?;
            for record in &page.assets {
                let asset = record.to_asset()?;
                inventory.insert(asset.key.clone(), asset);
            }
        }

        debug!(assets = inventory.len(), pages = seen.len(), "remote inventory listed");
        Ok(inventory)
    }

    async fn fetch(&self, key: &AssetKey) -> SyncResult<Vec<u8>> {
        let url = self.asset_url(key).await?;
        let response = self.send(HttpRequest::new(Method::Get, url)).await?;
        let envelope: AssetEnvelope = decode(&response.body)?;
        Ok(envelope.asset.content()?)
    }

    async fn write(&self, key: &AssetKey, content: &[u8]) -> SyncResult<()> {
        let url = self.assets_url().await?;
        let body = AssetUpload::new(key, content).to_json()?;
        self.send(HttpRequest::new(Method::Put, url).with_json(body))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &AssetKey) -> SyncResult<()> {
        let url = self.asset_url(key).await?;
        match self.send(HttpRequest::new(Method::Delete, url)).await {
            Ok(_) => Ok(()),
            Err(SyncError::NotFound(_)) => {
                debug!(key = %key, "already absent");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl<R: RemoteClient + ?Sized> RemoteClient for Arc<R> {
    async fn list(&self) -> SyncResult<Inventory> {
        (**self).list().await
    }

    async fn fetch(&self, key: &AssetKey) -> SyncResult<Vec<u8>> {
        (**self).fetch(key).await
    }

    async fn write(&self, key: &AssetKey, content: &[u8]) -> SyncResult<()> {
        (**self).write(key, content).await
    }

    async fn delete(&self, key: &AssetKey) -> SyncResult<()> {
        (**self).delete(key).await
    }
}

/// Which [`RemoteClient`] method a recorded call went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteMethod {
    /// `list`
    List,
    /// `fetch`
    Fetch,
    /// `write`
    Write,
    /// `delete`
    Delete,
}

/// One call observed by [`MemoryRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    /// Method called.
    pub method: RemoteMethod,
    /// Key argument, `None` for `list`.
    pub key: Option<AssetKey>,
}

/// An in-memory store for testing.
///
/// Records every call, replays scripted failures and tracks how many calls
/// for the same key overlap.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    assets: Mutex<BTreeMap<AssetKey, Vec<u8>>>,
    failures: Mutex<HashMap<(RemoteMethod, Option<AssetKey>), VecDeque<SyncError>>>,
    calls: Mutex<Vec<RemoteCall>>,
    active: Mutex<HashMap<AssetKey, usize>>,
    max_overlap: AtomicUsize,
    latency: Mutex<Duration>,
}

impl MemoryRemote {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an asset.
    pub fn with_asset(self, key: &str, content: impl Into<Vec<u8>>) -> Self {
        if let Ok(key) = AssetKey::new(key) {
            self.insert(key, content);
        }
        self
    }

    /// Adds or replaces an asset.
    pub fn insert(&self, key: AssetKey, content: impl Into<Vec<u8>>) {
        self.assets.lock().insert(key, content.into());
    }

    /// Content of an asset.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let key = AssetKey::new(key).ok()?;
        self.assets.lock().get(&key).cloned()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<AssetKey> {
        self.assets.lock().keys().cloned().collect()
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Makes the next call to `method` for `key` fail with `error`.
    /// Failures queue up; `key` is `None` for `list`.
    pub fn fail_next(&self, method: RemoteMethod, key: Option<&str>, error: SyncError) {
        let key = key.and_then(|k| AssetKey::new(k).ok());
        self.failures
            .lock()
            .entry((method, key))
            .or_default()
            .push_back(error);
    }

    /// Every call made so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    /// Number of calls made to `method`.
    pub fn call_count(&self, method: RemoteMethod) -> usize {
        self.calls.lock().iter().filter(|c| c.method == method).count()
    }

    /// Highest number of overlapping calls observed for a single key.
    pub fn max_concurrent_per_key(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }

    async fn enter(&self, method: RemoteMethod, key: Option<&AssetKey>) -> SyncResult<Option<KeyGuard<'_>>> {
        self.calls.lock().push(RemoteCall {
            method,
            key: key.cloned(),
        });

        let guard = key.map(|key| {
            let mut active = self.active.lock();
            let count = active.entry(key.clone()).or_insert(0);
            *count += 1;
            self.max_overlap.fetch_max(*count, Ordering::SeqCst);
            KeyGuard {
                remote: self,
                key: key.clone(),
            }
        });

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .failures
            .lock()
            .get_mut(&(method, key.cloned()))
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(error) => Err(error),
            None => Ok(guard),
        }
    }
}

struct KeyGuard<'a> {
    remote: &'a MemoryRemote,
    key: AssetKey,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.remote.active.lock();
        if let Some(count) = active.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.key);
            }
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn list(&self) -> SyncResult<Inventory> {
        self.enter(RemoteMethod::List, None).await?;
        Ok(self
            .assets
            .lock()
            .iter()
            .map(|(key, content)| {
                let asset = Asset::remote(
                    key.clone(),
                    Some(Checksum::of(content)),
                    content.len() as u64,
                    None,
                );
                (key.clone(), asset)
            })
            .collect())
    }

    async fn fetch(&self, key: &AssetKey) -> SyncResult<Vec<u8>> {
        let _guard = self.enter(RemoteMethod::Fetch, Some(key)).await?;
        self.assets
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(key.to_string()))
    }

    async fn write(&self, key: &AssetKey, content: &[u8]) -> SyncResult<()> {
        let _guard = self.enter(RemoteMethod::Write, Some(key)).await?;
        self.assets.lock().insert(key.clone(), content.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &AssetKey) -> SyncResult<()> {
        let _guard = self.enter(RemoteMethod::Delete, Some(key)).await?;
        self.assets.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpResponse, LoopbackClient, LoopbackServer};
    use themesync_protocol::AssetRecord;

    fn key(s: &str) -> AssetKey {
        AssetKey::new(s).unwrap()
    }

    fn config(theme: ThemeId) -> Configuration {
        Configuration::new("test", "secret", "shop.myshopify.com", theme, "/tmp/theme")
            .with_endpoint("http://loopback")
    }

    /// Two pages of assets, one published theme, strict auth.
    struct Store {
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl Store {
        fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    fn record(key: &str, content: &str) -> AssetRecord {
        AssetRecord {
            key: key.to_string(),
            checksum: Some(Checksum::of(content.as_bytes()).to_string()),
            size: Some(content.len() as u64),
            updated_at: None,
            content_type: None,
            value: None,
            attachment: None,
        }
    }

    impl LoopbackServer for Store {
        fn handle(&self, request: &HttpRequest) -> HttpResponse {
            self.requests.lock().push(request.clone());
            if request.header(ACCESS_TOKEN_HEADER) != Some("secret") {
                return HttpResponse::json(401, r#"{"errors":"[API] Invalid API key"}"#);
            }
            match (request.method, request.path().as_str()) {
                (Method::Get, "/admin/themes.json") => HttpResponse::json(
                    200,
                    r#"{"themes":[{"id":7,"name":"Draft","role":"unpublished"},{"id":9,"name":"Dawn","role":"main"}]}"#,
                ),
                (Method::Get, "/admin/themes/9/assets.json") => {
                    match (request.query("asset[key]"), request.query("page_info")) {
                        (Some(k), _) if k == "assets/logo.png" => HttpResponse::json(
                            200,
                            r#"{"asset":{"key":"assets/logo.png","attachment":"iVBORw=="}}"#,
                        ),
                        (Some(_), _) => HttpResponse::json(404, r#"{"errors":"Not Found"}"#),
                        (None, None) => {
                            let page = AssetListResponse {
                                assets: vec![record("layout/theme.liquid", "A")],
                            };
                            HttpResponse::json(200, serde_json::to_vec(&page).unwrap()).with_header(
                                "Link",
                                "<http://loopback/admin/themes/9/assets.json?page_info=2>; rel=\"next\"",
                            )
                        }
                        (None, Some(_)) => {
                            let page = AssetListResponse {
                                assets: vec![record("assets/app.js", "B")],
                            };
                            HttpResponse::json(200, serde_json::to_vec(&page).unwrap())
                        }
                    }
                }
                (Method::Put, "/admin/themes/9/assets.json") => {
                    let body = request.body.clone().unwrap_or_default();
                    HttpResponse::json(200, body)
                }
                (Method::Delete, "/admin/themes/9/assets.json") => {
                    HttpResponse::json(404, r#"{"errors":"Not Found"}"#)
                }
                _ => HttpResponse::json(404, r#"{"errors":"Not Found"}"#),
            }
        }
    }

    #[tokio::test]
    async fn live_theme_resolved_once() {
        let client = Arc::new(LoopbackClient::new(Store::new()));
        let transport = HttpTransport::new(&config(ThemeId::Live), client.clone());

        assert_eq!(transport.theme_id().await.unwrap(), 9);
        assert_eq!(transport.theme_id().await.unwrap(), 9);
        let theme_lists = client
            .server()
            .requests
            .lock()
            .iter()
            .filter(|r| r.path() == "/admin/themes.json")
            .count();
        assert_eq!(theme_lists, 1);
    }

    #[tokio::test]
    async fn list_follows_pagination() {
        let transport = HttpTransport::new(&config(ThemeId::Id(9)), LoopbackClient::new(Store::new()));
        let inventory = transport.list().await.unwrap();
        let keys: Vec<&str> = inventory.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["assets/app.js", "layout/theme.liquid"]);
        assert_eq!(
            inventory[&key("assets/app.js")].checksum,
            Some(Checksum::of(b"B"))
        );
    }

    #[tokio::test]
    async fn fetch_write_delete() {
        let client = Arc::new(LoopbackClient::new(Store::new()));
        let transport = HttpTransport::new(&config(ThemeId::Id(9)), client.clone());

        let content = transport.fetch(&key("assets/logo.png")).await.unwrap();
        assert_eq!(content, vec![0x89, 0x50, 0x4e, 0x47]);
        assert!(matches!(
            transport.fetch(&key("assets/none.png")).await,
            Err(SyncError::NotFound(_))
        ));

        transport
            .write(&key("snippets/a.liquid"), b"{{ 'a' }}")
            .await
            .unwrap();
        let put = client.server().requests.lock().last().cloned().unwrap();
        assert_eq!(put.method, Method::Put);
        assert_eq!(put.header("Content-Type"), Some("application/json"));
        let upload: AssetUpload = serde_json::from_slice(put.body.as_deref().unwrap()).unwrap();
        assert_eq!(upload.asset.key, "snippets/a.liquid");
        assert_eq!(upload.asset.value.as_deref(), Some("{{ 'a' }}"));

        // 404 on delete is success.
        transport.delete(&key("snippets/gone.liquid")).await.unwrap();
        let delete = client.server().requests.lock().last().cloned().unwrap();
        assert_eq!(delete.query("asset[key]").as_deref(), Some("snippets/gone.liquid"));
    }

    #[tokio::test]
    async fn bad_credentials_are_auth_errors() {
        let mut config = config(ThemeId::Id(9));
        config.password = "wrong".into();
        let transport = HttpTransport::new(&config, LoopbackClient::new(Store::new()));
        let err = transport.list().await.unwrap_err();
        assert!(err.is_auth());
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn memory_remote_scripted_failures() {
        let remote = MemoryRemote::new().with_asset("a.liquid", "A");
        remote.fail_next(RemoteMethod::Write, Some("a.liquid"), SyncError::Timeout);

        assert!(matches!(
            remote.write(&key("a.liquid"), b"B").await,
            Err(SyncError::Timeout)
        ));
        remote.write(&key("a.liquid"), b"B").await.unwrap();
        assert_eq!(remote.get("a.liquid"), Some(b"B".to_vec()));
        assert_eq!(remote.call_count(RemoteMethod::Write), 2);

        remote.delete(&key("a.liquid")).await.unwrap();
        remote.delete(&key("a.liquid")).await.unwrap();
        assert!(remote.list().await.unwrap().is_empty());
        assert_eq!(remote.max_concurrent_per_key(), 1);
    }
}
