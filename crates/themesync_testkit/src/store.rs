//! In-process fake of the theme assets API.
//!
//! [`FakeStore`] implements [`LoopbackServer`], so wrapping it in a
//! `LoopbackClient` exercises the real HTTP transport and policy layers
//! without a network.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use themesync_engine::{HttpRequest, HttpResponse, LoopbackServer, Method, ACCESS_TOKEN_HEADER};
use themesync_protocol::{
    AssetEnvelope, AssetKey, AssetListResponse, AssetRecord, AssetUpload, Checksum,
    ThemeListResponse, ThemeRecord,
};

const THROTTLED: &str =
    "Exceeded 2 calls per second for api client. Reduce request rates to resume uninterrupted service.";

const INVALID_TOKEN: &str =
    "[API] Invalid API key or access token (unrecognized login or wrong password)";

#[derive(Default)]
struct StoreState {
    themes: Vec<ThemeRecord>,
    assets: BTreeMap<u64, BTreeMap<String, Vec<u8>>>,
    scripted: VecDeque<HttpResponse>,
    rejected: HashMap<String, (u16, String)>,
    requests: Vec<HttpRequest>,
}

/// A fake store holding themes and their assets in memory.
pub struct FakeStore {
    password: String,
    page_size: usize,
    state: Mutex<StoreState>,
}

impl FakeStore {
    /// Creates a store accepting `password`.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            page_size: 50,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Adds a theme; role `main` marks the published one.
    pub fn with_theme(self, id: u64, name: &str, role: &str) -> Self {
        {
            let mut state = self.state.lock();
            state.themes.push(ThemeRecord {
                id,
                name: name.to_string(),
                role: role.to_string(),
            });
            state.assets.entry(id).or_default();
        }
        self
    }

    /// Adds an asset to theme `theme`.
    pub fn with_asset(self, theme: u64, key: &str, content: impl AsRef<[u8]>) -> Self {
        self.put(theme, key, content);
        self
    }

    /// Sets how many assets one list page holds.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Stores an asset directly.
    pub fn put(&self, theme: u64, key: &str, content: impl AsRef<[u8]>) {
        self.state
            .lock()
            .assets
            .entry(theme)
            .or_default()
            .insert(key.to_string(), content.as_ref().to_vec());
    }

    /// Content of an asset.
    pub fn asset(&self, theme: u64, key: &str) -> Option<Vec<u8>> {
        self.state.lock().assets.get(&theme)?.get(key).cloned()
    }

    /// Keys of a theme, sorted.
    pub fn keys(&self, theme: u64) -> Vec<String> {
        self.state
            .lock()
            .assets
            .get(&theme)
            .map(|assets| assets.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Answers the next request with `response` instead of handling it.
    /// Scripted responses queue up.
    pub fn push_response(&self, response: HttpResponse) {
        self.state.lock().scripted.push_back(response);
    }

    /// Answers the next `count` requests with 429 and `Retry-After`.
    pub fn throttle(&self, count: usize, retry_after_secs: u64) {
        for _ in 0..count {
            self.push_response(
                error(429, THROTTLED).with_header("Retry-After", retry_after_secs.to_string()),
            );
        }
    }

    /// Makes every write or delete of `key` fail with `status`.
    pub fn reject(&self, key: &str, status: u16, message: &str) {
        self.state
            .lock()
            .rejected
            .insert(key.to_string(), (status, message.to_string()));
    }

    /// Every request received.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().requests.clone()
    }

    /// Number of requests with `method` whose path ends with `suffix`.
    pub fn request_count(&self, method: Method, suffix: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method == method && r.path().ends_with(suffix))
            .count()
    }

    fn handle_locked(&self, state: &mut StoreState, request: &HttpRequest) -> HttpResponse {
        if request.header(ACCESS_TOKEN_HEADER) != Some(self.password.as_str()) {
            return error(401, INVALID_TOKEN);
        }
        if let Some(response) = state.scripted.pop_front() {
            return response;
        }

        let path = request.path();
        if path == "/admin/themes.json" {
            return match request.method {
                Method::Get => json(
                    200,
                    &ThemeListResponse {
                        themes: state.themes.clone(),
                    },
                ),
                _ => error(405, "Method Not Allowed"),
            };
        }

        let Some(theme) = theme_from_path(&path) else {
            return error(404, "Not Found");
        };
        if !state.assets.contains_key(&theme) {
            return error(404, "Not Found");
        }

        match (request.method, request.query("asset[key]")) {
            (Method::Get, None) => self.list(state, theme, request),
            (Method::Get, Some(key)) => {
                match state.assets.get(&theme).and_then(|assets| assets.get(&key)) {
                    Some(content) => json(
                        200,
                        &AssetEnvelope {
                            asset: record(&key, content, true),
                        },
                    ),
                    None => error(404, "Not Found"),
                }
            }
            (Method::Put, _) => {
                let upload: AssetUpload = match request
                    .body
                    .as_deref()
                    .map(serde_json::from_slice::<AssetUpload>)
                    .transpose()
                {
                    Ok(Some(upload)) => upload,
                    _ => return error(400, "bad request body"),
                };
                if let Some((status, message)) = state.rejected.get(&upload.asset.key) {
                    return field_error(*status, message);
                }
                let Ok(content) = upload.content() else {
                    return field_error(422, "attachment is not valid base64");
                };
                let stored = record(&upload.asset.key, &content, false);
                state
                    .assets
                    .entry(theme)
                    .or_default()
                    .insert(upload.asset.key, content);
                json(200, &AssetEnvelope { asset: stored })
            }
            (Method::Delete, Some(key)) => {
                if let Some((status, message)) = state.rejected.get(&key) {
                    return field_error(*status, message);
                }
                match state.assets.entry(theme).or_default().remove(&key) {
                    Some(_) => {
                        let message = format!("{} was successfully deleted", key);
                        json(200, &serde_json::json!({ "message": message }))
                    }
                    None => error(404, "Not Found"),
                }
            }
            (Method::Delete, None) => error(400, "asset[key] is required"),
        }
    }

    fn list(&self, state: &StoreState, theme: u64, request: &HttpRequest) -> HttpResponse {
        let assets = state.assets.get(&theme).cloned().unwrap_or_default();
        let offset: usize = request
            .query("page_info")
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);

        let page: Vec<AssetRecord> = assets
            .iter()
            .skip(offset)
            .take(self.page_size)
            .map(|(key, content)| record(key, content, false))
            .collect();
        let next = offset + page.len();
        let response = json(200, &AssetListResponse { assets: page });
        if next < assets.len() {
            let origin = request.origin().unwrap_or_default();
            response.with_header(
                "Link",
                format!(
                    "<{}/admin/themes/{}/assets.json?page_info={}>; rel=\"next\"",
                    origin, theme, next
                ),
            )
        } else {
            response
        }
    }
}

impl LoopbackServer for FakeStore {
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let mut state = self.state.lock();
        state.requests.push(request.clone());
        self.handle_locked(&mut state, request)
    }
}

fn theme_from_path(path: &str) -> Option<u64> {
    path.strip_prefix("/admin/themes/")?
        .strip_suffix("/assets.json")?
        .parse()
        .ok()
}

fn record(key: &str, content: &[u8], with_content: bool) -> AssetRecord {
    let (value, attachment) = match AssetKey::new(key) {
        Ok(key) if with_content => {
            let body = AssetUpload::new(&key, content).asset;
            (body.value, body.attachment)
        }
        _ => (None, None),
    };
    AssetRecord {
        key: key.to_string(),
        checksum: Some(Checksum::of(content).to_string()),
        size: Some(content.len() as u64),
        updated_at: None,
        content_type: None,
        value,
        attachment,
    }
}

fn json<T: serde::Serialize>(status: u16, body: &T) -> HttpResponse {
    HttpResponse::json(status, serde_json::to_vec(body).unwrap_or_default())
}

fn error(status: u16, message: &str) -> HttpResponse {
    json(status, &serde_json::json!({ "errors": message }))
}

fn field_error(status: u16, message: &str) -> HttpResponse {
    json(status, &serde_json::json!({ "errors": { "asset": [message] } }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> HttpRequest {
        HttpRequest::new(Method::Get, url).with_header(ACCESS_TOKEN_HEADER, "pw")
    }

    #[test]
    fn pages_through_assets() {
        let store = FakeStore::new("pw")
            .with_theme(1, "Dawn", "main")
            .with_asset(1, "a.liquid", "A")
            .with_asset(1, "b.liquid", "B")
            .with_asset(1, "c.liquid", "C")
            .with_page_size(2);

        let first = store.handle(&get("http://s.test/admin/themes/1/assets.json"));
        assert_eq!(first.status, 200);
        let next = first.next_page().unwrap();
        assert_eq!(next, "http://s.test/admin/themes/1/assets.json?page_info=2");

        let second = store.handle(&get(&next));
        let page: AssetListResponse = serde_json::from_slice(&second.body).unwrap();
        assert_eq!(page.assets.len(), 1);
        assert_eq!(page.assets[0].key, "c.liquid");
        assert!(second.next_page().is_none());
    }

    #[test]
    fn rejects_bad_token_and_scripts_responses() {
        let store = FakeStore::new("pw").with_theme(1, "Dawn", "main");
        let denied = store.handle(&HttpRequest::new(
            Method::Get,
            "http://s.test/admin/themes.json",
        ));
        assert_eq!(denied.status, 401);

        store.throttle(1, 2);
        let throttled = store.handle(&get("http://s.test/admin/themes.json"));
        assert_eq!(throttled.status, 429);
        assert_eq!(throttled.header("Retry-After"), Some("2"));

        let themes = store.handle(&get("http://s.test/admin/themes.json"));
        assert_eq!(themes.status, 200);
        assert_eq!(store.request_count(Method::Get, "/admin/themes.json"), 3);
    }
}
