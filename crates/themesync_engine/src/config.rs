//! Configuration for sync sessions.
//!
//! Settings arrive in layers (config file, process environment, command
//! flags). Each layer is a [`ConfigLayer`] of optional fields; layers are
//! overlaid in precedence order and then compiled into one validated,
//! immutable [`Configuration`] per environment.

use crate::error::{SyncError, SyncResult};
use rand::Rng;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Domain suffix every store domain must carry.
pub const STORE_DOMAIN_SUFFIX: &str = ".myshopify.com";

/// Name used when no environment is given.
pub const DEFAULT_ENVIRONMENT: &str = "development";

/// Prefix of the process environment variables read by [`ConfigLayer::from_vars`].
pub const ENV_PREFIX: &str = "THEMESYNC_";

/// Target theme of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThemeId {
    /// The store's published theme, resolved at session start.
    Live,
    /// A specific theme.
    Id(u64),
}

impl ThemeId {
    /// Returns true for the `live` sentinel.
    pub fn is_live(&self) -> bool {
        matches!(self, ThemeId::Live)
    }
}

impl FromStr for ThemeId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("live") {
            return Ok(ThemeId::Live);
        }
        s.parse::<u64>()
            .map(ThemeId::Id)
            .map_err(|_| SyncError::config("invalid theme_id"))
    }
}

impl fmt::Display for ThemeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThemeId::Live => f.write_str("live"),
            ThemeId::Id(id) => write!(f, "{}", id),
        }
    }
}

/// One layer of optional settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigLayer {
    /// Store access token.
    pub password: Option<String>,
    /// Numeric theme id or `live`.
    pub theme_id: Option<String>,
    /// Store domain.
    pub domain: Option<String>,
    /// Local theme directory.
    pub directory: Option<PathBuf>,
    /// Proxy URL for all requests.
    pub proxy: Option<String>,
    /// Per-request timeout.
    pub timeout: Option<Duration>,
    /// Single ignore entries.
    pub ignored_files: Option<Vec<String>>,
    /// Files containing ignore entries, one per line.
    pub ignores: Option<Vec<PathBuf>>,
    /// Disables configured ignore rules.
    pub no_ignore: Option<bool>,
    /// Number of concurrent workers.
    pub concurrency: Option<usize>,
}

impl ConfigLayer {
    /// Creates an empty layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a layer from `THEMESYNC_*` variables.
    ///
    /// List variables are comma separated; `THEMESYNC_TIMEOUT` is a number
    /// of seconds.
    pub fn from_vars<I, K, V>(vars: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut layer = Self::default();
        for (name, value) in vars {
            let Some(name) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            if value.is_empty() {
                continue;
            }
            match name {
                "PASSWORD" => layer.password = Some(value.to_string()),
                "THEME_ID" => layer.theme_id = Some(value.to_string()),
                "DOMAIN" => layer.domain = Some(value.to_string()),
                "DIRECTORY" => layer.directory = Some(PathBuf::from(value)),
                "PROXY" => layer.proxy = Some(value.to_string()),
                "TIMEOUT" => {
                    let secs: f64 = value.parse().map_err(|_| {
                        SyncError::config(format!("invalid {}TIMEOUT {:?}", ENV_PREFIX, value))
                    })?;
                    if !secs.is_finite() || secs < 0.0 {
                        return Err(SyncError::config(format!(
                            "invalid {}TIMEOUT {:?}",
                            ENV_PREFIX, value
                        )));
                    }
                    layer.timeout = Some(Duration::from_secs_f64(secs));
                }
                "IGNORE_FILES" => layer.ignored_files = Some(split_list(value)),
                "IGNORES" => {
                    layer.ignores = Some(split_list(value).into_iter().map(PathBuf::from).collect())
                }
                "NO_IGNORE" => layer.no_ignore = Some(matches!(value, "1" | "true" | "yes")),
                "CONCURRENCY" => {
                    let workers = value.parse().map_err(|_| {
                        SyncError::config(format!("invalid {}CONCURRENCY {:?}", ENV_PREFIX, value))
                    })?;
                    layer.concurrency = Some(workers);
                }
                _ => {}
            }
        }
        Ok(layer)
    }

    /// Reads a layer from the current process environment.
    pub fn from_env() -> SyncResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Returns this layer with every field set in `other` replaced.
    pub fn overlay(self, other: ConfigLayer) -> Self {
        Self {
            password: other.password.or(self.password),
            theme_id: other.theme_id.or(self.theme_id),
            domain: other.domain.or(self.domain),
            directory: other.directory.or(self.directory),
            proxy: other.proxy.or(self.proxy),
            timeout: other.timeout.or(self.timeout),
            ignored_files: other.ignored_files.or(self.ignored_files),
            ignores: other.ignores.or(self.ignores),
            no_ignore: other.no_ignore.or(self.no_ignore),
            concurrency: other.concurrency.or(self.concurrency),
        }
    }

    /// Overlays file, environment and flag layers, lowest precedence first.
    pub fn resolve(file: ConfigLayer, env: ConfigLayer, flags: ConfigLayer) -> Self {
        file.overlay(env).overlay(flags)
    }

    /// Validates this layer and produces the configuration for `environment`.
    ///
    /// All validation problems are reported together.
    pub fn compile(self, environment: &str) -> SyncResult<Configuration> {
        let mut problems = Vec::new();

        let password = non_empty(self.password);
        if password.is_none() {
            problems.push("missing password".to_string());
        }

        let domain = non_empty(self.domain);
        match &domain {
            None => problems.push("missing store domain".to_string()),
            Some(d) if !is_store_domain(d) => problems.push("invalid store domain".to_string()),
            Some(_) => {}
        }

        let theme_id = match non_empty(self.theme_id) {
            None => {
                problems.push("missing theme_id".to_string());
                None
            }
            Some(raw) => match raw.parse::<ThemeId>() {
                Ok(id) => Some(id),
                Err(_) => {
                    problems.push("invalid theme_id".to_string());
                    None
                }
            },
        };

        let directory = match resolve_directory(self.directory.as_deref()) {
            Ok(dir) => Some(dir),
            Err(problem) => {
                problems.push(problem);
                None
            }
        };

        let (Some(password), Some(domain), Some(theme_id), Some(directory), true) =
            (password, domain, theme_id, directory, problems.is_empty())
        else {
            return Err(SyncError::Config(problems.join(", ")));
        };

        let ignores = self
            .ignores
            .unwrap_or_default()
            .into_iter()
            .map(|path| {
                if path.is_absolute() {
                    path
                } else {
                    directory.join(path)
                }
            })
            .collect();

        let mut config = Configuration::new(environment, password, domain, theme_id, directory)
            .with_ignored_files(self.ignored_files.unwrap_or_default())
            .with_ignores(ignores)
            .with_no_ignore(self.no_ignore.unwrap_or(false));
        if let Some(proxy) = non_empty(self.proxy) {
            config = config.with_proxy(proxy);
        }
        if let Some(timeout) = self.timeout.filter(|t| !t.is_zero()) {
            config = config.with_timeout(timeout);
        }
        if let Some(workers) = self.concurrency.filter(|n| *n > 0) {
            let pool = config.pool.clone().with_concurrency(workers);
            config = config.with_pool(pool);
        }
        Ok(config)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_store_domain(domain: &str) -> bool {
    domain
        .strip_suffix(STORE_DOMAIN_SUFFIX)
        .map(|name| !name.is_empty() && !name.contains('/'))
        .unwrap_or(false)
}

/// Resolves the theme directory through symlinks.
fn resolve_directory(directory: Option<&Path>) -> Result<PathBuf, String> {
    let directory = directory.unwrap_or_else(|| Path::new("."));
    let resolved = std::fs::canonicalize(directory).map_err(|e| {
        format!(
            "directory {} cannot be resolved: {}",
            directory.display(),
            e
        )
    })?;
    if !resolved.is_dir() {
        return Err(format!("{} is not a directory", resolved.display()));
    }
    Ok(resolved)
}

/// Validated settings for one environment.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Environment name.
    pub environment: String,
    /// Store access token.
    pub password: String,
    /// Store domain.
    pub domain: String,
    /// Target theme.
    pub theme_id: ThemeId,
    /// Canonical local theme directory.
    pub directory: PathBuf,
    /// Proxy URL.
    pub proxy: Option<String>,
    /// Per-request timeout, also bounding rate-limit waits and shutdown.
    pub timeout: Duration,
    /// Single ignore entries.
    pub ignored_files: Vec<String>,
    /// Ignore files.
    pub ignores: Vec<PathBuf>,
    /// Disables configured ignore rules.
    pub no_ignore: bool,
    /// Retry policy for API calls.
    pub retry: RetryConfig,
    /// Client-side request budget; `None` disables limiting.
    pub rate_limit: Option<RateLimitConfig>,
    /// Worker pool settings.
    pub pool: PoolConfig,
    /// Window in which bursts of events for one key are coalesced.
    pub debounce: Duration,
    /// Stat interval when native notifications are unavailable.
    pub poll_interval: Duration,
    /// Where last-synced checksums are kept.
    pub ledger_path: PathBuf,
    /// Base URL override, `https://{domain}` when unset.
    pub endpoint: Option<String>,
}

impl Configuration {
    /// Creates a configuration with defaults for everything but the
    /// required fields.
    ///
    /// No validation is performed; use [`ConfigLayer::compile`] for input
    /// coming from users.
    pub fn new(
        environment: impl Into<String>,
        password: impl Into<String>,
        domain: impl Into<String>,
        theme_id: ThemeId,
        directory: impl Into<PathBuf>,
    ) -> Self {
        let environment = environment.into();
        let directory = directory.into();
        let ledger_path = default_ledger_path(&directory, &environment);
        Self {
            environment,
            password: password.into(),
            domain: domain.into(),
            theme_id,
            directory,
            proxy: None,
            timeout: Duration::from_secs(30),
            ignored_files: Vec::new(),
            ignores: Vec::new(),
            no_ignore: false,
            retry: RetryConfig::default(),
            rate_limit: Some(RateLimitConfig::default()),
            pool: PoolConfig::default(),
            debounce: Duration::from_millis(400),
            poll_interval: Duration::from_secs(1),
            ledger_path,
            endpoint: None,
        }
    }

    /// Returns true if the target is the published theme.
    pub fn is_live(&self) -> bool {
        self.theme_id.is_live()
    }

    /// Base URL of the store API.
    pub fn base_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}", self.domain),
        }
    }

    /// Sets the proxy URL.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the single ignore entries.
    pub fn with_ignored_files(mut self, entries: Vec<String>) -> Self {
        self.ignored_files = entries;
        self
    }

    /// Sets the ignore files.
    pub fn with_ignores(mut self, files: Vec<PathBuf>) -> Self {
        self.ignores = files;
        self
    }

    /// Enables or disables configured ignore rules.
    pub fn with_no_ignore(mut self, no_ignore: bool) -> Self {
        self.no_ignore = no_ignore;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the rate limit.
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Disables client-side rate limiting.
    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit = None;
        self
    }

    /// Sets the worker pool configuration.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Sets the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Sets the polling interval used when native watching is unavailable.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the ledger location.
    pub fn with_ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger_path = path.into();
        self
    }

    /// Points the API at another base URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Directory under the theme root holding per-environment ledgers.
pub const LEDGER_DIR: &str = ".themesync";

fn default_ledger_path(directory: &Path, environment: &str) -> PathBuf {
    directory
        .join(LEDGER_DIR)
        .join(format!("{}.json", environment))
}

/// Bounded exponential backoff for transient request failures.
///
/// The wait after the `n`th consecutive failure is
/// `base_delay * factor^(n-1)`, capped at `ceiling`. When the store sends
/// `Retry-After`, that hint is used instead unless `honor_retry_after` is off.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Calls per request, the first one included.
    pub max_attempts: u32,
    /// Wait after the first failure.
    pub base_delay: Duration,
    /// Upper bound on a computed wait.
    pub ceiling: Duration,
    /// Growth between consecutive waits, at least 1.
    pub factor: f64,
    /// Stretch each computed wait by a random 0 to 25%.
    pub jitter: bool,
    /// Prefer the store's `Retry-After` over the computed wait.
    pub honor_retry_after: bool,
}

impl RetryConfig {
    /// `max_attempts` calls, waiting 500 ms, 1 s, 2 s ... up to 30 s.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(500),
            ceiling: Duration::from_secs(30),
            factor: 2.0,
            jitter: true,
            honor_retry_after: true,
        }
    }

    /// One call, never retried.
    pub fn single_attempt() -> Self {
        Self::new(1)
    }

    /// Sets the wait after the first failure.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Caps computed waits.
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Sets the growth factor; values below 1 are raised to 1.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = if factor.is_finite() { factor.max(1.0) } else { 1.0 };
        self
    }

    /// Turns jitter on or off.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Turns `Retry-After` handling on or off.
    pub fn with_retry_after(mut self, honor: bool) -> Self {
        self.honor_retry_after = honor;
        self
    }

    /// Returns true if another call is allowed after `calls` calls.
    pub fn allows_another(&self, calls: u32) -> bool {
        calls < self.max_attempts.max(1)
    }

    /// Computed wait after `failures` consecutive failures (`failures >= 1`).
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let grown = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        // f64::min discards NaN, so an overflowed product falls back to the ceiling.
        let mut secs = grown.min(self.ceiling.as_secs_f64());
        if self.jitter {
            secs *= rand::thread_rng().gen_range(1.0..1.25);
        }
        Duration::from_secs_f64(secs)
    }

    /// Wait before the next call, given the failure count and the store's hint.
    pub fn wait_after(&self, failures: u32, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) if self.honor_retry_after => hint,
            _ => self.backoff(failures),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}

/// Token bucket parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum burst.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_second: f64,
}

impl RateLimitConfig {
    /// Creates a bucket of `capacity` tokens refilled at `refill_per_second`.
    pub fn new(capacity: u32, refill_per_second: f64) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_per_second,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(40, 2.0)
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Operations executing at once.
    pub concurrency: usize,
    /// Operations admitted before producers block.
    pub queue_capacity: usize,
    /// Consecutive authentication failures that abort the session.
    pub auth_failure_cutoff: u32,
}

impl PoolConfig {
    /// Sets the number of workers.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Sets the authentication failure cutoff.
    pub fn with_auth_failure_cutoff(mut self, cutoff: u32) -> Self {
        self.auth_failure_cutoff = cutoff.max(1);
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            queue_capacity: 512,
            auth_failure_cutoff: 3,
        }
    }
}
