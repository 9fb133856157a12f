/// Process-level configuration: endpoints, wallet, reconnect and trade API settings

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use std::str::FromStr;
use url::Url;

use super::{parse_var, read_var, require_var, ConfigError, Settings};
use std::collections::HashMap;
use crate::core::constants::DEFAULT_LAUNCH_PROGRAM;
use crate::ingest::websocket::ReconnectPolicy;

const ENV_FILE: &str = ".env";

/// Where trade transactions are requested from
#[derive(Debug, Clone, PartialEq)]
pub struct TradeApiConfig {
    pub url: String,
    pub pool: String,
    pub slippage_percent: f64,
}

impl Default for TradeApiConfig {
    fn default() -> Self {
        Self {
            url: "https://pumpportal.fun/api/trade-local".to_string(),
            pool: "auto".to_string(),
            slippage_percent: 10.0,
        }
    }
}

#[derive(Clone)]
pub struct Environment {
    pub http_rpc_url: String,
    pub ws_rpc_url: String,
    pub keypair: Arc<Keypair>,
    pub launch_program: Pubkey,
    pub reconnect: ReconnectPolicy,
    /// Position polling interval, the staleness bound on observed prices
    pub poll_interval: Duration,
    pub trade_api: TradeApiConfig,
    pub settings: Settings,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("http_rpc_url", &self.http_rpc_url)
            .field("ws_rpc_url", &self.ws_rpc_url)
            .field("wallet", &self.keypair.pubkey())
            .field("launch_program", &self.launch_program)
            .field("reconnect", &self.reconnect)
            .field("poll_interval", &self.poll_interval)
            .field("trade_api", &self.trade_api)
            .field("settings", &self.settings)
            .finish()
    }
}

impl Environment {
    /// Builds the configuration from the process environment, falling back
    /// to `.env` in the working directory.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(Path::new(ENV_FILE), &|key: &str| std::env::var(key).ok())
    }

    /// Layers the dotenv-format file at `path` under `process`: a variable
    /// set in `process` is never overridden. A missing file is not an error.
    pub fn load_with<F>(path: &Path, process: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = read_env_file(path)?;
        Self::from_lookup(&|key: &str| process(key).or_else(|| file.get(key).cloned()))
    }

    pub fn from_lookup<F>(lookup: &F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http_rpc_url = require_var(lookup, "HTTP_RPC_URL")?;
        validate_url("HTTP_RPC_URL", &http_rpc_url, &["http", "https"])?;
        let ws_rpc_url = require_var(lookup, "WS_RPC_URL")?;
        validate_url("WS_RPC_URL", &ws_rpc_url, &["ws", "wss"])?;

        let keypair = parse_keypair(&require_var(lookup, "PRIVATE_KEY")?)?;

        let launch_program = match read_var(lookup, "LAUNCH_PROGRAM") {
            Some(raw) => Pubkey::from_str(&raw)
                .map_err(|e| ConfigError::invalid("LAUNCH_PROGRAM", e.to_string()))?,
            None => Pubkey::from_str(DEFAULT_LAUNCH_PROGRAM)
                .map_err(|e| ConfigError::invalid("LAUNCH_PROGRAM", e.to_string()))?,
        };

        let defaults = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            delay: parse_var::<u64, _>(lookup, "RECONNECT_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.delay),
            jitter: parse_var::<u64, _>(lookup, "RECONNECT_JITTER_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.jitter),
            backoff_multiplier: parse_var(lookup, "RECONNECT_BACKOFF")?
                .unwrap_or(defaults.backoff_multiplier),
            ..defaults
        };
        if !(reconnect.backoff_multiplier.is_finite() && reconnect.backoff_multiplier >= 1.0) {
            return Err(ConfigError::invalid("RECONNECT_BACKOFF", "must be a finite number >= 1.0"));
        }

        let poll_interval = Duration::from_millis(parse_var(lookup, "POSITION_POLL_MS")?.unwrap_or(100));
        if poll_interval.is_zero() {
            return Err(ConfigError::invalid("POSITION_POLL_MS", "must be positive"));
        }

        let trade_defaults = TradeApiConfig::default();
        let trade_api = TradeApiConfig {
            url: read_var(lookup, "TRADE_API_URL").unwrap_or(trade_defaults.url),
            pool: read_var(lookup, "TRADE_POOL").unwrap_or(trade_defaults.pool),
            slippage_percent: parse_var(lookup, "SLIPPAGE_PERCENT")?
                .unwrap_or(trade_defaults.slippage_percent),
        };
        validate_url("TRADE_API_URL", &trade_api.url, &["http", "https"])?;
        if !(trade_api.slippage_percent.is_finite() && trade_api.slippage_percent >= 0.0) {
            return Err(ConfigError::invalid("SLIPPAGE_PERCENT", "must be a finite, non-negative percent"));
        }

        Ok(Self {
            http_rpc_url,
            ws_rpc_url,
            keypair: Arc::new(keypair),
            launch_program,
            reconnect,
            poll_interval,
            trade_api,
            settings: Settings::from_lookup(lookup)?,
        })
    }

    pub fn wallet(&self) -> Pubkey {
        self.keypair.pubkey()
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let iter = match dotenv::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => return Ok(HashMap::new()),
        Err(e) => return Err(ConfigError::invalid(ENV_FILE, e.to_string())),
    };
    let mut vars = HashMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| ConfigError::invalid(ENV_FILE, e.to_string()))?;
        vars.insert(key, value);
    }
    Ok(vars)
}

fn validate_url(key: &'static str, raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::invalid(key, e.to_string()))?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::invalid(
            key,
            format!("scheme {:?} not one of {:?}", url.scheme(), schemes),
        ));
    }
    Ok(())
}

/// Parses a base58-encoded 64-byte keypair without panicking on bad input.
fn parse_keypair(raw: &str) -> Result<Keypair, ConfigError> {
    let bytes = bs58::decode(raw)
        .into_vec()
        .map_err(|_| ConfigError::invalid("PRIVATE_KEY", "not valid base58"))?;
    Keypair::from_bytes(&bytes)
        .map_err(|_| ConfigError::invalid("PRIVATE_KEY", "not a 64-byte ed25519 keypair"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_vars() -> HashMap<String, String> {
        let keypair = Keypair::new();
        let mut vars = HashMap::new();
        vars.insert("HTTP_RPC_URL".to_string(), "https://rpc.example.org".to_string());
        vars.insert("WS_RPC_URL".to_string(), "wss://rpc.example.org".to_string());
        vars.insert("PRIVATE_KEY".to_string(), keypair.to_base58_string());
        vars
    }

    fn load(vars: &HashMap<String, String>) -> Result<Environment, ConfigError> {
        Environment::from_lookup(&|key: &str| vars.get(key).cloned())
    }

    #[test]
    fn test_minimal_environment() {
        let env = load(&base_vars()).unwrap();
        assert_eq!(env.poll_interval, Duration::from_millis(100));
        assert_eq!(env.reconnect, ReconnectPolicy::default());
        assert_eq!(env.trade_api, TradeApiConfig::default());
        assert_eq!(env.launch_program.to_string(), DEFAULT_LAUNCH_PROGRAM);
        assert_eq!(env.settings, Settings::default());
    }

    #[test]
    fn test_missing_required() {
        for key in ["HTTP_RPC_URL", "WS_RPC_URL", "PRIVATE_KEY"] {
            let mut vars = base_vars();
            vars.remove(key);
            match load(&vars) {
                Err(ConfigError::Missing(missing)) => assert_eq!(missing, key),
                other => panic!("expected missing {}, got {:?}", key, other.map(|_| ())),
            }
        }
    }

    #[test]
    fn test_invalid_private_key() {
        let mut vars = base_vars();
        vars.insert("PRIVATE_KEY".to_string(), "0OIl".to_string());
        assert!(matches!(load(&vars), Err(ConfigError::Invalid { key: "PRIVATE_KEY", .. })));

        vars.insert("PRIVATE_KEY".to_string(), bs58::encode([1u8; 12]).into_string());
        assert!(matches!(load(&vars), Err(ConfigError::Invalid { key: "PRIVATE_KEY", .. })));
    }

    #[test]
    fn test_ws_url_scheme_checked() {
        let mut vars = base_vars();
        vars.insert("WS_RPC_URL".to_string(), "https://rpc.example.org".to_string());
        assert!(matches!(load(&vars), Err(ConfigError::Invalid { key: "WS_RPC_URL", .. })));
    }

    #[test]
    fn test_reconnect_overrides() {
        let mut vars = base_vars();
        vars.insert("RECONNECT_DELAY_MS".to_string(), "5000".to_string());
        vars.insert("RECONNECT_JITTER_MS".to_string(), "0".to_string());
        vars.insert("RECONNECT_BACKOFF".to_string(), "2".to_string());
        vars.insert("POSITION_POLL_MS".to_string(), "250".to_string());
        let env = load(&vars).unwrap();
        assert_eq!(env.reconnect.delay, Duration::from_secs(5));
        assert_eq!(env.reconnect.jitter, Duration::ZERO);
        assert_eq!(env.reconnect.backoff_multiplier, 2.0);
        assert_eq!(env.poll_interval, Duration::from_millis(250));

        vars.insert("RECONNECT_BACKOFF".to_string(), "0.5".to_string());
        assert!(load(&vars).is_err());
        vars.insert("RECONNECT_BACKOFF".to_string(), "NaN".to_string());
        assert!(matches!(load(&vars), Err(ConfigError::Invalid { key: "RECONNECT_BACKOFF", .. })));
    }

    #[test]
    fn test_env_file() {
        let vars = base_vars();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (key, value) in &vars {
            writeln!(file, "{}={}", key, value).unwrap();
        }
        writeln!(file, "TARGET_PROFIT=3").unwrap();
        writeln!(file, "MIN_BUYS_THRESHOLD=20").unwrap();
        file.flush().unwrap();

        let env = Environment::load_with(file.path(), &|_: &str| None).unwrap();
        assert_eq!(env.settings.target_profit, 3.0);
        assert_eq!(env.settings.min_buys_threshold, 20);
        assert_eq!(env.ws_rpc_url, "wss://rpc.example.org");
    }

    #[test]
    fn test_process_variables_win_over_env_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for (key, value) in &base_vars() {
            writeln!(file, "{}={}", key, value).unwrap();
        }
        writeln!(file, "TARGET_PROFIT=3").unwrap();
        writeln!(file, "MAX_LOSS=0.8").unwrap();
        file.flush().unwrap();

        let process: HashMap<String, String> = [("TARGET_PROFIT", "6"), ("WS_RPC_URL", "ws://127.0.0.1:8900")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let env = Environment::load_with(file.path(), &|key: &str| process.get(key).cloned()).unwrap();

        assert_eq!(env.settings.target_profit, 6.0);
        assert_eq!(env.settings.max_loss, 0.8);
        assert_eq!(env.ws_rpc_url, "ws://127.0.0.1:8900");
    }

    #[test]
    fn test_missing_env_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let vars = base_vars();
        let env = Environment::load_with(&dir.path().join(ENV_FILE), &|key: &str| vars.get(key).cloned()).unwrap();
        assert_eq!(env.http_rpc_url, "https://rpc.example.org");

        let err = Environment::load_with(&dir.path().join(ENV_FILE), &|_: &str| None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("HTTP_RPC_URL")));
    }

    #[test]
    fn test_debug_hides_private_key() {
        let vars = base_vars();
        let env = load(&vars).unwrap();
        let rendered = format!("{:?}", env);
        assert!(!rendered.contains(&vars["PRIVATE_KEY"]));
        assert!(rendered.contains(&env.wallet().to_string()));
    }
}
