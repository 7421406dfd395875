use std::env;
use std::path::PathBuf;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Providers
    pub maps_api_key: String,
    pub text_llm_api_key: String,
    pub vision_llm_api_key: String,
    /// Optional web-search provider for social discovery gaps.
    pub search_api_key: String,

    // Browser
    pub browserless_url: String,
    pub browserless_token: Option<String>,
    pub browser_pool_size: u32,

    // Persistence
    pub database_url: String,
    pub backup_root: PathBuf,

    // Prompts and costs
    pub prompts_dir: PathBuf,
    pub cost_table_path: Option<PathBuf>,

    // Rate limits (tokens per second; capacity = 2x refill, min 1)
    pub maps_rate_per_sec: f64,
    pub llm_rate_per_sec: f64,
    pub vision_rate_per_sec: f64,
    pub browser_rate_per_sec: f64,

    // Web server
    pub web_host: String,
    pub web_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            maps_api_key: required_env("MAPS_API_KEY"),
            text_llm_api_key: required_env("TEXT_LLM_API_KEY"),
            vision_llm_api_key: env::var("VISION_LLM_API_KEY")
                .unwrap_or_else(|_| env::var("TEXT_LLM_API_KEY").unwrap_or_default()),
            search_api_key: env::var("SEARCH_API_KEY").unwrap_or_default(),
            browserless_url: env::var("BROWSERLESS_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            browserless_token: env::var("BROWSERLESS_TOKEN").ok(),
            browser_pool_size: env_parse("BROWSER_POOL_SIZE", 1),
            database_url: required_env("DATABASE_URL"),
            backup_root: PathBuf::from(
                env::var("BACKUP_ROOT").unwrap_or_else(|_| "./data".to_string()),
            ),
            prompts_dir: PathBuf::from(
                env::var("PROMPTS_DIR").unwrap_or_else(|_| "./prompts".to_string()),
            ),
            cost_table_path: env::var("COST_TABLE_PATH").ok().map(PathBuf::from),
            maps_rate_per_sec: env_parse("MAPS_RATE_PER_SEC", 10.0),
            llm_rate_per_sec: env_parse("LLM_RATE_PER_SEC", 2.0),
            vision_rate_per_sec: env_parse("VISION_RATE_PER_SEC", 1.0),
            browser_rate_per_sec: env_parse("BROWSER_RATE_PER_SEC", 1.0),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: env_parse("WEB_PORT", 8080),
        }
    }
}

fn required_env(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| panic!("{name} environment variable is required"))
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
