use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr};

/// Validity window for signed object URLs (one year).
pub const DEFAULT_SIGNED_URL_EXPIRY_SECS: u64 = 31_536_000;
const MAX_SIGNED_URL_EXPIRY_SECS: u64 = 10 * DEFAULT_SIGNED_URL_EXPIRY_SECS;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments. Built once at startup and
/// shared read-only behind an `Arc`.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Owner credential used only by `--migrate`; the server never connects to
    /// Postgres directly.
    pub migration_database_url: Option<String>,
    pub max_upload_bytes: usize,
    pub supabase: SupabaseConfig,
    pub vision: VisionConfig,
}

#[derive(Clone)]
pub struct SupabaseConfig {
    /// Project base URL, e.g. `https://xyz.supabase.co`.
    pub url: String,
    pub anon_key: String,
    /// HS256 secret used to verify caller access tokens.
    pub jwt_secret: String,
    pub bucket: String,
    pub signed_url_expiry_secs: u64,
}

#[derive(Clone)]
pub struct VisionConfig {
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`.
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

// Secrets stay out of the startup log line.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("supabase_url", &self.supabase.url)
            .field("bucket", &self.supabase.bucket)
            .field("signed_url_expiry_secs", &self.supabase.signed_url_expiry_secs)
            .field("vision_api_url", &self.vision.api_url)
            .field("vision_model", &self.vision.model)
            .finish_non_exhaustive()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Image upload and captioning API")]
pub struct Args {
    /// Host to bind to (overrides CAPTION_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CAPTION_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Postgres owner URL for migrations (overrides MIGRATION_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Supabase project URL (overrides SUPABASE_URL)
    #[arg(long)]
    pub supabase_url: Option<String>,

    /// Storage bucket holding uploaded images (overrides STORAGE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI arguments over values looked up through `lookup`.
    pub fn from_sources<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            match lookup(key) {
                Some(value) if !value.trim().is_empty() => Ok(value),
                _ => bail!("missing required setting {}", key),
            }
        };
        let or_default = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());

        let port = match args.port {
            Some(port) => port,
            None => parse_or(&lookup, "CAPTION_PORT", 3000)?,
        };
        let migration_database_url = args
            .database_url
            .or_else(|| lookup("MIGRATION_DATABASE_URL"))
            .filter(|url| !url.trim().is_empty());
        if args.migrate && migration_database_url.is_none() {
            bail!("--migrate needs MIGRATION_DATABASE_URL or --database-url");
        }
        let supabase_url = match args.supabase_url {
            Some(url) => url,
            None => required("SUPABASE_URL")?,
        };

        let cfg = Self {
            host: args
                .host
                .unwrap_or_else(|| or_default("CAPTION_HOST", "0.0.0.0")),
            port,
            migration_database_url,
            max_upload_bytes: parse_or(&lookup, "MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            supabase: SupabaseConfig {
                url: supabase_url.trim_end_matches('/').to_string(),
                anon_key: required("SUPABASE_ANON_KEY")?,
                jwt_secret: required("SUPABASE_JWT_SECRET")?,
                bucket: args
                    .bucket
                    .unwrap_or_else(|| or_default("STORAGE_BUCKET", "images")),
                signed_url_expiry_secs: parse_or(
                    &lookup,
                    "SIGNED_URL_EXPIRY_SECS",
                    DEFAULT_SIGNED_URL_EXPIRY_SECS,
                )?,
            },
            vision: VisionConfig {
                api_url: or_default("VISION_API_URL", "https://api.openai.com/v1")
                    .trim_end_matches('/')
                    .to_string(),
                api_key: required("VISION_API_KEY")?,
                model: or_default("VISION_MODEL", "gpt-4o-mini"),
                timeout_secs: parse_or(&lookup, "VISION_TIMEOUT_SECS", 60)?,
            },
        };

        if cfg.supabase.signed_url_expiry_secs == 0
            || cfg.supabase.signed_url_expiry_secs > MAX_SIGNED_URL_EXPIRY_SECS
        {
            bail!(
                "SIGNED_URL_EXPIRY_SECS must be between 1 and {}",
                MAX_SIGNED_URL_EXPIRY_SECS
            );
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(default),
    }
}
