use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, path::PathBuf, time::Duration};

const DEFAULT_MAX_UPLOAD_SIZE: &str = "10MB";
const DEFAULT_MULTIPART_TTL_SECS: u64 = 30 * 60;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub database_url: String,
    pub access_key: String,
    pub secret_key: String,
    pub max_upload_size: usize,
    pub multipart_ttl: Duration,
    pub overwrite_metadata: bool,
}

/// What the process should do after loading its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve,
    Migrate,
    CreateIndex,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Self-hosted S3-compatible object storage")]
pub struct Args {
    /// Host to bind to (overrides OFUTON_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OFUTON_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides OFUTON_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Scratch directory for multipart parts (overrides OFUTON_TEMP_DIR)
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Database URL (overrides OFUTON_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Access key expected in signed requests (overrides OFUTON_ACCESS_KEY)
    #[arg(long)]
    pub access_key: Option<String>,

    /// Secret key used to verify signatures (overrides OFUTON_SECRET_KEY)
    #[arg(long)]
    pub secret_key: Option<String>,

    /// Maximum request body size, e.g. `10MB` (overrides OFUTON_MAX_UPLOAD_SIZE)
    #[arg(long)]
    pub max_upload_size: Option<String>,

    /// Lifetime of an idle multipart upload in seconds (overrides OFUTON_MULTIPART_TTL_SECS)
    #[arg(long)]
    pub multipart_ttl_secs: Option<u64>,

    /// Replace index rows when an existing key is uploaded again
    #[arg(long)]
    pub overwrite_metadata: bool,

    /// Run migrations and exit
    #[arg(long, conflicts_with = "create_index")]
    pub migrate: bool,

    /// Index files already present in the storage directory and exit
    #[arg(long)]
    pub create_index: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, RunMode)> {
        let args = Args::parse();
        Self::from_args(args)
    }

    fn from_args(args: Args) -> Result<(Self, RunMode)> {
        // --- Environment fallback ---
        let env_host = env::var("OFUTON_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("OFUTON_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing OFUTON_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading OFUTON_PORT"),
        };
        let env_storage = env::var("OFUTON_STORAGE_DIR").unwrap_or_else(|_| "./bucket".into());
        let env_temp = env::var("OFUTON_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join("ofuton"));
        let env_db = env::var("OFUTON_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./database.sqlite3".into());
        let env_access = env::var("OFUTON_ACCESS_KEY").unwrap_or_default();
        let env_secret = env::var("OFUTON_SECRET_KEY").unwrap_or_default();
        let env_max_upload =
            env::var("OFUTON_MAX_UPLOAD_SIZE").unwrap_or_else(|_| DEFAULT_MAX_UPLOAD_SIZE.into());
        let env_ttl = match env::var("OFUTON_MULTIPART_TTL_SECS") {
            Ok(value) => value
                .parse::<u64>()
                .with_context(|| format!("parsing OFUTON_MULTIPART_TTL_SECS value `{}`", value))?,
            Err(env::VarError::NotPresent) => DEFAULT_MULTIPART_TTL_SECS,
            Err(err) => return Err(err).context("reading OFUTON_MULTIPART_TTL_SECS"),
        };
        let env_overwrite = env::var("OFUTON_OVERWRITE_METADATA")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let max_upload_raw = args.max_upload_size.unwrap_or(env_max_upload);
        let max_upload_size = parse_byte_size(&max_upload_raw)
            .with_context(|| format!("parsing max upload size `{}`", max_upload_raw))?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or_else(|| env_storage.into()),
            temp_dir: args.temp_dir.unwrap_or(env_temp),
            database_url: args.database_url.unwrap_or(env_db),
            access_key: args.access_key.unwrap_or(env_access),
            secret_key: args.secret_key.unwrap_or(env_secret),
            max_upload_size,
            multipart_ttl: Duration::from_secs(args.multipart_ttl_secs.unwrap_or(env_ttl)),
            overwrite_metadata: args.overwrite_metadata || env_overwrite,
        };

        let mode = if args.migrate {
            RunMode::Migrate
        } else if args.create_index {
            RunMode::CreateIndex
        } else {
            RunMode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("temp_dir", &self.temp_dir)
            .field("database_url", &self.database_url)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("max_upload_size", &self.max_upload_size)
            .field("multipart_ttl", &self.multipart_ttl)
            .field("overwrite_metadata", &self.overwrite_metadata)
            .finish()
    }
}

/// Parse a human-readable size such as `512KB` or `10MB` (1024-based).
pub fn parse_byte_size(raw: &str) -> Result<usize> {
    let value = raw.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    if number.is_empty() {
        bail!("missing numeric part");
    }
    let number: f64 = number.parse().context("invalid number")?;
    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "kb" | "k" => 1024.0,
        "mb" | "m" => 1024.0 * 1024.0,
        "gb" | "g" => 1024.0 * 1024.0 * 1024.0,
        other => bail!("unknown size unit `{}`", other),
    };
    Ok((number * multiplier) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_byte_sizes() {
        assert_eq!(parse_byte_size("10MB").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_byte_size("512kb").unwrap(), 512 * 1024);
        assert_eq!(parse_byte_size("42").unwrap(), 42);
        assert_eq!(parse_byte_size("1.5 KB").unwrap(), 1536);
        assert!(parse_byte_size("MB").is_err());
        assert!(parse_byte_size("10TB").is_err());
    }

    #[test]
    fn cli_flags_select_run_mode() {
        let args = Args::parse_from(["ofuton-store", "--create-index", "--port", "9000"]);
        let (cfg, mode) = AppConfig::from_args(args).unwrap();
        assert_eq!(mode, RunMode::CreateIndex);
        assert_eq!(cfg.port, 9000);
    }

    #[test]
    fn debug_output_redacts_secret() {
        let args = Args::parse_from(["ofuton-store", "--secret-key", "hunter2"]);
        let (cfg, _) = AppConfig::from_args(args).unwrap();
        assert_eq!(cfg.secret_key, "hunter2");
        assert!(!format!("{:?}", cfg).contains("hunter2"));
    }
}
