use crate::{
    models::verdict::Likelihood,
    services::{
        counter::DEFAULT_MAX_ATTEMPTS,
        moderation::{ClassifierInput, DEFAULT_BLUR_SIGMA},
    },
    triggers::ExhaustionPolicy,
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

const DEFAULT_CLASSIFIER_ENDPOINT: &str = "https://vision.googleapis.com";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub classifier_endpoint: String,
    pub classifier_api_key: Option<String>,
    pub classifier_timeout: Duration,
    pub classifier_input: ClassifierInput,
    pub likelihood_threshold: Likelihood,
    pub blur_sigma: f32,
    pub counter_max_attempts: u32,
    pub exhaustion_policy: ExhaustionPolicy,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Image intake pipeline: moderation, thumbnails and move counters")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_INTAKE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_INTAKE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides IMAGE_INTAKE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides IMAGE_INTAKE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Safe-search service base URL (overrides IMAGE_INTAKE_CLASSIFIER_ENDPOINT)
    #[arg(long)]
    pub classifier_endpoint: Option<String>,

    /// API key sent as `?key=` (overrides IMAGE_INTAKE_CLASSIFIER_API_KEY)
    #[arg(long)]
    pub classifier_api_key: Option<String>,

    /// Classifier request timeout in seconds (overrides IMAGE_INTAKE_CLASSIFIER_TIMEOUT_SECS)
    #[arg(long)]
    pub classifier_timeout_secs: Option<u64>,

    /// Send image bytes inline or the object URI (overrides IMAGE_INTAKE_CLASSIFIER_INPUT)
    #[arg(long, value_enum)]
    pub classifier_input: Option<ClassifierInput>,

    /// Likelihood name or ordinal treated as offensive (overrides IMAGE_INTAKE_LIKELIHOOD_THRESHOLD)
    #[arg(long)]
    pub likelihood_threshold: Option<Likelihood>,

    /// Gaussian blur sigma for offensive images (overrides IMAGE_INTAKE_BLUR_SIGMA)
    #[arg(long)]
    pub blur_sigma: Option<f32>,

    /// Counter transaction attempts (overrides IMAGE_INTAKE_COUNTER_MAX_ATTEMPTS)
    #[arg(long)]
    pub counter_max_attempts: Option<u32>,

    /// Behaviour once counter attempts run out (overrides IMAGE_INTAKE_EXHAUSTION_POLICY)
    #[arg(long, value_enum)]
    pub exhaustion_policy: Option<ExhaustionPolicy>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge `args` over `IMAGE_INTAKE_*` variables over defaults.
    pub fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("IMAGE_INTAKE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parsed("IMAGE_INTAKE_PORT", 3000)?;
        let env_storage =
            env::var("IMAGE_INTAKE_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("IMAGE_INTAKE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/image_intake.db".into());
        let env_endpoint = env::var("IMAGE_INTAKE_CLASSIFIER_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_CLASSIFIER_ENDPOINT.into());
        let env_api_key = env::var("IMAGE_INTAKE_CLASSIFIER_API_KEY").ok();
        let env_timeout = env_parsed("IMAGE_INTAKE_CLASSIFIER_TIMEOUT_SECS", 30)?;
        let env_input = env_value_enum("IMAGE_INTAKE_CLASSIFIER_INPUT", ClassifierInput::default())?;
        let env_threshold = env_parsed("IMAGE_INTAKE_LIKELIHOOD_THRESHOLD", Likelihood::Likely)?;
        let env_sigma = env_parsed("IMAGE_INTAKE_BLUR_SIGMA", DEFAULT_BLUR_SIGMA)?;
        let env_attempts = env_parsed("IMAGE_INTAKE_COUNTER_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?;
        let env_policy =
            env_value_enum("IMAGE_INTAKE_EXHAUSTION_POLICY", ExhaustionPolicy::default())?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            classifier_endpoint: args.classifier_endpoint.unwrap_or(env_endpoint),
            classifier_api_key: args.classifier_api_key.or(env_api_key),
            classifier_timeout: Duration::from_secs(
                args.classifier_timeout_secs.unwrap_or(env_timeout),
            ),
            classifier_input: args.classifier_input.unwrap_or(env_input),
            likelihood_threshold: args.likelihood_threshold.unwrap_or(env_threshold),
            blur_sigma: args.blur_sigma.unwrap_or(env_sigma),
            counter_max_attempts: args.counter_max_attempts.unwrap_or(env_attempts),
            exhaustion_policy: args.exhaustion_policy.unwrap_or(env_policy),
        };

        if cfg.counter_max_attempts == 0 {
            anyhow::bail!("counter max attempts must be at least 1");
        }
        if !(cfg.blur_sigma.is_finite() && cfg.blur_sigma > 0.0) {
            anyhow::bail!("blur sigma must be a positive number, got {}", cfg.blur_sigma);
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_value_enum<T: ValueEnum>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) => T::from_str(&value, true)
            .map_err(|err| anyhow::anyhow!("parsing {} value `{}`: {}", name, value, err)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
