//! Configuration loading: defaults, TOML files, then `DOCFLOW__*` environment
//! overrides. A `.env` file in the working directory is honored before any of
//! this runs (see `main.rs`).

use std::{env, path::PathBuf, time::Duration};

use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

const LOCAL_CONFIG_PATH: &str = "config/settings.toml";
const CONFIG_OVERRIDE_ENV: &str = "DOCFLOW_CONFIG_FILE";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub ingest: IngestConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
}

/// Blob storage selection. `backend` is a boot-time choice between the two
/// interchangeable S3-API implementations.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
    pub s3: S3Config,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    S3,
    Minio,
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::S3
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: Option<String>,
    /// Custom endpoint; required for the MinIO backend.
    pub endpoint_url: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    /// Path-style addressing for non-AWS S3 implementations.
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
}

fn default_force_path_style() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Namespace prefix for every broker key.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_process_timeout_secs")]
    pub process_timeout_secs: u64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_namespace() -> String {
    "docflow".to_string()
}

fn default_concurrency() -> usize {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_secs() -> u64 {
    60
}

fn default_process_timeout_secs() -> u64 {
    30 * 60
}

impl QueueConfig {
    pub fn process_timeout(&self) -> Duration {
        Duration::from_secs(self.process_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

fn default_allowed_types() -> Vec<String> {
    [".pdf", ".doc", ".docx", ".jpg", ".jpeg", ".png", ".tiff"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

fn default_priority() -> u8 {
    2
}

fn default_retention_hours() -> u64 {
    24
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExtractConfig {
    #[serde(default)]
    pub textract: TextractConfig,
    #[serde(default)]
    pub ocr: OcrEngineConfig,
    #[serde(default)]
    pub preprocess: PreprocessConfig,
    #[serde(default)]
    pub table: TableConfig,
    #[serde(default)]
    pub vision: VisionConfig,
}

/// Cloud document-analysis settings. When enabled, images route to the remote
/// service instead of the local OCR pipeline.
#[derive(Debug, Deserialize, Clone)]
pub struct TextractConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub region: Option<String>,
    #[serde(default = "default_textract_min_confidence")]
    pub min_confidence: f32,
    #[serde(default = "default_true")]
    pub enable_tables: bool,
    #[serde(default = "default_true")]
    pub enable_forms: bool,
}

fn default_textract_min_confidence() -> f32 {
    80.0
}

fn default_true() -> bool {
    true
}

impl Default for TextractConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            region: None,
            min_confidence: default_textract_min_confidence(),
            enable_tables: true,
            enable_forms: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrEngineConfig {
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    #[serde(default = "default_psm")]
    pub page_seg_mode: i32,
    #[serde(default = "default_ocr_min_confidence")]
    pub min_confidence: f32,
    #[serde(default)]
    pub user_words: Vec<String>,
}

fn default_languages() -> Vec<String> {
    vec!["eng".to_string()]
}

fn default_psm() -> i32 {
    3
}

fn default_ocr_min_confidence() -> f32 {
    60.0
}

impl Default for OcrEngineConfig {
    fn default() -> Self {
        Self {
            languages: default_languages(),
            page_seg_mode: default_psm(),
            min_confidence: default_ocr_min_confidence(),
            user_words: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreprocessConfig {
    #[serde(default = "default_denoise_strength")]
    pub denoise_strength: f32,
    #[serde(default = "default_deskew_angle_limit")]
    pub deskew_angle_limit: f32,
    #[serde(default = "default_adaptive_block_size")]
    pub adaptive_block_size: u32,
    #[serde(default = "default_adaptive_constant")]
    pub adaptive_constant: f32,
    #[serde(default = "default_sharpen_strength")]
    pub sharpen_strength: f32,
}

fn default_denoise_strength() -> f32 {
    0.5
}

fn default_deskew_angle_limit() -> f32 {
    5.0
}

fn default_adaptive_block_size() -> u32 {
    11
}

fn default_adaptive_constant() -> f32 {
    2.0
}

fn default_sharpen_strength() -> f32 {
    0.5
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            denoise_strength: default_denoise_strength(),
            deskew_angle_limit: default_deskew_angle_limit(),
            adaptive_block_size: default_adaptive_block_size(),
            adaptive_constant: default_adaptive_constant(),
            sharpen_strength: default_sharpen_strength(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TableConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_line_length")]
    pub min_line_length: u32,
    #[serde(default = "default_max_line_gap")]
    pub max_line_gap: u32,
    #[serde(default = "default_edge_threshold")]
    pub edge_threshold: f32,
}

fn default_min_line_length() -> u32 {
    50
}

fn default_max_line_gap() -> u32 {
    10
}

fn default_edge_threshold() -> f32 {
    30.0
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_line_length: default_min_line_length(),
            max_line_gap: default_max_line_gap(),
            edge_threshold: default_edge_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VisionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_vision_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_vision_model")]
    pub model: String,
    #[serde(default = "default_vision_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_vision_temperature")]
    pub temperature: f32,
    #[serde(default = "default_vision_pool_size")]
    pub max_pool_size: usize,
    #[serde(default = "default_vision_pool_timeout_ms")]
    pub pool_timeout_ms: u64,
}

fn default_vision_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_vision_model() -> String {
    "llama3.2-vision".to_string()
}

fn default_vision_max_tokens() -> u32 {
    2048
}

fn default_vision_temperature() -> f32 {
    0.7
}

fn default_vision_pool_size() -> usize {
    4
}

fn default_vision_pool_timeout_ms() -> u64 {
    30_000
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_vision_endpoint(),
            model: default_vision_model(),
            max_tokens: default_vision_max_tokens(),
            temperature: default_vision_temperature(),
            max_pool_size: default_vision_pool_size(),
            pool_timeout_ms: default_vision_pool_timeout_ms(),
        }
    }
}

impl VisionConfig {
    pub fn pool_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_timeout_ms)
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let dirs = project_dirs()?;
    let mut builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default("storage.backend", "s3")?
        .set_default("storage.s3.bucket", "docflow")?
        .set_default("storage.s3.force_path_style", true)?
        .set_default("queue.redis_url", default_redis_url())?
        .set_default("queue.namespace", default_namespace())?
        .set_default("queue.concurrency", default_concurrency() as i64)?
        .set_default("ingest.max_file_size", default_max_file_size() as i64)?
        .set_default("ingest.priority", default_priority() as i64)?
        .set_default("ingest.retention_hours", default_retention_hours() as i64)?;

    for path in [
        dirs.config_dir().join("settings.toml"),
        PathBuf::from(LOCAL_CONFIG_PATH),
    ] {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }

    if let Some(override_path) = config_override_path()? {
        builder = builder.add_source(
            File::from(override_path)
                .format(FileFormat::Toml)
                .required(true),
        );
    }

    builder = builder.add_source(Environment::with_prefix("DOCFLOW").separator("__"));

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    validate(&cfg)?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "docflow", "docflow").ok_or(AppConfigError::MissingProjectDirs)
}

fn config_override_path() -> Result<Option<PathBuf>, AppConfigError> {
    match env::var_os(CONFIG_OVERRIDE_ENV) {
        None => Ok(None),
        Some(raw) => {
            let path = PathBuf::from(raw);
            if path.as_os_str().is_empty() {
                return Err(invalid("DOCFLOW_CONFIG_FILE must not be empty"));
            }
            Ok(Some(path))
        }
    }
}

fn validate(cfg: &AppConfig) -> Result<(), AppConfigError> {
    if cfg.server.listen_addr.trim().is_empty() {
        return Err(invalid("server.listen_addr must not be empty"));
    }
    if cfg.storage.s3.bucket.trim().is_empty() {
        return Err(invalid("storage.s3.bucket must not be empty"));
    }
    if cfg.storage.backend == StorageBackend::Minio && cfg.storage.s3.endpoint_url.is_none() {
        return Err(invalid("storage.s3.endpoint_url is required for the minio backend"));
    }
    if cfg.queue.concurrency == 0 {
        return Err(invalid("queue.concurrency must be at least 1"));
    }
    if cfg.ingest.max_file_size == 0 {
        return Err(invalid("ingest.max_file_size must be positive"));
    }
    if cfg.ingest.allowed_types.is_empty() {
        return Err(invalid("ingest.allowed_types must not be empty"));
    }
    for ext in &cfg.ingest.allowed_types {
        if !ext.starts_with('.') {
            return Err(invalid(format!(
                "ingest.allowed_types entry `{ext}` must start with a dot"
            )));
        }
    }
    let block = cfg.extract.preprocess.adaptive_block_size;
    if block == 0 || block % 2 == 0 {
        return Err(invalid("extract.preprocess.adaptive_block_size must be odd"));
    }
    if cfg.extract.vision.enabled && cfg.extract.vision.max_pool_size == 0 {
        return Err(invalid("extract.vision.max_pool_size must be at least 1"));
    }
    Ok(())
}

fn invalid<S: Into<String>>(message: S) -> AppConfigError {
    AppConfigError::Build(config::ConfigError::Message(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                listen_addr: "127.0.0.1:8080".to_string(),
            },
            storage: StorageConfig {
                backend: StorageBackend::S3,
                s3: S3Config {
                    bucket: "docs".to_string(),
                    region: Some("us-east-1".to_string()),
                    endpoint_url: None,
                    access_key: None,
                    secret_key: None,
                    force_path_style: true,
                },
            },
            queue: QueueConfig {
                redis_url: default_redis_url(),
                namespace: default_namespace(),
                concurrency: 10,
                max_retries: 3,
                retry_delay_secs: 60,
                process_timeout_secs: 1800,
            },
            ingest: IngestConfig {
                max_file_size: default_max_file_size(),
                allowed_types: default_allowed_types(),
                priority: 2,
                retention_hours: 24,
            },
            extract: ExtractConfig::default(),
        }
    }

    #[test]
    fn default_allow_list_covers_supported_types() {
        let types = default_allowed_types();
        for ext in [".pdf", ".docx", ".jpg", ".png", ".tiff"] {
            assert!(types.iter().any(|t| t == ext), "missing {ext}");
        }
    }

    #[test]
    fn minio_backend_requires_endpoint() {
        let mut cfg = base_config();
        cfg.storage.backend = StorageBackend::Minio;
        assert!(validate(&cfg).is_err());

        cfg.storage.s3.endpoint_url = Some("http://127.0.0.1:9000".to_string());
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn adaptive_block_size_must_be_odd() {
        let mut cfg = base_config();
        cfg.extract.preprocess.adaptive_block_size = 10;
        assert!(validate(&cfg).is_err());
        cfg.extract.preprocess.adaptive_block_size = 11;
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn allow_list_entries_must_be_extensions() {
        let mut cfg = base_config();
        cfg.ingest.allowed_types = vec!["pdf".to_string()];
        assert!(validate(&cfg).is_err());
    }
}
