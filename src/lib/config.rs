//! Process configuration read from the environment.
//!
//! `Config::from_env` loads `.env` first, then reads variables. Parsing itself
//! goes through `Config::from_lookup`, which takes any key lookup and does not
//! touch the process environment.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::tasks::TaskType;

#[derive(Debug, Clone)]
pub struct Config {
    pub dispatch: DispatchConfig,
    pub docker: DockerConfig,
    pub conversion: ConversionConfig,
    pub deploy: DeployConfig,
    pub database_path: PathBuf,
    pub api_addr: String,
    pub log: LogConfig,
}

/// Dispatch loop pacing.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_concurrent_tasks: usize,
    pub claim_timeout: Duration,
    pub idle_delay: Duration,
    pub saturated_delay: Duration,
    pub error_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 5,
            claim_timeout: Duration::from_secs(1),
            idle_delay: Duration::from_secs(1),
            saturated_delay: Duration::from_secs(2),
            error_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub socket: String,
    pub network: String,
    /// Grace period given to `stop` before a container is killed.
    pub stop_grace: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: "/var/run/docker.sock".to_string(),
            network: "task-network".to_string(),
            stop_grace: Duration::from_secs(10),
        }
    }
}

/// Image and wall-clock limit for one conversion task type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProfile {
    pub image: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ConversionConfig {
    pub profiles: HashMap<TaskType, TaskProfile>,
    pub uploads_path: PathBuf,
    pub outputs_path: PathBuf,
    pub network: Option<String>,
}

impl ConversionConfig {
    pub fn profile(&self, task_type: TaskType) -> Option<&TaskProfile> {
        self.profiles.get(&task_type)
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        let profiles = [
            (TaskType::ImageConvert, "image-processor", 300),
            (TaskType::VideoTrim, "video-processor", 1800),
            (TaskType::PdfExtract, "pdf-processor", 300),
            (TaskType::CsvAnalyze, "csv-analyzer", 300),
        ]
        .into_iter()
        .map(|(task_type, kind, secs)| {
            (
                task_type,
                TaskProfile {
                    image: format!("task-platform/{kind}:latest"),
                    timeout: Duration::from_secs(secs),
                },
            )
        })
        .collect();

        Self {
            profiles,
            uploads_path: PathBuf::from("./uploads"),
            outputs_path: PathBuf::from("./outputs"),
            network: Some("task-network".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// First port of the half-open range `[base_port, max_port)`.
    pub base_port: u16,
    pub max_port: u16,
    pub ttl: Duration,
    pub cleanup_interval: Duration,
    pub container_port: u16,
    pub settle_delay: Duration,
    pub build_timeout: Duration,
    pub public_host: String,
    /// Interface used by the bind-and-release port probe.
    pub bind_host: String,
    pub workdir: PathBuf,
    pub network: Option<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            base_port: 3000,
            max_port: 4000,
            ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(60),
            container_port: 3000,
            settle_delay: Duration::from_secs(3),
            build_timeout: Duration::from_secs(600),
            public_host: "localhost".to_string(),
            bind_host: "0.0.0.0".to_string(),
            workdir: PathBuf::from("./temp"),
            network: Some("task-network".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// When set, logs are also written to a daily file in this directory.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env is fine.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut dispatch = DispatchConfig::default();
        dispatch.max_concurrent_tasks =
            parse_or(&get, "MAX_CONCURRENT_TASKS", dispatch.max_concurrent_tasks)?;

        let mut docker = DockerConfig::default();
        if let Some(socket) = get("DOCKER_SOCKET") {
            docker.socket = socket;
        }
        if let Some(network) = get("DOCKER_NETWORK") {
            docker.network = network;
        }
        docker.stop_grace = secs_or(&get, "CONTAINER_STOP_GRACE_SECS", docker.stop_grace)?;

        let mut conversion = ConversionConfig::default();
        for (task_type, image_key, timeout_key) in [
            (
                TaskType::ImageConvert,
                "IMAGE_PROCESSOR_IMAGE",
                "IMAGE_CONVERT_TIMEOUT_SECS",
            ),
            (
                TaskType::VideoTrim,
                "VIDEO_PROCESSOR_IMAGE",
                "VIDEO_TRIM_TIMEOUT_SECS",
            ),
            (
                TaskType::PdfExtract,
                "PDF_PROCESSOR_IMAGE",
                "PDF_EXTRACT_TIMEOUT_SECS",
            ),
            (
                TaskType::CsvAnalyze,
                "CSV_ANALYZER_IMAGE",
                "CSV_ANALYZE_TIMEOUT_SECS",
            ),
        ] {
            if let Some(profile) = conversion.profiles.get_mut(&task_type) {
                if let Some(image) = get(image_key) {
                    profile.image = image;
                }
                profile.timeout = secs_or(&get, timeout_key, profile.timeout)?;
            }
        }
        conversion.uploads_path = absolute(
            get("HOST_UPLOADS_PATH")
                .map(PathBuf::from)
                .unwrap_or(conversion.uploads_path),
        );
        conversion.outputs_path = absolute(
            get("HOST_OUTPUTS_PATH")
                .map(PathBuf::from)
                .unwrap_or(conversion.outputs_path),
        );
        conversion.network = Some(docker.network.clone());

        let mut deploy = DeployConfig::default();
        deploy.base_port = parse_or(&get, "DEPLOY_BASE_PORT", deploy.base_port)?;
        deploy.max_port = parse_or(&get, "DEPLOY_MAX_PORT", deploy.max_port)?;
        deploy.ttl = secs_or(&get, "DEPLOY_TTL_SECS", deploy.ttl)?;
        deploy.cleanup_interval =
            secs_or(&get, "DEPLOY_CLEANUP_INTERVAL_SECS", deploy.cleanup_interval)?;
        deploy.container_port = parse_or(&get, "DEPLOY_CONTAINER_PORT", deploy.container_port)?;
        deploy.settle_delay = secs_or(&get, "DEPLOY_SETTLE_SECS", deploy.settle_delay)?;
        deploy.build_timeout = secs_or(&get, "DEPLOY_BUILD_TIMEOUT_SECS", deploy.build_timeout)?;
        if let Some(host) = get("PUBLIC_HOST").or_else(|| get("EC2_PUBLIC_IP")) {
            deploy.public_host = host;
        }
        if let Some(bind_host) = get("DEPLOY_BIND_HOST") {
            deploy.bind_host = bind_host;
        }
        if let Some(workdir) = get("DEPLOY_WORKDIR") {
            deploy.workdir = PathBuf::from(workdir);
        }
        deploy.network = Some(docker.network.clone());

        let log = LogConfig {
            level: get("LOG_LEVEL").unwrap_or_else(|| LogConfig::default().level),
            dir: get("LOG_DIR").map(PathBuf::from),
        };

        let config = Config {
            dispatch,
            docker,
            conversion,
            deploy,
            database_path: get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/r_dispatch.db")),
            api_addr: get("API_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            log,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_TASKS".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.deploy.base_port >= self.deploy.max_port {
            return Err(ConfigError::Invalid(format!(
                "deploy port range {}..{} is empty",
                self.deploy.base_port, self.deploy.max_port
            )));
        }
        if self.deploy.ttl.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOY_TTL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if self.deploy.cleanup_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "DEPLOY_CLEANUP_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if let Some((task_type, _)) = self
            .conversion
            .profiles
            .iter()
            .find(|(_, p)| p.timeout.is_zero())
        {
            return Err(ConfigError::Invalid(format!(
                "{task_type} timeout must be greater than zero"
            )));
        }
        Ok(())
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        None => Ok(default),
    }
}

fn secs_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default.as_secs()).map(Duration::from_secs)
}

/// Bind mounts need absolute host paths.
fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    std::path::absolute(Path::new(&path)).unwrap_or(path)
}
