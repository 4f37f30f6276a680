//! Per-type task handlers.
//!
//! Conversion types run a single processing container with the uploads
//! directory mounted read-only at `/input` and the outputs directory at
//! `/output`. `github-deploy` goes through the [`Deployer`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::types::TaskOutcome;
use crate::config::ConversionConfig;
use crate::container::{ContainerRunner, ContainerSpec};
use crate::deployer::Deployer;
use crate::error::{Error, TaskError};
use crate::tasks::{FileRef, Task, TaskType};

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<TaskOutcome, Error>;
}

/// Task type to handler routing table.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversion handler for the four file types plus the deploy handler.
    pub fn standard(
        runner: Arc<ContainerRunner>,
        config: ConversionConfig,
        deployer: Arc<Deployer>,
    ) -> Self {
        let conversion: Arc<dyn TaskHandler> = Arc::new(ConversionHandler::new(runner, config));
        let mut registry = Self::new();
        for task_type in [
            TaskType::ImageConvert,
            TaskType::VideoTrim,
            TaskType::PdfExtract,
            TaskType::CsvAnalyze,
        ] {
            registry.register(task_type, conversion.clone());
        }
        registry.register(TaskType::GithubDeploy, Arc::new(DeployHandler::new(deployer)));
        registry
    }

    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type, handler);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }
}

pub struct ConversionHandler {
    runner: Arc<ContainerRunner>,
    config: ConversionConfig,
}

impl ConversionHandler {
    pub fn new(runner: Arc<ContainerRunner>, config: ConversionConfig) -> Self {
        Self { runner, config }
    }
}

/// Container spec and expected output file for a conversion task.
pub fn prepare_job(
    config: &ConversionConfig,
    task: &Task,
) -> Result<(ContainerSpec, FileRef), TaskError> {
    let profile = config
        .profile(task.task_type)
        .ok_or(TaskError::NoHandler(task.task_type))?;
    let input = input_filename(task)?;
    let id = &task.id;

    let spec = ContainerSpec::new(&profile.image)
        .bind(format!("{}:/input:ro", config.uploads_path.display()))
        .bind(format!("{}:/output:rw", config.outputs_path.display()))
        .network(config.network.clone())
        .env("INPUT_FILE", format!("/input/{input}"));

    let (spec, output_name) = match task.task_type {
        TaskType::ImageConvert => {
            let format = param_or(task, "format", "jpg");
            if format.is_empty() || !format.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(TaskError::InvalidParameters {
                    id: id.clone(),
                    reason: format!("unsupported image format {format:?}"),
                });
            }
            let spec = spec
                .env("OUTPUT_FILE", format!("/output/{id}_converted"))
                .env("FORMAT", &format)
                .env("QUALITY", param_or(task, "quality", "80"))
                .env("WIDTH", param_or(task, "width", ""))
                .env("HEIGHT", param_or(task, "height", ""));
            (spec, format!("{id}_converted.{format}"))
        }
        TaskType::VideoTrim => {
            let output = format!("{id}_trimmed.mp4");
            let spec = spec
                .env("OUTPUT_FILE", format!("/output/{output}"))
                .env("START_TIME", param_or(task, "startTime", "00:00:00"))
                .env("DURATION", param_or(task, "duration", ""))
                .env("END_TIME", param_or(task, "endTime", ""));
            (spec, output)
        }
        TaskType::PdfExtract => {
            let output_format = param_or(task, "outputFormat", "text");
            let extension = match output_format.as_str() {
                "json" => "json",
                "markdown" => "md",
                _ => "txt",
            };
            let spec = spec
                .env("OUTPUT_FILE", format!("/output/{id}_extracted"))
                .env("EXTRACT_IMAGES", param_or(task, "extractImages", "false"))
                .env("EXTRACT_TABLES", param_or(task, "extractTables", "false"))
                .env("OUTPUT_FORMAT", &output_format)
                .env("PAGE_START", nested_param(task, "pageRange", "start"))
                .env("PAGE_END", nested_param(task, "pageRange", "end"));
            (spec, format!("{id}_extracted.{extension}"))
        }
        TaskType::CsvAnalyze => {
            let columns = match task.parameters.get("columns") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(scalar_text)
                    .collect::<Vec<_>>()
                    .join(","),
                Some(Value::String(s)) => s.clone(),
                _ => String::new(),
            };
            let spec = spec
                .env("OUTPUT_FILE", format!("/output/{id}_analysis"))
                .env("DELIMITER", param_or(task, "delimiter", ","))
                .env("HAS_HEADER", param_or(task, "hasHeader", "true"))
                .env("ANALYSIS_TYPE", param_or(task, "analysisType", "basic"))
                .env("COLUMNS", columns)
                .env("GENERATE_CHARTS", param_or(task, "generateCharts", "false"));
            (spec, format!("{id}_analysis.json"))
        }
        TaskType::GithubDeploy => return Err(TaskError::NoHandler(task.task_type)),
    };

    let output = FileRef {
        path: Some(
            config
                .outputs_path
                .join(&output_name)
                .display()
                .to_string(),
        ),
        filename: output_name,
        ..Default::default()
    };
    Ok((spec, output))
}

#[async_trait]
impl TaskHandler for ConversionHandler {
    async fn handle(&self, task: &Task) -> Result<TaskOutcome, Error> {
        let (spec, output_file) = prepare_job(&self.config, task)?;
        let timeout = self
            .config
            .profile(task.task_type)
            .map(|p| p.timeout)
            .ok_or(TaskError::NoHandler(task.task_type))?;

        info!(task_id = %task.id, image = %spec.image, mounts = ?spec.binds, "Running conversion");
        self.runner.run_container(&spec, timeout).await?;

        Ok(TaskOutcome {
            output_file: Some(output_file),
            deployment: None,
        })
    }
}

pub struct DeployHandler {
    deployer: Arc<Deployer>,
}

impl DeployHandler {
    pub fn new(deployer: Arc<Deployer>) -> Self {
        Self { deployer }
    }
}

#[async_trait]
impl TaskHandler for DeployHandler {
    async fn handle(&self, task: &Task) -> Result<TaskOutcome, Error> {
        let deployment = self.deployer.deploy(task).await?;
        Ok(TaskOutcome {
            output_file: None,
            deployment: Some(deployment),
        })
    }
}

fn input_filename(task: &Task) -> Result<&str, TaskError> {
    let input = task
        .input_file
        .as_ref()
        .ok_or_else(|| TaskError::MissingInput { id: task.id.clone() })?;
    let name = input.filename.as_str();
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(TaskError::InvalidParameters {
            id: task.id.clone(),
            reason: format!("invalid input file name {name:?}"),
        });
    }
    Ok(name)
}

fn param_or(task: &Task, key: &str, default: &str) -> String {
    task.param(key)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn nested_param(task: &Task, outer: &str, inner: &str) -> String {
    task.parameters
        .get(outer)
        .and_then(|v| v.get(inner))
        .map(scalar_text)
        .unwrap_or_default()
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
