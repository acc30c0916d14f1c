use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::{env, fs, io, path::Path, path::PathBuf};
use validator::{Validate, ValidationError};

/// Parameter values keyed by name, as loaded from files or the environment.
pub type ParameterSet = HashMap<String, String>;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    #[error("File {0} not found")]
    FileNotFound(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Malformed line {line}: `{content}` has no `=` separator")]
    MalformedLine { line: usize, content: String },

    #[error("Validation errors: {0}")]
    ValidationError(String),

    #[error("Unknown error occurred: {0}")]
    Unknown(String),
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct StackConfig {
    #[validate(required)]
    pub stack_name: Option<String>,

    #[validate(custom = "validate_template_url")]
    pub template_url: String,

    #[serde(default)]
    pub capabilities: Vec<String>,

    pub parameters_file: Option<PathBuf>,

    #[serde(default)]
    pub include_environment: bool,
}

impl StackConfig {
    /// Environment first (when requested), then the parameters file, so file
    /// values win on conflicting keys.
    pub fn parameters(&self) -> Result<ParameterSet, Error> {
        let mut parameters = ParameterSet::new();
        if self.include_environment {
            parameters.extend(load_environment_variables());
        }
        if let Some(path) = &self.parameters_file {
            parameters.extend(load_parameters(path)?);
        }

        return Ok(parameters);
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct BucketConfig {
    #[validate(required, length(min = 3, max = 63))]
    pub bucket: Option<String>,

    pub local_dir: PathBuf,

    pub exclude: Option<String>,

    #[validate(range(min = 1, max = 1024))]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    pub region: Option<String>,

    #[serde(default)]
    #[validate]
    pub stacks: Vec<StackConfig>,

    #[serde(default)]
    #[validate]
    pub buckets: Vec<BucketConfig>,
}

impl Config {
    /// Loads the SDK configuration for the file's `region`, falling back to the
    /// default provider chain when it is absent.
    pub async fn sdk_config(&self) -> aws_types::SdkConfig {
        return crate::client::load_sdk_config(self.region.as_deref()).await;
    }
}

fn read_file(path: &Path) -> Result<String, Error> {
    return match fs::read_to_string(path) {
        Ok(raw_contents) => Ok(raw_contents),
        Err(error) => match error.kind() {
            io::ErrorKind::NotFound => Err(Error::FileNotFound(path.display().to_string())),
            _ => Err(Error::Unknown(error.to_string())),
        },
    };
}

pub fn parse(path: &Path) -> Result<Config, Error> {
    let contents = read_file(path)?;

    let config: Config = match serde_yaml::from_str(&contents) {
        Ok(data) => Ok(data),
        Err(error) => Err(Error::ParsingError(error.to_string())),
    }?;

    match config.validate() {
        Ok(_) => (),
        Err(error) => return Err(Error::ValidationError(error.to_string())),
    }

    return Ok(config);
}

/// Reads `KEY=VALUE` lines. Only the first `=` separates key from value.
pub fn load_parameters(path: &Path) -> Result<ParameterSet, Error> {
    let contents = read_file(path)?;
    return parse_parameters(&contents);
}

pub fn parse_parameters(contents: &str) -> Result<ParameterSet, Error> {
    let mut parameters = ParameterSet::new();

    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                parameters.insert(key.to_string(), value.to_string());
            }
            None => {
                return Err(Error::MalformedLine {
                    line: index + 1,
                    content: line.to_string(),
                })
            }
        }
    }

    return Ok(parameters);
}

pub fn load_environment_variables() -> ParameterSet {
    return env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect();
}

fn validate_template_url(template_url: &str) -> Result<(), ValidationError> {
    if template_url.starts_with("https://") || template_url.starts_with("s3://") {
        return Ok(());
    }

    return Err(ValidationError::new(
        "The template URL has to start with `https://` or `s3://`",
    ));
}
