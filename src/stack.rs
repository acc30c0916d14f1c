use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_cloudformation::client::Waiters;
use aws_sdk_cloudformation::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_cloudformation::types::{Capability, Parameter, StackStatus};
use tracing::{error, info, warn};

use crate::config::{ParameterSet, StackConfig};
use crate::MESSAGE_CLIENT_NOT_DEFINED;

/// Every status except `DELETE_COMPLETE`, so deleted stacks never show up.
pub const LISTED_STACK_STATUSES: [&str; 16] = [
    "CREATE_IN_PROGRESS",
    "CREATE_FAILED",
    "CREATE_COMPLETE",
    "ROLLBACK_IN_PROGRESS",
    "ROLLBACK_FAILED",
    "ROLLBACK_COMPLETE",
    "DELETE_IN_PROGRESS",
    "DELETE_FAILED",
    "UPDATE_IN_PROGRESS",
    "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
    "UPDATE_COMPLETE",
    "UPDATE_ROLLBACK_IN_PROGRESS",
    "UPDATE_ROLLBACK_FAILED",
    "UPDATE_ROLLBACK_COMPLETE_CLEANUP_IN_PROGRESS",
    "UPDATE_ROLLBACK_COMPLETE",
    "REVIEW_IN_PROGRESS",
];

/// Matches the waiter budget of the CloudFormation SDKs (120 polls, 30s apart).
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60 * 60);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("{}", MESSAGE_CLIENT_NOT_DEFINED)]
    ClientNotConfigured,

    #[error("Missing: [{}]", .0.join(","))]
    MissingParameters(Vec<String>),

    #[error("Stack not found: {0}")]
    NotFoundError(String),

    #[error("Service error ocurred: {0}.")]
    ServiceError(String),

    #[error("Unknown error ocurred: {0}.")]
    UnknownError(String),
}

impl<E, R> From<SdkError<E, R>> for Error
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    fn from(err: SdkError<E, R>) -> Self {
        let message = DisplayErrorContext(&err).to_string();
        return match err {
            SdkError::ServiceError(_) => Error::ServiceError(message),
            _ => Error::UnknownError(message),
        };
    }
}

/// Template parameters by name; `None` marks a parameter without a default.
pub type TemplateParameters = BTreeMap<String, Option<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackParameter {
    pub key: String,
    pub value: String,
}

/// Everything the create and change-set calls send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackRequest {
    pub stack_name: String,
    pub template_url: String,
    pub capabilities: Vec<String>,
    pub parameters: Vec<StackParameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackDescription {
    pub name: String,
    pub status: Option<String>,
    pub outputs: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSummary {
    pub name: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackState {
    NotCreated,
    Creating,
    Created,
    CreatingChangeSet,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Created,
    ChangeSetCreated { change_set_name: String },
}

/// The CloudFormation calls the stack manager relies on.
#[async_trait]
pub trait StackService: Send + Sync {
    async fn validate_template(&self, template_url: &str) -> Result<TemplateParameters, Error>;

    /// `Ok(None)` only when CloudFormation reports that the stack does not exist.
    async fn describe_stack(&self, stack_name: &str) -> Result<Option<StackDescription>, Error>;

    async fn create_stack(&self, request: &StackRequest) -> Result<(), Error>;

    async fn wait_for_stack_create(&self, stack_name: &str, max_wait: Duration)
        -> Result<(), Error>;

    async fn create_change_set(
        &self,
        request: &StackRequest,
        change_set_name: &str,
    ) -> Result<(), Error>;

    async fn wait_for_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        max_wait: Duration,
    ) -> Result<(), Error>;

    async fn list_stacks(&self, statuses: &[&str]) -> Result<Vec<StackSummary>, Error>;
}

pub struct Stack {
    pub name: String,
    pub template_url: String,
    pub capabilities: Vec<String>,
    pub status: Option<String>,
    pub max_wait: Duration,

    state: StackState,
    client: Option<Arc<dyn StackService>>,
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("name", &self.name)
            .field("template_url", &self.template_url)
            .field("capabilities", &self.capabilities)
            .field("status", &self.status)
            .field("state", &self.state)
            .field("configured", &self.client.is_some())
            .finish()
    }
}

impl Stack {
    pub fn new(name: impl Into<String>, template_url: impl Into<String>) -> Self {
        return Self {
            name: name.into(),
            template_url: template_url.into(),
            capabilities: Vec::new(),
            status: None,
            max_wait: DEFAULT_MAX_WAIT,
            state: StackState::NotCreated,
            client: None,
        };
    }

    /// Builds an unbound stack from a deployment file entry.
    pub fn from_config(config: &StackConfig) -> Self {
        return Stack::new(
            config.stack_name.clone().unwrap_or_default(),
            config.template_url.clone(),
        )
        .with_capabilities(config.capabilities.clone());
    }

    pub fn with_client(mut self, client: Arc<dyn StackService>) -> Self {
        self.client = Some(client);
        return self;
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        return self;
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        return self;
    }

    /// Binds a CloudFormation client built from a loaded SDK configuration.
    pub fn initialize(&mut self, sdk_config: &aws_types::SdkConfig) {
        self.client = Some(Arc::new(aws_sdk_cloudformation::Client::new(sdk_config)));
    }

    pub fn state(&self) -> StackState {
        return self.state;
    }

    fn client(&self) -> Result<Arc<dyn StackService>, Error> {
        return self.client.clone().ok_or(Error::ClientNotConfigured);
    }

    fn request(&self, parameters: Vec<StackParameter>) -> StackRequest {
        return StackRequest {
            stack_name: self.name.clone(),
            template_url: self.template_url.clone(),
            capabilities: self.capabilities.clone(),
            parameters,
        };
    }

    /// Creates the stack, or a change set when it already exists, and waits
    /// for CloudFormation to finish.
    pub async fn create_or_update(
        &mut self,
        parameters: &ParameterSet,
    ) -> Result<Reconciliation, Error> {
        let client = self.client()?;

        let template_parameters = match client.validate_template(&self.template_url).await {
            Ok(template_parameters) => template_parameters,
            Err(err) => {
                error!(stack = %self.name, error = %err, "Template validation failed");
                return Err(err);
            }
        };

        if let Err(err) = find_missing_parameters(&template_parameters, parameters) {
            warn!(stack = %self.name, error = %err, "Refusing to deploy");
            return Err(err);
        }

        let stack_parameters = required_stack_parameters(&template_parameters, parameters);
        let existing = client.describe_stack(&self.name).await?;

        let result = match existing {
            None => self
                .create(client.as_ref(), stack_parameters)
                .await
                .map(|_| Reconciliation::Created),
            Some(_) => self
                .change_set(client.as_ref(), stack_parameters)
                .await
                .map(|change_set_name| Reconciliation::ChangeSetCreated { change_set_name }),
        };

        return result;
    }

    pub async fn template_parameters(&self) -> Result<TemplateParameters, Error> {
        let client = self.client()?;
        return client.validate_template(&self.template_url).await;
    }

    /// Creates the stack with every supplied parameter, without consulting the
    /// template.
    pub async fn create_stack(&mut self, parameters: &ParameterSet) -> Result<(), Error> {
        let client = self.client()?;
        return self
            .create(client.as_ref(), all_stack_parameters(parameters))
            .await;
    }

    /// Creates a change set with every supplied parameter and returns its name.
    pub async fn create_change_set(&mut self, parameters: &ParameterSet) -> Result<String, Error> {
        let client = self.client()?;
        return self
            .change_set(client.as_ref(), all_stack_parameters(parameters))
            .await;
    }

    async fn create(
        &mut self,
        client: &dyn StackService,
        parameters: Vec<StackParameter>,
    ) -> Result<(), Error> {
        info!(stack = %self.name, "Creating stack");
        self.state = StackState::Creating;

        let request = self.request(parameters);
        let result = match client.create_stack(&request).await {
            Ok(()) => client.wait_for_stack_create(&self.name, self.max_wait).await,
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            error!(stack = %self.name, error = %err, "Stack creation failed");
            self.state = StackState::Failed;
            return Err(err);
        }

        info!(stack = %self.name, "Created stack");
        self.state = StackState::Created;
        return Ok(());
    }

    async fn change_set(
        &mut self,
        client: &dyn StackService,
        parameters: Vec<StackParameter>,
    ) -> Result<String, Error> {
        let change_set_name = change_set_name(&self.name, chrono::Utc::now());
        info!(stack = %self.name, change_set = %change_set_name, "Creating change set");
        self.state = StackState::CreatingChangeSet;

        let request = self.request(parameters);
        let result = match client.create_change_set(&request, &change_set_name).await {
            Ok(()) => {
                client
                    .wait_for_change_set(&self.name, &change_set_name, self.max_wait)
                    .await
            }
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            error!(stack = %self.name, change_set = %change_set_name, error = %err, "Change set failed");
            self.state = StackState::Failed;
            return Err(err);
        }

        info!(stack = %self.name, change_set = %change_set_name, "Created change set");
        self.state = StackState::Created;
        return Ok(change_set_name);
    }

    /// Stack outputs by key. Later stacks in the description overwrite earlier
    /// ones on key collisions.
    pub async fn read_outputs(&self) -> Result<ParameterSet, Error> {
        let client = self.client()?;

        let description = match client.describe_stack(&self.name).await? {
            Some(description) => description,
            None => return Err(Error::NotFoundError(self.name.clone())),
        };

        return Ok(description.outputs.into_iter().collect());
    }
}

/// Lists every stack that has not been fully deleted.
pub async fn list_all_stacks_by_status(client: Arc<dyn StackService>) -> Result<Vec<Stack>, Error> {
    let summaries = match client.list_stacks(&LISTED_STACK_STATUSES).await {
        Ok(summaries) => summaries,
        Err(err) => {
            error!(error = %err, "Listing stacks failed");
            return Err(err);
        }
    };

    let stacks = summaries
        .into_iter()
        .map(|summary| {
            let mut stack = Stack::new(summary.name, String::new()).with_client(client.clone());
            stack.status = summary.status;
            stack
        })
        .collect();

    return Ok(stacks);
}

/// Fails when a parameter without a default was not supplied. Names are
/// reported in sorted order.
pub fn find_missing_parameters(
    template_parameters: &TemplateParameters,
    parameters: &ParameterSet,
) -> Result<(), Error> {
    let missing: Vec<String> = template_parameters
        .iter()
        .filter(|(key, default_value)| default_value.is_none() && !parameters.contains_key(*key))
        .map(|(key, _)| key.clone())
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    return Err(Error::MissingParameters(missing));
}

/// Parameters declared by the template that the caller supplied a value for.
/// Defaults are left to CloudFormation.
pub fn required_stack_parameters(
    template_parameters: &TemplateParameters,
    parameters: &ParameterSet,
) -> Vec<StackParameter> {
    return template_parameters
        .keys()
        .filter_map(|key| {
            parameters.get(key).map(|value| StackParameter {
                key: key.clone(),
                value: value.clone(),
            })
        })
        .collect();
}

pub fn all_stack_parameters(parameters: &ParameterSet) -> Vec<StackParameter> {
    let mut result: Vec<StackParameter> = parameters
        .iter()
        .map(|(key, value)| StackParameter {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    result.sort_by(|a, b| a.key.cmp(&b.key));

    return result;
}

fn change_set_name(stack_name: &str, now: chrono::DateTime<chrono::Utc>) -> String {
    return format!("{}-{}", stack_name, now.format("%Y%m%d%H%M%S"));
}

fn to_cfn_parameters(parameters: &[StackParameter]) -> Vec<Parameter> {
    return parameters
        .iter()
        .map(|parameter| {
            Parameter::builder()
                .parameter_key(&parameter.key)
                .parameter_value(&parameter.value)
                .build()
        })
        .collect();
}

fn to_capabilities(capabilities: &[String]) -> Vec<Capability> {
    return capabilities
        .iter()
        .map(|capability| Capability::from(capability.as_str()))
        .collect();
}

fn to_description(
    stack_name: &str,
    stacks: &[aws_sdk_cloudformation::types::Stack],
) -> StackDescription {
    let mut description = StackDescription {
        name: stack_name.to_string(),
        ..StackDescription::default()
    };
    for stack in stacks {
        description.status = stack
            .stack_status()
            .map(|status| status.as_str().to_string());
        for output in stack.outputs() {
            if let (Some(key), Some(value)) = (output.output_key(), output.output_value()) {
                description.outputs.push((key.to_string(), value.to_string()));
            }
        }
    }

    return description;
}

/// Summaries without a name cannot be addressed later and are dropped.
fn to_summary(summary: &aws_sdk_cloudformation::types::StackSummary) -> Option<StackSummary> {
    let name = summary.stack_name()?;
    return Some(StackSummary {
        name: name.to_string(),
        status: summary
            .stack_status()
            .map(|status| status.as_str().to_string()),
    });
}

fn is_stack_missing<E: ProvideErrorMetadata>(err: &E) -> bool {
    return err.code() == Some("ValidationError")
        && err
            .message()
            .map(|message| message.contains("does not exist"))
            .unwrap_or(false);
}

#[async_trait]
impl StackService for aws_sdk_cloudformation::Client {
    async fn validate_template(&self, template_url: &str) -> Result<TemplateParameters, Error> {
        let output = self
            .validate_template()
            .template_url(template_url)
            .send()
            .await?;

        let template_parameters = output
            .parameters()
            .iter()
            .filter_map(|parameter| {
                let key = parameter.parameter_key()?.to_string();
                Some((key, parameter.default_value().map(String::from)))
            })
            .collect();

        return Ok(template_parameters);
    }

    async fn describe_stack(&self, stack_name: &str) -> Result<Option<StackDescription>, Error> {
        let result = self.describe_stacks().stack_name(stack_name).send().await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if let Some(service_error) = err.as_service_error() {
                    if is_stack_missing(service_error) {
                        return Ok(None);
                    }
                }
                return Err(err.into());
            }
        };

        let stacks = output.stacks();
        if stacks.is_empty() {
            return Ok(None);
        }

        return Ok(Some(to_description(stack_name, stacks)));
    }

    async fn create_stack(&self, request: &StackRequest) -> Result<(), Error> {
        self.create_stack()
            .stack_name(&request.stack_name)
            .template_url(&request.template_url)
            .set_capabilities(Some(to_capabilities(&request.capabilities)))
            .set_parameters(Some(to_cfn_parameters(&request.parameters)))
            .send()
            .await?;

        return Ok(());
    }

    async fn wait_for_stack_create(
        &self,
        stack_name: &str,
        max_wait: Duration,
    ) -> Result<(), Error> {
        let result = self
            .wait_until_stack_create_complete()
            .stack_name(stack_name)
            .wait(max_wait)
            .await;

        return match result {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::ServiceError(DisplayErrorContext(&err).to_string())),
        };
    }

    async fn create_change_set(
        &self,
        request: &StackRequest,
        change_set_name: &str,
    ) -> Result<(), Error> {
        self.create_change_set()
            .stack_name(&request.stack_name)
            .template_url(&request.template_url)
            .change_set_name(change_set_name)
            .set_capabilities(Some(to_capabilities(&request.capabilities)))
            .set_parameters(Some(to_cfn_parameters(&request.parameters)))
            .send()
            .await?;

        return Ok(());
    }

    async fn wait_for_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        max_wait: Duration,
    ) -> Result<(), Error> {
        let result = self
            .wait_until_change_set_create_complete()
            .stack_name(stack_name)
            .change_set_name(change_set_name)
            .wait(max_wait)
            .await;

        return match result {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::ServiceError(DisplayErrorContext(&err).to_string())),
        };
    }

    async fn list_stacks(&self, statuses: &[&str]) -> Result<Vec<StackSummary>, Error> {
        let filter: Vec<StackStatus> = statuses
            .iter()
            .map(|status| StackStatus::from(*status))
            .collect();

        let mut pages = self
            .list_stacks()
            .set_stack_status_filter(Some(filter))
            .into_paginator()
            .send();

        let mut summaries = Vec::new();
        while let Some(page) = pages.next().await {
            summaries.extend(page?.stack_summaries().iter().filter_map(to_summary));
        }

        return Ok(summaries);
    }
}
