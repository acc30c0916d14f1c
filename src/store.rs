use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_ssm::error::{DisplayErrorContext, SdkError};
use aws_sdk_ssm::types::ParameterType;
use tracing::debug;

use crate::MESSAGE_CLIENT_NOT_DEFINED;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("{}", MESSAGE_CLIENT_NOT_DEFINED)]
    ClientNotConfigured,

    #[error("Parameter {0} has no value")]
    NoValue(String),

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

#[async_trait]
pub trait SecretService: Send + Sync {
    async fn get_parameter(&self, name: &str, with_decryption: bool) -> Result<String, Error>;

    async fn put_secure_parameter(
        &self,
        name: &str,
        value: &str,
        overwrite: bool,
    ) -> Result<(), Error>;
}

/// SSM Parameter Store access. Values are always decrypted on read and
/// stored as `SecureString` on write.
#[derive(Default)]
pub struct Store {
    client: Option<Arc<dyn SecretService>>,
    overwrite: bool,
}

impl Store {
    pub fn new(client: Arc<dyn SecretService>) -> Self {
        return Self {
            client: Some(client),
            overwrite: false,
        };
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        return self;
    }

    pub fn initialize(&mut self, sdk_config: &aws_types::SdkConfig) {
        self.client = Some(Arc::new(aws_sdk_ssm::Client::new(sdk_config)));
    }

    fn client(&self) -> Result<&dyn SecretService, Error> {
        return self.client.as_deref().ok_or(Error::ClientNotConfigured);
    }

    pub async fn get_parameter(&self, key: &str) -> Result<String, Error> {
        let client = self.client()?;
        debug!(parameter = %key, "Reading parameter");
        return client.get_parameter(key, true).await;
    }

    pub async fn put_parameter(&self, key: &str, value: &str) -> Result<(), Error> {
        let client = self.client()?;
        debug!(parameter = %key, overwrite = self.overwrite, "Writing parameter");
        return client.put_secure_parameter(key, value, self.overwrite).await;
    }
}

#[async_trait]
impl SecretService for aws_sdk_ssm::Client {
    async fn get_parameter(&self, name: &str, with_decryption: bool) -> Result<String, Error> {
        let output = self
            .get_parameter()
            .name(name)
            .with_decryption(with_decryption)
            .send()
            .await?;

        return output
            .parameter()
            .and_then(|parameter| parameter.value())
            .map(String::from)
            .ok_or_else(|| Error::NoValue(name.to_string()));
    }

    async fn put_secure_parameter(
        &self,
        name: &str,
        value: &str,
        overwrite: bool,
    ) -> Result<(), Error> {
        self.put_parameter()
            .name(name)
            .value(value)
            .r#type(ParameterType::SecureString)
            .overwrite(overwrite)
            .send()
            .await?;

        return Ok(());
    }
}
