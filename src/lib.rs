//! Helpers for common AWS tasks: CloudFormation stacks, S3 bucket sync,
//! SSM parameters, plus a password generator.

pub mod bucket;
pub mod client;
pub mod config;
pub mod password;
pub mod stack;
pub mod store;

pub const MESSAGE_CLIENT_NOT_DEFINED: &str = "Aws Client not defined";
