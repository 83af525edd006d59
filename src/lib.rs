//! Toolkit for assuming AWS roles concurrently via permanent credentials
//! or SAML. Behavior is driven by a [`config::Config`] that defines auth
//! flows: their starter credentials, the primary mappings, and optional
//! secondary mappings. A mapping ties a role ARN to a desired profile
//! entry name; secondary mappings know they must be assumed with the
//! credentials of a previously completed primary mapping.
//!
//! Executing a flow collects the mappings' credentials, after which the
//! [`engine`] reconciles them into an AWS credentials file as managed
//! profile entries.

pub mod arn;
pub mod config;
pub mod credfile;
pub mod engine;
pub mod flow;
pub mod http_client;
pub mod legacy;
pub mod mapping;
pub mod saml;
pub mod samples;
pub mod sts;
pub mod ui;
