//! Sample config generation so users can bootstrap a working YAML file
//! instead of writing one from scratch.

use std::path::Path;

use anyhow::{Context, Result};

use crate::config::{Assumptions, CParam, Config, Flow, Mfa, PermCredsConfig, SamlConfig};
use crate::mapping::Mapping;

fn new_sample_perm_mfa() -> PermCredsConfig {
    PermCredsConfig {
        profile_name: None,
        mfa: Some(Mfa {
            serial: CParam {
                source: "config".to_string(),
                value: Some("sampleserial".to_string()),
                ..CParam::default()
            },
            token: CParam {
                source: "prompt".to_string(),
                value: None,
                ..CParam::default()
            },
        }),
    }
}

fn new_sample_saml_config() -> SamlConfig {
    SamlConfig {
        username: CParam {
            source: "env".to_string(),
            value: Some("SAML_USER".to_string()),
            ..CParam::default()
        },
        password: CParam {
            source: "prompt".to_string(),
            value: None,
            ..CParam::default()
        },
        url: CParam {
            source: "config".to_string(),
            value: Some("https://my.saml.auth.url.com/auth.fcc".to_string()),
            ..CParam::default()
        },
        target: CParam {
            source: "config".to_string(),
            value: Some(
                "https://my.auth.target.com/fss/idp/startSSO.ping?PartnerSpId=urn:amazon:webservices"
                    .to_string(),
            ),
            ..CParam::default()
        },
        allow_mapping_duration_override: false,
    }
}

fn new_sample_assumptions_primary() -> Assumptions {
    Assumptions {
        all_roles: false,
        mappings: vec![
            Mapping {
                role_arn: "arn:aws:iam::123456789012:role/sub-admin".to_string(),
                profile_name: Some("sub-admin".to_string()),
                region: Some("us-west-2".to_string()),
                no_output: true,
                duration_seconds: Some(43200),
                ..Mapping::default()
            },
            Mapping {
                role_arn: "arn:aws:iam::123456789012:role/role2".to_string(),
                profile_name: Some("role2".to_string()),
                duration_seconds: Some(43200),
                ..Mapping::default()
            },
        ],
        ..Assumptions::default()
    }
}

fn new_sample_assumptions_secondary() -> Assumptions {
    Assumptions {
        all_roles: false,
        mappings: vec![Mapping {
            role_arn: "arn:aws:iam::123456789012:role/admin".to_string(),
            profile_name: Some("admin".to_string()),
            region: Some("us-west-2".to_string()),
            sponsor_creds_arn: Some("arn:aws:iam::123456789012:role/sub-admin".to_string()),
            ..Mapping::default()
        }],
        ..Assumptions::default()
    }
}

/// Builds a fully populated sample [`Config`] covering both flow kinds.
pub fn generate_config_skeleton() -> Config {
    let flow1 = Flow {
        name: "sample-permanent-creds-mfa".to_string(),
        allow_failure: true,
        perm_creds_config: Some(new_sample_perm_mfa()),
        primary: Some(new_sample_assumptions_primary()),
        ..Flow::default()
    };
    let mut flow2 = Flow {
        name: "sample-saml".to_string(),
        allow_failure: false,
        region: Some("us-east-2".to_string()),
        saml_config: Some(new_sample_saml_config()),
        primary: Some(new_sample_assumptions_primary()),
        secondary: Some(new_sample_assumptions_secondary()),
        do_not_propagate_region: true,
        ..Flow::default()
    };
    if let Some(primary) = &mut flow2.primary {
        primary.all_roles = true;
    }
    Config {
        out_file: "./path/to/credentials/file".to_string(),
        flows: vec![flow1, flow2],
    }
}

/// Serializes a config to YAML at `path`.
pub async fn write_config_to_file(config: &Config, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let rendered = serde_yaml::to_string(config).context("unable to serialize config")?;
    tokio::fs::write(path, rendered)
        .await
        .with_context(|| format!("unable to write config file {}", path.display()))?;
    Ok(())
}
