//! Conversion of the legacy CLI surface (a JSON roles file or a single
//! role ARN plus MFA flags) into a one-flow config document.

use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use serde::Deserialize;

use crate::config::{Assumptions, CParam, Config, Flow, Mfa, PermCredsConfig};
use crate::mapping::Mapping;

const MIN_SESSION_DURATION: i32 = 900;

/// One entry of the legacy roles file.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyAccount {
    #[serde(rename = "RoleArn")]
    pub role_arn: String,
    #[serde(rename = "AccountName")]
    pub account_name: String,
    #[serde(rename = "Region", default)]
    pub region: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyConfiguration {
    #[serde(rename = "Roles", default)]
    roles: Vec<LegacyAccount>,
}

/// Flag values carried over from the legacy command line.
#[derive(Debug, Clone, Default)]
pub struct LegacyFlags {
    pub out_file: String,
    pub role_arn: Option<String>,
    pub roles_file: Option<String>,
    pub profile: Option<String>,
    pub serial_number: Option<String>,
    pub token_code: Option<String>,
    pub region: Option<String>,
    pub profile_entry_name: String,
    pub session_duration: i32,
}

/// Loads the legacy `{"Roles": [...]}` JSON document.
pub fn load_legacy_roles_file(path: impl AsRef<Path>) -> Result<Vec<LegacyAccount>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("unable to open roles file {}", path.display()))?;
    let config: LegacyConfiguration = serde_json::from_reader(file)
        .with_context(|| format!("unable to parse roles file {}", path.display()))?;
    debug!("done loading roles file num_roles={}", config.roles.len());
    Ok(config.roles)
}

fn convert_accounts_to_mappings(accounts: &[LegacyAccount]) -> Vec<Mapping> {
    let mappings: Vec<Mapping> = accounts
        .iter()
        .map(|account| Mapping {
            role_arn: account.role_arn.clone(),
            profile_name: Some(account.account_name.clone()),
            region: account.region.clone(),
            ..Mapping::default()
        })
        .collect();
    debug!(
        "converted roles to mappings num_roles={} num_mappings={}",
        accounts.len(),
        mappings.len()
    );
    mappings
}

/// Builds a single synthetic flow out of the legacy flags so the rest of
/// the engine never has to know about them.
pub fn convert_legacy_flags_to_config(flags: &LegacyFlags) -> Result<Config> {
    debug!("starting legacy flag conversion");
    let mut mappings = Vec::new();
    if let Some(roles_file) = &flags.roles_file {
        info!("attempting to convert legacy roles file to mappings");
        let accounts = load_legacy_roles_file(roles_file)?;
        mappings = convert_accounts_to_mappings(&accounts);
    } else if let Some(role_arn) = &flags.role_arn {
        let account = LegacyAccount {
            role_arn: role_arn.clone(),
            account_name: flags.profile_entry_name.clone(),
            region: flags.region.clone(),
        };
        mappings = convert_accounts_to_mappings(&[account]);
    }
    if mappings.is_empty() {
        bail!("must specify a role arn or a roles file");
    }
    if flags.session_duration < MIN_SESSION_DURATION {
        bail!(
            "session duration is outside threshold min={}",
            MIN_SESSION_DURATION
        );
    }

    let mut perm = PermCredsConfig {
        profile_name: flags.profile.clone(),
        mfa: None,
    };
    if let (Some(serial), Some(token)) = (&flags.serial_number, &flags.token_code) {
        let mut serial_param = CParam {
            source: "config".to_string(),
            value: Some(serial.clone()),
            ..CParam::default()
        };
        serial_param.label("Serial", "gossamer-legacy");
        let mut token_param = CParam {
            source: "config".to_string(),
            value: Some(token.clone()),
            ..CParam::default()
        };
        token_param.label("Token", "gossamer-legacy");
        perm.mfa = Some(Mfa {
            serial: serial_param,
            token: token_param,
        });
    }

    let flow = Flow {
        name: "gossamer-legacy".to_string(),
        perm_creds_config: Some(perm),
        primary: Some(Assumptions {
            mappings,
            ..Assumptions::default()
        }),
        duration_seconds: Some(flags.session_duration),
        region: flags.region.clone(),
        ..Flow::default()
    };
    Ok(Config {
        out_file: flags.out_file.clone(),
        flows: vec![flow],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_flags() -> LegacyFlags {
        LegacyFlags {
            out_file: "./gossamer_creds".to_string(),
            profile_entry_name: "gossamer".to_string(),
            session_duration: 3600,
            ..LegacyFlags::default()
        }
    }

    #[test]
    fn roles_file_converts_to_primary_mappings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"Roles": [
                {{"RoleArn": "arn:aws:iam::123456789012:role/collectd", "AccountName": "dev", "Region": "us-east-1"}},
                {{"RoleArn": "arn:aws:iam::210987654321:role/collectd", "AccountName": "prod"}}
            ]}}"#
        )
        .unwrap();
        let mut flags = base_flags();
        flags.roles_file = Some(file.path().to_str().unwrap().to_string());

        let mut config = convert_legacy_flags_to_config(&flags).unwrap();
        config.validate().unwrap();
        assert_eq!(config.flows.len(), 1);
        let flow = &config.flows[0];
        assert_eq!(flow.name, "gossamer-legacy");
        let mappings = &flow.primary.as_ref().unwrap().mappings;
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].profile_name.as_deref(), Some("dev"));
        assert_eq!(mappings[0].region.as_deref(), Some("us-east-1"));
        assert_eq!(mappings[1].profile_name.as_deref(), Some("prod"));
        assert_eq!(mappings[1].region, None);
    }

    #[test]
    fn single_role_arn_converts_with_mfa() {
        let mut flags = base_flags();
        flags.role_arn = Some("arn:aws:iam::123456789012:role/collectd".to_string());
        flags.profile_entry_name = "test-env".to_string();
        flags.serial_number = Some("sampleserial".to_string());
        flags.token_code = Some("123456".to_string());
        flags.profile = Some("dev".to_string());

        let config = convert_legacy_flags_to_config(&flags).unwrap();
        let flow = &config.flows[0];
        let perm = flow.perm_creds_config.as_ref().unwrap();
        assert_eq!(perm.profile_name.as_deref(), Some("dev"));
        assert!(perm.mfa.is_some());
        let mappings = &flow.primary.as_ref().unwrap().mappings;
        assert_eq!(mappings[0].profile_name.as_deref(), Some("test-env"));
    }

    #[test]
    fn missing_role_sources_is_an_error() {
        let err = convert_legacy_flags_to_config(&base_flags()).unwrap_err();
        assert!(err.to_string().contains("role arn or a roles file"));
    }

    #[test]
    fn short_duration_is_rejected() {
        let mut flags = base_flags();
        flags.role_arn = Some("arn:aws:iam::123456789012:role/collectd".to_string());
        flags.session_duration = 600;
        let err = convert_legacy_flags_to_config(&flags).unwrap_err();
        assert!(err.to_string().contains("outside threshold"));
    }
}
