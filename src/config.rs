//! Configuration document: an ordered list of auth flows plus the output
//! file, loaded from YAML. Flow validation detects the credential source,
//! checks the region shape, and pushes cascading defaults down onto the
//! assumption tiers.

use std::path::Path;

use anyhow::{bail, Context, Result};
use config::{File, FileFormat};
use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::mapping::{Mapping, MappingDefaults, SamlDurationPolicy};
use crate::ui;

/// Top-level configuration for a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default, rename = "output_file")]
    pub out_file: String,
    #[serde(default)]
    pub flows: Vec<Flow>,
}

/// One authentication flow: starter credentials plus the primary and
/// optional secondary assumption tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Flow {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saml_config: Option<SamlConfig>,
    #[serde(default, rename = "permanent", skip_serializing_if = "Option::is_none")]
    pub perm_creds_config: Option<PermCredsConfig>,
    #[serde(
        default,
        rename = "primary_assumptions",
        skip_serializing_if = "Option::is_none"
    )]
    pub primary: Option<Assumptions>,
    #[serde(
        default,
        rename = "secondary_assumptions",
        skip_serializing_if = "Option::is_none"
    )]
    pub secondary: Option<Assumptions>,
    #[serde(
        default,
        rename = "session_duration_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub do_not_propagate_region: bool,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(skip)]
    pub creds_type: CredsType,
}

/// Credential source detected during validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredsType {
    #[default]
    Unknown,
    Permanent,
    Saml,
}

/// How to obtain session credentials from the local client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermCredsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfa: Option<Mfa>,
}

/// MFA device parameters for a permanent-credential flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mfa {
    pub serial: CParam,
    pub token: CParam,
}

/// Parameters for the SAML login exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamlConfig {
    pub username: CParam,
    pub password: CParam,
    pub url: CParam,
    pub target: CParam,
    #[serde(default)]
    pub allow_mapping_duration_override: bool,
}

/// A late-bound configuration parameter. Rather than a plain value it names
/// a source: `config` (inline value), `env` (variable named by `value`), or
/// `prompt`. [`CParam::gather`] resolves and caches the result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CParam {
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip)]
    pub(crate) name: String,
    #[serde(skip)]
    pub(crate) parent_flow: String,
    #[serde(skip)]
    pub(crate) result: Option<String>,
}

impl CParam {
    pub(crate) fn label(&mut self, name: &str, parent_flow: &str) {
        self.name = name.to_string();
        self.parent_flow = parent_flow.to_string();
    }

    fn validate_source(&self) -> Result<()> {
        match self.source.as_str() {
            "config" | "env" | "prompt" => Ok(()),
            other => bail!("config parameter source '{}' unknown", other),
        }
    }

    /// Resolves the parameter from its source. The first successful gather
    /// is cached, so prompts fire at most once per run.
    pub fn gather(&mut self) -> Result<String> {
        if let Some(result) = &self.result {
            return Ok(result.clone());
        }
        let value = match self.source.as_str() {
            "config" => {
                if self.name == "Password" {
                    bail!(
                        "this program does not support putting password in plaintext in \
                         config file please switch config parameter for password to 'env' \
                         or 'prompt'"
                    );
                }
                self.value.clone().unwrap_or_default()
            }
            "env" => {
                let var = self.value.clone().unwrap_or_default();
                let result = std::env::var(&var).unwrap_or_default();
                if result.is_empty() {
                    bail!("env var '{}' specified for param is empty", var);
                }
                result
            }
            "prompt" => {
                println!("gathering value for flow '{}':", self.parent_flow);
                if self.name == "Password" {
                    ui::get_secret_from_user(&self.name)?
                } else {
                    ui::get_value_from_user(&self.name)?
                }
            }
            other => bail!("config parameter source '{}' unknown", other),
        };
        self.result = Some(value.clone());
        Ok(value)
    }
}

/// The tier a set of assumptions belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Tier {
    #[default]
    Primary,
    Secondary,
}

/// An ordered set of mappings plus the defaults its parent flow cascades
/// onto them during validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Assumptions {
    #[serde(default)]
    pub all_roles: bool,
    #[serde(default)]
    pub mappings: Vec<Mapping>,
    #[serde(skip)]
    pub tier: Tier,
    #[serde(skip)]
    pub duration_seconds: i32,
    #[serde(skip)]
    pub parent_region: Option<String>,
    #[serde(skip)]
    pub do_not_propagate_region: bool,
    #[serde(skip)]
    pub allow_failure: bool,
    #[serde(skip)]
    pub parent_flow: String,
}

impl Assumptions {
    /// Applies per-mapping defaults: effective duration, generated profile
    /// names, and the inherited region.
    pub fn validate_mappings(&mut self, saml: Option<SamlDurationPolicy>) -> Result<()> {
        debug!(
            "validating mappings in assumptions num_mappings={} parent_flow={}",
            self.mappings.len(),
            self.parent_flow
        );
        let defaults = MappingDefaults {
            duration_seconds: self.duration_seconds,
            parent_region: self.parent_region.clone(),
            do_not_propagate_region: self.do_not_propagate_region,
            saml,
        };
        for mapping in &mut self.mappings {
            mapping.validate(&defaults)?;
        }
        Ok(())
    }

    /// Folds SAML-discovered roles into the configured mappings: a
    /// configured mapping picks up its principal ARN, and with `all_roles`
    /// set every unconfigured role becomes a new mapping.
    pub fn merge_saml_roles(&mut self, roles: &[crate::saml::SamlRole]) {
        for role in roles {
            if let Some(mapping) = self
                .mappings
                .iter_mut()
                .find(|mapping| mapping.role_arn == role.role_arn)
            {
                debug!("found configured mapping for role role_arn={}", role.role_arn);
                mapping.saml_principal_arn = Some(role.principal_arn.clone());
                if mapping.profile_name.is_none() {
                    mapping.profile_name = Some(role.identifier.clone());
                }
            } else if self.all_roles {
                debug!("taking new mapping from assertion role_arn={}", role.role_arn);
                self.mappings.push(Mapping::discovered(role));
            } else {
                debug!(
                    "skipping role assumption per configuration directives role_arn={}",
                    role.role_arn
                );
            }
        }
    }
}

const VALID_REGION: &str = r"\w{2}-([a-z]*-){1,2}\d{1}";

impl Flow {
    /// True when the flow has no secondary assumptions.
    pub fn no_secondary(&self) -> bool {
        self.secondary.is_none()
    }

    /// Detects the credential source, checks structure, and pushes flow
    /// settings down onto the assumption tiers.
    pub fn validate(&mut self) -> Result<()> {
        self.creds_type = match (&self.saml_config, &self.perm_creds_config) {
            (Some(_), None) => CredsType::Saml,
            (None, Some(_)) => CredsType::Permanent,
            _ => bail!(
                "only one type of creds can be used for starting each flow please \
                 choose one of: permanent or saml"
            ),
        };
        info!(
            "detected type for flow flow_name={} type={:?}",
            self.name, self.creds_type
        );
        if let Some(saml_config) = &self.saml_config {
            saml_config.username.validate_source()?;
            saml_config.password.validate_source()?;
            saml_config.url.validate_source()?;
            saml_config.target.validate_source()?;
        }
        if let Some(perm) = &self.perm_creds_config {
            if let Some(mfa) = &perm.mfa {
                mfa.serial.validate_source()?;
                mfa.token.validate_source()?;
            }
        }
        if let Some(region) = &self.region {
            debug!("flow: detected user specified region so validating it");
            let valid_region = Regex::new(VALID_REGION).unwrap();
            if !valid_region.is_match(region) {
                bail!("region must match '{}'", VALID_REGION);
            }
        }
        if self.duration_seconds.is_none() {
            self.duration_seconds = Some(3600);
        }
        if self.primary.is_none() && self.secondary.is_none() {
            bail!("please specify primary or secondary assumption criteria");
        }
        let name = self.name.clone();
        let region = self.region.clone();
        let do_not_propagate = self.do_not_propagate_region;
        let allow_failure = self.allow_failure;
        let duration = self.duration_seconds.unwrap_or(3600);
        let mut wire = |assumptions: &mut Assumptions, tier: Tier| {
            assumptions.tier = tier;
            assumptions.parent_flow = name.clone();
            assumptions.duration_seconds = duration;
            assumptions.allow_failure = allow_failure;
            if !do_not_propagate && region.is_some() {
                assumptions.parent_region = region.clone();
            } else {
                assumptions.do_not_propagate_region = true;
            }
        };
        if let Some(primary) = &mut self.primary {
            wire(primary, Tier::Primary);
        }
        if let Some(secondary) = &mut self.secondary {
            wire(secondary, Tier::Secondary);
        }
        Ok(())
    }
}

impl Config {
    /// Parses a YAML config file and wires up the prompt labels.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let loaded = config::Config::builder()
            .add_source(File::new(
                path.to_str().context("config path is not valid utf-8")?,
                FileFormat::Yaml,
            ))
            .build()
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let mut config: Config = loaded
            .try_deserialize()
            .with_context(|| format!("unable to parse config file {}", path.display()))?;
        config.label_cparams();
        Ok(config)
    }

    /// Parses a YAML config document from a string.
    pub fn from_str(raw: &str) -> Result<Self> {
        let loaded = config::Config::builder()
            .add_source(File::from_str(raw, FileFormat::Yaml))
            .build()
            .context("unable to read config document")?;
        let mut config: Config = loaded
            .try_deserialize()
            .context("unable to parse config document")?;
        config.label_cparams();
        Ok(config)
    }

    // Attach names to CParams so prompts can say what they are asking for.
    fn label_cparams(&mut self) {
        for flow in &mut self.flows {
            let flow_name = flow.name.clone();
            if let Some(saml_config) = &mut flow.saml_config {
                saml_config.username.label("Username", &flow_name);
                saml_config.password.label("Password", &flow_name);
                saml_config.url.label("URL", &flow_name);
                saml_config.target.label("Target", &flow_name);
            }
            if let Some(perm) = &mut flow.perm_creds_config {
                if let Some(mfa) = &mut perm.mfa {
                    mfa.serial.label("Serial", &flow_name);
                    mfa.token.label("Token", &flow_name);
                }
            }
        }
    }

    /// Validates every flow; any structural problem aborts the run before
    /// side effects.
    pub fn validate(&mut self) -> Result<()> {
        if self.flows.is_empty() {
            bail!("config document defines no flows");
        }
        for flow in &mut self.flows {
            flow.validate()
                .with_context(|| format!("flow '{}' is invalid", flow.name))?;
        }
        Ok(())
    }

    /// Returns the full parsed configuration as YAML.
    pub fn dump(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }
}
