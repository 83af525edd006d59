//! A mapping is one planned role assumption together with its desired
//! profile-entry binding. Mappings are created from config or discovered in
//! a SAML assertion, validated against their tier's cascading defaults, and
//! finally assumed inside their own task.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::arn::role_unique_id;
use crate::saml::SamlRole;
use crate::sts::{
    assume_role_with_client, assume_saml_role_with_client, AssumeRoleRequest,
    AssumeRoleWithSamlRequest, Credential, Sts, StsFactory,
};

const DEFAULT_DURATION_SECONDS: i32 = 3600;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mapping {
    pub role_arn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub no_output: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sponsor_creds_arn: Option<String>,
    #[serde(
        default,
        rename = "session_duration_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_seconds: Option<i32>,
    #[serde(skip)]
    pub saml_principal_arn: Option<String>,
    #[serde(skip)]
    pub credential: Option<Credential>,
}

/// Defaults a mapping inherits from its tier during validation.
#[derive(Debug, Clone, Default)]
pub struct MappingDefaults {
    pub duration_seconds: i32,
    pub parent_region: Option<String>,
    pub do_not_propagate_region: bool,
    pub saml: Option<SamlDurationPolicy>,
}

/// How an IdP-asserted session duration interacts with per-mapping
/// durations.
#[derive(Debug, Clone)]
pub struct SamlDurationPolicy {
    pub session_duration: i32,
    pub allow_mapping_duration_override: bool,
}

/// The shared material a tier hands to each of its mappings at assume time.
pub struct AssumeContext {
    pub role_session_name: String,
    pub tier: TierContext,
}

pub enum TierContext {
    /// Primary tier of a permanent-credential flow: every mapping assumes
    /// through the flow's shared session.
    PermanentPrimary { sts: Arc<dyn Sts> },
    /// Primary tier of a SAML flow: assumptions ride the assertion on an
    /// unsigned session.
    SamlPrimary { sts: Arc<dyn Sts>, assertion: String },
    /// Secondary tier: each mapping locates a sponsor credential from the
    /// primary tier and seats a fresh session on it.
    Secondary {
        factory: Arc<dyn StsFactory>,
        sponsors: Vec<SponsorCredential>,
    },
}

/// A primary mapping's outcome as visible to the secondary tier.
#[derive(Debug, Clone)]
pub struct SponsorCredential {
    pub role_arn: String,
    pub credential: Option<Credential>,
}

impl Mapping {
    /// Builds a mapping for a role discovered in a SAML assertion that had
    /// no configured counterpart.
    pub fn discovered(role: &SamlRole) -> Self {
        Self {
            role_arn: role.role_arn.clone(),
            profile_name: Some(role.identifier.clone()),
            saml_principal_arn: Some(role.principal_arn.clone()),
            ..Self::default()
        }
    }

    /// Resolves defaults that always need to be in place before the mapping
    /// can be assumed or written out: effective duration, profile name, and
    /// inherited region.
    pub fn validate(&mut self, defaults: &MappingDefaults) -> Result<()> {
        self.duration_seconds = Some(self.resolve_duration(defaults));
        if self.profile_name.is_none() {
            debug!("detected missing profile name role_arn={}", self.role_arn);
            let uid = role_unique_id(&self.role_arn)?;
            debug!("set profile name profile_name={}", uid);
            self.profile_name = Some(uid);
        }
        if !defaults.do_not_propagate_region && self.region.is_none() {
            self.region = defaults.parent_region.clone();
        }
        Ok(())
    }

    fn resolve_duration(&self, defaults: &MappingDefaults) -> i32 {
        match &defaults.saml {
            Some(policy) if policy.allow_mapping_duration_override => self
                .duration_seconds
                .filter(|&d| d != 0)
                .or_else(|| Some(policy.session_duration).filter(|&d| d > 0))
                .unwrap_or(DEFAULT_DURATION_SECONDS),
            Some(policy) => {
                if policy.session_duration > 0 {
                    policy.session_duration
                } else {
                    DEFAULT_DURATION_SECONDS
                }
            }
            None => self
                .duration_seconds
                .filter(|&d| d != 0)
                .unwrap_or(defaults.duration_seconds),
        }
    }

    /// Attempts the assumption, storing the credential on success. Failures
    /// are logged and leave the credential unset; the tier carries on.
    pub async fn assume(mut self, ctx: &AssumeContext) -> Self {
        match self.try_assume(ctx).await {
            Ok(credential) => {
                info!(
                    "successfully assumed role role_arn={} profile_name={}",
                    self.role_arn,
                    self.profile_name.as_deref().unwrap_or_default()
                );
                self.credential = Some(credential);
            }
            Err(err) => {
                error!(
                    "error assuming role role_arn={} error={:#}",
                    self.role_arn, err
                );
            }
        }
        self
    }

    async fn try_assume(&self, ctx: &AssumeContext) -> Result<Credential> {
        match &ctx.tier {
            TierContext::SamlPrimary { sts, assertion } => {
                let principal_arn = self.saml_principal_arn.clone().with_context(|| {
                    format!("role '{}' not present in SAML assertion", self.role_arn)
                })?;
                let request = AssumeRoleWithSamlRequest {
                    role_arn: Some(self.role_arn.clone()),
                    principal_arn: Some(principal_arn),
                    saml_assertion: Some(assertion.clone()),
                    duration_seconds: self.duration_seconds,
                };
                assume_saml_role_with_client(sts.as_ref(), &request).await
            }
            TierContext::PermanentPrimary { sts } => {
                let request = AssumeRoleRequest {
                    role_arn: Some(self.role_arn.clone()),
                    role_session_name: Some(ctx.role_session_name.clone()),
                    duration_seconds: self.duration_seconds,
                };
                assume_role_with_client(sts.as_ref(), &request).await
            }
            TierContext::Secondary { factory, sponsors } => {
                let sponsor = self
                    .resolve_sponsor_credential(sponsors)
                    .context("error getting sponsor creds for secondary mapping")?;
                let sts = factory.static_client(sponsor, None).await?;
                let request = AssumeRoleRequest {
                    role_arn: Some(self.role_arn.clone()),
                    role_session_name: Some(ctx.role_session_name.clone()),
                    duration_seconds: self.duration_seconds,
                };
                assume_role_with_client(sts.as_ref(), &request).await
            }
        }
    }

    /// Locates the primary-tier credential sponsoring this mapping: the
    /// explicitly named one, or the single primary mapping's when the
    /// config leaves it implicit and no ambiguity exists.
    fn resolve_sponsor_credential<'a>(
        &self,
        sponsors: &'a [SponsorCredential],
    ) -> Result<&'a Credential> {
        let sponsor = match &self.sponsor_creds_arn {
            Some(arn) => sponsors
                .iter()
                .find(|sponsor| &sponsor.role_arn == arn)
                .with_context(|| format!("credentials not found for {}", arn))?,
            None if sponsors.len() == 1 => {
                debug!(
                    "inferring sponsor creds from the single primary mapping role_arn={}",
                    sponsors[0].role_arn
                );
                &sponsors[0]
            }
            None => bail!(
                "no sponsor_creds_arn specified for secondary mapping '{}' and too many \
                 primary mappings to make an inference",
                self.role_arn
            ),
        };
        sponsor
            .credential
            .as_ref()
            .with_context(|| format!("credential is nil for {}", sponsor.role_arn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sts::testing::{fake_credential, MockFactory, MockSts};

    fn sponsor(role_arn: &str, credential: Option<Credential>) -> SponsorCredential {
        SponsorCredential {
            role_arn: role_arn.to_string(),
            credential,
        }
    }

    fn secondary_mapping(sponsor_arn: Option<&str>) -> Mapping {
        Mapping {
            role_arn: "arn:aws:iam::123456789012:role/admin".to_string(),
            sponsor_creds_arn: sponsor_arn.map(str::to_string),
            ..Mapping::default()
        }
    }

    #[test]
    fn sponsor_inferred_from_single_primary_mapping() {
        let mapping = secondary_mapping(None);
        let sponsors = vec![sponsor(
            "arn:aws:iam::123456789012:role/sub-admin",
            Some(fake_credential()),
        )];
        let credential = mapping.resolve_sponsor_credential(&sponsors).unwrap();
        assert_eq!(*credential, fake_credential());
    }

    #[test]
    fn sponsor_ambiguous_with_multiple_primary_mappings() {
        let mapping = secondary_mapping(None);
        let sponsors = vec![
            sponsor("arn:aws:iam::123456789012:role/sub-admin", Some(fake_credential())),
            sponsor("arn:aws:iam::123456789012:role/role2", Some(fake_credential())),
        ];
        let err = mapping.resolve_sponsor_credential(&sponsors).unwrap_err();
        assert!(err.to_string().contains("too many primary mappings"));
    }

    #[test]
    fn sponsor_found_by_explicit_arn() {
        let mapping = secondary_mapping(Some("arn:aws:iam::123456789012:role/role2"));
        let sponsors = vec![
            sponsor("arn:aws:iam::123456789012:role/sub-admin", None),
            sponsor("arn:aws:iam::123456789012:role/role2", Some(fake_credential())),
        ];
        let credential = mapping.resolve_sponsor_credential(&sponsors).unwrap();
        assert_eq!(*credential, fake_credential());
    }

    #[test]
    fn sponsor_unknown_arn_is_an_error() {
        let mapping = secondary_mapping(Some("arn:aws:iam::123456789012:role/ghost"));
        let sponsors = vec![sponsor(
            "arn:aws:iam::123456789012:role/sub-admin",
            Some(fake_credential()),
        )];
        let err = mapping.resolve_sponsor_credential(&sponsors).unwrap_err();
        assert!(err.to_string().contains("credentials not found for"));
    }

    #[test]
    fn sponsor_without_credential_is_an_error() {
        let mapping = secondary_mapping(None);
        let sponsors = vec![sponsor("arn:aws:iam::123456789012:role/sub-admin", None)];
        let err = mapping.resolve_sponsor_credential(&sponsors).unwrap_err();
        assert!(err.to_string().contains("credential is nil for"));
    }

    #[tokio::test]
    async fn secondary_assume_uses_sponsor_credential() {
        let factory = Arc::new(MockFactory::new());
        let ctx = AssumeContext {
            role_session_name: "gossamer-cool-dude".to_string(),
            tier: TierContext::Secondary {
                factory: factory.clone(),
                sponsors: vec![sponsor(
                    "arn:aws:iam::123456789012:role/sub-admin",
                    Some(fake_credential()),
                )],
            },
        };
        let mut mapping = secondary_mapping(None);
        mapping.duration_seconds = Some(3600);
        let mapping = mapping.assume(&ctx).await;
        assert!(mapping.credential.is_some());
        assert_eq!(factory.static_seats.lock().unwrap().len(), 1);
        assert_eq!(factory.static_seats.lock().unwrap()[0], fake_credential());
        let requests = factory.stat.assume_role_requests.lock().unwrap();
        assert_eq!(
            requests[0].role_session_name.as_deref(),
            Some("gossamer-cool-dude")
        );
    }

    #[tokio::test]
    async fn saml_mapping_without_discovered_principal_fails() {
        let sts = Arc::new(MockSts::new());
        let ctx = AssumeContext {
            role_session_name: "gossamer".to_string(),
            tier: TierContext::SamlPrimary {
                sts: sts.clone(),
                assertion: "somereallylongstring".to_string(),
            },
        };
        let mapping = Mapping {
            role_arn: "arn:aws:iam::123456789012:role/sub-admin".to_string(),
            duration_seconds: Some(3600),
            ..Mapping::default()
        };
        let mapping = mapping.assume(&ctx).await;
        assert!(mapping.credential.is_none());
        assert!(sts.saml_requests.lock().unwrap().is_empty());
    }

    #[test]
    fn duration_cascades_from_tier_when_unset() {
        let mut mapping = Mapping {
            role_arn: "arn:aws:iam::123456789012:role/sub-admin".to_string(),
            ..Mapping::default()
        };
        let defaults = MappingDefaults {
            duration_seconds: 43200,
            ..MappingDefaults::default()
        };
        mapping.validate(&defaults).unwrap();
        assert_eq!(mapping.duration_seconds, Some(43200));
    }

    #[test]
    fn mapping_duration_wins_without_saml_policy() {
        let mut mapping = Mapping {
            role_arn: "arn:aws:iam::123456789012:role/sub-admin".to_string(),
            duration_seconds: Some(600),
            ..Mapping::default()
        };
        let defaults = MappingDefaults {
            duration_seconds: 43200,
            ..MappingDefaults::default()
        };
        mapping.validate(&defaults).unwrap();
        assert_eq!(mapping.duration_seconds, Some(600));
    }

    #[test]
    fn asserted_duration_wins_unless_override_allowed() {
        let defaults_no_override = MappingDefaults {
            duration_seconds: 3600,
            saml: Some(SamlDurationPolicy {
                session_duration: 9000,
                allow_mapping_duration_override: false,
            }),
            ..MappingDefaults::default()
        };
        let mut mapping = Mapping {
            role_arn: "arn:aws:iam::123456789012:role/sub-admin".to_string(),
            duration_seconds: Some(600),
            ..Mapping::default()
        };
        mapping.validate(&defaults_no_override).unwrap();
        assert_eq!(mapping.duration_seconds, Some(9000));

        let defaults_override = MappingDefaults {
            duration_seconds: 3600,
            saml: Some(SamlDurationPolicy {
                session_duration: 9000,
                allow_mapping_duration_override: true,
            }),
            ..MappingDefaults::default()
        };
        let mut mapping = Mapping {
            role_arn: "arn:aws:iam::123456789012:role/sub-admin".to_string(),
            duration_seconds: Some(600),
            ..Mapping::default()
        };
        mapping.validate(&defaults_override).unwrap();
        assert_eq!(mapping.duration_seconds, Some(600));
    }

    #[test]
    fn saml_duration_pins_to_default_when_nothing_set() {
        let defaults = MappingDefaults {
            duration_seconds: 43200,
            saml: Some(SamlDurationPolicy {
                session_duration: 0,
                allow_mapping_duration_override: false,
            }),
            ..MappingDefaults::default()
        };
        let mut mapping = Mapping {
            role_arn: "arn:aws:iam::123456789012:role/sub-admin".to_string(),
            ..Mapping::default()
        };
        mapping.validate(&defaults).unwrap();
        assert_eq!(mapping.duration_seconds, Some(3600));
    }

    #[test]
    fn profile_name_defaults_to_unique_id() {
        let mut mapping = Mapping {
            role_arn: "arn:aws:iam::123456789012:role/sub-admin".to_string(),
            ..Mapping::default()
        };
        mapping
            .validate(&MappingDefaults {
                duration_seconds: 3600,
                ..MappingDefaults::default()
            })
            .unwrap();
        assert_eq!(
            mapping.profile_name.as_deref(),
            Some("123456789012_sub-admin")
        );
    }

    #[test]
    fn region_inherited_unless_propagation_disabled() {
        let mut mapping = Mapping {
            role_arn: "arn:aws:iam::123456789012:role/sub-admin".to_string(),
            ..Mapping::default()
        };
        mapping
            .validate(&MappingDefaults {
                duration_seconds: 3600,
                parent_region: Some("us-east-2".to_string()),
                ..MappingDefaults::default()
            })
            .unwrap();
        assert_eq!(mapping.region.as_deref(), Some("us-east-2"));

        let mut mapping = Mapping {
            role_arn: "arn:aws:iam::123456789012:role/sub-admin".to_string(),
            ..Mapping::default()
        };
        mapping
            .validate(&MappingDefaults {
                duration_seconds: 3600,
                parent_region: Some("us-east-2".to_string()),
                do_not_propagate_region: true,
                ..MappingDefaults::default()
            })
            .unwrap();
        assert_eq!(mapping.region, None);
    }
}
