//! Flow execution: obtain a base session for the flow's credential source,
//! run the primary assumption tier concurrently, then the secondary tier,
//! and collect the resulting profile entries.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::{debug, error, info};
use tokio::sync::mpsc;

use crate::config::{CredsType, Flow};
use crate::credfile::ProfileEntryInput;
use crate::mapping::{
    AssumeContext, Mapping, SamlDurationPolicy, SponsorCredential, TierContext,
};
use crate::saml::SamlSession;
use crate::sts::{generate_role_session_name, GetSessionTokenRequest, StsFactory};

impl Flow {
    /// Runs the full flow: primary assumptions from the detected credential
    /// source, then secondary assumptions sponsored by the primary results.
    pub async fn execute(&mut self, factory: &Arc<dyn StsFactory>) -> Result<()> {
        match self.creds_type {
            CredsType::Permanent => self.execute_permanent(factory).await,
            CredsType::Saml => self.execute_saml(factory).await,
            CredsType::Unknown => bail!("unable to determine flow type"),
        }
    }

    async fn execute_permanent(&mut self, factory: &Arc<dyn StsFactory>) -> Result<()> {
        info!(
            "getting session from permanent credentials flow_name={}",
            self.name
        );
        let profile_name = self
            .perm_creds_config
            .as_ref()
            .and_then(|perm| perm.profile_name.clone());
        let base = factory
            .base_client(profile_name.as_deref(), self.region.as_deref())
            .await
            .context("unable to establish initial session")?;

        // the role session name comes from the pre-MFA identity so the
        // label survives the session-token swap
        let role_session_name = generate_role_session_name(base.as_ref()).await;
        debug!(
            "stamped role session name role_session_name={}",
            role_session_name
        );

        debug!("checking for presence of MFA");
        let mut sts = base;
        if let Some(mfa) = self
            .perm_creds_config
            .as_mut()
            .and_then(|perm| perm.mfa.as_mut())
        {
            let serial = mfa.serial.gather()?;
            let token = mfa.token.gather()?;
            let request = GetSessionTokenRequest {
                serial_number: Some(serial),
                token_code: Some(token),
                duration_seconds: None,
            };
            let session_credential = sts.get_session_token(&request).await?;
            sts = factory
                .static_client(&session_credential, self.region.as_deref())
                .await?;
        }

        if let Some(primary) = &mut self.primary {
            info!("starting primary assumptions flow_name={}", self.name);
            primary.validate_mappings(None)?;
            let ctx = AssumeContext {
                role_session_name: role_session_name.clone(),
                tier: TierContext::PermanentPrimary { sts: sts.clone() },
            };
            let mappings = std::mem::take(&mut primary.mappings);
            primary.mappings = assume_mappings_concurrent(mappings, Arc::new(ctx)).await;
        }
        self.execute_secondary(factory, role_session_name).await
    }

    async fn execute_saml(&mut self, factory: &Arc<dyn StsFactory>) -> Result<()> {
        let saml_config = self
            .saml_config
            .as_mut()
            .context("flow carries no saml configuration")?;
        let username = saml_config.username.gather()?;
        let password = saml_config.password.gather()?;
        let url = saml_config.url.gather()?;
        let target = saml_config.target.gather()?;
        let allow_override = saml_config.allow_mapping_duration_override;

        let session = SamlSession::start(&self.name, &username, &password, &url, &target).await?;
        let role_session_name = session
            .decoded
            .role_session_name
            .clone()
            .unwrap_or_else(|| "gossamer".to_string());
        debug!(
            "setting role session name on assumptions role_session_name={}",
            role_session_name
        );
        let sts = factory.anonymous_client(self.region.as_deref()).await?;

        if let Some(primary) = &mut self.primary {
            info!("starting primary assumptions flow_name={}", self.name);
            primary.merge_saml_roles(&session.decoded.roles);
            primary.validate_mappings(Some(SamlDurationPolicy {
                session_duration: session.decoded.session_duration(),
                allow_mapping_duration_override: allow_override,
            }))?;
            let ctx = AssumeContext {
                role_session_name: role_session_name.clone(),
                tier: TierContext::SamlPrimary {
                    sts: sts.clone(),
                    assertion: session.assertion.clone(),
                },
            };
            let mappings = std::mem::take(&mut primary.mappings);
            primary.mappings = assume_mappings_concurrent(mappings, Arc::new(ctx)).await;
        }
        self.execute_secondary(factory, role_session_name).await
    }

    // Secondary assumptions run the same concurrent pattern; the role
    // session name carries over from the primary tier unchanged so chained
    // roles stay tied to the same principal.
    async fn execute_secondary(
        &mut self,
        factory: &Arc<dyn StsFactory>,
        role_session_name: String,
    ) -> Result<()> {
        let sponsors: Vec<SponsorCredential> = self
            .primary
            .as_ref()
            .map(|primary| {
                primary
                    .mappings
                    .iter()
                    .map(|mapping| SponsorCredential {
                        role_arn: mapping.role_arn.clone(),
                        credential: mapping.credential.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        match &mut self.secondary {
            Some(secondary) => {
                info!("starting secondary assumptions flow_name={}", self.name);
                secondary.validate_mappings(None)?;
                let ctx = AssumeContext {
                    role_session_name,
                    tier: TierContext::Secondary {
                        factory: factory.clone(),
                        sponsors,
                    },
                };
                let mappings = std::mem::take(&mut secondary.mappings);
                secondary.mappings = assume_mappings_concurrent(mappings, Arc::new(ctx)).await;
            }
            None => {
                info!(
                    "no secondary assumptions detected so skipping flow_name={}",
                    self.name
                );
            }
        }
        Ok(())
    }

    /// Collects write requests for every assumed mapping that wants output.
    /// A tier that produced no credentials fails the flow unless it allows
    /// failure.
    pub fn profile_entry_inputs(&self) -> Result<Vec<ProfileEntryInput>> {
        let mut inputs = Vec::new();
        let tiers = [self.primary.as_ref(), self.secondary.as_ref()];
        for assumptions in tiers.into_iter().flatten() {
            let mut count_success = 0;
            let mut count_fail = 0;
            for mapping in &assumptions.mappings {
                if mapping.no_output {
                    info!(
                        "skipping writing cred per configuration directive role_arn={}",
                        mapping.role_arn
                    );
                    continue;
                }
                match &mapping.credential {
                    Some(credential) => {
                        debug!(
                            "put credential in write queue role_arn={} profile_name={}",
                            mapping.role_arn,
                            mapping.profile_name.as_deref().unwrap_or_default()
                        );
                        inputs.push(ProfileEntryInput {
                            credential: credential.clone(),
                            profile_name: mapping
                                .profile_name
                                .clone()
                                .unwrap_or_default(),
                            region: mapping.region.clone(),
                            role_arn: mapping.role_arn.clone(),
                            description: self.name.clone(),
                        });
                        count_success += 1;
                    }
                    None => {
                        error!("error retrieving credential for {}", mapping.role_arn);
                        count_fail += 1;
                    }
                }
            }
            if count_fail > 0 {
                info!(
                    "failed to obtain some credentials for write queue count_fail={} count_success={}",
                    count_fail, count_success
                );
            }
            if count_success == 0 && !assumptions.allow_failure {
                bail!("failed to queue any desired credentials");
            }
        }
        Ok(inputs)
    }
}

/// Runs every mapping of a tier in its own task, posting outcomes to a
/// shared channel. The first mapping is awaited before the rest are
/// dispatched so a shared session warmup happens once instead of racing
/// across all tasks.
pub(crate) async fn assume_mappings_concurrent(
    mappings: Vec<Mapping>,
    ctx: Arc<AssumeContext>,
) -> Vec<Mapping> {
    let total = mappings.len();
    if total == 0 {
        return mappings;
    }
    let (tx, mut rx) = mpsc::channel::<(usize, Mapping)>(total);
    let mut slots: Vec<Option<Mapping>> = std::iter::repeat_with(|| None).take(total).collect();
    let mut remaining = mappings.into_iter().enumerate();

    if let Some((index, mapping)) = remaining.next() {
        spawn_assume(index, mapping, ctx.clone(), tx.clone());
        if let Some((index, mapping)) = rx.recv().await {
            slots[index] = Some(mapping);
        }
    }
    let mut outstanding = 0;
    for (index, mapping) in remaining {
        spawn_assume(index, mapping, ctx.clone(), tx.clone());
        outstanding += 1;
    }
    drop(tx);
    for _ in 0..outstanding {
        match rx.recv().await {
            Some((index, mapping)) => slots[index] = Some(mapping),
            None => break,
        }
    }
    slots.into_iter().flatten().collect()
}

fn spawn_assume(
    index: usize,
    mapping: Mapping,
    ctx: Arc<AssumeContext>,
    tx: mpsc::Sender<(usize, Mapping)>,
) {
    tokio::spawn(async move {
        let mapping = mapping.assume(&ctx).await;
        let _ = tx.send((index, mapping)).await;
    });
}
