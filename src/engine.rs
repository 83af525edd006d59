//! Drives a validated config: flows execute sequentially in config order,
//! and each flow's credentials are reconciled into the output file before
//! the next flow begins.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use log::info;

use crate::arn::role_unique_id;
use crate::config::Config;
use crate::credfile::CredFile;
use crate::sts::StsFactory;

/// Executes every flow and commits the resulting profile entries.
pub async fn run(config: &mut Config, factory: Arc<dyn StsFactory>) -> Result<()> {
    let out_file = config.out_file.clone();
    if out_file.is_empty() {
        bail!("no output file configured");
    }
    for flow in &mut config.flows {
        info!("beginning flow flow_name={}", flow.name);
        flow.execute(&factory).await?;
        let inputs = flow.profile_entry_inputs()?;
        let mut credfile = CredFile::open(&out_file).await?;
        let generated = Utc::now();
        for input in &inputs {
            credfile.queue_assert(input.entry_name(), input.body_lines(generated));
        }
        credfile.commit().await?;
        info!(
            "completed flow flow_name={} credentials_written={}",
            flow.name,
            inputs.len()
        );
    }
    Ok(())
}

/// Deletes every profile entry the config would manage and commits.
pub async fn purge(config: &Config, out_file: &str) -> Result<()> {
    let mut credfile = CredFile::open(out_file).await?;
    for flow in &config.flows {
        let tiers = [flow.primary.as_ref(), flow.secondary.as_ref()];
        for assumptions in tiers.into_iter().flatten() {
            for mapping in &assumptions.mappings {
                let name = match &mapping.profile_name {
                    Some(name) => name.clone(),
                    None => role_unique_id(&mapping.role_arn)?,
                };
                info!("queueing entry for deletion profile_name={}", name);
                credfile.queue_delete(format!("[{}]", name));
            }
        }
    }
    credfile.commit().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sts::testing::MockFactory;

    fn sample_config(out_file: &str) -> Config {
        let raw = format!(
            r#"output_file: {}
flows:
- name: integration
  permanent:
    profile_name: dev
  region: us-west-2
  primary_assumptions:
    all_roles: false
    mappings:
    - role_arn: arn:aws:iam::123456789012:role/sub-admin
    - role_arn: arn:aws:iam::123456789012:role/role2
      profile_name: role2
"#,
            out_file
        );
        let mut config = Config::from_str(&raw).unwrap();
        config.validate().unwrap();
        config
    }

    #[tokio::test]
    async fn run_writes_profile_entries_and_stays_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let out_file = dir.path().join("credentials");
        let out_file = out_file.to_str().unwrap();
        let mut config = sample_config(out_file);
        let factory: Arc<dyn StsFactory> = Arc::new(MockFactory::new());

        run(&mut config, factory.clone()).await.unwrap();
        let content = std::fs::read_to_string(out_file).unwrap();
        assert!(content.contains("[123456789012_sub-admin]"));
        assert!(content.contains("[role2]"));
        assert!(content.contains("# ASSUMED ROLE: arn:aws:iam::123456789012:role/sub-admin"));
        assert!(content.contains("# FROM FLOW: integration"));
        assert!(content.contains("region = us-west-2"));
        assert!(content.contains("aws_access_key_id = AHENVMSKIRUEQNFHGZTA"));

        // a second run replaces the entries instead of stacking them
        let mut config = sample_config(out_file);
        run(&mut config, factory).await.unwrap();
        let content = std::fs::read_to_string(out_file).unwrap();
        assert_eq!(content.matches("[123456789012_sub-admin]").count(), 1);
        assert_eq!(content.matches("[role2]").count(), 1);
    }

    #[tokio::test]
    async fn purge_removes_managed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let out_file = dir.path().join("credentials");
        let out_file = out_file.to_str().unwrap();
        let mut config = sample_config(out_file);
        let factory: Arc<dyn StsFactory> = Arc::new(MockFactory::new());
        run(&mut config, factory).await.unwrap();

        purge(&config, out_file).await.unwrap();
        let content = std::fs::read_to_string(out_file).unwrap();
        assert!(!content.contains("[123456789012_sub-admin]"));
        assert!(!content.contains("[role2]"));
    }

    #[tokio::test]
    async fn run_requires_an_output_file() {
        let mut config = Config::default();
        let factory: Arc<dyn StsFactory> = Arc::new(MockFactory::new());
        let err = run(&mut config, factory).await.unwrap_err();
        assert!(err.to_string().contains("no output file"));
    }
}
