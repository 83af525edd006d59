use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use gossamer::config::Config;
use gossamer::credfile::read_expire;
use gossamer::engine;
use gossamer::legacy::{convert_legacy_flags_to_config, LegacyFlags};
use gossamer::samples::{generate_config_skeleton, write_config_to_file};
use gossamer::sts::{AwsStsFactory, StsFactory};

/// Assume AWS roles concurrently via permanent credentials or SAML and
/// maintain the resulting profile entries in a credentials file.
#[derive(Parser, Debug)]
#[command(name = "gossamer", version, about)]
struct Args {
    /// YAML config file defining auth flows
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Output credentials file
    #[arg(short = 'o', long, default_value = "./gossamer_creds")]
    out_file: String,

    /// Role ARN to assume (legacy single-role mode)
    #[arg(short = 'a', long)]
    role_arn: Option<String>,

    /// JSON file with a list of roles to assume (legacy mode)
    #[arg(long)]
    roles_file: Option<String>,

    /// Credentials file profile to start from (legacy mode)
    #[arg(long)]
    profile: Option<String>,

    /// Serial number of the MFA device (legacy mode)
    #[arg(long)]
    serial_number: Option<String>,

    /// Token code of the MFA device (legacy mode)
    #[arg(long)]
    token_code: Option<String>,

    /// Region for the assumed sessions (legacy mode)
    #[arg(long)]
    region: Option<String>,

    /// Profile entry name used with a single role ARN (legacy mode)
    #[arg(long, default_value = "gossamer")]
    entry_name: String,

    /// Session duration in seconds (legacy mode, min 900)
    #[arg(long, default_value_t = 3600)]
    duration: i32,

    /// Renewal threshold in minutes for the expiration check
    #[arg(short = 't', long, default_value_t = 10)]
    threshold: i64,

    /// Seconds to wait between checks in daemon mode
    #[arg(short = 's', long, default_value_t = 300)]
    interval: u64,

    /// Run continuously, renewing credentials as they approach expiry
    #[arg(long)]
    daemon: bool,

    /// Refresh credentials even when not yet expired
    #[arg(long)]
    force: bool,

    /// Remove all managed entries from the credentials file and exit
    #[arg(long)]
    purge: bool,

    /// Write a sample config file to the given path and exit
    #[arg(long)]
    generate_config: Option<PathBuf>,

    /// Write the config translated from legacy flags to the given path
    #[arg(long)]
    save_config: Option<PathBuf>,

    /// Log level (info or debug)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let level = match args.log_level.as_str() {
        "debug" => log::LevelFilter::Debug,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
    if let Err(err) = run(args).await {
        error!("{:#}", err);
        std::process::exit(1);
    }
}

async fn run(mut args: Args) -> Result<()> {
    info!("gossamer: concurrent role assumption toolkit");

    if let Some(path) = &args.generate_config {
        write_config_to_file(&generate_config_skeleton(), path).await?;
        info!("wrote sample configuration path={}", path.display());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => {
            let flags = LegacyFlags {
                out_file: args.out_file.clone(),
                role_arn: args.role_arn.take(),
                roles_file: args.roles_file.take(),
                profile: args.profile.take(),
                serial_number: args.serial_number.take(),
                token_code: args.token_code.take(),
                region: args.region.take(),
                profile_entry_name: args.entry_name.clone(),
                session_duration: args.duration,
            };
            let config = convert_legacy_flags_to_config(&flags)
                .context("no config file given and legacy flags are incomplete")?;
            if let Some(path) = &args.save_config {
                write_config_to_file(&config, path).await?;
                info!("wrote translated configuration path={}", path.display());
            }
            config
        }
    };
    if config.out_file.is_empty() {
        config.out_file = args.out_file.clone();
    }
    config.validate()?;

    if args.purge {
        let out_file = config.out_file.clone();
        engine::purge(&config, &out_file).await?;
        info!("purged managed entries path={}", out_file);
        return Ok(());
    }

    if args.daemon && uses_interactive_sources(&config) {
        warn!("config mismatch, cannot run as daemon with prompt or MFA sources, unsetting daemon flag");
        args.daemon = false;
    }

    let factory: Arc<dyn StsFactory> = Arc::new(AwsStsFactory);
    loop {
        let expired = read_expire(&config.out_file, args.threshold).await?;
        if expired || args.force {
            engine::run(&mut config, factory.clone()).await?;
        } else {
            info!("token not yet expired, nothing to do");
        }
        if !args.daemon {
            break;
        }
        let sleep = Duration::from_secs(args.interval);
        info!("sleeping seconds={}", args.interval);
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("received interrupt signal, exiting");
                break;
            }
        }
    }
    Ok(())
}

// Prompt-sourced parameters and MFA tokens need a human at the terminal,
// which a daemon does not have.
fn uses_interactive_sources(config: &Config) -> bool {
    config.flows.iter().any(|flow| {
        let saml_prompts = flow.saml_config.as_ref().is_some_and(|saml| {
            [&saml.username, &saml.password, &saml.url, &saml.target]
                .iter()
                .any(|param| param.source == "prompt")
        });
        let mfa = flow
            .perm_creds_config
            .as_ref()
            .is_some_and(|perm| perm.mfa.is_some());
        saml_prompts || mfa
    })
}
