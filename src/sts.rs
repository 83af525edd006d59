//! Token-exchange client plumbing.
//!
//! The [`Sts`] trait is the capability seam the rest of the crate talks to:
//! the real implementation wraps an `aws_sdk_sts::Client` and tests
//! substitute a table-driven mock. The free functions layer field presence
//! validation and the duration-fallback retry on top of the raw calls.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sts::error::DisplayErrorContext;
use chrono::{DateTime, Utc};
use log::{debug, warn};

const DEFAULT_DURATION_SECONDS: i32 = 3600;
const DEFAULT_REGION: &str = "us-east-1";

/// A temporary credential as returned by any of the assume operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl Credential {
    fn from_sdk(credentials: &aws_sdk_sts::types::Credentials) -> Result<Self> {
        let expiration = credentials.expiration();
        let expiration =
            DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos())
                .context("credential expiration timestamp out of range")?;
        Ok(Self {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
            expiration,
        })
    }
}

/// The identity behind a set of credentials.
#[derive(Debug, Clone, Default)]
pub struct CallerIdentity {
    pub account: Option<String>,
    pub arn: Option<String>,
    pub user_id: Option<String>,
}

/// Request for a plain role assumption. Fields mirror the wire call and are
/// optional so presence can be validated with a useful message instead of
/// surfacing an SDK error.
#[derive(Debug, Clone, Default)]
pub struct AssumeRoleRequest {
    pub role_arn: Option<String>,
    pub role_session_name: Option<String>,
    pub duration_seconds: Option<i32>,
}

/// Request for a SAML-based role assumption.
#[derive(Debug, Clone, Default)]
pub struct AssumeRoleWithSamlRequest {
    pub role_arn: Option<String>,
    pub principal_arn: Option<String>,
    pub saml_assertion: Option<String>,
    pub duration_seconds: Option<i32>,
}

/// Request for an MFA session token.
#[derive(Debug, Clone, Default)]
pub struct GetSessionTokenRequest {
    pub serial_number: Option<String>,
    pub token_code: Option<String>,
    pub duration_seconds: Option<i32>,
}

/// Capabilities the flow engine needs from the token-exchange service.
#[async_trait]
pub trait Sts: Send + Sync {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<Credential>;
    async fn assume_role_with_saml(
        &self,
        request: &AssumeRoleWithSamlRequest,
    ) -> Result<Credential>;
    async fn get_caller_identity(&self) -> Result<CallerIdentity>;
    async fn get_session_token(&self, request: &GetSessionTokenRequest) -> Result<Credential>;
}

/// Builds [`Sts`] clients for the three kinds of sessions a flow needs.
#[async_trait]
pub trait StsFactory: Send + Sync {
    /// A session from the local environment: a named credential profile,
    /// optionally pinned to a region, or the default credential chain.
    async fn base_client(
        &self,
        profile_name: Option<&str>,
        region: Option<&str>,
    ) -> Result<Arc<dyn Sts>>;

    /// A session seated on explicit static credentials, e.g. an MFA session
    /// token or a sponsor credential.
    async fn static_client(
        &self,
        credential: &Credential,
        region: Option<&str>,
    ) -> Result<Arc<dyn Sts>>;

    /// An unsigned session for SAML assumptions.
    async fn anonymous_client(&self, region: Option<&str>) -> Result<Arc<dyn Sts>>;
}

fn require<'a, T>(label: &str, field: &'a Option<T>) -> Result<&'a T> {
    field
        .as_ref()
        .ok_or_else(|| anyhow!("{} is not set", label))
}

/// True when the service rejected the call because the requested duration
/// exceeds what the role allows; the call is worth retrying without one.
fn detected_duration_problem(err: &anyhow::Error) -> bool {
    let message = err.to_string();
    let config_problem = "DurationSeconds exceeds the MaxSessionDuration";
    let chaining_problem =
        "DurationSeconds exceeds the 1 hour session limit for roles assumed by role chaining";
    if message.contains(config_problem) {
        debug!("requested DurationSeconds exceeds the MaxSessionDuration set for this role");
        true
    } else if message.contains(chaining_problem) {
        debug!("requested DurationSeconds exceeds the session limit for chained roles");
        true
    } else {
        false
    }
}

/// Assumes a role after validating the request fields, retrying once
/// without a duration when the service reports a duration-exceeded error.
pub async fn assume_role_with_client(
    client: &dyn Sts,
    request: &AssumeRoleRequest,
) -> Result<Credential> {
    require("role_arn", &request.role_arn)?;
    require("role_session_name", &request.role_session_name)?;
    let duration = *require("duration_seconds", &request.duration_seconds)?;
    let mut request = request.clone();
    if duration == 0 {
        debug!("detected blank duration, setting to a hard default");
        request.duration_seconds = Some(DEFAULT_DURATION_SECONDS);
    }
    debug!(
        "preparing assume-role input duration={}",
        request.duration_seconds.unwrap_or_default()
    );
    match client.assume_role(&request).await {
        Ok(credential) => {
            if duration > DEFAULT_DURATION_SECONDS {
                debug!("successfully assumed extended session duration");
            }
            Ok(credential)
        }
        Err(err) if detected_duration_problem(&err) => {
            debug!("defaulting to standard duration");
            request.duration_seconds = None;
            client.assume_role(&request).await
        }
        Err(err) => Err(err),
    }
}

/// SAML variant of [`assume_role_with_client`] with the same validation and
/// duration-fallback behavior.
pub async fn assume_saml_role_with_client(
    client: &dyn Sts,
    request: &AssumeRoleWithSamlRequest,
) -> Result<Credential> {
    require("principal_arn", &request.principal_arn)?;
    require("role_arn", &request.role_arn)?;
    require("saml_assertion", &request.saml_assertion)?;
    let duration = *require("duration_seconds", &request.duration_seconds)?;
    debug!("preparing assume-role-with-saml input duration={}", duration);
    let mut request = request.clone();
    match client.assume_role_with_saml(&request).await {
        Ok(credential) => {
            if duration > DEFAULT_DURATION_SECONDS {
                debug!(
                    "successfully assumed extended saml session duration duration={}",
                    duration
                );
            }
            Ok(credential)
        }
        Err(err) if detected_duration_problem(&err) => {
            debug!("defaulting to standard duration");
            request.duration_seconds = None;
            client.assume_role_with_saml(&request).await
        }
        Err(err) => Err(err),
    }
}

/// Derives the role session name from the caller identity so every
/// assumption in a flow carries the same human-traceable label. Falls back
/// to the bare program name when the identity lookup fails.
pub async fn generate_role_session_name(client: &dyn Sts) -> String {
    match client.get_caller_identity().await {
        Ok(identity) => match identity.arn {
            Some(arn) => {
                let last = arn.rsplit('/').next().unwrap_or(&arn);
                format!("gossamer-{}", last)
            }
            None => "gossamer".to_string(),
        },
        Err(_) => "gossamer".to_string(),
    }
}

/// True when any of the common `AWS_*` environment variables are set.
pub fn aws_env_set() -> bool {
    const COMMON_VARS: [&str; 5] = [
        "AWS_ACCESS_KEY_ID",
        "AWS_PROFILE",
        "AWS_ROLE_SESSION_NAME",
        "AWS_SECRET_ACCESS_KEY",
        "AWS_SESSION_TOKEN",
    ];
    COMMON_VARS
        .iter()
        .any(|var| std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false))
}

/// [`Sts`] backed by the real AWS SDK client.
pub struct AwsSts {
    client: aws_sdk_sts::Client,
}

impl AwsSts {
    pub fn new(client: aws_sdk_sts::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Sts for AwsSts {
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<Credential> {
        let output = self
            .client
            .assume_role()
            .set_role_arn(request.role_arn.clone())
            .set_role_session_name(request.role_session_name.clone())
            .set_duration_seconds(request.duration_seconds)
            .send()
            .await
            .map_err(|err| anyhow!("{}", DisplayErrorContext(&err)))?;
        let credentials = output
            .credentials()
            .context("assume-role response carried no credentials")?;
        Credential::from_sdk(credentials)
    }

    async fn assume_role_with_saml(
        &self,
        request: &AssumeRoleWithSamlRequest,
    ) -> Result<Credential> {
        let output = self
            .client
            .assume_role_with_saml()
            .set_role_arn(request.role_arn.clone())
            .set_principal_arn(request.principal_arn.clone())
            .set_saml_assertion(request.saml_assertion.clone())
            .set_duration_seconds(request.duration_seconds)
            .send()
            .await
            .map_err(|err| anyhow!("{}", DisplayErrorContext(&err)))?;
        let credentials = output
            .credentials()
            .context("assume-role-with-saml response carried no credentials")?;
        Credential::from_sdk(credentials)
    }

    async fn get_caller_identity(&self) -> Result<CallerIdentity> {
        let output = self
            .client
            .get_caller_identity()
            .send()
            .await
            .map_err(|err| anyhow!("{}", DisplayErrorContext(&err)))?;
        Ok(CallerIdentity {
            account: output.account().map(str::to_string),
            arn: output.arn().map(str::to_string),
            user_id: output.user_id().map(str::to_string),
        })
    }

    async fn get_session_token(&self, request: &GetSessionTokenRequest) -> Result<Credential> {
        let output = self
            .client
            .get_session_token()
            .set_serial_number(request.serial_number.clone())
            .set_token_code(request.token_code.clone())
            .set_duration_seconds(request.duration_seconds)
            .send()
            .await
            .map_err(|err| anyhow!("{}", DisplayErrorContext(&err)))?;
        let credentials = output
            .credentials()
            .context("get-session-token response carried no credentials")?;
        Credential::from_sdk(credentials)
    }
}

/// Builds real AWS SDK clients for each session kind.
pub struct AwsStsFactory;

#[async_trait]
impl StsFactory for AwsStsFactory {
    async fn base_client(
        &self,
        profile_name: Option<&str>,
        region: Option<&str>,
    ) -> Result<Arc<dyn Sts>> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(profile) = profile_name {
            if aws_env_set() {
                warn!(
                    "some AWS_* environment variables are set that may interfere \
                     with profile session establishment"
                );
            }
            debug!("using profile for session profile={}", profile);
            loader = loader.profile_name(profile);
        } else {
            debug!("no profile specified so attempting default credential chain");
        }
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let config = loader.load().await;
        Ok(Arc::new(AwsSts::new(aws_sdk_sts::Client::new(&config))))
    }

    async fn static_client(
        &self,
        credential: &Credential,
        region: Option<&str>,
    ) -> Result<Arc<dyn Sts>> {
        let provider = aws_sdk_sts::config::Credentials::new(
            credential.access_key_id.clone(),
            credential.secret_access_key.clone(),
            Some(credential.session_token.clone()),
            None,
            "gossamer",
        );
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).credentials_provider(provider);
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_string()));
        }
        let config = loader.load().await;
        Ok(Arc::new(AwsSts::new(aws_sdk_sts::Client::new(&config))))
    }

    async fn anonymous_client(&self, region: Option<&str>) -> Result<Arc<dyn Sts>> {
        let region_provider = match region {
            Some(region) => RegionProviderChain::first_try(Region::new(region.to_string())),
            None => RegionProviderChain::default_provider().or_else(Region::new(DEFAULT_REGION)),
        };
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .no_credentials()
            .load()
            .await;
        Ok(Arc::new(AwsSts::new(aws_sdk_sts::Client::new(&config))))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use anyhow::bail;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) fn fake_credential() -> Credential {
        Credential {
            access_key_id: "AHENVMSKIRUEQNFHGZTA".to_string(),
            secret_access_key: "ZcqCQl34NF8PtXHSdbBk3mZze1plNNSWqnmsz523".to_string(),
            session_token: "f8sNh8tocFpiabpbOGHfpqSYSgOQcNqvbzyNpAYW9gxWOlAcGpaPJMQoeDM"
                .to_string(),
            expiration: Utc.with_ymd_and_hms(2020, 1, 8, 14, 3, 2).unwrap(),
        }
    }

    /// Table-driven [`Sts`] double. Assume calls pop scripted outcomes from
    /// the front of `responses` (an empty table means always succeed) and
    /// every request is recorded for inspection.
    #[derive(Default)]
    pub(crate) struct MockSts {
        pub responses: Mutex<VecDeque<Result<Credential, String>>>,
        pub assume_role_requests: Mutex<Vec<AssumeRoleRequest>>,
        pub saml_requests: Mutex<Vec<AssumeRoleWithSamlRequest>>,
        pub session_token_requests: Mutex<Vec<GetSessionTokenRequest>>,
        pub caller_identity_err: Option<String>,
    }

    impl MockSts {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_responses(
            responses: Vec<Result<Credential, String>>,
        ) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                ..Self::default()
            }
        }

        fn next_response(&self) -> Result<Credential> {
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok(credential)) => Ok(credential),
                Some(Err(message)) => Err(anyhow!(message)),
                None => Ok(fake_credential()),
            }
        }
    }

    #[async_trait]
    impl Sts for MockSts {
        async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<Credential> {
            self.assume_role_requests
                .lock()
                .unwrap()
                .push(request.clone());
            self.next_response()
        }

        async fn assume_role_with_saml(
            &self,
            request: &AssumeRoleWithSamlRequest,
        ) -> Result<Credential> {
            self.saml_requests.lock().unwrap().push(request.clone());
            self.next_response()
        }

        async fn get_caller_identity(&self) -> Result<CallerIdentity> {
            if let Some(message) = &self.caller_identity_err {
                bail!(message.clone());
            }
            Ok(CallerIdentity {
                account: Some("123456789654".to_string()),
                arn: Some("arn:aws:sts::123456789654:assumed-role/oo/cool-dude".to_string()),
                user_id: Some("AROWPVJQMNDGYETTAV5EO:cool-dude".to_string()),
            })
        }

        async fn get_session_token(
            &self,
            request: &GetSessionTokenRequest,
        ) -> Result<Credential> {
            self.session_token_requests
                .lock()
                .unwrap()
                .push(request.clone());
            self.next_response()
        }
    }

    /// [`StsFactory`] double that hands back preconstructed mocks and
    /// records the credentials used to seat static clients.
    pub(crate) struct MockFactory {
        pub base: Arc<MockSts>,
        pub stat: Arc<MockSts>,
        pub anonymous: Arc<MockSts>,
        pub static_seats: Mutex<Vec<Credential>>,
    }

    impl MockFactory {
        pub(crate) fn new() -> Self {
            Self {
                base: Arc::new(MockSts::new()),
                stat: Arc::new(MockSts::new()),
                anonymous: Arc::new(MockSts::new()),
                static_seats: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StsFactory for MockFactory {
        async fn base_client(
            &self,
            _profile_name: Option<&str>,
            _region: Option<&str>,
        ) -> Result<Arc<dyn Sts>> {
            Ok(self.base.clone())
        }

        async fn static_client(
            &self,
            credential: &Credential,
            _region: Option<&str>,
        ) -> Result<Arc<dyn Sts>> {
            self.static_seats.lock().unwrap().push(credential.clone());
            Ok(self.stat.clone())
        }

        async fn anonymous_client(&self, _region: Option<&str>) -> Result<Arc<dyn Sts>> {
            Ok(self.anonymous.clone())
        }
    }
}
