//! SAML login session: posts credentials to the IdP, scrapes the
//! base-64-encoded assertion out of the returned HTML, and decodes the
//! roles, role session name, and session duration it carries.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info};
use scraper::{Html, Selector};
use url::Url;

use crate::arn::{parse_role_arn, role_unique_id};
use crate::http_client::create_login_client;

const ROLE_ATTRIBUTE: &str = "https://aws.amazon.com/SAML/Attributes/Role";
const ROLE_SESSION_NAME_ATTRIBUTE: &str =
    "https://aws.amazon.com/SAML/Attributes/RoleSessionName";
const SESSION_DURATION_ATTRIBUTE: &str =
    "https://aws.amazon.com/SAML/Attributes/SessionDuration";

/// One role the assertion entitles the user to assume.
#[derive(Debug, Clone)]
pub struct SamlRole {
    pub role_arn: String,
    pub principal_arn: String,
    pub account_number: String,
    pub role_name: String,
    /// `<account>_<role-name>`, the default profile entry name.
    pub identifier: String,
}

/// The decoded payload of an assertion.
#[derive(Debug, Default)]
pub struct DecodedAssertion {
    pub roles: Vec<SamlRole>,
    pub role_session_name: Option<String>,
    session_duration: Option<String>,
}

impl DecodedAssertion {
    /// The IdP-asserted session duration in seconds, 0 when absent or
    /// unparseable.
    pub fn session_duration(&self) -> i32 {
        self.session_duration
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }
}

/// An authenticated SAML session: the still-encoded assertion plus
/// everything decoded out of it.
pub struct SamlSession {
    pub session_name: String,
    pub assertion: String,
    pub decoded: DecodedAssertion,
}

impl SamlSession {
    /// Runs the login exchange against `url` and decodes the resulting
    /// assertion.
    pub async fn start(
        session_name: &str,
        username: &str,
        password: &str,
        url: &str,
        target: &str,
    ) -> Result<Self> {
        Url::parse(url).with_context(|| format!("invalid SAML auth url '{}'", url))?;
        let client = create_login_client()?;
        let response = client
            .post(url)
            .form(&[
                ("username", username),
                ("password", password),
                ("target", target),
            ])
            .send()
            .await
            .context("error performing SAML login call")?;
        let body = response.text().await?;
        let assertion = extract_assertion(&body).unwrap_or_default();
        let decoded = decode_assertion(&assertion, username)?;
        info!(
            "started SAML session flow={} num_roles={}",
            session_name,
            decoded.roles.len()
        );
        Ok(Self {
            session_name: session_name.to_string(),
            assertion,
            decoded,
        })
    }
}

/// Scans the login response as HTML and returns the `value` attribute of
/// the last `<input>` element carrying one, which IdPs use to post the
/// assertion to the service provider.
pub(crate) fn extract_assertion(body: &str) -> Option<String> {
    let document = Html::parse_document(body);
    let selector = Selector::parse("input").unwrap();
    let mut assertion = None;
    for element in document.select(&selector) {
        if let Some(value) = element.value().attr("value") {
            assertion = Some(value.to_string());
        }
    }
    assertion
}

/// Base-64-decodes and parses the assertion, collecting the role tuples and
/// the optional session attributes. `username` is only used to build a
/// friendlier message for the usual bad-password failure mode.
pub fn decode_assertion(assertion: &str, username: &str) -> Result<DecodedAssertion> {
    let raw = base64::decode(assertion).map_err(|err| {
        debug!("error decoding base64 SAML assertion error={}", err);
        anyhow!(
            "error in decoding SAML assertion make sure password for user '{}' is correct",
            username
        )
    })?;
    debug!("got base64 decoded assertion bytes={}", raw.len());
    if raw.is_empty() {
        bail!(
            "got SAML assertion of length zero please check url/target settings \
             and check with SAML provider"
        );
    }
    let xml = String::from_utf8(raw).context("SAML assertion is not valid utf-8")?;
    let doc = roxmltree::Document::parse(&xml)
        .context("error parsing SAML assertion xml")?;

    let mut decoded = DecodedAssertion::default();
    for attribute in doc
        .descendants()
        .filter(|node| node.tag_name().name() == "Attribute")
    {
        let mut values = attribute
            .children()
            .filter(|node| node.tag_name().name() == "AttributeValue")
            .filter_map(|node| node.text())
            .map(str::trim)
            .filter(|text| !text.is_empty());
        match attribute.attribute("Name") {
            Some(ROLE_ATTRIBUTE) => {
                for value in values {
                    decoded.roles.push(role_from_attribute_value(value)?);
                }
            }
            Some(ROLE_SESSION_NAME_ATTRIBUTE) => {
                if decoded.role_session_name.is_none() {
                    decoded.role_session_name = values.next().map(str::to_string);
                }
            }
            Some(SESSION_DURATION_ATTRIBUTE) => {
                if decoded.session_duration.is_none() {
                    decoded.session_duration = values.next().map(str::to_string);
                }
            }
            _ => {}
        }
    }
    Ok(decoded)
}

// A role attribute value pairs the role and principal ARNs with a comma;
// some IdPs emit them principal-first, so detect by ARN shape instead of
// trusting the position.
fn role_from_attribute_value(raw: &str) -> Result<SamlRole> {
    let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
    if parts.len() != 2 {
        bail!("error parsing principal arn from saml attribute value during comma split");
    }
    let (role_arn, principal_arn) = if parts[1].contains(":saml-provider/") {
        (parts[0], parts[1])
    } else {
        (parts[1], parts[0])
    };
    let (role_name, account_number) = parse_role_arn(role_arn)?;
    let identifier = role_unique_id(role_arn)?;
    Ok(SamlRole {
        role_arn: role_arn.to_string(),
        principal_arn: principal_arn.to_string(),
        account_number,
        role_name,
        identifier,
    })
}
