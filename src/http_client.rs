use anyhow::Result;

/// Builds the client used for the SAML login exchange: cookies are kept
/// across the redirect hops of the IdP handshake, with the chain capped.
pub fn create_login_client() -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .cookie_store(true)
        .redirect(reqwest::redirect::Policy::custom(|attempt| {
            if attempt.previous().len() > 5 {
                attempt.error("too many redirects")
            } else {
                attempt.follow()
            }
        }))
        .build()?;
    Ok(client)
}
