use anyhow::{bail, Result};
use regex::Regex;

/// Splits a role ARN into its role name and account number.
///
/// The role name keeps any path segments after the resource type, so
/// `arn:aws:iam::123456789012:role/ops/admin` yields `ops/admin`.
pub fn parse_role_arn(role_arn: &str) -> Result<(String, String)> {
    let chunks: Vec<&str> = role_arn.split(':').collect();
    if chunks.len() < 6 {
        bail!("error parsing role and account number from role arn during colon split");
    }
    let account_number = chunks[4];
    let account_number_regex = Regex::new("^[0-9]{12}$").unwrap();
    if !account_number_regex.is_match(account_number) {
        bail!("string from expected location in arn does not match account number regex");
    }
    let role_chunks: Vec<&str> = chunks[5].split('/').collect();
    let role_name = role_chunks[1..].join("/");
    Ok((role_name, account_number.to_string()))
}

/// Builds the canonical `<account>_<role-name>` identifier used as the
/// default profile entry name for a mapping.
pub fn role_unique_id(role_arn: &str) -> Result<String> {
    let (role_name, account_number) = parse_role_arn(role_arn)?;
    Ok(format!("{}_{}", account_number, role_name))
}
