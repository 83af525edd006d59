//! Line-oriented editor for an AWS credentials file.
//!
//! Entries are INI-style sections: a `[name]` header line followed by every
//! line up to the next header or EOF. Requests are queued with
//! [`CredFile::queue_assert`] / [`CredFile::queue_delete`] and applied in
//! order by [`CredFile::commit`], which guarantees at most one section per
//! asserted name while leaving unrelated sections byte-for-byte intact.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use regex::Regex;
use tokio::fs;

use crate::sts::Credential;

/// Marker scanned for by [`read_expire`] to find the expiration timestamp
/// of a previously written entry.
pub const EXPIRES_TOKEN: &str = "# EXPIRES@";

/// Timestamp layout used for the `# GENERATED:` and `# EXPIRES@` lines,
/// e.g. `2017-05-01 23:53:42 +0000 UTC`.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z %Z";

const RE_DATE_FORMAT: &str =
    r"[0-9]{4}-[0-9]{2}-[0-9]{2} [0-9]{2}:[0-9]{2}:[0-9]{2} (\-|\+)[0-9]{4} \w{3}";

enum Request {
    Assert { name: String, contents: Vec<String> },
    Delete { name: String },
}

/// An interactive session against a single credentials file.
pub struct CredFile {
    path: PathBuf,
    buffer: String,
    queue: Vec<Request>,
    re_sep: Regex,
}

impl CredFile {
    /// Opens `path`, creating an empty file first if it does not exist, and
    /// loads the full content into the in-memory line buffer.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if fs::metadata(&path).await.is_err() {
            fs::write(&path, "")
                .await
                .with_context(|| format!("unable to create credentials file {}", path.display()))?;
        }
        let raw = fs::read_to_string(&path)
            .await
            .with_context(|| format!("unable to read credentials file {}", path.display()))?;
        let mut buffer = String::new();
        for line in raw.lines() {
            buffer.push_str(line);
            buffer.push('\n');
        }
        Ok(Self {
            path,
            buffer,
            queue: Vec::new(),
            re_sep: Regex::new(r"\[.*\]").unwrap(),
        })
    }

    /// Queues an upsert of the section `name` (including brackets, e.g.
    /// `[dev-account-1]`) with the given body lines.
    pub fn queue_assert(&mut self, name: impl Into<String>, contents: Vec<String>) {
        self.queue.push(Request::Assert {
            name: name.into(),
            contents,
        });
    }

    /// Queues removal of every section named `name`.
    pub fn queue_delete(&mut self, name: impl Into<String>) {
        self.queue.push(Request::Delete { name: name.into() });
    }

    /// Applies all queued requests to the buffer and persists it back to the
    /// file with mode 0644.
    pub async fn commit(&mut self) -> Result<()> {
        for request in std::mem::take(&mut self.queue) {
            match request {
                Request::Assert { name, contents } => self.modify_entry(&name, Some(&contents)),
                Request::Delete { name } => self.modify_entry(&name, None),
            }
        }
        fs::write(&self.path, self.buffer.as_bytes())
            .await
            .with_context(|| format!("unable to write credentials file {}", self.path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o644)).await?;
        }
        info!("wrote credentials file path={}", self.path.display());
        Ok(())
    }

    fn modify_entry(&mut self, name: &str, replace_with: Option<&[String]>) {
        let mut lines: Vec<String> = self.buffer.lines().map(str::to_string).collect();
        let anchors: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| self.re_sep.is_match(line))
            .map(|(i, _)| i)
            .collect();
        let found = lines.iter().any(|line| line == name);
        debug!("modifying entry name={} found={}", name, found);
        if found {
            lines = remove_entry(lines, &anchors, name);
        }
        if let Some(contents) = replace_with {
            lines.push(name.to_string());
            lines.extend(contents.iter().cloned());
        }
        let mut buffer = String::new();
        for line in &lines {
            buffer.push_str(line);
            buffer.push('\n');
        }
        self.buffer = buffer;
    }
}

// Drops every line range [occurrence, next-anchor) for lines equal to
// `name`, which removes the whole section including trailing blank lines.
fn remove_entry(lines: Vec<String>, anchors: &[usize], name: &str) -> Vec<String> {
    let mut ignoring = false;
    let mut ignore_until = 0;
    let mut kept = Vec::new();
    for (i, line) in lines.into_iter().enumerate() {
        if line == name {
            ignore_until = match anchors.iter().position(|&a| a == i) {
                Some(pos) if pos + 1 < anchors.len() => anchors[pos + 1],
                _ => usize::MAX,
            };
            ignoring = true;
        }
        if !(ignoring && i < ignore_until) {
            kept.push(line);
        }
    }
    kept
}

/// Everything needed to render one profile entry for the credentials file.
#[derive(Debug)]
pub struct ProfileEntryInput {
    pub credential: Credential,
    pub profile_name: String,
    pub region: Option<String>,
    pub role_arn: String,
    pub description: String,
}

impl ProfileEntryInput {
    /// The section header, brackets included.
    pub fn entry_name(&self) -> String {
        format!("[{}]", self.profile_name)
    }

    /// Renders the section body: provenance comments, the expiration
    /// marker, and the credential key/value lines, ending with a blank
    /// separator line.
    pub fn body_lines(&self, generated: DateTime<Utc>) -> Vec<String> {
        let mut lines = vec![
            format!("# ASSUMED ROLE: {}", self.role_arn),
            format!("# FROM FLOW: {}", self.description),
            format!("# GENERATED: {}", generated.format(DATE_FORMAT)),
            format!(
                "{}{}",
                EXPIRES_TOKEN,
                self.credential.expiration.format(DATE_FORMAT)
            ),
            "output = json".to_string(),
        ];
        if let Some(region) = &self.region {
            lines.push(format!("region = {}", region));
        }
        lines.push(format!(
            "aws_access_key_id = {}",
            self.credential.access_key_id
        ));
        lines.push(format!(
            "aws_secret_access_key = {}",
            self.credential.secret_access_key
        ));
        lines.push(format!(
            "aws_session_token = {}",
            self.credential.session_token
        ));
        lines.push(String::new());
        lines
    }
}

/// Scans an existing credentials file for the expiration marker and reports
/// whether credentials should be renewed, given a threshold in minutes.
///
/// A missing file or a file without any marker always needs renewal.
pub async fn read_expire(path: impl AsRef<Path>, renew_threshold: i64) -> Result<bool> {
    let path = path.as_ref();
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(_) => {
            fs::write(path, "")
                .await
                .with_context(|| format!("unable to create credentials file {}", path.display()))?;
            return Ok(true);
        }
    };
    let filter = Regex::new(&format!("{}({})", EXPIRES_TOKEN, RE_DATE_FORMAT)).unwrap();
    for line in content.lines() {
        if let Some(caps) = filter.captures(line) {
            let stamp = caps.get(1).unwrap().as_str();
            info!("detected expiration string token_expires={}", stamp);
            // the trailing zone abbreviation is display-only
            let stamp = stamp.rsplit_once(' ').map(|(head, _)| head).unwrap_or(stamp);
            let expires = DateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S %z")
                .with_context(|| format!("unable to parse expiration timestamp '{}'", stamp))?;
            let remaining = expires.with_timezone(&Utc) - Utc::now();
            info!(
                "token expiration check expires_in_minutes={} renew_threshold={}",
                remaining.num_minutes(),
                renew_threshold
            );
            return Ok(remaining.num_minutes() < renew_threshold);
        }
    }
    Ok(true)
}
