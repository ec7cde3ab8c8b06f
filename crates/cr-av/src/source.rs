//! Source URI composition.
//!
//! Cameras are addressed by URIs that may already carry credentials. Callers
//! can override either part; when they don't, the embedded user and password
//! are passed through byte for byte, except that a password holding a stray
//! literal `@` (a credential pasted twice) is cut at that `@`.
//!
//! The userinfo is handled on the raw text because URL parsers re-encode it:
//! a stray `@` and a correctly encoded `%40` would become indistinguishable.

use std::fmt;

use cr_core::{Credentials, Error, Result};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use url::Url;

/// Placeholder shown instead of a password in logs.
const REDACTED: &str = "***";

/// Characters escaped in injected usernames and passwords.
const USERINFO: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// A composed source URI ready to hand to the transcoder.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceUri {
    scheme: String,
    composed: String,
    redacted: String,
}

/// A URI split around its userinfo, all parts still encoded.
struct RawParts<'a> {
    scheme: &'a str,
    userinfo: Option<&'a str>,
    host_port: &'a str,
    rest: &'a str,
}

impl<'a> RawParts<'a> {
    fn split(raw: &'a str) -> Option<Self> {
        let (scheme, after) = raw.split_once("://")?;
        let end = after.find(['/', '?', '#']).unwrap_or(after.len());
        let (authority, rest) = after.split_at(end);
        let (userinfo, host_port) = match authority.rfind('@') {
            Some(at) => (Some(&authority[..at]), &authority[at + 1..]),
            None => (None, authority),
        };
        Some(Self {
            scheme,
            userinfo,
            host_port,
            rest,
        })
    }
}

impl SourceUri {
    /// Compose the effective URI from `raw` and optional override credentials.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] if `raw` is blank.
    /// - [`Error::InvalidSourceUri`] if `raw` cannot be parsed or has no host.
    pub fn compose(raw: &str, overrides: &Credentials) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Validation("source url is required".into()));
        }

        let no_host = || Error::InvalidSourceUri(format!("could not extract hostname from {raw}"));
        let parts = RawParts::split(raw).ok_or_else(no_host)?;
        if parts.host_port.is_empty() {
            return Err(no_host());
        }

        let path = if parts.rest.is_empty() || !parts.rest.starts_with('/') {
            format!("/{}", parts.rest)
        } else {
            parts.rest.to_string()
        };

        // Validate everything except the userinfo with a real parser.
        let bare = format!("{}://{}{}", parts.scheme, parts.host_port, path);
        let url = Url::parse(&bare).map_err(|e| Error::InvalidSourceUri(format!("{bare}: {e}")))?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(no_host());
        }

        let (embedded_user, embedded_pass) = match parts.userinfo {
            Some(info) => match info.split_once(':') {
                Some((user, pass)) => (user, Some(pass)),
                None => (info, None),
            },
            None => ("", None),
        };

        let username = match overrides.username.as_deref() {
            Some(user) => utf8_percent_encode(user, USERINFO).to_string(),
            None => embedded_user.to_string(),
        };
        let password = match overrides.password.as_deref() {
            Some(pass) => Some(utf8_percent_encode(pass, USERINFO).to_string()),
            None => embedded_pass
                .map(|pass| pass.split_once('@').map_or(pass, |(head, _)| head))
                .filter(|pass| !pass.is_empty())
                .map(str::to_string),
        };

        let tail = format!("{}{}", parts.host_port, path);
        let (composed, redacted) = if username.is_empty() {
            // A password without a user is meaningless to the transcoder.
            let plain = format!("{}://{}", parts.scheme, tail);
            (plain.clone(), plain)
        } else {
            match password {
                Some(pass) => (
                    format!("{}://{}:{}@{}", parts.scheme, username, pass, tail),
                    format!("{}://{}:{}@{}", parts.scheme, username, REDACTED, tail),
                ),
                None => {
                    let plain = format!("{}://{}@{}", parts.scheme, username, tail);
                    (plain.clone(), plain)
                }
            }
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            composed,
            redacted,
        })
    }

    /// The clear-text URI. Only the transcoder's argv should see this.
    pub fn as_str(&self) -> &str {
        &self.composed
    }

    /// The URI with any password replaced by `***`.
    pub fn redacted(&self) -> String {
        self.redacted.clone()
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Whether the source speaks RTSP and wants the TCP transport flags.
    pub fn is_rtsp(&self) -> bool {
        matches!(self.scheme.as_str(), "rtsp" | "rtsps")
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted)
    }
}

impl fmt::Debug for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SourceUri").field(&self.redacted).finish()
    }
}
