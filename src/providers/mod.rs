//! Provider adapters: per-forge webhook verification and payload normalization.
//!
//! Adapters are stateless and live in a static registry keyed by
//! [`ProviderKind`]; see [`adapter_for`].

pub mod bitbucket;
pub mod branch_filter;
pub mod default_branch;
pub mod generic;
pub mod github;
pub mod gitlab;

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;

use crate::db::models::{GitRef, ProviderKind};
use crate::error::ProviderError;

pub use bitbucket::BitbucketAdapter;
pub use branch_filter::ref_matches;
pub use generic::GenericAdapter;
pub use github::GithubAdapter;
pub use gitlab::GitlabAdapter;

type HmacSha256 = Hmac<Sha256>;

/// Provider-neutral view of an inbound webhook.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizedEvent {
    pub event_type: String,
    pub git_ref: Option<GitRef>,
    pub commit_sha: Option<String>,
    pub commit_message: Option<String>,
    pub author: Option<String>,
    /// Provider's unique delivery id, used to drop redelivered events.
    pub delivery_id: Option<String>,
    /// Raw signature or token header, recorded for audit.
    pub signature: Option<String>,
    /// True only when a configured secret was checked and matched.
    pub verified: bool,
    /// Whether this is a push (branch or tag update) at all.
    pub is_push: bool,
    /// Push that deletes the ref.
    pub deleted: bool,
}

impl NormalizedEvent {
    /// The pushed ref, or why this event cannot start a build.
    pub fn build_ref(&self) -> Result<&GitRef, String> {
        if !self.is_push {
            return Err(format!("{} events do not trigger builds", self.event_type));
        }
        if self.deleted {
            return Err("ref was deleted".into());
        }
        self.git_ref
            .as_ref()
            .ok_or_else(|| "event names no branch or tag".to_string())
    }
}

/// Verification and normalization for one provider.
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Verify `payload` against `secret` (when one is configured) and normalize it.
    /// The body is checked before it is parsed.
    fn verify_and_parse(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
        secret: Option<&str>,
    ) -> Result<NormalizedEvent, ProviderError>;
}

static GITHUB: GithubAdapter = GithubAdapter;
static GITLAB: GitlabAdapter = GitlabAdapter;
static BITBUCKET: BitbucketAdapter = BitbucketAdapter;
static GENERIC: GenericAdapter = GenericAdapter;

/// Static provider registry.
pub fn adapter_for(kind: ProviderKind) -> &'static dyn ProviderAdapter {
    match kind {
        ProviderKind::Github => &GITHUB,
        ProviderKind::Gitlab => &GITLAB,
        ProviderKind::Bitbucket => &BITBUCKET,
        ProviderKind::Generic => &GENERIC,
    }
}

pub(crate) fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Secret that is actually configured (empty counts as none).
pub(crate) fn configured(secret: Option<&str>) -> Option<&str> {
    secret.filter(|s| !s.is_empty())
}

/// Check a `sha256=<hex>` HMAC signature over the raw body.
pub(crate) fn verify_hmac_sha256(secret: &str, body: &[u8], signature: Option<&str>) -> Result<(), ProviderError> {
    let signature = signature.ok_or_else(|| ProviderError::Verification("missing signature header".into()))?;
    let sig_hex = signature
        .strip_prefix("sha256=")
        .ok_or_else(|| ProviderError::Verification("unsupported signature format".into()))?;
    let sig_bytes =
        hex::decode(sig_hex).map_err(|_| ProviderError::Verification("signature is not hex".into()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ProviderError::Verification(format!("invalid secret: {}", e)))?;
    mac.update(body);
    mac.verify_slice(&sig_bytes)
        .map_err(|_| ProviderError::Verification("signature mismatch".into()))
}

/// Length-revealing but otherwise constant-time byte comparison.
pub(crate) fn subtle_compare(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    let mut mismatch = 0_u8;
    for (l, r) in left.iter().zip(right.iter()) {
        mismatch |= l ^ r;
    }
    mismatch == 0
}

pub(crate) fn parse_json(payload: &[u8]) -> Result<serde_json::Value, ProviderError> {
    serde_json::from_slice(payload).map_err(|e| ProviderError::Malformed(format!("invalid JSON: {}", e)))
}

/// All-zero SHA marks a created-from-nothing or deleted ref.
pub(crate) fn is_zero_sha(sha: &str) -> bool {
    !sha.is_empty() && sha.chars().all(|c| c == '0')
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ref_reasons() {
        let push = NormalizedEvent {
            event_type: "push".into(),
            git_ref: Some(GitRef::Branch("main".into())),
            is_push: true,
            ..Default::default()
        };
        assert_eq!(push.build_ref(), Ok(&GitRef::Branch("main".into())));

        let ping = NormalizedEvent {
            event_type: "ping".into(),
            ..Default::default()
        };
        assert_eq!(ping.build_ref(), Err("ping events do not trigger builds".to_string()));

        let deleted = NormalizedEvent {
            deleted: true,
            ..push.clone()
        };
        assert_eq!(deleted.build_ref(), Err("ref was deleted".to_string()));

        let no_ref = NormalizedEvent {
            git_ref: None,
            ..push
        };
        assert_eq!(no_ref.build_ref(), Err("event names no branch or tag".to_string()));
    }

    #[test]
    fn test_registry_resolves_every_kind() {
        for kind in [
            ProviderKind::Github,
            ProviderKind::Gitlab,
            ProviderKind::Bitbucket,
            ProviderKind::Generic,
        ] {
            assert_eq!(adapter_for(kind).kind(), kind);
        }
    }

    #[test]
    fn test_subtle_compare() {
        assert!(subtle_compare(b"abc", b"abc"));
        assert!(!subtle_compare(b"abc", b"abd"));
        assert!(!subtle_compare(b"abc", b"ab"));
    }

    #[test]
    fn test_zero_sha() {
        assert!(is_zero_sha("0000000000000000000000000000000000000000"));
        assert!(!is_zero_sha("abc123"));
        assert!(!is_zero_sha(""));
    }
}
