use axum::http::HeaderMap;

use super::{configured, header, is_zero_sha, parse_json, verify_hmac_sha256, NormalizedEvent, ProviderAdapter};
use crate::db::models::{GitRef, ProviderKind};
use crate::error::ProviderError;

/// GitHub: `X-Hub-Signature-256` HMAC over the raw body, event type from `X-GitHub-Event`.
pub struct GithubAdapter;

impl ProviderAdapter for GithubAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    fn verify_and_parse(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
        secret: Option<&str>,
    ) -> Result<NormalizedEvent, ProviderError> {
        let signature = header(headers, "x-hub-signature-256");

        let verified = match configured(secret) {
            Some(secret) => {
                verify_hmac_sha256(secret, payload, signature)?;
                true
            }
            None => false,
        };

        let event_type = header(headers, "x-github-event")
            .ok_or_else(|| ProviderError::Malformed("missing X-GitHub-Event header".into()))?
            .to_string();

        let mut event = NormalizedEvent {
            is_push: event_type == "push",
            event_type,
            delivery_id: header(headers, "x-github-delivery").map(str::to_string),
            signature: signature.map(str::to_string),
            verified,
            ..Default::default()
        };

        let body = parse_json(payload)?;
        if !event.is_push {
            return Ok(event);
        }

        let git_ref = body["ref"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed("push payload without ref".into()))?;
        event.git_ref = Some(GitRef::parse(git_ref));

        let after = body["after"].as_str().unwrap_or_default();
        event.deleted = body["deleted"].as_bool().unwrap_or(false) || is_zero_sha(after);

        let head = &body["head_commit"];
        event.commit_sha = head["id"]
            .as_str()
            .or(Some(after).filter(|s| !s.is_empty() && !is_zero_sha(s)))
            .map(str::to_string);
        event.commit_message = head["message"].as_str().map(str::to_string);
        event.author = head["author"]["name"]
            .as_str()
            .or_else(|| body["pusher"]["name"].as_str())
            .map(str::to_string);

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::test_support::{headers, sign};

    const PUSH: &str = r#"{
        "ref": "refs/heads/main",
        "after": "abc123def",
        "deleted": false,
        "head_commit": {"id": "abc123def", "message": "fix bug", "author": {"name": "alice"}},
        "pusher": {"name": "alice-bot"}
    }"#;

    #[test]
    fn test_signed_push_is_verified_and_normalized() {
        let sig = sign("s3cret", PUSH.as_bytes());
        let hdrs = headers(&[
            ("x-github-event", "push"),
            ("x-github-delivery", "d-1"),
            ("x-hub-signature-256", sig.as_str()),
        ]);

        let event = GithubAdapter.verify_and_parse(PUSH.as_bytes(), &hdrs, Some("s3cret")).unwrap();

        assert!(event.verified);
        assert!(event.build_ref().is_ok());
        assert_eq!(event.git_ref, Some(GitRef::Branch("main".into())));
        assert_eq!(event.commit_sha.as_deref(), Some("abc123def"));
        assert_eq!(event.commit_message.as_deref(), Some("fix bug"));
        assert_eq!(event.author.as_deref(), Some("alice"));
        assert_eq!(event.delivery_id.as_deref(), Some("d-1"));
    }

    #[test]
    fn test_tampered_body_fails_with_original_signature() {
        let sig = sign("s3cret", PUSH.as_bytes());
        let tampered = PUSH.replace("fix bug", "rm -rf");
        let hdrs = headers(&[("x-github-event", "push"), ("x-hub-signature-256", sig.as_str())]);

        let result = GithubAdapter.verify_and_parse(tampered.as_bytes(), &hdrs, Some("s3cret"));

        assert!(matches!(result, Err(ProviderError::Verification(_))));
    }

    #[test]
    fn test_missing_signature_fails_when_secret_configured() {
        let hdrs = headers(&[("x-github-event", "push")]);
        let result = GithubAdapter.verify_and_parse(PUSH.as_bytes(), &hdrs, Some("s3cret"));
        assert!(matches!(result, Err(ProviderError::Verification(_))));
    }

    #[test]
    fn test_without_secret_is_accepted_unverified() {
        let hdrs = headers(&[("x-github-event", "push")]);
        let event = GithubAdapter.verify_and_parse(PUSH.as_bytes(), &hdrs, None).unwrap();
        assert!(!event.verified);
        assert!(event.build_ref().is_ok());
    }

    #[test]
    fn test_ping_is_not_a_push() {
        let body = br#"{"zen": "Keep it logically awesome."}"#;
        let hdrs = headers(&[("x-github-event", "ping"), ("x-hub-signature-256", sign("k", body).as_str())]);

        let event = GithubAdapter.verify_and_parse(body, &hdrs, Some("k")).unwrap();

        assert_eq!(event.event_type, "ping");
        assert!(!event.build_ref().is_ok());
    }

    #[test]
    fn test_branch_deletion_is_flagged() {
        let body = br#"{"ref": "refs/heads/old", "after": "0000000000000000000000000000000000000000", "deleted": true}"#;
        let hdrs = headers(&[("x-github-event", "push")]);

        let event = GithubAdapter.verify_and_parse(body, &hdrs, None).unwrap();

        assert!(event.deleted);
        assert!(event.commit_sha.is_none());
        assert!(!event.build_ref().is_ok());
    }

    #[test]
    fn test_malformed_json_after_valid_signature() {
        let body = b"not json";
        let hdrs = headers(&[("x-github-event", "push"), ("x-hub-signature-256", sign("k", body).as_str())]);
        let result = GithubAdapter.verify_and_parse(body, &hdrs, Some("k"));
        assert!(matches!(result, Err(ProviderError::Malformed(_))));
    }
}
