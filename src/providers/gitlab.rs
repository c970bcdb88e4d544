use axum::http::HeaderMap;

use super::{configured, header, is_zero_sha, parse_json, subtle_compare, NormalizedEvent, ProviderAdapter};
use crate::db::models::{GitRef, ProviderKind};
use crate::error::ProviderError;

/// GitLab: shared secret compared against `X-Gitlab-Token`.
pub struct GitlabAdapter;

impl ProviderAdapter for GitlabAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gitlab
    }

    fn verify_and_parse(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
        secret: Option<&str>,
    ) -> Result<NormalizedEvent, ProviderError> {
        let token = header(headers, "x-gitlab-token");

        let verified = match configured(secret) {
            Some(secret) => {
                let token = token.ok_or_else(|| ProviderError::Verification("missing X-Gitlab-Token header".into()))?;
                if !subtle_compare(token.as_bytes(), secret.as_bytes()) {
                    return Err(ProviderError::Verification("token mismatch".into()));
                }
                true
            }
            None => false,
        };

        let event_type = header(headers, "x-gitlab-event")
            .ok_or_else(|| ProviderError::Malformed("missing X-Gitlab-Event header".into()))?
            .to_string();

        let body = parse_json(payload)?;
        let object_kind = body["object_kind"].as_str().unwrap_or_default();

        let mut event = NormalizedEvent {
            is_push: matches!(event_type.as_str(), "Push Hook" | "Tag Push Hook")
                || matches!(object_kind, "push" | "tag_push"),
            event_type,
            delivery_id: header(headers, "x-gitlab-event-uuid").map(str::to_string),
            // The token itself is the secret; never record it
            signature: token.map(|_| "x-gitlab-token".to_string()),
            verified,
            ..Default::default()
        };
        if !event.is_push {
            return Ok(event);
        }

        let git_ref = body["ref"]
            .as_str()
            .ok_or_else(|| ProviderError::Malformed("push payload without ref".into()))?;
        event.git_ref = Some(GitRef::parse(git_ref));

        let after = body["after"].as_str().unwrap_or_default();
        event.deleted = is_zero_sha(after);

        let sha = body["checkout_sha"]
            .as_str()
            .or(Some(after).filter(|s| !s.is_empty() && !is_zero_sha(s)));
        event.commit_sha = sha.map(str::to_string);

        // Commits are listed oldest first; prefer the one matching the checkout
        let commits = body["commits"].as_array().cloned().unwrap_or_default();
        let head = commits
            .iter()
            .find(|c| sha.is_some() && c["id"].as_str() == sha)
            .or_else(|| commits.last());
        if let Some(head) = head {
            event.commit_message = head["message"].as_str().map(|m| m.trim_end().to_string());
            event.author = head["author"]["name"].as_str().map(str::to_string);
        }
        if event.author.is_none() {
            event.author = body["user_name"].as_str().map(str::to_string);
        }

        Ok(event)
    }
}
