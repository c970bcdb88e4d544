use axum::http::HeaderMap;

use super::{configured, header, is_zero_sha, parse_json, subtle_compare, NormalizedEvent, ProviderAdapter};
use crate::db::models::{GitRef, ProviderKind};
use crate::error::ProviderError;

/// Self-hosted or unknown forges.
///
/// With a secret configured, the caller must present it in `X-Webhook-Token`
/// or as `Authorization: Bearer <secret>`. The payload is read best-effort:
/// `ref`, then `after`/`commit`/`sha`/`checkout_sha` for the commit, and
/// `message`/`author` at the top level or under `head_commit`.
pub struct GenericAdapter;

impl ProviderAdapter for GenericAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Generic
    }

    fn verify_and_parse(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
        secret: Option<&str>,
    ) -> Result<NormalizedEvent, ProviderError> {
        let token = header(headers, "x-webhook-token").or_else(|| {
            header(headers, "authorization").and_then(|v| v.strip_prefix("Bearer ")).map(str::trim)
        });

        let verified = match configured(secret) {
            Some(secret) => {
                let token = token.ok_or_else(|| ProviderError::Verification("missing webhook token".into()))?;
                if !subtle_compare(token.as_bytes(), secret.as_bytes()) {
                    return Err(ProviderError::Verification("token mismatch".into()));
                }
                true
            }
            None => false,
        };

        let body = parse_json(payload)?;

        let event_type = header(headers, "x-event-type")
            .or_else(|| body["event"].as_str())
            .unwrap_or("push")
            .to_string();

        let mut event = NormalizedEvent {
            is_push: event_type.eq_ignore_ascii_case("push"),
            event_type,
            delivery_id: header(headers, "x-delivery-id").map(str::to_string),
            signature: token.map(|_| "token".to_string()),
            verified,
            ..Default::default()
        };
        if !event.is_push {
            return Ok(event);
        }

        let git_ref = body["ref"]
            .as_str()
            .or_else(|| body["branch"].as_str())
            .ok_or_else(|| ProviderError::Malformed("payload has no ref or branch".into()))?;
        event.git_ref = Some(GitRef::parse(git_ref));

        let sha = ["after", "commit", "sha", "checkout_sha"]
            .iter()
            .find_map(|key| body[*key].as_str())
            .or_else(|| body["head_commit"]["id"].as_str())
            .unwrap_or_default();
        event.deleted = is_zero_sha(sha) || body["deleted"].as_bool().unwrap_or(false);
        if !sha.is_empty() && !is_zero_sha(sha) {
            event.commit_sha = Some(sha.to_string());
        }

        event.commit_message = body["message"]
            .as_str()
            .or_else(|| body["head_commit"]["message"].as_str())
            .map(str::to_string);
        event.author = body["author"]
            .as_str()
            .or_else(|| body["author"]["name"].as_str())
            .or_else(|| body["head_commit"]["author"]["name"].as_str())
            .map(str::to_string);

        Ok(event)
    }
}
