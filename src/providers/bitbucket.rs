use axum::http::HeaderMap;

use super::{configured, header, is_zero_sha, parse_json, verify_hmac_sha256, NormalizedEvent, ProviderAdapter};
use crate::db::models::{GitRef, ProviderKind};
use crate::error::ProviderError;

/// Bitbucket Cloud and Bitbucket Server/Data Center.
///
/// When a secret is configured the `X-Hub-Signature` HMAC-SHA256 header is
/// required, which makes verification as strong as GitHub's. Without a secret
/// the only gate is the presence of Bitbucket's delivery headers
/// (`X-Event-Key` plus `X-Request-UUID` or `X-Hook-UUID`); such events are
/// accepted with `verified = false` and anyone who can reach the endpoint can
/// forge them.
pub struct BitbucketAdapter;

impl ProviderAdapter for BitbucketAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Bitbucket
    }

    fn verify_and_parse(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
        secret: Option<&str>,
    ) -> Result<NormalizedEvent, ProviderError> {
        let event_key = header(headers, "x-event-key");
        let delivery_id = header(headers, "x-request-uuid").or_else(|| header(headers, "x-hook-uuid"));
        let signature = header(headers, "x-hub-signature");

        let (event_key, verified) = match configured(secret) {
            Some(secret) => {
                verify_hmac_sha256(secret, payload, signature)?;
                let event_key =
                    event_key.ok_or_else(|| ProviderError::Malformed("missing X-Event-Key header".into()))?;
                (event_key, true)
            }
            None => match (event_key, delivery_id) {
                (Some(event_key), Some(_)) => (event_key, false),
                _ => {
                    return Err(ProviderError::Verification(
                        "missing Bitbucket delivery headers".into(),
                    ))
                }
            },
        };

        let mut event = NormalizedEvent {
            event_type: event_key.to_string(),
            is_push: matches!(event_key, "repo:push" | "repo:refs_changed"),
            delivery_id: delivery_id.map(str::to_string),
            signature: signature.map(str::to_string),
            verified,
            ..Default::default()
        };

        let body = parse_json(payload)?;
        if !event.is_push {
            return Ok(event);
        }

        if event_key == "repo:push" {
            parse_cloud_push(&body, &mut event)?;
        } else {
            parse_server_refs_changed(&body, &mut event)?;
        }
        Ok(event)
    }
}

/// Cloud: `push.changes[0].new` is the updated ref, `null` when deleted.
fn parse_cloud_push(body: &serde_json::Value, event: &mut NormalizedEvent) -> Result<(), ProviderError> {
    let change = &body["push"]["changes"][0];
    if change.is_null() {
        return Err(ProviderError::Malformed("push payload without changes".into()));
    }

    let (target_ref, deleted) = if change["new"].is_null() {
        (&change["old"], true)
    } else {
        (&change["new"], false)
    };

    let name = target_ref["name"]
        .as_str()
        .ok_or_else(|| ProviderError::Malformed("push change without ref name".into()))?;
    event.git_ref = Some(match target_ref["type"].as_str() {
        Some("tag") | Some("annotated_tag") => GitRef::Tag(name.to_string()),
        _ => GitRef::Branch(name.to_string()),
    });
    event.deleted = deleted;

    if !deleted {
        let target = &target_ref["target"];
        event.commit_sha = target["hash"].as_str().map(str::to_string);
        event.commit_message = target["message"].as_str().map(|m| m.trim_end().to_string());
        event.author = target["author"]["user"]["display_name"]
            .as_str()
            .or_else(|| target["author"]["raw"].as_str())
            .map(str::to_string);
    }
    if event.author.is_none() {
        event.author = body["actor"]["display_name"].as_str().map(str::to_string);
    }
    Ok(())
}

/// Server/Data Center: `changes[0]` with `ref.id`, `toHash` and `type`.
fn parse_server_refs_changed(body: &serde_json::Value, event: &mut NormalizedEvent) -> Result<(), ProviderError> {
    let change = &body["changes"][0];
    let ref_id = change["ref"]["id"]
        .as_str()
        .or_else(|| change["refId"].as_str())
        .ok_or_else(|| ProviderError::Malformed("refs_changed payload without ref".into()))?;
    event.git_ref = Some(GitRef::parse(ref_id));

    let to_hash = change["toHash"].as_str().unwrap_or_default();
    event.deleted = change["type"].as_str() == Some("DELETE") || is_zero_sha(to_hash);
    if !event.deleted && !to_hash.is_empty() {
        event.commit_sha = Some(to_hash.to_string());
    }
    event.author = body["actor"]["displayName"]
        .as_str()
        .or_else(|| body["actor"]["name"].as_str())
        .map(str::to_string);
    Ok(())
}
