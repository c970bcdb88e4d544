use globset::{Glob, GlobSetBuilder};
use tracing::warn;

use crate::db::models::GitRef;

/// Whether a pushed ref should trigger a build.
///
/// A branch equal to the tracked branch always matches. Otherwise the ref name
/// (branch or tag) must match one of the glob `patterns`; tags can only match
/// this way. Invalid patterns are skipped.
pub fn ref_matches(git_ref: &GitRef, tracked_branch: &str, patterns: &[String]) -> bool {
    if let GitRef::Branch(branch) = git_ref {
        if branch == tracked_branch {
            return true;
        }
    }

    if patterns.is_empty() {
        return false;
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(e) => warn!("Skipping invalid branch pattern {:?}: {}", pattern, e),
        }
    }

    match builder.build() {
        Ok(set) => set.is_match(git_ref.name()),
        Err(e) => {
            warn!("Failed to build branch pattern set: {}", e);
            false
        }
    }
}
