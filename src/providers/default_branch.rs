/// Extract the default branch from `git ls-remote --symref <url> HEAD` output:
///
/// ```text
/// ref: refs/heads/main	HEAD
/// 3f1c...	HEAD
/// ```
pub fn parse_symref_head(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.strip_prefix("ref:")?.trim_start();
        let (target, name) = rest.split_once(char::is_whitespace)?;
        if name.trim() != "HEAD" {
            return None;
        }
        target
            .strip_prefix("refs/heads/")
            .filter(|b| !b.is_empty())
            .map(str::to_string)
    })
}
