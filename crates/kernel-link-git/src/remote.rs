//! Remote URL normalization.
//!
//! The kernel only fetches over HTTPS, so SSH remotes are rewritten to the
//! equivalent HTTPS form. The trailing `.git`, if any, is kept as given.

/// Rewrite an SSH remote URL into its HTTPS form.
///
/// Handles scp-like remotes (`git@host:owner/repo.git`) and `ssh://` URLs
/// (`ssh://git@host:2222/owner/repo.git`). Anything else is returned trimmed
/// but otherwise unchanged.
#[must_use]
pub fn normalize_remote_url(url: &str) -> String {
    let url = url.trim();
    let rewritten = ssh_url(url).or_else(|| scp_like(url));

    match rewritten {
        Some((host, path)) => {
            let https = format!("https://{host}/{path}");
            tracing::warn!("Transforming SSH URL into HTTPS URL: {url} -> {https}");
            https
        }
        None => url.to_string(),
    }
}

fn ssh_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("ssh://")?;
    let (authority, path) = rest.split_once('/')?;
    let host = strip_user(authority);
    let host = host.split_once(':').map_or(host, |(host, _port)| host);
    non_empty(host, path)
}

fn scp_like(url: &str) -> Option<(&str, &str)> {
    if url.contains("://") {
        return None;
    }
    let (authority, path) = url.split_once(':')?;
    // Local paths and Windows drive letters are not remotes.
    if authority.contains('/') || authority.len() == 1 {
        return None;
    }
    non_empty(strip_user(authority), path.trim_start_matches('/'))
}

fn strip_user(authority: &str) -> &str {
    authority.rsplit_once('@').map_or(authority, |(_, host)| host)
}

fn non_empty<'a>(host: &'a str, path: &'a str) -> Option<(&'a str, &'a str)> {
    (!host.is_empty() && !path.is_empty()).then_some((host, path))
}
