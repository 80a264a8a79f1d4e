//! Name and namespace matching for the launch/attach whitelists.
//!
//! A pattern can name an executable (`talker`), a full node name
//! (`/ns1/ns2/talker`), a bare node name (`/talker`), a namespace prefix with
//! a trailing slash (`/ns1/ns2/`) or a tail path without slashes at either end
//! (`ns2/talker`).

/// Returns whether the executable or node is named by any pattern.
pub fn matches(patterns: &[String], executable: &str, node_name: &str) -> bool {
    let listed = |candidate: &str| patterns.iter().any(|p| p == candidate);

    if listed(executable) || listed(node_name) {
        return true;
    }

    let segments: Vec<&str> = node_name.split('/').collect();
    let Some(leaf) = segments.last() else {
        return false;
    };
    if listed(&format!("/{leaf}")) {
        return true;
    }

    let mut prefix = String::new();
    for segment in &segments[..segments.len() - 1] {
        prefix.push_str(segment);
        prefix.push('/');
        if listed(&prefix) {
            return true;
        }
    }

    // Longest tail first, down to `ns/leaf`.
    for start in 1..segments.len().saturating_sub(1) {
        let suffix = segments[start..].join("/");
        if !suffix.starts_with('/') && listed(&suffix) {
            return true;
        }
    }

    false
}

/// Interpretation of an optional whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absent {
    /// A missing list matches nothing.
    MatchNone,
    /// A missing list matches everything.
    MatchAll,
}

/// Applies [`matches`] to an optional list.
pub fn matches_optional(
    patterns: Option<&[String]>,
    absent: Absent,
    executable: &str,
    node_name: &str,
) -> bool {
    match patterns {
        Some(patterns) => matches(patterns, executable, node_name),
        None => absent == Absent::MatchAll,
    }
}
