//! Authorization scope strings of the form `resourceType:name:actions`.

use std::collections::{BTreeMap, BTreeSet};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The scope required for catalog listings.
pub const CATALOG: &str = "registry:catalog:*";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the pull scope for a repository.
pub fn pull(repository: &str) -> String {
    format!("repository:{}:pull", repository)
}

/// Builds the push scope for a repository.
pub fn push(repository: &str) -> String {
    format!("repository:{}:push", repository)
}

/// Builds the combined pull and push scope for a repository.
pub fn pull_push(repository: &str) -> String {
    format!("repository:{}:pull,push", repository)
}

/// Normalizes a set of scope strings.
///
/// Whitespace is trimmed and empties are dropped. Well-formed scopes naming the
/// same `resourceType:name` are merged; their actions are deduplicated and
/// sorted, and collapse to `*` when the wildcard is present. Scopes without a
/// second `:` or with empty actions are kept verbatim. The output is sorted and
/// duplicate-free, and the transform is idempotent.
pub fn clean_scopes(scopes: &[String]) -> Vec<String> {
    let mut grouped: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
    let mut verbatim: BTreeSet<String> = BTreeSet::new();

    for scope in scopes {
        let scope = scope.trim();
        if scope.is_empty() {
            continue;
        }

        let mut parts = scope.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(resource_type), Some(name), Some(actions)) if !actions.is_empty() => {
                grouped
                    .entry((resource_type.to_string(), name.to_string()))
                    .or_default()
                    .extend(actions.split(',').filter(|a| !a.is_empty()).map(String::from));
            }
            _ => {
                verbatim.insert(scope.to_string());
            }
        }
    }

    let mut cleaned: BTreeSet<String> = verbatim;
    for ((resource_type, name), actions) in grouped {
        let actions = if actions.contains("*") {
            "*".to_string()
        } else {
            actions.into_iter().collect::<Vec<_>>().join(",")
        };
        cleaned.insert(format!("{}:{}:{}", resource_type, name, actions));
    }

    cleaned.into_iter().collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
