use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;

pub const WORKSPACE_CONTAINER: &str = "workspace";
pub const AGENT_CONTAINER: &str = "agent";
pub const CONTENT_CONTAINER: &str = "content";

pub const WORKSPACE_VOLUME: &str = "workspace";
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";

/// Names of the per-session objects, derived only from the session name
pub struct ResourceNaming;

impl ResourceNaming {
    pub fn job_name(session: &str) -> String {
        Self::with_suffix(session, "-job")
    }

    pub fn pvc_name(session: &str) -> String {
        Self::with_prefix("ambient-workspace-", session)
    }

    /// Shared by the session's ServiceAccount, Role and RoleBinding
    pub fn rbac_name(session: &str) -> String {
        Self::with_prefix("ambient-session-", session)
    }

    /// RoleBinding granting `role` to a project group
    ///
    /// Group names that sanitize to the same text still get distinct names.
    pub fn group_binding_name(role: &str, group: &str) -> String {
        let readable = format!("ambient-project-{role}-{}", sanitize_label_value(group));
        let suffix = format!("-{}", Self::hash_string(group));
        Self::with_suffix(readable.trim_end_matches('-'), &suffix)
    }

    fn with_prefix(prefix: &str, session: &str) -> String {
        let available = MAX_K8S_NAME_LENGTH.saturating_sub(prefix.len());
        format!("{prefix}{}", Self::ensure_k8s_name_length(session, available))
    }

    fn with_suffix(session: &str, suffix: &str) -> String {
        let available = MAX_K8S_NAME_LENGTH.saturating_sub(suffix.len());
        format!("{}{suffix}", Self::ensure_k8s_name_length(session, available))
    }

    fn ensure_k8s_name_length(name: &str, limit: usize) -> String {
        if name.len() <= limit {
            return name.to_string();
        }
        // Keep a readable prefix and make it unique with a hash of the full name
        let hash = Self::hash_string(name);
        let keep = limit.saturating_sub(hash.len() + 1);
        let prefix: String = name.chars().take(keep).collect();
        format!("{}-{hash}", prefix.trim_end_matches('-'))
    }

    fn hash_string(input: &str) -> String {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        format!("{:016x}", hasher.finish())[..8].to_string()
    }
}

/// Sanitize a string to be a valid Kubernetes label value
pub fn sanitize_label_value(input: &str) -> String {
    let mut sanitized = input.to_lowercase().replace([' ', '_'], "-");
    sanitized.retain(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    sanitized.truncate(MAX_K8S_NAME_LENGTH);
    sanitized
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_are_kept_verbatim() {
        assert_eq!(ResourceNaming::job_name("s1"), "s1-job");
        assert_eq!(ResourceNaming::pvc_name("s1"), "ambient-workspace-s1");
        assert_eq!(ResourceNaming::rbac_name("s1"), "ambient-session-s1");
    }

    #[test]
    fn long_names_stay_within_limit_and_unique() {
        let a = "a".repeat(80);
        let b = format!("{}b", "a".repeat(79));

        for name in [ResourceNaming::job_name(&a), ResourceNaming::pvc_name(&a)] {
            assert!(name.len() <= MAX_K8S_NAME_LENGTH, "{name} too long");
        }
        assert_ne!(ResourceNaming::pvc_name(&a), ResourceNaming::pvc_name(&b));
        assert_eq!(ResourceNaming::pvc_name(&a), ResourceNaming::pvc_name(&a));
    }

    #[test]
    fn group_binding_names_keep_colliding_groups_apart() {
        let spaced = ResourceNaming::group_binding_name("edit", "Data Science");
        let snake = ResourceNaming::group_binding_name("edit", "data_science");

        assert!(spaced.starts_with("ambient-project-edit-data-science-"));
        assert_ne!(spaced, snake);
        assert_eq!(spaced, ResourceNaming::group_binding_name("edit", "Data Science"));

        let long = ResourceNaming::group_binding_name("view", &"g".repeat(100));
        assert!(long.len() <= MAX_K8S_NAME_LENGTH, "{long} too long");
        assert!(!ResourceNaming::group_binding_name("view", "***").contains("--"));
    }

    #[test]
    fn sanitizes_label_values() {
        assert_eq!(sanitize_label_value("My Session_1"), "my-session-1");
        assert_eq!(sanitize_label_value("--x--"), "x");
        assert_eq!(sanitize_label_value(&"y".repeat(100)).len(), 63);
        assert_eq!(sanitize_label_value(""), "");
    }
}
