//! Member eligibility by name.

/// Component substrings shipped when none are configured.
pub const DEFAULT_COMPONENTS: &[&str] = &["control", "compute"];

/// Required member suffix when none is configured.
pub const DEFAULT_EXTENSION: &str = ".log";

/// Decides which archive members carry logs worth shipping.
///
/// A member is eligible when its name ends with the configured extension and
/// contains at least one of the component substrings anywhere in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberFilter {
    components: Vec<String>,
    extension: String,
}

impl MemberFilter {
    pub fn new<I, S>(components: I, extension: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            components: components.into_iter().map(Into::into).collect(),
            extension: extension.into(),
        }
    }

    pub fn is_eligible(&self, name: &str) -> bool {
        is_eligible(name, &self.components, &self.extension)
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }
}

impl Default for MemberFilter {
    fn default() -> Self {
        Self::new(DEFAULT_COMPONENTS.iter().copied(), DEFAULT_EXTENSION)
    }
}

/// Case-sensitive suffix match on `extension` plus plain substring match on
/// any of `components`.
pub fn is_eligible<S: AsRef<str>>(name: &str, components: &[S], extension: &str) -> bool {
    name.ends_with(extension) && components.iter().any(|c| name.contains(c.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_components() {
        let filter = MemberFilter::default();
        assert!(filter.is_eligible("compute-plane-1.log"));
        assert!(filter.is_eligible("logs/control-plane/pod.log"));
        assert!(!filter.is_eligible("unrelated-service.log"));
    }

    #[test]
    fn test_extension_is_case_sensitive_suffix() {
        let filter = MemberFilter::default();
        assert!(!filter.is_eligible("compute.LOG"));
        assert!(!filter.is_eligible("compute.log.gz"));
        assert!(!filter.is_eligible("compute.txt"));
    }

    #[test]
    fn test_component_is_plain_substring() {
        let filter = MemberFilter::new(["comp"], ".log");
        assert!(filter.is_eligible("supercomputer.log"));
        assert!(filter.is_eligible("a/b/xcompx.log"));
        assert!(!filter.is_eligible("cmp.log"));
    }

    #[test]
    fn test_no_components_matches_nothing() {
        let filter = MemberFilter::new(Vec::<String>::new(), ".log");
        assert!(!filter.is_eligible("compute.log"));
    }

    #[test]
    fn test_free_function() {
        assert!(is_eligible("worker-compute.log", &["compute"], ".log"));
        assert!(!is_eligible("worker-compute.json", &["compute"], ".log"));
        assert!(is_eligible("x.json", &["x".to_string()], ".json"));
    }
}
