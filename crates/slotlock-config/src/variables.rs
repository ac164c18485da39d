//! Predefined CI variable interpolation for resource group keys.
//!
//! Job definitions may declare keys such as `$CI_COMMIT_REF_NAME-$CI_JOB_NAME`
//! or `deploy-${CI_ENVIRONMENT_NAME}`. Supported variables:
//! - `CI_COMMIT_REF_NAME` - Branch or tag the pipeline runs for
//! - `CI_COMMIT_SHA` - Full commit SHA
//! - `CI_COMMIT_SHORT_SHA` - First 8 characters of the commit SHA
//! - `CI_JOB_NAME` - Name of the job declaring the key
//! - `CI_ENVIRONMENT_NAME` - Deployment environment, when the job has one
//! - `CI_PROJECT_PATH` - Project path
//! - any custom variable set on the context
//!
//! Unknown variables are left as written.

use regex::Regex;
use slotlock_core::ResourceGroup;
use std::collections::HashMap;
use std::sync::LazyLock;

// Matches $NAME and ${NAME}
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:\{([A-Za-z_][A-Za-z0-9_]*)\}|([A-Za-z_][A-Za-z0-9_]*))")
        .expect("variable pattern is valid")
});

/// Variables available while a pipeline is being created.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    vars: HashMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.vars.insert(name.to_string(), value.into());
    }

    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Interpolate every `$NAME` / `${NAME}` occurrence in `input`.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                match self.resolve(name) {
                    Some(value) => value.to_string(),
                    None => caps[0].to_string(),
                }
            })
            .to_string()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_ref(mut self, ref_name: impl Into<String>) -> Self {
        self.ctx.set("CI_COMMIT_REF_NAME", ref_name);
        self
    }

    pub fn with_commit_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx
            .set("CI_COMMIT_SHORT_SHA", sha.chars().take(8).collect::<String>());
        self.ctx.set("CI_COMMIT_SHA", sha);
        self
    }

    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.ctx.set("CI_JOB_NAME", name);
        self
    }

    pub fn with_environment(mut self, name: impl Into<String>) -> Self {
        self.ctx.set("CI_ENVIRONMENT_NAME", name);
        self
    }

    pub fn with_project_path(mut self, path: impl Into<String>) -> Self {
        self.ctx.set("CI_PROJECT_PATH", path);
        self
    }

    pub fn with_custom(mut self, key: &str, value: impl Into<String>) -> Self {
        self.ctx.set(key, value);
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand a declared resource group key and validate the result.
pub fn expand_resource_group_key(
    declared: &str,
    ctx: &VariableContext,
) -> slotlock_core::Result<String> {
    ResourceGroup::validate_key(&ctx.interpolate(declared))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_and_braced_variables() {
        let ctx = VariableContextBuilder::new()
            .with_ref("master")
            .with_job_name("test")
            .build();

        assert_eq!(
            ctx.interpolate("$CI_COMMIT_REF_NAME-$CI_JOB_NAME"),
            "master-test"
        );
        assert_eq!(
            ctx.interpolate("${CI_COMMIT_REF_NAME}_deploy"),
            "master_deploy"
        );
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        assert_eq!(ctx.interpolate("env-$UNKNOWN"), "env-$UNKNOWN");
        assert_eq!(ctx.interpolate("env-${UNKNOWN}"), "env-${UNKNOWN}");
    }

    #[test]
    fn test_short_sha() {
        let ctx = VariableContextBuilder::new()
            .with_commit_sha("0123456789abcdef")
            .build();
        assert_eq!(ctx.interpolate("$CI_COMMIT_SHORT_SHA"), "01234567");
    }

    #[test]
    fn test_literal_key_untouched() {
        let ctx = VariableContextBuilder::new().with_ref("main").build();
        assert_eq!(ctx.interpolate("iOS"), "iOS");
    }

    #[test]
    fn test_expand_rejects_empty_result() {
        let ctx = VariableContextBuilder::new()
            .with_environment("")
            .build();
        assert!(expand_resource_group_key("$CI_ENVIRONMENT_NAME", &ctx).is_err());

        let ctx = VariableContextBuilder::new()
            .with_environment("production")
            .build();
        assert_eq!(
            expand_resource_group_key(" $CI_ENVIRONMENT_NAME ", &ctx).unwrap(),
            "production"
        );
    }
}
