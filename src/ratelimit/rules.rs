//! Rate limit rule configuration and matching.
//!
//! A request path is matched against explicit overrides first (in the order
//! they were configured), then against the built-in endpoint categories.
//! The first match wins; matches are never merged.

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::policy::RateLimit;

/// A policy applied to every path containing `pattern`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathOverride {
    /// Substring to look for in the request path
    pub pattern: String,
    /// Policy applied on a match
    pub limit: RateLimit,
}

/// Built-in endpoint categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    /// Authentication endpoints (`/auth/`)
    Auth,
    /// Upload and document endpoints (`/upload`, `/documents`)
    Upload,
    /// Everything else
    Default,
}

impl Category {
    /// Classify a request path.
    pub fn for_path(path: &str) -> Self {
        if path.contains("/auth/") {
            Category::Auth
        } else if path.contains("/upload") || path.contains("/documents") {
            Category::Upload
        } else {
            Category::Default
        }
    }
}

/// Policies for the built-in categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryDefaults {
    #[serde(default = "default_auth_limit")]
    pub auth: RateLimit,
    #[serde(default = "default_upload_limit")]
    pub upload: RateLimit,
    #[serde(default = "default_limit")]
    pub default: RateLimit,
}

impl Default for CategoryDefaults {
    fn default() -> Self {
        Self {
            auth: default_auth_limit(),
            upload: default_upload_limit(),
            default: default_limit(),
        }
    }
}

fn default_auth_limit() -> RateLimit {
    RateLimit::fixed(5, 60)
}

fn default_upload_limit() -> RateLimit {
    RateLimit::fixed(10, 60)
}

fn default_limit() -> RateLimit {
    RateLimit::fixed(100, 60)
}

impl CategoryDefaults {
    pub fn get(&self, category: Category) -> &RateLimit {
        match category {
            Category::Auth => &self.auth,
            Category::Upload => &self.upload,
            Category::Default => &self.default,
        }
    }
}

/// Maps request paths to rate limit policies.
#[derive(Debug, Clone, Default)]
pub struct RuleSelector {
    overrides: Vec<PathOverride>,
    categories: CategoryDefaults,
}

impl RuleSelector {
    pub fn new(overrides: Vec<PathOverride>, categories: CategoryDefaults) -> Self {
        Self {
            overrides,
            categories,
        }
    }

    /// Find the policy for a request path.
    pub fn select(&self, path: &str) -> &RateLimit {
        if let Some(rule) = self
            .overrides
            .iter()
            .find(|rule| path.contains(rule.pattern.as_str()))
        {
            trace!(path = %path, pattern = %rule.pattern, "Matched path override");
            return &rule.limit;
        }

        let category = Category::for_path(path);
        trace!(path = %path, category = ?category, "Matched category");
        self.categories.get(category)
    }
}
