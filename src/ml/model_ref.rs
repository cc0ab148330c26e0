use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::str::FromStr;

lazy_static! {
    // BigQuery cannot bind a model name as a query parameter, so the
    // identifier is pinned to plain characters before it reaches SQL text.
    static ref MODEL_PATTERN: Regex = Regex::new(
        r"^(?:(?P<project>[a-z][a-z0-9\-]{4,28}[a-z0-9])\.)?(?P<dataset>[A-Za-z0-9_]{1,1024})\.(?P<model>[A-Za-z0-9_]{1,1024})$"
    )
    .expect("model pattern compiles");
}

/// Reference to a trained BigQuery ML model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    project: Option<String>,
    dataset: String,
    model: String,
}

impl ModelRef {
    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Fully-qualified, backtick-quoted name for use inside `MODEL ...`
    pub fn quoted(&self, default_project: &str) -> String {
        let project = self.project.as_deref().unwrap_or(default_project);
        format!("`{}.{}.{}`", project, self.dataset, self.model)
    }
}

impl FromStr for ModelRef {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let caps = MODEL_PATTERN.captures(value.trim()).ok_or_else(|| {
            format!(
                "'{}' is not a valid model identifier; expected [project.]dataset.model",
                value
            )
        })?;

        Ok(ModelRef {
            project: caps.name("project").map(|m| m.as_str().to_string()),
            dataset: caps["dataset"].to_string(),
            model: caps["model"].to_string(),
        })
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project {
            Some(project) => write!(f, "{}.{}.{}", project, self.dataset, self.model),
            None => write!(f, "{}.{}", self.dataset, self.model),
        }
    }
}
