//! Feature validation schemas
//!
//! A [`SchemaRegistry`] maps each [`FeatureType`] to the rules that check
//! it. The built-in schemas ship with the binary; operators may add rules
//! from a directory of YAML files at start-up. The registry is immutable
//! once built and shared behind an `Arc`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use qaflow_common::{
    BrowserAction, ControlKind, DiscoveredPage, Error, FeatureType, PageKind, Priority, Result,
    TestCategory, WaitState,
};
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const BUILTIN_SCHEMAS: &str = include_str!("../schemas/builtin.yaml");

/// Timeout of the initial wait for a rule's target
const TARGET_WAIT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

impl Severity {
    pub fn default_priority(&self) -> Priority {
        match self {
            Severity::Critical => Priority::High,
            Severity::Major => Priority::Medium,
            Severity::Minor => Priority::Low,
        }
    }
}

fn one() -> usize {
    1
}

/// When a rule applies to a page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionStrategy {
    /// At least `min_count` controls of a kind
    ControlPresent {
        kind: ControlKind,
        #[serde(default = "one")]
        min_count: usize,
    },
    /// Page classified as the given kind
    PageKind { kind: PageKind },
    /// Some non-link control label matches the pattern (case-insensitive)
    LabelPresent { pattern: String },
    /// Some control is marked required
    RequiredFieldPresent,
    Always,
}

impl DetectionStrategy {
    pub fn matches(&self, page: &DiscoveredPage) -> bool {
        match self {
            DetectionStrategy::ControlPresent { kind, min_count } => {
                page.controls.iter().filter(|c| c.kind == *kind).count() >= *min_count
            }
            DetectionStrategy::PageKind { kind } => page.page_kind == *kind,
            DetectionStrategy::LabelPresent { pattern } => match label_regex(pattern) {
                Ok(re) => page
                    .controls
                    .iter()
                    .any(|c| c.kind != ControlKind::Link && re.is_match(c.label.trim())),
                Err(_) => false,
            },
            DetectionStrategy::RequiredFieldPresent => page.controls.iter().any(|c| c.required),
            DetectionStrategy::Always => true,
        }
    }
}

/// How a rule finds its target element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SelectorStrategy {
    FirstOfKind { kind: ControlKind },
    /// First control whose label matches; any interactive kind when `kind` is absent
    LabelMatches {
        #[serde(default)]
        kind: Option<ControlKind>,
        pattern: String,
    },
    /// Descendant of the first control of a kind
    Within { kind: ControlKind, selector: String },
    Css { selector: String },
    /// The page itself
    Page,
}

impl SelectorStrategy {
    /// Concrete selector on this page, if the target exists
    pub fn resolve(&self, page: &DiscoveredPage) -> Option<String> {
        match self {
            SelectorStrategy::FirstOfKind { kind } => page
                .controls
                .iter()
                .find(|c| c.kind == *kind)
                .map(|c| c.selector.clone()),
            SelectorStrategy::LabelMatches { kind, pattern } => {
                let re = label_regex(pattern).ok()?;
                page.controls
                    .iter()
                    .filter(|c| match kind {
                        Some(k) => c.kind == *k,
                        None => matches!(c.kind, ControlKind::Button | ControlKind::Link | ControlKind::Select),
                    })
                    .find(|c| re.is_match(c.label.trim()))
                    .map(|c| c.selector.clone())
            }
            SelectorStrategy::Within { kind, selector } => page
                .controls
                .iter()
                .find(|c| c.kind == *kind)
                .map(|c| scope_selector(&c.selector, selector)),
            SelectorStrategy::Css { selector } => Some(selector.clone()),
            SelectorStrategy::Page => Some("body".to_string()),
        }
    }
}

/// Prefix every comma-separated part of `inner` with `outer`
fn scope_selector(outer: &str, inner: &str) -> String {
    inner
        .split(',')
        .map(|part| format!("{} {}", outer, part.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn label_regex(pattern: &str) -> std::result::Result<regex::Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

fn default_items() -> String {
    "{target} > *".to_string()
}

fn default_query() -> String {
    "test".to_string()
}

fn default_sample() -> String {
    "qaflow".to_string()
}

/// What a passing case observes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpectedAssertion {
    /// Page loads without server errors
    PageLoads,
    /// Target is visible
    Visible,
    /// Target contains at least `count` items matching `items` (`{target}` is substituted)
    MinItems {
        #[serde(default = "one")]
        count: usize,
        #[serde(default = "default_items")]
        items: String,
    },
    /// Submitting a query through the target completes without server errors
    SearchResponds {
        #[serde(default = "default_query")]
        query: String,
    },
    /// Clicking the target completes without server errors
    ClickResponds,
    /// Clicking the target changes the URL
    NavigatesAway,
    /// Submitting the target form empty keeps the user on the page
    RequiredFieldsEnforced,
    /// Typing into the target completes without errors
    FieldAcceptsInput {
        #[serde(default = "default_sample")]
        value: String,
    },
}

impl ExpectedAssertion {
    /// Steps checking this assertion on `page_url` against `target`
    pub fn to_steps(&self, page_url: &str, target: &str) -> Vec<BrowserAction> {
        let mut steps = vec![BrowserAction::Navigate {
            url: page_url.to_string(),
        }];
        let wait_target = BrowserAction::Wait {
            selector: target.to_string(),
            timeout_ms: TARGET_WAIT_MS,
            state: WaitState::Visible,
        };

        match self {
            ExpectedAssertion::PageLoads => {
                steps.push(BrowserAction::AssertNoServerErrors);
                steps.push(BrowserAction::Assert {
                    selector: "body".to_string(),
                    visible: Some(true),
                    text_contains: None,
                    min_count: None,
                });
            }
            ExpectedAssertion::Visible => {
                steps.push(wait_target);
                steps.push(BrowserAction::Assert {
                    selector: target.to_string(),
                    visible: Some(true),
                    text_contains: None,
                    min_count: None,
                });
            }
            ExpectedAssertion::MinItems { count, items } => {
                steps.push(wait_target);
                steps.push(BrowserAction::Assert {
                    selector: items.replace("{target}", target),
                    visible: None,
                    text_contains: None,
                    min_count: Some(*count),
                });
            }
            ExpectedAssertion::SearchResponds { query } => {
                steps.push(wait_target);
                steps.push(BrowserAction::Fill {
                    selector: target.to_string(),
                    value: query.clone(),
                });
                steps.push(BrowserAction::Press {
                    selector: Some(target.to_string()),
                    key: "Enter".to_string(),
                });
                steps.push(BrowserAction::Sleep { ms: 1000 });
                steps.push(BrowserAction::AssertNoServerErrors);
            }
            ExpectedAssertion::ClickResponds => {
                steps.push(wait_target);
                steps.push(BrowserAction::Click {
                    selector: target.to_string(),
                    timeout_ms: None,
                });
                steps.push(BrowserAction::Sleep { ms: 500 });
                steps.push(BrowserAction::AssertNoServerErrors);
            }
            ExpectedAssertion::NavigatesAway => {
                steps.push(wait_target);
                steps.push(BrowserAction::Click {
                    selector: target.to_string(),
                    timeout_ms: None,
                });
                steps.push(BrowserAction::AssertUrl {
                    changed_from: Some(page_url.to_string()),
                    contains: None,
                });
                steps.push(BrowserAction::AssertNoServerErrors);
            }
            ExpectedAssertion::RequiredFieldsEnforced => {
                steps.push(wait_target);
                steps.push(BrowserAction::Click {
                    selector: scope_selector(target, "[type=submit], button:not([type=button])"),
                    timeout_ms: None,
                });
                steps.push(BrowserAction::AssertUrl {
                    changed_from: None,
                    contains: Some(url_path(page_url)),
                });
                steps.push(BrowserAction::Assert {
                    selector: target.to_string(),
                    visible: Some(true),
                    text_contains: None,
                    min_count: None,
                });
            }
            ExpectedAssertion::FieldAcceptsInput { value } => {
                steps.push(wait_target);
                steps.push(BrowserAction::Fill {
                    selector: target.to_string(),
                    value: value.clone(),
                });
                steps.push(BrowserAction::AssertNoServerErrors);
            }
        }
        steps
    }
}

/// Path component of a URL, or the input when it does not parse
fn url_path(page_url: &str) -> String {
    url::Url::parse(page_url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| page_url.to_string())
}

/// A checkable behaviour of a feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    /// Globally unique rule id, e.g. `search.responds`
    pub id: String,
    pub name: String,
    pub detection: DetectionStrategy,
    pub selector: SelectorStrategy,
    pub assertion: ExpectedAssertion,
    pub severity: Severity,
    pub category: TestCategory,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub expected_result: String,
}

impl ValidationRule {
    pub fn priority(&self) -> Priority {
        self.priority
            .unwrap_or_else(|| self.severity.default_priority())
    }

    fn check(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidConfig("validation rule without id".to_string()));
        }
        let patterns = [
            match &self.detection {
                DetectionStrategy::LabelPresent { pattern } => Some(pattern),
                _ => None,
            },
            match &self.selector {
                SelectorStrategy::LabelMatches { pattern, .. } => Some(pattern),
                _ => None,
            },
        ];
        for pattern in patterns.into_iter().flatten() {
            label_regex(pattern).map_err(|e| {
                Error::InvalidConfig(format!("rule {}: bad pattern '{}': {}", self.id, pattern, e))
            })?;
        }
        Ok(())
    }
}

/// All rules for one feature type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureValidationSchema {
    pub feature: FeatureType,
    #[serde(default)]
    pub description: String,
    pub rules: Vec<ValidationRule>,
}

/// A schema file holds one schema or a list of them
#[derive(Deserialize)]
#[serde(untagged)]
enum SchemaFile {
    Many(Vec<FeatureValidationSchema>),
    One(FeatureValidationSchema),
}

impl SchemaFile {
    fn into_vec(self) -> Vec<FeatureValidationSchema> {
        match self {
            SchemaFile::Many(schemas) => schemas,
            SchemaFile::One(schema) => vec![schema],
        }
    }
}

fn parse_schemas(yaml: &str, origin: &str) -> Result<Vec<FeatureValidationSchema>> {
    let file: SchemaFile = serde_yaml::from_str(yaml)
        .map_err(|e| Error::InvalidConfig(format!("schema {}: {}", origin, e)))?;
    Ok(file.into_vec())
}

/// Immutable registry keyed by feature type
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<FeatureType, FeatureValidationSchema>,
}

impl SchemaRegistry {
    /// Built-in schemas only
    pub fn builtin() -> Result<Self> {
        let mut registry = Self::default();
        for schema in parse_schemas(BUILTIN_SCHEMAS, "builtin")? {
            registry.merge(schema, "builtin")?;
        }
        Ok(registry)
    }

    /// Built-in schemas plus operator extensions from `dir`
    pub fn load(dir: Option<&Path>) -> Result<Self> {
        let mut registry = Self::builtin()?;
        if let Some(dir) = dir {
            registry = registry.with_directory(dir)?;
        }
        info!(
            features = registry.schemas.len(),
            rules = registry.rule_count(),
            "Schema registry ready"
        );
        Ok(registry)
    }

    /// Merge every `*.yaml`/`*.yml` file under `dir`
    pub fn with_directory(mut self, dir: &Path) -> Result<Self> {
        if !dir.exists() {
            warn!("Schema directory {} does not exist", dir.display());
            return Ok(self);
        }

        let mut files: Vec<_> = walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .map(|e| e.into_path())
            .collect();
        // Deterministic merge order
        files.sort();

        for path in files {
            let content = std::fs::read_to_string(&path)?;
            let origin = path.display().to_string();
            for schema in parse_schemas(&content, &origin)? {
                self.merge(schema, &origin)?;
            }
        }
        Ok(self)
    }

    fn merge(&mut self, schema: FeatureValidationSchema, origin: &str) -> Result<()> {
        let mut known: BTreeSet<String> = self
            .schemas
            .values()
            .flat_map(|s| s.rules.iter().map(|r| r.id.clone()))
            .collect();

        let feature = schema.feature;
        let entry = self
            .schemas
            .entry(feature)
            .or_insert_with(|| FeatureValidationSchema {
                feature,
                description: schema.description.clone(),
                rules: Vec::new(),
            });

        for rule in schema.rules {
            rule.check()?;
            if !known.insert(rule.id.clone()) {
                warn!("Ignoring duplicate rule {} from {}", rule.id, origin);
                continue;
            }
            debug!("Registered rule {} for {} from {}", rule.id, feature.as_str(), origin);
            entry.rules.push(rule);
        }
        Ok(())
    }

    pub fn get(&self, feature: FeatureType) -> Option<&FeatureValidationSchema> {
        self.schemas.get(&feature)
    }

    pub fn rules_for(&self, feature: FeatureType) -> &[ValidationRule] {
        self.schemas
            .get(&feature)
            .map(|s| s.rules.as_slice())
            .unwrap_or(&[])
    }

    pub fn features(&self) -> impl Iterator<Item = FeatureType> + '_ {
        self.schemas.keys().copied()
    }

    pub fn rule_count(&self) -> usize {
        self.schemas.values().map(|s| s.rules.len()).sum()
    }
}
