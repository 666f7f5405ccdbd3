//! Test plan builder
//!
//! Rule-based generation instantiates every applicable [`ValidationRule`]
//! per in-scope page. AI-assisted generation adds cases on top when a
//! provider is available; it never replaces or overrides rule cases.

use std::collections::BTreeMap;
use std::sync::Arc;

use qaflow_common::{
    derive_case_id, BrowserAction, CaseSource, DiscoveredPage, Evidence, Priority, TestCase,
    TestCategory, TestScope, TestStatus,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use url::Url;

use crate::ai::{AiProvider, OutputSchema};
use crate::config::{GenerationConfig, GenerationMode};
use crate::schema::{SchemaRegistry, ValidationRule};

const SYSTEM_PROMPT: &str = "You are a QA engineer writing browser test cases for an existing web \
application. Only use selectors that appear in the page description. Never delete data, log out, \
or change account settings.";

/// Controls described to the model per page
const MAX_PROMPT_CONTROLS: usize = 40;

/// A case as proposed by the model
#[derive(Debug, Deserialize)]
struct ProposedCase {
    title: String,
    #[serde(default)]
    category: Option<TestCategory>,
    #[serde(default)]
    priority: Option<Priority>,
    steps: Vec<BrowserAction>,
    #[serde(default)]
    expected_result: String,
}

pub struct PlanBuilder {
    registry: Arc<SchemaRegistry>,
    config: GenerationConfig,
    temperature: f32,
}

impl PlanBuilder {
    pub fn new(registry: Arc<SchemaRegistry>, config: GenerationConfig, temperature: f32) -> Self {
        Self {
            registry,
            config,
            temperature,
        }
    }

    /// Build the plan for the in-scope pages
    pub async fn build(
        &self,
        run_id: &str,
        pages: &[DiscoveredPage],
        scope: &TestScope,
        provider: Option<Arc<dyn AiProvider>>,
    ) -> Vec<TestCase> {
        let in_scope: Vec<&DiscoveredPage> = pages.iter().filter(|p| scope.includes_page(p)).collect();

        let provider = match provider {
            Some(p) if self.config.mode != GenerationMode::RuleBased => {
                if p.is_available().await {
                    Some(p)
                } else {
                    warn!(model = p.model(), "AI provider unavailable, using rule-based generation only");
                    None
                }
            }
            _ => None,
        };

        let mut cases = match (self.config.mode, &provider) {
            (GenerationMode::AiOnly, Some(_)) => BTreeMap::new(),
            _ => self.rule_cases(run_id, &in_scope, scope),
        };
        let rule_count = cases.len();

        if let Some(provider) = provider {
            let assisted = self.ai_cases(run_id, &in_scope, provider.as_ref()).await;
            let offered = assisted.len();
            for case in assisted {
                cases.entry(case.id.clone()).or_insert(case);
            }
            debug!(offered, merged = cases.len() - rule_count, "AI-assisted cases merged");

            if cases.is_empty() && self.config.mode == GenerationMode::AiOnly {
                info!("AI provider produced no cases, falling back to rule-based generation");
                cases = self.rule_cases(run_id, &in_scope, scope);
            }
        }

        let plan = self.finalize(cases, &in_scope);
        info!(
            pages = in_scope.len(),
            cases = plan.len(),
            mode = ?self.config.mode,
            "Test plan built"
        );
        plan
    }

    /// One case per applicable rule per page, keyed by case id
    pub fn rule_cases(
        &self,
        run_id: &str,
        pages: &[&DiscoveredPage],
        scope: &TestScope,
    ) -> BTreeMap<String, TestCase> {
        let mut cases = BTreeMap::new();
        for page in pages {
            for feature in page.features.iter().filter(|f| scope.includes_feature(**f)) {
                for rule in self.registry.rules_for(*feature) {
                    if !rule.detection.matches(page) {
                        continue;
                    }
                    let Some(target) = rule.selector.resolve(page) else {
                        debug!("Rule {} has no target on {}", rule.id, page.url);
                        continue;
                    };
                    let case = rule_case(run_id, page, rule, &target);
                    cases.entry(case.id.clone()).or_insert(case);
                }
            }
        }
        cases
    }

    async fn ai_cases(&self, run_id: &str, pages: &[&DiscoveredPage], provider: &dyn AiProvider) -> Vec<TestCase> {
        let schema = OutputSchema::Array {
            item_hint: json!({
                "title": "string",
                "category": "listing|search|pagination|filter|sort|create|read|update|navigation|form_validation|general",
                "priority": "high|medium|low",
                "steps": [{"action": "navigate|click|fill|press|wait|assert|assert_url|assert_no_server_errors", "...": "action fields"}],
                "expected_result": "string",
            }),
        };

        let mut cases = Vec::new();
        for page in pages.iter().take(self.config.max_ai_pages) {
            let prompt = describe_page(page);
            let value = provider
                .generate_structured(&prompt, &schema, Some(SYSTEM_PROMPT), self.temperature)
                .await;
            let items = match value {
                Value::Array(items) => items,
                _ => Vec::new(),
            };
            for item in items {
                match serde_json::from_value::<ProposedCase>(item) {
                    Ok(proposed) => {
                        if let Some(case) = ai_case(run_id, page, proposed) {
                            cases.push(case);
                        }
                    }
                    Err(e) => debug!("Discarding malformed AI case for {}: {}", page.url, e),
                }
            }
        }
        cases
    }

    /// Order by page, rule cases first, and apply the case cap
    fn finalize(&self, cases: BTreeMap<String, TestCase>, pages: &[&DiscoveredPage]) -> Vec<TestCase> {
        let page_index: BTreeMap<&str, usize> = pages
            .iter()
            .enumerate()
            .map(|(i, p)| (p.page_signature.as_str(), i))
            .collect();

        let mut plan: Vec<TestCase> = cases.into_values().collect();
        if plan.len() > self.config.max_cases {
            plan.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
            warn!(
                dropped = plan.len() - self.config.max_cases,
                "Test plan exceeds max_cases, keeping highest priority cases"
            );
            plan.truncate(self.config.max_cases);
        }
        plan.sort_by(|a, b| {
            let pa = page_index.get(a.page_signature.as_str()).copied().unwrap_or(usize::MAX);
            let pb = page_index.get(b.page_signature.as_str()).copied().unwrap_or(usize::MAX);
            pa.cmp(&pb)
                .then_with(|| (a.source == CaseSource::Ai).cmp(&(b.source == CaseSource::Ai)))
                .then_with(|| a.template.cmp(&b.template))
        });
        plan
    }
}

fn new_case(run_id: &str, page: &DiscoveredPage, template: String) -> TestCase {
    TestCase {
        id: derive_case_id(run_id, &page.page_signature, &template),
        title: String::new(),
        page_url: page.url.clone(),
        page_name: page.name(),
        page_signature: page.page_signature.clone(),
        template,
        category: TestCategory::General,
        priority: Priority::default(),
        source: CaseSource::Rule,
        steps: Vec::new(),
        expected_result: String::new(),
        status: TestStatus::Pending,
        step_results: Vec::new(),
        evidence: Evidence::default(),
        error: None,
        duration_ms: 0,
    }
}

fn rule_case(run_id: &str, page: &DiscoveredPage, rule: &ValidationRule, target: &str) -> TestCase {
    TestCase {
        title: format!("{}: {}", page.name(), rule.name),
        category: rule.category,
        priority: rule.priority(),
        steps: rule.assertion.to_steps(&page.url, target),
        expected_result: rule.expected_result.clone(),
        ..new_case(run_id, page, rule.id.clone())
    }
}

fn ai_case(run_id: &str, page: &DiscoveredPage, proposed: ProposedCase) -> Option<TestCase> {
    let slug = slugify(&proposed.title);
    if slug.is_empty() || proposed.steps.is_empty() {
        return None;
    }
    let base = Url::parse(&page.url).ok()?;

    let mut steps: Vec<BrowserAction> = proposed
        .steps
        .into_iter()
        .filter_map(|step| match step {
            BrowserAction::Navigate { url } => {
                let resolved = base.join(&url).ok()?;
                (resolved.origin() == base.origin()).then(|| BrowserAction::Navigate {
                    url: resolved.to_string(),
                })
            }
            other => Some(other),
        })
        .collect();
    if !matches!(steps.first(), Some(BrowserAction::Navigate { .. })) {
        steps.insert(
            0,
            BrowserAction::Navigate {
                url: page.url.clone(),
            },
        );
    }

    Some(TestCase {
        title: proposed.title.trim().to_string(),
        category: proposed.category.unwrap_or(TestCategory::General),
        priority: proposed.priority.unwrap_or(Priority::Low),
        source: CaseSource::Ai,
        steps,
        expected_result: proposed.expected_result,
        ..new_case(run_id, page, format!("ai:{}", slug))
    })
}

fn describe_page(page: &DiscoveredPage) -> String {
    let controls: Vec<Value> = page
        .controls
        .iter()
        .filter(|c| c.kind != qaflow_common::ControlKind::Link)
        .take(MAX_PROMPT_CONTROLS)
        .map(|c| json!({"kind": c.kind, "selector": c.selector, "label": c.label, "required": c.required}))
        .collect();
    let features: Vec<&str> = page.features.iter().map(|f| f.as_str()).collect();
    format!(
        "Page: {}\nURL: {}\nKind: {}\nFeatures: {}\nControls: {}\n\n\
         Propose up to 5 additional test cases for this page that a rule-based generator would miss.",
        page.name(),
        page.url,
        page.page_kind.as_str(),
        features.join(", "),
        Value::Array(controls)
    )
}

fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    slug.trim_end_matches('-').chars().take(60).collect()
}
