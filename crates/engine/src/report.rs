//! Report generation and scenario grouping

use std::collections::BTreeMap;

use qaflow_common::{
    now_millis, Report, ReportTotals, RunContext, Scenario, TestCase, TestCategory, TestStatus,
};

/// `<page> - <family>` grouping key for a case
pub fn scenario_name(page_name: &str, category: TestCategory) -> String {
    format!("{} - {}", page_name, category.scenario_suffix())
}

/// Group cases into scenarios, in order of first appearance
pub fn group_scenarios(cases: &[TestCase]) -> Vec<Scenario> {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut groups: BTreeMap<(String, String), Scenario> = BTreeMap::new();

    for case in cases {
        let name = scenario_name(&case.page_name, case.category);
        let key = (case.page_url.clone(), name.clone());
        let scenario = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            Scenario {
                scenario_name: name,
                page_name: case.page_name.clone(),
                page_url: case.page_url.clone(),
                test_cases: Vec::new(),
                total: 0,
                pending: 0,
                passed: 0,
                failed: 0,
            }
        });
        scenario.total += 1;
        match case.status {
            TestStatus::Pending => scenario.pending += 1,
            TestStatus::Passed => scenario.passed += 1,
            TestStatus::Failed => scenario.failed += 1,
        }
        scenario.test_cases.push(case.clone());
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}

/// Build the final report from a run's context
pub fn generate_report(ctx: &RunContext) -> Report {
    let generated_at = now_millis();
    Report {
        run_id: ctx.run_id.clone(),
        flow_id: ctx.flow_id.clone(),
        base_url: ctx.base_url.clone(),
        environment: ctx.environment.clone(),
        started_at: ctx.created_at,
        generated_at,
        duration_ms: (generated_at - ctx.created_at).max(0) as u64,
        discovery: ctx.summary.clone().unwrap_or_default(),
        totals: ReportTotals::tally(&ctx.test_plan),
        scenarios: group_scenarios(&ctx.test_plan),
        stage_timings_ms: ctx.stage_timings_ms.clone(),
        test_cases: ctx.test_plan.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qaflow_common::{CaseSource, Evidence, Priority};

    fn case(id: &str, page: &str, category: TestCategory, status: TestStatus) -> TestCase {
        TestCase {
            id: id.to_string(),
            title: id.to_string(),
            page_url: format!("https://app.test/{}", page.to_lowercase()),
            page_name: page.to_string(),
            page_signature: page.to_string(),
            template: id.to_string(),
            category,
            priority: Priority::Medium,
            source: CaseSource::Rule,
            steps: vec![],
            expected_result: String::new(),
            status,
            step_results: vec![],
            evidence: Evidence::default(),
            error: None,
            duration_ms: 0,
        }
    }

    #[test]
    fn test_scenario_names() {
        assert_eq!(scenario_name("Orders", TestCategory::Create), "Orders - CRUD Operations");
        assert_eq!(scenario_name("Orders", TestCategory::Search), "Orders - Data Operations");
        assert_eq!(scenario_name("Orders", TestCategory::Navigation), "Orders - Navigation");
        assert_eq!(scenario_name("Orders", TestCategory::FormValidation), "Orders - Form Validation");
        assert_eq!(scenario_name("Orders", TestCategory::General), "Orders - General Tests");
    }

    #[test]
    fn test_grouping_and_counts() {
        let cases = vec![
            case("a", "Orders", TestCategory::Listing, TestStatus::Passed),
            case("b", "Orders", TestCategory::Navigation, TestStatus::Failed),
            case("c", "Orders", TestCategory::Search, TestStatus::Failed),
            case("d", "Users", TestCategory::Sort, TestStatus::Pending),
        ];
        let scenarios = group_scenarios(&cases);
        assert_eq!(scenarios.len(), 3);
        assert_eq!(scenarios[0].scenario_name, "Orders - Data Operations");
        assert_eq!(scenarios[0].total, 2);
        assert_eq!(scenarios[0].passed, 1);
        assert_eq!(scenarios[0].failed, 1);
        assert_eq!(scenarios[1].scenario_name, "Orders - Navigation");
        assert_eq!(scenarios[2].pending, 1);
    }

    #[test]
    fn test_report_totals() {
        let mut ctx = RunContext::new("run-1", "smoke", "https://app.test", "staging");
        ctx.test_plan = vec![
            case("a", "Orders", TestCategory::Listing, TestStatus::Passed),
            case("b", "Orders", TestCategory::Listing, TestStatus::Failed),
        ];
        let report = generate_report(&ctx);
        assert_eq!(report.totals.total, 2);
        assert_eq!(report.totals.passed, 1);
        assert_eq!(report.totals.failed, 1);
        assert_eq!(report.scenarios.len(), 1);
        assert_eq!(report.test_cases.len(), 2);
        assert!(report.generated_at >= report.started_at);
    }
}
