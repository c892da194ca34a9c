use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::models::{PortStatus, TestResult, TestStatus};

/// Render the result sequence as a human-readable text report.
///
/// Skipped rows are listed in their own section and take part in no
/// pass/fail count.
pub fn format_text_report(results: &[TestResult]) -> String {
    let mut output = String::new();

    output.push_str("\n--- Firewall Rule Test Report ---\n");
    output.push_str(&format!("Generated: {}\n", Utc::now().format("%Y-%m-%d %H:%M:%S UTC")));
    output.push_str(&format!("Total test cases run: {}\n", results.len()));

    let passed = results
        .iter()
        .filter(|r| r.status == Some(TestStatus::Pass))
        .count();
    let failed: Vec<&TestResult> = results
        .iter()
        .filter(|r| r.status == Some(TestStatus::Fail))
        .collect();
    let skipped: Vec<&TestResult> = results
        .iter()
        .filter(|r| r.actual_result == PortStatus::Skipped)
        .collect();

    output.push_str(&format!("Passed: {}\n", passed));
    output.push_str(&format!("Failed: {}\n", failed.len()));
    output.push_str(&format!("Skipped: {}\n", skipped.len()));

    if !failed.is_empty() {
        output.push_str("\n[!!!] Failed Test Cases:\n");
        for test in &failed {
            output.push_str(&format!("  - Name: {}\n", test.name));
            output.push_str(&format!(
                "    Target: {}:{}/{}\n",
                test.dest_ip, test.dest_port, test.protocol
            ));
            output.push_str(&format!("    Expected: {}\n", test.expected_result));
            output.push_str(&format!("    Actual: {}\n", test.actual_result));
            output.push_str("    Recommendation: Review firewall rules for this traffic.\n");
        }
    }

    if !skipped.is_empty() {
        output.push_str("\n[---] Skipped Test Cases:\n");
        for test in &skipped {
            output.push_str(&format!("  - Name: {}\n", test.name));
            output.push_str(&format!(
                "    Reason: Unsupported protocol '{}'.\n",
                test.protocol
            ));
        }
    }

    output.push_str("\n--- End of Report ---\n");
    output
}

/// Render the result sequence as pretty-printed JSON.
pub fn format_json_report(results: &[TestResult]) -> Result<String> {
    serde_json::to_string_pretty(results).context("Failed to serialize results to JSON")
}

/// Save a rendered report to a file.
pub fn save_report(report: &str, output_path: &Path) -> Result<()> {
    let mut file = File::create(output_path)
        .with_context(|| format!("Failed to create output file: {:?}", output_path))?;

    file.write_all(report.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", output_path))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(
        name: &str,
        protocol: &str,
        expected: &str,
        actual: PortStatus,
        status: Option<TestStatus>,
    ) -> TestResult {
        TestResult {
            name: name.to_string(),
            dest_ip: "192.0.2.10".to_string(),
            dest_port: 443,
            protocol: protocol.to_string(),
            expected_result: expected.to_string(),
            actual_result: actual,
            status,
        }
    }

    #[test]
    fn text_report_counts_each_bucket_once() {
        let results = vec![
            result("ok", "tcp", "open", PortStatus::Open, Some(TestStatus::Pass)),
            result(
                "broken",
                "tcp",
                "open",
                PortStatus::Filtered,
                Some(TestStatus::Fail),
            ),
            result("odd", "icmp", "open", PortStatus::Skipped, None),
        ];
        let report = format_text_report(&results);
        assert!(report.contains("Total test cases run: 3"));
        assert!(report.contains("Passed: 1"));
        assert!(report.contains("Failed: 1"));
        assert!(report.contains("Skipped: 1"));
    }

    #[test]
    fn failed_cases_get_a_detail_block() {
        let results = vec![result(
            "broken",
            "tcp",
            "open",
            PortStatus::Filtered,
            Some(TestStatus::Fail),
        )];
        let report = format_text_report(&results);
        assert!(report.contains("[!!!] Failed Test Cases:"));
        assert!(report.contains("Name: broken"));
        assert!(report.contains("Target: 192.0.2.10:443/tcp"));
        assert!(report.contains("Expected: open"));
        assert!(report.contains("Actual: filtered"));
    }

    #[test]
    fn skipped_cases_get_their_own_section() {
        let results = vec![result("odd", "icmp", "open", PortStatus::Skipped, None)];
        let report = format_text_report(&results);
        assert!(report.contains("[---] Skipped Test Cases:"));
        assert!(report.contains("Unsupported protocol 'icmp'"));
        assert!(!report.contains("[!!!]"));
    }

    #[test]
    fn json_report_keeps_exact_state_tokens() {
        let results = vec![result(
            "dns",
            "udp",
            "open",
            PortStatus::OpenFiltered,
            Some(TestStatus::Pass),
        )];
        let json = format_json_report(&results).unwrap();
        assert!(json.contains("\"actual_result\": \"open|filtered\""));
        assert!(json.contains("\"status\": \"PASS\""));
    }

    #[test]
    fn report_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        save_report("report body", &path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "report body");
    }
}
