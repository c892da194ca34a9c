//! YAML test-case loading.
//!
//! Records are deserialized one by one so a single malformed entry costs
//! only itself: it is logged with its position and dropped, and the rest of
//! the file still loads. A file that is unreadable, not YAML, or not a list
//! is a fatal input error for the caller to handle.

use std::fs;
use std::path::Path;

use log::{error, info};
use thiserror::Error;

use crate::models::TestCase;

/// Error types for test-case file loading
#[derive(Error, Debug)]
pub enum CaseFileError {
    #[error("Failed to read test case file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Test case file must contain a list of test cases")]
    NotASequence,
}

/// Load test cases from a YAML file, in declaration order.
pub fn load_test_cases(path: &Path) -> Result<Vec<TestCase>, CaseFileError> {
    let raw = fs::read_to_string(path)?;
    parse_test_cases(&raw)
}

/// Parse a YAML document into validated test cases.
///
/// Returns every record that deserializes and carries non-empty fields;
/// rejected records are logged with their 1-based position.
pub fn parse_test_cases(raw: &str) -> Result<Vec<TestCase>, CaseFileError> {
    let document: serde_yaml::Value = serde_yaml::from_str(raw)?;
    let records = match document {
        serde_yaml::Value::Sequence(records) => records,
        _ => return Err(CaseFileError::NotASequence),
    };

    let total = records.len();
    let mut cases = Vec::with_capacity(total);
    for (index, record) in records.into_iter().enumerate() {
        match serde_yaml::from_value::<TestCase>(record) {
            Ok(case) => match validate(&case) {
                Ok(()) => cases.push(case),
                Err(reason) => {
                    error!("Test case {} ('{}') rejected: {}", index + 1, case.name, reason)
                }
            },
            Err(e) => error!("Test case {} rejected: {}", index + 1, e),
        }
    }

    info!("Loaded {} of {} test cases", cases.len(), total);
    Ok(cases)
}

fn validate(case: &TestCase) -> Result<(), String> {
    let fields = [
        ("name", &case.name),
        ("dest_ip", &case.dest_ip),
        ("protocol", &case.protocol),
        ("expected_result", &case.expected_result),
    ];
    for (field, value) in fields {
        if value.trim().is_empty() {
            return Err(format!("required field '{}' is empty", field));
        }
    }
    Ok(())
}
