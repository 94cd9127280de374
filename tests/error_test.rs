use std::sync::Arc;

use orgcheck::{OrgCheckError, Result};

fn api(code: &str) -> OrgCheckError {
    OrgCheckError::Api {
        status: 400,
        error_code: code.to_string(),
        message: "bad request".to_string(),
    }
}

#[test]
fn test_error_display() {
    let err = OrgCheckError::UnknownDataset("apex-triggers".to_string());
    assert!(err.to_string().contains("apex-triggers"));

    let err = OrgCheckError::QuotaExceeded {
        operation: "soql_query".to_string(),
        ratio: 0.93,
        threshold: 0.9,
    };
    let text = err.to_string();
    assert!(text.contains("soql_query"));
}

#[test]
fn test_unsupported() {
    let err = OrgCheckError::Unsupported("read_metadata");
    assert!(err.to_string().contains("read_metadata"));
}

#[test]
fn test_result_alias() {
    fn returns_error() -> Result<()> {
        Err(OrgCheckError::Configuration("missing instance url".into()))
    }
    assert!(returns_error().is_err());
}

// ============================================================================
// Error codes and by-pass
// ============================================================================

#[test]
fn error_code_looks_through_wrappers() {
    let wrapped = OrgCheckError::RemoteCallFailed {
        operation: "soql_query",
        context: "standard query on Account".to_string(),
        source: Box::new(api("INVALID_FIELD")),
    };
    assert_eq!(wrapped.error_code(), Some("INVALID_FIELD"));

    let shared = OrgCheckError::DatasetFailed {
        alias: "fields".to_string(),
        source: Arc::new(wrapped),
    };
    assert_eq!(shared.error_code(), Some("INVALID_FIELD"));

    assert_eq!(OrgCheckError::Http("reset".into()).error_code(), None);
}

#[test]
fn bypass_matches_exact_codes_only() {
    let codes = vec!["INVALID_TYPE".to_string(), "NOT_FOUND".to_string()];
    assert!(api("INVALID_TYPE").is_bypassed_by(&codes));
    assert!(!api("INVALID_TYPE_X").is_bypassed_by(&codes));
    assert!(!api("INVALID_FIELD").is_bypassed_by(&codes));
    assert!(!api("INVALID_TYPE").is_bypassed_by(&[]));
    assert!(!OrgCheckError::Http("timeout".into()).is_bypassed_by(&codes));
}

#[test]
fn quota_exceeded_is_detected_through_wrappers() {
    let trip = OrgCheckError::QuotaExceeded {
        operation: "composite".to_string(),
        ratio: 0.95,
        threshold: 0.9,
    };
    assert!(trip.is_quota_exceeded());

    let shared = OrgCheckError::DatasetFailed {
        alias: "users".to_string(),
        source: Arc::new(trip),
    };
    assert!(shared.is_quota_exceeded());
    assert!(!api("INVALID_TYPE").is_quota_exceeded());
}

#[test]
fn source_chain_is_exposed() {
    use std::error::Error;

    let err = OrgCheckError::RemoteCallFailed {
        operation: "read_metadata_at_scale",
        context: "type Flow".to_string(),
        source: Box::new(api("NOT_FOUND")),
    };
    let source = err.source().expect("wrapped error should expose its source");
    assert!(source.to_string().contains("bad request"));
}
