//! Heuristic checks of the agent's output: type-check, allowed backend
//! endpoints, tests and build.

use regex::Regex;
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{
    config::ValidationConfig,
    logs::{LogBroadcaster, LogLevel},
    process::{CommandSpec, ProcessRunner},
};

const API_CALL_PATTERN: &str = r#"(?:fetch|axios\.(?:get|post|put|delete))\s*\(['"]([^'"]+)['"]"#;
const SOURCE_EXTENSIONS: [&str; 4] = ["ts", "tsx", "js", "jsx"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub typecheck_passed: bool,
    pub api_usage_passed: bool,
    pub tests_passed: bool,
    pub build_passed: bool,
    pub passed: bool,
    /// `file: url` for every call to an endpoint outside the allow-list
    pub endpoint_violations: Vec<String>,
}

pub struct Validator {
    config: ValidationConfig,
    logs: LogBroadcaster,
}

impl Validator {
    pub fn new(config: ValidationConfig, logs: LogBroadcaster) -> Self {
        Self { config, logs }
    }

    fn log(&self, session_id: &str, message: impl Into<String>) {
        self.logs.send(session_id, LogLevel::Validation, message);
    }

    /// Run all four checks in `project_dir`. The report passes only if all do.
    pub async fn validate(&self, session_id: &str, project_dir: &Path) -> ValidationReport {
        self.log(session_id, "Starting validation...");

        let typecheck_passed = self.typecheck(session_id, project_dir).await;
        let (api_usage_passed, endpoint_violations) = self.check_api_usage(session_id, project_dir);
        let tests_passed = self.run_tests(session_id, project_dir).await;
        let build_passed = self.build(session_id, project_dir).await;

        let passed = typecheck_passed && api_usage_passed && tests_passed && build_passed;
        if passed {
            self.log(session_id, "✓ All validation checks passed");
        } else {
            self.log(session_id, "✗ Some validation checks failed");
        }
        info!(
            session_id = %session_id,
            typecheck_passed,
            api_usage_passed,
            tests_passed,
            build_passed,
            "Validation finished"
        );

        ValidationReport {
            typecheck_passed,
            api_usage_passed,
            tests_passed,
            build_passed,
            passed,
            endpoint_violations,
        }
    }

    /// Run a configured command. `None` if it could not be launched.
    async fn run_command(
        &self,
        session_id: &str,
        command: &[String],
        project_dir: &Path,
        echo: impl Fn(&str) -> bool,
    ) -> Option<bool> {
        let (program, args) = command.split_first()?;
        let spec = CommandSpec::new(program, project_dir).args(args.iter().cloned());
        let result = ProcessRunner::output(&spec, |line| {
            if echo(line) {
                self.log(session_id, line);
            }
        })
        .await;

        match result {
            Ok(outcome) => {
                if !outcome.success() && !outcome.output.is_empty() {
                    self.logs.error(session_id, outcome.output.trim_end());
                }
                Some(outcome.success())
            }
            Err(e) => {
                warn!(session_id = %session_id, command = %spec, error = %e, "Validation command failed to start");
                self.logs
                    .error(session_id, format!("{} could not be started: {}", spec, e));
                None
            }
        }
    }

    async fn typecheck(&self, session_id: &str, project_dir: &Path) -> bool {
        self.log(session_id, "Checking TypeScript compilation...");
        let passed = self
            .run_command(session_id, &self.config.typecheck_command, project_dir, |_| false)
            .await
            .unwrap_or(false);
        self.report(session_id, passed, "TypeScript compilation");
        passed
    }

    fn check_api_usage(&self, session_id: &str, project_dir: &Path) -> (bool, Vec<String>) {
        self.log(session_id, "Checking API compatibility...");
        let source = project_dir.join(&self.config.source_dir);
        if !source.exists() {
            self.log(session_id, "⚠ Frontend source not found, skipping API check");
            return (true, Vec::new());
        }

        let violations = match scan_endpoints(&source, &self.config.allowed_endpoints) {
            Ok(violations) => violations,
            Err(e) => {
                self.logs
                    .error(session_id, format!("API compatibility check error: {}", e));
                return (true, Vec::new());
            }
        };
        for violation in &violations {
            self.logs.error(session_id, format!("  - {}", violation));
        }
        let passed = violations.is_empty();
        self.report(session_id, passed, "API compatibility check");
        (passed, violations)
    }

    async fn run_tests(&self, session_id: &str, project_dir: &Path) -> bool {
        self.log(session_id, "Running tests...");
        if !has_test_files(&project_dir.join(&self.config.source_dir)) {
            self.log(session_id, "⚠ No tests found, skipping");
            return true;
        }
        let passed = self
            .run_command(session_id, &self.config.test_command, project_dir, |_| true)
            .await
            .unwrap_or(true);
        self.report(session_id, passed, "Tests");
        passed
    }

    async fn build(&self, session_id: &str, project_dir: &Path) -> bool {
        self.log(session_id, "Running build...");
        let passed = self
            .run_command(session_id, &self.config.build_command, project_dir, |line| {
                line.contains("error")
                    || line.contains("Error")
                    || line.contains('✓')
                    || line.contains("built")
            })
            .await
            .unwrap_or(false);
        self.report(session_id, passed, "Build");
        passed
    }

    fn report(&self, session_id: &str, passed: bool, check: &str) {
        if passed {
            self.log(session_id, format!("✓ {} passed", check));
        } else {
            self.logs.error(session_id, format!("✗ {} failed", check));
        }
    }
}

/// Strip scheme, host, query string and numeric path segments
fn normalize_endpoint(url: &str) -> String {
    let without_host = match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            rest.find('/').map(|slash| &rest[slash..]).unwrap_or("")
        }
        None => url,
    };
    let path = without_host.split('?').next().unwrap_or("");
    path.split('/')
        .filter(|segment| segment.is_empty() || !segment.chars().all(|c| c.is_ascii_digit()))
        .collect::<Vec<_>>()
        .join("/")
}

/// Every backend call in `source` whose endpoint is not on the allow-list
pub fn scan_endpoints(source: &Path, allowed: &[String]) -> anyhow::Result<Vec<String>> {
    let pattern = Regex::new(API_CALL_PATTERN)?;
    let mut violations = Vec::new();

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        let is_source = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e));
        if !entry.file_type().is_file() || !is_source {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };

        for captures in pattern.captures_iter(&content) {
            let url = &captures[1];
            if !url.starts_with("/api/") && !url.contains("localhost:8080") {
                continue;
            }
            let endpoint = normalize_endpoint(url);
            if !allowed.iter().any(|a| endpoint.starts_with(a.as_str())) {
                violations.push(format!("{}: {}", entry.file_name().to_string_lossy(), url));
            }
        }
    }
    Ok(violations)
}

fn has_test_files(source: &Path) -> bool {
    WalkDir::new(source).into_iter().filter_map(|e| e.ok()).any(|entry| {
        let name = entry.file_name().to_string_lossy();
        name.contains(".spec.") || name.contains(".test.")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn allowed() -> Vec<String> {
        ValidationConfig {
            typecheck_command: vec![],
            test_command: vec![],
            build_command: vec![],
            source_dir: "apps".into(),
            allowed_endpoints: vec![
                "/api/auth/login".into(),
                "/api/accounts".into(),
                "/api/invoices".into(),
            ],
        }
        .allowed_endpoints
    }

    #[test]
    fn normalizes_endpoints() {
        assert_eq!(normalize_endpoint("/api/invoices/42?x=1"), "/api/invoices");
        assert_eq!(
            normalize_endpoint("http://localhost:8080/api/accounts/7/lines"),
            "/api/accounts/lines"
        );
    }

    #[test]
    fn flags_calls_outside_allow_list() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("invoicing/src");
        fs::create_dir_all(&app).unwrap();
        fs::write(
            app.join("api.ts"),
            r#"
            fetch('/api/invoices/12');
            axios.post("/api/accounts", body);
            axios.get('/api/secret-admin');
            fetch("https://cdn.example.com/logo.svg");
            "#,
        )
        .unwrap();
        fs::write(app.join("notes.md"), "fetch('/api/nope')").unwrap();

        let violations = scan_endpoints(dir.path(), &allowed()).unwrap();
        assert_eq!(violations, vec!["api.ts: /api/secret-admin".to_string()]);
    }

    #[test]
    fn detects_test_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_test_files(dir.path()));
        fs::write(dir.path().join("List.spec.tsx"), "").unwrap();
        assert!(has_test_files(dir.path()));
    }

    #[tokio::test]
    async fn missing_tools_fail_typecheck_and_build_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("apps/x")).unwrap();
        fs::write(dir.path().join("apps/x/a.test.ts"), "").unwrap();
        let missing = vec!["definitely-not-a-real-binary-xyz".to_string()];
        let validator = Validator::new(
            ValidationConfig {
                typecheck_command: missing.clone(),
                test_command: missing.clone(),
                build_command: missing,
                source_dir: "apps".into(),
                allowed_endpoints: allowed(),
            },
            LogBroadcaster::new(),
        );

        let report = validator.validate("s1", dir.path()).await;
        assert!(!report.typecheck_passed);
        assert!(report.api_usage_passed);
        assert!(report.tests_passed);
        assert!(!report.build_passed);
        assert!(!report.passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn passing_commands_pass() {
        let dir = tempfile::tempdir().unwrap();
        let ok = vec!["true".to_string()];
        let validator = Validator::new(
            ValidationConfig {
                typecheck_command: ok.clone(),
                test_command: ok.clone(),
                build_command: ok,
                source_dir: "apps".into(),
                allowed_endpoints: allowed(),
            },
            LogBroadcaster::new(),
        );
        let report = validator.validate("s1", dir.path()).await;
        assert!(report.passed);
    }
}
