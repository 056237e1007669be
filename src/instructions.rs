//! The brief handed to the agent with the first command of a session.

use std::fmt::Write;
use std::path::Path;

use crate::staging::FileCensus;

const API_DOCS_HEADER: &str = "=== BACKEND API DOCUMENTATION ===";
const API_DOCS_FOOTER: &str = "=== END OF API DOCUMENTATION ===";

/// What the agent needs to know about the session it is working on
#[derive(Debug, Clone, Default)]
pub struct Brief<'a> {
    pub description: &'a str,
    pub instructions: Option<&'a str>,
    pub additional_instructions: Option<&'a str>,
    pub target_area: Option<&'a str>,
    pub source_dir: &'a str,
    /// Present for sessions started from an uploaded archive
    pub census: Option<FileCensus>,
    /// Contents of the backend's `docs/API.md`
    pub api_docs: Option<String>,
}

/// Read `<backend>/docs/API.md` if it exists
pub async fn load_api_docs(backend_path: Option<&Path>) -> Option<String> {
    let path = backend_path?.join("docs").join("API.md");
    tokio::fs::read_to_string(path).await.ok()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn build(brief: &Brief<'_>) -> String {
    let mut out = String::new();
    let target = non_empty(brief.target_area);

    match &brief.census {
        Some(_) => out.push_str(
            "You are transforming uploaded source code into production-ready code in this repository.\n\n",
        ),
        None => out.push_str("You are working on a development task in this repository.\n\n"),
    }

    out.push_str("PROJECT CONTEXT:\n");
    let _ = writeln!(out, "- Task: {}", brief.description);
    if let Some(census) = &brief.census {
        let _ = writeln!(
            out,
            "- Uploaded source: {} files, {} TypeScript, {} JavaScript, {} stylesheets",
            census.total_files, census.typescript_files, census.javascript_files, census.style_files
        );
    }
    if let Some(target) = target {
        let _ = writeln!(out, "- Target area: {}", target);
        let _ = writeln!(out, "- Working directory: {}/{}/", brief.source_dir, target);
    }
    out.push('\n');

    match &brief.api_docs {
        Some(docs) => {
            let _ = write!(out, "{}\n\n{}\n\n{}\n\n", API_DOCS_HEADER, docs.trim_end(), API_DOCS_FOOTER);
        }
        None => out.push_str(
            "BACKEND API:\n- No API documentation was found. Do not invent endpoints; reuse the calls already present in the codebase.\n\n",
        ),
    }

    out.push_str("REQUIREMENTS:\n");
    let requirements = [
        "Follow the existing architecture and conventions of the repository",
        "Use TypeScript with proper type safety",
        "ONLY use backend API endpoints documented above",
        "Implement proper error handling",
        "Add loading states for async operations",
        "Reuse shared components when possible",
    ];
    for (i, requirement) in requirements.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, requirement);
    }
    out.push('\n');

    if let Some(target) = target {
        let _ = write!(
            out,
            "IMPORTANT: You are working in {}/{}/ - make all changes within this directory.\n\n",
            brief.source_dir, target
        );
    }

    let user_task = non_empty(brief.instructions);
    let additional = non_empty(brief.additional_instructions);
    if user_task.is_some() || additional.is_some() {
        out.push_str("USER TASK:\n");
        if let Some(task) = user_task {
            let _ = write!(out, "{}\n\n", task);
        }
        if let Some(extra) = additional {
            let _ = write!(out, "ADDITIONAL INSTRUCTIONS:\n{}\n\n", extra);
        }
    }

    if brief.census.is_some() {
        out.push_str("Get started by analyzing the source code and creating a plan for the transformation.");
    } else {
        out.push_str("Please analyze the task and start implementing the solution.");
    }
    out
}
