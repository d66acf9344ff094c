//! Diagnostic extraction from toolchain stderr.
//!
//! Works on text only; nothing here decides the status of an execution.

use crate::config::types::{Diagnostic, DiagnosticCategory, ErrorKind, Language};
use regex::Regex;
use std::sync::OnceLock;

const MAX_SUMMARY_CHARS: usize = 300;

fn exception_name() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([A-Za-z_$][\w$.]*(?:Error|Exception|Denied))(?::|\s*$)")
            .expect("valid regex")
    })
}

/// Line number in `source_name` that the toolchain pointed at.
///
/// Python tracebacks list the innermost frame last; every other toolchain
/// here reports the relevant location first.
pub fn source_line(stderr: &str, source_name: &str, language: Language) -> Option<u32> {
    let pattern = format!(r#"{}(?:", line |:)(\d+)"#, regex::escape(source_name));
    let re = Regex::new(&pattern).ok()?;
    let mut lines = re
        .captures_iter(stderr)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok());

    match language {
        Language::Python => lines.last(),
        _ => lines.next(),
    }
}

fn clip(line: &str) -> String {
    let line = line.trim();
    match line.char_indices().nth(MAX_SUMMARY_CHARS) {
        Some((at, _)) => format!("{}...", &line[..at]),
        None => line.to_string(),
    }
}

fn exception_line(stderr: &str, language: Language) -> Option<&str> {
    let mut candidates = stderr
        .lines()
        .filter(|line| !line.starts_with(' ') && !line.starts_with('\t'))
        .filter(|line| exception_name().is_match(line));

    match language {
        Language::Python => candidates.last(),
        _ => candidates.next(),
    }
}

/// One-line summary: the first compiler error, else the exception line,
/// else the last non-empty line.
pub fn summary_line(stderr: &str, language: Language) -> Option<String> {
    if matches!(language, Language::Java | Language::Cpp) {
        if let Some(line) = stderr.lines().find(|line| line.contains("error:")) {
            return Some(clip(line));
        }
    }
    if let Some(line) = exception_line(stderr, language) {
        return Some(clip(line));
    }
    stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(clip)
}

fn category_for_runtime(
    stderr: &str,
    summary: &str,
    denial_signature: Option<&str>,
) -> DiagnosticCategory {
    if let Some(signature) = denial_signature {
        if stderr.contains(signature) {
            return DiagnosticCategory::CapabilityDenied;
        }
    }

    let name = exception_name()
        .captures(summary)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or_default();
    let short = name.rsplit('.').next().unwrap_or(name);

    match short {
        "ImportError" | "ModuleNotFoundError" | "ClassNotFoundException"
        | "NoClassDefFoundError" => DiagnosticCategory::Import,
        "TypeError" | "ClassCastException" => DiagnosticCategory::Type,
        "" if summary.contains("Cannot find module") => DiagnosticCategory::Import,
        "" => DiagnosticCategory::Other,
        _ if summary.contains("Cannot find module") => DiagnosticCategory::Import,
        _ => DiagnosticCategory::Runtime,
    }
}

/// Build the diagnostic for a failed execution, or `None` when the failure
/// kind carries nothing from the user's code.
pub fn extract(
    kind: ErrorKind,
    stderr: &str,
    source_name: &str,
    language: Language,
    denial_signature: Option<&str>,
    fallback: &str,
) -> Option<Diagnostic> {
    let category = match kind {
        ErrorKind::CompileError => DiagnosticCategory::Compile,
        ErrorKind::SyntaxError => DiagnosticCategory::Syntax,
        ErrorKind::ResourceLimitExceeded => DiagnosticCategory::Resource,
        ErrorKind::RuntimeError => DiagnosticCategory::Runtime,
        _ => return None,
    };

    let summary = summary_line(stderr, language).unwrap_or_else(|| fallback.to_string());
    let category = if category == DiagnosticCategory::Runtime {
        category_for_runtime(stderr, &summary, denial_signature)
    } else {
        category
    };

    Some(Diagnostic {
        category,
        line: source_line(stderr, source_name, language),
        summary,
    })
}
