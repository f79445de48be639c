//! Static pre-execution validation of submitted source.
//!
//! This is a coarse lexical filter, not an AST-level defense: the sandbox
//! itself (no network, read-only root, unprivileged user, hard resource
//! ceilings) is what actually contains hostile code. The validator exists
//! to refuse the obvious cases cheaply, before a container is ever
//! spawned, and to give learners an actionable message instead of a
//! confusing runtime crash.

use lazy_static::lazy_static;
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};

use crate::types::Language;

/// Construct patterns refused outright, with the message reported for
/// each. Word boundaries keep identifiers like `evaluate` or
/// `literal_eval` from tripping the `eval` rule.
const DENYLIST: &[(&str, &str)] = &[
    (r"\beval\s*\(", "disallowed call to eval()"),
    (r"\bexec\s*\(", "disallowed call to exec()"),
    (r"\bcompile\s*\(", "disallowed call to compile()"),
    (r"__import__", "disallowed use of __import__"),
    (r"\bbreakpoint\s*\(", "disallowed call to breakpoint()"),
    (r"\bglobals\s*\(", "disallowed namespace introspection via globals()"),
    (r"\blocals\s*\(", "disallowed namespace introspection via locals()"),
    (r"\bvars\s*\(", "disallowed namespace introspection via vars()"),
    (r"\bopen\s*\(", "disallowed call to open()"),
    (r"__builtins__", "disallowed access to __builtins__"),
    (r"__subclasses__", "disallowed access to __subclasses__"),
    (r"__globals__", "disallowed access to __globals__"),
    (r"__bases__", "disallowed access to __bases__"),
    (r"__mro__", "disallowed access to __mro__"),
];

/// Modules learners may import. Pure-computation parts of the standard
/// library only; anything touching the OS, processes, threads, the
/// network or the filesystem is absent and therefore refused.
const ALLOWED_MODULES: &[&str] = &[
    "bisect",
    "cmath",
    "collections",
    "copy",
    "csv",
    "dataclasses",
    "datetime",
    "decimal",
    "enum",
    "fractions",
    "functools",
    "heapq",
    "itertools",
    "json",
    "math",
    "operator",
    "random",
    "re",
    "statistics",
    "string",
    "textwrap",
    "typing",
    "unicodedata",
];

lazy_static! {
    static ref DENYLIST_SET: RegexSet =
        RegexSet::new(DENYLIST.iter().map(|(pattern, _)| *pattern))
            .expect("denylist patterns are valid regexes");
    static ref IMPORT_LINE: Regex =
        Regex::new(r"^\s*import\s+(.+)$").expect("import pattern is a valid regex");
    static ref FROM_IMPORT_LINE: Regex =
        Regex::new(r"^\s*from\s+([A-Za-z_][A-Za-z0-9_\.]*)\s+import\b")
            .expect("from-import pattern is a valid regex");
}

/// Verdict of static validation. `violations` is empty iff `allowed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub allowed: bool,
    pub violations: Vec<String>,
}

impl ValidationResult {
    fn from_violations(violations: Vec<String>) -> Self {
        Self {
            allowed: violations.is_empty(),
            violations,
        }
    }
}

/// Validate submitted source for `language`. Never executes anything.
pub fn validate(language: Language, source: &str) -> ValidationResult {
    match language {
        Language::Python => validate_python(source),
    }
}

fn validate_python(source: &str) -> ValidationResult {
    let mut violations: Vec<String> = Vec::new();

    for raw_line in source.lines() {
        let line = strip_comment(raw_line);

        for index in DENYLIST_SET.matches(line) {
            push_unique(&mut violations, DENYLIST[index].1.to_string());
        }

        // Compound statements can hide an import behind a semicolon
        // (`x = 1; import socket`), so the scan runs per statement.
        for statement in line.split(';') {
            if let Some(captures) = IMPORT_LINE.captures(statement) {
                for segment in captures[1].split(',') {
                    check_module(base_module(segment), &mut violations);
                }
            } else if let Some(captures) = FROM_IMPORT_LINE.captures(statement) {
                check_module(base_module(&captures[1]), &mut violations);
            }
        }
    }

    ValidationResult::from_violations(violations)
}

fn check_module(module: &str, violations: &mut Vec<String>) {
    if module.is_empty() {
        return;
    }
    if !ALLOWED_MODULES.contains(&module) {
        push_unique(
            violations,
            format!("import of module '{module}' is not permitted"),
        );
    }
}

fn push_unique(violations: &mut Vec<String>, message: String) {
    if !violations.contains(&message) {
        violations.push(message);
    }
}

/// `"os.path as p"` -> `"os"`: the allowlist is keyed on top-level
/// modules, and an alias changes nothing about what gets loaded.
fn base_module(segment: &str) -> &str {
    let trimmed = segment.trim();
    let without_alias = trimmed.split_whitespace().next().unwrap_or("");
    without_alias.split('.').next().unwrap_or("")
}

/// Drop a trailing `#` comment, conservatively: if any quote precedes the
/// `#` it may sit inside a string literal, so the whole line is kept and
/// scanned. Flagging a banned token inside a string is an accepted false
/// positive for a pre-filter; hiding one is not.
fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) if !line[..idx].chars().any(|c| c == '"' || c == '\'') => &line[..idx],
        _ => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(source: &str) -> ValidationResult {
        validate(Language::Python, source)
    }

    #[test]
    fn plain_function_is_allowed() {
        let result = check("def add(a, b):\n    return a + b\n\nprint(add(2, 3))\n");
        assert!(result.allowed, "violations: {:?}", result.violations);
        assert!(result.violations.is_empty());
    }

    #[test]
    fn infinite_loop_is_allowed() {
        // Runaway code is the timeout path's job, not the validator's.
        assert!(check("while True:\n    pass\n").allowed);
    }

    #[test]
    fn socket_import_is_rejected() {
        let result = check("import socket\nsocket.create_connection(('x', 80))\n");
        assert!(!result.allowed);
        assert!(result.violations[0].contains("socket"));
    }

    #[test]
    fn subprocess_and_os_imports_are_rejected() {
        let result = check("import subprocess\nimport os\n");
        assert!(!result.allowed);
        assert_eq!(result.violations.len(), 2);
    }

    #[test]
    fn from_import_is_checked_against_the_top_level_module() {
        assert!(!check("from os import path\n").allowed);
        assert!(!check("from os.path import join\n").allowed);
        assert!(check("from collections import Counter\n").allowed);
    }

    #[test]
    fn aliased_and_multi_imports_are_unwrapped() {
        assert!(check("import math as m\n").allowed);
        assert!(check("import math, json\n").allowed);
        let mixed = check("import math, socket\n");
        assert!(!mixed.allowed);
        assert_eq!(mixed.violations.len(), 1);
    }

    #[test]
    fn imports_after_a_semicolon_are_detected() {
        let result = check("x = 1; import socket\n");
        assert!(!result.allowed);
        assert!(result.violations[0].contains("socket"));
        assert!(!check("import math; import socket\n").allowed);
        assert!(!check("y = 2; from os import path\n").allowed);
        assert!(check("import math; import json\n").allowed);
    }

    #[test]
    fn allowlisted_modules_pass() {
        for module in ALLOWED_MODULES {
            let result = check(&format!("import {module}\n"));
            assert!(result.allowed, "{module} should be allowed");
        }
    }

    #[test]
    fn eval_exec_compile_are_rejected() {
        assert!(!check("eval('1 + 1')\n").allowed);
        assert!(!check("exec('x = 1')\n").allowed);
        assert!(!check("compile('x', 'f', 'exec')\n").allowed);
    }

    #[test]
    fn identifiers_containing_eval_are_not_flagged() {
        assert!(check("def evaluate(x):\n    return x\n\nevaluate(2)\n").allowed);
        assert!(check("literal_eval_result = 3\n").allowed);
    }

    #[test]
    fn dunder_escape_hatches_are_rejected() {
        let result = check("().__class__.__bases__[0].__subclasses__()\n");
        assert!(!result.allowed);
        assert!(result
            .violations
            .iter()
            .any(|v| v.contains("__subclasses__")));
    }

    #[test]
    fn import_bypass_and_debugger_are_rejected() {
        assert!(!check("__import__('os')\n").allowed);
        assert!(!check("breakpoint()\n").allowed);
    }

    #[test]
    fn open_is_rejected() {
        assert!(!check("data = open('/etc/passwd').read()\n").allowed);
    }

    #[test]
    fn commented_out_code_is_not_flagged() {
        assert!(check("# import os\nprint(1)\n").allowed);
        assert!(check("x = 1  # eval() would be bad here\n").allowed);
    }

    #[test]
    fn banned_token_after_a_string_is_still_caught() {
        // The '#' sits after a quote, so the line is scanned whole.
        assert!(!check("s = 'a#b'; eval(s)\n").allowed);
    }

    #[test]
    fn repeated_violations_are_reported_once() {
        let result = check("import socket\nimport socket\n");
        assert_eq!(result.violations.len(), 1);
    }

    #[test]
    fn globals_locals_vars_are_rejected() {
        assert!(!check("print(globals())\n").allowed);
        assert!(!check("print(locals())\n").allowed);
        assert!(!check("print(vars())\n").allowed);
    }
}
