//! Command gate. Decides whether a line of shell input may run at all.
//!
//! Validation is a fixed, ordered pipeline of named policy stages. Each
//! stage either lets the command continue to the next stage or ends the
//! pipeline with a verdict; the first terminal verdict wins. Matching is
//! done on a trimmed, lower-cased copy of the input; the caller still runs
//! the original text when the verdict is `Allowed`.
//!
//! This is policy-level string classification, not shell parsing: the
//! stages look at prefixes and substrings only.

use std::ops::ControlFlow;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::plans::{PlanPolicy, PlanTier};

/// Outcome of validating one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Blocked {
        reason: &'static str,
        suggestion: Option<&'static str>,
    },
}

impl Verdict {
    fn blocked(reason: &'static str, suggestion: &'static str) -> Self {
        Verdict::Blocked {
            reason,
            suggestion: Some(suggestion),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }

    /// Renders a blocked verdict as the reason followed by the suggestion
    /// on its own line. Empty for `Allowed`.
    pub fn message(&self) -> String {
        match self {
            Verdict::Allowed => String::new(),
            Verdict::Blocked {
                reason,
                suggestion: Some(suggestion),
            } => format!("{reason}\n{suggestion}"),
            Verdict::Blocked {
                reason,
                suggestion: None,
            } => reason.to_string(),
        }
    }
}

/// A single policy stage: inspects the normalized command under a plan.
type StageFn = fn(&str, &PlanPolicy) -> ControlFlow<Verdict>;

/// Policy stages in precedence order.
pub const POLICY_STAGES: &[(&str, StageFn)] = &[
    ("hard_block", hard_block),
    ("unsafe_flags", unsafe_flags),
    ("plan_gates", plan_gates),
    ("sanctioned_installers", sanctioned_installers),
];

const PYTHON_INSTALL: &str = "uv pip install";
const JAVASCRIPT_INSTALL: &str = "bun add";

static HARD_BLOCK_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"\bnpm\b",
        r"\bnpx\b",
        r"\byarn\b",
        r"\bpnpm\b",
        r"^pip(\s|$)",
        r"\bpython\s+-m\s+pip\b",
        r"\bpip3\b",
        r"\bsudo\b",
        r"rm\s+-rf\s+/",
    ])
});

static UNSAFE_FLAG_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile_all(&[
        r"(^|\s)--global(\s|$)",
        r"(^|\s)-g(\s|$)",
        r"(^|\s)--system(\s|$)",
        r"(^|\s)--break-system-packages(\s|$)",
    ])
});

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(re) => Some(re),
            Err(e) => {
                // Patterns are literals above; this only fires on a bad edit.
                tracing::error!("Invalid policy pattern {p:?}: {e}");
                None
            }
        })
        .collect()
}

/// Validates `command` under the plan identified by `tier`.
pub fn validate(command: &str, tier: PlanTier) -> Verdict {
    let normalized = command.trim().to_lowercase();
    let plan = PlanPolicy::for_tier(tier);

    for (name, stage) in POLICY_STAGES {
        if let ControlFlow::Break(verdict) = stage(&normalized, plan) {
            warn!("Command blocked by {name} stage (plan: {tier})");
            return verdict;
        }
    }
    Verdict::Allowed
}

fn hard_block(command: &str, _plan: &PlanPolicy) -> ControlFlow<Verdict> {
    if HARD_BLOCK_PATTERNS.iter().any(|re| re.is_match(command)) {
        return ControlFlow::Break(Verdict::blocked(
            "Blocked command detected by security policy.",
            "Use bun add (Pro) or uv pip install (Starter+).",
        ));
    }
    ControlFlow::Continue(())
}

fn unsafe_flags(command: &str, _plan: &PlanPolicy) -> ControlFlow<Verdict> {
    if UNSAFE_FLAG_PATTERNS.iter().any(|re| re.is_match(command)) {
        return ControlFlow::Break(Verdict::blocked(
            "Unsafe package install flag blocked.",
            "Install packages only in the project scope without global/system flags.",
        ));
    }
    ControlFlow::Continue(())
}

fn plan_gates(command: &str, plan: &PlanPolicy) -> ControlFlow<Verdict> {
    if command.starts_with(JAVASCRIPT_INSTALL) && !plan.can_install_javascript {
        return ControlFlow::Break(Verdict::blocked(
            "JavaScript package installation is only available on Pro.",
            "Upgrade to Pro to use bun add.",
        ));
    }
    if command.starts_with(PYTHON_INSTALL) && !plan.can_install_python {
        return ControlFlow::Break(Verdict::blocked(
            "Python package installation is only available on Starter and Pro.",
            "Upgrade to Starter or Pro to use uv pip install.",
        ));
    }
    ControlFlow::Continue(())
}

fn sanctioned_installers(command: &str, _plan: &PlanPolicy) -> ControlFlow<Verdict> {
    let program = command.split_whitespace().next().unwrap_or("");
    if program == "uv" && !command.starts_with(PYTHON_INSTALL) {
        return ControlFlow::Break(Verdict::blocked(
            "Only uv pip install is allowed for security reasons.",
            "Use uv pip install <package>.",
        ));
    }
    if program == "bun" && !command.starts_with(JAVASCRIPT_INSTALL) {
        return ControlFlow::Break(Verdict::blocked(
            "Only bun add is allowed for security reasons.",
            "Use bun add <package>.",
        ));
    }
    ControlFlow::Continue(())
}
