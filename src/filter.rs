use serde::{Deserialize, Serialize};

use crate::trace::{TraceEvent, TraceLevel};

/// Template version emitted by this build. Older persisted sources are
/// fixed up against the current template during canonicalization.
pub const FILTER_TEMPLATE_VERSION: u32 = 2;

/// Marker line replaced by the dynamic parts when a source is compiled.
const DYNAMIC_MARKER: &str = "# {dynamic}";

fn template_lines() -> Vec<String> {
    vec![
        "# Event filter: one predicate per line, all predicates must match.".to_string(),
        "# Fields: provider, name, level, pid. Operators: ==, !=, contains, <=, >=.".to_string(),
        DYNAMIC_MARKER.to_string(),
    ]
}

/// Filter source as persisted and exchanged with the manager.
///
/// The fixed source lines come from the template; the dynamic parts are the
/// user-authored predicates spliced in at the marker line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FilterSource {
    pub template_version: u32,

    #[serde(default)]
    pub source_lines: Vec<String>,

    #[serde(default)]
    pub dynamic_parts: Vec<String>,
}

impl Default for FilterSource {
    fn default() -> Self {
        Self::empty()
    }
}

impl FilterSource {
    /// The empty filter: current template, no predicates, matches all events.
    pub fn empty() -> Self {
        Self {
            template_version: FILTER_TEMPLATE_VERSION,
            source_lines: template_lines(),
            dynamic_parts: Vec::new(),
        }
    }

    /// Rebuilds the fixed lines from the current template when the persisted
    /// source predates it, keeping the dynamic parts.
    pub fn canonicalize(&mut self) {
        if self.template_version != FILTER_TEMPLATE_VERSION || self.source_lines.is_empty() {
            self.template_version = FILTER_TEMPLATE_VERSION;
            self.source_lines = template_lines();
        }
    }

    /// Template lines with the marker replaced by the dynamic parts. Line
    /// numbers in diagnostics refer to this expansion.
    fn effective_lines(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.source_lines.len() + self.dynamic_parts.len());
        for line in &self.source_lines {
            if line.trim() == DYNAMIC_MARKER {
                out.extend(self.dynamic_parts.iter().cloned());
            } else {
                out.push(line.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// Compiler diagnostic with a source position, reported back verbatim by
/// the TestFilter command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    pub severity: Severity,
    pub line: u32,
    pub character: u32,
}

impl Diagnostic {
    fn error(code: &str, message: String, line: u32, character: u32) -> Self {
        Self {
            code: code.to_string(),
            message,
            severity: Severity::Error,
            line,
            character,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Provider,
    Name,
    Level,
    Pid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Contains,
    Le,
    Ge,
}

#[derive(Debug, Clone)]
enum Predicate {
    Text { field: Field, op: Op, value: String },
    Number { field: Field, op: Op, value: u64 },
}

impl Predicate {
    fn matches(&self, event: &TraceEvent) -> bool {
        match self {
            Self::Text { field, op, value } => {
                let actual = match field {
                    Field::Provider => event.provider.as_str(),
                    Field::Name => event.name.as_str(),
                    _ => return false,
                };
                match op {
                    Op::Eq => actual.eq_ignore_ascii_case(value),
                    Op::Ne => !actual.eq_ignore_ascii_case(value),
                    Op::Contains => actual.to_lowercase().contains(&value.to_lowercase()),
                    _ => false,
                }
            }
            Self::Number { field, op, value } => {
                let actual = match field {
                    Field::Level => event.level as u64,
                    Field::Pid => u64::from(event.pid),
                    _ => return false,
                };
                match op {
                    Op::Eq => actual == *value,
                    Op::Ne => actual != *value,
                    Op::Le => actual <= *value,
                    Op::Ge => actual >= *value,
                    Op::Contains => false,
                }
            }
        }
    }
}

/// Conjunction of line predicates; an empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct CompiledFilter {
    predicates: Vec<Predicate>,
}

impl CompiledFilter {
    pub fn matches(&self, event: &TraceEvent) -> bool {
        self.predicates.iter().all(|p| p.matches(event))
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }
}

/// Compiles a filter source. Returns the compiled filter only when there
/// are no error diagnostics.
pub fn compile(source: &FilterSource) -> (Option<CompiledFilter>, Vec<Diagnostic>) {
    let mut predicates = Vec::new();
    let mut diagnostics = Vec::new();

    for (index, raw) in source.effective_lines().iter().enumerate() {
        let line_no = index as u32;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_line(line, line_no, raw) {
            Ok(predicate) => predicates.push(predicate),
            Err(diagnostic) => diagnostics.push(diagnostic),
        }
    }

    if diagnostics.iter().any(|d| d.severity == Severity::Error) {
        (None, diagnostics)
    } else {
        (Some(CompiledFilter { predicates }), diagnostics)
    }
}

fn parse_line(line: &str, line_no: u32, raw: &str) -> Result<Predicate, Diagnostic> {
    let mut parts = line.split_whitespace();
    let field_token = parts.next().unwrap_or("");
    let op_token = parts.next().unwrap_or("");
    let value_owned = parts.collect::<Vec<_>>().join(" ");
    let value_token = value_owned.as_str();

    let field = match field_token.to_lowercase().as_str() {
        "provider" => Field::Provider,
        "name" => Field::Name,
        "level" => Field::Level,
        "pid" => Field::Pid,
        other => {
            return Err(Diagnostic::error(
                "TR1001",
                format!("unknown field {other:?}"),
                line_no,
                column_of(raw, field_token),
            ))
        }
    };

    let op = match op_token {
        "==" => Op::Eq,
        "!=" => Op::Ne,
        "contains" => Op::Contains,
        "<=" => Op::Le,
        ">=" => Op::Ge,
        other => {
            return Err(Diagnostic::error(
                "TR1002",
                format!("unknown operator {other:?}"),
                line_no,
                column_of(raw, op_token),
            ))
        }
    };

    if value_token.is_empty() {
        return Err(Diagnostic::error(
            "TR1003",
            "missing comparison value".to_string(),
            line_no,
            raw.len() as u32,
        ));
    }

    match field {
        Field::Provider | Field::Name => {
            if matches!(op, Op::Le | Op::Ge) {
                return Err(Diagnostic::error(
                    "TR1004",
                    format!("operator {op_token:?} is not valid for text fields"),
                    line_no,
                    column_of(raw, op_token),
                ));
            }
            Ok(Predicate::Text {
                field,
                op,
                value: value_token.trim_matches('"').to_string(),
            })
        }
        Field::Level => {
            if op == Op::Contains {
                return Err(Diagnostic::error(
                    "TR1004",
                    "operator \"contains\" is not valid for level".to_string(),
                    line_no,
                    column_of(raw, op_token),
                ));
            }
            let value = parse_level(value_token).ok_or_else(|| {
                Diagnostic::error(
                    "TR1005",
                    format!("unknown level {value_token:?}"),
                    line_no,
                    column_of(raw, value_token),
                )
            })?;
            Ok(Predicate::Number { field, op, value })
        }
        Field::Pid => {
            if op == Op::Contains {
                return Err(Diagnostic::error(
                    "TR1004",
                    "operator \"contains\" is not valid for pid".to_string(),
                    line_no,
                    column_of(raw, op_token),
                ));
            }
            let value = value_token.parse::<u64>().map_err(|_| {
                Diagnostic::error(
                    "TR1006",
                    format!("invalid pid {value_token:?}"),
                    line_no,
                    column_of(raw, value_token),
                )
            })?;
            Ok(Predicate::Number { field, op, value })
        }
    }
}

fn parse_level(token: &str) -> Option<u64> {
    if let Ok(n) = token.parse::<u8>() {
        return TraceLevel::from_u8(n).map(|l| l as u64);
    }
    let level = match token.to_lowercase().as_str() {
        "critical" => TraceLevel::Critical,
        "error" => TraceLevel::Error,
        "warning" => TraceLevel::Warning,
        "info" | "informational" => TraceLevel::Info,
        "verbose" => TraceLevel::Verbose,
        _ => return None,
    };
    Some(level as u64)
}

fn column_of(raw: &str, token: &str) -> u32 {
    raw.find(token).unwrap_or(0) as u32
}
