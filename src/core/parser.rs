// SerialCollect - core/parser.rs
//
// Multi-strategy line parsing: delimiter split, regex captures, JSON objects
// and the custom expression language.
// Core layer: operates on one already-framed line, never touches I/O.
//
// Everything that can be invalid (regex patterns, skip patterns, the custom
// program) is compiled by `LineParser::new`, so a constructed parser can only
// fail per line, and per-line failures are logged and reported as `None`.

use crate::core::expr::{self, Program};
use crate::core::model::{now_millis, FieldMap, FieldValue, ParsedData, ParserConfig, ParserKind};
use crate::util::constants;
use crate::util::error::ParserError;
use regex::Regex;

/// A configured skip pattern.
#[derive(Debug, Clone)]
enum SkipPattern {
    /// Plain text: the line is skipped when it starts with it.
    Prefix(String),
    /// Written as `/pattern/`: the line is skipped when the regex matches.
    Regex(Regex),
}

impl SkipPattern {
    fn compile(pattern: &str) -> Result<Self, ParserError> {
        if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
            let body = &pattern[1..pattern.len() - 1];
            let regex = compile_regex("skipLines", body)?;
            Ok(SkipPattern::Regex(regex))
        } else {
            Ok(SkipPattern::Prefix(pattern.to_string()))
        }
    }

    fn matches(&self, line: &str) -> bool {
        match self {
            SkipPattern::Prefix(p) => line.starts_with(p.as_str()),
            SkipPattern::Regex(r) => r.is_match(line),
        }
    }
}

fn compile_regex(field: &'static str, pattern: &str) -> Result<Regex, ParserError> {
    if pattern.len() > constants::MAX_REGEX_PATTERN_LENGTH {
        return Err(ParserError::RegexTooLong {
            field,
            length: pattern.len(),
            max_length: constants::MAX_REGEX_PATTERN_LENGTH,
        });
    }
    Regex::new(pattern).map_err(|source| ParserError::InvalidRegex {
        field,
        pattern: pattern.to_string(),
        source,
    })
}

/// The compiled form of one parser strategy.
#[derive(Debug, Clone)]
enum Strategy {
    Split { delimiter: String },
    Regex { regex: Regex, groups: Vec<String> },
    Json,
    Custom { program: Program },
}

/// A compiled line parser. Cheap to clone; the collector swaps in a new one
/// on reconfiguration.
#[derive(Debug, Clone)]
pub struct LineParser {
    strategy: Strategy,
    fields: Vec<String>,
    skip: Vec<SkipPattern>,
}

impl LineParser {
    /// Compile a parser for `config`, mapping values onto `fields`.
    pub fn new(config: &ParserConfig, fields: &[String]) -> Result<Self, ParserError> {
        let skip = config
            .skip_lines
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| SkipPattern::compile(p))
            .collect::<Result<Vec<_>, _>>()?;

        let strategy = match config.kind {
            ParserKind::Split => Strategy::Split {
                delimiter: config
                    .split_delimiter
                    .clone()
                    .filter(|d| !d.is_empty())
                    .unwrap_or_else(|| constants::DEFAULT_SPLIT_DELIMITER.to_string()),
            },
            ParserKind::Regex => {
                let pattern = config
                    .regex
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .ok_or(ParserError::MissingRegex)?;
                let regex = compile_regex("regex", pattern)?;
                let groups = config
                    .regex_groups
                    .clone()
                    .unwrap_or_else(|| fields.to_vec());
                Strategy::Regex { regex, groups }
            }
            ParserKind::Json => Strategy::Json,
            ParserKind::Custom => {
                let source = config
                    .custom_parser
                    .as_deref()
                    .filter(|s| !s.trim().is_empty())
                    .ok_or(ParserError::MissingExpression)?;
                Strategy::Custom {
                    program: expr::compile(source)?,
                }
            }
        };

        tracing::debug!(
            parser = config.kind.label(),
            fields = fields.len(),
            skip_patterns = skip.len(),
            "Line parser configured"
        );

        Ok(Self {
            strategy,
            fields: fields.to_vec(),
            skip,
        })
    }

    /// Recompile in place. On error the current configuration is kept.
    pub fn configure(&mut self, config: &ParserConfig, fields: &[String]) -> Result<(), ParserError> {
        *self = Self::new(config, fields)?;
        Ok(())
    }

    /// The field names this parser maps values onto.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Parse one line. Returns `None` for skipped, short, non-matching or
    /// otherwise unparseable lines.
    pub fn parse(&self, line: &str) -> Option<ParsedData> {
        let line = line.trim();

        if self.skip.iter().any(|p| p.matches(line)) {
            tracing::debug!(line = %preview(line), "Line skipped by skip pattern");
            return None;
        }

        let fields = match &self.strategy {
            Strategy::Split { delimiter } => self.parse_split(line, delimiter),
            Strategy::Regex { regex, groups } => parse_regex(line, regex, groups),
            Strategy::Json => self.parse_json(line),
            Strategy::Custom { program } => parse_custom(line, program),
        }?;

        Some(ParsedData {
            timestamp: now_millis(),
            raw: line.to_string(),
            fields,
        })
    }

    fn parse_split(&self, line: &str, delimiter: &str) -> Option<FieldMap> {
        let parts: Vec<&str> = line.split(delimiter).map(str::trim).collect();
        if parts.len() < self.fields.len() {
            tracing::debug!(
                expected = self.fields.len(),
                got = parts.len(),
                line = %preview(line),
                "Not enough fields in line"
            );
            return None;
        }
        Some(
            self.fields
                .iter()
                .zip(parts)
                .map(|(name, part)| (name.clone(), coerce_value(part)))
                .collect(),
        )
    }

    fn parse_json(&self, line: &str) -> Option<FieldMap> {
        let parsed: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(line = %preview(line), error = %e, "Failed to parse line as JSON");
                return None;
            }
        };
        let Some(object) = parsed.as_object() else {
            tracing::debug!(line = %preview(line), "JSON line is not an object");
            return None;
        };

        let mut fields = FieldMap::new();
        for name in &self.fields {
            if let Some(value) = object.get(name) {
                fields.insert(name.clone(), json_field(value));
            }
        }
        Some(fields)
    }

    /// Check that a line parses and yields every configured field.
    pub fn validate_line(&self, line: &str) -> Result<ParsedData, String> {
        let data = self
            .parse(line)
            .ok_or_else(|| "Failed to parse line".to_string())?;
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| !data.fields.contains_key(f.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(data)
        } else {
            Err(format!("Missing fields: {}", missing.join(", ")))
        }
    }
}

fn parse_regex(line: &str, regex: &Regex, groups: &[String]) -> Option<FieldMap> {
    let caps = regex.captures(line)?;
    Some(
        groups
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let text = caps.get(i + 1).map(|m| m.as_str()).unwrap_or("");
                (name.clone(), coerce_value(text))
            })
            .collect(),
    )
}

fn parse_custom(line: &str, program: &Program) -> Option<FieldMap> {
    match program.evaluate(line) {
        Ok(fields) => fields,
        Err(e) => {
            tracing::error!(line = %preview(line), error = %e, "Custom parser failed");
            None
        }
    }
}

/// JSON primitives pass through; anything else is stored as its JSON text.
fn json_field(value: &serde_json::Value) -> FieldValue {
    match value {
        serde_json::Value::Bool(b) => FieldValue::Bool(*b),
        serde_json::Value::String(s) => FieldValue::Text(s.clone()),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Int(i),
            None => n
                .as_f64()
                .map(FieldValue::Float)
                .unwrap_or_else(|| FieldValue::Text(n.to_string())),
        },
        other => FieldValue::Text(other.to_string()),
    }
}

/// Coerce a split/regex part: number (integer when integral), then
/// `true`/`false`, else the text itself.
pub fn coerce_value(text: &str) -> FieldValue {
    // The whole part must be numeric: "12abc" stays text, not 12.
    if let Ok(i) = text.parse::<i64>() {
        return FieldValue::Int(i);
    }
    if let Some(v) = crate::core::model::parse_number(text) {
        const SAFE: f64 = 9_007_199_254_740_992.0; // 2^53
        return if v.fract() == 0.0 && v.abs() <= SAFE {
            FieldValue::Int(v as i64)
        } else {
            FieldValue::Float(v)
        };
    }
    if text.eq_ignore_ascii_case("true") {
        return FieldValue::Bool(true);
    }
    if text.eq_ignore_ascii_case("false") {
        return FieldValue::Bool(false);
    }
    FieldValue::Text(text.to_string())
}

/// Truncate a line for log output.
fn preview(line: &str) -> &str {
    match line.char_indices().nth(constants::DEBUG_MAX_LINE_PREVIEW) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

// =============================================================================
// Tests
// =============================================================================
