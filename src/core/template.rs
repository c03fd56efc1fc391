// SerialCollect - core/template.rs
//
// Export template rendering: `${name}` placeholder substitution with minimal
// CSV escaping, header derivation, previews and filename templates.
// Core layer: pure string building, the app layer writes the result.

use crate::core::model::RecordedSample;
use crate::util::constants;
use chrono::{DateTime, SecondsFormat, Utc};

/// What a placeholder resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Timestamp,
    RecordedAt,
    Label,
    Raw,
    Field(String),
    /// Not a known name; rendered verbatim as `${name}`.
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Placeholder { name: String, slot: Slot },
}

/// Result of [`TemplateFormatter::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl TemplateValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A compiled export template.
#[derive(Debug, Clone)]
pub struct TemplateFormatter {
    template: String,
    segments: Vec<Segment>,
    /// Set when a `${` is never closed.
    unclosed: bool,
}

/// Split a template into literal text and placeholders. A `${` without a
/// closing brace, and an empty `${}`, are literal text.
fn scan(template: &str) -> (Vec<(bool, String)>, bool) {
    let mut parts = Vec::new();
    let mut rest = template;
    let mut unclosed = false;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            unclosed = true;
            break;
        };
        if end == 0 {
            parts.push((false, rest[..start + 3].to_string()));
            rest = &after[1..];
            continue;
        }
        if start > 0 {
            parts.push((false, rest[..start].to_string()));
        }
        parts.push((true, after[..end].to_string()));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        parts.push((false, rest.to_string()));
    }
    (parts, unclosed)
}

impl TemplateFormatter {
    pub fn new(template: &str, fields: &[String]) -> Self {
        let (parts, unclosed) = scan(template);
        let segments = parts
            .into_iter()
            .map(|(is_placeholder, text)| {
                if !is_placeholder {
                    return Segment::Text(text);
                }
                let slot = match text.as_str() {
                    "timestamp" => Slot::Timestamp,
                    "recordedAt" => Slot::RecordedAt,
                    "label" => Slot::Label,
                    "raw" => Slot::Raw,
                    name if fields.iter().any(|f| f == name) => Slot::Field(name.to_string()),
                    name => Slot::Unknown(name.to_string()),
                };
                Segment::Placeholder { name: text, slot }
            })
            .collect();

        Self {
            template: template.to_string(),
            segments,
            unclosed,
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Placeholder names in template order, duplicates included.
    pub fn placeholders(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Placeholder { name, .. } => Some(name.as_str()),
                Segment::Text(_) => None,
            })
            .collect()
    }

    /// Header row: the template's own placeholder names, comma-joined.
    pub fn format_header(&self) -> String {
        self.placeholders().join(",")
    }

    /// Render one sample. Absent fields render as empty strings.
    pub fn format_sample(&self, sample: &RecordedSample) -> String {
        let mut out = String::with_capacity(self.template.len() + sample.data.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder { slot, .. } => match slot {
                    Slot::Timestamp => out.push_str(&sample.data.timestamp.to_string()),
                    Slot::RecordedAt => out.push_str(&sample.recorded_at.to_string()),
                    Slot::Label => out.push_str(&escape_csv(sample.label.as_deref().unwrap_or(""))),
                    Slot::Raw => out.push_str(&escape_csv(&sample.data.raw)),
                    Slot::Field(name) => {
                        let value = sample
                            .data
                            .fields
                            .get(name)
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        out.push_str(&escape_csv(&value));
                    }
                    Slot::Unknown(name) => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                },
            }
        }
        out
    }

    /// Optional header followed by one line per sample, newline-joined.
    pub fn generate_csv(&self, samples: &[RecordedSample], include_header: bool) -> String {
        let mut lines = Vec::with_capacity(samples.len() + 1);
        if include_header {
            lines.push(self.format_header());
        }
        lines.extend(samples.iter().map(|s| self.format_sample(s)));
        lines.join("\n")
    }

    /// Like [`generate_csv`](Self::generate_csv) but capped at `max_lines`
    /// rows, with a trailing `... and N more rows` line when truncated.
    pub fn preview_export(
        &self,
        samples: &[RecordedSample],
        max_lines: usize,
        include_header: bool,
    ) -> Vec<String> {
        let mut preview = Vec::with_capacity(max_lines.min(samples.len()) + 2);
        if include_header {
            preview.push(self.format_header());
        }
        preview.extend(samples.iter().take(max_lines).map(|s| self.format_sample(s)));
        if samples.len() > max_lines {
            preview.push(format!("... and {} more rows", samples.len() - max_lines));
        }
        preview
    }

    /// Unknown placeholders are warnings; an empty template or an unclosed
    /// `${` are errors.
    pub fn validate(&self) -> TemplateValidation {
        let mut result = TemplateValidation::default();
        for segment in &self.segments {
            if let Segment::Placeholder {
                slot: Slot::Unknown(name),
                ..
            } = segment
            {
                result
                    .warnings
                    .push(format!("Unknown field in template: {name}"));
            }
        }
        if self.template.trim().is_empty() {
            result.errors.push("Template is empty".to_string());
        }
        if self.unclosed {
            result
                .errors
                .push("Unclosed placeholder in template".to_string());
        }
        result
    }
}

/// Resolve `${timestamp}` (epoch ms), `${date}` (YYYY-MM-DD) and
/// `${datetime}` (ISO-8601 with `:` and `.` replaced by `-`) against `now`.
pub fn generate_filename(template: &str, now: DateTime<Utc>) -> String {
    let iso = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    template
        .replace("${timestamp}", &now.timestamp_millis().to_string())
        .replace("${date}", &now.format("%Y-%m-%d").to_string())
        .replace("${datetime}", &iso.replace([':', '.'], "-"))
}

/// Append the export extension unless the name already ends with it.
pub fn with_export_extension(filename: &str) -> String {
    if filename.ends_with(constants::EXPORT_EXTENSION) {
        filename.to_string()
    } else {
        format!("{filename}{}", constants::EXPORT_EXTENSION)
    }
}

/// Quote-wrap a value containing a comma, quote or newline, doubling
/// internal quotes.
pub fn escape_csv(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{FieldValue, ParsedData};
    use chrono::TimeZone;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn sample(raw: &str, values: &[(&str, FieldValue)], label: Option<&str>) -> RecordedSample {
        RecordedSample {
            data: ParsedData {
                timestamp: 1_700_000_000_000,
                raw: raw.to_string(),
                fields: values
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.clone()))
                    .collect(),
            },
            recorded_at: 1_700_000_000_123,
            label: label.map(str::to_string),
        }
    }

    #[test]
    fn test_header_comes_from_template_not_fields() {
        let f = TemplateFormatter::new("${timestamp};${temp};${mystery}", &fields(&["temp", "hum"]));
        assert_eq!(f.format_header(), "timestamp,temp,mystery");
        assert_eq!(f.placeholders(), vec!["timestamp", "temp", "mystery"]);
    }

    #[test]
    fn test_format_sample_substitutes_and_escapes() {
        let f = TemplateFormatter::new(
            "${timestamp},${recordedAt},${name},${temp},${label},${raw}",
            &fields(&["name", "temp"]),
        );
        let s = sample(
            "a,b",
            &[("name", FieldValue::from("say \"hi\"")), ("temp", FieldValue::Float(21.5))],
            Some("class, one"),
        );
        assert_eq!(
            f.format_sample(&s),
            "1700000000000,1700000000123,\"say \"\"hi\"\"\",21.5,\"class, one\",\"a,b\""
        );
    }

    #[test]
    fn test_missing_values_render_empty_and_unknown_stay_verbatim() {
        let f = TemplateFormatter::new("${temp}|${label}|${other}", &fields(&["temp"]));
        let s = sample("x", &[], None);
        assert_eq!(f.format_sample(&s), "||${other}");
    }

    #[test]
    fn test_builtin_timestamp_wins_over_field_of_same_name() {
        let f = TemplateFormatter::new("${timestamp}", &fields(&["timestamp"]));
        let s = sample("x", &[("timestamp", FieldValue::Int(5))], None);
        assert_eq!(f.format_sample(&s), "1700000000000");
    }

    #[test]
    fn test_generate_csv_is_valid_csv() {
        let f = TemplateFormatter::new("${id},${note},${label}", &fields(&["id", "note"]));
        let samples = vec![
            sample("1", &[("id", FieldValue::Int(1)), ("note", FieldValue::from("plain"))], Some("a")),
            sample(
                "2",
                &[("id", FieldValue::Int(2)), ("note", FieldValue::from("x, \"y\"\nz"))],
                Some("b"),
            ),
        ];
        let text = f.generate_csv(&samples, true);

        let mut reader = csv::Reader::from_reader(text.as_bytes());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers, csv::StringRecord::from(vec!["id", "note", "label"]));
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[1][1], "x, \"y\"\nz");
        assert_eq!(&rows[1][2], "b");

        let no_header = f.generate_csv(&samples[..1], false);
        assert_eq!(no_header, "1,plain,a");
    }

    #[test]
    fn test_preview_truncates_with_summary() {
        let f = TemplateFormatter::new("${v}", &fields(&["v"]));
        let samples: Vec<RecordedSample> = (0..8)
            .map(|i| sample("", &[("v", FieldValue::Int(i))], None))
            .collect();
        let preview = f.preview_export(&samples, 5, true);
        assert_eq!(preview.len(), 7);
        assert_eq!(preview[0], "v");
        assert_eq!(preview[5], "4");
        assert_eq!(preview[6], "... and 3 more rows");

        let short = f.preview_export(&samples[..2], 5, false);
        assert_eq!(short, vec!["0", "1"]);
    }

    #[test]
    fn test_validate_template() {
        let ok = TemplateFormatter::new("${timestamp},${v}", &fields(&["v"]));
        assert!(ok.validate().is_valid());
        assert!(ok.validate().warnings.is_empty());

        let unknown = TemplateFormatter::new("${v},${w}", &fields(&["v"]));
        let v = unknown.validate();
        assert!(v.is_valid());
        assert_eq!(v.warnings, vec!["Unknown field in template: w"]);

        let empty = TemplateFormatter::new("   ", &[]);
        assert_eq!(empty.validate().errors, vec!["Template is empty"]);

        let unclosed = TemplateFormatter::new("${v},${w", &fields(&["v"]));
        let v = unclosed.validate();
        assert!(!v.is_valid());
        assert_eq!(v.errors, vec!["Unclosed placeholder in template"]);
        // The unclosed tail is literal text and not part of the header.
        assert_eq!(unclosed.format_header(), "v");
    }

    #[test]
    fn test_empty_braces_are_literal() {
        let f = TemplateFormatter::new("a${}b${v}", &fields(&["v"]));
        assert_eq!(f.placeholders(), vec!["v"]);
        let s = sample("", &[("v", FieldValue::Int(1))], None);
        assert_eq!(f.format_sample(&s), "a${}b1");
    }

    #[test]
    fn test_generate_filename() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(
            generate_filename("export_${date}_${timestamp}", now),
            "export_2024-03-01_1709296205000"
        );
        assert_eq!(
            generate_filename("run_${datetime}", now),
            "run_2024-03-01T12-30-05-000Z"
        );
        assert_eq!(generate_filename("plain", now), "plain");
    }

    #[test]
    fn test_export_extension() {
        assert_eq!(with_export_extension("data"), "data.csv");
        assert_eq!(with_export_extension("data.csv"), "data.csv");
    }

    #[test]
    fn test_escape_csv() {
        assert_eq!(escape_csv("plain"), "plain");
        assert_eq!(escape_csv("a,b"), "\"a,b\"");
        assert_eq!(escape_csv("q\"q"), "\"q\"\"q\"");
        assert_eq!(escape_csv("l1\nl2"), "\"l1\nl2\"");
    }
}
