//! Backup naming module for generating and recognizing timestamped backup filenames
//!
//! A naming template such as `db_{dbname}_{date}.sql` is parsed once into
//! literal segments and two typed slots. The same pattern produces the name
//! of a new backup and recognizes earlier backups in a remote listing.

use std::fmt::Write;

use chrono::NaiveDateTime;
use chrono::format::{self, Item, ParseResult, Parsed, StrftimeItems};
use regex::Regex;

use crate::config::NamingConfig;
use crate::database::{BackupError, Result};

const DBNAME_PLACEHOLDER: &str = "dbname";
const DATE_PLACEHOLDER: &str = "date";
const DATE_GROUP: &str = "date";

/// One piece of a parsed naming template
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    DbName,
    Date,
}

/// Typed naming pattern for backup files
#[derive(Debug, Clone)]
pub struct NamingPattern {
    segments: Vec<Segment>,
    date_format: String,
    matcher: Regex,
}

impl NamingPattern {
    /// Build a pattern from a template and the regex fragments of its slots
    pub fn new(
        template: &str,
        dbname_regex: &str,
        date_regex: &str,
        date_format: &str,
    ) -> Result<Self> {
        let segments = parse_template(template)?;
        validate_date_format(date_format)?;

        let mut source = String::from("^");
        for segment in &segments {
            match segment {
                Segment::Literal(text) => source.push_str(&regex::escape(text)),
                Segment::DbName => source.push_str(&format!("(?:{})", dbname_regex)),
                Segment::Date => {
                    source.push_str(&format!("(?P<{}>{})", DATE_GROUP, date_regex))
                }
            }
        }
        source.push('$');

        let matcher = Regex::new(&source).map_err(|e| {
            BackupError::Pattern(format!("cannot compile {:?}: {}", template, e))
        })?;

        Ok(Self {
            segments,
            date_format: date_format.to_string(),
            matcher,
        })
    }

    /// Build the pattern described by the `[General]` config section
    pub fn from_config(config: &NamingConfig) -> Result<Self> {
        Self::new(
            &config.filename_format,
            &config.dbname_regex,
            &config.date_regex,
            &config.date_format,
        )
    }

    /// Whether the filename is a backup produced by this pattern
    pub fn matches(&self, filename: &str) -> bool {
        self.matcher.is_match(filename)
    }

    /// The raw `{date}` token of a matching filename
    pub fn date_token<'a>(&self, filename: &'a str) -> Option<&'a str> {
        self.matcher
            .captures(filename)
            .and_then(|caps| caps.name(DATE_GROUP))
            .map(|m| m.as_str())
    }

    /// Timestamp embedded in a backup filename
    ///
    /// Returns `Ok(None)` for filenames that do not match the pattern and an
    /// error for filenames that match but carry an unparseable date.
    pub fn backup_timestamp(&self, filename: &str) -> Result<Option<NaiveDateTime>> {
        let Some(token) = self.date_token(filename) else {
            return Ok(None);
        };

        parse_backup_date(token, &self.date_format)
            .map(Some)
            .ok_or_else(|| BackupError::DateParse {
                filename: filename.to_string(),
                value: token.to_string(),
                format: self.date_format.clone(),
            })
    }

    /// Generate the filename of a backup taken at `timestamp`
    pub fn generate_filename_with_time(
        &self,
        dbname: &str,
        timestamp: NaiveDateTime,
    ) -> Result<String> {
        let mut filename = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => filename.push_str(text),
                Segment::DbName => filename.push_str(dbname),
                Segment::Date => write!(filename, "{}", timestamp.format(&self.date_format))
                    .map_err(|_| {
                        BackupError::Pattern(format!(
                            "date format {:?} cannot render a local timestamp",
                            self.date_format
                        ))
                    })?,
            }
        }
        Ok(filename)
    }
}

/// Parse a date token, filling the fields the format leaves out
///
/// Missing fields take the values strptime gives them: year 1900, month and
/// day 1, midnight. An hourly `%Y%m%d%H` token keeps its hour and a monthly
/// `%Y-%m` token lands on the first of the month.
pub fn parse_backup_date(value: &str, format: &str) -> Option<NaiveDateTime> {
    let mut parsed = Parsed::new();
    format::parse(&mut parsed, value, StrftimeItems::new(format)).ok()?;

    // A unix timestamp fixes every field on its own
    if parsed.timestamp().is_none() {
        fill_missing_fields(&mut parsed).ok()?;
    }

    parsed.to_naive_datetime_with_offset(0).ok()
}

fn fill_missing_fields(parsed: &mut Parsed) -> ParseResult<()> {
    if parsed.year().is_none()
        && parsed.year_div_100().is_none()
        && parsed.year_mod_100().is_none()
        && parsed.isoyear().is_none()
    {
        parsed.set_year(1900)?;
    }

    let by_week_or_ordinal = parsed.ordinal().is_some()
        || parsed.isoweek().is_some()
        || parsed.week_from_sun().is_some()
        || parsed.week_from_mon().is_some();
    if !by_week_or_ordinal {
        if parsed.month().is_none() {
            parsed.set_month(1)?;
        }
        if parsed.day().is_none() {
            parsed.set_day(1)?;
        }
    }

    if parsed.hour_div_12().is_none() {
        parsed.set_ampm(false)?;
    }
    if parsed.hour_mod_12().is_none() {
        parsed.set_hour12(12)?;
    }
    if parsed.minute().is_none() {
        parsed.set_minute(0)?;
    }
    if parsed.second().is_none() {
        parsed.set_second(0)?;
    }
    Ok(())
}

fn validate_date_format(format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(BackupError::Pattern(format!(
            "invalid date format {:?}",
            format
        )));
    }
    Ok(())
}

/// Split a template into literals and slots; `{{` and `}}` are literal braces
fn parse_template(template: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => {
                            return Err(BackupError::Pattern(format!(
                                "unclosed placeholder in {:?}",
                                template
                            )));
                        }
                    }
                }

                let slot = match name.as_str() {
                    DBNAME_PLACEHOLDER => Segment::DbName,
                    DATE_PLACEHOLDER => Segment::Date,
                    other => {
                        return Err(BackupError::Pattern(format!(
                            "unknown placeholder {{{}}} in {:?}",
                            other, template
                        )));
                    }
                };

                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(slot);
            }
            '}' => {
                return Err(BackupError::Pattern(format!(
                    "single '}}' in {:?}",
                    template
                )));
            }
            c => literal.push(c),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }

    let count = |wanted: &Segment| segments.iter().filter(|s| *s == wanted).count();
    if count(&Segment::Date) != 1 {
        return Err(BackupError::Pattern(format!(
            "{:?} must contain exactly one {{{}}}",
            template, DATE_PLACEHOLDER
        )));
    }
    if count(&Segment::DbName) > 1 {
        return Err(BackupError::Pattern(format!(
            "{:?} may contain at most one {{{}}}",
            template, DBNAME_PLACEHOLDER
        )));
    }

    Ok(segments)
}
