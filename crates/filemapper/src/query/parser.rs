//! Text filter language.
//!
//! ## Syntax
//!
//! Whitespace separated `key:value` terms; double quotes group text containing
//! spaces and `\` escapes the next character. Repeating a key adds values to
//! the same dimension.
//!
//! Values are comma separated lists of single values or ranges. Ranges use
//! `a..b`, or `a-b` for integers, and either end may be left open.
//!
//! ### Keys
//! - `phys`/`p`, `log`/`l`, `len`, `size`: byte offsets with an optional unit
//!   (`%` of the device, `b` blocks, `s` 512-byte sectors, `k`, `m`, `g`, `t`)
//! - `ino`/`i`: inode numbers (pseudo-inodes are negative)
//! - `path`: one exact path or glob per term, never split on commas
//! - `type`: extent type symbols or names, or `all`
//! - `flags`, `anyflags`, `allflags`: flag names joined with `+`, or hex
//! - `travel`, `extents`: inode statistics
//! - `atime`, `crtime`, `ctime`, `mtime`: unix seconds or `YYYY-MM-DD`
//!
//! ### Examples
//! - `phys:100k-112k type:f`
//! - `path:"/home/me/*.iso" anyflags:shared+unwritten`
//! - `travel:2.. mtime:2024-01-01..2024-06-30`

use chrono::{Local, NaiveDate, TimeZone};

use super::filter::{ExtentFilter, FlagMatch, InodeFilter};
use super::range::ValueRange;
use crate::error::{FilemapError, Result};
use crate::store::FilesystemSummary;
use crate::types::{ExtentFlags, ExtentType, ExtentTypeSet};

const SECTOR_SIZE: u64 = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterTerm {
    key: String,
    value: String,
    position: usize,
}

/// Parses filter text against the units of one filesystem.
pub struct FilterParser<'a> {
    summary: &'a FilesystemSummary,
}

impl<'a> FilterParser<'a> {
    pub fn new(summary: &'a FilesystemSummary) -> Self {
        Self { summary }
    }

    /// Parses a filter for an extent query; inode-only keys are rejected.
    pub fn parse_extents(&self, input: &str) -> Result<ExtentFilter> {
        let mut filter = InodeFilter::default();
        for term in tokenize_filter_input(input)? {
            if is_inode_only_key(&term.key) {
                return Err(FilemapError::QueryParse(format!(
                    "{}: only applies to inode queries (near byte {})",
                    term.key, term.position
                )));
            }
            self.apply_term(&mut filter, &term)?;
        }
        Ok(filter.extent)
    }

    pub fn parse_inodes(&self, input: &str) -> Result<InodeFilter> {
        let mut filter = InodeFilter::default();
        for term in tokenize_filter_input(input)? {
            self.apply_term(&mut filter, &term)?;
        }
        Ok(filter)
    }

    fn apply_term(&self, filter: &mut InodeFilter, term: &FilterTerm) -> Result<()> {
        let value = term.value.as_str();
        if value.is_empty() {
            return Err(FilemapError::QueryParse(format!(
                "{}: requires a value",
                term.key
            )));
        }
        match term.key.as_str() {
            "phys" | "p" => {
                for raw in split_values(value) {
                    filter.extent.physical.push(self.parse_offset_range(raw)?);
                }
            }
            "log" | "l" => {
                for raw in split_values(value) {
                    filter.extent.logical.push(self.parse_offset_range(raw)?);
                }
            }
            "len" => {
                for raw in split_values(value) {
                    filter.extent.lengths.push(self.parse_offset_range(raw)?);
                }
            }
            "size" => {
                for raw in split_values(value) {
                    filter.sizes.push(self.parse_offset_range(raw)?);
                }
            }
            "ino" | "i" => {
                for raw in split_values(value) {
                    filter.extent.inodes.push(parse_inode_range(raw)?);
                }
            }
            "path" => filter
                .extent
                .paths
                .add(value, self.summary.path_separator)?,
            "type" => {
                let mut types = ExtentTypeSet::empty();
                for raw in split_values(value) {
                    types |= parse_type_set(raw)?;
                }
                filter.extent.types =
                    Some(filter.extent.types.map_or(types, |current| current | types));
            }
            "flags" => {
                for raw in split_values(value) {
                    filter.extent.flags.push(FlagMatch::exact(parse_flag_mask(raw)?));
                }
            }
            "anyflags" => {
                for raw in split_values(value) {
                    filter.extent.flags.push(FlagMatch::any(parse_flag_mask(raw)?));
                }
            }
            "allflags" => {
                for raw in split_values(value) {
                    filter.extent.flags.push(FlagMatch::all(parse_flag_mask(raw)?));
                }
            }
            "travel" => {
                for raw in split_values(value) {
                    filter.travel_scores.push(parse_score_range(raw)?);
                }
            }
            "extents" => {
                for raw in split_values(value) {
                    filter.extent_counts.push(parse_count_range(raw)?);
                }
            }
            "atime" => push_time_ranges(&mut filter.atimes, value)?,
            "crtime" => push_time_ranges(&mut filter.crtimes, value)?,
            "ctime" => push_time_ranges(&mut filter.ctimes, value)?,
            "mtime" => push_time_ranges(&mut filter.mtimes, value)?,
            other => {
                return Err(FilemapError::QueryParse(format!(
                    "unknown filter key {other:?} near byte {}",
                    term.position
                )))
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Offsets
    // -----------------------------------------------------------------------

    /// Converts a number with an optional unit suffix into bytes.
    pub fn parse_offset(&self, raw: &str) -> Result<u64> {
        let trimmed = raw.trim();
        let split = trimmed
            .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        if number.is_empty() {
            return Err(FilemapError::QueryParse(format!(
                "expected a numeric offset in {raw:?}"
            )));
        }

        if unit == "%" {
            let percent: f64 = number.parse().map_err(|_| {
                FilemapError::QueryParse(format!("failed to parse number in {raw:?}"))
            })?;
            return Ok((percent * self.summary.total_bytes as f64 / 100.0) as u64);
        }

        let multiplier = match unit {
            "" => 1,
            "b" | "B" => self.summary.block_size.max(1),
            "s" | "S" => SECTOR_SIZE,
            "k" | "K" => 1 << 10,
            "m" | "M" => 1 << 20,
            "g" | "G" => 1 << 30,
            "t" | "T" => 1 << 40,
            _ => {
                return Err(FilemapError::QueryParse(format!(
                    "unknown unit {unit:?} in {raw:?}"
                )))
            }
        };

        if number.contains('.') {
            let value: f64 = number.parse().map_err(|_| {
                FilemapError::QueryParse(format!("failed to parse number in {raw:?}"))
            })?;
            return Ok((value * multiplier as f64) as u64);
        }
        let value: u64 = number.parse().map_err(|_| {
            FilemapError::QueryParse(format!("failed to parse number in {raw:?}"))
        })?;
        value.checked_mul(multiplier).ok_or_else(|| {
            FilemapError::QueryParse(format!("offset {raw:?} does not fit in 64 bits"))
        })
    }

    fn parse_offset_range(&self, raw: &str) -> Result<ValueRange<u64>> {
        match split_range(raw, true) {
            Some((start, end)) => {
                let start = if start.is_empty() {
                    0
                } else {
                    self.parse_offset(start)?
                };
                let end = if end.is_empty() {
                    u64::MAX
                } else {
                    self.parse_offset(end)?
                };
                ordered_range(start, end, raw)
            }
            None => Ok(ValueRange::single(self.parse_offset(raw)?)),
        }
    }
}

fn is_inode_only_key(key: &str) -> bool {
    matches!(
        key,
        "travel" | "extents" | "size" | "atime" | "crtime" | "ctime" | "mtime"
    )
}

fn split_values(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|value| !value.is_empty())
}

/// Splits `a..b`, or `a-b` when `dash` is allowed. A leading minus belongs to
/// the first number.
fn split_range(raw: &str, dash: bool) -> Option<(&str, &str)> {
    if let Some(split) = raw.find("..") {
        return Some((raw[..split].trim(), raw[split + 2..].trim()));
    }
    if !dash {
        return None;
    }
    let split = raw.get(1..)?.find('-')? + 1;
    Some((raw[..split].trim(), raw[split + 1..].trim()))
}

fn ordered_range<T: PartialOrd + Copy>(start: T, end: T, raw: &str) -> Result<ValueRange<T>> {
    if start > end {
        return Err(FilemapError::QueryParse(format!(
            "range start must not exceed its end in {raw:?}"
        )));
    }
    Ok(ValueRange::new(start, end))
}

fn parse_number<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| FilemapError::QueryParse(format!("{what}: failed to parse {raw:?}")))
}

fn parse_inode_range(raw: &str) -> Result<ValueRange<i64>> {
    match split_range(raw, true) {
        Some((start, end)) => {
            let start = if start.is_empty() {
                i64::MIN
            } else {
                parse_number(start, "ino")?
            };
            let end = if end.is_empty() {
                i64::MAX
            } else {
                parse_number(end, "ino")?
            };
            ordered_range(start, end, raw)
        }
        None => Ok(ValueRange::single(parse_number(raw, "ino")?)),
    }
}

fn parse_count_range(raw: &str) -> Result<ValueRange<u64>> {
    match split_range(raw, true) {
        Some((start, end)) => {
            let start = if start.is_empty() {
                0
            } else {
                parse_number(start, "extents")?
            };
            let end = if end.is_empty() {
                u64::MAX
            } else {
                parse_number(end, "extents")?
            };
            ordered_range(start, end, raw)
        }
        None => Ok(ValueRange::single(parse_number(raw, "extents")?)),
    }
}

fn parse_score_range(raw: &str) -> Result<ValueRange<f64>> {
    // `-` belongs to exponents here, so only `..` separates the ends.
    match split_range(raw, false) {
        Some((start, end)) => {
            let start = if start.is_empty() {
                0.0
            } else {
                parse_number(start, "travel")?
            };
            let end = if end.is_empty() {
                f64::INFINITY
            } else {
                parse_number(end, "travel")?
            };
            ordered_range(start, end, raw)
        }
        None => Ok(ValueRange::single(parse_number(raw, "travel")?)),
    }
}

fn parse_type_set(raw: &str) -> Result<ExtentTypeSet> {
    if raw.eq_ignore_ascii_case("all") {
        return Ok(ExtentTypeSet::all());
    }
    ExtentType::lookup(raw)
        .map(ExtentType::bit)
        .ok_or_else(|| FilemapError::QueryParse(format!("unknown extent type {raw:?}")))
}

fn parse_flag_mask(raw: &str) -> Result<ExtentFlags> {
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        let bits = u32::from_str_radix(hex, 16)
            .map_err(|_| FilemapError::QueryParse(format!("invalid flag mask {raw:?}")))?;
        return Ok(ExtentFlags::from_bits_truncate(bits));
    }
    raw.split(['+', '|'])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .try_fold(ExtentFlags::empty(), |mask, name| {
            ExtentFlags::lookup(name)
                .map(|flag| mask | flag)
                .ok_or_else(|| FilemapError::QueryParse(format!("unknown extent flag {name:?}")))
        })
}

// ---------------------------------------------------------------------------
// Times
// ---------------------------------------------------------------------------

fn push_time_ranges(ranges: &mut Vec<ValueRange<i64>>, value: &str) -> Result<()> {
    for raw in split_values(value) {
        ranges.push(parse_time_range(raw)?);
    }
    Ok(())
}

fn parse_time_range(raw: &str) -> Result<ValueRange<i64>> {
    match split_range(raw, false) {
        Some((start, end)) => {
            let start = if start.is_empty() {
                i64::MIN
            } else {
                parse_time_value(start)?.0
            };
            let end = if end.is_empty() {
                i64::MAX
            } else {
                parse_time_value(end)?.1
            };
            ordered_range(start, end, raw)
        }
        None => {
            let (start, end) = parse_time_value(raw)?;
            Ok(ValueRange::new(start, end))
        }
    }
}

/// A unix timestamp, or the first and last second of a local calendar day.
fn parse_time_value(raw: &str) -> Result<(i64, i64)> {
    let trimmed = raw.trim();
    if let Ok(seconds) = trimmed.parse::<i64>() {
        return Ok((seconds, seconds));
    }
    let date = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map_err(|_| FilemapError::QueryParse(format!("unrecognized date value {raw:?}")))?;
    let start = local_midnight(date);
    let end = date
        .succ_opt()
        .and_then(local_midnight)
        .map(|next| next - 1);
    match (start, end) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(FilemapError::QueryParse(format!(
            "date {raw:?} does not exist in the local time zone"
        ))),
    }
}

fn local_midnight(date: NaiveDate) -> Option<i64> {
    let midnight = date.and_hms_opt(0, 0, 0)?;
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|time| time.timestamp())
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

fn tokenize_filter_input(input: &str) -> Result<Vec<FilterTerm>> {
    let mut terms = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((position, ch)) = chars.peek().copied() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }

        let mut text = String::new();
        let mut quoted_from = None;
        let mut escaped = false;
        while let Some((index, ch)) = chars.peek().copied() {
            if escaped {
                text.push(ch);
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                quoted_from = match quoted_from {
                    Some(_) => None,
                    None => Some(index),
                };
            } else if ch.is_whitespace() && quoted_from.is_none() {
                break;
            } else {
                text.push(ch);
            }
            chars.next();
        }
        if let Some(start) = quoted_from {
            return Err(FilemapError::QueryParse(format!(
                "missing closing quote near byte {start}"
            )));
        }

        let Some((key, value)) = text.split_once(':') else {
            return Err(FilemapError::QueryParse(format!(
                "expected key:value near byte {position}"
            )));
        };
        terms.push(FilterTerm {
            key: key.trim().to_ascii_lowercase(),
            value: value.trim().to_string(),
            position,
        });
    }

    Ok(terms)
}
