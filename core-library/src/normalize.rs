//! Title normalization and year parsing.
//!
//! Directory names like `For All Mankind (2019)` and manager titles like
//! `For All Mankind` must map to the same identity key. The year rules:
//!
//! - several parenthesized years: the first valid one wins (`Show (2015) (2025)` is 2015)
//! - a single year counts only at the end (`Star Trek (2009) Remastered` has no year)
//! - valid years are 1900..=2100

use once_cell::sync::Lazy;
use regex::Regex;

static YEAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((\d{4})\)").expect("valid year pattern"));

static YEAR_SUFFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\((\d{4})\)\s*$").expect("valid year suffix pattern"));

const STRIPPED_CHARS: &[char] = &[
    ' ', '.', '-', '_', '\'', ':', '&', '*', ',', '!', '?', '(', ')', '[', ']',
];

fn valid_year(raw: &str) -> Option<i32> {
    raw.parse::<i32>()
        .ok()
        .filter(|year| (1900..=2100).contains(year))
}

/// `"For All Mankind (2019)"` -> `"forallmankind"`, `"M*A*S*H"` -> `"mash"`.
pub fn normalize_title(title: &str) -> String {
    let without_year = YEAR_SUFFIX_PATTERN.replace(title, "");
    without_year
        .to_lowercase()
        .chars()
        .filter(|c| !STRIPPED_CHARS.contains(c))
        .collect()
}

pub fn extract_year(title: &str) -> Option<i32> {
    let years: Vec<&str> = YEAR_PATTERN
        .captures_iter(title)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();

    match years.len() {
        0 => None,
        1 => YEAR_SUFFIX_PATTERN
            .captures(title)
            .and_then(|caps| caps.get(1))
            .and_then(|m| valid_year(m.as_str())),
        _ => years.into_iter().find_map(valid_year),
    }
}

/// Removes the year [`extract_year`] would report, leaving the rest intact.
pub fn strip_year(title: &str) -> String {
    let matches: Vec<_> = YEAR_PATTERN.captures_iter(title).collect();

    match matches.len() {
        0 => title.to_string(),
        1 => {
            if !YEAR_SUFFIX_PATTERN.is_match(title) {
                return title.to_string();
            }
            YEAR_SUFFIX_PATTERN.replace(title, "").into_owned()
        }
        _ => {
            let first = &matches[0];
            let (Some(whole), Some(year)) = (first.get(0), first.get(1)) else {
                return title.to_string();
            };
            if valid_year(year.as_str()).is_none() {
                return title.to_string();
            }

            let before = title[..whole.start()].trim_end();
            let after = title[whole.end()..].trim_start();
            if after.is_empty() {
                before.to_string()
            } else {
                format!("{} {}", before, after)
            }
        }
    }
}

/// Splits a library directory name into a display title and year.
pub fn parse_directory_name(name: &str) -> (String, Option<i32>) {
    (strip_year(name).trim().to_string(), extract_year(name))
}
