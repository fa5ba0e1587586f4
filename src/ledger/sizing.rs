//! Text heuristics for position size: the sizing map used when a trade is
//! opened, and the trim/add parser used by updates.

use once_cell::sync::Lazy;
use regex::Regex;

static REDUCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(trim(s|med|ming)?|scal(e|es|ed|ing) out)\b").expect("valid reduce regex")
});
static INCREASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(add(s|ed|ing)?|scal(e|es|ed|ing) in)\b").expect("valid increase regex")
});
static PERCENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)\s*%").expect("valid percent regex"));
// No lookbehind in `regex`; the leading class keeps "0.5" from reading as 5.
static TRAILING_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[^\d.])(\d+)[\s.!]*$").expect("valid count regex"));

/// Fallback magnitude when a trim/add names no amount.
pub const DEFAULT_DELTA: i64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sizing {
    Small,
    Medium,
    Large,
}

impl Sizing {
    /// Unknown or absent hints ("lotto", "half") size as [`Sizing::Small`].
    pub fn from_hint(hint: Option<&str>) -> Self {
        match hint.map(|h| h.trim().to_ascii_lowercase()).as_deref() {
            Some("medium") => Sizing::Medium,
            Some("large") => Sizing::Large,
            _ => Sizing::Small,
        }
    }

    pub fn quantity(self) -> i64 {
        match self {
            Sizing::Small => 1,
            Sizing::Medium => 5,
            Sizing::Large => 10,
        }
    }
}

/// Signed quantity change described by an update instruction such as
/// "trim 50%" or "add 2". Returns 0 when the text names neither a trim nor
/// an add.
///
/// A percentage applies to `current` and truncates toward zero; a trailing
/// integer is taken literally; anything else moves by [`DEFAULT_DELTA`].
pub fn parse_quantity_delta(details: &str, current: i64) -> i64 {
    let sign = if REDUCE.is_match(details) {
        -1
    } else if INCREASE.is_match(details) {
        1
    } else {
        return 0;
    };

    let magnitude = if let Some(caps) = PERCENT.captures(details) {
        let percent: f64 = caps[1].parse().unwrap_or(0.0);
        (current.max(0) as f64 * percent / 100.0).trunc() as i64
    } else if let Some(caps) = TRAILING_COUNT.captures(details) {
        caps[1].parse().unwrap_or(DEFAULT_DELTA)
    } else {
        DEFAULT_DELTA
    };

    sign * magnitude
}

/// Quantity after applying `delta`, floored at zero.
pub fn apply_delta(current: i64, delta: i64) -> i64 {
    current.saturating_add(delta).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizing_map_defaults_to_small() {
        assert_eq!(Sizing::from_hint(Some("small")).quantity(), 1);
        assert_eq!(Sizing::from_hint(Some(" Medium ")).quantity(), 5);
        assert_eq!(Sizing::from_hint(Some("large")).quantity(), 10);
        assert_eq!(Sizing::from_hint(Some("lotto")).quantity(), 1);
        assert_eq!(Sizing::from_hint(None).quantity(), 1);
    }

    #[test]
    fn percentage_trims_truncate_toward_zero() {
        assert_eq!(parse_quantity_delta("trim 50%", 10), -5);
        assert_eq!(parse_quantity_delta("scale out 25%", 10), -2);
        assert_eq!(parse_quantity_delta("Trimmed 33.3 % here", 3), 0);
        assert_eq!(parse_quantity_delta("trim 100%", 7), -7);
    }

    #[test]
    fn literal_and_default_amounts() {
        assert_eq!(parse_quantity_delta("trim 3", 10), -3);
        assert_eq!(parse_quantity_delta("adding 2.", 4), 2);
        assert_eq!(parse_quantity_delta("scale in 50%", 4), 2);
        assert_eq!(parse_quantity_delta("trim some here", 10), -1);
        assert_eq!(parse_quantity_delta("add a few", 10), 1);
    }

    #[test]
    fn fractional_amounts_fall_back_to_one() {
        assert_eq!(parse_quantity_delta("trim 0.5", 10), -1);
        assert_eq!(parse_quantity_delta("trim 1.5", 10), -1);
        assert_eq!(parse_quantity_delta("add 2.5!", 10), 1);
        assert_eq!(parse_quantity_delta("trim 12", 20), -12);
    }

    #[test]
    fn unrelated_text_is_no_change() {
        assert_eq!(parse_quantity_delta("moving stop to break even", 10), 0);
        assert_eq!(parse_quantity_delta("new address posted", 10), 0);
        assert_eq!(parse_quantity_delta("", 10), 0);
    }

    #[test]
    fn quantity_never_goes_negative() {
        assert_eq!(apply_delta(2, parse_quantity_delta("trim 5", 2)), 0);
        assert_eq!(apply_delta(10, -5), 5);
        assert_eq!(apply_delta(0, -1), 0);
    }
}
