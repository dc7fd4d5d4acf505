//! Resource list arithmetic for cluster capacity bookkeeping
//!
//! A resource list maps a resource name ("cpu", "memory", ...) to a Kubernetes
//! quantity. Every operation treats a key missing on one side as zero, and an
//! absent (`None`) list is never mutated.
//!
//! Quantities are compared and summed at milli-unit precision, so `1Gi` equals
//! `1024Mi` and `500m + 500m` equals `1`.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::warn;

use crate::Error;

/// Map of resource name to quantity, as carried by SFCluster capacity fields
pub type ResourceList = BTreeMap<String, Quantity>;

// =============================================================================
// Quantity parsing
// =============================================================================

const BINARY_SUFFIXES: &[(&str, u32)] = &[
    ("Ki", 10),
    ("Mi", 20),
    ("Gi", 30),
    ("Ti", 40),
    ("Pi", 50),
    ("Ei", 60),
];

const DECIMAL_SUFFIXES: &[(&str, i32)] = &[
    ("m", -3),
    ("", 0),
    ("k", 3),
    ("M", 6),
    ("G", 9),
    ("T", 12),
    ("P", 15),
    ("E", 18),
];

fn overflow(raw: &str) -> Error {
    Error::validation(format!("quantity {raw} out of range"))
}

fn scale_pow10(value: i128, exp: i32, raw: &str) -> Result<i128, Error> {
    if exp >= 0 {
        let factor = 10i128.checked_pow(exp as u32).ok_or_else(|| overflow(raw))?;
        value.checked_mul(factor).ok_or_else(|| overflow(raw))
    } else {
        let divisor = 10i128
            .checked_pow(exp.unsigned_abs())
            .ok_or_else(|| overflow(raw))?;
        // round away from zero so sub-milli amounts are never lost
        let q = value / divisor;
        if value % divisor == 0 {
            Ok(q)
        } else if value > 0 {
            q.checked_add(1).ok_or_else(|| overflow(raw))
        } else {
            q.checked_sub(1).ok_or_else(|| overflow(raw))
        }
    }
}

/// Parse a quantity into milli-units.
///
/// Accepts the Kubernetes quantity grammar: an optionally signed decimal
/// number followed by a binary suffix (`Ki`..`Ei`), a decimal suffix
/// (`m`, `k`, `M`..`E`) or a decimal exponent (`e3`, `E-2`).
pub fn parse_millis(quantity: &Quantity) -> Result<i128, Error> {
    let raw = quantity.0.trim();
    if raw.is_empty() {
        return Err(Error::validation("empty quantity"));
    }

    let number_end = raw
        .char_indices()
        .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || ((*c == '+' || *c == '-') && *i == 0)))
        .map(|(i, _)| i)
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(number_end);

    let (negative, digits) = match number.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, number.strip_prefix('+').unwrap_or(number)),
    };
    let (whole, frac) = digits.split_once('.').unwrap_or((digits, ""));
    if (whole.is_empty() && frac.is_empty()) || frac.contains('.') {
        return Err(Error::validation(format!("invalid quantity: {raw}")));
    }

    let mantissa_digits = format!("{whole}{frac}");
    let mut mantissa: i128 = mantissa_digits
        .parse()
        .map_err(|_| Error::validation(format!("invalid quantity: {raw}")))?;
    if negative {
        mantissa = -mantissa;
    }
    let frac_exp = i32::try_from(frac.len())
        .map(|len| -len)
        .map_err(|_| overflow(raw))?;
    let exponent = |exp: i32| {
        frac_exp
            .checked_add(exp)
            .and_then(|e| e.checked_add(3))
            .ok_or_else(|| overflow(raw))
    };

    if let Some((_, shift)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        let scaled = mantissa
            .checked_mul(1i128 << shift)
            .ok_or_else(|| overflow(raw))?;
        return scale_pow10(scaled, exponent(0)?, raw);
    }

    if let Some((_, exp)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return scale_pow10(mantissa, exponent(*exp)?, raw);
    }

    if let Some(exp) = suffix
        .strip_prefix('e')
        .or_else(|| suffix.strip_prefix('E'))
        .and_then(|e| e.parse::<i32>().ok())
    {
        return scale_pow10(mantissa, exponent(exp)?, raw);
    }

    Err(Error::validation(format!(
        "invalid quantity suffix {suffix:?} in {raw}"
    )))
}

/// Render milli-units back into a canonical quantity
pub fn format_millis(millis: i128) -> Quantity {
    if millis % 1000 == 0 {
        Quantity((millis / 1000).to_string())
    } else {
        Quantity(format!("{millis}m"))
    }
}

fn millis_or_zero(name: &str, quantity: Option<&Quantity>) -> i128 {
    match quantity {
        None => 0,
        Some(q) => parse_millis(q).unwrap_or_else(|e| {
            warn!(resource = %name, quantity = %q.0, error = %e, "Unparseable quantity treated as zero");
            0
        }),
    }
}

fn union_keys<'a>(x: Option<&'a ResourceList>, y: Option<&'a ResourceList>) -> BTreeSet<&'a str> {
    x.into_iter()
        .chain(y)
        .flat_map(|list| list.keys().map(String::as_str))
        .collect()
}

fn get<'a>(list: Option<&'a ResourceList>, key: &str) -> Option<&'a Quantity> {
    list.and_then(|l| l.get(key))
}

// =============================================================================
// Resource list operations
// =============================================================================

/// True when every resource in either list has the same amount in both
pub fn resource_list_equal(x: Option<&ResourceList>, y: Option<&ResourceList>) -> bool {
    union_keys(x, y)
        .into_iter()
        .all(|key| millis_or_zero(key, get(x, key)) == millis_or_zero(key, get(y, key)))
}

/// True when `x` is strictly smaller than `y` in every resource.
///
/// An absent or empty `y` is never greater than anything.
pub fn resource_list_less(x: Option<&ResourceList>, y: Option<&ResourceList>) -> bool {
    match y {
        None => false,
        Some(list) if list.is_empty() => false,
        Some(_) => union_keys(x, y)
            .into_iter()
            .all(|key| millis_or_zero(key, get(x, key)) < millis_or_zero(key, get(y, key))),
    }
}

fn combine(x: Option<&mut ResourceList>, y: Option<&ResourceList>, sign: i128) {
    let (Some(x), Some(y)) = (x, y) else {
        return;
    };
    for (key, quantity) in y {
        let current = millis_or_zero(key, x.get(key));
        let delta = millis_or_zero(key, Some(quantity)).saturating_mul(sign);
        let total = current.checked_add(delta).unwrap_or_else(|| {
            warn!(resource = %key, "Quantity sum out of range, saturating");
            current.saturating_add(delta)
        });
        x.insert(key.clone(), format_millis(total));
    }
}

/// Add `y` into `x` in place. A `None` on either side is a no-op.
pub fn resource_list_add(x: Option<&mut ResourceList>, y: Option<&ResourceList>) {
    combine(x, y, 1);
}

/// Subtract `y` from `x` in place. Results may go negative.
pub fn resource_list_sub(x: Option<&mut ResourceList>, y: Option<&ResourceList>) {
    combine(x, y, -1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn list(entries: &[(&str, &str)]) -> ResourceList {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    #[rstest]
    #[case::plain("2", 2000)]
    #[case::milli("250m", 250)]
    #[case::fraction("0.5", 500)]
    #[case::kilo("1k", 1_000_000)]
    #[case::kibi("1Ki", 1_024_000)]
    #[case::gibi("1Gi", 1_073_741_824_000)]
    #[case::fractional_gibi("1.5Gi", 1_610_612_736_000)]
    #[case::exponent("1e3", 1_000_000)]
    #[case::negative("-1024", -1_024_000)]
    #[case::sub_milli_rounds_up("0.0001", 1)]
    fn parses_quantities(#[case] raw: &str, #[case] millis: i128) {
        assert_eq!(parse_millis(&Quantity(raw.to_string())).unwrap(), millis);
    }

    #[rstest]
    #[case::empty("")]
    #[case::bad_suffix("12Qi")]
    #[case::two_dots("1.2.3")]
    #[case::no_digits("Gi")]
    fn rejects_invalid_quantities(#[case] raw: &str) {
        assert!(parse_millis(&Quantity(raw.to_string())).is_err());
    }

    #[rstest]
    #[case::huge_exponent("1e2147483647")]
    #[case::huge_negative_exponent("1e-2147483647")]
    #[case::exponent_past_i128("1e40")]
    #[case::binary_past_i128("99999999999999999999999999999Ei")]
    fn out_of_range_quantities_are_rejected(#[case] raw: &str) {
        let err = parse_millis(&Quantity(raw.to_string())).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{raw}: {err}");
    }

    #[test]
    fn sums_past_the_range_saturate() {
        let mut x = list(&[("cpu", "1e35")]);
        let y = list(&[("cpu", "1e35")]);
        resource_list_add(Some(&mut x), Some(&y));
        assert_eq!(x["cpu"].0, format!("{}m", i128::MAX));

        let mut x = list(&[("cpu", "-1e35")]);
        resource_list_sub(Some(&mut x), Some(&y));
        assert_eq!(x["cpu"].0, format!("{}m", i128::MIN));
    }

    #[test]
    fn format_prefers_whole_units() {
        assert_eq!(format_millis(2000).0, "2");
        assert_eq!(format_millis(1500).0, "1500m");
        assert_eq!(format_millis(-1_024_000).0, "-1024");
    }

    #[test]
    fn equal_compares_values_not_spelling() {
        let x = list(&[("cpu", "1"), ("memory", "1Gi")]);
        let y = list(&[("cpu", "1000m"), ("memory", "1024Mi")]);
        assert!(resource_list_equal(Some(&x), Some(&y)));
    }

    #[test]
    fn equal_treats_missing_keys_as_zero() {
        let x = list(&[("cpu", "1"), ("memory", "0")]);
        let y = list(&[("cpu", "1")]);
        assert!(resource_list_equal(Some(&x), Some(&y)));
        assert!(resource_list_equal(Some(&ResourceList::new()), None));
    }

    #[test]
    fn equal_of_nils_is_true() {
        assert!(resource_list_equal(None, None));
    }

    #[rstest]
    #[case::same(&[("cpu", "1")], &[("cpu", "1")])]
    #[case::differs(&[("cpu", "1")], &[("cpu", "2")])]
    #[case::extra_key(&[("cpu", "1"), ("memory", "1Gi")], &[("cpu", "1")])]
    #[case::empty_vs_some(&[], &[("memory", "1Gi")])]
    fn equal_is_symmetric(#[case] x: &[(&str, &str)], #[case] y: &[(&str, &str)]) {
        let (x, y) = (list(x), list(y));
        assert_eq!(
            resource_list_equal(Some(&x), Some(&y)),
            resource_list_equal(Some(&y), Some(&x))
        );
    }

    #[rstest]
    #[case::bigger_everywhere(&[("cpu", "1"), ("memory", "1Ki")], &[("cpu", "2"), ("memory", "2Ki")], true)]
    #[case::bigger_only_on_memory(&[("cpu", "1"), ("memory", "1Ki")], &[("cpu", "1"), ("memory", "2Ki")], false)]
    #[case::bigger_only_on_cpu(&[("cpu", "1"), ("memory", "1Ki")], &[("cpu", "2"), ("memory", "1Ki")], false)]
    #[case::y_empty(&[("cpu", "1")], &[], false)]
    fn less_requires_strictly_smaller_everywhere(
        #[case] x: &[(&str, &str)],
        #[case] y: &[(&str, &str)],
        #[case] expected: bool,
    ) {
        assert_eq!(resource_list_less(Some(&list(x)), Some(&list(y))), expected);
    }

    #[test]
    fn less_than_nil_is_false() {
        let x = list(&[("cpu", "1")]);
        assert!(!resource_list_less(Some(&x), None));
        assert!(!resource_list_less(None, None));
    }

    #[test]
    fn nil_is_less_than_positive_list() {
        let y = list(&[("cpu", "2"), ("memory", "2Ki")]);
        assert!(resource_list_less(None, Some(&y)));
    }

    #[test]
    fn add_fills_missing_keys() {
        let mut x = list(&[("cpu", "1")]);
        let y = list(&[("cpu", "1"), ("memory", "1Ki")]);
        resource_list_add(Some(&mut x), Some(&y));
        assert!(resource_list_equal(
            Some(&x),
            Some(&list(&[("cpu", "2"), ("memory", "1024")]))
        ));
    }

    #[test]
    fn sub_goes_negative_for_missing_keys() {
        let mut x = list(&[("cpu", "2")]);
        let y = list(&[("cpu", "1"), ("memory", "1Ki")]);
        resource_list_sub(Some(&mut x), Some(&y));
        assert!(resource_list_equal(
            Some(&x),
            Some(&list(&[("cpu", "1"), ("memory", "-1024")]))
        ));
    }

    #[test]
    fn add_with_nil_side_is_noop() {
        let mut x = list(&[("cpu", "1")]);
        let before = x.clone();
        resource_list_add(Some(&mut x), None);
        assert_eq!(x, before);

        // nothing to mutate, nothing to panic on
        resource_list_add(None, Some(&before));
        resource_list_sub(None, Some(&before));
    }

    #[rstest]
    #[case::disjoint(&[("cpu", "1")], &[("memory", "512Mi")])]
    #[case::overlapping(&[("cpu", "1500m"), ("memory", "1Gi")], &[("cpu", "250m"), ("memory", "3Gi")])]
    #[case::empty_x(&[], &[("pods", "110")])]
    fn add_then_sub_restores_original(#[case] x: &[(&str, &str)], #[case] y: &[(&str, &str)]) {
        let original = list(x);
        let y = list(y);
        let mut working = original.clone();

        resource_list_add(Some(&mut working), Some(&y));
        resource_list_sub(Some(&mut working), Some(&y));

        assert!(resource_list_equal(Some(&working), Some(&original)));
    }
}
