//! Canonicalization of upstream identifiers and box quantities.
//!
//! The upstream export is hand-maintained: codes arrive with stray
//! whitespace, invisible Unicode from copy-paste, and sometimes a leading
//! `*` marker; quantities arrive as numbers or comma-decimal strings.
//! Everything here is pure so the reconciler can be replayed byte-for-byte.

/// Units per box, per product code. Codes not listed ship as single units.
const PRODUCT_PACK_SIZE: &[(&str, i64)] = &[
    ("BUR11", 30),
    ("BUR13", 40),
    ("BUR4", 2),
    ("BUR5", 8),
    ("BUR6", 3),
    ("BUR7", 10),
    ("MOZ28", 8),
    ("MOZ30", 9),
    ("MOZ5", 12),
    ("MOZ6", 9),
    ("MOZ8", 10),
    ("RIC3", 6),
    ("MOH1", 9),
    ("MOH10", 3),
];

pub(crate) fn units_per_pack(code: &str) -> i64 {
    PRODUCT_PACK_SIZE
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, n)| *n)
        .unwrap_or(1)
}

fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' | '\u{00A0}'
    )
}

/// Canonical form of a raw agent or product code.
///
/// Uppercase, drop one leading `*` marker, then drop all whitespace and
/// invisible characters. Same input always yields the same output.
pub(crate) fn clean_code(raw: &str) -> String {
    let mut s: &str = raw;
    if let Some(rest) = s.strip_prefix('*') {
        s = rest;
    }
    s.chars()
        .filter(|c| !c.is_whitespace() && !is_invisible(*c))
        .flat_map(char::to_uppercase)
        .collect()
}

/// Coerces an upstream quantity field (number, or string with an optional
/// comma decimal separator) to whole boxes. Partial boxes are floored away,
/// never rounded up; anything unparseable counts as zero.
pub(crate) fn parse_boxes(raw: &serde_json::Value) -> i64 {
    let parsed = match raw {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => (v.floor() as i64).max(0),
        _ => 0,
    }
}

/// Boxes reported upstream converted to atomic units.
pub(crate) fn final_units(code: &str, raw_qty: &serde_json::Value) -> i64 {
    parse_boxes(raw_qty) * units_per_pack(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_code_uppercases_and_strips() {
        assert_eq!(clean_code(" moz30 "), "MOZ30");
        assert_eq!(clean_code("*BUR11"), "BUR11");
        assert_eq!(clean_code("b u r 4"), "BUR4");
        assert_eq!(clean_code("MOZ\u{200B}5\u{FEFF}"), "MOZ5");
        assert_eq!(clean_code("MOZ\u{00A0}8"), "MOZ8");
    }

    #[test]
    fn clean_code_is_deterministic() {
        let raw = "*\u{200C} ric3 ";
        assert_eq!(clean_code(raw), clean_code(raw));
        assert_eq!(clean_code(raw), "RIC3");
    }

    #[test]
    fn parse_boxes_floors_and_accepts_comma_decimal() {
        assert_eq!(parse_boxes(&json!(2)), 2);
        assert_eq!(parse_boxes(&json!(2.9)), 2);
        assert_eq!(parse_boxes(&json!("3,7")), 3);
        assert_eq!(parse_boxes(&json!("4.2")), 4);
    }

    #[test]
    fn parse_boxes_coerces_garbage_to_zero() {
        assert_eq!(parse_boxes(&json!("n/a")), 0);
        assert_eq!(parse_boxes(&json!(null)), 0);
        assert_eq!(parse_boxes(&json!([1])), 0);
        assert_eq!(parse_boxes(&json!(-3)), 0);
    }

    #[test]
    fn final_units_applies_pack_size() {
        // MOZ30 ships 9 units per box.
        assert_eq!(final_units("MOZ30", &json!(2)), 18);
        // Unknown codes default to 1 unit per box.
        assert_eq!(final_units("XYZ", &json!(5)), 5);
        // 0.9 of a box is no box at all.
        assert_eq!(final_units("MOZ30", &json!(0.9)), 0);
    }
}
