/// Structural Comparator
///
/// **Core Responsibility:**
/// Decide whether an observed JSON value matches the expected one.
///
/// **Rules:**
/// - Scalars: value equality. Numbers compare by value (`1` equals `1.0`),
///   except under `any_order`, where an integer never equals a float
/// - Objects: identical key sets, values compared recursively (key order never matters)
/// - Arrays, `any_order = false`: pairwise by position, lengths must match
/// - Arrays, `any_order = true`: every element on each side has *some* equal
///   element on the other side
/// - Any type mismatch at any depth: not equal
///
/// **Known limitation:**
/// The any-order rule is a bidirectional existential match, not a multiset
/// comparison. `[1, 1, 2]` matches `[1, 2, 2]`. Test banks already rely on
/// this, so it is kept as is.
use serde_json::Value;

/// Compare `expected` against `actual`.
pub fn equal(expected: &Value, actual: &Value, any_order: bool) -> bool {
    match (expected, actual) {
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, left)| match b.get(key) {
                    Some(right) => equal(left, right, any_order),
                    None => false,
                })
        }
        (Value::Array(a), Value::Array(b)) => {
            if any_order {
                a.iter().all(|left| b.iter().any(|right| equal(left, right, any_order)))
                    && b.iter().all(|right| a.iter().any(|left| equal(right, left, any_order)))
            } else {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(left, right)| equal(left, right, any_order))
            }
        }
        (Value::Number(a), Value::Number(b)) => {
            if any_order && a.is_f64() != b.is_f64() {
                return false;
            }
            numbers_equal(a, b)
        }
        (Value::Object(_), _) | (Value::Array(_), _) => false,
        (_, Value::Object(_)) | (_, Value::Array(_)) => false,
        (left, right) => left == right,
    }
}

/// `1` and `1.0` are the same number once decoded.
fn numbers_equal(a: &serde_json::Number, b: &serde_json::Number) -> bool {
    if a == b {
        return true;
    }
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}
