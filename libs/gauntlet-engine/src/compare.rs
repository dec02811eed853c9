/// Value Comparison - Runtime-Agnostic Equality
///
/// **Core Responsibility:**
/// Decide whether an actual value matches an expected value.
///
/// **Rules:**
/// - Integers and floats compare equal when numerically equal (`5 == 5.0`)
/// - Booleans never equal numbers
/// - Arrays compare element-wise in order, objects key-wise regardless of order
/// - Everything else is strict JSON equality
///
/// Pure functions: the query runner uses them in-process and the
/// subprocess harnesses embed the same rules in their own language.
use serde_json::Value;

/// Structural equality with numeric cross-type tolerance
pub fn deep_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(key, x)| b.get(key).map_or(false, |y| deep_equal(x, y)))
        }
        _ => actual == expected,
    }
}

/// Stable canonical string for ordering rows. Integral floats are rendered
/// as integers so that `1` and `1.0` sort into the same position.
pub fn canonical_key(value: &Value) -> String {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_key).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{:?}:{}", k, canonical_key(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        other => other.to_string(),
    }
}

/// Sort rows by their canonical key
pub fn canonical_sort(rows: &mut [Value]) {
    rows.sort_by_cached_key(canonical_key);
}

/// Compare two result sets, optionally ignoring row order
pub fn rows_equal(actual: &[Value], expected: &[Value], order_matters: bool) -> bool {
    if actual.len() != expected.len() {
        return false;
    }

    if order_matters {
        return actual.iter().zip(expected).all(|(a, e)| deep_equal(a, e));
    }

    let mut actual_sorted = actual.to_vec();
    let mut expected_sorted = expected.to_vec();
    canonical_sort(&mut actual_sorted);
    canonical_sort(&mut expected_sorted);

    actual_sorted
        .iter()
        .zip(&expected_sorted)
        .all(|(a, e)| deep_equal(a, e))
}
