//! Range arithmetic shared by list and string slicing.

/// A resolved range over a sequence of known length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeExtent {
    /// First element index.
    pub start: usize,
    /// Number of elements covered.
    pub length: usize,
    /// +1 for ascending ranges, -1 for descending, 0 for empty.
    pub step: i32,
}

/// Resolve a numeric range against a sequence of `length` elements.
///
/// Endpoints must be integers; negative endpoints count back from the end.
/// An exclusive range whose endpoints coincide is empty, and descending
/// ranges are permitted. On failure the error names the offending
/// endpoint, e.g. `"Range start out of bounds."`.
pub fn range_extent(
    from: f64,
    to: f64,
    is_inclusive: bool,
    length: usize,
) -> Result<RangeExtent, String> {
    // Edge case: a range addressing just past the end of the sequence
    // selects nothing.
    if from == length as f64 && to == if is_inclusive { -1.0 } else { length as f64 } {
        return Ok(RangeExtent { start: 0, length: 0, step: 0 });
    }

    let start = resolve_index(from, length, "Range start")?;

    let mut end = require_int(to, "Range end")?;
    if end < 0.0 {
        end += length as f64;
    }
    if !is_inclusive {
        if end == start as f64 {
            return Ok(RangeExtent { start, length: 0, step: 0 });
        }
        end += if end >= start as f64 { -1.0 } else { 1.0 };
    }
    let end = resolve_index(end, length, "Range end")?;

    let step = if end >= start { 1 } else { -1 };
    let length = start.abs_diff(end) + 1;
    Ok(RangeExtent { start, length, step })
}

/// Resolve a single subscript index, allowing negative values to count
/// back from the end. `label` names the index in error messages.
pub fn resolve_index(value: f64, length: usize, label: &str) -> Result<usize, String> {
    let value = require_int(value, label)?;
    let index = if value < 0.0 { value + length as f64 } else { value };
    if index >= 0.0 && index < length as f64 {
        Ok(index as usize)
    } else {
        Err(format!("{label} out of bounds."))
    }
}

fn require_int(value: f64, label: &str) -> Result<f64, String> {
    if value.trunc() == value && value.is_finite() {
        Ok(value)
    } else {
        Err(format!("{label} must be an integer."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inclusive_forward() {
        let extent = range_extent(1.0, 3.0, true, 5).unwrap();
        assert_eq!(extent, RangeExtent { start: 1, length: 3, step: 1 });
    }

    #[test]
    fn test_exclusive_forward() {
        let extent = range_extent(0.0, 5.0, false, 5).unwrap();
        assert_eq!(extent, RangeExtent { start: 0, length: 5, step: 1 });
    }

    #[test]
    fn test_full_copy_idioms() {
        // 0..-1 copies the whole sequence.
        let extent = range_extent(0.0, -1.0, true, 4).unwrap();
        assert_eq!(extent, RangeExtent { start: 0, length: 4, step: 1 });

        // 0...count also copies the whole sequence.
        let extent = range_extent(0.0, 4.0, false, 4).unwrap();
        assert_eq!(extent, RangeExtent { start: 0, length: 4, step: 1 });
    }

    #[test]
    fn test_empty_exclusive_when_equal() {
        let extent = range_extent(2.0, 2.0, false, 5).unwrap();
        assert_eq!(extent.length, 0);
        assert_eq!(extent.step, 0);
    }

    #[test]
    fn test_descending() {
        let extent = range_extent(3.0, 1.0, true, 5).unwrap();
        assert_eq!(extent, RangeExtent { start: 3, length: 3, step: -1 });
    }

    #[test]
    fn test_empty_range_at_end() {
        let extent = range_extent(4.0, -1.0, true, 4).unwrap();
        assert_eq!(extent.length, 0);
    }

    #[test]
    fn test_out_of_bounds() {
        let err = range_extent(0.0, 9.0, true, 4).unwrap_err();
        assert_eq!(err, "Range end out of bounds.");
        let err = range_extent(9.0, 0.0, true, 4).unwrap_err();
        assert_eq!(err, "Range start out of bounds.");
    }

    #[test]
    fn test_non_integer_endpoint() {
        let err = range_extent(0.5, 2.0, true, 4).unwrap_err();
        assert_eq!(err, "Range start must be an integer.");
    }

    #[test]
    fn test_resolve_negative_index() {
        assert_eq!(resolve_index(-1.0, 4, "Index").unwrap(), 3);
        assert_eq!(
            resolve_index(-5.0, 4, "Index").unwrap_err(),
            "Index out of bounds."
        );
    }
}
