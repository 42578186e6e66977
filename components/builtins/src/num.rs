//! Number semantics: textual formatting and bitwise coercion.

/// Format a number the way scripts observe it.
///
/// This matches the C `%.14g` conversion: up to fourteen significant
/// digits, fixed notation for exponents in `[-4, 14)`, scientific notation
/// with a sign and at least two exponent digits otherwise. NaN and the
/// infinities serialize as `"nan"`, `"infinity"`, and `"-infinity"`.
///
/// # Examples
///
/// ```
/// use builtins::num_to_string;
///
/// assert_eq!(num_to_string(7.0), "7");
/// assert_eq!(num_to_string(3.14), "3.14");
/// assert_eq!(num_to_string(1e20), "1e+20");
/// assert_eq!(num_to_string(f64::NAN), "nan");
/// ```
pub fn num_to_string(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 {
            "infinity".to_string()
        } else {
            "-infinity".to_string()
        };
    }
    if value == 0.0 {
        return if value.is_sign_negative() {
            "-0".to_string()
        } else {
            "0".to_string()
        };
    }

    format_g(value, 14)
}

/// `%.<precision>g`-style formatting for a finite, non-zero value.
fn format_g(value: f64, precision: usize) -> String {
    let negative = value < 0.0;
    let magnitude = value.abs();

    // Round to the requested number of significant digits by going through
    // exponential notation, then reassemble.
    let formatted = format!("{:.*e}", precision - 1, magnitude);
    let (mantissa, exponent) = formatted
        .split_once('e')
        .expect("exponential format always contains 'e'");
    let exponent: i32 = exponent.parse().expect("exponent is an integer");

    // All significant digits without the decimal point, trailing zeros
    // stripped.
    let mut digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    while digits.len() > 1 && digits.ends_with('0') {
        digits.pop();
    }

    let body = if exponent < -4 || exponent >= precision as i32 {
        scientific(&digits, exponent)
    } else {
        fixed(&digits, exponent)
    };

    if negative {
        format!("-{body}")
    } else {
        body
    }
}

fn scientific(digits: &str, exponent: i32) -> String {
    let mantissa = if digits.len() == 1 {
        digits.to_string()
    } else {
        format!("{}.{}", &digits[..1], &digits[1..])
    };
    format!("{mantissa}e{}{:02}", if exponent < 0 { '-' } else { '+' }, exponent.abs())
}

fn fixed(digits: &str, exponent: i32) -> String {
    if exponent < 0 {
        let zeros = "0".repeat((-exponent - 1) as usize);
        return format!("0.{zeros}{digits}");
    }

    let point = exponent as usize + 1;
    if point >= digits.len() {
        let mut s = digits.to_string();
        s.push_str(&"0".repeat(point - digits.len()));
        s
    } else {
        format!("{}.{}", &digits[..point], &digits[point..])
    }
}

/// Reinterpret a number as the 32-bit unsigned integer the bitwise
/// operators work on. The double is truncated toward zero and wrapped.
pub fn num_bits_to_u32(value: f64) -> u32 {
    if !value.is_finite() {
        return 0;
    }
    value as i64 as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_have_no_point() {
        assert_eq!(num_to_string(0.0), "0");
        assert_eq!(num_to_string(7.0), "7");
        assert_eq!(num_to_string(-12.0), "-12");
        assert_eq!(num_to_string(123456789.0), "123456789");
    }

    #[test]
    fn test_negative_zero_keeps_sign() {
        assert_eq!(num_to_string(-0.0), "-0");
    }

    #[test]
    fn test_fractions() {
        assert_eq!(num_to_string(3.14), "3.14");
        assert_eq!(num_to_string(0.1), "0.1");
        assert_eq!(num_to_string(-0.25), "-0.25");
        assert_eq!(num_to_string(1.0 / 3.0), "0.33333333333333");
    }

    #[test]
    fn test_large_magnitudes_go_scientific() {
        assert_eq!(num_to_string(1e20), "1e+20");
        assert_eq!(num_to_string(1.25e14), "1.25e+14");
        assert_eq!(num_to_string(99999999999999.0), "99999999999999");
    }

    #[test]
    fn test_small_magnitudes_go_scientific() {
        assert_eq!(num_to_string(1e-7), "1e-07");
        assert_eq!(num_to_string(2.5e-8), "2.5e-08");
        assert_eq!(num_to_string(0.0001), "0.0001");
    }

    #[test]
    fn test_specials() {
        assert_eq!(num_to_string(f64::NAN), "nan");
        assert_eq!(num_to_string(f64::INFINITY), "infinity");
        assert_eq!(num_to_string(f64::NEG_INFINITY), "-infinity");
    }

    #[test]
    fn test_round_trip_through_parse() {
        for n in [1.5, -2.75, 1234.5678, 0.001, 123456789012.25] {
            let text = num_to_string(n);
            let parsed: f64 = text.parse().unwrap();
            assert_eq!(parsed, n, "{text}");
        }
    }

    #[test]
    fn test_bitwise_coercion() {
        assert_eq!(num_bits_to_u32(0.0), 0);
        assert_eq!(num_bits_to_u32(1.9), 1);
        assert_eq!(num_bits_to_u32(-1.0), 0xFFFF_FFFF);
        assert_eq!(num_bits_to_u32(4294967296.0), 0);
        assert_eq!(num_bits_to_u32(f64::NAN), 0);
    }
}
