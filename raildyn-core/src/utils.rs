use crate::si;

/// Returns the file and line of the call site, optionally with the value of
/// an expression appended. Used to tag simulation error messages.
#[macro_export]
macro_rules! format_dbg {
    () => {
        format!("{}:{}", file!(), line!())
    };
    ($dbg_expr:expr) => {
        format!(
            "{}:{}\n{} = {:?}",
            file!(),
            line!(),
            stringify!($dbg_expr),
            $dbg_expr
        )
    };
}

/// Error tolerance for relative comparisons.
pub const ACCEPTED_ERR: f64 = 1e-8;

/// Returns true if `a` and `b` are equal within `epsilon` (relative where
/// meaningful, absolute near zero).
pub fn almost_eq(a: f64, b: f64, epsilon: Option<f64>) -> bool {
    let epsilon = epsilon.unwrap_or(ACCEPTED_ERR);
    ((b - a) / (b + a)).abs() < epsilon || (b - a).abs() < epsilon
}

/// [almost_eq] for uom quantities of any dimension.
pub fn almost_eq_uom<D, U>(
    a: &uom::si::Quantity<D, U, f64>,
    b: &uom::si::Quantity<D, U, f64>,
    epsilon: Option<f64>,
) -> bool
where
    D: uom::si::Dimension + ?Sized,
    U: uom::si::Units<f64> + ?Sized,
{
    almost_eq(a.value, b.value, epsilon)
}

/// Three-valued sign, with `sign(0.0) == 0.0`.
pub fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Seconds value of a time quantity; the update loops run on per-second rate
/// constants.
pub fn secs(t: si::Time) -> f64 {
    t.get::<si::second>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_almost_eq() {
        assert!(almost_eq(1.0, 1.0 + 1e-10, None));
        assert!(!almost_eq(1.0, 1.1, None));
        assert!(almost_eq(0.0, 1e-12, None));
    }

    #[test]
    fn test_sign() {
        assert_eq!(sign(3.5), 1.0);
        assert_eq!(sign(-0.1), -1.0);
        assert_eq!(sign(0.0), 0.0);
    }
}
