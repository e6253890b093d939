//! Load-time validation toolkit. Objects are checked when constructed or
//! deserialized; the simulation loop itself assumes validated data.

use crate::imports::*;

/// Collected validation failures for one object graph.
#[derive(Debug, Default)]
pub struct ValidationErrors(pub Vec<anyhow::Error>);

pub type ValidationResults = std::result::Result<(), ValidationErrors>;

impl ValidationErrors {
    pub fn new() -> Self {
        Self(Vec::new())
    }
    pub fn push(&mut self, error: anyhow::Error) {
        self.0.push(error);
    }
    pub fn append(&mut self, mut other: ValidationErrors) {
        self.0.append(&mut other.0);
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    /// Converts accumulated errors into a result.
    pub fn make_err(self) -> ValidationResults {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} validation error(s):", self.0.len())?;
        for error in &self.0 {
            writeln!(f, "- {error}")?;
        }
        Ok(())
    }
}

/// Provides a known-good instance for tests and fixtures.
pub trait Valid: Sized + Default {
    fn valid() -> Self {
        Self::default()
    }
}

/// Object state checks. Fake objects are placeholders (e.g. index zero
/// sentinels or the fake first arena element) that skip validation.
pub trait ObjState {
    fn is_fake(&self) -> bool {
        false
    }
    fn validate(&self) -> ValidationResults {
        Ok(())
    }
}

/// Returns early with `Ok(())` if the object is fake.
#[macro_export]
macro_rules! early_fake_ok {
    ($self:expr) => {
        if $self.is_fake() {
            return Ok(());
        }
    };
}
pub use early_fake_ok;

pub fn validate_field_real<T: ObjState>(errors: &mut ValidationErrors, field: &T, name: &str) {
    if field.is_fake() {
        errors.push(anyhow!("{} must be real!", name));
    } else if let Err(sub) = field.validate() {
        errors.push(anyhow!("{} is invalid:\n{}", name, sub));
    }
}

pub fn validate_field_fake<T: ObjState>(errors: &mut ValidationErrors, field: &T, name: &str) {
    if !field.is_fake() {
        errors.push(anyhow!("{} must be fake!", name));
    }
}

pub fn validate_slice_real<T: ObjState>(errors: &mut ValidationErrors, slice: &[T], name: &str) {
    for (idx, obj) in slice.iter().enumerate() {
        validate_field_real(errors, obj, &format!("{name} [{idx}]"));
    }
}

pub fn chk_num_fin(errors: &mut ValidationErrors, val: f64, name: &str) {
    if !val.is_finite() {
        errors.push(anyhow!("{} = {} must be finite!", name, val));
    }
}

pub fn chk_num_gez(errors: &mut ValidationErrors, val: f64, name: &str) {
    if !(val >= 0.0) {
        errors.push(anyhow!("{} = {} must be >= 0!", name, val));
    }
}

pub fn chk_num_gtz(errors: &mut ValidationErrors, val: f64, name: &str) {
    if !(val > 0.0) {
        errors.push(anyhow!("{} = {} must be > 0!", name, val));
    }
}

pub fn chk_num_eqz(errors: &mut ValidationErrors, val: f64, name: &str) {
    if val != 0.0 {
        errors.push(anyhow!("{} = {} must be = 0!", name, val));
    }
}

pub fn si_chk_num_fin<D, U>(
    errors: &mut ValidationErrors,
    val: &uom::si::Quantity<D, U, f64>,
    name: &str,
) where
    D: uom::si::Dimension + ?Sized,
    U: uom::si::Units<f64> + ?Sized,
{
    chk_num_fin(errors, val.value, name);
}

pub fn si_chk_num_gez<D, U>(
    errors: &mut ValidationErrors,
    val: &uom::si::Quantity<D, U, f64>,
    name: &str,
) where
    D: uom::si::Dimension + ?Sized,
    U: uom::si::Units<f64> + ?Sized,
{
    chk_num_fin(errors, val.value, name);
    chk_num_gez(errors, val.value, name);
}

pub fn si_chk_num_gtz<D, U>(
    errors: &mut ValidationErrors,
    val: &uom::si::Quantity<D, U, f64>,
    name: &str,
) where
    D: uom::si::Dimension + ?Sized,
    U: uom::si::Units<f64> + ?Sized,
{
    chk_num_fin(errors, val.value, name);
    chk_num_gtz(errors, val.value, name);
}

pub fn si_chk_num_eqz<D, U>(
    errors: &mut ValidationErrors,
    val: &uom::si::Quantity<D, U, f64>,
    name: &str,
) where
    D: uom::si::Dimension + ?Sized,
    U: uom::si::Units<f64> + ?Sized,
{
    chk_num_eqz(errors, val.value, name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_err() {
        let mut errors = ValidationErrors::new();
        assert!(errors.is_empty());
        errors.push(anyhow!("bad"));
        assert!(errors.make_err().is_err());
        assert!(ValidationErrors::new().make_err().is_ok());
    }

    #[test]
    fn test_chk_num() {
        let mut errors = ValidationErrors::new();
        chk_num_gez(&mut errors, -1.0, "x");
        chk_num_gtz(&mut errors, 0.0, "y");
        chk_num_fin(&mut errors, f64::NAN, "z");
        assert_eq!(errors.0.len(), 3);
    }
}
