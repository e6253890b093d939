//! Shared test helpers for object state cases.

use crate::imports::*;

/// Enumerates real and fake instances of a type for state checks.
pub trait Cases: ObjState + Valid {
    fn real_cases() -> Vec<Self> {
        vec![Self::valid()]
    }
    fn fake_cases() -> Vec<Self> {
        vec![]
    }
}

/// Asserts that all real cases validate and all fake cases report fake.
#[macro_export]
macro_rules! check_cases {
    ($T:ty) => {
        for case in <$T as $crate::testing::Cases>::real_cases() {
            assert!(!case.is_fake());
            case.validate().unwrap();
        }
        for case in <$T as $crate::testing::Cases>::fake_cases() {
            assert!(case.is_fake());
        }
    };
}
pub use check_cases;
