pub mod fixtures;
pub mod suite;

pub use fixtures::BackendFixture;

/// Expands the shared quantized GEMM suite into `#[test]`s for one backend.
///
/// `$fixture_ctor` is called once per test and must return a
/// [`BackendFixture`].
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $fixture_ctor:expr) => {
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::suite;

            macro_rules! suite_test {
                ($name:ident) => {
                    #[test]
                    fn $name() {
                        let fixture = ($fixture_ctor)();
                        suite::$name(&fixture);
                    }
                };
            }

            suite_test!(end_to_end_dequantizes_to_128);
            suite_test!(unit_scales_saturate_at_127);
            suite_test!(generic_path_layout_matches_reference);
            suite_test!(fused_and_fallback_agree);
            suite_test!(unaligned_shape_matches_reference);
            suite_test!(rank3_activation_flattens_leading_dims);
            suite_test!(empty_activation_returns_empty_output);
            suite_test!(repeated_calls_reuse_caches);
            suite_test!(kernel_table_dispatches_by_rank);
        }
    };
}
