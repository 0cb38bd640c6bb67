use std::sync::Arc;

use qgemm::qgemm::FusedBackend;
use qgemm_backend_ref_cpu::{reference_backends, RefLtBackend};
use qgemm_backend_tests::{define_backend_tests, BackendFixture};

fn with_fused() -> BackendFixture<RefLtBackend> {
    let (driver, generic, fused) = reference_backends();
    BackendFixture {
        driver,
        generic,
        fused: Some(fused as Arc<dyn FusedBackend>),
    }
}

fn generic_only() -> BackendFixture<RefLtBackend> {
    let (driver, generic, _) = reference_backends();
    BackendFixture {
        driver,
        generic,
        fused: None,
    }
}

define_backend_tests!(ref_cpu_with_fused, with_fused);
define_backend_tests!(ref_cpu_generic_only, generic_only);
