//! Shared shape helpers used by the dispatcher and the backends.

/// Computes `product(dims)` with overflow checking.
pub fn checked_element_count_or_error<E, F>(dims: &[usize], mut on_overflow: F) -> Result<usize, E>
where
    F: FnMut() -> E,
{
    let mut count = 1usize;
    for dim in dims {
        count = count.checked_mul(*dim).ok_or_else(&mut on_overflow)?;
    }
    Ok(count)
}

/// Converts a dimension to the `i32` range expected by vendor GEMM entry points.
pub fn dim_to_i32_or_error<E, F>(value: usize, mut on_overflow: F) -> Result<i32, E>
where
    F: FnMut() -> E,
{
    i32::try_from(value).map_err(|_| on_overflow())
}
