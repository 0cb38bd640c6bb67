/// Requantizes an int32 accumulator to int8: `sat(round(alpha * acc + addend))`.
///
/// Rounds half to even, matching the device conversion instructions used by
/// vendor int8 GEMM epilogues.
#[inline]
pub fn requantize_s8(acc: i32, alpha: f32, addend: f32) -> i8 {
    let value = (alpha * acc as f32 + addend).round_ties_even();
    value.clamp(i8::MIN as f32, i8::MAX as f32) as i8
}
