//! Deterministic element-wise summation across ranks
//!
//! Every rank sums the same inputs in the same rank order, so all ranks end
//! up with bit-identical results even for floating point. Half-precision
//! types accumulate in `f32` and round once at the end.

use half::{bf16, f16};
use rayon::prelude::*;

use crate::tensor::TensorElement;

/// Elements per rayon task when reducing in parallel
const PAR_CHUNK: usize = 16 * 1024;

/// Element types `allreduce` can sum
pub trait ReduceElement: TensorElement {
    type Acc: Copy;

    fn widen(self) -> Self::Acc;
    fn accumulate(acc: Self::Acc, value: Self) -> Self::Acc;
    fn narrow(acc: Self::Acc) -> Self;
}

macro_rules! impl_reduce_native {
    ($($t:ty),*) => {
        $(
            impl ReduceElement for $t {
                type Acc = $t;

                #[inline]
                fn widen(self) -> $t {
                    self
                }

                #[inline]
                fn accumulate(acc: $t, value: $t) -> $t {
                    acc + value
                }

                #[inline]
                fn narrow(acc: $t) -> $t {
                    acc
                }
            }
        )*
    };
}

macro_rules! impl_reduce_wrapping {
    ($($t:ty),*) => {
        $(
            impl ReduceElement for $t {
                type Acc = $t;

                #[inline]
                fn widen(self) -> $t {
                    self
                }

                #[inline]
                fn accumulate(acc: $t, value: $t) -> $t {
                    acc.wrapping_add(value)
                }

                #[inline]
                fn narrow(acc: $t) -> $t {
                    acc
                }
            }
        )*
    };
}

macro_rules! impl_reduce_half {
    ($($t:ty),*) => {
        $(
            impl ReduceElement for $t {
                type Acc = f32;

                #[inline]
                fn widen(self) -> f32 {
                    self.to_f32()
                }

                #[inline]
                fn accumulate(acc: f32, value: $t) -> f32 {
                    acc + value.to_f32()
                }

                #[inline]
                fn narrow(acc: f32) -> $t {
                    <$t>::from_f32(acc)
                }
            }
        )*
    };
}

impl_reduce_native!(f32, f64);
impl_reduce_wrapping!(i32, i64);
impl_reduce_half!(f16, bf16);

/// `out[i] = inputs[0][i] + inputs[1][i] + ...`, summed left to right
///
/// Ranges of at least `parallel_threshold` elements are split across the
/// rayon pool; the per-element order does not change.
///
/// # Panics
/// If `inputs` is empty or any input is shorter than `out`.
pub fn sum_into<T: ReduceElement>(out: &mut [T], inputs: &[&[T]], parallel_threshold: usize) {
    assert!(!inputs.is_empty(), "sum_into needs at least one input");
    assert!(inputs.iter().all(|s| s.len() >= out.len()));

    if out.len() >= parallel_threshold.max(1) && out.len() > PAR_CHUNK {
        out.par_chunks_mut(PAR_CHUNK)
            .enumerate()
            .for_each(|(i, chunk)| sum_range(chunk, inputs, i * PAR_CHUNK));
    } else {
        sum_range(out, inputs, 0);
    }
}

fn sum_range<T: ReduceElement>(out: &mut [T], inputs: &[&[T]], start: usize) {
    let Some((first, rest)) = inputs.split_first() else {
        return;
    };
    for (i, slot) in out.iter_mut().enumerate() {
        let idx = start + i;
        let mut acc = first[idx].widen();
        for input in rest {
            acc = T::accumulate(acc, input[idx]);
        }
        *slot = T::narrow(acc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_sum_f32() {
        let a = [1.0f32, 2.0];
        let b = [3.0f32, 4.0];
        let mut out = [0.0f32; 2];
        sum_into(&mut out, &[&a, &b], usize::MAX);
        assert_eq!(out, [4.0, 6.0]);
    }

    #[test]
    fn test_single_input_is_copy() {
        let a = [7i64, -3, 0];
        let mut out = [0i64; 3];
        sum_into(&mut out, &[&a], usize::MAX);
        assert_eq!(out, a);
    }

    #[test]
    fn test_integer_sum_wraps() {
        let a = [i32::MAX];
        let b = [1i32];
        let mut out = [0i32];
        sum_into(&mut out, &[&a, &b], usize::MAX);
        assert_eq!(out, [i32::MIN]);
    }

    #[test]
    fn test_half_accumulates_in_f32() {
        // 2048 + 1 + 1 is not representable step by step in f16 (2049 rounds
        // to 2048), but is exact when accumulated in f32 and rounded once.
        let a = [f16::from_f32(2048.0)];
        let b = [f16::from_f32(1.0)];
        let c = [f16::from_f32(1.0)];
        let mut out = [f16::ZERO];
        sum_into(&mut out, &[&a, &b, &c], usize::MAX);
        assert_eq!(out[0].to_f32(), 2050.0);

        let a = [bf16::from_f32(1.5)];
        let b = [bf16::from_f32(2.5)];
        let mut out = [bf16::ZERO];
        sum_into(&mut out, &[&a, &b], usize::MAX);
        assert_eq!(out[0].to_f32(), 4.0);
    }

    #[test]
    fn test_parallel_matches_serial() {
        let n = PAR_CHUNK * 3 + 17;
        let inputs: Vec<Vec<f32>> = (0..4)
            .map(|r| (0..n).map(|i| (i as f32) * 0.1 + r as f32 * 1e-3).collect())
            .collect();
        let refs: Vec<&[f32]> = inputs.iter().map(|v| v.as_slice()).collect();

        let mut serial = vec![0.0f32; n];
        sum_into(&mut serial, &refs, usize::MAX);
        let mut parallel = vec![0.0f32; n];
        sum_into(&mut parallel, &refs, 1);

        assert_eq!(
            bytemuck::cast_slice::<f32, u8>(&serial),
            bytemuck::cast_slice::<f32, u8>(&parallel)
        );
    }

    proptest! {
        #[test]
        fn prop_integer_sum_is_exact(
            rows in prop::collection::vec(prop::collection::vec(-1000i64..1000, 64), 1..8)
        ) {
            let refs: Vec<&[i64]> = rows.iter().map(|v| v.as_slice()).collect();
            let mut out = vec![0i64; 64];
            sum_into(&mut out, &refs, 8);
            for i in 0..64 {
                let expected: i64 = rows.iter().map(|r| r[i]).sum();
                prop_assert_eq!(out[i], expected);
            }
        }

        #[test]
        fn prop_float_sum_follows_rank_order(
            rows in prop::collection::vec(prop::collection::vec(-1.0e6f64..1.0e6, 16), 1..8)
        ) {
            let refs: Vec<&[f64]> = rows.iter().map(|v| v.as_slice()).collect();
            let mut out = vec![0.0f64; 16];
            sum_into(&mut out, &refs, usize::MAX);
            for i in 0..16 {
                let mut expected = rows[0][i];
                for r in &rows[1..] {
                    expected += r[i];
                }
                prop_assert_eq!(out[i].to_bits(), expected.to_bits());
            }
        }
    }
}
