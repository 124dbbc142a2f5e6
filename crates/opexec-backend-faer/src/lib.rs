//! faer-backed fully-connected implementations.
//!
//! Linking this crate registers two implementations ahead of the reference catch-all:
//! a shape-agnostic GEMM for plain `f32` problems and a shape-dependent row-blocked kernel
//! that also runs post-ops and decompressed weights.

use faer::linalg::matmul::matmul;
use faer::mat::{MatMut, MatRef};
use faer::{Accum, Par};
use opexec::executor::{ImplementationPtr, ImplementationRegistrar};
use opexec::FcAttrs;
use opexec_backend_ref_cpu::FcProblem;

pub mod blocked;
pub mod gemm;
pub mod primitive;

pub use blocked::{FaerBlockedExecutor, FaerBlockedFullyConnected};
pub use gemm::{FaerGemmExecutor, FaerGemmFullyConnected};
pub use primitive::{gemm_variant, FaerGemmKey, FaerGemmPrimitive};

pub const GEMM_PRIORITY: u32 = 100;
pub const BLOCKED_PRIORITY: u32 = 200;

fn faer_parallelism() -> Par {
    let par = faer::get_global_parallelism();
    if par.degree() == 1 {
        Par::Seq
    } else {
        par
    }
}

/// `out[m, n] = src[m, k] * packed[n, k]^T`, all row-major.
pub(crate) fn gemm_into(par: Par, src: &[f32], packed: &[f32], problem: FcProblem, out: &mut [f32]) {
    let FcProblem { m, k, n } = problem;
    if m == 0 || n == 0 {
        return;
    }
    let lhs_view = MatRef::from_row_major_slice(src, m, k);
    let rhs_view = MatRef::from_row_major_slice(packed, n, k);

    // C^T = W * A^T in column-major (n x m) shares its buffer layout with row-major C.
    let a_t = lhs_view.transpose();
    let mut out_view = MatMut::from_column_major_slice_mut(out, n, m);
    matmul(&mut out_view, Accum::Replace, rhs_view, a_t, 1.0f32, par);
}

fn faer_gemm() -> ImplementationPtr<FcAttrs> {
    std::sync::Arc::new(FaerGemmFullyConnected)
}

fn faer_blocked() -> ImplementationPtr<FcAttrs> {
    std::sync::Arc::new(FaerBlockedFullyConnected)
}

#[opexec::linkme::distributed_slice(opexec::fullyconnected::FULLYCONNECTED_REGISTRARS)]
static REGISTER_FAER_GEMM: ImplementationRegistrar<FcAttrs> = ImplementationRegistrar {
    priority: GEMM_PRIORITY,
    build: faer_gemm,
};

#[opexec::linkme::distributed_slice(opexec::fullyconnected::FULLYCONNECTED_REGISTRARS)]
static REGISTER_FAER_BLOCKED: ImplementationRegistrar<FcAttrs> = ImplementationRegistrar {
    priority: BLOCKED_PRIORITY,
    build: faer_blocked,
};

/// Keeps the faer registrars, and the reference catch-all they fall back on, in the final
/// binary.
///
/// Registration happens at link time, so a binary that never names a symbol of this crate may
/// have it dropped by the linker. Call this once before the first catalog lookup.
pub fn register_faer_backend() {
    opexec_backend_ref_cpu::register_ref_cpu_backend();
    std::hint::black_box((&REGISTER_FAER_GEMM, &REGISTER_FAER_BLOCKED));
}

#[cfg(test)]
mod tests {
    use super::*;
    use opexec_backend_ref_cpu::kernels::matmul_reference;

    #[test]
    fn registering_exposes_both_kernels() {
        register_faer_backend();
        let names = opexec::fullyconnected::fullyconnected_catalog().names();
        assert!(names.contains(&FaerGemmFullyConnected::NAME));
        assert!(names.contains(&FaerBlockedFullyConnected::NAME));
    }

    #[test]
    fn gemm_matches_reference_loop() {
        let problem = FcProblem { m: 3, k: 5, n: 4 };
        let src: Vec<f32> = (0..15).map(|v| v as f32 * 0.25 - 1.0).collect();
        let packed: Vec<f32> = (0..20).map(|v| (v % 7) as f32 - 3.0).collect();
        let mut expected = vec![0.0; 12];
        matmul_reference(&src, &packed, problem, &mut expected);

        for par in [Par::Seq, faer_parallelism()] {
            let mut out = vec![0.0; 12];
            gemm_into(par, &src, &packed, problem, &mut out);
            for (got, want) in out.iter().zip(&expected) {
                assert!((got - want).abs() < 1e-4, "{got} vs {want}");
            }
        }
    }
}
