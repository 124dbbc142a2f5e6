//! Portable reference kernels for opexec.
//!
//! Linking this crate registers the `fullyconnected_ref` catch-all implementation.

pub mod fullyconnected;
pub mod kernels;

use opexec::executor::ImplementationRegistrar;
use opexec::FcAttrs;

pub use fullyconnected::{
    packed_weights, ref_fullyconnected, PackedWeightsKey, RefFcExecutor, RefFullyConnected,
};
pub use kernels::FcProblem;

/// Sorted after every accelerated implementation.
pub const REF_FULLYCONNECTED_PRIORITY: u32 = 1000;

#[opexec::linkme::distributed_slice(opexec::fullyconnected::FULLYCONNECTED_REGISTRARS)]
static REGISTER_REF_FULLYCONNECTED: ImplementationRegistrar<FcAttrs> = ImplementationRegistrar {
    priority: REF_FULLYCONNECTED_PRIORITY,
    build: ref_fullyconnected,
};

/// Keeps the reference registrar in the final binary; see
/// [`fullyconnected_catalog`](opexec::fullyconnected::fullyconnected_catalog).
pub fn register_ref_cpu_backend() {
    std::hint::black_box(&REGISTER_REF_FULLYCONNECTED);
}
