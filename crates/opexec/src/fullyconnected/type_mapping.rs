//! Negotiation tables of the fully-connected implementations.
//!
//! Ports are `[src, wei, bias, dst]`.

use once_cell::sync::Lazy;

use crate::executor::negotiation::{
    everyone, pt, LayoutConfig, NegotiationRule, PortPolicy::*, TypeMapping,
};
use crate::memory::Layout;
use crate::precision::masks::*;
use crate::precision::Precision;

fn float_pairs() -> TypeMapping {
    vec![
        NegotiationRule::new([BF16, BF16, ANY, BF16 | F32], pt([Bypass, Bypass, Output, Output])),
        NegotiationRule::new([F16, F16, ANY, F16 | F32], pt([Bypass, Bypass, Output, Output])),
        // float inputs never produce integer outputs
        NegotiationRule::new(
            [F32 | BF16 | F16, ANY, ANY, I8 | U8],
            pt([Bypass, Bypass, Input(0), Input(0)]),
        ),
        // half-float weights not matching the input precision
        NegotiationRule::new([F32, HALF_FLOAT, ANY, ANY], pt([Bypass, Bypass, Input(0), Input(0)])),
        NegotiationRule::new([BF16, F16, ANY, ANY], pt([Bypass, Bypass, Input(0), Input(0)])),
        NegotiationRule::new([F16, BF16, ANY, ANY], pt([Bypass, Bypass, Input(0), Input(0)])),
    ]
}

static FULLYCONNECTED_TYPE_MAPPING: Lazy<TypeMapping> = Lazy::new(|| {
    let mut rules = float_pairs();
    rules.extend([
        // int8 quantization
        NegotiationRule::new([U8 | I8, I8, ANY, ANY], pt([Bypass, Bypass, Bypass, Output])),
        // compressed integer weights
        NegotiationRule::new(
            [F32 | BF16, U8 | NF4 | U4 | I4, ANY, ANY],
            pt([Bypass, Bypass, Input(0), Input(0)]),
        ),
        NegotiationRule::new([U8 | I8, !I8, ANY, ANY], everyone(Just(Precision::F32))),
        NegotiationRule::new([ANY, ANY, ANY, ANY], everyone(Just(Precision::F32))),
    ]);
    rules
});

static CONVOLUTION_1X1_TYPE_MAPPING: Lazy<TypeMapping> = Lazy::new(|| {
    let mut rules = float_pairs();
    rules.extend([
        NegotiationRule::new([U8 | I8, I8, ANY, ANY], pt([Bypass, Bypass, Output, Output])),
        NegotiationRule::new([ANY, ANY, ANY, ANY], everyone(Just(Precision::F32))),
    ]);
    rules
});

static PLANAR_LAYOUT_CONFIG: Lazy<LayoutConfig> = Lazy::new(|| LayoutConfig::all(Layout::Ncsp));

pub fn fullyconnected_type_mapping() -> &'static TypeMapping {
    &FULLYCONNECTED_TYPE_MAPPING
}

pub fn convolution_1x1_type_mapping() -> &'static TypeMapping {
    &CONVOLUTION_1X1_TYPE_MAPPING
}

pub fn planar_layout_config() -> &'static LayoutConfig {
    &PLANAR_LAYOUT_CONFIG
}

#[cfg(test)]
mod tests {
    use super::{convolution_1x1_type_mapping, fullyconnected_type_mapping};
    use crate::executor::negotiation::resolve;
    use crate::precision::Precision::{self, *};

    fn fc(src: Precision, wei: Precision, bia: Precision, dst: Precision) -> Vec<Precision> {
        let types = resolve(fullyconnected_type_mapping(), &[src, wei, bia], &[dst]);
        types.inputs.iter().chain(&types.outputs).copied().collect()
    }

    #[test]
    fn both_tables_end_with_a_catch_all() {
        for table in [fullyconnected_type_mapping(), convolution_1x1_type_mapping()] {
            let last = table.last().expect("non-empty table");
            for precision in Precision::ALL {
                assert!(last.matches(&[precision, precision, precision, precision]));
            }
        }
    }

    #[test]
    fn bf16_pair_forces_bias_to_output() {
        assert_eq!(fc(Bf16, Bf16, F32, F32), vec![Bf16, Bf16, F32, F32]);
        assert_eq!(fc(Bf16, Bf16, Undefined, Bf16), vec![Bf16, Bf16, Bf16, Bf16]);
    }

    #[test]
    fn float_inputs_with_integer_outputs_take_the_input_precision() {
        assert_eq!(fc(F32, F32, F32, U8), vec![F32, F32, F32, F32]);
    }

    #[test]
    fn int8_quantization_keeps_everything_but_dst() {
        assert_eq!(fc(U8, I8, I32, U8), vec![U8, I8, I32, U8]);
        assert_eq!(fc(I8, I8, Undefined, F32), vec![I8, I8, Undefined, F32]);
    }

    #[test]
    fn compressed_weights_are_kept_for_float_inputs() {
        assert_eq!(fc(F32, U4, Undefined, F32), vec![F32, U4, F32, F32]);
        assert_eq!(fc(Bf16, Nf4, Bf16, Bf16), vec![Bf16, Nf4, Bf16, Bf16]);
    }

    #[test]
    fn integer_inputs_with_non_int8_weights_fall_back_to_f32() {
        assert_eq!(fc(U8, U8, Undefined, U8), vec![F32, F32, F32, F32]);
    }

    #[test]
    fn convolution_table_has_no_compressed_weights_rule() {
        let types = resolve(convolution_1x1_type_mapping(), &[F32, U4, Undefined], &[F32]);
        assert_eq!(types.input(1), F32);
        let types = resolve(convolution_1x1_type_mapping(), &[U8, I8, I32], &[U8]);
        assert_eq!(types.inputs.as_slice(), &[U8, I8, U8]);
    }
}
