pub use proptest::prelude::*;
pub use proptest::test_runner::TestCaseResult;
pub use test_strategy::proptest;

use crate::value::Value;

/// Strategy for arbitrary nested values. Floats are finite so that values
/// compare equal to themselves.
pub fn arb_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<String>().prop_map(Value::String),
        any::<i8>().prop_map(Value::Byte),
        any::<i16>().prop_map(Value::Short),
        any::<i32>().prop_map(Value::Int),
        any::<i64>().prop_map(Value::Long),
        (-1.0e30f32..1.0e30f32).prop_map(Value::Float),
        (-1.0e300f64..1.0e300f64).prop_map(Value::Double),
        any::<bool>().prop_map(Value::Boolean),
        proptest::collection::vec(any::<u8>(), 0..32)
            .prop_map(|data| Value::Binary(bytes::Bytes::from(data))),
    ];
    leaf.prop_recursive(4, 64, 8, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..8).prop_map(Value::List),
            proptest::collection::vec((any::<String>(), inner), 0..8).prop_map(Value::Object),
        ]
    })
}
