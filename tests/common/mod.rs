#![allow(dead_code)]

pub use protorun_test_utils::builders;
pub use protorun_test_utils::fake_executor;
pub use protorun_test_utils::{init_tracing, with_timeout};
