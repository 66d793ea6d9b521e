mod common;
mod transform_tests;
mod unreachable_tests;
