mod api_tests;
mod common;
mod shared_limit_tests;
