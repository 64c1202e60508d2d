mod common;
mod extract_tests;
mod fetch_tests;
