mod persistence_tests;
mod session_tests;
mod support;
