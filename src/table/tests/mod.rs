pub mod helpers;

mod tests_manager;
