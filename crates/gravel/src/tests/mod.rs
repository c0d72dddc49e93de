mod batch_tests;
mod helpers;
mod table_manager_tests;
