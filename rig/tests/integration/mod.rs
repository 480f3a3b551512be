mod command_tests;
mod copy_tests;
