pub mod assertions;
pub mod fixtures;
pub mod logging;

pub use assertions::{assert_contains, assert_path_exists, assert_path_missing};
pub use fixtures::TestInventory;
pub use logging::init_test_logging;
