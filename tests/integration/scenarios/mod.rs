pub mod interrupt_tests;
pub mod runner_tests;
pub mod validator_cli_tests;
