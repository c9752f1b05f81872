//! Test fixtures for integration-style tests against the full [`crate::Application`].

use crate::config::Config;

/// A minimal valid [`Config`], mirroring what `figment` would produce from an empty YAML file
/// layered with no environment overrides, with the two required fields filled in.
pub fn create_test_config() -> Config {
    Config { database_url: "postgres://test".to_string(), stripe_api_key: "sk_test_fixture".to_string(), ..Config::default() }
}
