//! CI environment detection.
//!
//! The default cache mode flips to `none` on CI: the local cache directory
//! is useless on a throwaway machine, and the GitHub backend must be opted
//! into explicitly because it needs credentials.

use std::env;

/// How to detect a specific CI provider.
enum CiCheckVar {
    /// The variable exists and equals "true" or "1".
    Truthy(&'static str),
    /// The variable exists with any value.
    Present(&'static str),
}

/// Variables checked in order, the generic `CI` variable first.
/// Based on the env-ci library (<https://github.com/semantic-release/env-ci>).
const CI_VARS: &[CiCheckVar] = &[
    CiCheckVar::Truthy("CI"),
    CiCheckVar::Truthy("BUILDKITE"),
    CiCheckVar::Truthy("CIRCLECI"),
    CiCheckVar::Truthy("GITHUB_ACTIONS"),
    CiCheckVar::Truthy("GITLAB_CI"),
    CiCheckVar::Present("JENKINS_URL"),
    CiCheckVar::Present("TEAMCITY_VERSION"),
    CiCheckVar::Truthy("TRAVIS"),
];

fn matches_ci_var(ci_var: &CiCheckVar) -> bool {
    match ci_var {
        CiCheckVar::Truthy(var) => env::var(var).is_ok_and(|v| v == "true" || v == "1"),
        CiCheckVar::Present(var) => env::var(var).is_ok(),
    }
}

/// Detects if the current process is running in a CI environment.
pub fn is_ci() -> bool {
    CI_VARS.iter().any(matches_ci_var)
}
