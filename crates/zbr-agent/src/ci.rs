//! CI system detection from environment variables.

use std::collections::BTreeMap;

use zbr_api::CiContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CiType {
    Jenkins,
    TeamCity,
    CircleCi,
    TravisCi,
}

impl CiType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jenkins => "JENKINS",
            Self::TeamCity => "TEAM_CITY",
            Self::CircleCi => "CIRCLE_CI",
            Self::TravisCi => "TRAVIS_CI",
        }
    }
}

struct CiProbe {
    ci_type: CiType,
    marker: &'static str,
    prefixes: &'static [&'static str],
}

const CI_PROBES: [CiProbe; 4] = [
    CiProbe {
        ci_type: CiType::Jenkins,
        marker: "JENKINS_URL",
        prefixes: &[
            "CVS_",
            "SVN_",
            "GIT_",
            "NODE_",
            "EXECUTOR_NUMBER",
            "JENKINS_",
            "JOB_",
            "BUILD_",
            "ROOT_BUILD_",
            "RUN_",
            "WORKSPACE",
        ],
    },
    CiProbe {
        ci_type: CiType::TeamCity,
        marker: "TEAMCITY_VERSION",
        prefixes: &["BUILD_", "HOSTNAME", "SERVER_URL", "TEAMCITY_"],
    },
    CiProbe {
        ci_type: CiType::CircleCi,
        marker: "CIRCLECI",
        prefixes: &["CIRCLE", "HOSTNAME"],
    },
    CiProbe {
        ci_type: CiType::TravisCi,
        marker: "TRAVIS",
        prefixes: &["TRAVIS", "USER"],
    },
];

/// Detects the CI system from the process environment.
pub fn resolve_ci_context() -> Option<CiContext> {
    let env = std::env::vars().collect::<BTreeMap<_, _>>();
    resolve_ci_context_from(&env)
}

/// First matching CI system wins; it contributes every variable carrying one
/// of its prefixes.
pub fn resolve_ci_context_from(env: &BTreeMap<String, String>) -> Option<CiContext> {
    let probe = CI_PROBES
        .iter()
        .find(|probe| env.contains_key(probe.marker))?;
    let env_variables = env
        .iter()
        .filter(|(name, _)| {
            probe
                .prefixes
                .iter()
                .any(|prefix| name.starts_with(prefix))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    Some(CiContext {
        ci_type: probe.ci_type.as_str().to_string(),
        env_variables,
    })
}
