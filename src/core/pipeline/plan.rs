use crate::core::{
    commands::CommandSet,
    domain::{PipelineKind, Role},
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("no command configured for the {role} of a {kind} run")]
pub struct MissingCommand {
    pub kind: PipelineKind,
    pub role: Role,
}

/// What checks the candidate's output after it ran.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Checker {
    Reference(Vec<String>),
    Validator(Vec<String>),
    ResourcesOnly,
}

/// Commands of every stage of one pipeline kind, resolved once at start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelinePlan {
    pub kind: PipelineKind,
    pub generator: Vec<String>,
    pub candidate: Vec<String>,
    pub checker: Checker,
}

impl PipelinePlan {
    pub fn resolve(kind: PipelineKind, commands: &CommandSet) -> Result<Self, MissingCommand> {
        let argv = |role: Role| {
            commands
                .get(role)
                .filter(|argv| !argv.is_empty())
                .map(<[String]>::to_vec)
                .ok_or(MissingCommand { kind, role })
        };

        let checker = match kind {
            PipelineKind::Comparison => Checker::Reference(argv(Role::Correct)?),
            PipelineKind::Validation => Checker::Validator(argv(Role::Validator)?),
            PipelineKind::Benchmark => Checker::ResourcesOnly,
        };

        Ok(Self {
            kind,
            generator: argv(Role::Generator)?,
            candidate: argv(Role::Test)?,
            checker,
        })
    }
}
