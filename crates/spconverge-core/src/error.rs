use std::fmt;

use thiserror::Error;

/// Whether a failed stage should wait for more input or be reported as broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The stage stays pending and is retried on the next trigger.
    Recoverable,
    /// The stage is marked failed; a later converge may retry it.
    Fatal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Recoverable => "recoverable",
            Self::Fatal => "fatal",
        })
    }
}

#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error("the configuration is not yet complete; missing items: {}", .missing.join(" "))]
    MissingConfiguration { missing: Vec<String> },

    #[error("could not install the {} packages: {cause}", .names.join(" "))]
    PackageInstallFailure { names: Vec<String>, cause: String },

    #[error("precondition not met: {0}")]
    PreconditionUnmet(String),

    #[error("missing components: {}", .names.join(" "))]
    MissingPrerequisite { names: Vec<String> },

    #[error(transparent)]
    Fault(#[from] anyhow::Error),
}

pub type ConvergeResult<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    pub fn missing<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::MissingConfiguration {
            missing: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn install_failure<I, S>(names: I, cause: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        Self::PackageInstallFailure {
            names,
            cause: cause.into(),
        }
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionUnmet(msg.into())
    }

    pub fn prerequisite<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::MissingPrerequisite {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingConfiguration { .. } => ErrorClass::Recoverable,
            Self::PackageInstallFailure { .. }
            | Self::PreconditionUnmet(_)
            | Self::MissingPrerequisite { .. }
            | Self::Fault(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.class() == ErrorClass::Recoverable
    }

    /// Short token used in persisted status messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingConfiguration { .. } => "missing-configuration",
            Self::PackageInstallFailure { .. } => "package-install-failure",
            Self::PreconditionUnmet(_) => "precondition-unmet",
            Self::MissingPrerequisite { .. } => "missing-prerequisite",
            Self::Fault(_) => "fault",
        }
    }
}
