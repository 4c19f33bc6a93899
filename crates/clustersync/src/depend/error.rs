use thiserror::Error;

/// Errors raised while registering dependencies.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DependError {
    #[error("App '{0}' cannot depend on itself")]
    SelfDependency(String),

    #[error("Dependencies for app '{0}' are already registered")]
    AlreadyRegistered(String),

    #[error("App '{app}' was not deployed because its prerequisite '{prerequisite}' failed")]
    PrerequisiteFailed { app: String, prerequisite: String },
}
