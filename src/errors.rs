use thiserror::Error;

/// Fatal failure classes for a pipeline run.
///
/// Each class maps to a distinct process exit code so the invoking
/// scheduler can alert per failure kind. Retention and reporting problems
/// are warnings, not failures, and never appear here.
#[derive(Error, Debug, Clone)]
pub enum Failure {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("run condition failed: {0}")]
    Condition(String),

    #[error("not enough free space: {0}")]
    SpaceInsufficient(String),

    #[error("backup engine failed: {0}")]
    Engine(String),

    #[error("backup engine timed out after {0} seconds")]
    EngineTimeout(u64),

    #[error("post-processing failed: {0}")]
    PostProcess(String),

    #[error("terminate condition failed: {0}")]
    Terminate(String),
}

impl Failure {
    /// Process exit code for this failure class. 0 is reserved for
    /// `Success` and `SkippedOk` outcomes.
    pub fn exit_code(&self) -> u8 {
        match self {
            Failure::Config(_) => 1,
            Failure::Condition(_) => 2,
            Failure::SpaceInsufficient(_) => 3,
            Failure::Engine(_) => 4,
            Failure::EngineTimeout(_) => 5,
            Failure::PostProcess(_) => 6,
            Failure::Terminate(_) => 7,
        }
    }
}
