use thiserror::Error;

/// Terminal conditions of a launcher run other than success.
///
/// None of these are retried: the launcher performs at most one latch trip
/// and one downstream spawn per invocation.
#[derive(Error, Debug)]
pub enum RunError {
    /// The watched log or a companion process was unavailable before watching began.
    #[error("setup failed: {0}")]
    Setup(String),

    /// The downstream process could not be spawned after the latch tripped.
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The downstream process ran but did not exit cleanly.
    #[error("downstream process failed ({})", describe_code(*.code))]
    Downstream { code: Option<i32> },

    /// The operator stopped the run.
    #[error("interrupted")]
    Interrupted,
}

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_DOWNSTREAM: u8 = 1;
pub const EXIT_SETUP: u8 = 2;
pub const EXIT_LAUNCH: u8 = 3;
pub const EXIT_INTERRUPTED: u8 = 130;

impl RunError {
    /// Process exit code reported for this condition.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Setup(_) => EXIT_SETUP,
            RunError::Launch { .. } => EXIT_LAUNCH,
            RunError::Downstream { .. } => EXIT_DOWNSTREAM,
            RunError::Interrupted => EXIT_INTERRUPTED,
        }
    }
}

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "terminated by signal".to_string(),
    }
}
