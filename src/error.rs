use crate::types::Role;
use thiserror::Error;

/// Why a balancing call produced no result
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BalanceError {
    #[error("not enough players: {available} < {required}")]
    InsufficientPlayers { available: usize, required: usize },

    #[error("not enough {role} players: {available} < {required}")]
    RoleShortage {
        role: Role,
        available: usize,
        required: usize,
    },

    #[error("no valid team split found after {iterations} iterations")]
    SearchExhausted { iterations: usize },
}

impl BalanceError {
    /// Missing role-eligible players, for `RoleShortage`
    pub fn shortfall(&self) -> Option<usize> {
        match self {
            BalanceError::RoleShortage {
                available,
                required,
                ..
            } => Some(required - available),
            _ => None,
        }
    }
}

/// Rejected balancer configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_iterations must be positive")]
    ZeroIterations,
}

/// Failures of the lobby session and player registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LobbyError {
    #[error("player not found: {0}")]
    PlayerNotFound(String),

    #[error("{role} SR must be between 0 and 5000, got {value}")]
    RatingOutOfRange { role: Role, value: u32 },

    #[error("unknown role '{0}', valid: tank, dps, support")]
    UnknownRole(String),

    #[error("unknown game mode '{0}'")]
    UnknownMode(String),

    #[error("duplicate player id {0}")]
    DuplicatePlayer(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("player {0} has no active roles")]
    NoActiveRole(String),

    #[error("need {needed} more players to start")]
    NotEnoughPlayers { needed: usize },

    #[error("match count must be at least 1, got {0}")]
    InvalidMatchCount(usize),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to balance teams: {0}")]
    Balance(#[from] BalanceError),
}
