//! 共识层：按回答形状的分组/合并策略、加权投票、有界辩论与共识引擎

pub mod debate;
pub mod engine;
pub mod strategy;
pub mod voting;

pub use debate::{
    fallback_winner, Argument, Debate, DebateStatus, Participant, Position, MAX_DEBATE_ROUNDS,
};
pub use engine::{ConsensusEngine, ConsensusStats};
pub use strategy::{
    ConsensusStrategy, DiagnosisStrategy, GeneralStrategy, RiskStrategy, StrategySet,
    TreatmentStrategy, TriageStrategy,
};
pub use voting::{vote_weight, Resolution, Vote, VotingRound, MAX_VOTE_WEIGHT, MIN_VOTE_WEIGHT};
