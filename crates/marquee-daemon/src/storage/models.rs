//! Database models for the Marquee daemon.

use serde::{Deserialize, Serialize};

/// Points balance row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PointsBalanceRow {
    pub rewards_address: String,
    pub balance: i64,
}

/// Points transaction row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PointsTxRow {
    pub id: i64,
    pub rewards_address: String,
    pub tx_type: String,
    pub value: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub extra: String,
}

/// Application row. `updated_at` doubles as the current version.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApplicationRow {
    pub id: String,
    pub updated_at: i64,
    pub edit_message: String,
    pub allow_launching: i64,
    pub allow_file_editing: i64,
    pub autorun: i64,
}

/// Versioned application file blob.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApplicationFileRow {
    pub application_id: String,
    pub version: i64,
    pub name: String,
    pub file_type: String,
    pub public: i64,
    pub content: Vec<u8>,
}

/// Application-scoped JSON document.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DocumentRow {
    pub id: String,
    pub application_id: String,
    pub updated_at: i64,
    pub public: i64,
    pub format: String,
    pub content: String,
}

/// Playback history entry, used for replay-cooldown checks.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlayedMediaRow {
    pub id: String,
    pub media_type: String,
    pub media_id: String,
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub media_offset: i64,
    pub media_length: i64,
    pub requested_by: String,
    pub request_cost: String,
    pub unskippable: i64,
}

/// Points transaction types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointsTxType {
    MediaEnqueuedReward,
    MediaEnqueuedRewardReversal,
    ChatActivityReward,
    ConcealedEntryEnqueuing,
    AlienChainDistribution,
    ApplicationDefined,
}

impl PointsTxType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MediaEnqueuedReward => "media_enqueued_reward",
            Self::MediaEnqueuedRewardReversal => "media_enqueued_reward_reversal",
            Self::ChatActivityReward => "chat_activity_reward",
            Self::ConcealedEntryEnqueuing => "concealed_entry_enqueuing",
            Self::AlienChainDistribution => "alien_chain_distribution",
            Self::ApplicationDefined => "application_defined",
        }
    }

    /// Whether consecutive transactions of this type for the same address
    /// collapse into one row within the collapse window.
    pub const fn is_collapsible(self) -> bool {
        matches!(self, Self::ChatActivityReward)
    }
}

impl std::fmt::Display for PointsTxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
