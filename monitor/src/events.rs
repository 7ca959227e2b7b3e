//! Typed event bodies for the subscribed categories.
//!
//! Only the fields the status line uses are required; everything else
//! defaults so that payload additions on the platform side never break
//! decoding.

use serde::Deserialize;

/// `channel.chat.message`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatMessageEvent {
    #[serde(default)]
    pub broadcaster_user_id: String,
    #[serde(default)]
    pub broadcaster_user_login: String,
    #[serde(default)]
    pub chatter_user_id: String,
    #[serde(default)]
    pub chatter_user_login: String,
    pub chatter_user_name: String,
    #[serde(default)]
    pub message_id: String,
    pub message: ChatMessageBody,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub message_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatMessageBody {
    pub text: String,
}

/// `channel.subscribe`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscribeEvent {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_login: String,
    pub user_name: String,
    #[serde(default)]
    pub tier: String,
    #[serde(default)]
    pub is_gift: bool,
}

/// `channel.subscription.message`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResubMessageEvent {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub user_login: String,
    pub user_name: String,
    #[serde(default)]
    pub tier: String,
    pub message: ResubMessageBody,
    #[serde(default)]
    pub cumulative_months: u32,
    #[serde(default)]
    pub streak_months: Option<u32>,
    #[serde(default)]
    pub duration_months: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResubMessageBody {
    pub text: String,
}
