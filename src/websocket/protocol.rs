use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    #[default]
    Prices,
    Changes,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionMessage {
    pub action: String, // "subscribe" | "unsubscribe" | "unsubscribe_all"
    #[serde(default)]
    pub topic: Topic,
    #[serde(default, alias = "symbol")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SubscriptionResponse {
    pub status: String,
    pub topic: Topic,
    pub key: Option<String>,
    pub message: String,
}

impl SubscriptionResponse {
    pub fn success(topic: Topic, key: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            topic,
            key,
            message: message.into(),
        }
    }

    pub fn error(topic: Topic, key: Option<String>, message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            topic,
            key,
            message: message.into(),
        }
    }

    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

// Pushed to a subscriber whenever its key is broadcast
#[derive(Debug, Serialize)]
pub struct Notification<'a, V> {
    pub topic: Topic,
    pub key: &'a str,
    pub value: &'a V,
    pub timestamp: String,
}
