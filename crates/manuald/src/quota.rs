//! Usage-quota capability. Tier accounting lives in an external service;
//! the daemon only asks whether a user may ask another question.

use async_trait::async_trait;
use manual_shared::QaError;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait QuotaGate: Send + Sync {
    /// `Err(QaError::TierLimitExceeded)` when the user is out of quota.
    async fn check(&self, user_id: &str) -> Result<(), QaError>;
}

/// Quota gate that admits everyone
#[derive(Debug, Default, Clone, Copy)]
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaGate for UnlimitedQuota {
    async fn check(&self, _user_id: &str) -> Result<(), QaError> {
        Ok(())
    }
}

/// Admits `limit` questions per user, then refuses (testing)
pub struct FixedQuota {
    limit: u32,
    used: Mutex<HashMap<String, u32>>,
}

impl FixedQuota {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            used: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl QuotaGate for FixedQuota {
    async fn check(&self, user_id: &str) -> Result<(), QaError> {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let count = used.entry(user_id.to_string()).or_insert(0);
        if *count >= self.limit {
            return Err(QaError::TierLimitExceeded);
        }
        *count += 1;
        Ok(())
    }
}
