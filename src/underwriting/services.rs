use super::model::{Assets, Coverage, CreditScore, HealthHistory, HealthScore, Liabilities, Person};
use anyhow::Result;
use async_trait::async_trait;

/// Remote lookups and scoring math the orchestrator drives.
///
/// Each call resolves exactly once, with a value or an error. Errors are
/// wrapped by the orchestrator with the failing operation's name.
#[async_trait]
pub trait UnderwritingServices: Send + Sync + 'static {
    async fn fetch_assets(&self, person: &Person) -> Result<Assets>;

    async fn fetch_liabilities(&self, person: &Person) -> Result<Liabilities>;

    async fn fetch_health_history(&self, person: &Person) -> Result<HealthHistory>;

    async fn score_credit(&self, assets: &Assets, liabilities: &Liabilities)
        -> Result<CreditScore>;

    async fn score_health(&self, history: &HealthHistory) -> Result<HealthScore>;

    async fn decide(&self, credit: &CreditScore, health: &HealthScore) -> Result<Coverage>;
}
