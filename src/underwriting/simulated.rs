use super::model::{Assets, Coverage, CreditScore, HealthHistory, HealthScore, Liabilities, Person};
use super::services::UnderwritingServices;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const MIN_CREDIT: u32 = 300;
const CREDIT_SPAN: u64 = 550;
const MAX_CREDIT: u32 = 850;
const APPROVAL_CREDIT: u32 = 600;
const APPROVAL_HEALTH: u32 = 50;
const BASE_PREMIUM_CENTS: u64 = 50_000;

/// Deterministic stand-in for the remote services.
///
/// Every value is derived from its inputs, so two runs over the same
/// person always agree. Latency, when set, is drawn per call.
#[derive(Debug, Clone, Default)]
pub struct SimulatedServices {
    latency_ms: Option<(u64, u64)>,
}

impl SimulatedServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep a random duration in `min_ms..=max_ms` before each call
    pub fn with_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.latency_ms = Some((min_ms.min(max_ms), max_ms.max(min_ms)));
        self
    }

    async fn simulate_latency(&self, operation: &str) {
        if let Some((min_ms, max_ms)) = self.latency_ms {
            let delay = fastrand::u64(min_ms..=max_ms);
            debug!("{} simulating {}ms latency", operation, delay);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

#[async_trait]
impl UnderwritingServices for SimulatedServices {
    async fn fetch_assets(&self, person: &Person) -> Result<Assets> {
        self.simulate_latency("fetch_assets").await;
        Ok(Assets {
            holdings_cents: u64::from(person.age) * 250_000,
        })
    }

    async fn fetch_liabilities(&self, person: &Person) -> Result<Liabilities> {
        self.simulate_latency("fetch_liabilities").await;
        Ok(Liabilities {
            debts_cents: person.id.len() as u64 * 100_000,
        })
    }

    async fn fetch_health_history(&self, person: &Person) -> Result<HealthHistory> {
        self.simulate_latency("fetch_health_history").await;
        let mut conditions = Vec::new();
        if person.age >= 60 {
            conditions.push("hypertension".to_string());
        }
        if person.age >= 75 {
            conditions.push("arrhythmia".to_string());
        }
        Ok(HealthHistory { conditions })
    }

    async fn score_credit(
        &self,
        assets: &Assets,
        liabilities: &Liabilities,
    ) -> Result<CreditScore> {
        self.simulate_latency("score_credit").await;
        let total = assets.holdings_cents.saturating_add(liabilities.debts_cents);
        if total == 0 {
            return Ok(CreditScore(MIN_CREDIT));
        }
        // holdings <= total, so earned never exceeds the span
        let earned =
            u128::from(assets.holdings_cents) * u128::from(CREDIT_SPAN) / u128::from(total);
        Ok(CreditScore(MIN_CREDIT + earned as u32))
    }

    async fn score_health(&self, history: &HealthHistory) -> Result<HealthScore> {
        self.simulate_latency("score_health").await;
        let penalty = history.conditions.len() as u32 * 25;
        Ok(HealthScore(100u32.saturating_sub(penalty)))
    }

    async fn decide(&self, credit: &CreditScore, health: &HealthScore) -> Result<Coverage> {
        self.simulate_latency("decide").await;
        if credit.0 < MIN_CREDIT || credit.0 > MAX_CREDIT || health.0 > 100 {
            bail!("scores out of range: credit {}, health {}", credit.0, health.0);
        }
        let credit_loading = u64::from(MAX_CREDIT - credit.0) * 100;
        let health_loading = u64::from(100 - health.0) * 500;
        Ok(Coverage {
            approved: credit.0 >= APPROVAL_CREDIT && health.0 >= APPROVAL_HEALTH,
            credit: *credit,
            health: *health,
            premium_cents: BASE_PREMIUM_CENTS + credit_loading + health_loading,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_simulated_decision() {
        let services = SimulatedServices::new();
        let person = Person::new("p-1", "Ada", 40);

        let assets = services.fetch_assets(&person).await.unwrap();
        let liabilities = services.fetch_liabilities(&person).await.unwrap();
        let history = services.fetch_health_history(&person).await.unwrap();
        assert!(history.conditions.is_empty());

        let credit = services.score_credit(&assets, &liabilities).await.unwrap();
        let health = services.score_health(&history).await.unwrap();
        assert_eq!(health, HealthScore(100));

        let coverage = services.decide(&credit, &health).await.unwrap();
        assert!(coverage.approved);
        assert_eq!(coverage.credit, credit);
    }

    #[tokio::test]
    async fn test_credit_without_holdings() {
        let services = SimulatedServices::new();
        let credit = services
            .score_credit(
                &Assets { holdings_cents: 0 },
                &Liabilities { debts_cents: 0 },
            )
            .await
            .unwrap();
        assert_eq!(credit, CreditScore(MIN_CREDIT));
    }

    #[tokio::test]
    async fn test_credit_with_huge_balances() {
        let services = SimulatedServices::new();
        let credit = services
            .score_credit(
                &Assets {
                    holdings_cents: u64::MAX,
                },
                &Liabilities {
                    debts_cents: u64::MAX,
                },
            )
            .await
            .unwrap();
        assert_eq!(credit, CreditScore(MAX_CREDIT));

        let credit = services
            .score_credit(
                &Assets {
                    holdings_cents: u64::MAX / 2,
                },
                &Liabilities {
                    debts_cents: u64::MAX / 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(credit, CreditScore(MIN_CREDIT + 275));
    }

    #[tokio::test]
    async fn test_decide_rejects_out_of_range_scores() {
        let services = SimulatedServices::new();
        let result = services.decide(&CreditScore(100), &HealthScore(80)).await;
        assert!(result.is_err());
    }
}
