//! Gas limit and gas price resolution, and fee escalation for stuck transactions

use crate::chain::NodeClient;
use crate::error::{DeliveryError, DeliveryResult};
use crate::message::Request;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::U256;
use tracing::{debug, warn};

/// Estimates are padded by 3/2
const GAS_LIMIT_MARGIN_NUMERATOR: u64 = 3;
const GAS_LIMIT_MARGIN_DENOMINATOR: u64 = 2;

/// Replacements pay 12/10 of the previous price
const ESCALATION_NUMERATOR: u64 = 12;
const ESCALATION_DENOMINATOR: u64 = 10;

/// Gas estimator for transactions
#[derive(Debug, Clone, Default)]
pub struct GasEstimator {
    /// Used when estimation fails, and caps padded estimates
    fallback_gas_limit: Option<u64>,
}

impl GasEstimator {
    pub fn new(fallback_gas_limit: Option<u64>) -> Self {
        Self { fallback_gas_limit }
    }

    /// Gas limit for `tx`: the request's explicit limit, else a padded node
    /// estimate, else the fallback ceiling
    pub async fn resolve_gas_limit(
        &self,
        node: &dyn NodeClient,
        request: &Request,
        tx: &TypedTransaction,
    ) -> DeliveryResult<U256> {
        if request.gas > 0 {
            return Ok(U256::from(request.gas));
        }

        match node.estimate_gas(tx).await {
            Ok(estimate) => {
                let padded = apply_safety_margin(estimate);
                let limit = match self.fallback_gas_limit {
                    Some(ceiling) => padded.min(U256::from(ceiling)),
                    None => padded,
                };
                debug!(id = %request.id, %estimate, %limit, "Estimated gas limit");
                Ok(limit)
            }
            Err(e) => match self.fallback_gas_limit {
                Some(ceiling) => {
                    warn!(id = %request.id, ceiling, "Gas estimation failed, using fallback: {}", e);
                    Ok(U256::from(ceiling))
                }
                None => Err(match e {
                    DeliveryError::GasEstimation(_) => e,
                    other => DeliveryError::GasEstimation(other.to_string()),
                }),
            },
        }
    }

    /// Gas price for `request`: the explicit price, else the node's suggestion
    pub async fn resolve_gas_price(
        &self,
        node: &dyn NodeClient,
        request: &Request,
    ) -> DeliveryResult<U256> {
        if !request.gas_price.is_zero() {
            return Ok(request.gas_price);
        }

        let price = node.suggest_gas_price().await?;
        debug!(id = %request.id, %price, "Suggested gas price");
        Ok(price)
    }
}

fn apply_safety_margin(estimate: U256) -> U256 {
    estimate.saturating_mul(U256::from(GAS_LIMIT_MARGIN_NUMERATOR))
        / U256::from(GAS_LIMIT_MARGIN_DENOMINATOR)
}

/// Price for a replacement transaction, `floor(price * 1.2)`.
///
/// `None` when the product does not fit in a `U256`.
pub fn escalate_gas_price(price: U256) -> Option<U256> {
    price
        .checked_mul(U256::from(ESCALATION_NUMERATOR))
        .map(|scaled| scaled / U256::from(ESCALATION_DENOMINATOR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{FakeNode, MockNode};
    use ethers::types::{Address, TransactionRequest};

    fn dummy_tx() -> TypedTransaction {
        TransactionRequest::new().to(Address::random()).into()
    }

    #[test]
    fn test_escalation_rounds_down() {
        assert_eq!(escalate_gas_price(U256::from(100)), Some(U256::from(120)));
        assert_eq!(escalate_gas_price(U256::from(7)), Some(U256::from(8)));
        assert_eq!(
            escalate_gas_price(U256::from(1_000_000_007u64)),
            Some(U256::from(1_200_000_008u64))
        );
    }

    #[test]
    fn test_escalation_never_lowers_price() {
        assert_eq!(escalate_gas_price(U256::MAX), None);
        assert_eq!(escalate_gas_price(U256::MAX / 10 * 9), None);

        let high = U256::MAX / 12;
        let escalated = escalate_gas_price(high).unwrap();
        assert!(escalated > high);
    }

    #[tokio::test]
    async fn test_explicit_gas_skips_estimation() {
        let mut node = MockNode::new();
        node.expect_estimate_gas().never();
        node.expect_suggest_gas_price().never();

        let request = Request::new(Address::random()).gas(50_000).gas_price(9u64);
        let gas = GasEstimator::new(None);

        let limit = gas.resolve_gas_limit(&node, &request, &dummy_tx()).await.unwrap();
        let price = gas.resolve_gas_price(&node, &request).await.unwrap();
        assert_eq!(limit, U256::from(50_000));
        assert_eq!(price, U256::from(9));
    }

    #[tokio::test]
    async fn test_estimate_gets_margin() {
        let node = FakeNode::new();
        node.set_estimate(Ok(21_001));
        let request = Request::new(Address::random());

        let limit = GasEstimator::new(None)
            .resolve_gas_limit(&node, &request, &dummy_tx())
            .await
            .unwrap();
        assert_eq!(limit, U256::from(31_501));
    }

    #[tokio::test]
    async fn test_ceiling_caps_estimate() {
        let node = FakeNode::new();
        node.set_estimate(Ok(100_000));
        let request = Request::new(Address::random());

        let limit = GasEstimator::new(Some(120_000))
            .resolve_gas_limit(&node, &request, &dummy_tx())
            .await
            .unwrap();
        assert_eq!(limit, U256::from(120_000));
    }

    #[tokio::test]
    async fn test_estimation_failure() {
        let node = FakeNode::new();
        node.set_estimate(Err("execution reverted"));
        let request = Request::new(Address::random());

        let err = GasEstimator::new(None)
            .resolve_gas_limit(&node, &request, &dummy_tx())
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::GasEstimation(msg) if msg.contains("reverted")));

        let limit = GasEstimator::new(Some(300_000))
            .resolve_gas_limit(&node, &request, &dummy_tx())
            .await
            .unwrap();
        assert_eq!(limit, U256::from(300_000));
    }

    #[tokio::test]
    async fn test_suggested_price() {
        let node = FakeNode::new();
        node.set_gas_price(42u64);

        let price = GasEstimator::default()
            .resolve_gas_price(&node, &Request::new(Address::random()))
            .await
            .unwrap();
        assert_eq!(price, U256::from(42));
    }
}
