//! Chain B adapter: JSON-RPC calls to the bridge canister's HTTP gateway

use super::{LedgerAdapter, LockRecord, ReleaseProof, TxStatus};
use crate::config::CanisterConfig;
use crate::error::{BridgeError, BridgeResult, LedgerError, LedgerResult};
use crate::request::{Amount, Chain, IdempotencyKey, TxRef};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// JSON-RPC server errors the gateway uses for replica unavailability
const TRANSIENT_RPC_CODES: [i64; 2] = [-32000, -32603];

#[derive(Serialize)]
struct JsonRpcRequest<'a, T> {
    jsonrpc: &'static str,
    method: &'a str,
    params: T,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse<R> {
    result: Option<R>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct SubmitResult {
    tx_ref: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum GatewayTxState {
    Pending,
    Finalized,
    Rejected,
}

#[derive(Deserialize)]
struct StatusResult {
    state: GatewayTxState,
    #[serde(default)]
    confirmations: u64,
    reason: Option<String>,
}

/// Amounts travel as decimal strings; u128 does not fit a JSON number
#[derive(Deserialize)]
struct BalanceResult {
    balance: String,
}

#[derive(Deserialize)]
struct LockInfoResult {
    account: String,
    amount: String,
}

#[derive(Deserialize)]
struct CanisterStatusResult {
    status: String,
}

pub struct CanisterLedger {
    client: reqwest::Client,
    gateway_url: String,
    canister_id: String,
    confirmation_depth: u64,
}

impl CanisterLedger {
    pub fn new(config: &CanisterConfig, confirmation_depth: u64) -> BridgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BridgeError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            gateway_url: config.gateway_url.clone(),
            canister_id: config.canister_id.clone(),
            confirmation_depth,
        })
    }

    async fn rpc_call<T, R>(&self, method: &str, params: T) -> LedgerResult<R>
    where
        T: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id: 1,
        };

        let response = self
            .client
            .post(&self.gateway_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| LedgerError::transient(Chain::B, format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("gateway returned {} for {}", status, method);
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                LedgerError::transient(Chain::B, message)
            } else {
                LedgerError::permanent(Chain::B, message)
            });
        }

        let rpc_response: JsonRpcResponse<R> = response.json().await.map_err(|e| {
            LedgerError::transient(Chain::B, format!("Failed to parse response: {}", e))
        })?;

        if let Some(error) = rpc_response.error {
            let message = format!("RPC error {}: {}", error.code, error.message);
            return Err(if TRANSIENT_RPC_CODES.contains(&error.code) {
                LedgerError::transient(Chain::B, message)
            } else {
                LedgerError::permanent(Chain::B, message)
            });
        }

        rpc_response
            .result
            .ok_or_else(|| LedgerError::transient(Chain::B, "No result in RPC response"))
    }
}

#[async_trait]
impl LedgerAdapter for CanisterLedger {
    fn chain(&self) -> Chain {
        Chain::B
    }

    async fn submit_lock(
        &self,
        account: &str,
        amount: Amount,
        key: IdempotencyKey,
    ) -> LedgerResult<TxRef> {
        let params = json!({
            "canister_id": self.canister_id,
            "idempotency_key": key.to_string(),
            "account": account,
            "amount": amount.to_string(),
        });
        let result: SubmitResult = self.rpc_call("lock", params).await?;
        debug!("Chain B lock {} for key {}", result.tx_ref, key);
        Ok(TxRef::new(result.tx_ref))
    }

    async fn submit_release(
        &self,
        account: &str,
        amount: Amount,
        proof: &ReleaseProof,
        key: IdempotencyKey,
    ) -> LedgerResult<TxRef> {
        let params = json!({
            "canister_id": self.canister_id,
            "idempotency_key": key.to_string(),
            "account": account,
            "amount": amount.to_string(),
            "proof": proof,
        });
        let result: SubmitResult = self.rpc_call("release", params).await?;
        debug!("Chain B release {} for key {}", result.tx_ref, key);
        Ok(TxRef::new(result.tx_ref))
    }

    async fn query_status(&self, tx_ref: &TxRef) -> LedgerResult<TxStatus> {
        let params = json!({
            "canister_id": self.canister_id,
            "tx_ref": tx_ref,
        });
        let result: StatusResult = self.rpc_call("tx_status", params).await?;

        Ok(match result.state {
            GatewayTxState::Rejected => TxStatus::Rejected(
                result
                    .reason
                    .unwrap_or_else(|| "rejected by canister".to_string()),
            ),
            GatewayTxState::Finalized if result.confirmations >= self.confirmation_depth => {
                TxStatus::Confirmed
            }
            _ => TxStatus::Pending,
        })
    }

    async fn query_lock(&self, tx_ref: &TxRef) -> LedgerResult<LockRecord> {
        let params = json!({
            "canister_id": self.canister_id,
            "tx_ref": tx_ref,
        });
        let result: LockInfoResult = self.rpc_call("lock_info", params).await?;
        let amount = result.amount.parse().map_err(|e| {
            LedgerError::permanent(Chain::B, format!("bad lock amount {:?}: {}", result.amount, e))
        })?;

        Ok(LockRecord {
            account: result.account,
            amount,
        })
    }

    async fn query_balance(&self, account: &str) -> LedgerResult<Amount> {
        let params = json!({
            "canister_id": self.canister_id,
            "account": account,
        });
        let result: BalanceResult = self.rpc_call("balance_of", params).await?;
        result.balance.parse().map_err(|e| {
            LedgerError::permanent(Chain::B, format!("bad balance {:?}: {}", result.balance, e))
        })
    }

    async fn health_check(&self) -> LedgerResult<()> {
        let params = json!({ "canister_id": self.canister_id });
        let result: CanisterStatusResult = self.rpc_call("canister_status", params).await?;
        if result.status != "running" {
            return Err(LedgerError::transient(
                Chain::B,
                format!("canister {} is {}", self.canister_id, result.status),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::Value;

    /// Stand-in gateway answering by method name
    async fn gateway(Json(body): Json<Value>) -> Json<Value> {
        let params = &body["params"];
        let reply = match body["method"].as_str().unwrap_or_default() {
            "balance_of" => json!({ "result": { "balance": "340282366920938463463374607431768211455" } }),
            "lock" => json!({ "result": { "tx_ref": format!("b-{}", params["idempotency_key"].as_str().unwrap()) } }),
            "tx_status" => match params["tx_ref"].as_str().unwrap() {
                "deep" => json!({ "result": { "state": "finalized", "confirmations": 3 } }),
                "shallow" => json!({ "result": { "state": "finalized", "confirmations": 0 } }),
                _ => json!({ "result": { "state": "rejected", "reason": "bad proof" } }),
            },
            "lock_info" => match params["tx_ref"].as_str().unwrap() {
                "b-lock" => json!({ "result": { "account": "bridge-user", "amount": "2500000000000000000" } }),
                _ => json!({ "error": { "code": -32602, "message": "not a bridge lock" } }),
            },
            "canister_status" => json!({ "result": { "status": "running" } }),
            "release" => json!({ "error": { "code": -32602, "message": "account unknown" } }),
            _ => json!({ "error": { "code": -32603, "message": "replica busy" } }),
        };
        Json(reply)
    }

    async fn spawn_gateway() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/", post(gateway)))
                .await
                .unwrap();
        });
        format!("http://{}/", addr)
    }

    fn ledger(url: String) -> CanisterLedger {
        let config = CanisterConfig {
            gateway_url: url,
            canister_id: "bkyz2-fmaaa-aaaaa-qaaaq-cai".to_string(),
            request_timeout_secs: 5,
        };
        CanisterLedger::new(&config, 2).unwrap()
    }

    #[tokio::test]
    async fn test_balance_is_full_u128() {
        let ledger = ledger(spawn_gateway().await);
        assert_eq!(ledger.query_balance("bridge-user").await.unwrap(), u128::MAX);
    }

    #[tokio::test]
    async fn test_lock_sends_idempotency_key() {
        let ledger = ledger(spawn_gateway().await);
        let key = IdempotencyKey::new(crate::request::RequestId::new(), 3);
        let tx = ledger.submit_lock("bridge-user", 10, key).await.unwrap();
        assert_eq!(tx.as_str(), format!("b-{}", key));
    }

    #[tokio::test]
    async fn test_status_applies_depth() {
        let ledger = ledger(spawn_gateway().await);
        assert_eq!(
            ledger.query_status(&TxRef::new("deep")).await.unwrap(),
            TxStatus::Confirmed
        );
        assert_eq!(
            ledger.query_status(&TxRef::new("shallow")).await.unwrap(),
            TxStatus::Pending
        );
        assert_eq!(
            ledger.query_status(&TxRef::new("other")).await.unwrap(),
            TxStatus::Rejected("bad proof".to_string())
        );
    }

    #[tokio::test]
    async fn test_lock_info() {
        let ledger = ledger(spawn_gateway().await);
        assert_eq!(
            ledger.query_lock(&TxRef::new("b-lock")).await.unwrap(),
            LockRecord {
                account: "bridge-user".to_string(),
                amount: 2_500_000_000_000_000_000,
            }
        );
        let err = ledger.query_lock(&TxRef::new("b-release")).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_health_check() {
        assert!(ledger(spawn_gateway().await).health_check().await.is_ok());
        let down = ledger("http://127.0.0.1:9/".to_string());
        assert!(down.health_check().await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_invalid_params_are_permanent() {
        let ledger = ledger(spawn_gateway().await);
        let proof = ReleaseProof {
            request_id: crate::request::RequestId::new(),
            source_chain: Chain::A,
            source_tx_ref: TxRef::new("0xabc"),
        };
        let key = IdempotencyKey::new(proof.request_id, 0);
        let err = ledger
            .submit_release("nobody", 1, &proof, key)
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_transient() {
        // Nothing listens on port 9 locally
        let ledger = ledger("http://127.0.0.1:9/".to_string());
        let err = ledger.query_balance("bridge-user").await.unwrap_err();
        assert!(err.is_transient());
    }
}
