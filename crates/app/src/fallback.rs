use anyhow::{Context, Result};
use chrono::Utc;
use dexquote_builders::BuilderRegistry;
use dexquote_config::FallbackConfig;
use dexquote_core_types::{
    PriceObservation, PUMP_FUN_PROGRAM, PUMP_SWAP_PROGRAM, RAYDIUM_V4_PROGRAM, WSOL_MINT,
};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Aggregator route labels mapped to the program ids this service builds
/// against. Labels outside this table are not admitted.
const LABEL_PROGRAMS: &[(&str, &str)] = &[
    ("Raydium", RAYDIUM_V4_PROGRAM),
    ("Raydium AMM", RAYDIUM_V4_PROGRAM),
    ("Pump.fun", PUMP_FUN_PROGRAM),
    ("Pump.fun Amm", PUMP_SWAP_PROGRAM),
    ("PumpSwap", PUMP_SWAP_PROGRAM),
];

/// Last-resort price lookup against an external aggregator: probes a fixed
/// SOL amount into the mint and admits single-hop routes only. Every failure
/// degrades to "no price"; nothing here is fatal.
pub struct PriceFallback {
    enabled: bool,
    http: Client,
    quote_url: String,
    probe_lamports: u64,
}

impl PriceFallback {
    pub fn new(config: &FallbackConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(500)))
            .build()
            .context("failed building fallback http client")?;
        Ok(Self {
            enabled: config.enabled,
            http,
            quote_url: config.quote_url.trim().to_string(),
            probe_lamports: config.probe_lamports.max(1),
        })
    }

    pub async fn lookup(
        &self,
        mint: &str,
        registry: &BuilderRegistry,
    ) -> Option<PriceObservation> {
        if !self.enabled || self.quote_url.is_empty() {
            return None;
        }
        match self.fetch_quote(mint).await {
            Ok(response) => admit_quote(mint, &response, registry),
            Err(error) => {
                debug!(mint, error = %error, "fallback quote fetch failed");
                None
            }
        }
    }

    async fn fetch_quote(&self, mint: &str) -> Result<Value> {
        let response = self
            .http
            .get(&self.quote_url)
            .query(&[
                ("inputMint", WSOL_MINT),
                ("outputMint", mint),
                ("amount", &self.probe_lamports.to_string()),
                ("slippageBps", "100"),
            ])
            .send()
            .await
            .with_context(|| format!("fallback quote GET failed via {}", self.quote_url))?
            .error_for_status()
            .context("non-success fallback quote status")?
            .json()
            .await
            .context("failed parsing fallback quote json")?;
        Ok(response)
    }
}

/// Admission rules: exactly one route hop, a known label mapping to a
/// registered builder, and positive raw amounts on both legs.
fn admit_quote(
    mint: &str,
    response: &Value,
    registry: &BuilderRegistry,
) -> Option<PriceObservation> {
    let route_plan = response.get("routePlan").and_then(Value::as_array)?;
    if route_plan.len() != 1 {
        debug!(mint, hops = route_plan.len(), "discarding multi-hop fallback route");
        return None;
    }
    let swap_info = route_plan[0].get("swapInfo")?;

    let label = swap_info.get("label").and_then(Value::as_str)?;
    let program_id = LABEL_PROGRAMS
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(label))
        .map(|(_, program)| *program)?;
    if !registry.has_builder(program_id) {
        debug!(mint, label, "fallback route label maps to unregistered program");
        return None;
    }

    let pool = swap_info.get("ammKey").and_then(Value::as_str)?;
    let in_amount = parse_raw_amount(swap_info.get("inAmount"))?;
    let out_amount = parse_raw_amount(swap_info.get("outAmount"))?;
    if in_amount == 0 || out_amount == 0 {
        return None;
    }
    let avg_price = in_amount as f64 / out_amount as f64;
    let slot = response
        .get("contextSlot")
        .and_then(Value::as_u64)
        .unwrap_or_default();

    Some(PriceObservation::new(
        mint,
        pool,
        avg_price,
        program_id,
        slot,
        Utc::now().timestamp_millis(),
    ))
}

fn parse_raw_amount(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    if let Some(amount) = value.as_u64() {
        return Some(amount);
    }
    value.as_str()?.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn single_hop_response(label: &str) -> Value {
        json!({
            "inputMint": WSOL_MINT,
            "outputMint": "MintM",
            "contextSlot": 312_000_555u64,
            "routePlan": [
                {
                    "swapInfo": {
                        "ammKey": "PoolFromAggregator",
                        "label": label,
                        "inAmount": "1000000000",
                        "outAmount": "500000"
                    },
                    "percent": 100
                }
            ]
        })
    }

    #[test]
    fn single_hop_known_label_is_admitted() {
        let registry = BuilderRegistry::new();
        let observation =
            admit_quote("MintM", &single_hop_response("Raydium"), &registry).expect("admitted");
        assert_eq!(observation.mint, "MintM");
        assert_eq!(observation.pool, "PoolFromAggregator");
        assert_eq!(observation.program_id, RAYDIUM_V4_PROGRAM);
        assert!((observation.avg_price - 2_000.0).abs() < f64::EPSILON);
        assert_eq!(observation.slot, "312000555");
    }

    #[test]
    fn multi_hop_routes_are_discarded() {
        let registry = BuilderRegistry::new();
        let mut response = single_hop_response("Raydium");
        let hop = response["routePlan"][0].clone();
        response["routePlan"].as_array_mut().unwrap().push(hop);
        assert!(admit_quote("MintM", &response, &registry).is_none());
    }

    #[test]
    fn unknown_labels_are_discarded() {
        let registry = BuilderRegistry::new();
        let response = single_hop_response("Obscure DEX");
        assert!(admit_quote("MintM", &response, &registry).is_none());
    }

    #[test]
    fn label_match_is_case_insensitive() {
        let registry = BuilderRegistry::new();
        let observation = admit_quote("MintM", &single_hop_response("pumpswap"), &registry)
            .expect("admitted");
        assert_eq!(observation.program_id, PUMP_SWAP_PROGRAM);
    }

    #[test]
    fn zero_amounts_are_discarded() {
        let registry = BuilderRegistry::new();
        let mut response = single_hop_response("Raydium");
        response["routePlan"][0]["swapInfo"]["outAmount"] = json!("0");
        assert!(admit_quote("MintM", &response, &registry).is_none());
    }
}
