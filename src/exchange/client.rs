//! Binance USDⓈ-M futures REST client.
//!
//! Plain orders go through `/fapi/v1/order` (addressed by
//! `origClientOrderId`), conditional TP/SL orders through
//! `/fapi/v1/algoOrder` (addressed by `clientAlgoId`).

use crate::config::BinanceConfig;
use crate::error::ExchangeError;
use crate::exchange::traits::ExchangeClient;
use crate::exchange::types::*;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, instrument};

const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
const FUTURES_TESTNET_URL: &str = "https://testnet.binancefuture.com";

/// Binance futures client implementing [`ExchangeClient`].
pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    recv_window_ms: u64,
    request_timeout: Duration,
}

impl BinanceClient {
    /// Create a new Binance client from configuration.
    pub fn new(config: &BinanceConfig) -> anyhow::Result<Self> {
        let base_url = if config.testnet {
            FUTURES_TESTNET_URL
        } else {
            FUTURES_BASE_URL
        };
        Self::with_base_url(config, base_url)
    }

    /// Create a client against a custom base URL (testing, proxies).
    pub fn with_base_url(config: &BinanceConfig, base_url: &str) -> anyhow::Result<Self> {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            recv_window_ms: config.recv_window_ms,
            request_timeout,
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn encode_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Append recvWindow/timestamp and sign the query.
    fn signed_query(&self, mut params: Vec<(&str, String)>) -> String {
        params.push(("recvWindow", self.recv_window_ms.to_string()));
        params.push(("timestamp", Utc::now().timestamp_millis().to_string()));
        let query_string = Self::encode_query(&params);
        let signature = self.sign(&query_string);
        format!("{}&signature={}", query_string, signature)
    }

    async fn send_signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, self.signed_query(params));
        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        Self::decode(response).await
    }

    async fn send_public<T: DeserializeOwned>(
        &self,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T, ExchangeError> {
        let url = if params.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, Self::encode_query(&params))
        };
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_http_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::Decode(format!("{}: {}", e, body)))
    }

    fn map_transport(&self, err: reqwest::Error) -> ExchangeError {
        if err.is_timeout() {
            ExchangeError::Timeout(self.request_timeout)
        } else {
            ExchangeError::Transport(err.to_string())
        }
    }
}

/// Classify a non-2xx response.
pub(crate) fn classify_http_error(status: StatusCode, body: &str) -> ExchangeError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 {
        return ExchangeError::RateLimited(format!("HTTP {}: {}", status.as_u16(), body));
    }

    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(err) => classify_api_error(err.code, err.msg),
        Err(_) if status.is_server_error() => {
            ExchangeError::Transport(format!("HTTP {}: {}", status.as_u16(), body))
        }
        Err(_) => ExchangeError::Rejected {
            code: i64::from(status.as_u16()),
            message: body.to_string(),
        },
    }
}

/// Map Binance error codes onto the exchange error classes.
pub(crate) fn classify_api_error(code: i64, message: String) -> ExchangeError {
    match code {
        // Too many requests / IP banned
        -1003 | -1015 => ExchangeError::RateLimited(message),
        // Disconnected, backend timeout, timestamp outside recvWindow
        -1000 | -1001 | -1006 | -1007 | -1021 => ExchangeError::Transport(message),
        // Unknown order / order does not exist
        -2011 | -2013 => ExchangeError::NotFound(message),
        -4116 => ExchangeError::Duplicate(message),
        _ => ExchangeError::Rejected { code, message },
    }
}

fn millis_to_utc(ms: Option<i64>) -> Option<chrono::DateTime<Utc>> {
    ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

#[async_trait]
impl ExchangeClient for BinanceClient {
    #[instrument(skip(self), fields(client_id = %order.new_client_order_id))]
    async fn submit_order(&self, order: &NewOrder) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", order.order_type.as_str().to_string()),
            ("quantity", order.quantity.normalize().to_string()),
            ("newClientOrderId", order.new_client_order_id.clone()),
            ("newOrderRespType", "RESULT".to_string()),
        ];

        if let Some(price) = &order.price {
            params.push(("price", price.normalize().to_string()));
        }

        if let Some(tif) = &order.time_in_force {
            params.push(("timeInForce", tif.as_str().to_string()));
        }

        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        debug!("Placing futures order: {:?}", order);

        let response: OrderResponse = self
            .send_signed(Method::POST, "/fapi/v1/order", params)
            .await?;

        Ok(OrderAck {
            exchange_order_id: response.order_id.to_string(),
            client_id: response.client_order_id,
            status: response.status,
            executed_qty: response.executed_qty,
            avg_price: response.avg_price.filter(|p| !p.is_zero()),
        })
    }

    #[instrument(skip(self), fields(client_id = %order.client_algo_id))]
    async fn submit_conditional_order(
        &self,
        order: &ConditionalOrder,
    ) -> Result<OrderAck, ExchangeError> {
        let mut params = vec![
            ("algoType", "CONDITIONAL".to_string()),
            ("symbol", order.symbol.clone()),
            ("side", order.side.as_str().to_string()),
            ("type", order.order_type.as_str().to_string()),
            ("quantity", order.quantity.normalize().to_string()),
            ("triggerPrice", order.trigger_price.normalize().to_string()),
            ("workingType", "MARK_PRICE".to_string()),
            ("clientAlgoId", order.client_algo_id.clone()),
        ];

        if order.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        debug!("Placing conditional order: {:?}", order);

        let response: AlgoOrderResponse = self
            .send_signed(Method::POST, "/fapi/v1/algoOrder", params)
            .await?;

        Ok(OrderAck {
            exchange_order_id: response.algo_id.to_string(),
            client_id: response.client_algo_id,
            status: response.algo_status,
            executed_qty: rust_decimal::Decimal::ZERO,
            avg_price: None,
        })
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, leg: &LegRef) -> Result<(), ExchangeError> {
        if leg.conditional {
            let _: AlgoOrderResponse = self
                .send_signed(
                    Method::DELETE,
                    "/fapi/v1/algoOrder",
                    vec![("clientAlgoId", leg.client_id.clone())],
                )
                .await?;
        } else {
            let _: OrderResponse = self
                .send_signed(
                    Method::DELETE,
                    "/fapi/v1/order",
                    vec![
                        ("symbol", leg.symbol.clone()),
                        ("origClientOrderId", leg.client_id.clone()),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query_status(&self, leg: &LegRef) -> Result<OrderStatusReport, ExchangeError> {
        if leg.conditional {
            let response: AlgoOrderResponse = self
                .send_signed(
                    Method::GET,
                    "/fapi/v1/algoOrder",
                    vec![("clientAlgoId", leg.client_id.clone())],
                )
                .await?;

            Ok(OrderStatusReport {
                client_id: response.client_algo_id,
                exchange_order_id: Some(response.algo_id.to_string()),
                status: response.algo_status,
                executed_qty: None,
                avg_price: response.actual_price.filter(|p| !p.is_zero()),
                updated_at: millis_to_utc(response.update_time),
            })
        } else {
            let response: OrderResponse = self
                .send_signed(
                    Method::GET,
                    "/fapi/v1/order",
                    vec![
                        ("symbol", leg.symbol.clone()),
                        ("origClientOrderId", leg.client_id.clone()),
                    ],
                )
                .await?;

            Ok(OrderStatusReport {
                client_id: response.client_order_id,
                exchange_order_id: Some(response.order_id.to_string()),
                status: response.status,
                executed_qty: Some(response.executed_qty),
                avg_price: response.avg_price.filter(|p| !p.is_zero()),
                updated_at: millis_to_utc(response.update_time),
            })
        }
    }

    #[instrument(skip(self))]
    async fn set_leverage(&self, symbol: &str, leverage: u8) -> Result<(), ExchangeError> {
        let _: serde_json::Value = self
            .send_signed(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn trading_rules(&self, symbol: &str) -> Result<TradingRules, ExchangeError> {
        let info: FuturesExchangeInfo = self.send_public("/fapi/v1/exchangeInfo", vec![]).await?;

        info.symbols
            .iter()
            .find(|s| s.symbol == symbol)
            .and_then(FuturesSymbolInfo::trading_rules)
            .ok_or_else(|| ExchangeError::NotFound(format!("trading rules for {}", symbol)))
    }

    #[instrument(skip(self))]
    async fn market_snapshot(&self, symbol: &str) -> Result<MarketSnapshot, ExchangeError> {
        let ticker: Ticker24h = self
            .send_public("/fapi/v1/ticker/24hr", vec![("symbol", symbol.to_string())])
            .await?;

        Ok(MarketSnapshot {
            symbol: ticker.symbol,
            last_price: ticker.last_price,
            price_change_pct: ticker.price_change_percent,
            high_24h: ticker.high_price,
            low_24h: ticker.low_price,
            quote_volume_24h: ticker.quote_volume,
            observed_at: millis_to_utc(Some(ticker.close_time)).unwrap_or_else(Utc::now),
        })
    }
}
