//! Kite REST API client.

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::debug;

use super::traits::{BrokerApi, BrokerError, BrokerResult};
use super::types::{
    AccountMargins, Instrument, MarginEstimate, OhlcBar, OrderModify, OrderRequest, OrderRow,
    PositionRow,
};
use crate::config::KiteConfig;

const BASE_URL: &str = "https://api.kite.trade";

/// All Kite responses wrap the payload in a status envelope.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OrderIdData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct PositionsData {
    day: Vec<PositionRow>,
}

#[derive(Debug, Deserialize)]
struct CandlesData {
    candles: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct LtpEntry {
    last_price: Decimal,
}

#[derive(Debug, Deserialize)]
struct MarginsData {
    equity: EquityMargins,
}

#[derive(Debug, Deserialize)]
struct EquityMargins {
    net: Decimal,
}

#[derive(Debug, Deserialize)]
struct BasketMarginData {
    #[serde(rename = "final")]
    final_margin: BasketMarginTotal,
}

#[derive(Debug, Deserialize)]
struct BasketMarginTotal {
    total: Decimal,
}

/// Kite API client.
pub struct KiteClient {
    http: Client,
    api_key: String,
    access_token: String,
    base_url: String,
}

impl KiteClient {
    /// Create a new client from configuration.
    pub fn new(config: &KiteConfig) -> BrokerResult<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            access_token: config.access_token.clone(),
            base_url: BASE_URL.to_string(),
        })
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Session checksum: `sha256(api_key + request_token + api_secret)`.
    pub fn session_checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(api_key.as_bytes());
        hasher.update(request_token.as_bytes());
        hasher.update(api_secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Exchange a request token for an access token.
    pub async fn generate_session(
        config: &KiteConfig,
        request_token: &str,
    ) -> BrokerResult<String> {
        #[derive(Debug, Deserialize)]
        struct SessionData {
            access_token: String,
        }

        let checksum =
            Self::session_checksum(&config.api_key, request_token, &config.api_secret);

        let http = Client::new();
        let response = http
            .post(format!("{}/session/token", BASE_URL))
            .form(&[
                ("api_key", config.api_key.as_str()),
                ("request_token", request_token),
                ("checksum", checksum.as_str()),
            ])
            .send()
            .await?;

        let data: SessionData = unwrap_envelope(response).await?;
        Ok(data.access_token)
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.access_token)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> BrokerResult<T> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("Authorization", self.auth_header())
            .query(query)
            .send()
            .await?;

        unwrap_envelope(response).await
    }
}

/// Check HTTP and envelope status, returning the payload or an API error.
async fn unwrap_envelope<T: DeserializeOwned>(response: reqwest::Response) -> BrokerResult<T> {
    let status = response.status().as_u16();
    let envelope: Envelope<T> = response.json().await?;

    if envelope.status != "success" {
        return Err(BrokerError::api(
            status,
            envelope.message.unwrap_or_else(|| "request failed".to_string()),
        ));
    }

    envelope
        .data
        .ok_or_else(|| BrokerError::api(status, "missing data in response"))
}

fn decimal_field(value: &serde_json::Value) -> Decimal {
    match value {
        serde_json::Value::Number(n) => {
            Decimal::from_str(&n.to_string()).unwrap_or(Decimal::ZERO)
        }
        serde_json::Value::String(s) => Decimal::from_str(s).unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}

/// Split a CSV line, honoring double-quoted fields (instrument names can
/// contain commas).
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    fields.push(current);
    fields
}

fn parse_instrument_line(line: &str) -> Option<Instrument> {
    // Columns: instrument_token, exchange_token, tradingsymbol, name,
    // last_price, expiry, strike, tick_size, lot_size, instrument_type,
    // segment, exchange
    let fields = split_csv_line(line);
    if fields.len() < 12 {
        return None;
    }

    Some(Instrument {
        instrument_token: fields[0].parse().ok()?,
        tradingsymbol: fields[2].clone(),
        name: fields[3].clone(),
        expiry: NaiveDate::parse_from_str(&fields[5], "%Y-%m-%d").ok(),
        strike: Decimal::from_str(&fields[6]).unwrap_or(Decimal::ZERO),
        lot_size: fields[8].parse().unwrap_or(1),
        instrument_type: fields[9].clone(),
        exchange: fields[11].clone(),
    })
}

#[async_trait]
impl BrokerApi for KiteClient {
    async fn instruments(&self, exchange: &str) -> BrokerResult<Vec<Instrument>> {
        let response = self
            .http
            .get(format!("{}/instruments/{}", self.base_url, exchange))
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(BrokerError::api(status, "instrument dump unavailable"));
        }

        let body = response.text().await?;
        let instruments: Vec<Instrument> = body
            .lines()
            .skip(1) // header row
            .filter_map(parse_instrument_line)
            .collect();

        debug!(exchange, count = instruments.len(), "fetched instrument dump");
        Ok(instruments)
    }

    async fn ltp(&self, key: &str) -> BrokerResult<Decimal> {
        let data: HashMap<String, LtpEntry> = self
            .get_json("/quote/ltp", &[("i", key.to_string())])
            .await?;

        data.get(key)
            .map(|entry| entry.last_price)
            .ok_or_else(|| BrokerError::api(404, format!("no quote for {}", key)))
    }

    async fn historical_data(
        &self,
        instrument_token: u32,
        from: NaiveDate,
        to: NaiveDate,
        interval: &str,
    ) -> BrokerResult<Vec<OhlcBar>> {
        let path = format!("/instruments/historical/{}/{}", instrument_token, interval);
        let data: CandlesData = self
            .get_json(
                &path,
                &[
                    ("from", from.format("%Y-%m-%d").to_string()),
                    ("to", to.format("%Y-%m-%d").to_string()),
                ],
            )
            .await?;

        let bars = data
            .candles
            .iter()
            .filter_map(|candle| {
                if candle.len() < 6 {
                    return None;
                }
                let date = candle[0]
                    .as_str()
                    .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())?
                    .with_timezone(&chrono::Utc);
                Some(OhlcBar {
                    date,
                    open: decimal_field(&candle[1]),
                    high: decimal_field(&candle[2]),
                    low: decimal_field(&candle[3]),
                    close: decimal_field(&candle[4]),
                    volume: candle[5].as_u64().unwrap_or(0),
                })
            })
            .collect();

        Ok(bars)
    }

    async fn positions(&self) -> BrokerResult<Vec<PositionRow>> {
        let data: PositionsData = self.get_json("/portfolio/positions", &[]).await?;
        Ok(data.day)
    }

    async fn orders(&self) -> BrokerResult<Vec<OrderRow>> {
        self.get_json("/orders", &[]).await
    }

    async fn place_order(&self, order: &OrderRequest) -> BrokerResult<String> {
        debug!(?order, "placing order");
        let response = self
            .http
            .post(format!("{}/orders/{}", self.base_url, order.variety))
            .header("Authorization", self.auth_header())
            .form(order)
            .send()
            .await?;

        let data: OrderIdData = unwrap_envelope(response).await?;
        Ok(data.order_id)
    }

    async fn modify_order(&self, order_id: &str, modify: &OrderModify) -> BrokerResult<()> {
        debug!(order_id, ?modify, "modifying order");
        let response = self
            .http
            .put(format!(
                "{}/orders/{}/{}",
                self.base_url, modify.variety, order_id
            ))
            .header("Authorization", self.auth_header())
            .form(modify)
            .send()
            .await?;

        let _: OrderIdData = unwrap_envelope(response).await?;
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> BrokerResult<()> {
        debug!(order_id, "cancelling order");
        let response = self
            .http
            .delete(format!("{}/orders/regular/{}", self.base_url, order_id))
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        let _: OrderIdData = unwrap_envelope(response).await?;
        Ok(())
    }

    async fn basket_order_margins(
        &self,
        orders: &[OrderRequest],
    ) -> BrokerResult<MarginEstimate> {
        let response = self
            .http
            .post(format!("{}/margins/basket", self.base_url))
            .header("Authorization", self.auth_header())
            .query(&[("consider_positions", "true")])
            .json(orders)
            .send()
            .await?;

        let data: BasketMarginData = unwrap_envelope(response).await?;
        Ok(MarginEstimate {
            required: data.final_margin.total,
        })
    }

    async fn margins(&self) -> BrokerResult<AccountMargins> {
        let data: MarginsData = self.get_json("/user/margins", &[]).await?;
        Ok(AccountMargins {
            available_cash: data.equity.net,
        })
    }
}
