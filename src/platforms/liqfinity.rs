//! Liqfinity REST integration.
//!
//! Staking (lock/unlock) and collateralised lending (borrow/repay) for a
//! single asset. Every response is wrapped in `{ success, message, data }`;
//! `success: false` is a business rejection, not a transport failure.
//!
//! Base URL: https://api.testnet.liqfinity.com/v1
//! Auth: `Authorization: Bearer {token}` on every request.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ORIGIN, REFERER};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{ApiError, ApiResult, CurrencyListing, LendingPlatform};
use crate::config::ApiConfig;
use crate::types::{
    BorrowQuote, BorrowRequest, Currency, Loan, Points, StakeQuote, StakeRecord, Wallet,
};

/// Longest body excerpt kept in a transport error.
const MAX_ERROR_BODY: usize = 300;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Validate bodies carry the amount as a JSON number.
#[derive(Debug, Serialize)]
struct AmountBody {
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
}

/// Create bodies echo the validated quote as strings so no float
/// round-trip can alter it.
#[derive(Debug, Serialize)]
struct StakeCreateBody {
    #[serde(with = "rust_decimal::serde::str")]
    amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    fee: Decimal,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct LiqfinityClient {
    http: Client,
    base_url: String,
    asset: String,
    token: SecretString,
}

impl LiqfinityClient {
    pub fn new(cfg: &ApiConfig, token: SecretString) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
        headers.insert(
            ORIGIN,
            HeaderValue::from_str(&cfg.origin).context("Invalid api.origin header")?,
        );
        headers.insert(
            REFERER,
            HeaderValue::from_str(&cfg.referer).context("Invalid api.referer header")?,
        );

        let http = Client::builder()
            .timeout(cfg.timeout())
            .user_agent(cfg.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client for Liqfinity")?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            asset: cfg.asset.clone(),
            token,
        })
    }

    // -- Internal helpers ------------------------------------------------

    /// Send one request and unwrap the response envelope.
    async fn call<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> ApiResult<Value> {
        let url = format!("{}{path}", self.base_url);
        debug!(%method, url = %url, "Liqfinity request");

        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(self.token.expose_secret());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        parse_envelope(status, &text)
    }

    async fn get(&self, path: &str) -> ApiResult<Value> {
        self.call::<()>(Method::GET, path, None).await
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ApiResult<Value> {
        self.call(Method::POST, path, Some(body)).await
    }

    fn stake_path(&self, action: &str) -> String {
        format!("/user/stakes/{}/{action}", urlencoding::encode(&self.asset))
    }
}

/// Unwrap `{ success, message, data }`.
///
/// A body that isn't JSON on a non-2xx status is a transport failure;
/// a JSON body with `success: false` is a rejection regardless of status.
fn parse_envelope(status: StatusCode, body: &str) -> ApiResult<Value> {
    let envelope: Envelope = match serde_json::from_str(body) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => {
            let excerpt: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(ApiError::Transport(format!("HTTP {status}: {excerpt}")));
        }
        Err(e) => return Err(ApiError::Malformed(format!("invalid JSON body: {e}"))),
    };

    if !envelope.success {
        return Err(ApiError::Rejected {
            message: envelope.message,
        });
    }

    envelope
        .data
        .ok_or_else(|| ApiError::Malformed("missing data".into()))
}

/// Pull `data.<key>` out and deserialize it.
fn take_field<T: DeserializeOwned>(mut data: Value, key: &str) -> ApiResult<T> {
    let field = data
        .get_mut(key)
        .map(Value::take)
        .filter(|v| !v.is_null())
        .ok_or_else(|| ApiError::Malformed(format!("missing data.{key}")))?;

    serde_json::from_value(field).map_err(|e| ApiError::Malformed(format!("data.{key}: {e}")))
}

/// The currency listing has been seen both as a bare array and as
/// `{ currencies: [...] }`.
fn parse_listing(data: Value) -> ApiResult<CurrencyListing> {
    let entries = match data {
        Value::Array(entries) => entries,
        Value::Object(mut obj) => match obj.remove("currencies") {
            Some(Value::Array(entries)) => entries,
            _ => return Ok(CurrencyListing::Unrecognized),
        },
        _ => return Ok(CurrencyListing::Unrecognized),
    };

    let currencies: Vec<Currency> = serde_json::from_value(Value::Array(entries))
        .map_err(|e| ApiError::Malformed(format!("currency listing: {e}")))?;
    Ok(CurrencyListing::Listed(currencies))
}

#[async_trait]
impl LendingPlatform for LiqfinityClient {
    async fn wallet(&self) -> ApiResult<Wallet> {
        let data = self.get("/user/wallets").await?;
        let wallets: Vec<Wallet> = take_field(data, "wallets")?;
        wallets
            .into_iter()
            .find(|w| w.code == self.asset)
            .ok_or_else(|| ApiError::Malformed(format!("no {} wallet", self.asset)))
    }

    async fn points(&self) -> ApiResult<Points> {
        let data = self.get("/user/points").await?;
        take_field(data, "points")
    }

    async fn validate_lock(&self, amount: Decimal) -> ApiResult<StakeQuote> {
        let data = self
            .post(&self.stake_path("stake/validate"), &AmountBody { amount })
            .await?;
        take_field(data, "stake")
    }

    async fn create_lock(&self, amount: Decimal, fee: Decimal) -> ApiResult<StakeRecord> {
        let data = self
            .post(&self.stake_path("stake/create"), &StakeCreateBody { amount, fee })
            .await?;
        take_field(data, "stake")
    }

    async fn validate_unlock(&self, amount: Decimal) -> ApiResult<StakeQuote> {
        let data = self
            .post(&self.stake_path("liquidation/validate"), &AmountBody { amount })
            .await?;
        take_field(data, "liquidation")
    }

    async fn create_unlock(&self, amount: Decimal, fee: Decimal) -> ApiResult<StakeRecord> {
        let data = self
            .post(&self.stake_path("liquidation/create"), &StakeCreateBody { amount, fee })
            .await?;
        take_field(data, "liquidation")
    }

    async fn list_currencies(&self) -> ApiResult<CurrencyListing> {
        let data = self.get("/user/loans/currencies").await?;
        parse_listing(data)
    }

    async fn currency(&self, code: &str) -> ApiResult<Currency> {
        let path = format!("/user/loans/currencies/{}", urlencoding::encode(code));
        let mut data = self.get(&path).await?;
        if let Some(obj) = data.as_object_mut() {
            obj.entry("code")
                .or_insert_with(|| Value::String(code.to_string()));
        }
        serde_json::from_value(data).map_err(|e| ApiError::Malformed(format!("currency {code}: {e}")))
    }

    async fn validate_borrow(&self, request: &BorrowRequest) -> ApiResult<BorrowQuote> {
        let data = self.post("/user/loans/validate-borrow", request).await?;
        take_field(data, "loan")
    }

    async fn confirm_borrow(&self, request: &BorrowRequest) -> ApiResult<Loan> {
        let data = self.post("/user/loans/confirm-borrow", request).await?;
        take_field(data, "loan")
    }

    async fn loans(&self) -> ApiResult<Vec<Loan>> {
        let data = self.get("/user/loans?&order[createdAt]=DESC").await?;
        take_field(data, "loans")
    }

    async fn repay(&self, loan_id: &str, amount: Decimal) -> ApiResult<Loan> {
        let path = format!("/user/loans/{}/repay", urlencoding::encode(loan_id));
        let data = self.post(&path, &AmountBody { amount }).await?;
        take_field(data, "loan")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
