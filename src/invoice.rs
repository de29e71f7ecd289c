//! Last-invoice lookup: the one request this crate exists to make.
//!
//! The fields are passed through to the remote service untouched; their
//! meaning (tax id, point of sale, voucher type) is the service's business.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RpcError};
use crate::protocol::Response;
use crate::rpc::{HandlerFuture, RequestHandler, RpcClient};

/// Request for the last authorized invoice number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastInvoiceRequest {
    /// Taxpayer id
    pub cuit: String,
    /// Point of sale
    pub pto_vta: String,
    /// Voucher type
    pub cbte_tipo: String,
}

impl LastInvoiceRequest {
    /// Create a request
    pub fn new(cuit: impl Into<String>, pto_vta: impl Into<String>, cbte_tipo: impl Into<String>) -> Self {
        Self {
            cuit: cuit.into(),
            pto_vta: pto_vta.into(),
            cbte_tipo: cbte_tipo.into(),
        }
    }

    /// Check that every field is present and non-empty
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("cuit", &self.cuit),
            ("pto_vta", &self.pto_vta),
            ("cbte_tipo", &self.cbte_tipo),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RpcError::InvalidRequest(format!(
                "Missing required parameters: {}",
                missing.join(", ")
            )))
        }
    }

    /// Parse and validate a decoded request body
    pub fn from_value(value: &Value) -> Result<Self> {
        let request = Self {
            cuit: field(value, "cuit"),
            pto_vta: field(value, "pto_vta"),
            cbte_tipo: field(value, "cbte_tipo"),
        };
        request.validate()?;
        Ok(request)
    }
}

/// Accepts strings and numbers (e.g. `"pto_vta": 1`); anything else is treated as missing.
fn field(value: &Value, name: &str) -> String {
    match value.get(name) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

impl RpcClient {
    /// Ask the remote service for the last invoice number.
    ///
    /// `timeout` defaults to the configured `rpc.timeout_secs`. A reply that
    /// is not valid JSON is returned as a decode-failure [`Response`].
    pub async fn request_last_invoice(
        &self,
        cuit: &str,
        pto_vta: &str,
        cbte_tipo: &str,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let request = LastInvoiceRequest::new(cuit, pto_vta, cbte_tipo);
        request.validate()?;
        let timeout = timeout.unwrap_or_else(|| self.config().rpc.timeout());
        self.execute(&request, timeout).await
    }
}

/// [`RequestHandler`] that validates last-invoice requests before passing
/// them to a lookup function.
pub struct LastInvoiceService<F> {
    lookup: F,
}

impl<F, Fut> LastInvoiceService<F>
where
    F: Fn(LastInvoiceRequest) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
{
    /// Wrap a lookup function
    pub fn new(lookup: F) -> Self {
        Self { lookup }
    }
}

impl<F, Fut> RequestHandler for LastInvoiceService<F>
where
    F: Fn(LastInvoiceRequest) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, String>> + Send + 'static,
{
    fn handle<'a>(&'a self, request: &'a Value) -> HandlerFuture<'a> {
        match LastInvoiceRequest::from_value(request) {
            Ok(request) => Box::pin((self.lookup)(request)),
            Err(e) => {
                let reason = match e {
                    RpcError::InvalidRequest(reason) => reason,
                    other => other.to_string(),
                };
                Box::pin(async move { Err(reason) })
            },
        }
    }
}
