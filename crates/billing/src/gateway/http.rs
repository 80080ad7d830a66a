//! HTTPS adapter for the card gateway REST API
//!
//! For a charge, any non-2xx response is a decline. Transport failures before
//! the request left the process are declines too; anything after that
//! (timeouts, truncated bodies) is indeterminate.
//!
//! A lookup only declines on evidence that no capture exists: a 404 for the
//! order or a terminal status in the body. Everything else is indeterminate.

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;

use super::{
    ApprovedCharge, BillingKeyIssue, CardInfo, ChargeResult, DeclinedCharge, PaymentGateway,
};
use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayment {
    payment_key: String,
    order_id: String,
    status: String,
    total_amount: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    approved_at: Option<OffsetDateTime>,
    method: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCard {
    issuer_code: Option<String>,
    number: Option<String>,
    card_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireBillingKey {
    billing_key: String,
    card: Option<WireCard>,
}

/// reqwest-backed [`PaymentGateway`]
#[derive(Clone)]
pub struct HttpGateway {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(self.url(path))
            .basic_auth(&self.config.secret_key, None::<&str>)
    }

    async fn send_charge(&self, request: reqwest::RequestBuilder, order_id: &str) -> ChargeResult {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                tracing::warn!(order_id = %order_id, error = %e, "Gateway unreachable");
                return ChargeResult::Declined(DeclinedCharge {
                    code: "NETWORK_ERROR".to_string(),
                    message: e.to_string(),
                    http_status: None,
                });
            }
            Err(e) => {
                tracing::warn!(order_id = %order_id, error = %e, "Gateway call outcome unknown");
                return ChargeResult::Indeterminate {
                    reason: e.to_string(),
                };
            }
        };

        let status = response.status();
        if !status.is_success() {
            return ChargeResult::Declined(decline_from_response(response).await);
        }

        read_payment(response).await
    }

    async fn send_lookup(&self, request: reqwest::RequestBuilder, order_id: &str) -> ChargeResult {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(order_id = %order_id, error = %e, "Gateway lookup failed");
                return ChargeResult::Indeterminate {
                    reason: format!("lookup failed: {}", e),
                };
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return ChargeResult::Declined(decline_from_response(response).await);
        }
        if !status.is_success() {
            tracing::warn!(order_id = %order_id, status = status.as_u16(), "Gateway lookup inconclusive");
            return ChargeResult::Indeterminate {
                reason: format!("lookup returned HTTP {}", status.as_u16()),
            };
        }

        read_payment(response).await
    }
}

async fn read_payment(response: reqwest::Response) -> ChargeResult {
    match response.json::<WirePayment>().await {
        Ok(payment) => translate_payment(payment),
        Err(e) => ChargeResult::Indeterminate {
            reason: format!("unreadable gateway response: {}", e),
        },
    }
}

async fn decline_from_response(response: reqwest::Response) -> DeclinedCharge {
    let status = response.status();
    match response.json::<WireError>().await {
        Ok(err) => DeclinedCharge {
            code: err.code,
            message: err.message,
            http_status: Some(status.as_u16()),
        },
        Err(_) => DeclinedCharge {
            code: format!("HTTP_{}", status.as_u16()),
            message: status
                .canonical_reason()
                .unwrap_or("gateway error")
                .to_string(),
            http_status: Some(status.as_u16()),
        },
    }
}

fn translate_payment(payment: WirePayment) -> ChargeResult {
    match (payment.status.as_str(), payment.approved_at) {
        ("DONE", Some(approved_at)) => ChargeResult::Approved(ApprovedCharge {
            payment_key: payment.payment_key,
            order_id: payment.order_id,
            amount: payment.total_amount,
            approved_at,
            method: payment.method,
        }),
        ("CANCELED" | "PARTIAL_CANCELED" | "ABORTED" | "EXPIRED", _) => {
            ChargeResult::Declined(DeclinedCharge {
                code: payment.status.clone(),
                message: format!("payment is {}", payment.status),
                http_status: None,
            })
        }
        (other, _) => ChargeResult::Indeterminate {
            reason: format!("payment still {}", other),
        },
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn issue_billing_key(
        &self,
        auth_key: &str,
        customer_key: &str,
    ) -> BillingResult<BillingKeyIssue> {
        let response = self
            .post("/v1/billing/authorizations/issue")
            .json(&serde_json::json!({
                "authKey": auth_key,
                "customerKey": customer_key,
            }))
            .send()
            .await
            .map_err(|e| BillingError::GatewayTransport(e.to_string()))?;

        if !response.status().is_success() {
            let decline = decline_from_response(response).await;
            return Err(BillingError::GatewayDeclined {
                code: decline.code,
                message: decline.message,
            });
        }

        let issued: WireBillingKey = response
            .json()
            .await
            .map_err(|e| BillingError::GatewayTransport(format!("unreadable billing key: {}", e)))?;

        let card = issued
            .card
            .map(|c| CardInfo {
                issuer_code: c.issuer_code,
                masked_number: c.number,
                card_type: c.card_type,
            })
            .unwrap_or_default();

        Ok(BillingKeyIssue {
            billing_key: issued.billing_key,
            card,
        })
    }

    async fn confirm_charge(&self, payment_key: &str, order_id: &str, amount: i64) -> ChargeResult {
        let request = self.post("/v1/payments/confirm").json(&serde_json::json!({
            "paymentKey": payment_key,
            "orderId": order_id,
            "amount": amount,
        }));
        self.send_charge(request, order_id).await
    }

    async fn charge_with_key(
        &self,
        billing_key: &str,
        customer_key: &str,
        amount: i64,
        order_id: &str,
        order_name: &str,
    ) -> ChargeResult {
        let request = self
            .post(&format!("/v1/billing/{}", billing_key))
            .json(&serde_json::json!({
                "customerKey": customer_key,
                "amount": amount,
                "orderId": order_id,
                "orderName": order_name,
            }));
        self.send_charge(request, order_id).await
    }

    async fn lookup_charge(&self, order_id: &str) -> ChargeResult {
        let request = self
            .http
            .get(self.url(&format!("/v1/payments/orders/{}", order_id)))
            .basic_auth(&self.config.secret_key, None::<&str>);
        self.send_lookup(request, order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const AUTH_HEADER: &str = "Basic dGVzdF9za19leGFtcGxlOg==";

    fn gateway(base: &str) -> HttpGateway {
        HttpGateway::new(GatewayConfig {
            api_base: base.to_string(),
            secret_key: "test_sk_example".to_string(),
            timeout: Duration::from_secs(5),
            lookup_attempts: 1,
            webhook_secret: "unused-unused-unused-unused-unused".to_string(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_confirm_charge_approved() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/payments/confirm")
            .match_header("authorization", AUTH_HEADER)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"paymentKey":"pk_1","orderId":"order-1","status":"DONE","totalAmount":9900,
                    "approvedAt":"2024-02-13T12:18:14+09:00","method":"CARD"}"#,
            )
            .create_async()
            .await;

        let result = gateway(&server.url()).confirm_charge("pk_1", "order-1", 9900).await;
        mock.assert_async().await;

        match result {
            ChargeResult::Approved(charge) => {
                assert_eq!(charge.payment_key, "pk_1");
                assert_eq!(charge.amount, 9900);
                assert_eq!(charge.method.as_deref(), Some("CARD"));
            }
            other => panic!("expected approval, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_2xx_is_declined() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/billing/bk_1")
            .with_status(403)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":"REJECT_CARD_COMPANY","message":"limit exceeded"}"#)
            .create_async()
            .await;

        let result = gateway(&server.url())
            .charge_with_key("bk_1", "cus_1", 9900, "order-2", "Monthly plan")
            .await;

        assert_eq!(
            result,
            ChargeResult::Declined(DeclinedCharge {
                code: "REJECT_CARD_COMPANY".to_string(),
                message: "limit exceeded".to_string(),
                http_status: Some(403),
            })
        );
    }

    #[tokio::test]
    async fn test_server_error_without_body_is_declined() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/payments/confirm")
            .with_status(502)
            .create_async()
            .await;

        let result = gateway(&server.url()).confirm_charge("pk", "order-3", 100).await;
        match result {
            ChargeResult::Declined(decline) => assert_eq!(decline.code, "HTTP_502"),
            other => panic!("expected decline, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lookup_in_progress_is_indeterminate() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/payments/orders/order-4")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"paymentKey":"pk_4","orderId":"order-4","status":"IN_PROGRESS","totalAmount":100}"#,
            )
            .create_async()
            .await;

        let result = gateway(&server.url()).lookup_charge("order-4").await;
        assert!(result.is_indeterminate());
    }

    #[tokio::test]
    async fn test_lookup_server_error_is_indeterminate() {
        let mut server = mockito::Server::new_async().await;
        for (order_id, status) in [("order-5", 503), ("order-6", 429), ("order-7", 401)] {
            server
                .mock("GET", format!("/v1/payments/orders/{}", order_id).as_str())
                .with_status(status)
                .with_header("content-type", "application/json")
                .with_body(r#"{"code":"PROVIDER_ERROR","message":"try again"}"#)
                .create_async()
                .await;

            let result = gateway(&server.url()).lookup_charge(order_id).await;
            assert!(result.is_indeterminate(), "HTTP {} gave {:?}", status, result);
        }
    }

    #[tokio::test]
    async fn test_lookup_unreachable_is_indeterminate() {
        let result = gateway("http://127.0.0.1:9").lookup_charge("order-8").await;
        assert!(result.is_indeterminate());
    }

    #[tokio::test]
    async fn test_lookup_not_found_is_declined() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/payments/orders/order-9")
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":"NOT_FOUND_PAYMENT","message":"no such payment"}"#)
            .create_async()
            .await;

        let result = gateway(&server.url()).lookup_charge("order-9").await;
        assert!(matches!(result, ChargeResult::Declined(ref d) if d.code == "NOT_FOUND_PAYMENT"));
    }

    #[tokio::test]
    async fn test_lookup_aborted_is_declined() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/payments/orders/order-10")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"paymentKey":"pk_10","orderId":"order-10","status":"ABORTED","totalAmount":100}"#,
            )
            .create_async()
            .await;

        let result = gateway(&server.url()).lookup_charge("order-10").await;
        assert!(matches!(result, ChargeResult::Declined(ref d) if d.code == "ABORTED"));
    }

    #[tokio::test]
    async fn test_issue_billing_key() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/billing/authorizations/issue")
            .match_header("authorization", AUTH_HEADER)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"billingKey":"bk_new","customerKey":"cus_1",
                    "card":{"issuerCode":"61","number":"4330****1234","cardType":"CREDIT"}}"#,
            )
            .create_async()
            .await;

        let issued = gateway(&server.url())
            .issue_billing_key("auth_1", "cus_1")
            .await
            .unwrap();
        assert_eq!(issued.billing_key, "bk_new");
        assert_eq!(issued.card.masked_number.as_deref(), Some("4330****1234"));
    }

    #[tokio::test]
    async fn test_issue_billing_key_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/billing/authorizations/issue")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":"INVALID_AUTH_KEY","message":"bad auth key"}"#)
            .create_async()
            .await;

        let err = gateway(&server.url())
            .issue_billing_key("auth_bad", "cus_1")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::GatewayDeclined { ref code, .. } if code == "INVALID_AUTH_KEY"));
    }

    #[test]
    fn test_translate_cancelled_payment() {
        let result = translate_payment(WirePayment {
            payment_key: "pk".to_string(),
            order_id: "o".to_string(),
            status: "ABORTED".to_string(),
            total_amount: 100,
            approved_at: None,
            method: None,
        });
        assert!(matches!(result, ChargeResult::Declined(ref d) if d.code == "ABORTED"));
    }
}
