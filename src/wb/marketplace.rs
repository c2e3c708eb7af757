use crate::http::{build_client, ensure_success};
use crate::models::Order;
use crate::ports::{OrderSource, SupplyRegistrar, UpstreamError};
use crate::wb::config::MARKETPLACE_ROOT;
use async_trait::async_trait;
use reqwest::{Client, header::AUTHORIZATION};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

/// Marketplace (FBS) API: new orders and supplies.
#[derive(Debug, Clone)]
pub struct WbMarketplaceClient {
    base_url: String,
    token: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct OrdersEnvelope {
    #[serde(default)]
    orders: Vec<WbOrder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WbOrder {
    id: u64,
    nm_id: u64,
    #[serde(default)]
    quantity: Option<u32>,
    #[serde(default)]
    offer_name: Option<String>,
    #[serde(default)]
    article: Option<String>,
    #[serde(default)]
    vendor_code: Option<String>,
    #[serde(default)]
    color_code: Option<String>,
}

impl From<WbOrder> for Order {
    fn from(raw: WbOrder) -> Self {
        Order {
            order_id: raw.id,
            product_id: raw.nm_id,
            quantity: raw.quantity.filter(|q| *q > 0).unwrap_or(1),
            raw_offer_name: raw.offer_name,
            raw_vendor_code: raw.article.or(raw.vendor_code),
            raw_color_code: raw.color_code,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SupplyCreated {
    #[serde(default, alias = "supplyId", alias = "supplyID")]
    id: Option<String>,
}

impl WbMarketplaceClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base_url(token, MARKETPLACE_ROOT.as_str())
    }

    pub fn with_base_url(token: impl Into<String>, base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            http: build_client(),
        }
    }
}

#[async_trait]
impl OrderSource for WbMarketplaceClient {
    async fn fetch_new_orders(&self) -> Result<Vec<Order>, UpstreamError> {
        let url = format!("{}/api/v3/orders/new", self.base_url);
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, &self.token)
            .send()
            .await
            .map_err(|err| UpstreamError::Request(err.to_string()))?;
        let body = ensure_success(response)
            .await?
            .text()
            .await
            .map_err(|err| UpstreamError::Request(err.to_string()))?;
        let orders = parse_orders(&body)?;
        debug!(target = "supply.wb", count = orders.len(), "fetched new orders");
        Ok(orders)
    }
}

#[async_trait]
impl SupplyRegistrar for WbMarketplaceClient {
    async fn create_supply(&self, name: &str) -> Result<String, UpstreamError> {
        let url = format!("{}/api/v3/supplies", self.base_url);
        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, &self.token)
            .json(&json!({ "name": name }))
            .send()
            .await
            .map_err(|err| UpstreamError::Request(err.to_string()))?;
        let body = ensure_success(response)
            .await?
            .text()
            .await
            .map_err(|err| UpstreamError::Request(err.to_string()))?;
        let supply_id = parse_supply_id(&body)?;
        info!(target = "supply.wb", %name, %supply_id, "supply created");
        Ok(supply_id)
    }

    async fn attach_orders(&self, supply_id: &str, order_ids: &[u64]) -> Result<(), UpstreamError> {
        let url = format!(
            "{}/api/marketplace/v3/supplies/{}/orders",
            self.base_url,
            urlencoding::encode(supply_id)
        );
        let response = self
            .http
            .patch(url)
            .header(AUTHORIZATION, &self.token)
            .json(&json!({ "orders": order_ids }))
            .send()
            .await
            .map_err(|err| UpstreamError::Request(err.to_string()))?;
        ensure_success(response).await?;
        debug!(target = "supply.wb", %supply_id, count = order_ids.len(), "orders attached");
        Ok(())
    }
}

fn parse_orders(body: &str) -> Result<Vec<Order>, UpstreamError> {
    let envelope: OrdersEnvelope =
        serde_json::from_str(body).map_err(|err| UpstreamError::Deserialize(err.to_string()))?;
    Ok(envelope.orders.into_iter().map(Order::from).collect())
}

/// A missing id is returned as an empty string; the caller decides whether
/// that is fatal.
fn parse_supply_id(body: &str) -> Result<String, UpstreamError> {
    let created: SupplyCreated =
        serde_json::from_str(body).map_err(|err| UpstreamError::Deserialize(err.to_string()))?;
    Ok(created.id.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_map_marketplace_fields() {
        let body = r#"{"next":0,"orders":[
            {"id":1,"nmId":111,"quantity":2,"offerName":"Samsung A25 Black","colorCode":"черный"},
            {"id":2,"nmId":222,"article":"RDM-12-BL"},
            {"id":3,"nmId":333,"quantity":0,"vendorCode":"VC-3"}
        ]}"#;

        let orders = parse_orders(body).unwrap();

        assert_eq!(orders.len(), 3);
        assert_eq!(orders[0].product_id, 111);
        assert_eq!(orders[0].quantity, 2);
        assert_eq!(orders[0].raw_offer_name.as_deref(), Some("Samsung A25 Black"));
        assert_eq!(orders[0].raw_color_code.as_deref(), Some("черный"));
        assert_eq!(orders[1].quantity, 1);
        assert_eq!(orders[1].raw_vendor_code.as_deref(), Some("RDM-12-BL"));
        assert_eq!(orders[2].quantity, 1);
        assert_eq!(orders[2].raw_vendor_code.as_deref(), Some("VC-3"));
    }

    #[test]
    fn missing_orders_field_means_no_orders() {
        assert!(parse_orders("{}").unwrap().is_empty());
        assert!(matches!(
            parse_orders("not json"),
            Err(UpstreamError::Deserialize(_))
        ));
    }

    #[test]
    fn supply_id_accepts_known_aliases() {
        assert_eq!(parse_supply_id(r#"{"id":"WB-GI-1"}"#).unwrap(), "WB-GI-1");
        assert_eq!(parse_supply_id(r#"{"supplyId":"WB-GI-2"}"#).unwrap(), "WB-GI-2");
        assert_eq!(parse_supply_id("{}").unwrap(), "");
    }
}
