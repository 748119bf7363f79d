//! Mapping of queued actions onto the REST calls they stand for.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::Value;
use url::Url;

use crate::http::Request;
use crate::store::{ActionKind, PendingAction};

/// Builds the API request for a deferred mutation.
#[derive(Debug, Clone)]
pub struct Replayer {
  /// Base of the REST namespace, ending in a slash
  api_base: Url,
  session_token: Option<String>,
}

impl Replayer {
  pub fn new(api_base: Url, session_token: Option<String>) -> Self {
    Self {
      api_base,
      session_token,
    }
  }

  pub fn request_for_action(&self, action: &PendingAction) -> Result<Request> {
    self.request_for(action.action, &action.payload)
  }

  pub fn request_for(&self, kind: ActionKind, payload: &Value) -> Result<Request> {
    let request = match kind {
      ActionKind::CreateProduct => {
        Request::new(Method::POST, self.endpoint(&["products"])?).with_json(payload)?
      }
      ActionKind::UpdateProduct => {
        let id = required_id(payload, "product_id")?;
        Request::new(Method::PATCH, self.endpoint(&["products", id])?)
          .with_json(&without(payload, "product_id"))?
      }
      ActionKind::DeleteProduct => {
        let id = required_id(payload, "product_id")?;
        Request::new(Method::DELETE, self.endpoint(&["products", id])?)
      }
      ActionKind::UpdateOrderStatus => {
        let id = required_id(payload, "order_id")?;
        let status = required_str(payload, "status")?;
        let mut url = self.endpoint(&["orders", id])?;
        url.query_pairs_mut().append_pair("status", status);
        Request::new(Method::PATCH, url)
      }
      ActionKind::UpdateStore => {
        let id = required_id(payload, "store_id")?;
        Request::new(Method::PATCH, self.endpoint(&["stores", id])?)
          .with_json(&without(payload, "store_id"))?
      }
      ActionKind::SendMessage => {
        Request::new(Method::POST, self.endpoint(&["chat", "send"])?).with_json(payload)?
      }
    };

    Ok(match &self.session_token {
      Some(token) => request.with_header("Authorization", &format!("Bearer {}", token)),
      None => request,
    })
  }

  /// Append `segments` to the API base. Each segment is percent-encoded
  /// whole, so ids can never add path components, a query or a fragment.
  fn endpoint(&self, segments: &[&str]) -> Result<Url> {
    let mut url = self.api_base.clone();
    url
      .path_segments_mut()
      .map_err(|_| eyre!("API base {} cannot carry a path", self.api_base))?
      .pop_if_empty()
      .extend(segments);
    Ok(url)
  }
}

fn required_str<'a>(payload: &'a Value, field: &str) -> Result<&'a str> {
  payload
    .get(field)
    .and_then(Value::as_str)
    .filter(|value| !value.is_empty())
    .ok_or_else(|| eyre!("Payload is missing '{}'", field))
}

/// A required id destined for a single path segment.
fn required_id<'a>(payload: &'a Value, field: &str) -> Result<&'a str> {
  let id = required_str(payload, field)?;
  // The URL builder drops dot segments instead of encoding them
  if id == "." || id == ".." {
    return Err(eyre!("Payload has an invalid '{}': {}", field, id));
  }
  Ok(id)
}

fn without(payload: &Value, field: &str) -> Value {
  let mut payload = payload.clone();
  if let Some(object) = payload.as_object_mut() {
    object.remove(field);
  }
  payload
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn replayer(token: Option<&str>) -> Replayer {
    Replayer::new(
      Url::parse("https://shop.test/api/").unwrap(),
      token.map(String::from),
    )
  }

  fn body(request: &Request) -> Value {
    serde_json::from_slice(request.body.as_ref().unwrap()).unwrap()
  }

  #[test]
  fn test_create_product_posts_payload() {
    let payload = json!({"name": "Chai", "price": 20.0, "store_id": "s1"});
    let request = replayer(None)
      .request_for(ActionKind::CreateProduct, &payload)
      .unwrap();

    assert_eq!(request.method, Method::POST);
    assert_eq!(request.url.as_str(), "https://shop.test/api/products");
    assert_eq!(body(&request), payload);
  }

  #[test]
  fn test_update_product_strips_id_from_body() {
    let request = replayer(None)
      .request_for(
        ActionKind::UpdateProduct,
        &json!({"product_id": "prod_1", "price": 25.0}),
      )
      .unwrap();

    assert_eq!(request.method, Method::PATCH);
    assert_eq!(request.url.path(), "/api/products/prod_1");
    assert_eq!(body(&request), json!({"price": 25.0}));
  }

  #[test]
  fn test_order_status_goes_in_query() {
    let request = replayer(Some("tok"))
      .request_for(
        ActionKind::UpdateOrderStatus,
        &json!({"order_id": "order_9", "status": "shipped"}),
      )
      .unwrap();

    assert_eq!(
      request.url.as_str(),
      "https://shop.test/api/orders/order_9?status=shipped"
    );
    assert!(request.body.is_none());
    assert!(request
      .headers
      .contains(&("Authorization".to_string(), "Bearer tok".to_string())));
  }

  #[test]
  fn test_remaining_routes() {
    let r = replayer(None);
    let delete = r
      .request_for(ActionKind::DeleteProduct, &json!({"product_id": "p"}))
      .unwrap();
    assert_eq!(delete.method, Method::DELETE);
    assert_eq!(delete.url.path(), "/api/products/p");

    let store = r
      .request_for(
        ActionKind::UpdateStore,
        &json!({"store_id": "s1", "phone": "123"}),
      )
      .unwrap();
    assert_eq!(store.url.path(), "/api/stores/s1");
    assert_eq!(body(&store), json!({"phone": "123"}));

    let message = r
      .request_for(ActionKind::SendMessage, &json!({"store_id": "s1", "message": "hi"}))
      .unwrap();
    assert_eq!(message.url.path(), "/api/chat/send");
  }

  #[test]
  fn test_ids_stay_inside_their_segment() {
    let r = replayer(None);

    let delete = r
      .request_for(ActionKind::DeleteProduct, &json!({"product_id": "../stores/s1"}))
      .unwrap();
    assert_eq!(delete.url.path(), "/api/products/..%2Fstores%2Fs1");

    let order = r
      .request_for(
        ActionKind::UpdateOrderStatus,
        &json!({"order_id": "o1?status=cancelled#", "status": "shipped"}),
      )
      .unwrap();
    assert_eq!(order.url.path(), "/api/orders/o1%3Fstatus=cancelled%23");
    assert_eq!(order.url.query(), Some("status=shipped"));
    assert_eq!(order.url.fragment(), None);

    for id in [".", ".."] {
      assert!(r
        .request_for(ActionKind::UpdateStore, &json!({"store_id": id}))
        .is_err());
    }
  }

  #[test]
  fn test_missing_id_is_an_error() {
    assert!(replayer(None)
      .request_for(ActionKind::DeleteProduct, &json!({}))
      .is_err());
  }
}
