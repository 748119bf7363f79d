//! Mirrored server entities kept in the local store.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// Collections of mirrored entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
  Products,
  Orders,
  StoreProfile,
}

impl Collection {
  pub(crate) fn table(self) -> &'static str {
    match self {
      Self::Products => "products",
      Self::Orders => "orders",
      Self::StoreProfile => "store_profile",
    }
  }
}

/// Trait for entities mirrored in the local store.
///
/// Implementors provide their primary key, the owning store id and an
/// optional secondary index value (category for products, status for orders).
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  const COLLECTION: Collection;

  fn primary_key(&self) -> &str;

  fn owner_id(&self) -> &str;

  fn index_value(&self) -> Option<&str>;
}

fn default_true() -> bool {
  true
}

/// A catalogue product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
  pub product_id: String,
  pub store_id: String,
  pub name: String,
  #[serde(default)]
  pub description: Option<String>,
  pub price: f64,
  #[serde(default)]
  pub stock: i64,
  #[serde(default)]
  pub images: Vec<String>,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(default = "default_true")]
  pub is_active: bool,
  /// Server fields this client does not model
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// A customer order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
  pub order_id: String,
  pub store_id: String,
  pub customer_name: String,
  pub customer_phone: String,
  #[serde(default)]
  pub customer_email: Option<String>,
  #[serde(default)]
  pub items: Vec<Value>,
  pub total_amount: f64,
  pub status: String,
  #[serde(default)]
  pub payment_status: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// The retailer's own store profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreProfile {
  pub store_id: String,
  pub user_id: String,
  pub store_name: String,
  pub subdomain: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub logo_url: Option<String>,
  #[serde(default)]
  pub language: Option<String>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl Record for Product {
  const COLLECTION: Collection = Collection::Products;

  fn primary_key(&self) -> &str {
    &self.product_id
  }

  fn owner_id(&self) -> &str {
    &self.store_id
  }

  fn index_value(&self) -> Option<&str> {
    self.category.as_deref()
  }
}

impl Record for Order {
  const COLLECTION: Collection = Collection::Orders;

  fn primary_key(&self) -> &str {
    &self.order_id
  }

  fn owner_id(&self) -> &str {
    &self.store_id
  }

  fn index_value(&self) -> Option<&str> {
    Some(&self.status)
  }
}

impl Record for StoreProfile {
  const COLLECTION: Collection = Collection::StoreProfile;

  fn primary_key(&self) -> &str {
    &self.store_id
  }

  fn owner_id(&self) -> &str {
    // A profile owns itself
    &self.store_id
  }

  fn index_value(&self) -> Option<&str> {
    None
  }
}
