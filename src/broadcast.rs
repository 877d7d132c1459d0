//! Cross-tab propagation of freshly fetched menu state.
//!
//! Every engine instance ("tab") sharing a [`CrossTabChannel`] hears about
//! the others' successful fetches without waiting for its own poll. The
//! channel is an optimization only; polling stays the consistency path.

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::bus::{MessageBus, Subscription};
use crate::models::{Category, Logo, Product};

/// Partial menu update. Absent fields are left untouched by receivers;
/// `logo: Some(None)` means "there is no logo".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuBroadcast {
    pub origin: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<Category>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub products: Option<Vec<Product>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_field"
    )]
    pub logo: Option<Option<Logo>>,
}

/// Distinguish an explicit `null` (Some(None)) from a missing field (None).
fn present_field<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl MenuBroadcast {
    pub fn full(
        origin: Uuid,
        categories: Vec<Category>,
        products: Vec<Product>,
        logo: Option<Logo>,
    ) -> Self {
        Self {
            origin,
            categories: Some(categories),
            products: Some(products),
            logo: Some(logo),
        }
    }
}

#[derive(Clone, Default)]
pub struct CrossTabChannel {
    bus: MessageBus<MenuBroadcast>,
}

impl CrossTabChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire-and-forget publish of a full menu state.
    pub fn publish(
        &self,
        origin: Uuid,
        categories: &[Category],
        products: &[Product],
        logo: Option<&Logo>,
    ) {
        self.bus.publish(MenuBroadcast::full(
            origin,
            categories.to_vec(),
            products.to_vec(),
            logo.cloned(),
        ));
    }

    pub fn publish_message(&self, message: MenuBroadcast) -> usize {
        self.bus.publish(message)
    }

    /// Register `handler` for messages from other tabs. Messages published by
    /// `own_origin` are filtered out.
    pub fn on_message<F>(&self, own_origin: Uuid, mut handler: F) -> Subscription
    where
        F: FnMut(MenuBroadcast) + Send + 'static,
    {
        self.bus.subscribe(move |message| {
            if message.origin != own_origin {
                handler(message);
            }
        })
    }
}
