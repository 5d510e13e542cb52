use std::collections::HashMap;

use actix_web::HttpMessage;
use serde_json::Value;

/// Request-scoped metadata carried through extensions so that metrics and
/// Sentry events emitted later in the request lifecycle can pick it up.
pub trait Taggable {
    /// Adds a tag. Tags **must** have low cardinality: they end up on
    /// metrics, and the metrics backend indexes every distinct value.
    fn add_tag(&self, key: String, value: String);

    fn get_tags(&self) -> HashMap<String, String>;

    /// Adds an extra: high-cardinality metadata included only with Sentry
    /// events, never with metrics.
    fn add_extra(&self, key: String, value: String);

    fn get_extras(&self) -> HashMap<String, Value>;
}

impl<T> Taggable for T
where
    T: HttpMessage,
{
    fn add_tag(&self, key: String, value: String) {
        let mut exts = self.extensions_mut();
        match exts.get_mut::<Tags>() {
            Some(tags) => {
                tags.0.insert(key, value);
            }
            None => {
                let mut tags = Tags::default();
                tags.0.insert(key, value);
                exts.insert(tags);
            }
        }
    }

    fn get_tags(&self) -> HashMap<String, String> {
        self.extensions()
            .get::<Tags>()
            .map(|tags| tags.0.clone())
            .unwrap_or_default()
    }

    fn add_extra(&self, key: String, value: String) {
        let mut exts = self.extensions_mut();
        match exts.get_mut::<Extras>() {
            Some(extras) => {
                extras.0.insert(key, value);
            }
            None => {
                let mut extras = Extras::default();
                extras.0.insert(key, value);
                exts.insert(extras);
            }
        }
    }

    fn get_extras(&self) -> HashMap<String, Value> {
        self.extensions()
            .get::<Extras>()
            .map(|extras| {
                extras
                    .0
                    .clone()
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Default)]
struct Tags(HashMap<String, String>);

#[derive(Default)]
struct Extras(HashMap<String, String>);
