//! Proptest strategies for ferry domain types.

use ferry_core::{CorrelationRecord, Destination, HandlerId, Request};
use proptest::{collection, option, prelude::*};
use serde_json::{Map, Value};

/// Arbitrary JSON values of bounded depth and size.
pub fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 _.-]{0,24}".prop_map(Value::String),
    ];

    leaf.prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            collection::btree_map("[a-z_]{1,12}", inner, 0..6)
                .prop_map(|entries| Value::Object(entries.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

/// Arbitrary webhook requests, some with local metadata.
pub fn request() -> impl Strategy<Value = Request> {
    (
        "[a-z_]{1,20}",
        json_value(),
        option::of(collection::btree_map("[a-z_]{1,12}", json_value(), 0..4)),
    )
        .prop_map(|(kind, payload, metadata)| {
            let request = Request::new(kind, payload);
            match metadata {
                Some(metadata) => request.with_local_metadata(metadata.into_iter().collect()),
                None => request,
            }
        })
}

/// Shared secrets of varying length, including shorter and longer than a key.
pub fn secret() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9]{1,64}"
}

/// Destinations with and without a secret.
pub fn destination() -> impl Strategy<Value = Destination> {
    ("[a-z]{1,12}", "[a-z0-9]{8,32}", option::of(secret())).prop_map(|(id, hook, secret)| {
        let destination =
            Destination::new(id.as_str(), "https://example.com", format!("api/webhook/{hook}"));
        match secret {
            Some(secret) => destination.with_secret(secret),
            None => destination,
        }
    })
}

/// Handler ids, both built-in and custom.
pub fn handler_id() -> impl Strategy<Value = HandlerId> {
    prop_oneof![
        Just(HandlerId::UNHANDLED),
        Just(HandlerId::LOCATION_UPDATE),
        Just(HandlerId::SERVICE_CALL),
        "[a-z_]{1,16}".prop_map(HandlerId::new),
    ]
}

/// Correlation records built from the strategies above.
pub fn correlation_record() -> impl Strategy<Value = CorrelationRecord> {
    ("[a-z]{1,12}", request(), handler_id()).prop_map(|(server, request, identifier)| {
        CorrelationRecord { server: server.as_str().into(), request, identifier }
    })
}
