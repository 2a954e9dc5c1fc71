mod common;

use common::{link, link_with, Cue, Deck};
use encore_core::RemotingMode;
use encore_remote::remote_lock::{is_pending, waiter_count};
use encore_remote::{
    publish_data, receive_data, remote_release, remote_wait, Cancellation, ConversionError,
    ConverterRegistry, MessageHandler, RemoteError, RemoteMethodProxy, RemoteOptions,
};
use serde_json::{json, Value};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

/// Accepts cues written as `"title@position"` as well as full objects.
fn cue_converter(value: Value) -> Result<Value, ConversionError> {
    let Value::String(text) = &value else {
        return Ok(value);
    };
    let (title, position) = text.split_once('@').ok_or_else(|| ConversionError::Invalid {
        expected: "Cue".into(),
        value: text.clone(),
        reason: "missing '@'".into(),
    })?;
    let position: u32 = position.parse().map_err(|_| ConversionError::Invalid {
        expected: "Cue".into(),
        value: text.clone(),
        reason: "position is not a number".into(),
    })?;
    Ok(json!({ "title": title, "position": position }))
}

#[tokio::test]
async fn primitive_data_round_trips() {
    let pair = link("data-primitive", RemotingMode::FULL, RemotingMode::FULL).await;

    let pending = receive_data::<Deck, u32>(&pair.client, "track-count", None);
    let published = publish_data(&pair.host, 12u32, "track-count", None).await.unwrap();

    assert_eq!(published, 12);
    assert_eq!(tokio::time::timeout(WAIT, pending).await.unwrap().unwrap(), 12);
}

#[tokio::test]
async fn data_payloads_are_reconciled() {
    let pair = link("data-coerce", RemotingMode::FULL, RemotingMode::FULL).await;

    let pending = receive_data::<Deck, u32>(&pair.client, "position", None);
    publish_data(&pair.host, "42".to_string(), "position", None)
        .await
        .unwrap();

    assert_eq!(tokio::time::timeout(WAIT, pending).await.unwrap().unwrap(), 42);
}

#[tokio::test]
async fn custom_data_round_trips() {
    let pair = link("data-custom", RemotingMode::FULL, RemotingMode::FULL).await;
    let cue = Cue {
        title: "Intro".into(),
        position: 90,
    };

    let pending = receive_data::<Deck, Cue>(&pair.client, "cue", None);
    let published = publish_data(&pair.host, cue.clone(), "cue", None).await.unwrap();

    assert_eq!(published, cue);
    assert_eq!(tokio::time::timeout(WAIT, pending).await.unwrap().unwrap(), cue);
}

#[tokio::test]
async fn custom_converter_shapes_payloads() {
    let converters = ConverterRegistry::new().with("Cue", cue_converter);
    let pair = link_with(
        "data-converter",
        "data-converter",
        RemotingMode::FULL,
        RemotingMode::FULL,
        RemoteOptions::default().with_converters(converters),
    )
    .await;

    let pending = receive_data::<Deck, Cue>(&pair.client, "cue", None);
    publish_data(&pair.host, "Outro@12".to_string(), "cue", None)
        .await
        .unwrap();

    let cue = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(
        cue,
        Cue {
            title: "Outro".into(),
            position: 12
        }
    );
}

#[tokio::test]
async fn structured_payloads_do_not_coerce_to_primitives() {
    let pair = link("data-unsupported", RemotingMode::FULL, RemotingMode::FULL).await;
    let cue = Cue {
        title: "Intro".into(),
        position: 1,
    };

    let pending = receive_data::<Deck, u32>(&pair.client, "flags", None);
    publish_data(&pair.host, cue, "flags", None).await.unwrap();

    let result = tokio::time::timeout(WAIT, pending).await.unwrap();
    assert!(matches!(
        result,
        Err(RemoteError::Conversion(ConversionError::Unsupported { .. }))
    ));
}

#[tokio::test]
async fn data_waits_for_its_own_token() {
    let pair = link("data-token", RemotingMode::FULL, RemotingMode::FULL).await;

    let pending = receive_data::<Deck, u32>(&pair.client, "mine", None);
    publish_data(&pair.host, 1u32, "theirs", None).await.unwrap();

    assert!(tokio::time::timeout(Duration::from_millis(100), pending)
        .await
        .is_err());
}

#[tokio::test]
async fn data_wait_can_be_cancelled() {
    let pair = link("data-cancel", RemotingMode::FULL, RemotingMode::FULL).await;
    let cancel = Cancellation::new();

    let pending = receive_data::<Deck, u32>(&pair.client, "never", Some(cancel.clone()));
    cancel.cancel();

    let result = tokio::time::timeout(WAIT, pending).await.unwrap();
    assert!(matches!(result, Err(RemoteError::Cancelled)));
}

#[tokio::test]
async fn linked_proxies_share_a_correlation_id() {
    let pair = link("proxy-ids", RemotingMode::FULL, RemotingMode::FULL).await;

    let host_first = RemoteMethodProxy::new("shuffle_seed", &pair.host).unwrap();
    let client_first = RemoteMethodProxy::new("shuffle_seed", &pair.client).unwrap();
    assert_eq!(host_first.correlation_id(), "proxy-ids.MethodCall.shuffle_seed.1");
    assert_eq!(host_first.correlation_id(), client_first.correlation_id());

    let host_second = RemoteMethodProxy::new("shuffle_seed", &pair.host).unwrap();
    assert_eq!(host_second.correlation_id(), "proxy-ids.MethodCall.shuffle_seed.2");
}

#[tokio::test]
async fn one_side_computes_the_other_receives() {
    let pair = link("proxy-share", RemotingMode::FULL, RemotingMode::FULL).await;
    let host_proxy = RemoteMethodProxy::new("shuffle_seed", &pair.host).unwrap();
    let client_proxy = RemoteMethodProxy::new("shuffle_seed", &pair.client).unwrap();

    let pending = client_proxy.receive_result::<u64>(None);
    let computed = host_proxy.publish_result(8_675_309u64, None).await.unwrap();

    assert_eq!(computed, 8_675_309);
    assert_eq!(
        tokio::time::timeout(WAIT, pending).await.unwrap().unwrap(),
        8_675_309
    );
}

#[tokio::test]
async fn proxies_refuse_more_than_two_participants() {
    let pair = link("proxy-limit", RemotingMode::FULL, RemotingMode::FULL).await;
    let third = pair.bus.handler(RemotingMode::CLIENT);
    third.ensure_connected().await.unwrap();

    let err = RemoteMethodProxy::new("shuffle_seed", &pair.host).unwrap_err();
    assert!(matches!(err, RemoteError::TooManyParticipants { participants: 3 }));
}

#[tokio::test]
async fn waiters_on_one_token_share_a_release() {
    let pair = link("lock-coalesce", RemotingMode::FULL, RemotingMode::FULL).await;

    let first = tokio::spawn(remote_wait(&pair.client, "next-track", None));
    let second = tokio::spawn(remote_wait(&pair.client, "next-track", None));
    assert_eq!(waiter_count(&pair.client, "next-track"), 2);

    remote_release(&pair.host, "next-track", None).await.unwrap();

    tokio::time::timeout(WAIT, first).await.unwrap().unwrap().unwrap();
    tokio::time::timeout(WAIT, second).await.unwrap().unwrap().unwrap();
    assert!(!is_pending(&pair.client, "next-track"));
}

#[tokio::test]
async fn release_for_another_token_does_not_resolve() {
    let pair = link("lock-token", RemotingMode::FULL, RemotingMode::FULL).await;

    let waiting = remote_wait(&pair.client, "a", None);
    remote_release(&pair.host, "b", None).await.unwrap();

    assert!(tokio::time::timeout(Duration::from_millis(100), waiting)
        .await
        .is_err());
}

#[tokio::test]
async fn cancelled_lock_wait_is_cleaned_up() {
    let pair = link("lock-cancel", RemotingMode::FULL, RemotingMode::FULL).await;
    let cancel = Cancellation::new();

    let waiting = remote_wait(&pair.client, "eject", Some(cancel.clone()));
    assert!(is_pending(&pair.client, "eject"));
    cancel.cancel();

    let result = tokio::time::timeout(WAIT, waiting).await.unwrap();
    assert!(matches!(result, Err(RemoteError::Cancelled)));
    common::eventually(|| !is_pending(&pair.client, "eject")).await;
}
